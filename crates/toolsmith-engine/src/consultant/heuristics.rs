//! Text classification used by the consultation loop. Everything here is a pure function.

use std::sync::LazyLock;

use regex::Regex;
use reqwest::Url;

use toolsmith_core::consultation::{AnalysisResult, ResearchFingerprint, SiteProbeReport};
use toolsmith_core::ToolRequest;

static URL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s"'<>()\[\]{}`]+"#).unwrap());

static API_PATH_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)/(api|v1|v2|rest)(/|\?|$)").unwrap());

const GENERIC_NAME_WORDS: &[&str] = &[
    "tool", "lookup", "calculator", "checker", "finder", "fetcher", "viewer", "tracker", "get", "api", "app",
];

const API_KEYWORDS: &[&str] = &[
    "api", "endpoint", "rest", "json", "webhook", "real-time", "realtime", "live", "current", "latest", "lookup",
    "fetch",
];

const API_DENIALS: &[&str] = &[
    "no public api",
    "no official api",
    "no documented api",
    "no api available",
    "does not offer an api",
    "doesn't offer an api",
    "does not provide an api",
    "doesn't provide an api",
    "does not have a public api",
    "doesn't have a public api",
    "there is no api",
];

const SCRAPING_KEYWORDS: &[&str] = &[
    "scrape", "scraping", "crawl", "parse html", "parse the html", "html parsing", "fetch the page",
    "from the website", "web page", "webpage",
];

const CAPTCHA_MARKERS: &[&str] = &["captcha", "recaptcha", "hcaptcha", "cf-challenge", "challenge-platform"];

const BOT_BLOCK_MARKERS: &[&str] = &[
    "access denied",
    "are you a robot",
    "unusual traffic",
    "bot detection",
    "please enable javascript and cookies",
    "request blocked",
    "attention required",
];

const CLIENT_RENDER_MARKERS: &[&str] = &["__next_data__", "window.__nuxt", "ng-app", "<div id=\"root\"></div>", "<div id=\"app\"></div>"];

/// Short service name from a tool name, e.g. `weather_lookup` becomes `weather`.
pub fn derive_service_name(tool_name: &str) -> String {
    let words: Vec<String> = tool_name
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();
    let meaningful: Vec<&str> = words
        .iter()
        .map(String::as_str)
        .filter(|w| !GENERIC_NAME_WORDS.contains(w))
        .collect();
    if meaningful.is_empty() {
        words.join(" ")
    } else {
        meaningful.join(" ")
    }
}

/// Canonical form of a user-supplied URL. Adds `https://` when no scheme is given,
/// drops fragments and trailing slashes. Rejects anything that is not http(s) with a host.
pub fn normalize_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_owned()
    } else {
        format!("https://{trimmed}")
    };
    let mut url = Url::parse(&candidate).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }
    url.set_fragment(None);
    let mut out = url.to_string();
    if url.query().is_none() && out.ends_with('/') {
        out.pop();
    }
    Some(out)
}

/// Whether an endpoint is an absolute http(s) URL with a host.
pub fn is_valid_endpoint(endpoint: Option<&str>) -> bool {
    endpoint
        .and_then(|e| Url::parse(e.trim()).ok())
        .is_some_and(|url| matches!(url.scheme(), "http" | "https") && url.host_str().is_some())
}

pub fn fingerprint(request: &ToolRequest) -> ResearchFingerprint {
    ResearchFingerprint {
        name: request.name.clone(),
        description: request.description.clone(),
        service_name: derive_service_name(&request.name),
        target_url: request.target_url.as_deref().and_then(normalize_url),
    }
}

fn urls(text: &str) -> impl Iterator<Item = &str> {
    URL_PATTERN
        .find_iter(text)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?']))
}

pub fn extract_first_url(text: &str) -> Option<String> {
    urls(text).next().map(str::to_owned)
}

/// First URL whose path has an `/api`, `/v1`, `/v2` or `/rest` segment, else the first URL.
pub fn extract_api_endpoint(text: &str) -> Option<String> {
    urls(text)
        .find(|u| {
            Url::parse(u)
                .map(|url| API_PATH_PATTERN.is_match(url.path()))
                .unwrap_or(false)
        })
        .or_else(|| urls(text).next())
        .map(str::to_owned)
}

/// Classify the body of a probed page.
pub fn classify_probe_response(status: u16, body: &str) -> SiteProbeReport {
    let lower = body.to_lowercase();

    let block_reason = if CAPTCHA_MARKERS.iter().any(|m| lower.contains(m)) {
        Some("captcha challenge".to_owned())
    } else if BOT_BLOCK_MARKERS.iter().any(|m| lower.contains(m)) {
        Some("bot protection page".to_owned())
    } else if matches!(status, 403 | 429) {
        Some(format!("HTTP {status}"))
    } else if status == 503 && lower.contains("cloudflare") {
        Some("cloudflare interstitial".to_owned())
    } else {
        None
    };

    let auth_detected = lower.contains("type=\"password\"")
        || lower.contains("type='password'")
        || (lower.contains("<form") && (lower.contains("sign in") || lower.contains("log in")));

    let method_hint = if block_reason.is_some() {
        "headless browser with proxy rotation"
    } else if CLIENT_RENDER_MARKERS.iter().any(|m| lower.contains(m)) {
        "headless browser (client-rendered page)"
    } else {
        "static HTML fetch"
    };

    SiteProbeReport {
        is_likely_blocked: block_reason.is_some(),
        block_reason,
        auth_detected,
        method_hint: Some(method_hint.to_owned()),
        status: Some(status),
    }
}

fn contains_keyword(text: &str, keywords: &[&str]) -> bool {
    let lower = text.to_lowercase();
    keywords.iter().any(|k| {
        lower.match_indices(k).any(|(idx, _)| {
            let before = lower[..idx].chars().next_back();
            let after = lower[idx + k.len()..].chars().next();
            !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
        })
    })
}

pub fn looks_api_related(request: &ToolRequest) -> bool {
    [&request.name, &request.description, &request.purpose]
        .iter()
        .any(|text| contains_keyword(&text.replace('_', " "), API_KEYWORDS))
}

pub fn findings_deny_api(findings: &str) -> bool {
    let lower = findings.to_lowercase();
    API_DENIALS.iter().any(|d| lower.contains(d))
}

/// Whether a "function" strategy actually depends on fetching web pages.
pub fn implies_hidden_scraping(strategy: &str) -> bool {
    let lower = strategy.to_lowercase();
    SCRAPING_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Whether every required input is mentioned by the strategy text.
pub fn params_covered(request: &ToolRequest, strategy: &str) -> bool {
    let lower = strategy.to_lowercase();
    request.inputs.iter().filter(|i| i.required).all(|input| {
        let name = input.name.to_lowercase();
        lower.contains(&name) || lower.contains(&name.replace('_', " "))
    })
}

/// HTTP statuses that count as a reachable API endpoint.
pub fn classify_api_status(status: u16) -> bool {
    matches!(status, 200 | 401 | 403)
}

/// URL a scraping strategy should fetch: the suggested domain, then the request's
/// reference URL, then any URL in the strategy text.
pub fn scraping_target(analysis: &AnalysisResult, request: &ToolRequest) -> Option<String> {
    analysis
        .target_domain
        .as_deref()
        .and_then(normalize_url)
        .or_else(|| request.target_url.as_deref().and_then(normalize_url))
        .or_else(|| extract_first_url(&analysis.strategy_details))
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolsmith_core::consultation::RecommendedType;
    use toolsmith_core::context::InputParameter;

    fn input(name: &str) -> InputParameter {
        InputParameter { name: name.into(), param_type: "string".into(), description: String::new(), required: true }
    }

    #[test]
    fn service_name_drops_generic_words() {
        assert_eq!(derive_service_name("weather_lookup"), "weather");
        assert_eq!(derive_service_name("GitHub Stars Tracker"), "github stars");
        assert_eq!(derive_service_name("tool"), "tool");
    }

    #[test]
    fn url_normalization() {
        assert_eq!(normalize_url("example.com/").as_deref(), Some("https://example.com"));
        assert_eq!(normalize_url(" https://Example.com/path/#top ").as_deref(), Some("https://example.com/path"));
        assert_eq!(normalize_url("http://a.io/q?x=1").as_deref(), Some("http://a.io/q?x=1"));
        assert_eq!(normalize_url("ftp://files.example.com"), None);
        assert_eq!(normalize_url(""), None);
    }

    #[test]
    fn endpoint_validity() {
        assert!(is_valid_endpoint(Some("https://api.example.com/v1/items")));
        assert!(!is_valid_endpoint(Some("not-a-url")));
        assert!(!is_valid_endpoint(Some("/v1/items")));
        assert!(!is_valid_endpoint(Some("mailto:me@example.com")));
        assert!(!is_valid_endpoint(None));
    }

    #[test]
    fn fingerprint_uses_identifying_fields_only() {
        let mut a = ToolRequest {
            name: "weather_lookup".into(),
            description: "Get current weather".into(),
            target_url: Some("weather.example.com".into()),
            ..Default::default()
        };
        let fp = fingerprint(&a);
        assert_eq!(fp.service_name, "weather");
        assert_eq!(fp.target_url.as_deref(), Some("https://weather.example.com"));

        a.inputs.push(input("city"));
        a.expected_output = "temperature".into();
        assert_eq!(fingerprint(&a), fp);

        a.description = "Get tomorrow's weather".into();
        assert_ne!(fingerprint(&a), fp);
    }

    #[test]
    fn api_endpoint_prefers_versioned_paths() {
        let text = "Docs at https://example.com/docs. Call https://example.com/v2/forecast?city=x, or see https://example.com/help.";
        assert_eq!(extract_api_endpoint(text).as_deref(), Some("https://example.com/v2/forecast?city=x"));

        let text = "See https://example.com/docs and https://data.example.com/rest";
        assert_eq!(extract_api_endpoint(text).as_deref(), Some("https://data.example.com/rest"));

        let text = "Only https://example.com/about is mentioned.";
        assert_eq!(extract_api_endpoint(text).as_deref(), Some("https://example.com/about"));

        assert_eq!(extract_api_endpoint("no links here"), None);
    }

    #[test]
    fn api_segment_must_be_whole() {
        let text = "https://example.com/apiary then https://example.com/api/items";
        assert_eq!(extract_api_endpoint(text).as_deref(), Some("https://example.com/api/items"));
    }

    #[test]
    fn probe_detects_captcha_and_login() {
        let report = classify_probe_response(200, "<html><div class='g-recaptcha'></div></html>");
        assert!(report.is_likely_blocked);
        assert_eq!(report.block_reason.as_deref(), Some("captcha challenge"));

        let report = classify_probe_response(200, "<form><input type=\"password\" name=\"pw\"></form>");
        assert!(!report.is_likely_blocked);
        assert!(report.auth_detected);

        let report = classify_probe_response(403, "Forbidden");
        assert!(report.is_likely_blocked);
        assert_eq!(report.method_hint.as_deref(), Some("headless browser with proxy rotation"));
    }

    #[test]
    fn probe_hints_client_rendering() {
        let report = classify_probe_response(200, "<body><div id=\"root\"></div><script src=app.js></script></body>");
        assert!(!report.is_likely_blocked);
        assert_eq!(report.method_hint.as_deref(), Some("headless browser (client-rendered page)"));

        let report = classify_probe_response(200, "<table><tr><td>42</td></tr></table>");
        assert_eq!(report.method_hint.as_deref(), Some("static HTML fetch"));
    }

    #[test]
    fn api_keywords_match_whole_words() {
        let weather = ToolRequest {
            name: "weather_lookup".into(),
            description: "Get current weather for a city".into(),
            ..Default::default()
        };
        assert!(looks_api_related(&weather));

        let tip = ToolRequest {
            name: "tip_calculator".into(),
            description: "Split a restaurant bill between friends".into(),
            ..Default::default()
        };
        assert!(!looks_api_related(&tip));
    }

    #[test]
    fn api_denial_phrases() {
        assert!(findings_deny_api("The site has No public API; data is only on HTML pages."));
        assert!(!findings_deny_api("A REST API is documented at /v1."));
    }

    #[test]
    fn hidden_scraping_keywords() {
        assert!(implies_hidden_scraping("Fetch the page and parse HTML tables"));
        assert!(!implies_hidden_scraping("Multiply the bill by the tip percentage"));
    }

    #[test]
    fn required_params_must_appear() {
        let request = ToolRequest {
            inputs: vec![input("city"), input("country_code"), InputParameter { required: false, ..input("units") }],
            ..Default::default()
        };
        assert!(params_covered(&request, "Pass city and country code as query parameters"));
        assert!(!params_covered(&request, "Pass the city as a query parameter"));
        assert!(params_covered(&ToolRequest::default(), "anything"));
    }

    #[test]
    fn reachable_api_statuses() {
        assert!(classify_api_status(200));
        assert!(classify_api_status(401));
        assert!(classify_api_status(403));
        assert!(!classify_api_status(404));
        assert!(!classify_api_status(500));
    }

    #[test]
    fn scraping_target_precedence() {
        let mut analysis = AnalysisResult::error("x");
        analysis.recommended_type = RecommendedType::Scraping;
        analysis.strategy_details = "Scrape https://fallback.example.com/list".into();
        let mut request = ToolRequest { target_url: Some("ref.example.com".into()), ..Default::default() };

        analysis.target_domain = Some("shop.example.com".into());
        assert_eq!(scraping_target(&analysis, &request).as_deref(), Some("https://shop.example.com"));

        analysis.target_domain = None;
        assert_eq!(scraping_target(&analysis, &request).as_deref(), Some("https://ref.example.com"));

        request.target_url = None;
        assert_eq!(scraping_target(&analysis, &request).as_deref(), Some("https://fallback.example.com/list"));

        analysis.strategy_details = "Scrape the site".into();
        assert_eq!(scraping_target(&analysis, &request), None);
    }
}
