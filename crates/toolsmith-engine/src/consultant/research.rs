use std::sync::Arc;

use tracing::{debug, warn};

use toolsmith_core::consultation::ResearchDepth;
use toolsmith_core::provider::ResearchProvider;
use toolsmith_core::ToolRequest;

use super::heuristics::{derive_service_name, extract_api_endpoint, findings_deny_api, looks_api_related, normalize_url};
use super::probe::SiteProbe;

/// Prefix of any findings section that records a failed lookup.
pub const RESEARCH_ERROR_MARKER: &str = "[research error]";

/// What research produced for one attempt.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Findings {
    /// Query answers. This is the part stored and reused across rounds.
    pub text: String,
    /// Summary of the site probe, refreshed every attempt.
    pub probe: Option<String>,
    /// A research query failed.
    pub errored: bool,
    /// Endpoint pulled out of the targeted query, when one ran.
    pub candidate_endpoint: Option<String>,
}

impl Findings {
    /// Text handed to the analysis prompt.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(probe) = &self.probe {
            out.push_str("## Site probe\n");
            out.push_str(probe);
            out.push_str("\n\n");
        }
        out.push_str(&self.text);
        out
    }
}

pub struct Researcher {
    provider: Arc<dyn ResearchProvider>,
    probe: Arc<dyn SiteProbe>,
    model_hint: Option<String>,
}

impl Researcher {
    pub fn new(provider: Arc<dyn ResearchProvider>, probe: Arc<dyn SiteProbe>, model_hint: Option<String>) -> Self {
        Self { provider, probe, model_hint }
    }

    pub async fn research(&self, request: &ToolRequest, depth: ResearchDepth) -> Findings {
        let service = derive_service_name(&request.name);
        let target = request.target_url.as_deref().and_then(normalize_url);
        let mut findings = Findings {
            probe: self.probe_target(request).await,
            ..Default::default()
        };

        let api_answer = self.ask(&mut findings, "API availability", &api_query(request, &service)).await;

        let api_denied = api_answer.as_deref().is_some_and(findings_deny_api);
        if api_denied || target.is_some() {
            let site = target.as_deref().unwrap_or(&service);
            self.ask(&mut findings, "Scraping difficulty", &scraping_query(request, site)).await;
        }

        if depth == ResearchDepth::Deep && (looks_api_related(request) || !api_denied) {
            if let Some(answer) = self.ask(&mut findings, "Endpoint search", &endpoint_query(request, &service)).await {
                findings.candidate_endpoint = extract_api_endpoint(&answer);
                debug!(candidate = ?findings.candidate_endpoint, "targeted endpoint search finished");
            }
        }
        findings
    }

    /// Earlier findings verbatim, with a fresh probe.
    pub async fn reuse(&self, request: &ToolRequest, previous: &str) -> Findings {
        Findings {
            text: previous.to_owned(),
            probe: self.probe_target(request).await,
            errored: false,
            candidate_endpoint: None,
        }
    }

    async fn probe_target(&self, request: &ToolRequest) -> Option<String> {
        let url = request.target_url.as_deref().and_then(normalize_url)?;
        match self.probe.check(&url).await {
            Ok(report) => Some(report.summary(&url)),
            Err(e) => {
                warn!(url = %url, error = %e, "site probe failed");
                Some(format!("{RESEARCH_ERROR_MARKER} site probe for {url} failed: {e}"))
            }
        }
    }

    /// Run one query and append its section. A failure is recorded in the text.
    async fn ask(&self, findings: &mut Findings, title: &str, prompt: &str) -> Option<String> {
        if !findings.text.is_empty() {
            findings.text.push_str("\n\n");
        }
        findings.text.push_str(&format!("## {title}\n"));
        match self.provider.query(prompt, self.model_hint.as_deref()).await {
            Ok(answer) => {
                findings.text.push_str(answer.trim());
                Some(answer)
            }
            Err(e) => {
                warn!(query = title, error = %e, "research query failed");
                findings.text.push_str(&format!("{RESEARCH_ERROR_MARKER} {title} query failed: {e}"));
                findings.errored = true;
                None
            }
        }
    }
}

fn api_query(request: &ToolRequest, service: &str) -> String {
    format!(
        "Does {service} offer a documented public API that could power a tool described as: \"{}\"? \
         Tool name: {}. Purpose: {}. If an API exists, give its base URL, relevant endpoint paths and \
         authentication requirements. If none exists, say plainly that there is no public API.",
        request.description, request.name, request.purpose
    )
}

fn scraping_query(request: &ToolRequest, site: &str) -> String {
    format!(
        "How hard is it to scrape {site} to obtain: {}? Mention bot protection, CAPTCHAs, login \
         requirements and whether the data is rendered client-side.",
        if request.expected_output.is_empty() { &request.description } else { &request.expected_output }
    )
}

fn endpoint_query(request: &ToolRequest, service: &str) -> String {
    let params: Vec<&str> = request.inputs.iter().map(|i| i.name.as_str()).collect();
    format!(
        "Give the exact, absolute HTTP endpoint URL of the {service} API (for example a path under /api, /v1, /v2 or /rest) \
         that returns data for: {}. Include the full URL and the query parameters that correspond to: {}.",
        request.description,
        if params.is_empty() { "none".to_owned() } else { params.join(", ") }
    )
}
