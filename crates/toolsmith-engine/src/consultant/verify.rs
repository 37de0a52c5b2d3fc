use tracing::debug;

use toolsmith_core::consultation::{AnalysisResult, RecommendedType, VerificationResult};
use toolsmith_core::ToolRequest;

use super::heuristics::{classify_api_status, implies_hidden_scraping, is_valid_endpoint, scraping_target};
use super::probe::{ProbeError, ReachabilityChecker};

pub const INVALID_ENDPOINT: &str = "could not determine a valid API endpoint";

/// Live check of a recommendation.
pub async fn verify(
    analysis: &AnalysisResult,
    request: &ToolRequest,
    checker: &dyn ReachabilityChecker,
) -> VerificationResult {
    let result = match analysis.recommended_type {
        RecommendedType::Api => verify_api(analysis, checker).await,
        RecommendedType::Scraping => match scraping_target(analysis, request) {
            Some(url) => verify_page(&url, checker).await,
            None => VerificationResult::skipped("no target URL to fetch for the scraping strategy"),
        },
        RecommendedType::Function => {
            if !implies_hidden_scraping(&analysis.strategy_details) {
                VerificationResult::skipped("self-contained function, nothing to reach")
            } else {
                match scraping_target(analysis, request) {
                    Some(url) => verify_page(&url, checker).await,
                    None => VerificationResult::skipped("function fetches web data but names no URL"),
                }
            }
        }
        RecommendedType::Unknown => {
            VerificationResult::failure("analysis could not settle on a strategy to verify")
        }
        RecommendedType::Error => {
            VerificationResult::failure(format!("analysis failed: {}", analysis.strategy_details))
        }
    };
    debug!(
        recommended = %analysis.recommended_type,
        status = ?result.status,
        details = %result.details,
        "recommendation verified"
    );
    result
}

async fn verify_api(analysis: &AnalysisResult, checker: &dyn ReachabilityChecker) -> VerificationResult {
    let endpoint = analysis.extracted_api_endpoint.as_deref().map(str::trim);
    let Some(url) = endpoint.filter(|e| is_valid_endpoint(Some(e))) else {
        return match endpoint {
            Some(raw) if !raw.is_empty() => VerificationResult::failure(format!("{INVALID_ENDPOINT} (got \"{raw}\")")),
            _ => VerificationResult::failure(INVALID_ENDPOINT),
        };
    };

    match checker.head(url).await {
        Ok(status) if classify_api_status(status) => {
            VerificationResult::success(format!("API endpoint {url} responded with HTTP {status}"))
        }
        Ok(status) => VerificationResult::failure(format!("API endpoint {url} returned HTTP {status}")),
        Err(e) => VerificationResult::failure(unreachable(url, &e)),
    }
}

async fn verify_page(url: &str, checker: &dyn ReachabilityChecker) -> VerificationResult {
    match checker.get(url).await {
        Ok(status) if (200..300).contains(&status) => {
            VerificationResult::success(format!("{url} returned HTTP {status}"))
        }
        Ok(status) => VerificationResult::failure(format!("{url} returned HTTP {status}")),
        Err(e) => VerificationResult::failure(unreachable(url, &e)),
    }
}

fn unreachable(url: &str, err: &ProbeError) -> String {
    match err {
        ProbeError::Timeout(after) => format!("{url} did not respond within {after:?}"),
        other => format!("{url} is unreachable: {other}"),
    }
}
