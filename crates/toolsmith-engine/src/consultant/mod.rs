//! Iterative strategy consultation: research, analyze, verify, and retry with
//! escalating research depth until a recommendation survives verification.

pub mod analysis;
pub mod heuristics;
pub mod probe;
pub mod research;
pub mod state;
pub mod verify;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};

use toolsmith_core::consultation::{
    AnalysisResult, ConsultationOutcome, ConsultationRequest, ConsultationRound, ResearchFingerprint,
    VerificationResult,
};
use toolsmith_core::provider::{ResearchProvider, StructuredGenerator};
use toolsmith_llm::DEFAULT_MODEL;

use analysis::{AnalysisInput, Analyst};
use probe::{ReachabilityChecker, SiteProbe};
use research::Researcher;
use state::{next_state, LoopState, Transition};

pub use probe::{HttpProber, ProbeError};

/// Analysis and verification cycles allowed per call.
pub const MAX_ATTEMPTS: u32 = 3;

#[derive(Clone, Debug)]
pub struct ConsultantConfig {
    pub max_attempts: u32,
    /// Analysis model when the request names none.
    pub default_model: String,
    /// Passed to the research provider as its model hint.
    pub research_model: Option<String>,
}

impl Default for ConsultantConfig {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            default_model: DEFAULT_MODEL.into(),
            research_model: None,
        }
    }
}

pub struct Consultant {
    researcher: Researcher,
    analyst: Analyst,
    checker: Arc<dyn ReachabilityChecker>,
    config: ConsultantConfig,
}

/// Earlier findings are reused only for the same fingerprint and when they did not fail.
fn can_reuse(previous: &AnalysisResult, fingerprint: &ResearchFingerprint) -> bool {
    previous.preliminary_research_for.as_ref() == Some(fingerprint)
        && !previous.findings_error
        && !previous.preliminary_findings.trim().is_empty()
}

/// Final answer when every attempt failed verification. The rejected
/// recommendation itself stays in the round history.
fn exhausted_result(last: &AnalysisResult, verification: &VerificationResult, attempts: u32) -> AnalysisResult {
    let mut result = AnalysisResult::error(format!(
        "No strategy passed verification after {attempts} attempt(s). Last recommendation was `{}`: {}",
        last.recommended_type, verification.details
    ));
    result.warnings = last.warnings.clone();
    result.preliminary_findings = last.preliminary_findings.clone();
    result.findings_error = last.findings_error;
    result.preliminary_research_for = last.preliminary_research_for.clone();
    result
}

impl Consultant {
    pub fn new(
        generator: Arc<dyn StructuredGenerator>,
        research: Arc<dyn ResearchProvider>,
        probe: Arc<dyn SiteProbe>,
        checker: Arc<dyn ReachabilityChecker>,
        config: ConsultantConfig,
    ) -> Self {
        Self {
            researcher: Researcher::new(research, probe, config.research_model.clone()),
            analyst: Analyst::new(generator),
            checker,
            config,
        }
    }

    /// Run one consultation. Never fails: problems surface as an `error` analysis.
    #[instrument(skip(self, input), fields(tool = %input.request.name))]
    pub async fn consult(&self, input: ConsultationRequest) -> ConsultationOutcome {
        let rounds = Mutex::new(Vec::new());
        let outcome = AssertUnwindSafe(self.run_attempts(&input, &rounds)).catch_unwind().await;
        let rounds = rounds.into_inner();

        match outcome {
            Ok((analysis, verification)) => ConsultationOutcome { analysis, verification, rounds },
            Err(_) => {
                error!(rounds = rounds.len(), "consultation loop aborted unexpectedly, returning fallback result");
                ConsultationOutcome {
                    analysis: AnalysisResult::error("consultation stopped because of an internal error"),
                    verification: VerificationResult::failure("internal error during consultation"),
                    rounds,
                }
            }
        }
    }

    async fn run_attempts(
        &self,
        input: &ConsultationRequest,
        rounds: &Mutex<Vec<ConsultationRound>>,
    ) -> (AnalysisResult, VerificationResult) {
        let request = &input.request;
        let fingerprint = heuristics::fingerprint(request);
        let model = input.model.as_deref().filter(|m| !m.trim().is_empty()).unwrap_or(self.config.default_model.as_str());
        let first_round = input.history.last().map_or(0, |r| r.round);
        let max_attempts = self.config.max_attempts.max(1);

        let mut previous = input.history.last().map(|r| r.analysis.clone());
        let mut state = LoopState::initial();

        loop {
            let reusable = previous
                .as_ref()
                .filter(|p| !state.force_research && can_reuse(p, &fingerprint));
            let findings = match reusable {
                Some(p) => {
                    debug!(attempt = state.attempt, "reusing earlier research findings");
                    self.researcher.reuse(request, &p.preliminary_findings).await
                }
                None => self.researcher.research(request, state.depth).await,
            };

            let mut modifications = input.modifications.clone();
            modifications.extend(state.feedback.clone());

            let history: Vec<ConsultationRound> = input.history.iter().cloned().chain(rounds.lock().iter().cloned()).collect();
            let analysis = self
                .analyst
                .analyze(AnalysisInput {
                    request,
                    findings: &findings,
                    fingerprint: &fingerprint,
                    modifications: &modifications,
                    history: &history,
                    model,
                })
                .await;
            let verification = verify::verify(&analysis, request, self.checker.as_ref()).await;

            info!(
                attempt = state.attempt,
                depth = ?state.depth,
                recommended = %analysis.recommended_type,
                verification = ?verification.status,
                "consultation attempt finished"
            );
            rounds.lock().push(ConsultationRound {
                round: first_round + state.attempt,
                modifications_requested: modifications,
                analysis: analysis.clone(),
                verification: verification.clone(),
                timestamp: Utc::now(),
            });

            match next_state(&state, &analysis, &verification, request, max_attempts) {
                Transition::Done => return (analysis, verification),
                Transition::Exhausted => {
                    warn!(
                        attempts = state.attempt,
                        last = %analysis.recommended_type,
                        "consultation attempts exhausted while verification still fails"
                    );
                    return (exhausted_result(&analysis, &verification, state.attempt), verification);
                }
                Transition::Retry(next) => {
                    previous = Some(analysis);
                    state = next;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use toolsmith_core::consultation::{RecommendedType, SiteProbeReport, VerificationStatus};
    use toolsmith_core::context::InputParameter;
    use toolsmith_core::ToolRequest;
    use toolsmith_llm::{MockGenerator, MockResponse};

    use research::tests::FixedProbe;
    use verify::tests::FixedChecker;

    fn recommendation(kind: &str, endpoint: Option<&str>, strategy: &str) -> MockResponse {
        MockResponse::Json(json!({
            "recommended_type": kind,
            "strategy_details": strategy,
            "warnings": [],
            "extracted_api_endpoint": endpoint,
            "required_credential_name": null,
            "target_domain": null,
            "scraping_method_hint": null,
            "requires_auth": null,
        }))
    }

    fn weather(target: Option<&str>) -> ToolRequest {
        ToolRequest {
            name: "weather_lookup".into(),
            description: "Get current weather for a city".into(),
            inputs: vec![InputParameter {
                name: "city".into(),
                param_type: "string".into(),
                description: String::new(),
                required: true,
            }],
            target_url: target.map(str::to_owned),
            ..Default::default()
        }
    }

    struct Setup {
        analyst: Arc<MockGenerator>,
        research: Arc<MockGenerator>,
        probe: Arc<FixedProbe>,
        checker: Arc<FixedChecker>,
    }

    impl Setup {
        fn new(analyst: MockGenerator, research: MockGenerator, checker: FixedChecker) -> Self {
            Self {
                analyst: Arc::new(analyst),
                research: Arc::new(research),
                probe: Arc::new(FixedProbe::default()),
                checker: Arc::new(checker),
            }
        }

        fn consultant(&self) -> Consultant {
            Consultant::new(
                self.analyst.clone(),
                self.research.clone(),
                self.probe.clone(),
                self.checker.clone(),
                ConsultantConfig::default(),
            )
        }
    }

    #[tokio::test]
    async fn pure_function_finishes_on_first_attempt() {
        let s = Setup::new(
            MockGenerator::new(vec![recommendation("function", None, "Format the city's weather from user input")]),
            MockGenerator::always(MockResponse::text("There is no public API documented for this service.")),
            FixedChecker::new(Ok(500), Ok(500)),
        );
        let outcome = s
            .consultant()
            .consult(ConsultationRequest { request: weather(Some("weather.example.com")), ..Default::default() })
            .await;

        assert_eq!(outcome.analysis.recommended_type, RecommendedType::Function);
        assert_eq!(outcome.verification.status, VerificationStatus::Skipped);
        assert_eq!(outcome.rounds.len(), 1);
        assert_eq!(outcome.rounds[0].round, 1);
        assert_eq!(s.probe.calls.load(Ordering::Relaxed), 1);
        assert!(s.checker.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn unblocked_site_scraping_succeeds() {
        let s = Setup::new(
            MockGenerator::new(vec![recommendation("scraping", None, "Parse the forecast table")]),
            MockGenerator::always(MockResponse::text("No public API. Static pages.")),
            FixedChecker::new(Ok(500), Ok(200)),
        );
        let outcome = s
            .consultant()
            .consult(ConsultationRequest { request: weather(Some("weather.example.com")), ..Default::default() })
            .await;
        assert_eq!(outcome.verification.status, VerificationStatus::Success);
        assert_eq!(outcome.rounds.len(), 1);
    }

    #[tokio::test]
    async fn invalid_endpoint_escalates_then_uses_found_endpoint() {
        let s = Setup::new(
            MockGenerator::new(vec![
                recommendation("api", Some("not-a-url"), "Call the weather API with the city"),
                recommendation("api", None, "Call the weather API with the city"),
            ]),
            MockGenerator::new(vec![
                MockResponse::text("A documented weather API exists."),
                MockResponse::text("A documented weather API exists."),
                MockResponse::text("GET https://api.weather.example.com/v1/current?city=Paris"),
            ]),
            FixedChecker::new(Ok(401), Ok(200)),
        );
        let outcome = s.consultant().consult(ConsultationRequest { request: weather(None), ..Default::default() }).await;

        assert_eq!(outcome.rounds.len(), 2);
        let first = &outcome.rounds[0];
        assert!(first.verification.is_failure());
        assert!(first.verification.details.contains("could not determine a valid API endpoint"));

        let second = &outcome.rounds[1];
        assert!(second.modifications_requested[0].contains("Deep research"));
        assert_eq!(outcome.verification.status, VerificationStatus::Success);
        assert_eq!(
            outcome.analysis.extracted_api_endpoint.as_deref(),
            Some("https://api.weather.example.com/v1/current?city=Paris")
        );
        assert_eq!(s.research.call_count(), 3);
    }

    #[tokio::test]
    async fn deep_research_runs_at_most_once_per_call() {
        let s = Setup::new(
            MockGenerator::always(recommendation("api", Some("not-a-url"), "")),
            MockGenerator::always(MockResponse::text("Some API may exist, no URL known.")),
            FixedChecker::new(Ok(200), Ok(200)),
        );
        let outcome = s.consultant().consult(ConsultationRequest { request: weather(None), ..Default::default() }).await;

        assert_eq!(outcome.rounds.len(), MAX_ATTEMPTS as usize);
        assert!(outcome.verification.is_failure());
        assert_eq!(outcome.analysis.recommended_type, RecommendedType::Error);
        let targeted = s.research.prompts().iter().filter(|p| p.contains("/v1, /v2 or /rest")).count();
        assert_eq!(targeted, 1);
    }

    #[tokio::test]
    async fn unreachable_api_after_all_attempts_is_an_error_result() {
        let s = Setup::new(
            MockGenerator::always(recommendation(
                "api",
                Some("https://api.weather.example.com/v1/current"),
                "Call the current weather endpoint with the city parameter",
            )),
            MockGenerator::always(MockResponse::text("A documented weather API exists.")),
            FixedChecker::new(Ok(500), Ok(500)),
        );
        let outcome = s.consultant().consult(ConsultationRequest { request: weather(None), ..Default::default() }).await;

        assert_eq!(outcome.rounds.len(), MAX_ATTEMPTS as usize);
        assert_eq!(outcome.analysis.recommended_type, RecommendedType::Error);
        assert!(outcome.analysis.strategy_details.contains("after 3 attempt(s)"));
        assert!(outcome.analysis.strategy_details.contains("`api`"));
        assert!(outcome.verification.is_failure());
        assert!(outcome.rounds.iter().all(|r| r.analysis.recommended_type == RecommendedType::Api));
        assert!(!outcome.analysis.preliminary_findings.is_empty());
    }

    #[tokio::test]
    async fn attempts_never_exceed_budget() {
        let s = Setup::new(
            MockGenerator::always(MockResponse::Error(toolsmith_core::ProviderError::ProviderOverloaded)),
            MockGenerator::always(MockResponse::text("findings")),
            FixedChecker::new(Ok(200), Ok(200)),
        );
        let outcome = s.consultant().consult(ConsultationRequest { request: weather(None), ..Default::default() }).await;

        assert_eq!(s.analyst.call_count(), MAX_ATTEMPTS as usize);
        assert_eq!(outcome.rounds.len(), MAX_ATTEMPTS as usize);
        assert_eq!(outcome.analysis.recommended_type, RecommendedType::Error);
    }

    #[tokio::test]
    async fn unchanged_fingerprint_reuses_findings() {
        let s = Setup::new(
            MockGenerator::new(vec![
                recommendation("scraping", None, "Parse the forecast table"),
                recommendation("scraping", None, "Parse the forecast table with a headless browser"),
            ]),
            MockGenerator::always(MockResponse::text("No public API. Pages are static.")),
            FixedChecker::new(Ok(200), Ok(503)),
        );
        let consultant = Consultant::new(
            s.analyst.clone(),
            s.research.clone(),
            s.probe.clone(),
            s.checker.clone(),
            ConsultantConfig { max_attempts: 2, ..Default::default() },
        );

        let outcome = consultant
            .consult(ConsultationRequest { request: weather(Some("weather.example.com")), ..Default::default() })
            .await;

        assert_eq!(outcome.rounds.len(), 2);
        assert_eq!(s.research.call_count(), 2, "second round must not query again");
        assert_eq!(s.probe.calls.load(Ordering::Relaxed), 2, "the probe runs every round");
        assert_eq!(
            outcome.rounds[1].analysis.preliminary_findings,
            outcome.rounds[0].analysis.preliminary_findings
        );
    }

    #[tokio::test]
    async fn history_from_earlier_call_is_reused_and_numbered() {
        let request = weather(None);
        let mut earlier = AnalysisResult::error("");
        earlier.recommended_type = RecommendedType::Scraping;
        earlier.preliminary_findings = "## API availability\nNo public API.".into();
        earlier.preliminary_research_for = Some(heuristics::fingerprint(&request));
        let history = vec![ConsultationRound {
            round: 4,
            modifications_requested: vec![],
            analysis: earlier,
            verification: VerificationResult::failure("HTTP 503"),
            timestamp: Utc::now(),
        }];

        let s = Setup::new(
            MockGenerator::new(vec![recommendation("function", None, "Compute locally")]),
            MockGenerator::new(vec![]),
            FixedChecker::new(Ok(200), Ok(200)),
        );
        let outcome = s
            .consultant()
            .consult(ConsultationRequest {
                request,
                history,
                modifications: vec!["Avoid scraping".into()],
                model: Some("analysis-model".into()),
            })
            .await;

        assert_eq!(s.research.call_count(), 0);
        assert_eq!(outcome.rounds.len(), 1);
        assert_eq!(outcome.rounds[0].round, 5);
        assert_eq!(outcome.rounds[0].modifications_requested, vec!["Avoid scraping".to_string()]);
        assert!(s.analyst.prompts()[0].contains("No public API."));
    }

    #[tokio::test]
    async fn errored_findings_are_not_reused() {
        let request = weather(None);
        let mut earlier = AnalysisResult::error("analysis failed");
        earlier.preliminary_findings = "[research error] API availability query failed".into();
        earlier.findings_error = true;
        earlier.preliminary_research_for = Some(heuristics::fingerprint(&request));
        let history = vec![ConsultationRound {
            round: 1,
            modifications_requested: vec![],
            analysis: earlier,
            verification: VerificationResult::failure("analysis failed"),
            timestamp: Utc::now(),
        }];

        let s = Setup::new(
            MockGenerator::new(vec![recommendation("function", None, "Compute locally")]),
            MockGenerator::always(MockResponse::text("findings")),
            FixedChecker::new(Ok(200), Ok(200)),
        );
        s.consultant().consult(ConsultationRequest { request, history, ..Default::default() }).await;
        assert!(s.research.call_count() > 0);
    }

    struct ExplodingProbe;

    #[async_trait::async_trait]
    impl SiteProbe for ExplodingProbe {
        async fn check(&self, _url: &str) -> Result<SiteProbeReport, ProbeError> {
            panic!("probe bug");
        }
    }

    #[tokio::test]
    async fn internal_panic_yields_fallback_result() {
        let consultant = Consultant::new(
            Arc::new(MockGenerator::new(vec![])),
            Arc::new(MockGenerator::new(vec![])),
            Arc::new(ExplodingProbe),
            Arc::new(FixedChecker::new(Ok(200), Ok(200))),
            ConsultantConfig::default(),
        );
        let outcome = consultant
            .consult(ConsultationRequest { request: weather(Some("weather.example.com")), ..Default::default() })
            .await;
        assert_eq!(outcome.analysis.recommended_type, RecommendedType::Error);
        assert!(outcome.verification.is_failure());
        assert!(outcome.rounds.is_empty());
    }
}
