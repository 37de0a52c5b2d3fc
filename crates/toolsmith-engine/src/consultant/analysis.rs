use std::sync::Arc;

use serde::Deserialize;
use tracing::warn;

use toolsmith_core::consultation::{AnalysisResult, ConsultationRound, RecommendedType, ResearchFingerprint};
use toolsmith_core::provider::{GenerationRequest, StructuredGenerator};
use toolsmith_core::ToolRequest;

use super::heuristics::is_valid_endpoint;
use super::research::Findings;
use crate::schemas::{analysis_schema, ANALYSIS_SYSTEM_PROMPT};

/// Shape the generator is asked to return.
#[derive(Deserialize)]
struct Recommendation {
    recommended_type: RecommendedType,
    strategy_details: String,
    #[serde(default)]
    warnings: Vec<String>,
    #[serde(default)]
    extracted_api_endpoint: Option<String>,
    #[serde(default)]
    required_credential_name: Option<String>,
    #[serde(default)]
    target_domain: Option<String>,
    #[serde(default)]
    scraping_method_hint: Option<String>,
    #[serde(default)]
    requires_auth: Option<bool>,
}

/// Everything the analyst looks at for one attempt.
pub struct AnalysisInput<'a> {
    pub request: &'a ToolRequest,
    pub findings: &'a Findings,
    pub fingerprint: &'a ResearchFingerprint,
    pub modifications: &'a [String],
    pub history: &'a [ConsultationRound],
    pub model: &'a str,
}

pub struct Analyst {
    generator: Arc<dyn StructuredGenerator>,
}

impl Analyst {
    pub fn new(generator: Arc<dyn StructuredGenerator>) -> Self {
        Self { generator }
    }

    /// Always returns a result; generator and contract failures become `error` results.
    pub async fn analyze(&self, input: AnalysisInput<'_>) -> AnalysisResult {
        let request = GenerationRequest {
            model: input.model.to_owned(),
            system: ANALYSIS_SYSTEM_PROMPT.to_owned(),
            prompt: build_prompt(&input),
            schema_name: "strategy_analysis".into(),
            schema: analysis_schema(),
        };

        let mut result = match self.generator.generate(&request).await {
            Ok(value) => match serde_json::from_value::<Recommendation>(value) {
                Ok(rec) => from_recommendation(rec),
                Err(e) => {
                    warn!(error = %e, "analysis output did not match its schema");
                    AnalysisResult::error(format!("analysis returned malformed output: {e}"))
                }
            },
            Err(e) => {
                warn!(error = %e, "analysis generation failed");
                AnalysisResult::error(format!("analysis failed: {e}"))
            }
        };

        if result.recommended_type == RecommendedType::Api
            && !is_valid_endpoint(result.extracted_api_endpoint.as_deref())
            && is_valid_endpoint(input.findings.candidate_endpoint.as_deref())
        {
            result.extracted_api_endpoint = input.findings.candidate_endpoint.clone();
        }

        result.preliminary_findings = input.findings.text.clone();
        result.findings_error = input.findings.errored;
        result.preliminary_research_for = Some(input.fingerprint.clone());
        result
    }
}

fn from_recommendation(rec: Recommendation) -> AnalysisResult {
    let blank_to_none = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
    AnalysisResult {
        recommended_type: rec.recommended_type,
        strategy_details: rec.strategy_details,
        warnings: rec.warnings,
        extracted_api_endpoint: blank_to_none(rec.extracted_api_endpoint),
        preliminary_findings: String::new(),
        findings_error: false,
        preliminary_research_for: None,
        required_credential_name: blank_to_none(rec.required_credential_name),
        target_domain: blank_to_none(rec.target_domain),
        scraping_method_hint: blank_to_none(rec.scraping_method_hint),
        requires_auth: rec.requires_auth,
    }
}

fn build_prompt(input: &AnalysisInput<'_>) -> String {
    let request = serde_json::to_string_pretty(input.request).unwrap_or_default();
    let mut prompt = format!("Tool request:\n{request}\n\nResearch findings:\n{}\n", input.findings.render());

    if let Some(endpoint) = &input.findings.candidate_endpoint {
        prompt.push_str(&format!("\nCandidate endpoint found by targeted search: {endpoint}\n"));
    }

    if !input.history.is_empty() {
        prompt.push_str("\nEarlier attempts:\n");
        for round in input.history {
            prompt.push_str(&format!(
                "- round {}: {} ({:?}: {})\n",
                round.round, round.analysis.recommended_type, round.verification.status, round.verification.details
            ));
        }
    }

    if !input.modifications.is_empty() {
        prompt.push_str("\nRequested changes:\n");
        for m in input.modifications {
            prompt.push_str(&format!("- {m}\n"));
        }
    }
    prompt
}
