//! Attempt/escalation state of one consultation call.

use toolsmith_core::consultation::{AnalysisResult, RecommendedType, ResearchDepth, VerificationResult};
use toolsmith_core::ToolRequest;

use super::heuristics::{is_valid_endpoint, params_covered};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoopState {
    /// 1-based attempt number.
    pub attempt: u32,
    pub depth: ResearchDepth,
    /// Deep research has been triggered during this call.
    pub escalation_used: bool,
    /// Skip findings reuse on the next attempt.
    pub force_research: bool,
    /// Instruction for the next analysis, describing why the last one failed.
    pub feedback: Option<String>,
}

impl LoopState {
    pub fn initial() -> Self {
        Self {
            attempt: 1,
            depth: ResearchDepth::Basic,
            escalation_used: false,
            force_research: false,
            feedback: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Verification did not fail.
    Done,
    /// Verification failed and the attempt budget is spent.
    Exhausted,
    Retry(LoopState),
}

/// Decide what follows an attempt.
pub fn next_state(
    state: &LoopState,
    analysis: &AnalysisResult,
    verification: &VerificationResult,
    request: &ToolRequest,
    max_attempts: u32,
) -> Transition {
    if !verification.is_failure() {
        return Transition::Done;
    }
    if state.attempt >= max_attempts {
        return Transition::Exhausted;
    }

    let should_escalate = analysis.recommended_type == RecommendedType::Api
        && state.depth == ResearchDepth::Basic
        && !state.escalation_used
        && (!is_valid_endpoint(analysis.extracted_api_endpoint.as_deref())
            || !params_covered(request, &analysis.strategy_details));

    if should_escalate {
        let inputs: Vec<&str> = request.inputs.iter().map(|i| i.name.as_str()).collect();
        let mut feedback = format!(
            "Verification failed: {}. Deep research was run to find a concrete endpoint; recommend an API only with a full, absolute endpoint URL",
            verification.details
        );
        if !inputs.is_empty() {
            feedback.push_str(&format!(" and explain how the inputs {} map onto its parameters", inputs.join(", ")));
        }
        feedback.push('.');

        return Transition::Retry(LoopState {
            attempt: state.attempt + 1,
            depth: ResearchDepth::Deep,
            escalation_used: true,
            force_research: true,
            feedback: Some(feedback),
        });
    }

    Transition::Retry(LoopState {
        attempt: state.attempt + 1,
        depth: state.depth,
        escalation_used: state.escalation_used,
        force_research: false,
        feedback: Some(format!(
            "The previous recommendation ({}) failed verification: {}. Correct it or propose a different strategy.",
            analysis.recommended_type, verification.details
        )),
    })
}
