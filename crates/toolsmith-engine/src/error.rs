use toolsmith_core::{AgentName, JobId, OutputField, PipelineStep, ProviderError};
use toolsmith_store::StoreError;

/// Failure of a single agent call.
#[derive(Debug, thiserror::Error)]
pub enum AgentInvocationError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("{agent} output violates its contract: {detail}")]
    Contract { agent: AgentName, detail: String },
}

/// Errors that end a pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{agent} failed during {step}: {source}")]
    AgentInvocation {
        step: PipelineStep,
        agent: AgentName,
        #[source]
        source: AgentInvocationError,
    },

    #[error("{step} finished without its required output `{field}`")]
    AgentOutputMissing { step: PipelineStep, field: OutputField },

    #[error("validator rejected the component with {error_count} error(s): {summary}")]
    ValidationRejected { error_count: usize, summary: String },

    #[error("failed to persist job state during {step}: {source}")]
    Persistence {
        step: PipelineStep,
        #[source]
        source: StoreError,
    },

    #[error("invalid tool request: {0}")]
    InvalidRequest(String),

    #[error("job {0} already has an active run")]
    AlreadyRunning(JobId),

    #[error("job cancelled before {step}")]
    Cancelled { step: PipelineStep },
}

impl PipelineError {
    /// Step the failure is attributed to, when there is one.
    pub fn step(&self) -> Option<PipelineStep> {
        match self {
            Self::AgentInvocation { step, .. }
            | Self::AgentOutputMissing { step, .. }
            | Self::Persistence { step, .. }
            | Self::Cancelled { step } => Some(*step),
            Self::ValidationRejected { .. } => Some(PipelineStep::ValidatingCode),
            Self::InvalidRequest(_) => Some(PipelineStep::Initialization),
            Self::AlreadyRunning(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::AgentInvocation { .. } => "agent_invocation",
            Self::AgentOutputMissing { .. } => "agent_output_missing",
            Self::ValidationRejected { .. } => "validation_rejected",
            Self::Persistence { .. } => "persistence",
            Self::InvalidRequest(_) => "invalid_request",
            Self::AlreadyRunning(_) => "already_running",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}
