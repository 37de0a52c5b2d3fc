pub mod consultation;
pub mod context;
pub mod errors;
pub mod events;
pub mod ids;
pub mod outputs;
pub mod provider;
pub mod steps;

pub use context::{JobFailure, JobStatus, ToolConstructionContext, ToolRequest, TCC_VERSION};
pub use errors::ProviderError;
pub use events::{ProgressEvent, ProgressStatus};
pub use ids::{ConnectionId, ConsultationId, JobId, UserId};
pub use steps::{AgentName, OutputField, PipelineStep};
