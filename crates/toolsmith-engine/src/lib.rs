pub mod consultant;
pub mod control;
pub mod error;
pub mod invoker;
pub mod orchestrator;
pub mod progress;
pub mod schemas;

pub use consultant::{Consultant, ConsultantConfig, MAX_ATTEMPTS};
pub use control::{GateState, JobControls};
pub use error::{AgentInvocationError, PipelineError};
pub use invoker::{AgentInvoker, LlmAgentInvoker};
pub use orchestrator::{NewJob, PipelineConfig, PipelineOrchestrator};
pub use progress::{
    ConnectionDirectory, DeliveryError, ListenerRegistry, ProgressChannel, ProgressHub, PushTransport,
    Subscription,
};
