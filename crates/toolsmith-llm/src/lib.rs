pub mod client;
pub mod mock;
pub mod reliable;

pub use client::{ChatClient, ChatClientConfig};
pub use mock::{MockGenerator, MockResponse};
pub use reliable::{ReliableConfig, ReliableGenerator};

/// Model used when neither the job nor the agent mapping names one.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Model used for research queries when no hint is given.
pub const DEFAULT_RESEARCH_MODEL: &str = "gpt-4o-mini";
