//! Settings type definitions.
//!
//! Field names are camelCase on disk. Every section is `#[serde(default)]`,
//! so a partial file only needs the keys it changes.

mod llm;
mod server;

pub use llm::*;
pub use server::*;

use serde::{Deserialize, Serialize};

/// Root settings, loaded from `~/.toolsmith/settings.json`.
///
/// ```json
/// {
///   "server": { "port": 9090 },
///   "consultant": { "maxAttempts": 2 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolsmithSettings {
    pub server: ServerSettings,
    pub storage: StorageSettings,
    pub llm: LlmSettings,
    pub pipeline: PipelineSettings,
    pub consultant: ConsultantSettings,
    pub logging: LoggingSettings,
}
