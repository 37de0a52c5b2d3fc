use secrecy::SecretString;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LlmSettings {
    /// OpenAI-compatible base URL including the version segment.
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub default_model: String,
    pub research_model: String,
    pub request_timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            default_model: "gpt-4o-mini".into(),
            research_model: "gpt-4o-mini".into(),
            request_timeout_ms: 120_000,
            max_retries: 2,
        }
    }
}

impl LlmSettings {
    /// Read the key from the configured environment variable.
    pub fn api_key(&self) -> Option<SecretString> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(SecretString::from)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineSettings {
    /// Step names to bypass, e.g. `applying_tailwind_styling`.
    pub skip_steps: Vec<String>,
    /// Overrides `llm.defaultModel` for pipeline agents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsultantSettings {
    pub max_attempts: u32,
    pub probe_timeout_ms: u64,
    pub verification_timeout_ms: u64,
}

impl Default for ConsultantSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            probe_timeout_ms: 10_000,
            verification_timeout_ms: 10_000,
        }
    }
}
