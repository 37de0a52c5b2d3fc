use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::{debug, instrument};

use toolsmith_core::errors::ProviderError;
use toolsmith_core::provider::{GenerationRequest, ResearchProvider, StructuredGenerator};

use crate::DEFAULT_RESEARCH_MODEL;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct ChatClientConfig {
    /// Base URL up to and including the API version, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub request_timeout: Duration,
    pub research_model: String,
}

impl Default for ChatClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            api_key: None,
            request_timeout: Duration::from_secs(120),
            research_model: DEFAULT_RESEARCH_MODEL.into(),
        }
    }
}

/// Client for OpenAI-compatible chat completion endpoints.
pub struct ChatClient {
    client: Client,
    config: ChatClientConfig,
}

impl ChatClient {
    pub fn new(config: ChatClientConfig) -> Self {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    async fn complete(&self, body: Value) -> Result<String, ProviderError> {
        let mut req = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key.expose_secret());
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(self.config.request_timeout)
            } else {
                ProviderError::NetworkError(e.to_string())
            }
        })?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, body));
        }

        let payload: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;
        extract_content(&payload)
    }
}

/// Request body constraining the reply to `request.schema`.
pub fn structured_body(request: &GenerationRequest) -> Value {
    json!({
        "model": request.model,
        "messages": [
            { "role": "system", "content": request.system },
            { "role": "user", "content": request.prompt },
        ],
        "response_format": {
            "type": "json_schema",
            "json_schema": {
                "name": request.schema_name,
                "schema": request.schema,
                "strict": true,
            }
        }
    })
}

pub fn research_body(model: &str, prompt: &str) -> Value {
    json!({
        "model": model,
        "messages": [
            { "role": "system", "content": "You are a technical research assistant. Answer factually and cite URLs where possible." },
            { "role": "user", "content": prompt },
        ],
    })
}

/// Text of the first choice's message.
pub fn extract_content(payload: &Value) -> Result<String, ProviderError> {
    payload
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| ProviderError::MalformedResponse("response has no message content".into()))
}

#[async_trait]
impl StructuredGenerator for ChatClient {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    #[instrument(skip(self, request), fields(model = %request.model, schema = %request.schema_name))]
    async fn generate(&self, request: &GenerationRequest) -> Result<Value, ProviderError> {
        let content = self.complete(structured_body(request)).await?;
        debug!(len = content.len(), "structured response received");
        serde_json::from_str(&content).map_err(|e| ProviderError::MalformedResponse(format!("not JSON: {e}")))
    }
}

#[async_trait]
impl ResearchProvider for ChatClient {
    #[instrument(skip(self, prompt))]
    async fn query(&self, prompt: &str, model_hint: Option<&str>) -> Result<String, ProviderError> {
        let model = model_hint.unwrap_or(&self.config.research_model);
        self.complete(research_body(model, prompt)).await
    }
}
