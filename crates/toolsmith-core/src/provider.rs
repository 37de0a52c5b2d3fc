use async_trait::async_trait;

use crate::errors::ProviderError;

/// A schema-constrained generation call.
#[derive(Clone, Debug)]
pub struct GenerationRequest {
    pub model: String,
    pub system: String,
    pub prompt: String,
    /// Name reported to the provider alongside `schema`.
    pub schema_name: String,
    /// JSON Schema the response object must satisfy.
    pub schema: serde_json::Value,
}

/// Produces a JSON object from a prompt against a schema.
#[async_trait]
pub trait StructuredGenerator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest) -> Result<serde_json::Value, ProviderError>;
}

/// Answers free-form research questions with text.
#[async_trait]
pub trait ResearchProvider: Send + Sync {
    async fn query(&self, prompt: &str, model_hint: Option<&str>) -> Result<String, ProviderError>;
}
