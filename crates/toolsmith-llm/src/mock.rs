use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use toolsmith_core::errors::ProviderError;
use toolsmith_core::provider::{GenerationRequest, ResearchProvider, StructuredGenerator};

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Structured object returned from `generate`.
    Json(serde_json::Value),
    /// Plain text returned from `query`.
    Text(String),
    Error(ProviderError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn text(s: &str) -> Self {
        Self::Text(s.to_owned())
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock generator and research provider that answers from a fixed script.
///
/// Once the script is exhausted the fallback response is used, or an error if none is set.
pub struct MockGenerator {
    responses: Vec<MockResponse>,
    fallback: Option<MockResponse>,
    call_count: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl MockGenerator {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses,
            fallback: None,
            call_count: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Answer every call with the same response.
    pub fn always(response: MockResponse) -> Self {
        Self::new(Vec::new()).with_fallback(response)
    }

    pub fn with_fallback(mut self, response: MockResponse) -> Self {
        self.fallback = Some(response);
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    async fn next_response(&self, prompt: &str) -> Result<MockResponse, ProviderError> {
        self.prompts.lock().push(prompt.to_owned());
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        let response = self
            .responses
            .get(idx)
            .or(self.fallback.as_ref())
            .ok_or_else(|| {
                ProviderError::InvalidRequest(format!("MockGenerator: no response configured for call {idx}"))
            })?;
        resolve_response(response).await
    }
}

/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_response(response: &MockResponse) -> Result<MockResponse, ProviderError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(*duration).await;
                current = inner;
            }
            MockResponse::Error(e) => return Err(e.clone()),
            other => return Ok(other.clone()),
        }
    }
}

#[async_trait]
impl StructuredGenerator for MockGenerator {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<serde_json::Value, ProviderError> {
        match self.next_response(&request.prompt).await? {
            MockResponse::Json(value) => Ok(value),
            MockResponse::Text(text) => serde_json::from_str(&text)
                .map_err(|e| ProviderError::MalformedResponse(e.to_string())),
            _ => Err(ProviderError::MalformedResponse("unexpected mock response".into())),
        }
    }
}

#[async_trait]
impl ResearchProvider for MockGenerator {
    async fn query(&self, prompt: &str, _model_hint: Option<&str>) -> Result<String, ProviderError> {
        match self.next_response(prompt).await? {
            MockResponse::Text(text) => Ok(text),
            MockResponse::Json(value) => Ok(value.to_string()),
            _ => Err(ProviderError::MalformedResponse("unexpected mock response".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(prompt: &str) -> GenerationRequest {
        GenerationRequest {
            model: "mock-model".into(),
            system: String::new(),
            prompt: prompt.into(),
            schema_name: "test".into(),
            schema: json!({"type": "object"}),
        }
    }

    #[tokio::test]
    async fn json_response() {
        let mock = MockGenerator::new(vec![MockResponse::Json(json!({"ok": true}))]);
        let value = mock.generate(&request("p")).await.unwrap();
        assert_eq!(value["ok"], true);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn text_that_is_not_json_is_malformed() {
        let mock = MockGenerator::new(vec![MockResponse::text("hello")]);
        let err = mock.generate(&request("p")).await.unwrap_err();
        assert!(matches!(err, ProviderError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn sequential_responses_and_prompt_log() {
        let mock = MockGenerator::new(vec![MockResponse::text("first"), MockResponse::text("second")]);
        assert_eq!(mock.query("q1", None).await.unwrap(), "first");
        assert_eq!(mock.query("q2", None).await.unwrap(), "second");
        assert_eq!(mock.prompts(), vec!["q1".to_string(), "q2".to_string()]);
    }

    #[tokio::test]
    async fn exhausted_responses() {
        let mock = MockGenerator::new(vec![MockResponse::text("only one")]);
        let _ = mock.query("q", None).await;
        assert!(mock.query("q", None).await.is_err());
    }

    #[tokio::test]
    async fn fallback_repeats() {
        let mock = MockGenerator::always(MockResponse::text("same"));
        for _ in 0..3 {
            assert_eq!(mock.query("q", None).await.unwrap(), "same");
        }
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn error_response() {
        let mock = MockGenerator::new(vec![MockResponse::Error(ProviderError::NetworkError("down".into()))]);
        assert!(matches!(mock.query("q", None).await, Err(ProviderError::NetworkError(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_response() {
        let mock = MockGenerator::new(vec![MockResponse::delayed(
            Duration::from_millis(50),
            MockResponse::text("after delay"),
        )]);
        let start = tokio::time::Instant::now();
        let text = mock.query("q", None).await.unwrap();
        assert_eq!(text, "after delay");
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
