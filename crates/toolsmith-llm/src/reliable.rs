use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use tracing::{info, warn};

use toolsmith_core::errors::ProviderError;
use toolsmith_core::provider::{GenerationRequest, ResearchProvider, StructuredGenerator};

/// Configuration for the ReliableGenerator retry and circuit breaker behavior.
#[derive(Clone, Debug)]
pub struct ReliableConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown: Duration,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter_factor: 0.2,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

/// Opens after `threshold` consecutive failed calls, lets one call through
/// once `cooldown` has passed, and closes again on the first success.
struct CircuitBreaker {
    state: RwLock<CircuitState>,
    consecutive_failures: AtomicU32,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: RwLock::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
            threshold: threshold.max(1),
            cooldown,
        }
    }

    fn admit(&self) -> Result<(), ProviderError> {
        let mut state = self.state.write();
        match *state {
            CircuitState::Open { since } if since.elapsed() < self.cooldown => Err(ProviderError::CircuitOpen),
            CircuitState::Open { .. } => {
                *state = CircuitState::HalfOpen;
                Ok(())
            }
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
        }
    }

    fn on_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let mut state = self.state.write();
        if *state != CircuitState::Closed {
            info!(provider_circuit = "closed", "provider recovered");
            *state = CircuitState::Closed;
        }
    }

    fn on_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let mut state = self.state.write();
        let reopen = *state == CircuitState::HalfOpen;
        if (failures >= self.threshold || reopen) && !matches!(*state, CircuitState::Open { .. }) {
            warn!(failures, cooldown_secs = self.cooldown.as_secs(), "provider circuit opened");
            *state = CircuitState::Open { since: Instant::now() };
        }
    }

    fn name(&self) -> &'static str {
        match *self.state.read() {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Generator or research provider with backoff retries and a circuit breaker.
///
/// Only [`ProviderError::is_retryable`] failures are retried; a `retry_after`
/// hint replaces the computed backoff. Every call that ultimately fails counts
/// toward the breaker, and a failure while half-open reopens it immediately.
pub struct ReliableGenerator<G> {
    inner: G,
    config: ReliableConfig,
    breaker: CircuitBreaker,
    total_retries: AtomicU64,
}

impl<G> ReliableGenerator<G> {
    pub fn new(inner: G, config: ReliableConfig) -> Self {
        Self {
            breaker: CircuitBreaker::new(config.circuit_breaker_threshold, config.circuit_breaker_cooldown),
            inner,
            config,
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(inner: G) -> Self {
        Self::new(inner, ReliableConfig::default())
    }

    /// Exponential backoff with jitter, unless the provider suggested a delay.
    fn retry_delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay;
        }

        let exp_delay = self.config.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let capped = exp_delay.min(self.config.max_delay.as_millis() as f64);

        let jitter_range = capped * self.config.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(1.0) as u64)
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    pub fn circuit_state_name(&self) -> &'static str {
        self.breaker.name()
    }

    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        self.breaker.admit()?;

        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => {
                    self.breaker.on_success();
                    return Ok(value);
                }
                Err(e) => {
                    if !e.is_retryable() || attempt >= self.config.max_retries {
                        self.breaker.on_failure();
                        return Err(e);
                    }

                    let delay = self.retry_delay(attempt, e.suggested_delay());
                    self.total_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after error"
                    );

                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    self.breaker.admit()?;
                }
            }
        }
    }
}

#[async_trait]
impl<G: StructuredGenerator> StructuredGenerator for ReliableGenerator<G> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<serde_json::Value, ProviderError> {
        self.with_retry(|| self.inner.generate(request)).await
    }
}

#[async_trait]
impl<G: ResearchProvider> ResearchProvider for ReliableGenerator<G> {
    async fn query(&self, prompt: &str, model_hint: Option<&str>) -> Result<String, ProviderError> {
        self.with_retry(|| self.inner.query(prompt, model_hint)).await
    }
}
