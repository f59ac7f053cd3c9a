//! LLM Gateway
//!
//! One small capability (`LlmProvider::complete`) with an implementation per
//! provider, selected from an `LlmProfile` at request time. The gateway owns
//! the retry policy: transient failures are retried with exponential backoff,
//! permanent ones are returned immediately.

pub mod anthropic;
pub mod mock;
pub mod openai;
pub mod registry;

use crate::error::{ProviderError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub use anthropic::AnthropicProvider;
pub use mock::MockProvider;
pub use openai::OpenAiProvider;
pub use registry::{FileLlmConfigStore, InMemoryLlmConfigStore, LlmConfigStore, LlmProfile, ProviderKind};

/// Trait implemented by concrete LLM providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Sends a rendered prompt and returns the unstructured completion text.
    async fn complete(&self, prompt: &str) -> std::result::Result<String, ProviderError>;
}

/// A single generation call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub provider: LlmProfile,
    pub prompt: String,
    /// Retries after the first attempt, transient failures only.
    pub max_retries: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Adds up to a quarter of the delay at random.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(8),
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (1-based): `base * 2^(retry - 1)`, capped.
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        let delay = self.base.saturating_mul(1u32 << exponent).min(self.max);
        if self.jitter && !delay.is_zero() {
            let extra = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);
            delay + Duration::from_millis(extra)
        } else {
            delay
        }
    }
}

/// Dispatches generation requests to providers, with retries.
pub struct LlmGateway {
    providers: DashMap<String, Arc<dyn LlmProvider>>,
    backoff: BackoffPolicy,
    http_timeout: Duration,
}

impl LlmGateway {
    pub fn new(backoff: BackoffPolicy, http_timeout: Duration) -> Self {
        Self {
            providers: DashMap::new(),
            backoff,
            http_timeout,
        }
    }

    /// Pins the provider used for a profile id, replacing any cached one.
    pub fn register(&self, profile_id: impl Into<String>, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(profile_id.into(), provider);
    }

    pub async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let provider = self.provider_for(&request.provider)?;
        let mut retries = 0u32;
        loop {
            match provider.complete(&request.prompt).await {
                Ok(text) => {
                    info!(
                        "LLM '{}' ({}) answered after {} attempt(s)",
                        request.provider.id,
                        provider.name(),
                        retries + 1
                    );
                    return Ok(text);
                }
                Err(err) if err.is_transient() && retries < request.max_retries => {
                    retries += 1;
                    let delay = self.backoff.delay(retries);
                    warn!(
                        "LLM '{}' transient failure ({}), retry {}/{} in {:?}",
                        request.provider.id,
                        err.message(),
                        retries,
                        request.max_retries,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!("LLM '{}' failed: {}", request.provider.id, err);
                    return Err(err.into());
                }
            }
        }
    }

    fn provider_for(&self, profile: &LlmProfile) -> std::result::Result<Arc<dyn LlmProvider>, ProviderError> {
        if let Some(provider) = self.providers.get(&profile.id) {
            return Ok(Arc::clone(provider.value()));
        }
        let provider = build_provider(profile, self.http_timeout)?;
        self.providers.insert(profile.id.clone(), Arc::clone(&provider));
        Ok(provider)
    }
}

/// Builds the provider a profile describes. Missing credentials are a
/// permanent failure.
pub fn build_provider(profile: &LlmProfile, timeout: Duration) -> std::result::Result<Arc<dyn LlmProvider>, ProviderError> {
    let provider: Arc<dyn LlmProvider> = match profile.provider {
        ProviderKind::OpenAi => Arc::new(OpenAiProvider::from_profile(profile, timeout)?),
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::from_profile(profile, timeout)?),
        ProviderKind::Local => Arc::new(MockProvider::new()),
    };
    Ok(provider)
}

/// Rate limits, timeouts and server errors are worth retrying.
pub(crate) fn classify_status(provider: &str, status: StatusCode, body: &str) -> ProviderError {
    let message = format!("{} returned {}: {}", provider, status, body.trim());
    let transient = status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
        // anthropic "overloaded"
        || status.as_u16() == 529;
    if transient {
        ProviderError::Transient(message)
    } else {
        ProviderError::Permanent(message)
    }
}

pub(crate) fn classify_transport(provider: &str, err: reqwest::Error) -> ProviderError {
    let message = format!("{} request failed: {}", provider, err);
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ProviderError::Transient(message)
    } else {
        ProviderError::Permanent(message)
    }
}

pub(crate) fn http_client(provider: &str, timeout: Duration) -> std::result::Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ProviderError::Permanent(format!("failed to build {} HTTP client: {}", provider, e)))
}
