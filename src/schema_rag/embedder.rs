//! Schema Embedder
//!
//! Embedding providers used to index schema descriptions and to embed
//! incoming questions. The index and the query path must share one provider
//! instance; `model_id` is the identity stamped on every indexed record.

use crate::error::{Result, Text2SqlError};
use crate::schema_rag::vector_store::Embedding;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Stable identifier of the model and its configuration.
    fn model_id(&self) -> &str;

    /// Embeds a single text.
    async fn embed(&self, text: &str) -> Result<Embedding>;

    /// Embeds several texts, preserving order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Offline embedder based on feature hashing of normalized word tokens.
///
/// Deterministic across runs and platforms, so it backs tests and
/// installations without an embedding API.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
    model_id: String,
}

impl HashingEmbedder {
    pub const DEFAULT_DIMENSION: usize = 384;

    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(1);
        Self {
            dimension,
            model_id: format!("local-hashing-v1:{}", dimension),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_sync(&self, text: &str) -> Embedding {
        let mut vector = vec![0.0f32; self.dimension];
        for token in tokenize(text) {
            let hash = fnv1a(token.as_bytes());
            let slot = (hash % self.dimension as u64) as usize;
            let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            vector[slot] += sign;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in vector.iter_mut() {
                *v /= norm;
            }
        }
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMENSION)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn embed(&self, text: &str) -> Result<Embedding> {
        Ok(self.embed_sync(text))
    }
}

/// Lowercased alphanumeric tokens with identifiers split on `_` and a naive
/// plural strip, so `user_accounts` and "user account" share features.
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| {
            let lower = t.to_ascii_lowercase();
            if lower.len() > 3 && lower.ends_with('s') && !lower.ends_with("ss") {
                lower[..lower.len() - 1].to_string()
            } else {
                lower
            }
        })
        .collect()
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Embeddings client for OpenAI-compatible `/embeddings` endpoints.
///
/// Retries 429/5xx responses and connection-level failures with exponential
/// backoff; anything else is returned as `Text2SqlError::Embedding`.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    model_id: String,
    dimensions: Option<usize>,
    max_retries: usize,
}

impl OpenAiEmbedder {
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        dimensions: Option<usize>,
        timeout: Duration,
        max_retries: usize,
    ) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(Text2SqlError::Config("missing OpenAI API key for embeddings".to_string()));
        }
        if model.trim().is_empty() {
            return Err(Text2SqlError::Config("missing embedding model name".to_string()));
        }
        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth)
                .map_err(|e| Text2SqlError::Config(format!("invalid OpenAI API key: {}", e)))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| Text2SqlError::Config(format!("failed to build embedding HTTP client: {}", e)))?;
        let model_id = match dimensions {
            Some(d) => format!("openai:{}:{}", model, d),
            None => format!("openai:{}", model),
        };
        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model: model.to_string(),
            model_id,
            dimensions,
            max_retries,
        })
    }

    async fn request(&self, inputs: &[&str]) -> Result<Vec<Embedding>> {
        let mut attempt = 0usize;
        loop {
            let body = EmbeddingRequest {
                model: &self.model,
                input: inputs,
                dimensions: self.dimensions,
            };
            match self.client.post(&self.endpoint).json(&body).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let mut parsed: EmbeddingResponse = resp.json().await.map_err(|e| {
                            Text2SqlError::Embedding(format!("failed to parse embedding response: {}", e))
                        })?;
                        parsed.data.sort_by_key(|d| d.index);
                        if parsed.data.len() != inputs.len() {
                            return Err(Text2SqlError::Embedding(format!(
                                "embedding API returned {} vectors for {} inputs",
                                parsed.data.len(),
                                inputs.len()
                            )));
                        }
                        return Ok(parsed.data.into_iter().map(|d| d.embedding).collect());
                    }
                    let text = resp
                        .text()
                        .await
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    if should_retry(status) && attempt < self.max_retries {
                        attempt += 1;
                        warn!("Embedding API returned {}, retry {}/{}", status, attempt, self.max_retries);
                        tokio::time::sleep(retry_backoff(attempt)).await;
                        continue;
                    }
                    return Err(Text2SqlError::Embedding(format!(
                        "embedding API error ({}): {}",
                        status, text
                    )));
                }
                Err(err) => {
                    if (err.is_timeout() || err.is_connect()) && attempt < self.max_retries {
                        attempt += 1;
                        warn!("Embedding request failed ({}), retry {}/{}", err, attempt, self.max_retries);
                        tokio::time::sleep(retry_backoff(attempt)).await;
                        continue;
                    }
                    return Err(Text2SqlError::Embedding(format!("embedding API call failed: {}", err)));
                }
            }
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn embed(&self, text: &str) -> Result<Embedding> {
        let mut vectors = self.request(&[text]).await?;
        vectors
            .pop()
            .ok_or_else(|| Text2SqlError::Embedding("no embedding vector in response".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(64) {
            let inputs: Vec<&str> = chunk.iter().map(|s| s.as_str()).collect();
            debug!("Embedding batch of {} schema descriptions", inputs.len());
            out.extend(self.request(&inputs).await?);
        }
        Ok(out)
    }
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn retry_backoff(attempt: usize) -> Duration {
    let capped = attempt.min(5) as u32;
    Duration::from_millis(250 * (1 << capped))
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}
