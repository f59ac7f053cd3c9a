//! Application configuration from `TEXT2SQL_*` environment variables.

use crate::error::{Result, Text2SqlError};
use crate::execution::ExecutionLimits;
use crate::llm::BackoffPolicy;
use crate::safety_guardrails::SafetyPolicy;
use crate::schema_rag::{EmbeddingProvider, HashingEmbedder, OpenAiEmbedder};
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingBackend {
    Local,
    OpenAi,
}

impl FromStr for EmbeddingBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "hashing" => Ok(EmbeddingBackend::Local),
            "openai" => Ok(EmbeddingBackend::OpenAi),
            other => Err(format!("expected 'local' or 'openai', got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub backend: EmbeddingBackend,
    pub model: String,
    pub dimensions: Option<usize>,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub top_k: usize,
    pub limits: ExecutionLimits,
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
    pub llm_timeout: Duration,
    pub databases_file: PathBuf,
    pub llms_file: PathBuf,
    pub index_file: PathBuf,
    pub embedding: EmbeddingConfig,
    pub default_llm: Option<String>,
    pub bind: String,
    pub history_size: usize,
    pub auto_index: bool,
    pub safety: SafetyPolicy,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup (the environment in
    /// production, a map in tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let top_k: usize = parse(&get, "TEXT2SQL_TOP_K", 5)?;
        if top_k == 0 {
            return Err(Text2SqlError::Config("TEXT2SQL_TOP_K must be positive".to_string()));
        }
        let max_rows: usize = parse(&get, "TEXT2SQL_MAX_ROWS", 500)?;
        if max_rows == 0 {
            return Err(Text2SqlError::Config("TEXT2SQL_MAX_ROWS must be positive".to_string()));
        }

        let mut safety = SafetyPolicy {
            allow_multiple_statements: parse(&get, "TEXT2SQL_ALLOW_MULTI_STATEMENT", false)?,
            ..SafetyPolicy::default()
        };
        if let Some(list) = get("TEXT2SQL_BLOCKED_KEYWORDS") {
            safety.blocked_keywords = list
                .split(',')
                .map(|k| k.trim().to_ascii_lowercase())
                .filter(|k| !k.is_empty())
                .collect();
        }

        let backend: EmbeddingBackend = parse(&get, "TEXT2SQL_EMBEDDING_PROVIDER", EmbeddingBackend::Local)?;
        let default_model = match backend {
            EmbeddingBackend::Local => "local-hashing-v1",
            EmbeddingBackend::OpenAi => "text-embedding-3-small",
        };
        let dimensions = match get("TEXT2SQL_EMBEDDING_DIMENSIONS") {
            Some(_) => Some(parse(&get, "TEXT2SQL_EMBEDDING_DIMENSIONS", 0usize)?),
            None => None,
        };

        Ok(Self {
            top_k,
            limits: ExecutionLimits {
                max_rows,
                statement_timeout: Duration::from_millis(parse(&get, "TEXT2SQL_STATEMENT_TIMEOUT_MS", 30_000)?),
            },
            max_retries: parse(&get, "TEXT2SQL_MAX_RETRIES", 3)?,
            backoff: BackoffPolicy {
                base: Duration::from_millis(parse(&get, "TEXT2SQL_BACKOFF_BASE_MS", 500)?),
                max: Duration::from_millis(parse(&get, "TEXT2SQL_BACKOFF_MAX_MS", 8_000)?),
                jitter: true,
            },
            llm_timeout: Duration::from_secs(parse(&get, "TEXT2SQL_LLM_TIMEOUT_SECS", 60)?),
            databases_file: get("TEXT2SQL_DATABASES_FILE")
                .unwrap_or_else(|| "data/config/databases.json".to_string())
                .into(),
            llms_file: get("TEXT2SQL_LLMS_FILE")
                .unwrap_or_else(|| "data/config/llms.json".to_string())
                .into(),
            index_file: get("TEXT2SQL_INDEX_FILE")
                .unwrap_or_else(|| "data/index/schema_index.json".to_string())
                .into(),
            embedding: EmbeddingConfig {
                backend,
                model: get("TEXT2SQL_EMBEDDING_MODEL").unwrap_or_else(|| default_model.to_string()),
                dimensions,
                base_url: get("TEXT2SQL_EMBEDDING_BASE_URL").unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            },
            default_llm: get("TEXT2SQL_DEFAULT_LLM"),
            bind: get("TEXT2SQL_BIND").unwrap_or_else(|| "127.0.0.1:8000".to_string()),
            history_size: parse(&get, "TEXT2SQL_HISTORY_SIZE", 100)?,
            auto_index: parse(&get, "TEXT2SQL_AUTO_INDEX", true)?,
            safety,
        })
    }

    /// The configured embedding provider. Index and queries must share it.
    pub fn embedder(&self) -> Result<Arc<dyn EmbeddingProvider>> {
        let embedder: Arc<dyn EmbeddingProvider> = match self.embedding.backend {
            EmbeddingBackend::Local => Arc::new(HashingEmbedder::new(
                self.embedding.dimensions.unwrap_or(HashingEmbedder::DEFAULT_DIMENSION),
            )),
            EmbeddingBackend::OpenAi => {
                let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
                Arc::new(OpenAiEmbedder::new(
                    &api_key,
                    &self.embedding.base_url,
                    &self.embedding.model,
                    self.embedding.dimensions,
                    Duration::from_secs(30),
                    self.max_retries as usize,
                )?)
            }
        };
        Ok(embedder)
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| Text2SqlError::Config(format!("invalid value '{}' for {}: {}", raw, key, e))),
    }
}
