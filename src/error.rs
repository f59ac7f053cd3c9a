use thiserror::Error;

/// Failure reported by an LLM provider.
///
/// Transient failures (rate limits, 5xx, timeouts) are retried by the
/// gateway; permanent ones (bad credentials, unknown model) are not.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("permanent provider error: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            ProviderError::Transient(msg) | ProviderError::Permanent(msg) => msg,
        }
    }
}

#[derive(Error, Debug)]
pub enum Text2SqlError {
    #[error("no schema index for database '{0}'")]
    IndexNotFound(String),

    #[error("schema index for database '{database_id}' was built with '{indexed_model}' but the active embedding model is '{current_model}'")]
    IndexStale {
        database_id: String,
        indexed_model: String,
        current_model: String,
    },

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("no SQL statement found in model response")]
    NoSqlFound,

    #[error("query blocked: {0}")]
    Blocked(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("database '{0}' is not configured")]
    DatabaseNotFound(String),

    #[error("no LLM configuration found for '{0}'")]
    LlmConfigNotFound(String),

    #[error("schema introspection failed: {0}")]
    Introspection(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Text2SqlError>;
