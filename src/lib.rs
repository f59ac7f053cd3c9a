pub mod api;
pub mod config;
pub mod error;
pub mod execution;
pub mod llm;
pub mod metadata;
pub mod observability;
pub mod pipeline;
pub mod prompt;
pub mod safety_guardrails;
pub mod schema_rag;
pub mod sql_extractor;

// Target databases (PostgreSQL, SQLite)
pub mod db;

pub use config::AppConfig;
pub use error::{ProviderError, Result, Text2SqlError};
pub use pipeline::{QueryResponse, Text2SqlPipeline};
