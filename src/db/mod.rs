//! Database module for target database connections
//!
//! A `SqlBackend` introspects one target database and runs read-only
//! statements against it. Backends are created lazily by the
//! `DatabaseRegistry` from configured `DatabaseProfile`s.

pub mod connection;
pub mod postgres;
pub mod sqlite;

use crate::error::Result;
use crate::metadata::SchemaEntry;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

pub use connection::{DatabaseKind, DatabaseProfile, DatabaseRegistry};
pub use postgres::PostgresBackend;
pub use sqlite::SqliteBackend;

/// Rows read from a statement, at most the requested cap.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// More rows were available than the cap allowed.
    pub truncated: bool,
}

#[async_trait]
pub trait SqlBackend: Send + Sync {
    /// Human-readable dialect name, used in prompts.
    fn dialect(&self) -> &str;

    /// Current tables in introspection order.
    async fn introspect(&self) -> Result<Vec<SchemaEntry>>;

    /// Runs `sql` on its own connection, reading at most `max_rows` rows.
    /// Errors are the raw driver messages.
    async fn fetch(&self, sql: &str, max_rows: usize, timeout: Duration) -> std::result::Result<RowSet, String>;
}
