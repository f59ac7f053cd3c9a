//! Query Executor
//!
//! Runs already-validated SQL against a configured database with a row cap
//! and a statement timeout. Driver failures come back as
//! `ExecutionOutcome::Failed`; `execute` itself never errors.

use crate::db::DatabaseRegistry;
use crate::execution::result::ExecutionOutcome;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Extra time the async side waits past the database-side timeout.
const TIMEOUT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct ExecutionLimits {
    pub max_rows: usize,
    pub statement_timeout: Duration,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_rows: 500,
            statement_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct QueryExecutor {
    registry: Arc<DatabaseRegistry>,
    limits: ExecutionLimits,
}

impl QueryExecutor {
    pub fn new(registry: Arc<DatabaseRegistry>, limits: ExecutionLimits) -> Self {
        Self { registry, limits }
    }

    pub fn limits(&self) -> ExecutionLimits {
        self.limits
    }

    pub async fn execute(&self, database_id: &str, sql: &str) -> ExecutionOutcome {
        let backend = match self.registry.backend(database_id) {
            Ok(backend) => backend,
            Err(e) => {
                return ExecutionOutcome::Failed {
                    error_message: e.to_string(),
                }
            }
        };

        let started = Instant::now();
        let fetch = backend.fetch(sql, self.limits.max_rows, self.limits.statement_timeout);
        let outcome = match tokio::time::timeout(self.limits.statement_timeout + TIMEOUT_GRACE, fetch).await {
            Ok(Ok(set)) => ExecutionOutcome::success(set, started.elapsed().as_millis() as u64),
            Ok(Err(error_message)) => ExecutionOutcome::Failed { error_message },
            Err(_) => ExecutionOutcome::Failed {
                error_message: format!(
                    "statement timed out after {} ms",
                    self.limits.statement_timeout.as_millis()
                ),
            },
        };

        match &outcome {
            ExecutionOutcome::Success {
                row_count,
                truncated,
                elapsed_ms,
                ..
            } => info!(
                "Executed on '{}': {} row(s){} in {} ms",
                database_id,
                row_count,
                if *truncated { " (truncated)" } else { "" },
                elapsed_ms
            ),
            ExecutionOutcome::Failed { error_message } => {
                warn!("Execution on '{}' failed: {}", database_id, error_message)
            }
            ExecutionOutcome::Blocked { .. } => {}
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DatabaseKind, DatabaseProfile};
    use rusqlite::Connection;
    use serde_json::Value;

    fn executor(max_rows: usize) -> (tempfile::TempDir, QueryExecutor) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE events (id INTEGER PRIMARY KEY, kind TEXT);
             WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 50)
             INSERT INTO events (kind) SELECT 'click' FROM n;",
        )
        .unwrap();
        let registry = DatabaseRegistry::new(vec![DatabaseProfile::new(
            "events",
            DatabaseKind::Sqlite,
            path.to_str().unwrap(),
        )]);
        let limits = ExecutionLimits {
            max_rows,
            statement_timeout: Duration::from_secs(5),
        };
        (dir, QueryExecutor::new(Arc::new(registry), limits))
    }

    #[tokio::test]
    async fn test_row_cap_is_enforced() {
        let (_dir, executor) = executor(10);
        match executor.execute("events", "SELECT id, kind FROM events").await {
            ExecutionOutcome::Success {
                columns,
                rows,
                row_count,
                truncated,
                ..
            } => {
                assert_eq!(columns, vec!["id", "kind"]);
                assert_eq!(rows.len(), 10);
                assert_eq!(row_count, 10);
                assert!(truncated);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exact_fit_is_not_truncated() {
        let (_dir, executor) = executor(50);
        match executor.execute("events", "SELECT COUNT(*) AS count FROM events").await {
            ExecutionOutcome::Success { rows, truncated, .. } => {
                assert_eq!(rows, vec![vec![Value::from(50)]]);
                assert!(!truncated);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        match executor.execute("events", "SELECT id FROM events").await {
            ExecutionOutcome::Success { row_count, truncated, .. } => {
                assert_eq!(row_count, 50);
                assert!(!truncated);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_driver_errors_are_failed_outcomes() {
        let (_dir, executor) = executor(10);
        match executor.execute("events", "SELECT nope FROM missing_table").await {
            ExecutionOutcome::Failed { error_message } => assert!(error_message.contains("missing_table")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_database_is_failed_outcome() {
        let (_dir, executor) = executor(10);
        assert!(matches!(
            executor.execute("other", "SELECT 1").await,
            ExecutionOutcome::Failed { .. }
        ));
    }
}
