//! Execution Outcome - what happened when (or instead of) running generated SQL

use crate::db::RowSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success {
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
        /// Rows actually returned, after the row cap. Not the total match count.
        row_count: usize,
        /// The row cap cut the result short.
        truncated: bool,
        elapsed_ms: u64,
    },
    Blocked {
        reason: String,
    },
    Failed {
        error_message: String,
    },
}

impl ExecutionOutcome {
    pub fn success(set: RowSet, elapsed_ms: u64) -> Self {
        ExecutionOutcome::Success {
            row_count: set.rows.len(),
            columns: set.columns,
            rows: set.rows,
            truncated: set.truncated,
            elapsed_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }

    /// Human-readable reason for a non-success outcome.
    pub fn error_message(&self) -> Option<String> {
        match self {
            ExecutionOutcome::Success { .. } => None,
            ExecutionOutcome::Blocked { reason } => Some(format!("Query blocked: {}", reason)),
            ExecutionOutcome::Failed { error_message } => Some(format!("Execution failed: {}", error_message)),
        }
    }
}
