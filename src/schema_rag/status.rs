//! Embedding model load status.
//!
//! `Initializing -> Ready` on a successful load, `Initializing -> Failed` on a
//! load error. Terminal states never revert.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum EmbeddingModelState {
    Initializing,
    Ready,
    Failed(String),
}

/// Shared, process-wide view of the embedding model state.
#[derive(Debug, Clone)]
pub struct ModelStatus {
    state: Arc<RwLock<EmbeddingModelState>>,
}

impl ModelStatus {
    pub fn initializing() -> Self {
        Self {
            state: Arc::new(RwLock::new(EmbeddingModelState::Initializing)),
        }
    }

    /// Status for embedders that need no loading step.
    pub fn ready() -> Self {
        Self {
            state: Arc::new(RwLock::new(EmbeddingModelState::Ready)),
        }
    }

    pub fn state(&self) -> EmbeddingModelState {
        match self.state.read() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == EmbeddingModelState::Ready
    }

    /// Returns false when the state was already terminal.
    pub fn mark_ready(&self) -> bool {
        self.transition(EmbeddingModelState::Ready)
    }

    /// Returns false when the state was already terminal.
    pub fn mark_failed(&self, reason: impl Into<String>) -> bool {
        self.transition(EmbeddingModelState::Failed(reason.into()))
    }

    fn transition(&self, next: EmbeddingModelState) -> bool {
        let mut guard = match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *guard != EmbeddingModelState::Initializing {
            return false;
        }
        *guard = next;
        true
    }
}

impl Default for ModelStatus {
    fn default() -> Self {
        Self::initializing()
    }
}
