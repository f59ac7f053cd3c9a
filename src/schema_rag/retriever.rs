//! Schema Retriever
//!
//! Embeds questions and ranks indexed schema entries against them.
//! Indexing and retrieval go through the same `EmbeddingProvider`; the
//! provider's `model_id` is stamped on every record and checked on query.

use crate::error::{Result, Text2SqlError};
use crate::metadata::SchemaEntry;
use crate::schema_rag::embedder::EmbeddingProvider;
use crate::schema_rag::status::{EmbeddingModelState, ModelStatus};
use crate::schema_rag::vector_store::{RetrievalResult, SchemaIndex};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Schema retriever using embeddings
#[derive(Clone)]
pub struct RetrievalEngine {
    index: SchemaIndex,
    embedder: Arc<dyn EmbeddingProvider>,
    status: ModelStatus,
}

impl RetrievalEngine {
    pub fn new(index: SchemaIndex, embedder: Arc<dyn EmbeddingProvider>, status: ModelStatus) -> Self {
        Self {
            index,
            embedder,
            status,
        }
    }

    pub fn index(&self) -> &SchemaIndex {
        &self.index
    }

    pub fn status(&self) -> &ModelStatus {
        &self.status
    }

    pub fn model_id(&self) -> &str {
        self.embedder.model_id()
    }

    /// Probes the embedder once and settles the model status: `Ready` on
    /// success, `Failed` otherwise.
    pub async fn warm_up(&self) -> EmbeddingModelState {
        match self.embedder.embed("schema retrieval warm-up").await {
            Ok(vector) if !vector.is_empty() => {
                self.status.mark_ready();
                info!("Embedding model {} ready ({} dimensions)", self.model_id(), vector.len());
            }
            Ok(_) => {
                self.status.mark_failed("embedder returned an empty vector");
            }
            Err(e) => {
                warn!("Embedding model {} failed to load: {}", self.model_id(), e);
                self.status.mark_failed(e.to_string());
            }
        }
        self.status.state()
    }

    /// Embeds every entry's description and replaces the database's records.
    /// Returns the number of indexed entries.
    pub async fn index_database(&self, database_id: &str, entries: Vec<SchemaEntry>) -> Result<usize> {
        self.ensure_ready()?;
        let texts: Vec<String> = entries.iter().map(|e| e.description.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;
        if vectors.len() != entries.len() {
            return Err(Text2SqlError::Embedding(format!(
                "embedder returned {} vectors for {} schema entries",
                vectors.len(),
                entries.len()
            )));
        }
        let count = entries.len();
        self.index
            .index(database_id, self.embedder.model_id(), entries.into_iter().zip(vectors).collect())?;
        Ok(count)
    }

    /// Retrieve relevant schema for a question, highest similarity first.
    pub async fn retrieve(&self, database_id: &str, question: &str, top_k: usize) -> Result<RetrievalResult> {
        if top_k == 0 {
            return Err(Text2SqlError::InvalidRequest("top_k must be positive".to_string()));
        }
        self.ensure_ready()?;
        // fail fast before paying for an embedding call
        if !self.index.contains(database_id) {
            return Err(Text2SqlError::IndexNotFound(database_id.to_string()));
        }

        let query_vector = self.embedder.embed(question).await?;
        let results = self
            .index
            .query(database_id, self.embedder.model_id(), &query_vector, top_k)?;

        info!("Retrieved {} schema entries for database '{}'", results.len(), database_id);
        for r in &results {
            debug!("  {} (score {:.4})", r.entry.name, r.score);
        }
        Ok(results)
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.status.state() {
            EmbeddingModelState::Ready => Ok(()),
            EmbeddingModelState::Initializing => {
                Err(Text2SqlError::Embedding("embedding model is still loading".to_string()))
            }
            EmbeddingModelState::Failed(reason) => {
                Err(Text2SqlError::Embedding(format!("embedding model failed to load: {}", reason)))
            }
        }
    }
}
