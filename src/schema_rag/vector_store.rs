//! Schema Index
//!
//! In-memory vector store of schema embeddings, one record set per database.
//! Indexing a database replaces its previous records wholesale; there is no
//! incremental merge, so dropped tables and columns never linger.
//!
//! Search is an exact linear scan with cosine similarity. Schemas hold tens to
//! low thousands of tables, well within linear-scan territory.

use crate::error::{Result, Text2SqlError};
use crate::metadata::SchemaEntry;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Vector embedding (simple f32 vector)
pub type Embedding = Vec<f32>;

/// One embedded schema entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    /// Position of the entry in introspection order.
    pub schema_entry_id: usize,
    pub vector: Embedding,
    pub source_database_id: String,
    /// Identity of the embedding model that produced `vector`.
    pub embedding_model: String,
}

/// All records for one database, built in a single `index` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedDatabase {
    pub database_id: String,
    pub embedding_model: String,
    pub dimension: usize,
    pub entries: Vec<SchemaEntry>,
    pub records: Vec<EmbeddingRecord>,
    pub indexed_at: DateTime<Utc>,
}

/// A retrieved schema entry with its similarity to the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredEntry {
    pub entry: SchemaEntry,
    pub score: f32,
}

/// Ranked retrieval output, highest similarity first.
pub type RetrievalResult = Vec<ScoredEntry>;

#[derive(Debug, Default, Clone)]
pub struct SchemaIndex {
    databases: Arc<DashMap<String, Arc<IndexedDatabase>>>,
}

impl SchemaIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces every record for `database_id`.
    ///
    /// `embedded` pairs each entry with its vector, in introspection order.
    /// All vectors must share one dimension.
    pub fn index(
        &self,
        database_id: &str,
        embedding_model: &str,
        embedded: Vec<(SchemaEntry, Embedding)>,
    ) -> Result<()> {
        let dimension = embedded.first().map(|(_, v)| v.len()).unwrap_or(0);
        if let Some((entry, vector)) = embedded.iter().find(|(_, v)| v.len() != dimension) {
            return Err(Text2SqlError::Embedding(format!(
                "embedding for table '{}' has dimension {}, expected {}",
                entry.name,
                vector.len(),
                dimension
            )));
        }

        let mut entries = Vec::with_capacity(embedded.len());
        let mut records = Vec::with_capacity(embedded.len());
        for (position, (entry, vector)) in embedded.into_iter().enumerate() {
            entries.push(entry);
            records.push(EmbeddingRecord {
                schema_entry_id: position,
                vector,
                source_database_id: database_id.to_string(),
                embedding_model: embedding_model.to_string(),
            });
        }

        info!(
            "Indexed {} schema entries for database '{}' with {}",
            entries.len(),
            database_id,
            embedding_model
        );
        self.databases.insert(
            database_id.to_string(),
            Arc::new(IndexedDatabase {
                database_id: database_id.to_string(),
                embedding_model: embedding_model.to_string(),
                dimension,
                entries,
                records,
                indexed_at: Utc::now(),
            }),
        );
        Ok(())
    }

    /// Ranks the entries of `database_id` against `query_vector`.
    ///
    /// Ties keep introspection order. `embedding_model` must match the model
    /// the database was indexed with.
    pub fn query(
        &self,
        database_id: &str,
        embedding_model: &str,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<RetrievalResult> {
        let indexed = self
            .get(database_id)
            .ok_or_else(|| Text2SqlError::IndexNotFound(database_id.to_string()))?;

        if indexed.embedding_model != embedding_model {
            return Err(Text2SqlError::IndexStale {
                database_id: database_id.to_string(),
                indexed_model: indexed.embedding_model.clone(),
                current_model: embedding_model.to_string(),
            });
        }
        if !indexed.records.is_empty() && query_vector.len() != indexed.dimension {
            return Err(Text2SqlError::Embedding(format!(
                "query embedding dimension {} doesn't match index dimension {}",
                query_vector.len(),
                indexed.dimension
            )));
        }

        let mut scored: Vec<(usize, f32)> = indexed
            .records
            .iter()
            .map(|r| (r.schema_entry_id, cosine_similarity(query_vector, &r.vector)))
            .collect();
        // sort_by is stable, so equal scores keep introspection order
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .map(|(id, score)| ScoredEntry {
                entry: indexed.entries[id].clone(),
                score,
            })
            .collect())
    }

    pub fn get(&self, database_id: &str) -> Option<Arc<IndexedDatabase>> {
        self.databases.get(database_id).map(|e| Arc::clone(e.value()))
    }

    pub fn contains(&self, database_id: &str) -> bool {
        self.databases.contains_key(database_id)
    }

    pub fn remove(&self, database_id: &str) -> bool {
        self.databases.remove(database_id).is_some()
    }

    pub fn database_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.databases.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Writes the whole index to `path` as JSON.
    /// Writes to a sibling temp file and renames it over `path`, so readers
    /// never see a partial index. Blocking; call from `spawn_blocking` on
    /// async paths.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let snapshot: BTreeMap<String, IndexedDatabase> = self
            .databases
            .iter()
            .map(|e| (e.key().clone(), e.value().as_ref().clone()))
            .collect();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let encoded = serde_json::to_string(&PersistedIndex {
            version: PERSISTED_VERSION,
            databases: snapshot,
        })?;
        let file_name = path
            .file_name()
            .ok_or_else(|| Text2SqlError::Config(format!("index path {} has no file name", path.display())))?;
        let tmp = path.with_file_name(format!("{}.{}.tmp", file_name.to_string_lossy(), Uuid::new_v4()));
        std::fs::write(&tmp, encoded)?;
        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    /// Loads an index written by `save`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let encoded = std::fs::read_to_string(path)?;
        let persisted: PersistedIndex = serde_json::from_str(&encoded)?;
        if persisted.version != PERSISTED_VERSION {
            return Err(Text2SqlError::Config(format!(
                "unsupported schema index format version {}",
                persisted.version
            )));
        }
        let index = Self::new();
        for (id, db) in persisted.databases {
            index.databases.insert(id, Arc::new(db));
        }
        Ok(index)
    }
}

const PERSISTED_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct PersistedIndex {
    version: u32,
    databases: BTreeMap<String, IndexedDatabase>,
}

/// Compute cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}
