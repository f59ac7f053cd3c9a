//! Schema RAG
//!
//! Embedding-backed schema retrieval: embedders, the per-database schema
//! index, the embedding model status, and the retrieval engine on top.

pub mod embedder;
pub mod retriever;
pub mod status;
pub mod vector_store;

pub use embedder::{EmbeddingProvider, HashingEmbedder, OpenAiEmbedder};
pub use retriever::RetrievalEngine;
pub use status::{EmbeddingModelState, ModelStatus};
pub use vector_store::{cosine_similarity, Embedding, EmbeddingRecord, RetrievalResult, SchemaIndex, ScoredEntry};
