//! Storage backends for chunk vectors and the document registry.
//!
//! The [`VectorIndex`] trait abstracts over storage implementations so the
//! ingestion pipeline and retrieval engine can run against any supported
//! backend. The registry of uploaded documents is colocated with the chunk
//! vectors: deleting a document removes its metadata and every derived
//! chunk in one call.
//!
//! ```text
//!                  ┌──────────────────┐
//!                  │ VectorIndex trait│
//!                  │   (async CRUD)   │
//!                  └────────┬─────────┘
//!                           │
//!              ┌────────────┴────────────┐
//!              ▼                         ▼
//!       ┌─────────────┐          ┌──────────────┐
//!       │   SQLite    │          │  In-memory   │
//!       │ sqlite-vec  │          │ parking_lot  │
//!       └─────────────┘          └──────────────┘
//! ```

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryVectorIndex;
pub use sqlite::SqliteVectorIndex;

/// Errors raised by vector index backends.
#[derive(Debug, Error, Diagnostic)]
pub enum IndexError {
    /// The backing store failed or is unreachable.
    #[error("vector index storage error: {0}")]
    #[diagnostic(code(ragbridge::stores::storage))]
    Storage(String),

    /// A referenced document does not exist.
    #[error("unknown document: {document_id}")]
    #[diagnostic(code(ragbridge::stores::unknown_document))]
    UnknownDocument { document_id: String },
}

/// Lifecycle state of an uploaded document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Processed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "processed" => Some(Self::Processed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Registry entry for an uploaded document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub id: String,
    pub filename: String,
    pub status: DocumentStatus,
    pub created_at: DateTime<Utc>,
}

impl DocumentMeta {
    /// Creates a pending registry entry timestamped now.
    pub fn pending(id: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            filename: filename.into(),
            status: DocumentStatus::Pending,
            created_at: Utc::now(),
        }
    }
}

/// A chunk with its embedding, ready for storage.
///
/// Chunks are immutable once written; they are only ever removed together
/// with their parent document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Unique identifier for this chunk.
    pub id: String,
    /// Parent document (back-reference, not ownership).
    pub document_id: String,
    /// Zero-based position within the document.
    pub sequence_index: usize,
    /// The passage text.
    pub text: String,
    /// Optional language tag ("en", "ja") when the source language is known.
    pub language_hint: Option<String>,
    /// The embedding vector, when computed.
    pub embedding: Option<Vec<f32>>,
}

impl ChunkRecord {
    /// Creates a chunk record without an embedding.
    pub fn new(
        id: impl Into<String>,
        document_id: impl Into<String>,
        sequence_index: usize,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            document_id: document_id.into(),
            sequence_index,
            text: text.into(),
            language_hint: None,
            embedding: None,
        }
    }

    /// Sets the embedding vector.
    #[must_use]
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Sets the language hint.
    #[must_use]
    pub fn with_language_hint(mut self, hint: impl Into<String>) -> Self {
        self.language_hint = Some(hint.into());
        self
    }
}

/// Unified trait for chunk vector storage plus the document registry.
///
/// Similarity search runs over the full language-agnostic corpus; the
/// caller supplies an already-embedded query vector and receives chunks
/// ordered most-similar-first.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Inserts or replaces chunk records keyed by chunk id.
    ///
    /// Records without embeddings are rejected by vector-backed stores.
    async fn upsert_chunks(&self, chunks: Vec<ChunkRecord>) -> Result<(), IndexError>;

    /// Removes every chunk derived from `document_id`. Returns the number
    /// of chunks removed. The document registry entry is untouched.
    async fn delete_document_chunks(&self, document_id: &str) -> Result<usize, IndexError>;

    /// Similarity search over the corpus.
    ///
    /// `document_filter` restricts candidates to one document; `None`
    /// searches everything.
    async fn search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        document_filter: Option<&str>,
    ) -> Result<Vec<(ChunkRecord, f32)>, IndexError>;

    /// Fetches one chunk by id.
    async fn chunk_by_id(&self, chunk_id: &str) -> Result<Option<ChunkRecord>, IndexError>;

    /// Total number of stored chunks.
    async fn count(&self) -> Result<usize, IndexError>;

    /// Inserts or replaces a document registry entry.
    async fn upsert_document(&self, meta: DocumentMeta) -> Result<(), IndexError>;

    /// Updates the lifecycle status of a registered document.
    async fn set_document_status(
        &self,
        document_id: &str,
        status: DocumentStatus,
    ) -> Result<(), IndexError>;

    /// Fetches one document registry entry.
    async fn document(&self, document_id: &str) -> Result<Option<DocumentMeta>, IndexError>;

    /// Lists registered documents, newest first.
    async fn list_documents(&self) -> Result<Vec<DocumentMeta>, IndexError>;

    /// Removes a document registry entry and all of its chunks.
    async fn delete_document(&self, document_id: &str) -> Result<(), IndexError>;
}
