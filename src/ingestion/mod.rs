//! Document ingestion: extract, chunk, embed, store.
//!
//! Ingestion is idempotent per document id and all-or-nothing per run:
//! a re-ingest first clears the previous chunks, and any failure after
//! the document is registered rolls back partial chunk writes and marks
//! the registry entry failed. A later retry with the same id starts
//! clean.

use std::sync::Arc;
use std::time::Duration;

use miette::Diagnostic;
use rand::Rng;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::chunker::{ChunkerConfig, ChunkingError, TextChunker};
use crate::embeddings::{EmbeddingError, EmbeddingProvider};
use crate::extract::{ExtractionError, TextExtractor};
use crate::stores::{ChunkRecord, DocumentMeta, DocumentStatus, IndexError, VectorIndex};

/// Errors surfaced by the ingestion pipeline.
#[derive(Debug, Error, Diagnostic)]
pub enum IngestError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Chunking(#[from] ChunkingError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Index(#[from] IndexError),
}

/// Tuning knobs for the embedding stage.
#[derive(Clone, Copy, Debug)]
pub struct IngestOptions {
    /// Chunks embedded per provider call.
    pub embed_batch_size: usize,
    /// Attempts per batch before the run fails.
    pub embed_retry_limit: usize,
    /// Base delay for the exponential backoff between attempts.
    pub embed_retry_base_delay: Duration,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            embed_batch_size: 16,
            embed_retry_limit: 3,
            embed_retry_base_delay: Duration::from_millis(250),
        }
    }
}

/// Summary of a completed ingestion run.
#[derive(Clone, Debug)]
pub struct IngestReport {
    pub document_id: String,
    pub chunk_count: usize,
    /// Chunks removed from a previous run with the same document id.
    pub replaced_chunks: usize,
}

/// Orchestrates the extract, chunk, embed, store sequence.
pub struct IngestionPipeline {
    extractor: TextExtractor,
    chunker: TextChunker,
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    options: IngestOptions,
}

impl IngestionPipeline {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        chunker_config: ChunkerConfig,
        options: IngestOptions,
    ) -> Result<Self, IngestError> {
        Ok(Self {
            extractor: TextExtractor::new(),
            chunker: TextChunker::new(chunker_config)?,
            embedder,
            index,
            options,
        })
    }

    /// Ingests one document, replacing any chunks from a prior run.
    ///
    /// On failure the index holds no partial chunks for this document and
    /// its registry entry reads `failed`.
    pub async fn ingest(
        &self,
        document_id: &str,
        bytes: &[u8],
        filename: &str,
    ) -> Result<IngestReport, IngestError> {
        let replaced_chunks = self.index.delete_document_chunks(document_id).await?;
        if replaced_chunks > 0 {
            info!(document_id, replaced_chunks, "re-ingesting document");
        }
        self.index
            .upsert_document(DocumentMeta::pending(document_id, filename))
            .await?;

        match self.run_stages(document_id, bytes, filename).await {
            Ok(chunk_count) => {
                self.index
                    .set_document_status(document_id, DocumentStatus::Processed)
                    .await?;
                info!(document_id, chunk_count, "document ingested");
                Ok(IngestReport {
                    document_id: document_id.to_string(),
                    chunk_count,
                    replaced_chunks,
                })
            }
            Err(err) => {
                warn!(document_id, error = %err, "ingestion failed, rolling back");
                if let Err(rollback_err) = self.index.delete_document_chunks(document_id).await {
                    warn!(document_id, error = %rollback_err, "chunk rollback failed");
                }
                if let Err(status_err) = self
                    .index
                    .set_document_status(document_id, DocumentStatus::Failed)
                    .await
                {
                    warn!(document_id, error = %status_err, "failed-status update failed");
                }
                Err(err)
            }
        }
    }

    /// Removes a document and everything derived from it.
    pub async fn delete_document(&self, document_id: &str) -> Result<(), IngestError> {
        self.index.delete_document(document_id).await?;
        info!(document_id, "document deleted");
        Ok(())
    }

    async fn run_stages(
        &self,
        document_id: &str,
        bytes: &[u8],
        filename: &str,
    ) -> Result<usize, IngestError> {
        let text = self.extractor.extract(bytes, filename)?;
        let passages = self.chunker.chunk(&text)?;

        let mut records = Vec::with_capacity(passages.len());
        for (sequence_index, passage) in passages.iter().enumerate() {
            records.push(ChunkRecord::new(
                Uuid::new_v4().to_string(),
                document_id,
                sequence_index,
                passage.clone(),
            ));
        }

        for batch_start in (0..records.len()).step_by(self.options.embed_batch_size.max(1)) {
            let batch_end = (batch_start + self.options.embed_batch_size.max(1)).min(records.len());
            let texts: Vec<String> = records[batch_start..batch_end]
                .iter()
                .map(|record| record.text.clone())
                .collect();
            let embeddings = self.embed_with_retry(&texts).await?;
            for (record, embedding) in records[batch_start..batch_end].iter_mut().zip(embeddings) {
                record.embedding = Some(embedding);
            }
        }

        let chunk_count = records.len();
        // Single upsert after all batches embed, so a mid-run embedding
        // failure leaves nothing to roll back in the index.
        self.index.upsert_chunks(records).await?;
        Ok(chunk_count)
    }

    /// Embeds one batch, retrying transient failures with jittered
    /// exponential backoff.
    async fn embed_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let attempts = self.options.embed_retry_limit.max(1);
        let mut last_err = None;
        for attempt in 0..attempts {
            match self.embedder.embed_batch(texts).await {
                Ok(embeddings) => return Ok(embeddings),
                Err(err) => {
                    warn!(attempt, error = %err, "embedding batch failed");
                    last_err = Some(err);
                    if attempt + 1 < attempts {
                        let backoff = self.options.embed_retry_base_delay * 2u32.pow(attempt as u32);
                        let jitter = Duration::from_millis(rand::rng().random_range(0..50));
                        tokio::time::sleep(backoff + jitter).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| EmbeddingError::Transport("no attempts made".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::MockEmbeddingProvider;
    use crate::stores::MemoryVectorIndex;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pipeline(index: MemoryVectorIndex) -> IngestionPipeline {
        IngestionPipeline::new(
            Arc::new(MockEmbeddingProvider::default()),
            Arc::new(index),
            ChunkerConfig::default(),
            IngestOptions {
                embed_retry_base_delay: Duration::from_millis(1),
                ..IngestOptions::default()
            },
        )
        .unwrap()
    }

    /// Fails a configurable number of times before succeeding.
    struct FlakyEmbedder {
        inner: MockEmbeddingProvider,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyEmbedder {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(EmbeddingError::Transport("flaky".to_string()));
            }
            self.inner.embed_batch(texts).await
        }
    }

    #[tokio::test]
    async fn ingest_registers_and_stores_chunks() {
        let index = MemoryVectorIndex::new();
        let pipeline = pipeline(index.clone());
        let report = pipeline
            .ingest("doc-1", b"How to reset your password.\n\nVisit settings.", "faq.txt")
            .await
            .unwrap();
        assert!(report.chunk_count > 0);
        assert_eq!(report.replaced_chunks, 0);
        assert_eq!(index.count().await.unwrap(), report.chunk_count);
        let meta = index.document("doc-1").await.unwrap().unwrap();
        assert_eq!(meta.status, DocumentStatus::Processed);
    }

    #[tokio::test]
    async fn reingest_replaces_previous_chunks() {
        let index = MemoryVectorIndex::new();
        let pipeline = pipeline(index.clone());
        let first = pipeline
            .ingest("doc-1", b"Original content about billing.", "faq.txt")
            .await
            .unwrap();
        let second = pipeline
            .ingest("doc-1", b"Replacement content about refunds.", "faq.txt")
            .await
            .unwrap();
        assert_eq!(second.replaced_chunks, first.chunk_count);
        assert_eq!(index.count().await.unwrap(), second.chunk_count);
    }

    #[tokio::test]
    async fn failure_rolls_back_and_marks_failed() {
        let index = MemoryVectorIndex::new();
        let pipeline = pipeline(index.clone());
        // Empty payload fails at extraction (after registration).
        let err = pipeline.ingest("doc-1", b"", "faq.txt").await.unwrap_err();
        assert!(matches!(err, IngestError::Chunking(_)) || matches!(err, IngestError::Extraction(_)));
        assert_eq!(index.count().await.unwrap(), 0);
        let meta = index.document("doc-1").await.unwrap().unwrap();
        assert_eq!(meta.status, DocumentStatus::Failed);
    }

    #[tokio::test]
    async fn transient_embedding_failures_are_retried() {
        let index = MemoryVectorIndex::new();
        let pipeline = IngestionPipeline::new(
            Arc::new(FlakyEmbedder {
                inner: MockEmbeddingProvider::default(),
                failures_left: AtomicUsize::new(2),
            }),
            Arc::new(index.clone()),
            ChunkerConfig::default(),
            IngestOptions {
                embed_retry_limit: 3,
                embed_retry_base_delay: Duration::from_millis(1),
                ..IngestOptions::default()
            },
        )
        .unwrap();
        let report = pipeline
            .ingest("doc-1", b"Some durable content.", "notes.txt")
            .await
            .unwrap();
        assert!(report.chunk_count > 0);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_run() {
        let index = MemoryVectorIndex::new();
        let pipeline = IngestionPipeline::new(
            Arc::new(FlakyEmbedder {
                inner: MockEmbeddingProvider::default(),
                failures_left: AtomicUsize::new(usize::MAX),
            }),
            Arc::new(index.clone()),
            ChunkerConfig::default(),
            IngestOptions {
                embed_retry_limit: 2,
                embed_retry_base_delay: Duration::from_millis(1),
                ..IngestOptions::default()
            },
        )
        .unwrap();
        let err = pipeline
            .ingest("doc-1", b"Some content.", "notes.txt")
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Embedding(_)));
        assert_eq!(index.count().await.unwrap(), 0);
        assert_eq!(
            index.document("doc-1").await.unwrap().unwrap().status,
            DocumentStatus::Failed
        );
    }

    #[tokio::test]
    async fn delete_document_clears_registry_and_chunks() {
        let index = MemoryVectorIndex::new();
        let pipeline = pipeline(index.clone());
        pipeline
            .ingest("doc-1", b"Content to remove later.", "notes.txt")
            .await
            .unwrap();
        pipeline.delete_document("doc-1").await.unwrap();
        assert_eq!(index.count().await.unwrap(), 0);
        assert!(index.document("doc-1").await.unwrap().is_none());
    }
}
