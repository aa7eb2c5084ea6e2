//! End-to-end coverage for ingestion and cached bilingual retrieval,
//! driven by deterministic mock embeddings and in-process backends.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ragbridge::cache::MemoryRetrievalCache;
use ragbridge::chunker::ChunkerConfig;
use ragbridge::embeddings::{EmbeddingError, EmbeddingProvider, MockEmbeddingProvider};
use ragbridge::ingestion::{IngestOptions, IngestionPipeline};
use ragbridge::llm::{ScriptedChatModel, ScriptedReply};
use ragbridge::retrieval::{MergeStrategy, RetrievalEngine, RetrievalOptions};
use ragbridge::rewrite::QueryRewriter;
use ragbridge::stores::{
    ChunkRecord, DocumentMeta, DocumentStatus, IndexError, MemoryVectorIndex, VectorIndex,
};

/// Counts embed calls so cache-hit paths can be asserted backend-free.
struct CountingEmbedder {
    inner: MockEmbeddingProvider,
    calls: AtomicUsize,
}

impl CountingEmbedder {
    fn new() -> Self {
        Self {
            inner: MockEmbeddingProvider::default(),
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for CountingEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.embed_batch(texts).await
    }
}

/// Delegating index that counts similarity searches.
struct CountingIndex {
    inner: MemoryVectorIndex,
    searches: AtomicUsize,
}

impl CountingIndex {
    fn new(inner: MemoryVectorIndex) -> Self {
        Self {
            inner,
            searches: AtomicUsize::new(0),
        }
    }

    fn searches(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VectorIndex for CountingIndex {
    async fn upsert_chunks(&self, chunks: Vec<ChunkRecord>) -> Result<(), IndexError> {
        self.inner.upsert_chunks(chunks).await
    }

    async fn delete_document_chunks(&self, document_id: &str) -> Result<usize, IndexError> {
        self.inner.delete_document_chunks(document_id).await
    }

    async fn search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        document_filter: Option<&str>,
    ) -> Result<Vec<(ChunkRecord, f32)>, IndexError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        self.inner
            .search(query_embedding, top_k, document_filter)
            .await
    }

    async fn chunk_by_id(&self, chunk_id: &str) -> Result<Option<ChunkRecord>, IndexError> {
        self.inner.chunk_by_id(chunk_id).await
    }

    async fn count(&self) -> Result<usize, IndexError> {
        self.inner.count().await
    }

    async fn upsert_document(&self, meta: DocumentMeta) -> Result<(), IndexError> {
        self.inner.upsert_document(meta).await
    }

    async fn set_document_status(
        &self,
        document_id: &str,
        status: DocumentStatus,
    ) -> Result<(), IndexError> {
        self.inner.set_document_status(document_id, status).await
    }

    async fn document(&self, document_id: &str) -> Result<Option<DocumentMeta>, IndexError> {
        self.inner.document(document_id).await
    }

    async fn list_documents(&self) -> Result<Vec<DocumentMeta>, IndexError> {
        self.inner.list_documents().await
    }

    async fn delete_document(&self, document_id: &str) -> Result<(), IndexError> {
        self.inner.delete_document(document_id).await
    }
}

fn rewrite_reply(english: &str, japanese: &str) -> ScriptedReply {
    ScriptedReply::Text(format!(
        r#"{{"english": "{english}", "japanese": "{japanese}"}}"#
    ))
}

async fn ingest_fixture(index: &MemoryVectorIndex) {
    let pipeline = IngestionPipeline::new(
        Arc::new(MockEmbeddingProvider::default()),
        Arc::new(index.clone()),
        ChunkerConfig::default(),
        IngestOptions::default(),
    )
    .unwrap();
    pipeline
        .ingest(
            "doc-passwords",
            b"To reset your password, open Settings and choose Reset Password.\n\n\
              A confirmation email arrives within five minutes.",
            "passwords.md",
        )
        .await
        .unwrap();
    pipeline
        .ingest(
            "doc-billing",
            b"Invoices are issued on the first business day of each month.\n\n\
              Refunds complete within ten days.",
            "billing.md",
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn reingest_same_document_is_idempotent() {
    let index = MemoryVectorIndex::new();
    let pipeline = IngestionPipeline::new(
        Arc::new(MockEmbeddingProvider::default()),
        Arc::new(index.clone()),
        ChunkerConfig::default(),
        IngestOptions::default(),
    )
    .unwrap();

    let payload = b"To reset your password, open Settings.".as_slice();
    let first = pipeline.ingest("doc-1", payload, "faq.md").await.unwrap();
    let second = pipeline.ingest("doc-1", payload, "faq.md").await.unwrap();

    assert_eq!(first.chunk_count, second.chunk_count);
    assert_eq!(second.replaced_chunks, first.chunk_count);
    assert_eq!(index.count().await.unwrap(), second.chunk_count);
    assert_eq!(index.list_documents().await.unwrap().len(), 1);
}

#[tokio::test]
async fn repeat_query_within_ttl_hits_no_backends() {
    let index = MemoryVectorIndex::new();
    ingest_fixture(&index).await;

    let embedder = Arc::new(CountingEmbedder::new());
    let counting_index = Arc::new(CountingIndex::new(index));
    // Identical rewrites both times keep the cache keys stable.
    let model = Arc::new(ScriptedChatModel::new(vec![
        rewrite_reply("reset password", "パスワードをリセット"),
        rewrite_reply("reset password", "パスワードをリセット"),
    ]));
    let engine = RetrievalEngine::new(
        QueryRewriter::new(model),
        embedder.clone(),
        counting_index.clone(),
        Arc::new(MemoryRetrievalCache::new()),
        RetrievalOptions::default(),
    );

    let first = engine.retrieve("how do I reset my password").await;
    assert!(!first.is_empty());
    let embeds_after_first = embedder.calls();
    let searches_after_first = counting_index.searches();
    assert!(embeds_after_first > 0);
    assert!(searches_after_first > 0);

    let second = engine.retrieve("how do I reset my password").await;
    assert_eq!(embedder.calls(), embeds_after_first);
    assert_eq!(counting_index.searches(), searches_after_first);

    let first_ids: Vec<&str> = first.chunks.iter().map(|c| c.chunk_id.as_str()).collect();
    let second_ids: Vec<&str> = second.chunks.iter().map(|c| c.chunk_id.as_str()).collect();
    assert_eq!(first_ids, second_ids);
}

#[tokio::test]
async fn expired_cache_entries_trigger_fresh_lookups() {
    let index = MemoryVectorIndex::new();
    ingest_fixture(&index).await;

    let counting_index = Arc::new(CountingIndex::new(index));
    let model = Arc::new(ScriptedChatModel::new(vec![
        rewrite_reply("billing invoices", "請求書"),
        rewrite_reply("billing invoices", "請求書"),
    ]));
    let engine = RetrievalEngine::new(
        QueryRewriter::new(model),
        Arc::new(MockEmbeddingProvider::default()),
        counting_index.clone(),
        Arc::new(MemoryRetrievalCache::new()),
        RetrievalOptions {
            cache_ttl: Duration::ZERO,
            ..RetrievalOptions::default()
        },
    );

    engine.retrieve("when are invoices issued").await;
    let after_first = counting_index.searches();
    engine.retrieve("when are invoices issued").await;
    assert!(counting_index.searches() > after_first);
}

#[tokio::test]
async fn merge_is_deterministic_across_runs() {
    let index = MemoryVectorIndex::new();
    ingest_fixture(&index).await;

    let mut orderings = Vec::new();
    for _ in 0..3 {
        let model = Arc::new(ScriptedChatModel::new(vec![rewrite_reply(
            "password reset email",
            "password confirmation",
        )]));
        let engine = RetrievalEngine::new(
            QueryRewriter::new(model),
            Arc::new(MockEmbeddingProvider::default()),
            Arc::new(index.clone()),
            Arc::new(MemoryRetrievalCache::new()),
            RetrievalOptions {
                merge: MergeStrategy::Sum,
                ..RetrievalOptions::default()
            },
        );
        let result = engine.retrieve("password reset").await;
        let ids: Vec<String> = result.chunks.iter().map(|c| c.chunk_id.clone()).collect();
        orderings.push(ids);
    }
    assert_eq!(orderings[0], orderings[1]);
    assert_eq!(orderings[1], orderings[2]);
}

#[tokio::test]
async fn empty_corpus_returns_empty_not_error() {
    let model = Arc::new(ScriptedChatModel::new(vec![rewrite_reply(
        "anything", "何でも",
    )]));
    let engine = RetrievalEngine::new(
        QueryRewriter::new(model),
        Arc::new(MockEmbeddingProvider::default()),
        Arc::new(MemoryVectorIndex::new()),
        Arc::new(MemoryRetrievalCache::new()),
        RetrievalOptions::default(),
    );
    let result = engine.retrieve("anything at all").await;
    assert!(result.is_empty());
    assert!(result.document_ids.is_empty());
}

#[tokio::test]
async fn zero_result_lookups_are_cached_too() {
    let counting_index = Arc::new(CountingIndex::new(MemoryVectorIndex::new()));
    let model = Arc::new(ScriptedChatModel::new(vec![
        rewrite_reply("ghost topic", "ghost topic"),
        rewrite_reply("ghost topic", "ghost topic"),
    ]));
    let engine = RetrievalEngine::new(
        QueryRewriter::new(model),
        Arc::new(MockEmbeddingProvider::default()),
        counting_index.clone(),
        Arc::new(MemoryRetrievalCache::new()),
        RetrievalOptions::default(),
    );

    engine.retrieve("ghost topic").await;
    let after_first = counting_index.searches();
    engine.retrieve("ghost topic").await;
    // The empty result was cached, so no further index traffic.
    assert_eq!(counting_index.searches(), after_first);
}

#[tokio::test]
async fn deleting_a_document_removes_it_from_results() {
    let index = MemoryVectorIndex::new();
    ingest_fixture(&index).await;

    let pipeline = IngestionPipeline::new(
        Arc::new(MockEmbeddingProvider::default()),
        Arc::new(index.clone()),
        ChunkerConfig::default(),
        IngestOptions::default(),
    )
    .unwrap();
    pipeline.delete_document("doc-passwords").await.unwrap();

    let model = Arc::new(ScriptedChatModel::new(vec![rewrite_reply(
        "reset password",
        "パスワードをリセット",
    )]));
    let engine = RetrievalEngine::new(
        QueryRewriter::new(model),
        Arc::new(MockEmbeddingProvider::default()),
        Arc::new(index),
        Arc::new(MemoryRetrievalCache::new()),
        RetrievalOptions::default(),
    );
    let result = engine.retrieve("reset password").await;
    assert!(
        result
            .chunks
            .iter()
            .all(|c| c.document_id != "doc-passwords")
    );
}
