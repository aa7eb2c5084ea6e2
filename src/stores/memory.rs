//! In-memory vector index for tests and ephemeral setups.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use super::{ChunkRecord, DocumentMeta, DocumentStatus, IndexError, VectorIndex};

/// Process-local [`VectorIndex`] backed by hash maps.
///
/// Similarity is cosine over the stored embeddings, computed by brute
/// force. Clones share the same underlying storage.
#[derive(Clone, Default)]
pub struct MemoryVectorIndex {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    chunks: FxHashMap<String, ChunkRecord>,
    documents: FxHashMap<String, DocumentMeta>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn upsert_chunks(&self, chunks: Vec<ChunkRecord>) -> Result<(), IndexError> {
        let mut inner = self.inner.write();
        for chunk in chunks {
            if chunk.embedding.is_none() {
                return Err(IndexError::Storage(format!(
                    "chunk {} has no embedding",
                    chunk.id
                )));
            }
            inner.chunks.insert(chunk.id.clone(), chunk);
        }
        Ok(())
    }

    async fn delete_document_chunks(&self, document_id: &str) -> Result<usize, IndexError> {
        let mut inner = self.inner.write();
        let before = inner.chunks.len();
        inner.chunks.retain(|_, c| c.document_id != document_id);
        Ok(before - inner.chunks.len())
    }

    async fn search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        document_filter: Option<&str>,
    ) -> Result<Vec<(ChunkRecord, f32)>, IndexError> {
        let inner = self.inner.read();
        let mut scored: Vec<(ChunkRecord, f32)> = inner
            .chunks
            .values()
            .filter(|chunk| document_filter.is_none_or(|doc| chunk.document_id == doc))
            .filter_map(|chunk| {
                chunk
                    .embedding
                    .as_deref()
                    .map(|emb| (chunk.clone(), cosine_similarity(query_embedding, emb)))
            })
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.id.cmp(&b.0.id))
        });
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn chunk_by_id(&self, chunk_id: &str) -> Result<Option<ChunkRecord>, IndexError> {
        Ok(self.inner.read().chunks.get(chunk_id).cloned())
    }

    async fn count(&self) -> Result<usize, IndexError> {
        Ok(self.inner.read().chunks.len())
    }

    async fn upsert_document(&self, meta: DocumentMeta) -> Result<(), IndexError> {
        self.inner.write().documents.insert(meta.id.clone(), meta);
        Ok(())
    }

    async fn set_document_status(
        &self,
        document_id: &str,
        status: DocumentStatus,
    ) -> Result<(), IndexError> {
        let mut inner = self.inner.write();
        match inner.documents.get_mut(document_id) {
            Some(meta) => {
                meta.status = status;
                Ok(())
            }
            None => Err(IndexError::UnknownDocument {
                document_id: document_id.to_string(),
            }),
        }
    }

    async fn document(&self, document_id: &str) -> Result<Option<DocumentMeta>, IndexError> {
        Ok(self.inner.read().documents.get(document_id).cloned())
    }

    async fn list_documents(&self) -> Result<Vec<DocumentMeta>, IndexError> {
        let inner = self.inner.read();
        let mut docs: Vec<DocumentMeta> = inner.documents.values().cloned().collect();
        docs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(docs)
    }

    async fn delete_document(&self, document_id: &str) -> Result<(), IndexError> {
        let mut inner = self.inner.write();
        inner.documents.remove(document_id);
        inner.chunks.retain(|_, c| c.document_id != document_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, doc: &str, seq: usize, emb: Vec<f32>) -> ChunkRecord {
        ChunkRecord::new(id, doc, seq, format!("text {id}")).with_embedding(emb)
    }

    #[tokio::test]
    async fn upsert_replaces_by_id() {
        let index = MemoryVectorIndex::new();
        index
            .upsert_chunks(vec![chunk("c1", "d1", 0, vec![1.0, 0.0])])
            .await
            .unwrap();
        index
            .upsert_chunks(vec![chunk("c1", "d1", 0, vec![0.0, 1.0])])
            .await
            .unwrap();
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rejects_missing_embedding() {
        let index = MemoryVectorIndex::new();
        let err = index
            .upsert_chunks(vec![ChunkRecord::new("c1", "d1", 0, "no vector")])
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Storage(_)));
    }

    #[tokio::test]
    async fn search_orders_by_similarity() {
        let index = MemoryVectorIndex::new();
        index
            .upsert_chunks(vec![
                chunk("near", "d1", 0, vec![1.0, 0.0]),
                chunk("far", "d1", 1, vec![0.0, 1.0]),
                chunk("mid", "d1", 2, vec![0.7, 0.7]),
            ])
            .await
            .unwrap();
        let hits = index.search(&[1.0, 0.0], 2, None).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0.id, "near");
        assert_eq!(hits[1].0.id, "mid");
    }

    #[tokio::test]
    async fn search_scoped_to_one_document() {
        let index = MemoryVectorIndex::new();
        index
            .upsert_chunks(vec![
                chunk("a", "d1", 0, vec![1.0, 0.0]),
                chunk("b", "d2", 0, vec![1.0, 0.0]),
            ])
            .await
            .unwrap();
        let hits = index.search(&[1.0, 0.0], 5, Some("d2")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.id, "b");
    }

    #[tokio::test]
    async fn delete_document_removes_registry_and_chunks() {
        let index = MemoryVectorIndex::new();
        index
            .upsert_document(DocumentMeta::pending("d1", "a.txt"))
            .await
            .unwrap();
        index
            .upsert_chunks(vec![chunk("c1", "d1", 0, vec![1.0])])
            .await
            .unwrap();
        index.delete_document("d1").await.unwrap();
        assert!(index.document("d1").await.unwrap().is_none());
        assert_eq!(index.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn status_update_on_missing_document_errors() {
        let index = MemoryVectorIndex::new();
        let err = index
            .set_document_status("ghost", DocumentStatus::Processed)
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::UnknownDocument { .. }));
    }
}
