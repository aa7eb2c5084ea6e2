//! Short-lived cache for retrieval results.
//!
//! The cache sits between query rewriting and the vector index: each
//! rewritten query (per language) maps to the scored hits it produced.
//! Entries carry a TTL and expire passively, on the read path. Cache
//! failures are never fatal; callers fall through to the index and move
//! on.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rewrite::Language;

/// Errors raised by cache backends. Callers treat these as advisory.
#[derive(Debug, Error, Diagnostic)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    #[diagnostic(code(ragbridge::cache::backend))]
    Backend(String),
}

/// A scored index hit, as stored in the cache.
///
/// Chunk text is not cached; it is re-resolved from the index so cached
/// hits never serve stale passages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoredHit {
    pub chunk_id: String,
    pub document_id: String,
    pub score: f32,
}

/// Builds the cache key for a query in one language slot.
///
/// Normalization keeps trivially-different phrasings of the same query on
/// one entry: trim, lowercase, and collapse internal whitespace runs.
pub fn normalize_key(language: Language, query: &str) -> String {
    let mut collapsed = String::with_capacity(query.len());
    let mut last_was_space = false;
    for ch in query.trim().chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                collapsed.push(' ');
            }
            last_was_space = true;
        } else {
            for lower in ch.to_lowercase() {
                collapsed.push(lower);
            }
            last_was_space = false;
        }
    }
    format!("retrieval:{}:{}", language.tag(), collapsed)
}

/// Storage abstraction for retrieval results.
///
/// A `get` miss and an expired entry are indistinguishable to callers.
/// Empty hit lists are valid values: a query that found nothing is cached
/// the same as one that found plenty.
#[async_trait]
pub trait RetrievalCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<ScoredHit>>, CacheError>;

    async fn put(&self, key: &str, hits: &[ScoredHit], ttl: Duration) -> Result<(), CacheError>;
}

struct Entry {
    hits: Vec<ScoredHit>,
    expires_at: Instant,
}

/// Process-local [`RetrievalCache`] with passive expiry.
///
/// Expired entries are dropped when read; there is no background sweeper.
/// Clones share the same storage.
#[derive(Clone, Default)]
pub struct MemoryRetrievalCache {
    entries: std::sync::Arc<RwLock<FxHashMap<String, Entry>>>,
}

impl MemoryRetrievalCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RetrievalCache for MemoryRetrievalCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<ScoredHit>>, CacheError> {
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Ok(Some(entry.hits.clone()));
                }
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Expired entry: upgrade to a write lock and drop it.
        self.entries.write().remove(key);
        Ok(None)
    }

    async fn put(&self, key: &str, hits: &[ScoredHit], ttl: Duration) -> Result<(), CacheError> {
        self.entries.write().insert(
            key.to_string(),
            Entry {
                hits: hits.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }
}
