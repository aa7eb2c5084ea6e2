//! Cached bilingual retrieval over the vector index.
//!
//! A query is rewritten into English and Japanese variants, each variant
//! is resolved concurrently (cache first, then embed and search), and the
//! two hit lists are merged into one deduplicated, score-ordered context
//! set. Retrieval is infallible by construction: every failure along the
//! way is logged and degrades to fewer (possibly zero) results.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::cache::{RetrievalCache, ScoredHit, normalize_key};
use crate::embeddings::EmbeddingProvider;
use crate::rewrite::{Language, QueryRewriter, RewrittenQuery};
use crate::stores::VectorIndex;

/// How scores combine when both language lookups surface the same chunk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Add the per-language scores. Rewards chunks both variants agree on.
    Sum,
    /// Keep the best per-language score.
    #[default]
    Max,
}

impl FromStr for MergeStrategy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sum" => Ok(Self::Sum),
            "max" => Ok(Self::Max),
            other => Err(format!("unknown merge strategy '{other}' (expected sum|max)")),
        }
    }
}

/// Tuning knobs for the retrieval engine.
#[derive(Clone, Copy, Debug)]
pub struct RetrievalOptions {
    /// Results requested per language lookup and kept after merging.
    pub top_k: usize,
    /// Merged hits scoring below this are dropped.
    pub min_score: f32,
    /// Cross-language score combination.
    pub merge: MergeStrategy,
    /// Lifetime of cached per-language hit lists.
    pub cache_ttl: Duration,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            top_k: 6,
            min_score: 0.0,
            merge: MergeStrategy::Max,
            cache_ttl: Duration::from_secs(3600),
        }
    }
}

/// One retrieved passage, ready to drop into a prompt.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkContext {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    pub score: f32,
}

/// The merged outcome of a retrieval pass.
#[derive(Clone, Debug, Default)]
pub struct ResultSet {
    /// The rewrite that drove the lookups, when one ran.
    pub rewritten: Option<RewrittenQuery>,
    /// Distinct source documents, in first-seen order.
    pub document_ids: Vec<String>,
    /// Deduplicated chunks, best score first.
    pub chunks: Vec<ChunkContext>,
}

impl ResultSet {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Bilingual retrieval pipeline: rewrite, fan out, merge.
#[derive(Clone)]
pub struct RetrievalEngine {
    rewriter: QueryRewriter,
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    cache: Arc<dyn RetrievalCache>,
    options: RetrievalOptions,
}

impl RetrievalEngine {
    pub fn new(
        rewriter: QueryRewriter,
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        cache: Arc<dyn RetrievalCache>,
        options: RetrievalOptions,
    ) -> Self {
        Self {
            rewriter,
            embedder,
            index,
            cache,
            options,
        }
    }

    /// Retrieves context for `query`.
    ///
    /// An empty corpus, a cold cache, an embedding outage, or an index
    /// outage all produce an empty (or partial) result set rather than an
    /// error. Both language lookups run concurrently.
    pub async fn retrieve(&self, query: &str) -> ResultSet {
        if query.trim().is_empty() {
            return ResultSet::default();
        }

        let rewritten = self.rewriter.rewrite(query).await;
        let (english_hits, japanese_hits) = tokio::join!(
            self.lookup(Language::English, rewritten.for_language(Language::English)),
            self.lookup(Language::Japanese, rewritten.for_language(Language::Japanese)),
        );

        let merged = self.merge(english_hits, japanese_hits).await;
        debug!(
            query,
            chunks = merged.len(),
            "retrieval pass complete"
        );

        let mut document_ids: Vec<String> = Vec::new();
        for chunk in &merged {
            if !document_ids.contains(&chunk.document_id) {
                document_ids.push(chunk.document_id.clone());
            }
        }

        ResultSet {
            rewritten: Some(rewritten),
            document_ids,
            chunks: merged,
        }
    }

    /// Resolves one language variant: cache hit, or embed + search + fill.
    ///
    /// Every error path logs and returns an empty list. Zero-hit searches
    /// are cached like any other result so repeated misses stay cheap.
    async fn lookup(&self, language: Language, variant: &str) -> Vec<ScoredHit> {
        let key = normalize_key(language, variant);

        match self.cache.get(&key).await {
            Ok(Some(hits)) => {
                debug!(language = language.tag(), hits = hits.len(), "cache hit");
                return hits;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(language = language.tag(), error = %err, "cache read failed");
            }
        }

        let embedding = match self.embedder.embed(variant).await {
            Ok(embedding) => embedding,
            Err(err) => {
                warn!(language = language.tag(), error = %err, "query embedding failed");
                return Vec::new();
            }
        };

        let hits = match self.index.search(&embedding, self.options.top_k, None).await {
            Ok(scored) => scored
                .into_iter()
                .map(|(chunk, score)| ScoredHit {
                    chunk_id: chunk.id,
                    document_id: chunk.document_id,
                    score,
                })
                .collect::<Vec<_>>(),
            Err(err) => {
                warn!(language = language.tag(), error = %err, "index search failed");
                return Vec::new();
            }
        };

        if let Err(err) = self.cache.put(&key, &hits, self.options.cache_ttl).await {
            warn!(language = language.tag(), error = %err, "cache write failed");
        }
        hits
    }

    /// Merges the two language hit lists into deduplicated chunk contexts.
    ///
    /// Ordering is deterministic: score descending, with first-seen order
    /// (English list before Japanese) breaking ties. Hits whose chunk has
    /// vanished from the index since caching are dropped.
    async fn merge(&self, english: Vec<ScoredHit>, japanese: Vec<ScoredHit>) -> Vec<ChunkContext> {
        struct Merged {
            document_id: String,
            score: f32,
            first_seen: usize,
        }

        let mut by_chunk: FxHashMap<String, Merged> = FxHashMap::default();
        for (position, hit) in english.into_iter().chain(japanese).enumerate() {
            match by_chunk.get_mut(&hit.chunk_id) {
                Some(existing) => {
                    existing.score = match self.options.merge {
                        MergeStrategy::Sum => existing.score + hit.score,
                        MergeStrategy::Max => existing.score.max(hit.score),
                    };
                }
                None => {
                    by_chunk.insert(
                        hit.chunk_id,
                        Merged {
                            document_id: hit.document_id,
                            score: hit.score,
                            first_seen: position,
                        },
                    );
                }
            }
        }

        let mut entries: Vec<(String, Merged)> = by_chunk
            .into_iter()
            .filter(|(_, merged)| merged.score >= self.options.min_score)
            .collect();
        entries.sort_by(|a, b| {
            b.1.score
                .partial_cmp(&a.1.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.first_seen.cmp(&b.1.first_seen))
        });
        entries.truncate(self.options.top_k);

        let mut contexts = Vec::with_capacity(entries.len());
        for (chunk_id, merged) in entries {
            match self.index.chunk_by_id(&chunk_id).await {
                Ok(Some(chunk)) => contexts.push(ChunkContext {
                    chunk_id,
                    document_id: merged.document_id,
                    text: chunk.text,
                    score: merged.score,
                }),
                Ok(None) => {
                    debug!(chunk_id, "cached hit no longer in index, dropping");
                }
                Err(err) => {
                    warn!(chunk_id, error = %err, "chunk hydration failed, dropping");
                }
            }
        }
        contexts
    }
}
