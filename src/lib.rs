//! # Ragbridge: Bilingual Retrieval-Augmented Support Agent
//!
//! Ragbridge answers natural-language questions (English or Japanese) from a
//! private document corpus and hands a turn off to human support when the
//! corpus cannot ground an answer.
//!
//! ```text
//! Uploaded file ──► extract ──► chunker ──► embeddings ──► stores (VectorIndex)
//!                      └──────────── ingestion (all-or-nothing per document) ─┘
//!
//! User query ──► rewrite {english, japanese}
//!                    │
//!                    ├─► cache (per-language slots, TTL)
//!                    └─► retrieval (fan-out, merge, rank, floor)
//!                              │
//! Conversation ──► agent (bounded tool-calling loop) ──► AgentEvent stream
//!                              │                              │
//!                         ChatModel (LLM)            deltas, tool notices,
//!                                                    one terminal turn
//! ```
//!
//! ## Core Concepts
//!
//! - **Ingestion**: extract → chunk → embed → index, idempotent per document
//!   id, rolled back on failure
//! - **Bilingual retrieval**: one user query fans out into English and
//!   Japanese lookups, each with its own cache slot, merged deterministically
//! - **Grounding policy**: the orchestrator only answers from retrieved
//!   chunks or escalates via `transferToSupport`; it never fabricates
//! - **Streaming**: each turn emits zero or more token deltas and tool
//!   notices, then exactly one terminal [`agent::AgentEvent::Final`]
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use ragbridge::agent::{AgentOrchestrator, TurnRequest};
//! use ragbridge::cache::MemoryRetrievalCache;
//! use ragbridge::config::Settings;
//! use ragbridge::embeddings::OpenAiEmbeddingProvider;
//! use ragbridge::llm::OpenAiChatModel;
//! use ragbridge::retrieval::RetrievalEngine;
//! use ragbridge::rewrite::QueryRewriter;
//! use ragbridge::stores::memory::MemoryVectorIndex;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::from_env()?;
//! let model = Arc::new(OpenAiChatModel::new(&settings)?);
//! let embedder = Arc::new(OpenAiEmbeddingProvider::new(&settings)?);
//! let index = Arc::new(MemoryVectorIndex::new());
//! let cache = Arc::new(MemoryRetrievalCache::new());
//!
//! let engine = RetrievalEngine::new(
//!     QueryRewriter::new(model.clone()),
//!     embedder,
//!     index,
//!     cache,
//!     settings.retrieval_options(),
//! );
//! let orchestrator = AgentOrchestrator::new(model, engine, settings.agent_options());
//!
//! let (events, _rx) = ragbridge::agent::event_channel();
//! let _turn = orchestrator
//!     .run_turn(TurnRequest::new("Where is the Q3 revenue figure?"), events)
//!     .await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Guide
//!
//! - [`config`] - Environment-driven settings with builder overrides
//! - [`extract`] - File-to-text extraction (txt/md, HTML, CSV/TSV)
//! - [`chunker`] - Sentence-aware overlapping passage chunker
//! - [`embeddings`] - Embedding provider trait + OpenAI-compatible client
//! - [`llm`] - Chat model trait, tool-calling wire client, scripted test model
//! - [`stores`] - Vector index trait with sqlite-vec and in-memory backends
//! - [`cache`] - TTL'd retrieval cache with language-tagged keys
//! - [`rewrite`] - Bilingual query rewriter with graceful fallback
//! - [`retrieval`] - Cross-lingual fan-out, merge, and ranking
//! - [`ingestion`] - All-or-nothing document ingestion pipeline
//! - [`agent`] - Bounded tool-calling orchestrator and event stream

pub mod agent;
pub mod cache;
pub mod chunker;
pub mod config;
pub mod embeddings;
pub mod extract;
pub mod ingestion;
pub mod llm;
pub mod message;
pub mod retrieval;
pub mod rewrite;
pub mod stores;
pub mod telemetry;
