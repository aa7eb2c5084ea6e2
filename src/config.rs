//! Centralized settings loaded from environment variables.
//!
//! All components take their tunables from [`Settings`], initialized once at
//! startup and passed by reference into each component constructor. `.env`
//! files are honored via `dotenvy`, mirroring the deployment convention of
//! the surrounding service.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;
use url::Url;

use crate::agent::AgentOptions;
use crate::chunker::ChunkerConfig;
use crate::ingestion::IngestOptions;
use crate::retrieval::{MergeStrategy, RetrievalOptions};

/// Errors raised while resolving configuration.
///
/// These are the only process-fatal errors in the crate; everything past
/// startup degrades or escalates instead of surfacing raw failures.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    /// A required environment variable is absent.
    #[error("missing required environment variable: {name}")]
    #[diagnostic(
        code(ragbridge::config::missing_var),
        help("Set the variable in the environment or a .env file.")
    )]
    MissingVar { name: &'static str },

    /// An environment variable is present but unparseable.
    #[error("invalid value for {name}: {value}")]
    #[diagnostic(code(ragbridge::config::invalid_var))]
    InvalidVar { name: &'static str, value: String },
}

/// Application settings.
///
/// Field defaults track the original deployment: one-hour cache TTL,
/// top-k of 6, chunks sized around 300 tokens.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Base URL of the OpenAI-compatible endpoint serving both chat and
    /// embeddings (e.g. an Ollama gateway).
    pub openai_base_url: Url,
    pub openai_api_key: String,
    pub chat_model: String,
    pub embed_model: String,

    pub cache_ttl: Duration,
    pub retrieval_top_k: usize,
    /// Minimum merged score a chunk must clear to be returned. `0.0`
    /// disables the floor for similarity scales that stay positive.
    pub min_score: f32,
    pub merge_strategy: MergeStrategy,

    pub chunk_max_tokens: usize,
    pub chunk_overlap_tokens: usize,

    pub embed_batch_size: usize,
    pub embed_retry_limit: usize,
    pub embed_retry_base_delay: Duration,

    pub tool_call_budget: usize,
    /// Character width of each streamed token delta.
    pub stream_slice_chars: usize,

    /// Path for the sqlite-vec index file when the sqlite backend is used.
    pub index_db_path: PathBuf,
}

impl Settings {
    /// Loads settings from the environment, honoring a `.env` file.
    ///
    /// Only `OPENAI_BASE_URL` is required; every other variable has a
    /// default. Returns [`ConfigError`] on a missing endpoint or an
    /// unparseable value - both fatal at process level.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let base_url = std::env::var("OPENAI_BASE_URL")
            .map_err(|_| ConfigError::MissingVar {
                name: "OPENAI_BASE_URL",
            })?;
        let openai_base_url = Url::parse(&base_url).map_err(|_| ConfigError::InvalidVar {
            name: "OPENAI_BASE_URL",
            value: base_url.clone(),
        })?;

        Ok(Self {
            openai_base_url,
            openai_api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
            chat_model: std::env::var("CHAT_MODEL")
                .unwrap_or_else(|_| "qwen3-vl:8b-instruct".to_string()),
            embed_model: std::env::var("EMBED_MODEL")
                .unwrap_or_else(|_| "embeddinggemma:300m".to_string()),
            cache_ttl: Duration::from_secs(parse_var("CACHE_TTL_SECONDS", 3600_u64)?),
            retrieval_top_k: parse_var("RETRIEVAL_TOP_K", 6_usize)?,
            min_score: parse_var("RETRIEVAL_MIN_SCORE", 0.0_f32)?,
            merge_strategy: parse_var("RETRIEVAL_MERGE", MergeStrategy::Max)?,
            chunk_max_tokens: parse_var("CHUNK_MAX_TOKENS", 300_usize)?,
            chunk_overlap_tokens: parse_var("CHUNK_OVERLAP_TOKENS", 40_usize)?,
            embed_batch_size: parse_var("EMBED_BATCH_SIZE", 16_usize)?,
            embed_retry_limit: parse_var("EMBED_RETRY_LIMIT", 3_usize)?,
            embed_retry_base_delay: Duration::from_millis(parse_var(
                "EMBED_RETRY_BASE_DELAY_MS",
                250_u64,
            )?),
            tool_call_budget: parse_var("TOOL_CALL_BUDGET", 4_usize)?,
            stream_slice_chars: parse_var("STREAM_SLICE_CHARS", 60_usize)?,
            index_db_path: PathBuf::from(
                std::env::var("INDEX_DB_PATH").unwrap_or_else(|_| "ragbridge.db".to_string()),
            ),
        })
    }

    /// Retrieval engine tunables derived from these settings.
    pub fn retrieval_options(&self) -> RetrievalOptions {
        RetrievalOptions {
            top_k: self.retrieval_top_k,
            min_score: self.min_score,
            merge: self.merge_strategy,
            cache_ttl: self.cache_ttl,
        }
    }

    /// Chunker tunables derived from these settings.
    pub fn chunker_config(&self) -> ChunkerConfig {
        ChunkerConfig {
            max_tokens: self.chunk_max_tokens,
            overlap_tokens: self.chunk_overlap_tokens,
        }
    }

    /// Ingestion pipeline tunables derived from these settings.
    pub fn ingest_options(&self) -> IngestOptions {
        IngestOptions {
            embed_batch_size: self.embed_batch_size,
            embed_retry_limit: self.embed_retry_limit,
            embed_retry_base_delay: self.embed_retry_base_delay,
        }
    }

    /// Agent orchestrator tunables derived from these settings.
    pub fn agent_options(&self) -> AgentOptions {
        AgentOptions {
            tool_call_budget: self.tool_call_budget,
            stream_slice_chars: self.stream_slice_chars,
        }
    }

    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.retrieval_top_k = top_k;
        self
    }

    #[must_use]
    pub fn with_merge_strategy(mut self, merge: MergeStrategy) -> Self {
        self.merge_strategy = merge;
        self
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidVar { name, value: raw }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_var_prefers_env_value() {
        std::env::set_var("RAGBRIDGE_TEST_PARSE_VAR", "12");
        let value: usize = parse_var("RAGBRIDGE_TEST_PARSE_VAR", 6).unwrap();
        assert_eq!(value, 12);
        std::env::remove_var("RAGBRIDGE_TEST_PARSE_VAR");
    }

    #[test]
    fn parse_var_falls_back_to_default() {
        let value: u64 = parse_var("RAGBRIDGE_TEST_UNSET_VAR", 3600).unwrap();
        assert_eq!(value, 3600);
    }

    fn settings() -> Settings {
        Settings {
            openai_base_url: Url::parse("http://localhost:11434/v1").unwrap(),
            openai_api_key: String::new(),
            chat_model: "qwen3-vl:8b-instruct".to_string(),
            embed_model: "embeddinggemma:300m".to_string(),
            cache_ttl: Duration::from_secs(3600),
            retrieval_top_k: 6,
            min_score: 0.0,
            merge_strategy: MergeStrategy::Max,
            chunk_max_tokens: 300,
            chunk_overlap_tokens: 40,
            embed_batch_size: 16,
            embed_retry_limit: 3,
            embed_retry_base_delay: Duration::from_millis(250),
            tool_call_budget: 4,
            stream_slice_chars: 60,
            index_db_path: PathBuf::from("ragbridge.db"),
        }
    }

    #[test]
    fn builder_overrides_flow_into_retrieval_options() {
        let settings = settings()
            .with_cache_ttl(Duration::from_secs(60))
            .with_top_k(3)
            .with_merge_strategy(MergeStrategy::Sum);
        let options = settings.retrieval_options();
        assert_eq!(options.cache_ttl, Duration::from_secs(60));
        assert_eq!(options.top_k, 3);
        assert_eq!(options.merge, MergeStrategy::Sum);
    }

    #[test]
    fn derived_options_carry_the_settings_fields() {
        let settings = settings();
        let chunker = settings.chunker_config();
        assert_eq!(chunker.max_tokens, 300);
        assert_eq!(chunker.overlap_tokens, 40);
        let ingest = settings.ingest_options();
        assert_eq!(ingest.embed_batch_size, 16);
        assert_eq!(ingest.embed_retry_limit, 3);
        assert_eq!(ingest.embed_retry_base_delay, Duration::from_millis(250));
    }

    #[test]
    fn parse_var_rejects_garbage() {
        std::env::set_var("RAGBRIDGE_TEST_BAD_VAR", "not-a-number");
        let result: Result<usize, _> = parse_var("RAGBRIDGE_TEST_BAD_VAR", 1);
        assert!(result.is_err());
        std::env::remove_var("RAGBRIDGE_TEST_BAD_VAR");
    }
}
