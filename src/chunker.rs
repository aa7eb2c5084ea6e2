//! Sentence-aware overlapping passage chunker.
//!
//! Extracted text is split into passages sized for the embedding model.
//! Passage boundaries follow Unicode sentence segmentation (which handles
//! Japanese sentence terminators as well as Latin punctuation) and sizes
//! are measured in `cl100k_base` tokens so English and CJK text budget
//! comparably. Consecutive passages share a configurable token overlap.

use miette::Diagnostic;
use thiserror::Error;
use tiktoken_rs::{cl100k_base, CoreBPE};
use unicode_segmentation::UnicodeSegmentation;

/// Errors raised while chunking extracted text.
#[derive(Debug, Error, Diagnostic)]
pub enum ChunkingError {
    /// The extracted text was empty or whitespace-only.
    #[error("document produced no text to chunk")]
    #[diagnostic(
        code(ragbridge::chunker::empty),
        help("The extractor returned nothing; the upload may be blank or image-only.")
    )]
    EmptyDocument,

    /// The token encoder could not be constructed.
    #[error("tokenizer unavailable: {0}")]
    #[diagnostic(code(ragbridge::chunker::tokenizer))]
    TokenizerUnavailable(String),
}

/// Chunker tunables.
#[derive(Clone, Copy, Debug)]
pub struct ChunkerConfig {
    /// Upper bound on tokens per passage.
    pub max_tokens: usize,
    /// Tokens of trailing context carried into the next passage.
    pub overlap_tokens: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_tokens: 300,
            overlap_tokens: 40,
        }
    }
}

/// Splits extracted text into overlapping passages.
pub struct TextChunker {
    config: ChunkerConfig,
    encoder: CoreBPE,
}

impl TextChunker {
    /// Creates a chunker with the given configuration.
    pub fn new(config: ChunkerConfig) -> Result<Self, ChunkingError> {
        let encoder =
            cl100k_base().map_err(|err| ChunkingError::TokenizerUnavailable(err.to_string()))?;
        // Overlap must leave room for at least one fresh segment per window.
        let config = ChunkerConfig {
            overlap_tokens: config.overlap_tokens.min(config.max_tokens / 2),
            ..config
        };
        Ok(Self { config, encoder })
    }

    /// Creates a chunker with default sizing.
    pub fn with_defaults() -> Result<Self, ChunkingError> {
        Self::new(ChunkerConfig::default())
    }

    pub fn config(&self) -> ChunkerConfig {
        self.config
    }

    /// Splits `text` into ordered passages.
    ///
    /// Fails only when the text is empty after trimming; any non-empty text
    /// yields at least one passage.
    pub fn chunk(&self, text: &str) -> Result<Vec<String>, ChunkingError> {
        if text.trim().is_empty() {
            return Err(ChunkingError::EmptyDocument);
        }

        let segments = self.segment(text);
        let mut passages: Vec<String> = Vec::new();
        let mut window: Vec<(String, usize)> = Vec::new();
        let mut window_tokens = 0usize;

        for (segment, tokens) in segments {
            if window_tokens + tokens > self.config.max_tokens && !window.is_empty() {
                passages.push(join_window(&window));
                let carried = self.carry_overlap(&window);
                window_tokens = carried.iter().map(|(_, t)| t).sum();
                window = carried;
            }
            window_tokens += tokens;
            window.push((segment, tokens));
        }

        if window.iter().any(|(s, _)| !s.trim().is_empty()) {
            passages.push(join_window(&window));
        }

        tracing::debug!(
            passages = passages.len(),
            max_tokens = self.config.max_tokens,
            overlap_tokens = self.config.overlap_tokens,
            "chunked document text"
        );
        Ok(passages)
    }

    /// Counts tokens in `text` under the chunker's encoder.
    pub fn count_tokens(&self, text: &str) -> usize {
        self.encoder.encode_ordinary(text).len()
    }

    /// Breaks text into sentence-sized segments, each within the token
    /// budget, with paragraph breaks preserved as segment boundaries.
    fn segment(&self, text: &str) -> Vec<(String, usize)> {
        let mut segments = Vec::new();
        for paragraph in text.split("\n\n") {
            if paragraph.trim().is_empty() {
                continue;
            }
            for sentence in paragraph.split_sentence_bounds() {
                if sentence.trim().is_empty() {
                    continue;
                }
                let tokens = self.count_tokens(sentence);
                if tokens <= self.config.max_tokens {
                    segments.push((sentence.to_string(), tokens));
                } else {
                    segments.extend(self.hard_split(sentence));
                }
            }
        }
        segments
    }

    /// Splits a single oversized sentence on token windows; falls back to
    /// character windows when a token boundary lands mid-codepoint.
    fn hard_split(&self, sentence: &str) -> Vec<(String, usize)> {
        let token_ids = self.encoder.encode_ordinary(sentence);
        let mut pieces = Vec::new();
        for ids in token_ids.chunks(self.config.max_tokens) {
            match self.encoder.decode(ids.to_vec()) {
                Ok(piece) => pieces.push((piece.clone(), ids.len())),
                Err(_) => {
                    pieces.clear();
                    break;
                }
            }
        }
        if !pieces.is_empty() {
            return pieces;
        }

        let chars: Vec<char> = sentence.chars().collect();
        chars
            .chunks(self.config.max_tokens.max(1) * 2)
            .map(|window| {
                let piece: String = window.iter().collect();
                let tokens = self.count_tokens(&piece);
                (piece, tokens)
            })
            .collect()
    }

    /// Trailing segments worth up to `overlap_tokens`, to seed the next window.
    fn carry_overlap(&self, window: &[(String, usize)]) -> Vec<(String, usize)> {
        let mut carried = Vec::new();
        let mut total = 0usize;
        for (segment, tokens) in window.iter().rev() {
            if total + tokens > self.config.overlap_tokens {
                break;
            }
            total += tokens;
            carried.push((segment.clone(), *tokens));
        }
        carried.reverse();
        carried
    }
}

fn join_window(window: &[(String, usize)]) -> String {
    window
        .iter()
        .map(|(segment, _)| segment.as_str())
        .collect::<String>()
        .trim()
        .to_string()
}
