//! Embedding clients for chunk and query vectors.
//!
//! One fixed embedding model serves the whole corpus; English and Japanese
//! text share a single vector space so retrieval can fan out across both
//! rewrites without per-language indexes. The HTTP client targets the
//! OpenAI-compatible `/embeddings` endpoint.

use async_trait::async_trait;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::config::Settings;

/// Errors raised by embedding providers.
#[derive(Debug, Error, Diagnostic)]
pub enum EmbeddingError {
    /// Transport-level failure reaching the endpoint.
    #[error("embedding request failed: {0}")]
    #[diagnostic(code(ragbridge::embeddings::transport))]
    Transport(String),

    /// The endpoint answered with a non-success status.
    #[error("embedding endpoint returned {status}: {body}")]
    #[diagnostic(code(ragbridge::embeddings::status))]
    Status { status: u16, body: String },

    /// The response payload did not contain the expected vectors.
    #[error("embedding response malformed: {0}")]
    #[diagnostic(code(ragbridge::embeddings::malformed))]
    Malformed(String),
}

/// A source of fixed-dimension embedding vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embeds a batch of texts, preserving input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Embeds a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| EmbeddingError::Malformed("empty embedding batch".to_string()))
    }
}

/// Client for an OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAiEmbeddingProvider {
    client: reqwest::Client,
    endpoint: Url,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingsItem>,
}

#[derive(Deserialize)]
struct EmbeddingsItem {
    embedding: Vec<f32>,
}

impl OpenAiEmbeddingProvider {
    /// Creates a provider from settings.
    pub fn new(settings: &Settings) -> Result<Self, EmbeddingError> {
        Self::with_endpoint(
            &settings.openai_base_url,
            &settings.openai_api_key,
            &settings.embed_model,
        )
    }

    /// Creates a provider against an explicit base URL.
    pub fn with_endpoint(
        base_url: &Url,
        api_key: &str,
        model: &str,
    ) -> Result<Self, EmbeddingError> {
        let endpoint = join_endpoint(base_url, "embeddings")?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| EmbeddingError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbeddingsRequest {
            model: &self.model,
            input: texts,
        };
        let mut builder = self.client.post(self.endpoint.clone()).json(&request);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| EmbeddingError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let payload: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|err| EmbeddingError::Malformed(err.to_string()))?;
        if payload.data.len() != texts.len() {
            return Err(EmbeddingError::Malformed(format!(
                "expected {} vectors, got {}",
                texts.len(),
                payload.data.len()
            )));
        }
        Ok(payload.data.into_iter().map(|item| item.embedding).collect())
    }
}

pub(crate) fn join_endpoint(base_url: &Url, path: &str) -> Result<Url, EmbeddingError> {
    let mut base = base_url.clone();
    {
        let mut segments = base
            .path_segments_mut()
            .map_err(|_| EmbeddingError::Transport("base URL cannot be a base".to_string()))?;
        segments.pop_if_empty();
        for segment in path.split('/') {
            segments.push(segment);
        }
    }
    Ok(base)
}

/// Deterministic embedding provider for tests and offline runs.
///
/// Vectors are derived from token-level hashes of the input, so identical
/// text always embeds identically and related texts (shared words) land
/// closer than unrelated ones. Never fails.
#[derive(Clone, Debug)]
pub struct MockEmbeddingProvider {
    dimension: usize,
}

impl Default for MockEmbeddingProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEmbeddingProvider {
    pub fn new() -> Self {
        Self { dimension: 64 }
    }

    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for word in text.to_lowercase().split_whitespace() {
            let mut hash = 0xcbf29ce484222325u64;
            for byte in word.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(0x100000001b3);
            }
            let slot = (hash % self.dimension as u64) as usize;
            let sign = if hash & 1 == 0 { 1.0 } else { -1.0 };
            vector[slot] += sign;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_embeddings_are_deterministic() {
        let provider = MockEmbeddingProvider::new();
        let inputs = vec![
            "Hello world".to_string(),
            "Goodbye world".to_string(),
            "Hello world".to_string(),
        ];
        let first = provider.embed_batch(&inputs).await.unwrap();
        let second = provider.embed_batch(&inputs).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0], first[2]);
        assert_ne!(first[0], first[1]);
    }

    #[tokio::test]
    async fn mock_embeddings_are_unit_length() {
        let provider = MockEmbeddingProvider::new();
        let vector = provider.embed("quarterly revenue report").await.unwrap();
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn endpoint_join_handles_trailing_slash() {
        let base = Url::parse("http://localhost:11434/v1/").unwrap();
        let joined = join_endpoint(&base, "embeddings").unwrap();
        assert_eq!(joined.as_str(), "http://localhost:11434/v1/embeddings");

        let base = Url::parse("http://localhost:11434/v1").unwrap();
        let joined = join_endpoint(&base, "embeddings").unwrap();
        assert_eq!(joined.as_str(), "http://localhost:11434/v1/embeddings");
    }
}
