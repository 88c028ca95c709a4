//! Embedding backends for the processing pipeline.

use crate::config::get_config;
use crate::llm::split_binding;
use crate::tokenize::count_tokens;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

/// Errors raised by embedding providers.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Model binding referenced a provider this worker does not know.
    #[error("Unknown embedding provider in binding '{0}'")]
    UnknownProvider(String),
    /// Provider requires credentials or endpoints that are not configured.
    #[error("Embedding provider misconfigured: {0}")]
    Misconfigured(String),
    /// HTTP layer failed before receiving a response.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Provider returned an error or an undecodable body.
    #[error("Failed to generate embeddings: {0}")]
    GenerationFailed(String),
}

/// Interface implemented by embedding backends.
///
/// `encode` is the batch path used for chunk content; `encode_queries` embeds
/// a single query-side text. Both report the provider's token usage for
/// billing and telemetry.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Produce one vector per input text plus the consumed token count.
    async fn encode(&self, texts: &[String]) -> Result<(Vec<Vec<f32>>, usize), EmbeddingError>;

    /// Produce a vector for a single query text plus the consumed token count.
    async fn encode_queries(&self, text: &str) -> Result<(Vec<f32>, usize), EmbeddingError>;
}

/// Resolve an embedding backend from a `provider/model` binding.
pub fn resolve_embedding_model(
    binding: &str,
) -> Result<Box<dyn EmbeddingModel>, EmbeddingError> {
    let Some((provider, model)) = split_binding(binding) else {
        return Err(EmbeddingError::UnknownProvider(binding.to_string()));
    };
    match provider {
        "openai" => {
            let config = get_config();
            let base_url = config
                .openai_base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string());
            let api_key = config.openai_api_key.clone().ok_or_else(|| {
                EmbeddingError::Misconfigured("DOCMILL_OPENAI_API_KEY is not set".to_string())
            })?;
            Ok(Box::new(OpenAiEmbedding::new(base_url, api_key, model)))
        }
        "ollama" => {
            let config = get_config();
            let base_url = config
                .ollama_url
                .clone()
                .unwrap_or_else(|| "http://127.0.0.1:11434".to_string());
            Ok(Box::new(OllamaEmbedding::new(base_url, model)))
        }
        "hashed" => {
            let dimension: usize = model.parse().map_err(|_| {
                EmbeddingError::Misconfigured(format!(
                    "hashed embedding dimension '{model}' is not a number"
                ))
            })?;
            Ok(Box::new(HashedEmbedding::new(dimension)))
        }
        _ => Err(EmbeddingError::UnknownProvider(binding.to_string())),
    }
}

/// OpenAI-compatible embeddings endpoint.
pub struct OpenAiEmbedding {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingItem>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingItem {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    total_tokens: usize,
}

impl OpenAiEmbedding {
    /// Build an adapter for an OpenAI-compatible endpoint.
    pub fn new(base_url: String, api_key: String, model: &str) -> Self {
        let http = Client::builder()
            .user_agent("docmill/embed")
            .build()
            .expect("Failed to construct reqwest::Client for embeddings");
        Self {
            http,
            base_url,
            api_key,
            model: model.to_string(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/embeddings", self.base_url.trim_end_matches('/'))
    }

    async fn request(&self, inputs: &[String]) -> Result<(Vec<Vec<f32>>, usize), EmbeddingError> {
        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": self.model, "input": inputs }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::GenerationFailed(format!(
                "provider returned {status}: {body}"
            )));
        }

        let body: OpenAiEmbeddingResponse = response.json().await.map_err(|error| {
            EmbeddingError::GenerationFailed(format!("undecodable response: {error}"))
        })?;
        if body.data.len() != inputs.len() {
            return Err(EmbeddingError::GenerationFailed(format!(
                "expected {} vectors, got {}",
                inputs.len(),
                body.data.len()
            )));
        }
        let tokens = body.usage.map(|usage| usage.total_tokens).unwrap_or_else(|| {
            inputs.iter().map(|text| count_tokens(text)).sum()
        });
        Ok((body.data.into_iter().map(|item| item.embedding).collect(), tokens))
    }
}

#[async_trait]
impl EmbeddingModel for OpenAiEmbedding {
    async fn encode(&self, texts: &[String]) -> Result<(Vec<Vec<f32>>, usize), EmbeddingError> {
        if texts.is_empty() {
            return Ok((Vec::new(), 0));
        }
        self.request(texts).await
    }

    async fn encode_queries(&self, text: &str) -> Result<(Vec<f32>, usize), EmbeddingError> {
        let (mut vectors, tokens) = self.request(&[text.to_string()]).await?;
        let vector = vectors
            .pop()
            .ok_or_else(|| EmbeddingError::GenerationFailed("empty response".to_string()))?;
        Ok((vector, tokens))
    }
}

/// Local Ollama embeddings endpoint.
pub struct OllamaEmbedding {
    http: Client,
    base_url: String,
    model: String,
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    prompt_eval_count: Option<usize>,
}

impl OllamaEmbedding {
    /// Build an adapter for a local Ollama runtime.
    pub fn new(base_url: String, model: &str) -> Self {
        let http = Client::builder()
            .user_agent("docmill/embed")
            .build()
            .expect("Failed to construct reqwest::Client for embeddings");
        Self {
            http,
            base_url,
            model: model.to_string(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/embed", self.base_url.trim_end_matches('/'))
    }

    async fn request(&self, inputs: &[String]) -> Result<(Vec<Vec<f32>>, usize), EmbeddingError> {
        let response = self
            .http
            .post(self.endpoint())
            .json(&json!({ "model": self.model, "input": inputs }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::GenerationFailed(format!(
                "Ollama returned {status}: {body}"
            )));
        }

        let body: OllamaEmbedResponse = response.json().await.map_err(|error| {
            EmbeddingError::GenerationFailed(format!("undecodable response: {error}"))
        })?;
        if body.embeddings.len() != inputs.len() {
            return Err(EmbeddingError::GenerationFailed(format!(
                "expected {} vectors, got {}",
                inputs.len(),
                body.embeddings.len()
            )));
        }
        let tokens = body.prompt_eval_count.unwrap_or_else(|| {
            inputs.iter().map(|text| count_tokens(text)).sum()
        });
        Ok((body.embeddings, tokens))
    }
}

#[async_trait]
impl EmbeddingModel for OllamaEmbedding {
    async fn encode(&self, texts: &[String]) -> Result<(Vec<Vec<f32>>, usize), EmbeddingError> {
        if texts.is_empty() {
            return Ok((Vec::new(), 0));
        }
        self.request(texts).await
    }

    async fn encode_queries(&self, text: &str) -> Result<(Vec<f32>, usize), EmbeddingError> {
        let (mut vectors, tokens) = self.request(&[text.to_string()]).await?;
        let vector = vectors
            .pop()
            .ok_or_else(|| EmbeddingError::GenerationFailed("empty response".to_string()))?;
        Ok((vector, tokens))
    }
}

/// Deterministic fallback embedder for tests and air-gapped deployments.
///
/// Folds content bytes into a fixed-dimension vector and L2-normalizes it, so
/// identical text always produces identical vectors without any network call.
pub struct HashedEmbedding {
    dimension: usize,
}

impl HashedEmbedding {
    /// Construct a deterministic embedder with the given output dimension.
    pub const fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn encode_one(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0_f32; self.dimension];
        if text.is_empty() || self.dimension == 0 {
            return embedding;
        }

        for (idx, byte) in text.bytes().enumerate() {
            let position = idx % self.dimension;
            embedding[position] += f32::from(byte) / 255.0;
        }

        let norm = embedding.iter().map(|value| value * value).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut embedding {
                *value /= norm;
            }
        }

        embedding
    }
}

#[async_trait]
impl EmbeddingModel for HashedEmbedding {
    async fn encode(&self, texts: &[String]) -> Result<(Vec<Vec<f32>>, usize), EmbeddingError> {
        if self.dimension == 0 {
            return Err(EmbeddingError::Misconfigured(
                "embedding dimension must be greater than zero".to_string(),
            ));
        }
        let tokens = texts.iter().map(|text| count_tokens(text)).sum();
        Ok((texts.iter().map(|text| self.encode_one(text)).collect(), tokens))
    }

    async fn encode_queries(&self, text: &str) -> Result<(Vec<f32>, usize), EmbeddingError> {
        let (mut vectors, tokens) = self.encode(&[text.to_string()]).await?;
        Ok((vectors.remove(0), tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};

    #[tokio::test]
    async fn hashed_embedding_is_deterministic_and_normalized() {
        let model = HashedEmbedding::new(8);
        let (first, tokens) = model.encode(&["hello world".to_string()]).await.expect("encode");
        let (second, _) = model.encode(&["hello world".to_string()]).await.expect("encode");
        assert_eq!(first, second);
        assert!(tokens > 0);
        let norm: f32 = first[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn hashed_embedding_rejects_zero_dimension() {
        let model = HashedEmbedding::new(0);
        let error = model.encode(&["text".to_string()]).await.expect_err("zero dim");
        assert!(matches!(error, EmbeddingError::Misconfigured(_)));
    }

    #[tokio::test]
    async fn openai_adapter_decodes_vectors_and_usage() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/embeddings");
                then.status(200).json_body(json!({
                    "data": [
                        {"embedding": [0.1, 0.2]},
                        {"embedding": [0.3, 0.4]}
                    ],
                    "usage": {"total_tokens": 7}
                }));
            })
            .await;

        let model = OpenAiEmbedding::new(server.base_url(), "key".into(), "text-embedding-3-small");
        let (vectors, tokens) = model
            .encode(&["a".to_string(), "b".to_string()])
            .await
            .expect("encode");
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[1], vec![0.3, 0.4]);
        assert_eq!(tokens, 7);
    }

    #[tokio::test]
    async fn openai_adapter_rejects_count_mismatch() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/embeddings");
                then.status(200).json_body(json!({
                    "data": [{"embedding": [0.1]}],
                    "usage": {"total_tokens": 2}
                }));
            })
            .await;

        let model = OpenAiEmbedding::new(server.base_url(), "key".into(), "text-embedding-3-small");
        let error = model
            .encode(&["a".to_string(), "b".to_string()])
            .await
            .expect_err("mismatch");
        assert!(matches!(error, EmbeddingError::GenerationFailed(_)));
    }

    #[tokio::test]
    async fn ollama_adapter_decodes_embed_response() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embed");
                then.status(200).json_body(json!({
                    "embeddings": [[1.0, 0.0]],
                    "prompt_eval_count": 3
                }));
            })
            .await;

        let model = OllamaEmbedding::new(server.base_url(), "nomic-embed-text");
        let (vector, tokens) = model.encode_queries("query").await.expect("encode");
        assert_eq!(vector, vec![1.0, 0.0]);
        assert_eq!(tokens, 3);
    }

    #[test]
    fn unknown_provider_is_a_configuration_error() {
        let error = resolve_embedding_model("mystery/model").err().expect("unknown provider");
        assert!(matches!(error, EmbeddingError::UnknownProvider(_)));
    }
}
