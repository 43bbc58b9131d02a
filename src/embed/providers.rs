//! Embedding backends
//!
//! Supports local embedding via Ollama, OpenAI-style endpoints, and an offline
//! feature-hashing provider

use super::EmbeddingProvider;
use crate::error::{PipelineError, Result};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Map a transport failure to a retryable model error
fn unreachable(model_id: &str, err: impl std::fmt::Display) -> PipelineError {
    PipelineError::ModelUnavailable {
        model_id: model_id.to_string(),
        reason: err.to_string(),
    }
}

/// 429, 5xx and 404 (model not loaded) are worth retrying; other client
/// errors mean the request itself is wrong
fn status_error(model_id: &str, status: StatusCode, body: &str) -> PipelineError {
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::NOT_FOUND
        || status.is_server_error()
    {
        unreachable(model_id, format!("{} - {}", status, body))
    } else {
        PipelineError::Config(format!(
            "embedding backend rejected request for {}: {} - {}",
            model_id, status, body
        ))
    }
}

/// Local embedding provider using the Ollama API
pub struct OllamaEmbedding {
    endpoint: String,
    model: String,
    client: reqwest::Client,
    dimension: usize,
}

impl OllamaEmbedding {
    pub fn new(endpoint: &str, model: &str, dimension: usize) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
            dimension,
        }
    }

    /// Embed a single text using the Ollama API
    async fn embed_single(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.endpoint);

        let request = OllamaEmbeddingRequest {
            model: &self.model,
            prompt: text,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| unreachable(&self.model, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(&self.model, status, &body));
        }

        let result: OllamaEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| unreachable(&self.model, e))?;

        Ok(result.embedding)
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for OllamaEmbedding {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for text in texts {
            embeddings.push(self.embed_single(text).await?);
        }
        Ok(embeddings)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Serialize)]
struct OllamaEmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

/// OpenAI-compatible embedding provider
pub struct OpenAiEmbedding {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
    dimension: usize,
}

impl OpenAiEmbedding {
    pub fn new(endpoint: &str, model: &str, api_key: Option<String>, dimension: usize) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
            client: reqwest::Client::new(),
            dimension,
        }
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for OpenAiEmbedding {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/v1/embeddings", self.endpoint);

        let request = OpenAiEmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let mut req_builder = self.client.post(&url).json(&request);
        if let Some(ref key) = self.api_key {
            req_builder = req_builder.bearer_auth(key);
        }

        let response = req_builder
            .send()
            .await
            .map_err(|e| unreachable(&self.model, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(&self.model, status, &body));
        }

        let result: OpenAiEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| unreachable(&self.model, e))?;

        let mut embeddings: Vec<_> = result
            .data
            .into_iter()
            .map(|d| (d.index, d.embedding))
            .collect();

        // Sort by index to maintain input order
        embeddings.sort_by_key(|(idx, _)| *idx);

        Ok(embeddings.into_iter().map(|(_, e)| e).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Serialize)]
struct OpenAiEmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

/// Offline provider: signed feature hashing of lowercase word unigrams and
/// bigrams. Deterministic for identical text, and texts sharing vocabulary
/// land close together, which is enough for tests and air-gapped runs.
pub struct HashEmbedding {
    model_id: String,
    dimension: usize,
}

impl HashEmbedding {
    pub fn new(model_id: &str, dimension: usize) -> Self {
        Self {
            model_id: model_id.to_string(),
            dimension: dimension.max(1),
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimension];
        let words = tokenize(text);

        let mut add = |feature: &str, weight: f32| {
            let digest = Sha256::digest(feature.as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let slot = (u64::from_le_bytes(bucket) % self.dimension as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[slot] += sign * weight;
        };

        for word in &words {
            add(word, 1.0);
        }
        for pair in words.windows(2) {
            add(&format!("{} {}", pair[0], pair[1]), 0.5);
        }

        vector
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for HashEmbedding {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// Lowercase alphanumeric words of two or more characters
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 1)
        .map(|w| w.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::cosine_similarity;

    #[tokio::test]
    async fn test_hash_embedding_is_deterministic() {
        let provider = HashEmbedding::new("hash-64", 64);
        let texts = vec!["Free cash flow turned negative.".to_string()];

        let a = provider.embed_batch(&texts).await.unwrap();
        let b = provider.embed_batch(&texts).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 64);
        assert_eq!(provider.model_id(), "hash-64");
    }

    #[test]
    fn test_shared_vocabulary_is_closer() {
        let provider = HashEmbedding::new("hash-256", 256);
        let query = provider.embed_text("litigation risk factors");
        let related = provider.embed_text("Risk factors include pending litigation and regulation.");
        let unrelated = provider.embed_text("Quarterly dividend of $0.24 per share declared.");

        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("Net sales (U.S.) grew 12%"),
            vec!["net", "sales", "grew", "12"]
        );
    }

    #[test]
    fn test_status_classification() {
        assert!(status_error("m", StatusCode::SERVICE_UNAVAILABLE, "").is_retryable());
        assert!(status_error("m", StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(!status_error("m", StatusCode::UNAUTHORIZED, "").is_retryable());
    }
}
