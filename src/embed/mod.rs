//! Chunk embedding
//!
//! Maps chunks to fixed-dimension vectors through a pluggable provider.
//! Batches run concurrently; each finished batch is persisted before the next
//! result is awaited, so a failure part way through keeps every vector
//! already computed.

mod providers;

pub use providers::{tokenize, HashEmbedding, OllamaEmbedding, OpenAiEmbedding};

use crate::chunk::Chunk;
use crate::config::{EmbeddingConfig, EmbeddingProviderKind};
use crate::error::{PipelineError, Result};
use crate::retry::RetryPolicy;
use crate::storage::Database;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinSet;

/// One vector per (chunk_id, model_id)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub chunk_id: String,
    pub model_id: String,
    pub vector: Vec<f32>,
}

/// Trait for embedding providers
#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embeddings for a batch of texts, in input order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Generate embedding for a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let results = self.embed_batch(&[text.to_string()]).await?;
        results.into_iter().next().ok_or_else(|| PipelineError::ModelUnavailable {
            model_id: self.model_id().to_string(),
            reason: "no embedding returned".to_string(),
        })
    }

    /// Get the embedding dimension
    fn dimension(&self) -> usize;

    /// Identifier stored alongside every vector
    fn model_id(&self) -> &str;
}

/// Build the configured provider
pub fn provider_from_config(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    let endpoint = || {
        config
            .endpoint
            .clone()
            .ok_or_else(|| PipelineError::Config("embedding.endpoint is not set".to_string()))
    };

    let provider: Arc<dyn EmbeddingProvider> = match config.provider {
        EmbeddingProviderKind::Hash => {
            Arc::new(HashEmbedding::new(&config.model_id, config.dimension))
        }
        EmbeddingProviderKind::Ollama => Arc::new(OllamaEmbedding::new(
            &endpoint()?,
            &config.model_id,
            config.dimension,
        )),
        EmbeddingProviderKind::Openai => {
            let api_key = config
                .api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok());
            Arc::new(OpenAiEmbedding::new(
                &endpoint()?,
                &config.model_id,
                api_key,
                config.dimension,
            ))
        }
    };

    Ok(provider)
}

/// Destination for finished batches
pub trait EmbeddingSink {
    /// Chunk ids among `chunk_ids` that already have a vector under `model_id`
    fn existing(&self, model_id: &str, chunk_ids: &[String]) -> Result<HashSet<String>>;

    /// Persist one batch
    fn persist(&mut self, batch: &[Embedding]) -> Result<()>;
}

impl EmbeddingSink for &Database {
    fn existing(&self, model_id: &str, chunk_ids: &[String]) -> Result<HashSet<String>> {
        self.embedded_chunk_ids(model_id, chunk_ids)
    }

    fn persist(&mut self, batch: &[Embedding]) -> Result<()> {
        self.put_embeddings(batch)?;
        Ok(())
    }
}

/// In-memory sink, used by ad-hoc callers and tests
impl EmbeddingSink for Vec<Embedding> {
    fn existing(&self, model_id: &str, chunk_ids: &[String]) -> Result<HashSet<String>> {
        let wanted: HashSet<&String> = chunk_ids.iter().collect();
        Ok(self
            .iter()
            .filter(|e| e.model_id == model_id && wanted.contains(&e.chunk_id))
            .map(|e| e.chunk_id.clone())
            .collect())
    }

    fn persist(&mut self, batch: &[Embedding]) -> Result<()> {
        self.extend_from_slice(batch);
        Ok(())
    }
}

/// Counts reported by one embedding pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EmbedSummary {
    pub requested: usize,
    pub already_embedded: usize,
    pub embedded: usize,
    pub batches: usize,
}

/// Batched, bounded-concurrency embedding driver
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    retry: RetryPolicy,
    batch_size: usize,
    concurrency: usize,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, retry: RetryPolicy, config: &EmbeddingConfig) -> Self {
        Self {
            provider,
            retry,
            batch_size: config.batch_size.max(1),
            concurrency: config.concurrency.max(1),
        }
    }

    pub fn model_id(&self) -> &str {
        self.provider.model_id()
    }

    pub fn provider(&self) -> Arc<dyn EmbeddingProvider> {
        self.provider.clone()
    }

    /// Embed `chunks` under `model_id`, skipping chunks the sink already holds
    /// for that model. Fails with `ModelUnavailable` if the backend cannot be
    /// reached after retries; batches finished before the failure stay
    /// persisted.
    pub async fn embed<S: EmbeddingSink>(
        &self,
        chunks: &[Chunk],
        model_id: &str,
        sink: &mut S,
    ) -> Result<EmbedSummary> {
        if model_id != self.provider.model_id() {
            return Err(PipelineError::ModelUnavailable {
                model_id: model_id.to_string(),
                reason: format!("configured provider serves {}", self.provider.model_id()),
            });
        }

        let ids: Vec<String> = chunks.iter().map(|c| c.chunk_id.clone()).collect();
        let existing = sink.existing(model_id, &ids)?;

        let mut seen = HashSet::new();
        let todo: Vec<&Chunk> = chunks
            .iter()
            .filter(|c| !existing.contains(&c.chunk_id) && seen.insert(c.chunk_id.as_str()))
            .collect();

        let mut summary = EmbedSummary {
            requested: chunks.len(),
            already_embedded: existing.len(),
            ..Default::default()
        };

        tracing::info!(
            model_id,
            requested = summary.requested,
            already_embedded = summary.already_embedded,
            to_embed = todo.len(),
            "embedding chunks"
        );

        let mut batches = todo.chunks(self.batch_size).map(|batch| {
            batch
                .iter()
                .map(|c| (c.chunk_id.clone(), c.text.clone()))
                .unzip::<_, _, Vec<String>, Vec<String>>()
        });

        let mut set: JoinSet<(Vec<String>, Result<Vec<Vec<f32>>>)> = JoinSet::new();
        let mut failure: Option<PipelineError> = None;

        loop {
            while failure.is_none() && set.len() < self.concurrency {
                let Some((ids, texts)) = batches.next() else {
                    break;
                };
                let provider = self.provider.clone();
                let retry = self.retry.clone();
                set.spawn(async move {
                    let result = retry
                        .run(provider.model_id(), || provider.embed_batch(&texts))
                        .await
                        .map_err(|e| model_unavailable(provider.model_id(), e));
                    (ids, result)
                });
            }

            let Some(joined) = set.join_next().await else {
                break;
            };

            let (ids, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    failure.get_or_insert(PipelineError::InvalidState(format!(
                        "embedding task panicked: {}",
                        e
                    )));
                    continue;
                }
            };

            match result.and_then(|vectors| self.check_batch(&ids, vectors)) {
                Ok(vectors) => {
                    let batch: Vec<Embedding> = ids
                        .into_iter()
                        .zip(vectors)
                        .map(|(chunk_id, vector)| Embedding {
                            chunk_id,
                            model_id: model_id.to_string(),
                            vector,
                        })
                        .collect();
                    sink.persist(&batch)?;
                    summary.embedded += batch.len();
                    summary.batches += 1;
                    tracing::debug!(model_id, batch = batch.len(), "persisted embedding batch");
                }
                Err(e) => {
                    tracing::warn!(model_id, error = %e, "embedding batch failed");
                    failure.get_or_insert(e);
                }
            }
        }

        match failure {
            Some(e) => {
                tracing::warn!(
                    model_id,
                    embedded = summary.embedded,
                    "embedding stopped early, finished batches kept"
                );
                Err(e)
            }
            None => Ok(summary),
        }
    }

    fn check_batch(&self, ids: &[String], vectors: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>> {
        let model_id = self.provider.model_id();
        if vectors.len() != ids.len() {
            return Err(PipelineError::ModelUnavailable {
                model_id: model_id.to_string(),
                reason: format!("expected {} vectors, got {}", ids.len(), vectors.len()),
            });
        }

        let expected = self.provider.dimension();
        if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
            return Err(PipelineError::InvalidState(format!(
                "model {} returned dimension {}, expected {}",
                model_id,
                bad.len(),
                expected
            )));
        }

        Ok(vectors)
    }
}

/// An embedding backend that stays unreachable after retries (including
/// timeouts) means the model cannot be served
fn model_unavailable(model_id: &str, err: PipelineError) -> PipelineError {
    match err {
        PipelineError::BackendUnavailable { reason, .. } => PipelineError::ModelUnavailable {
            model_id: model_id.to_string(),
            reason,
        },
        other => other,
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Hash provider that counts calls and can fail after a number of batches
    pub struct CountingProvider {
        inner: HashEmbedding,
        pub batches: AtomicUsize,
        pub texts: AtomicUsize,
        fail_after: Option<usize>,
    }

    impl CountingProvider {
        pub fn new(model_id: &str, dimension: usize) -> Self {
            Self {
                inner: HashEmbedding::new(model_id, dimension),
                batches: AtomicUsize::new(0),
                texts: AtomicUsize::new(0),
                fail_after: None,
            }
        }

        pub fn failing_after(mut self, batches: usize) -> Self {
            self.fail_after = Some(batches);
            self
        }

        pub fn texts_embedded(&self) -> usize {
            self.texts.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl EmbeddingProvider for CountingProvider {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let n = self.batches.fetch_add(1, Ordering::SeqCst);
            if self.fail_after.is_some_and(|limit| n >= limit) {
                return Err(PipelineError::ModelUnavailable {
                    model_id: self.model_id().to_string(),
                    reason: "connection refused".to_string(),
                });
            }
            self.texts.fetch_add(texts.len(), Ordering::SeqCst);
            self.inner.embed_batch(texts).await
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        fn model_id(&self) -> &str {
            self.inner.model_id()
        }
    }

    /// Retry policy without delays
    pub fn no_retry() -> RetryPolicy {
        RetryPolicy {
            timeout: std::time::Duration::from_secs(5),
            max_retries: 0,
            initial_backoff: std::time::Duration::from_millis(1),
            max_backoff: std::time::Duration::from_millis(1),
        }
    }
}
