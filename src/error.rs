//! Error taxonomy for the retrieval-and-report pipeline

use thiserror::Error;

/// Library result type
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors raised by pipeline components
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A document, chunk or build id that does not resolve. Never retried.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// An embedding or generation backend could not be reached
    #[error("{backend} backend unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    /// The embedding backend is up but cannot serve the requested model
    #[error("embedding model {model_id} unavailable: {reason}")]
    ModelUnavailable { model_id: String, reason: String },

    /// Context assembly cannot fit a single passage into the budget
    #[error("context budget of {budget} chars cannot fit a passage for intent '{intent}'")]
    BudgetExceeded { intent: String, budget: usize },

    /// No documents exist for a ticker
    #[error("corpus has no documents for {ticker}")]
    CorpusEmpty { ticker: String },

    /// Configuration rejected at load time
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Illegal state-machine transition or inconsistent persisted state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Attempt to resume or mutate a finalized build
    #[error("build {0} is finalized and immutable")]
    BuildFinalized(String),

    /// Cooperative cancellation observed between stages
    #[error("build cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        PipelineError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn backend(backend: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        PipelineError::BackendUnavailable {
            backend: backend.into(),
            reason: reason.to_string(),
        }
    }

    /// Transient backend failures are retried with backoff inside a stage
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::BackendUnavailable { .. } | PipelineError::ModelUnavailable { .. }
        )
    }

    /// Storage-layer failures abort the whole build
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::Storage(_) | PipelineError::Io(_))
    }
}
