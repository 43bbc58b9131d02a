//! filinglens - Versioned retrieval pipeline over company filings
//!
//! This library turns a per-ticker corpus of filings, price series and
//! metrics into cited, budget-bounded context for valuation report sections:
//! document store, chunker, embedder, vector index, retriever, context
//! assembler and the build orchestrator that ties them together.

pub mod assemble;
pub mod build;
pub mod chunk;
pub mod cli;
pub mod config;
pub mod corpus;
pub mod embed;
pub mod error;
pub mod index;
pub mod llm;
pub mod retrieve;
pub mod retry;
pub mod storage;

/// Re-export commonly used types
pub use assemble::{AssembledContext, ContextAssembler};
pub use build::{BuildRecord, BuildRequest, Orchestrator};
pub use chunk::{Chunk, Chunker};
pub use config::PipelineConfig;
pub use corpus::{CorpusLoader, Document};
pub use index::VectorIndex;
pub use retrieve::Retriever;
pub use storage::Database;

/// Library error type
pub use error::{PipelineError, Result};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_NAME: &str = "filinglens";
