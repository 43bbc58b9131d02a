//! Query planning and relevance-ranked retrieval
//!
//! This module handles:
//! - Expanding an analysis intent into a fixed set of sub-queries
//! - Scoped nearest-neighbour search per sub-query
//! - Keyword and recency re-scoring, dedup across sub-queries

mod planner;
mod retriever;

pub use planner::{intent_profile, IntentProfile, QueryPlanner};
pub use retriever::{ChunkCatalog, IntentRetrieval, Retriever};

use serde::{Deserialize, Serialize};

/// Intent labels with a built-in facet catalog
pub const KNOWN_INTENTS: &[&str] = &[
    "revenue_outlook",
    "profitability",
    "cash_flow",
    "guidance",
    "risk_factors",
];

/// One sub-query derived from an intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalQuery {
    /// `<ticker>:<intent>:<ordinal>`
    pub query_id: String,
    pub ticker: String,
    pub intent_label: String,
    pub query_text: String,
}

/// A ranked hit for one query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub query_id: String,
    pub chunk_id: String,
    /// Raw cosine similarity from the index
    pub similarity_score: f64,
    pub keyword_boost: f64,
    pub recency_boost: f64,
    /// Combined score used for ranking
    pub score: f64,
    /// 1-based position in the result list
    pub rank: usize,
}

/// Sort by combined score descending, chunk id ascending, and renumber ranks
pub(crate) fn rank_results(results: &mut [RetrievalResult]) {
    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    for (i, result) in results.iter_mut().enumerate() {
        result.rank = i + 1;
    }
}
