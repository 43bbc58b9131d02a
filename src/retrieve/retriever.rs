//! Similarity search plus secondary re-scoring

use super::planner::{intent_profile, QueryPlanner};
use super::{rank_results, RetrievalQuery, RetrievalResult};
use crate::chunk::SourcedChunk;
use crate::config::RetrievalConfig;
use crate::corpus::FinancialContext;
use crate::embed::{tokenize, EmbeddingProvider};
use crate::error::{PipelineError, Result};
use crate::index::{SearchFilter, VectorIndex};
use crate::retry::RetryPolicy;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Nearest neighbours fetched per requested result before re-scoring
const CANDIDATE_FACTOR: usize = 2;

/// Read-only view of a build's chunks, shared by retrieval and assembly
#[derive(Debug, Default)]
pub struct ChunkCatalog {
    chunks: HashMap<String, SourcedChunk>,
    /// Newest explicit filing date per ticker
    newest: HashMap<String, NaiveDate>,
}

impl ChunkCatalog {
    pub fn new(chunks: Vec<SourcedChunk>) -> Self {
        let mut newest: HashMap<String, NaiveDate> = HashMap::new();
        for sourced in &chunks {
            if let Some(date) = sourced.filed_on {
                newest
                    .entry(sourced.ticker.clone())
                    .and_modify(|d| *d = (*d).max(date))
                    .or_insert(date);
            }
        }

        Self {
            chunks: chunks
                .into_iter()
                .map(|s| (s.chunk.chunk_id.clone(), s))
                .collect(),
            newest,
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn get(&self, chunk_id: &str) -> Option<&SourcedChunk> {
        self.chunks.get(chunk_id)
    }

    /// Resolve a chunk id; a miss means the caller handed out an id that was
    /// never stored
    pub fn resolve(&self, chunk_id: &str) -> Result<&SourcedChunk> {
        self.get(chunk_id)
            .ok_or_else(|| PipelineError::not_found("chunk", chunk_id))
    }

    pub fn newest_date(&self, ticker: &str) -> Option<NaiveDate> {
        self.newest.get(ticker).copied()
    }
}

/// Everything retrieved for one (ticker, intent)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentRetrieval {
    pub ticker: String,
    pub intent_label: String,
    pub queries: Vec<RetrievalQuery>,
    /// Per-query result lists, in query order
    pub per_query: Vec<Vec<RetrievalResult>>,
    /// Deduplicated across sub-queries, best occurrence kept
    pub merged: Vec<RetrievalResult>,
}

/// Executes retrieval queries against a vector index
pub struct Retriever {
    index: Arc<VectorIndex>,
    catalog: Arc<ChunkCatalog>,
    provider: Arc<dyn EmbeddingProvider>,
    retry: RetryPolicy,
    config: RetrievalConfig,
    planner: QueryPlanner,
}

impl Retriever {
    pub fn new(
        index: Arc<VectorIndex>,
        catalog: Arc<ChunkCatalog>,
        provider: Arc<dyn EmbeddingProvider>,
        retry: RetryPolicy,
        config: RetrievalConfig,
    ) -> Result<Self> {
        if index.model_id() != provider.model_id() {
            return Err(PipelineError::ModelUnavailable {
                model_id: provider.model_id().to_string(),
                reason: format!("index was built with {}", index.model_id()),
            });
        }

        Ok(Self {
            index,
            catalog,
            provider,
            retry,
            config,
            planner: QueryPlanner::new(),
        })
    }

    pub fn catalog(&self) -> Arc<ChunkCatalog> {
        self.catalog.clone()
    }

    /// Run one query: scoped nearest-neighbour search, then re-score by
    /// keyword overlap and recency. Results carry no duplicate chunk ids.
    pub async fn retrieve(&self, query: &RetrievalQuery) -> Result<Vec<RetrievalResult>> {
        let provider = self.provider.clone();
        let vector = self
            .retry
            .run(provider.model_id(), || provider.embed(&query.query_text))
            .await?;

        let filter = SearchFilter::ticker(&query.ticker);
        let hits = self.index.search(
            &vector,
            self.config.top_k * CANDIDATE_FACTOR,
            Some(&filter),
        )?;

        let keywords: HashSet<&str> = intent_profile(&query.intent_label)
            .map(|profile| profile.keywords.iter().copied().collect())
            .unwrap_or_default();

        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            let sourced = self.catalog.resolve(&hit.chunk_id)?;
            if sourced.ticker != query.ticker {
                return Err(PipelineError::InvalidState(format!(
                    "chunk {} of {} surfaced in a {} search",
                    hit.chunk_id, sourced.ticker, query.ticker
                )));
            }

            let keyword_boost = self.config.keyword_weight * keyword_overlap(&keywords, &sourced.chunk.text);
            let recency_boost = self.config.recency_weight * self.recency(sourced);

            results.push(RetrievalResult {
                query_id: query.query_id.clone(),
                chunk_id: hit.chunk_id,
                similarity_score: hit.score,
                keyword_boost,
                recency_boost,
                score: hit.score + keyword_boost + recency_boost,
                rank: 0,
            });
        }

        rank_results(&mut results);
        results.truncate(self.config.top_k);

        tracing::debug!(
            query_id = %query.query_id,
            results = results.len(),
            "retrieved"
        );

        Ok(results)
    }

    /// Plan an intent, run every sub-query, and merge: a chunk found by
    /// several sub-queries keeps only its best-scoring occurrence
    pub async fn retrieve_intent(
        &self,
        intent_label: &str,
        ticker: &str,
        context: &FinancialContext,
    ) -> Result<IntentRetrieval> {
        let queries = self.planner.plan(intent_label, ticker, context)?;

        let mut per_query = Vec::with_capacity(queries.len());
        for query in &queries {
            per_query.push(self.retrieve(query).await?);
        }

        let merged = merge_results(&per_query);

        tracing::info!(
            ticker,
            intent = intent_label,
            queries = queries.len(),
            merged = merged.len(),
            "intent retrieval complete"
        );

        Ok(IntentRetrieval {
            ticker: ticker.to_string(),
            intent_label: intent_label.to_string(),
            queries,
            per_query,
            merged,
        })
    }

    /// 0.5^(age / half_life), age measured from the ticker's newest filing so
    /// identical inputs score identically on any day
    fn recency(&self, sourced: &SourcedChunk) -> f64 {
        let (Some(filed_on), Some(newest)) = (sourced.filed_on, self.catalog.newest_date(&sourced.ticker))
        else {
            return 0.0;
        };

        let age_days = (newest - filed_on).num_days().max(0) as f64;
        0.5f64.powf(age_days / self.config.recency_half_life_days)
    }
}

/// Share of intent keywords present in the passage
fn keyword_overlap(keywords: &HashSet<&str>, text: &str) -> f64 {
    if keywords.is_empty() {
        return 0.0;
    }

    let tokens: HashSet<String> = tokenize(text).into_iter().collect();
    let hits = keywords.iter().filter(|k| tokens.contains(**k)).count();
    hits as f64 / keywords.len() as f64
}

/// Dedupe by chunk id keeping the highest score (earliest query on ties)
fn merge_results(per_query: &[Vec<RetrievalResult>]) -> Vec<RetrievalResult> {
    let mut best: HashMap<&str, &RetrievalResult> = HashMap::new();
    for result in per_query.iter().flatten() {
        best.entry(result.chunk_id.as_str())
            .and_modify(|current| {
                if result.score > current.score {
                    *current = result;
                }
            })
            .or_insert(result);
    }

    let mut merged: Vec<RetrievalResult> = best.into_values().cloned().collect();
    rank_results(&mut merged);
    merged
}
