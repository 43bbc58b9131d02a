//! In-memory vector index with per-ticker partitions
//!
//! Vectors are L2-normalized on insert so a dot product is the cosine
//! similarity. Every ticker lives in its own partition: a scoped search only
//! ever scans that partition, which is what keeps one company's passages out
//! of another company's report.

use crate::error::{PipelineError, Result};
use crate::storage::write_atomic;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// A vector tagged with the ticker that owns its chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub chunk_id: String,
    pub ticker: String,
    pub vector: Vec<f32>,
}

/// Restricts a search to one ticker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchFilter {
    pub ticker: String,
}

impl SearchFilter {
    pub fn ticker(ticker: &str) -> Self {
        Self {
            ticker: ticker.to_string(),
        }
    }
}

/// One nearest-neighbour hit
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub chunk_id: String,
    pub ticker: String,
    pub score: f64,
}

/// Byte-stable on-disk form
#[derive(Debug, Serialize, Deserialize)]
struct IndexSnapshot {
    model_id: String,
    dimension: usize,
    entries: Vec<IndexEntry>,
}

/// Cosine-similarity index over chunk embeddings
#[derive(Debug, Clone)]
pub struct VectorIndex {
    model_id: String,
    dimension: usize,
    /// ticker -> chunk_id -> unit vector
    partitions: BTreeMap<String, BTreeMap<String, Vec<f32>>>,
    /// chunk_id -> owning ticker
    owners: HashMap<String, String>,
}

impl VectorIndex {
    pub fn new(model_id: &str, dimension: usize) -> Self {
        Self {
            model_id: model_id.to_string(),
            dimension,
            partitions: BTreeMap::new(),
            owners: HashMap::new(),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// Tickers with at least one vector
    pub fn tickers(&self) -> Vec<String> {
        self.partitions.keys().cloned().collect()
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.owners.contains_key(chunk_id)
    }

    /// Insert or replace the vector of a chunk
    pub fn insert(&mut self, entry: IndexEntry) -> Result<()> {
        if entry.vector.len() != self.dimension {
            return Err(PipelineError::InvalidState(format!(
                "vector for chunk {} has dimension {}, index expects {}",
                entry.chunk_id,
                entry.vector.len(),
                self.dimension
            )));
        }

        let unit = normalize(&entry.vector);
        self.place(entry.chunk_id, entry.ticker, unit);
        Ok(())
    }

    fn place(&mut self, chunk_id: String, ticker: String, unit: Vec<f32>) {
        if let Some(previous) = self.owners.get(&chunk_id) {
            if previous != &ticker {
                if let Some(partition) = self.partitions.get_mut(previous) {
                    partition.remove(&chunk_id);
                    if partition.is_empty() {
                        self.partitions.remove(previous);
                    }
                }
            }
        }

        self.owners.insert(chunk_id.clone(), ticker.clone());
        self.partitions
            .entry(ticker)
            .or_default()
            .insert(chunk_id, unit);
    }

    /// Replace the whole content, e.g. after a model migration
    pub fn rebuild(&mut self, model_id: &str, dimension: usize, entries: Vec<IndexEntry>) -> Result<()> {
        let mut fresh = VectorIndex::new(model_id, dimension);
        for entry in entries {
            fresh.insert(entry)?;
        }
        tracing::info!(model_id, vectors = fresh.len(), "rebuilt vector index");
        *self = fresh;
        Ok(())
    }

    /// Top `top_k` chunks by cosine similarity, ties broken by chunk id.
    /// With a filter only the ticker's partition is scanned.
    pub fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<SearchHit>> {
        if query.len() != self.dimension {
            return Err(PipelineError::InvalidState(format!(
                "query has dimension {}, index expects {}",
                query.len(),
                self.dimension
            )));
        }
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let query = normalize(query);
        let partitions: Vec<(&String, &BTreeMap<String, Vec<f32>>)> = match filter {
            Some(f) => self.partitions.get_key_value(&f.ticker).into_iter().collect(),
            None => self.partitions.iter().collect(),
        };

        let mut hits: Vec<SearchHit> = partitions
            .into_iter()
            .flat_map(|(ticker, partition)| {
                partition.iter().map(|(chunk_id, vector)| SearchHit {
                    chunk_id: chunk_id.clone(),
                    ticker: ticker.clone(),
                    score: dot(&query, vector),
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(top_k);

        if let Some(f) = filter {
            hits.retain(|hit| hit.ticker == f.ticker);
        }

        Ok(hits)
    }

    /// Write a sorted JSON snapshot
    pub fn save(&self, path: &Path) -> Result<()> {
        let entries = self
            .partitions
            .iter()
            .flat_map(|(ticker, partition)| {
                partition.iter().map(|(chunk_id, vector)| IndexEntry {
                    chunk_id: chunk_id.clone(),
                    ticker: ticker.clone(),
                    vector: vector.clone(),
                })
            })
            .collect();

        let snapshot = IndexSnapshot {
            model_id: self.model_id.clone(),
            dimension: self.dimension,
            entries,
        };
        write_atomic(path, &serde_json::to_vec(&snapshot)?)
    }

    /// Load a snapshot written by `save`
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read(path)?;
        let snapshot: IndexSnapshot = serde_json::from_slice(&content)?;

        // Snapshot vectors are already unit length
        let mut index = VectorIndex::new(&snapshot.model_id, snapshot.dimension);
        for entry in snapshot.entries {
            if entry.vector.len() != snapshot.dimension {
                return Err(PipelineError::InvalidState(format!(
                    "snapshot vector for chunk {} has dimension {}",
                    entry.chunk_id,
                    entry.vector.len()
                )));
            }
            index.place(entry.chunk_id, entry.ticker, entry.vector);
        }
        Ok(index)
    }
}

fn normalize(vector: &[f32]) -> Vec<f32> {
    let norm = vector.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm == 0.0 {
        return vector.to_vec();
    }
    vector.iter().map(|x| (*x as f64 / norm) as f32).collect()
}

fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(x, y)| *x as f64 * *y as f64).sum()
}

/// Cosine similarity of two raw vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot(a, b) / (norm_a * norm_b)
}
