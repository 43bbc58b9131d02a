//! Budgeted, citation-tagged context assembly
//!
//! Selection is greedy by combined score, then document recency, then chunk
//! id. A chunk that does not fit is skipped and smaller ones are still
//! considered. `total_chars` never exceeds the budget: when not even the best
//! chunk fits, it is truncated to the budget, and a budget below the minimum
//! passage size is rejected with `BudgetExceeded`.

use crate::corpus::{FinancialContext, SourceType};
use crate::error::{PipelineError, Result};
use crate::retrieve::{ChunkCatalog, RetrievalResult};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Attribution of one selected passage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    /// 1-based marker used in the prompt, e.g. `[2]`
    pub marker: usize,
    pub chunk_id: String,
    pub document_id: String,
    pub ticker: String,
    pub source_type: SourceType,
    pub filing_kind: Option<String>,
    pub approximate_date: NaiveDate,
    pub char_start: usize,
    pub char_end: usize,
    /// Passage was cut to fit the budget
    #[serde(default)]
    pub truncated: bool,
}

impl Citation {
    /// `[n] ACME 10-K 2024-02-15 (3f9a1c2e)`
    pub fn render(&self) -> String {
        let kind = self
            .filing_kind
            .clone()
            .unwrap_or_else(|| self.source_type.to_string());
        let mut line = format!(
            "[{}] {} {} {} ({})",
            self.marker,
            self.ticker,
            kind,
            self.approximate_date,
            self.document_id.chars().take(8).collect::<String>()
        );
        if self.truncated {
            line.push_str(" [truncated]");
        }
        line
    }
}

/// Bounded context for one (ticker, intent)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssembledContext {
    pub intent_label: String,
    pub ticker: String,
    pub selected_chunks: Vec<String>,
    /// One citation per selected chunk, same order
    pub citation_index: Vec<Citation>,
    /// Passage text per selected chunk, same order
    pub passages: Vec<String>,
    pub total_chars: usize,
    pub budget_chars: usize,
    /// Nothing was retrieved; callers pick a degradation policy
    pub no_data: bool,
}

impl AssembledContext {
    /// Explicitly empty context
    pub fn empty(intent_label: &str, ticker: &str, budget_chars: usize) -> Self {
        Self {
            intent_label: intent_label.to_string(),
            ticker: ticker.to_string(),
            selected_chunks: Vec::new(),
            citation_index: Vec::new(),
            passages: Vec::new(),
            total_chars: 0,
            budget_chars,
            no_data: true,
        }
    }

    /// Boundary payload handed to a generation service
    pub fn payload(&self, financial_context: &FinancialContext) -> PromptPayload {
        PromptPayload {
            intent_label: self.intent_label.clone(),
            ticker: self.ticker.clone(),
            grounded: !self.no_data,
            citations: self.citation_index.iter().map(Citation::render).collect(),
            passages: self.passages.clone(),
            financial_context: financial_context.describe(),
        }
    }
}

/// Structured prompt input for the generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptPayload {
    pub intent_label: String,
    pub ticker: String,
    /// False when the payload carries no retrieved passages
    pub grounded: bool,
    pub citations: Vec<String>,
    pub passages: Vec<String>,
    /// `name=value` lines of structured metrics
    pub financial_context: Vec<String>,
}

/// Picks passages for a section within a character budget
pub struct ContextAssembler {
    catalog: Arc<ChunkCatalog>,
    min_passage_chars: usize,
}

impl ContextAssembler {
    pub fn new(catalog: Arc<ChunkCatalog>, min_passage_chars: usize) -> Self {
        Self {
            catalog,
            min_passage_chars,
        }
    }

    /// Greedy selection of `retrieval_results` for one intent of one ticker.
    /// Zero results produce an explicitly empty context with `no_data`.
    pub fn assemble(
        &self,
        intent_label: &str,
        ticker: &str,
        retrieval_results: &[RetrievalResult],
        budget_chars: usize,
    ) -> Result<AssembledContext> {
        if retrieval_results.is_empty() {
            tracing::info!(ticker, intent = intent_label, "no passages retrieved, context marked no_data");
            return Ok(AssembledContext::empty(intent_label, ticker, budget_chars));
        }

        let mut candidates = Vec::with_capacity(retrieval_results.len());
        for result in retrieval_results {
            let sourced = self.catalog.resolve(&result.chunk_id)?;
            if sourced.ticker != ticker {
                return Err(PipelineError::InvalidState(format!(
                    "chunk {} belongs to {}, not {}",
                    result.chunk_id, sourced.ticker, ticker
                )));
            }
            candidates.push((result, sourced));
        }

        candidates.sort_by(|(ra, sa), (rb, sb)| {
            rb.score
                .total_cmp(&ra.score)
                .then_with(|| sb.approximate_date.cmp(&sa.approximate_date))
                .then_with(|| ra.chunk_id.cmp(&rb.chunk_id))
        });
        let mut seen = HashSet::new();
        candidates.retain(|(result, _)| seen.insert(result.chunk_id.clone()));

        let mut context = AssembledContext {
            no_data: false,
            ..AssembledContext::empty(intent_label, ticker, budget_chars)
        };

        for (_, sourced) in &candidates {
            let len = sourced.chunk.char_len();
            if context.total_chars + len > budget_chars {
                continue;
            }
            push_passage(&mut context, sourced, sourced.chunk.text.clone(), sourced.chunk.char_end, false);
            context.total_chars += len;
        }

        if context.selected_chunks.is_empty() {
            if budget_chars < self.min_passage_chars.max(1) {
                return Err(PipelineError::BudgetExceeded {
                    intent: intent_label.to_string(),
                    budget: budget_chars,
                });
            }

            let (_, best) = &candidates[0];
            let text: String = best.chunk.text.chars().take(budget_chars).collect();
            let kept = text.chars().count();
            push_passage(&mut context, best, text, best.chunk.char_start + kept, true);
            context.total_chars = kept;
            tracing::debug!(
                ticker,
                intent = intent_label,
                chunk_id = %best.chunk.chunk_id,
                kept,
                "best passage truncated to budget"
            );
        }

        tracing::debug!(
            ticker,
            intent = intent_label,
            selected = context.selected_chunks.len(),
            total_chars = context.total_chars,
            budget_chars,
            "assembled context"
        );

        Ok(context)
    }
}

fn push_passage(
    context: &mut AssembledContext,
    sourced: &crate::chunk::SourcedChunk,
    text: String,
    char_end: usize,
    truncated: bool,
) {
    let chunk = &sourced.chunk;
    context.citation_index.push(Citation {
        marker: context.selected_chunks.len() + 1,
        chunk_id: chunk.chunk_id.clone(),
        document_id: chunk.document_id.clone(),
        ticker: sourced.ticker.clone(),
        source_type: sourced.source_type,
        filing_kind: sourced.filing_kind.clone(),
        approximate_date: sourced.approximate_date,
        char_start: chunk.char_start,
        char_end,
        truncated,
    });
    context.selected_chunks.push(chunk.chunk_id.clone());
    context.passages.push(text);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{Chunk, SourcedChunk};

    fn sourced(chunk_id: &str, ticker: &str, len: usize, date: &str) -> SourcedChunk {
        SourcedChunk {
            chunk: Chunk {
                chunk_id: chunk_id.to_string(),
                document_id: format!("doc-{}-0123456789", chunk_id),
                ordinal: 0,
                char_start: 100,
                char_end: 100 + len,
                text: "x".repeat(len),
                token_count: 1,
            },
            ticker: ticker.to_string(),
            source_type: SourceType::Filing,
            filing_kind: Some("10-K".to_string()),
            filed_on: NaiveDate::parse_from_str(date, "%Y-%m-%d").ok(),
            approximate_date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
        }
    }

    fn result(chunk_id: &str, score: f64) -> RetrievalResult {
        RetrievalResult {
            query_id: "ACME:risk_factors:0".to_string(),
            chunk_id: chunk_id.to_string(),
            similarity_score: score,
            keyword_boost: 0.0,
            recency_boost: 0.0,
            score,
            rank: 0,
        }
    }

    fn assembler(chunks: Vec<SourcedChunk>) -> ContextAssembler {
        ContextAssembler::new(Arc::new(ChunkCatalog::new(chunks)), 50)
    }

    #[test]
    fn test_greedy_selection_respects_budget() {
        let asm = assembler(vec![
            sourced("a", "ACME", 400, "2024-01-01"),
            sourced("b", "ACME", 700, "2024-01-01"),
            sourced("c", "ACME", 300, "2024-01-01"),
        ]);
        let results = vec![result("a", 0.9), result("b", 0.8), result("c", 0.7)];

        let ctx = asm.assemble("risk_factors", "ACME", &results, 1000).unwrap();
        // b does not fit after a; c still does
        assert_eq!(ctx.selected_chunks, vec!["a", "c"]);
        assert_eq!(ctx.total_chars, 700);
        assert!(!ctx.no_data);
        assert_eq!(ctx.citation_index[1].marker, 2);
    }

    #[test]
    fn test_ties_break_by_recency_then_chunk_id() {
        let asm = assembler(vec![
            sourced("b", "ACME", 10, "2022-01-01"),
            sourced("c", "ACME", 10, "2024-01-01"),
            sourced("a", "ACME", 10, "2022-01-01"),
        ]);
        let results = vec![result("a", 0.5), result("b", 0.5), result("c", 0.5)];

        let ctx = asm.assemble("guidance", "ACME", &results, 1000).unwrap();
        assert_eq!(ctx.selected_chunks, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_oversized_best_chunk_is_truncated() {
        let asm = assembler(vec![sourced("big", "ACME", 5000, "2024-01-01")]);
        let ctx = asm
            .assemble("risk_factors", "ACME", &[result("big", 0.9)], 1200)
            .unwrap();

        assert_eq!(ctx.total_chars, 1200);
        assert_eq!(ctx.passages[0].chars().count(), 1200);
        let citation = &ctx.citation_index[0];
        assert!(citation.truncated);
        assert_eq!(citation.char_end - citation.char_start, 1200);
        assert!(citation.render().ends_with("[truncated]"));
    }

    #[test]
    fn test_budget_below_minimum_passage_is_rejected() {
        let asm = assembler(vec![sourced("big", "ACME", 500, "2024-01-01")]);
        let err = asm
            .assemble("risk_factors", "ACME", &[result("big", 0.9)], 20)
            .unwrap_err();
        assert!(matches!(err, PipelineError::BudgetExceeded { budget: 20, .. }));
    }

    #[test]
    fn test_zero_results_is_no_data_not_error() {
        let asm = assembler(vec![]);
        let ctx = asm.assemble("risk_factors", "NEWCO", &[], 1000).unwrap();

        assert!(ctx.no_data);
        assert!(ctx.selected_chunks.is_empty());
        assert_eq!(ctx.total_chars, 0);
        assert!(!ctx.payload(&FinancialContext::default()).grounded);
    }

    #[test]
    fn test_unknown_chunk_is_not_found() {
        let asm = assembler(vec![]);
        let err = asm
            .assemble("risk_factors", "ACME", &[result("ghost", 0.9)], 1000)
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { .. }));
    }

    #[test]
    fn test_citation_rendering_and_payload() {
        let asm = assembler(vec![sourced("a", "ACME", 40, "2024-02-15")]);
        let ctx = asm.assemble("cash_flow", "ACME", &[result("a", 0.9)], 100).unwrap();

        assert_eq!(ctx.citation_index[0].render(), "[1] ACME 10-K 2024-02-15 (doc-a-01)");

        let mut metrics = FinancialContext::default();
        metrics.metrics.insert("free_cash_flow".to_string(), 1.5);
        let payload = ctx.payload(&metrics);
        assert!(payload.grounded);
        assert_eq!(payload.passages.len(), 1);
        assert_eq!(payload.financial_context, vec!["free_cash_flow=1.5"]);
    }
}
