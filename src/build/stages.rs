//! The seven pipeline stages
//!
//! Every stage reads its inputs from the database or from artifacts written
//! by earlier stages of the same build, so a resumed build can pick up at any
//! stage without in-memory state from a previous process.

use super::artifacts::{
    self, context_path, generation_path, retrieval_path, ArtifactWriter, GeneratedSection,
    RetrievalLog, SectionStatus,
};
use super::orchestrator::PipelineServices;
use super::StageName;
use crate::assemble::{AssembledContext, ContextAssembler};
use crate::chunk::{Chunk, Chunker};
use crate::config::PipelineConfig;
use crate::corpus::{CorpusLoader, FinancialContext};
use crate::embed::{Embedder, Embedding};
use crate::error::{PipelineError, Result};
use crate::index::VectorIndex;
use crate::llm::{plan_section, SectionPlan};
use crate::retrieve::{ChunkCatalog, IntentRetrieval, Retriever};
use crate::retry::RetryPolicy;
use crate::storage::Database;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// How a stage ended when it did not raise an error
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StageOutcome {
    Completed(Vec<String>),
    Skipped(String),
    /// Structural failure that is not an error of the stage itself
    Failed(String),
}

#[derive(Debug)]
pub(crate) struct StageOutput {
    pub outcome: StageOutcome,
    /// `(name, path relative to the build directory)`
    pub artifacts: Vec<(String, String)>,
}

impl StageOutput {
    fn completed(notes: Vec<String>) -> Self {
        Self {
            outcome: StageOutcome::Completed(notes),
            artifacts: Vec::new(),
        }
    }

    fn with_artifact(mut self, name: &str, relative: &str) -> Self {
        self.artifacts.push((name.to_string(), relative.to_string()));
        self
    }
}

/// Everything a stage may touch
pub(crate) struct StageEnv<'a> {
    pub db: &'a Database,
    pub config: &'a PipelineConfig,
    pub corpus_root: PathBuf,
    pub writer: &'a ArtifactWriter,
    pub services: &'a PipelineServices,
    pub retry: RetryPolicy,
    pub build_id: &'a str,
    pub tickers: &'a [String],
}

fn worker_failed(pool: &str, err: impl std::fmt::Display) -> PipelineError {
    PipelineError::InvalidState(format!("{} worker failed: {}", pool, err))
}

impl StageEnv<'_> {
    pub async fn run(&self, stage: StageName) -> Result<StageOutput> {
        match stage {
            StageName::Ingest => self.ingest(),
            StageName::Chunk => self.chunk(),
            StageName::Embed => self.embed().await,
            StageName::Index => self.index(),
            StageName::Retrieve => self.retrieve().await,
            StageName::Assemble => self.assemble(),
            StageName::Generate => self.generate().await,
        }
    }

    fn intents(&self) -> &[String] {
        &self.config.retrieval.intents
    }

    fn financial_contexts(&self) -> Result<BTreeMap<String, FinancialContext>> {
        Ok(self
            .writer
            .read_json(artifacts::FINANCIAL_CONTEXT)?
            .unwrap_or_default())
    }

    // ==================== Ingest ====================

    fn ingest(&self) -> Result<StageOutput> {
        let loader = CorpusLoader::new(&self.corpus_root);
        let mut notes = Vec::new();
        let mut contexts = BTreeMap::new();
        let mut total = 0;

        for ticker in self.tickers {
            let loaded = loader.load_ticker(ticker)?;
            for skipped in &loaded.skipped {
                notes.push(format!("{}: skipped {}", ticker, skipped));
            }
            if loaded.documents.is_empty() {
                notes.push(format!("{}: no documents, sections will be no_data", ticker));
            }

            let mut ids = Vec::with_capacity(loaded.documents.len());
            for document in &loaded.documents {
                ids.push(self.db.put_document(document)?);
            }
            self.db.link_build_documents(self.build_id, &ids)?;

            total += loaded.documents.len();
            contexts.insert(ticker.clone(), loaded.context);
        }

        if total == 0 {
            return Err(PipelineError::CorpusEmpty {
                ticker: self.tickers.join(","),
            });
        }

        let documents = self.db.build_documents(self.build_id)?;
        self.writer.write_jsonl(artifacts::DOCUMENTS, &documents)?;
        self.writer.write_json(artifacts::FINANCIAL_CONTEXT, &contexts)?;

        notes.insert(
            0,
            format!(
                "{} documents from {} tickers",
                documents.len(),
                self.tickers.len()
            ),
        );
        tracing::info!(build_id = self.build_id, documents = documents.len(), "ingest complete");

        Ok(StageOutput::completed(notes)
            .with_artifact("documents", artifacts::DOCUMENTS)
            .with_artifact("financial_context", artifacts::FINANCIAL_CONTEXT))
    }

    // ==================== Chunk ====================

    fn chunk(&self) -> Result<StageOutput> {
        let chunker = Chunker::new(&self.config.chunking);
        let documents = self.db.build_documents(self.build_id)?;

        let chunks: Vec<Chunk> = documents.iter().flat_map(|d| chunker.chunk(d)).collect();
        let inserted = self.db.put_chunks(&chunks)?;
        let ids: Vec<String> = chunks.iter().map(|c| c.chunk_id.clone()).collect();
        self.db.link_build_chunks(self.build_id, &ids)?;

        self.writer.write_jsonl(artifacts::CHUNKS, &chunks)?;
        tracing::info!(build_id = self.build_id, chunks = chunks.len(), inserted, "chunking complete");

        Ok(StageOutput::completed(vec![format!(
            "{} chunks from {} documents ({} new)",
            chunks.len(),
            documents.len(),
            inserted
        )])
        .with_artifact("chunks", artifacts::CHUNKS))
    }

    // ==================== Embed ====================

    async fn embed(&self) -> Result<StageOutput> {
        let chunks: Vec<Chunk> = self
            .db
            .build_sourced_chunks(self.build_id)?
            .into_iter()
            .map(|s| s.chunk)
            .collect();

        let embedder = Embedder::new(
            self.services.embedding.clone(),
            self.retry.clone(),
            &self.config.embedding,
        );
        let model_id = embedder.model_id().to_string();
        let mut sink = self.db;
        let summary = embedder.embed(&chunks, &model_id, &mut sink).await?;

        let mut ids: Vec<&str> = chunks.iter().map(|c| c.chunk_id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        let mut embeddings: Vec<Embedding> = Vec::with_capacity(ids.len());
        for id in ids {
            let embedding = self.db.get_embedding(id, &model_id)?.ok_or_else(|| {
                PipelineError::InvalidState(format!("chunk {} has no {} embedding", id, model_id))
            })?;
            embeddings.push(embedding);
        }
        self.writer.write_jsonl(artifacts::EMBEDDINGS, &embeddings)?;

        Ok(StageOutput::completed(vec![format!(
            "{} chunks under {}: {} embedded in {} batches, {} reused",
            summary.requested, model_id, summary.embedded, summary.batches, summary.already_embedded
        )])
        .with_artifact("embeddings", artifacts::EMBEDDINGS))
    }

    // ==================== Index ====================

    fn index(&self) -> Result<StageOutput> {
        let provider = &self.services.embedding;
        let model_id = provider.model_id();
        let dimension = provider.dimension();

        let expected = self.db.build_sourced_chunks(self.build_id)?.len();
        let entries = self.db.build_index_entries(self.build_id, model_id)?;
        if entries.len() != expected {
            return Err(PipelineError::InvalidState(format!(
                "{} of {} chunks have no {} embedding",
                expected - entries.len().min(expected),
                expected,
                model_id
            )));
        }

        let mut index = VectorIndex::new(model_id, dimension);
        index.rebuild(model_id, dimension, entries)?;
        index.save(&self.writer.path(artifacts::INDEX))?;

        Ok(StageOutput::completed(vec![format!(
            "{} vectors across {} tickers",
            index.len(),
            index.tickers().len()
        )])
        .with_artifact("index", artifacts::INDEX))
    }

    // ==================== Retrieve ====================

    async fn retrieve(&self) -> Result<StageOutput> {
        let index = Arc::new(VectorIndex::load(&self.writer.path(artifacts::INDEX))?);
        let catalog = Arc::new(ChunkCatalog::new(self.db.build_sourced_chunks(self.build_id)?));
        let retriever = Arc::new(Retriever::new(
            index,
            catalog,
            self.services.embedding.clone(),
            self.retry.clone(),
            self.config.retrieval.clone(),
        )?);
        let mut contexts = self.financial_contexts()?;

        let pool = Arc::new(Semaphore::new(self.config.retrieval.concurrency.max(1)));
        let mut workers = JoinSet::new();
        for ticker in self.tickers {
            let retriever = retriever.clone();
            let pool = pool.clone();
            let ticker = ticker.clone();
            let context = contexts.remove(&ticker).unwrap_or_default();
            let intents = self.intents().to_vec();

            workers.spawn(async move {
                let _permit = pool
                    .acquire_owned()
                    .await
                    .map_err(|e| worker_failed("retrieval", e))?;
                let mut out = Vec::with_capacity(intents.len());
                for intent in &intents {
                    out.push(retriever.retrieve_intent(intent, &ticker, &context).await?);
                }
                Ok::<_, PipelineError>(out)
            });
        }

        let mut results: BTreeMap<(String, String), IntentRetrieval> = BTreeMap::new();
        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            match joined.map_err(|e| worker_failed("retrieval", e)).and_then(|r| r) {
                Ok(retrievals) => {
                    for r in retrievals {
                        results.insert((r.ticker.clone(), r.intent_label.clone()), r);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "retrieval worker failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        let model_id = self.services.embedding.model_id().to_string();
        let mut notes = Vec::new();
        for ((ticker, intent), retrieval) in results {
            if retrieval.merged.is_empty() {
                notes.push(format!("{} {}: no passages retrieved", ticker, intent));
            }
            let log = RetrievalLog {
                model_id: model_id.clone(),
                retrieval,
            };
            self.writer.write_json(&retrieval_path(&ticker, &intent), &log)?;
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        Ok(StageOutput::completed(notes).with_artifact("retrieval", "retrieval/"))
    }

    // ==================== Assemble ====================

    fn assemble(&self) -> Result<StageOutput> {
        let catalog = Arc::new(ChunkCatalog::new(self.db.build_sourced_chunks(self.build_id)?));
        let assembler = ContextAssembler::new(catalog, self.config.assembly.min_passage_chars);
        let budget = self.config.assembly.budget_chars;

        let mut notes = Vec::new();
        for ticker in self.tickers {
            for intent in self.intents() {
                let path = retrieval_path(ticker, intent);
                let log: RetrievalLog = self
                    .writer
                    .read_json(&path)?
                    .ok_or_else(|| PipelineError::not_found("retrieval artifact", path))?;

                let context =
                    assembler.assemble(intent, ticker, &log.retrieval.merged, budget)?;
                if context.no_data {
                    notes.push(format!("{} {}: no_data", ticker, intent));
                }
                self.writer.write_json(&context_path(ticker, intent), &context)?;
            }
        }

        Ok(StageOutput::completed(notes).with_artifact("contexts", "contexts/"))
    }

    // ==================== Generate ====================

    async fn generate(&self) -> Result<StageOutput> {
        let Some(generator) = self.services.generator.clone() else {
            return Ok(StageOutput {
                outcome: StageOutcome::Skipped("no generation service configured".to_string()),
                artifacts: Vec::new(),
            });
        };
        let contexts = self.financial_contexts()?;
        let empty = FinancialContext::default();

        let mut notes = Vec::new();
        let mut kept = 0;
        let mut payloads = Vec::new();
        for ticker in self.tickers {
            let financial = contexts.get(ticker).unwrap_or(&empty);
            for intent in self.intents() {
                let out_path = generation_path(ticker, intent);
                let previous: Option<GeneratedSection> = self.writer.read_json(&out_path)?;
                if previous.is_some_and(|p| p.is_done()) {
                    kept += 1;
                    continue;
                }

                let path = context_path(ticker, intent);
                let context: AssembledContext = self
                    .writer
                    .read_json(&path)?
                    .ok_or_else(|| PipelineError::not_found("context artifact", path))?;

                match plan_section(&context, financial, &self.config.generation) {
                    SectionPlan::Generate(payload) => payloads.push(payload),
                    SectionPlan::Skip(reason) => {
                        notes.push(format!("{} {}: {}", ticker, intent, reason));
                        let section = GeneratedSection {
                            ticker: ticker.clone(),
                            intent_label: intent.clone(),
                            status: SectionStatus::Skipped,
                            grounded: false,
                            text: None,
                            model: None,
                            reason: Some(reason),
                        };
                        self.writer.write_json(&out_path, &section)?;
                    }
                }
            }
        }

        let pool = Arc::new(Semaphore::new(self.config.generation.concurrency.max(1)));
        let mut workers = JoinSet::new();
        for payload in payloads {
            let generator = generator.clone();
            let pool = pool.clone();
            workers.spawn(async move {
                let _permit = pool.acquire_owned().await;
                let result = generator.generate(&payload).await;
                (payload, result)
            });
        }

        let mut generated = 0;
        let mut failed = 0;
        while let Some(joined) = workers.join_next().await {
            let (payload, result) = joined.map_err(|e| worker_failed("generation", e))?;
            let mut section = GeneratedSection {
                ticker: payload.ticker.clone(),
                intent_label: payload.intent_label.clone(),
                status: SectionStatus::Generated,
                grounded: payload.grounded,
                text: None,
                model: Some(generator.model().to_string()),
                reason: None,
            };
            match result {
                Ok(generation) if generation.success => {
                    section.text = Some(generation.text);
                    generated += 1;
                }
                Ok(_) => {
                    section.status = SectionStatus::Failed;
                    section.reason = Some("generator returned no text".to_string());
                }
                Err(e) => {
                    tracing::warn!(
                        ticker = %payload.ticker,
                        intent = %payload.intent_label,
                        error = %e,
                        "section generation failed"
                    );
                    section.status = SectionStatus::Failed;
                    section.reason = Some(e.to_string());
                }
            }
            if section.status == SectionStatus::Failed {
                failed += 1;
            }
            self.writer.write_json(
                &generation_path(&section.ticker, &section.intent_label),
                &section,
            )?;
        }

        notes.insert(
            0,
            format!("{} sections generated, {} kept from a previous attempt", generated, kept),
        );

        let outcome = if failed > 0 {
            StageOutcome::Failed(format!(
                "{} of {} sections failed generation",
                failed,
                generated + failed
            ))
        } else {
            StageOutcome::Completed(notes)
        };

        Ok(StageOutput {
            outcome,
            artifacts: vec![("generation".to_string(), "generation/".to_string())],
        })
    }
}
