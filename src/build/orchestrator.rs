//! Drives builds through their stages

use super::artifacts::{self, ArtifactWriter};
use super::report::render_report;
use super::stages::{StageEnv, StageOutcome};
use super::{BuildRecord, StageName, StageStatus};
use crate::assemble::{AssembledContext, ContextAssembler};
use crate::config::{validate_ticker, PipelineConfig, DATABASE_FILE, DEFAULT_SCOPE, WORKSPACE_DIR};
use crate::corpus::FinancialContext;
use crate::embed::{provider_from_config, EmbedSummary, Embedder, EmbeddingProvider};
use crate::error::{PipelineError, Result};
use crate::index::VectorIndex;
use crate::llm::{generator_from_config, GenerationService};
use crate::retrieve::{ChunkCatalog, IntentRetrieval, Retriever};
use crate::retry::RetryPolicy;
use crate::storage::Database;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// External backends a build talks to
#[derive(Clone)]
pub struct PipelineServices {
    pub embedding: Arc<dyn EmbeddingProvider>,
    /// `None` skips the generate stage
    pub generator: Option<Arc<dyn GenerationService>>,
}

impl PipelineServices {
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        Ok(Self {
            embedding: provider_from_config(&config.embedding)?,
            generator: generator_from_config(
                &config.generation,
                RetryPolicy::from_config(&config.backend),
            )?,
        })
    }
}

/// Cooperative cancellation, observed between stages
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Trip the flag on the first Ctrl-C. Must be called inside a runtime.
    pub fn cancel_on_ctrl_c(&self) {
        let flag = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, stopping after the current stage");
                flag.cancel();
            }
        });
    }
}

/// What to build
#[derive(Debug, Clone, PartialEq)]
pub struct BuildRequest {
    pub scope: String,
    pub tickers: Vec<String>,
    pub stages: Vec<StageName>,
}

impl BuildRequest {
    /// All stages over the given tickers
    pub fn new(scope: &str, tickers: Vec<String>) -> Self {
        Self {
            scope: scope.to_string(),
            tickers,
            stages: StageName::ALL.to_vec(),
        }
    }

    pub fn with_stages(mut self, stages: Vec<StageName>) -> Self {
        self.stages = stages;
        self
    }

    /// Explicit tickers win over the scope's configured ticker set
    pub fn resolve(config: &PipelineConfig, scope: Option<&str>, tickers: &[String]) -> Result<Self> {
        let scope = scope.unwrap_or(DEFAULT_SCOPE);
        let tickers = if tickers.is_empty() {
            config.scope_tickers(scope)?
        } else {
            tickers.to_vec()
        };
        Ok(Self::new(scope, tickers))
    }
}

fn ensure_workspace(root: &Path) -> Result<PathBuf> {
    let workspace = root.join(WORKSPACE_DIR);
    if !workspace.is_dir() {
        return Err(PipelineError::Config(format!(
            "{} is not initialized; run 'filinglens init' first",
            root.display()
        )));
    }
    Ok(workspace)
}

/// Result of driving a build until it settles or aborts
#[derive(Debug, Clone, Serialize)]
pub struct BuildOutcome {
    pub record: BuildRecord,
    pub build_dir: PathBuf,
    /// The scope's latest pointer now references this build
    pub latest_updated: bool,
}

impl BuildOutcome {
    pub fn is_successful(&self) -> bool {
        self.record.is_successful()
    }
}

/// Ad-hoc retrieval against a finished build
#[derive(Debug, Clone, Serialize)]
pub struct QueryAnswer {
    pub build_id: String,
    pub retrieval: IntentRetrieval,
    pub context: AssembledContext,
}

/// Result of a model-migration reindex
#[derive(Debug, Clone, Serialize)]
pub struct ReindexSummary {
    pub build_id: String,
    pub model_id: String,
    pub embedded: EmbedSummary,
    pub entries: usize,
    pub path: PathBuf,
}

/// Owns the store and the configuration; the only writer of build records
pub struct Orchestrator {
    db: Database,
    config: PipelineConfig,
    root: PathBuf,
    services: PipelineServices,
    retry: RetryPolicy,
    cancel: CancelFlag,
}

impl Orchestrator {
    pub fn new<P: Into<PathBuf>>(
        db: Database,
        config: PipelineConfig,
        root: P,
        services: PipelineServices,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config.backend);
        Self {
            db,
            config,
            root: root.into(),
            services,
            retry,
            cancel: CancelFlag::new(),
        }
    }

    /// Open an initialized workspace with services built from its config
    pub fn open(root: &Path) -> Result<Self> {
        ensure_workspace(root)?;
        let config = PipelineConfig::load_or_default(root)?;
        Self::open_with_config(root, config)
    }

    /// Open an initialized workspace with an already-adjusted config
    pub fn open_with_config(root: &Path, config: PipelineConfig) -> Result<Self> {
        let workspace = ensure_workspace(root)?;
        config.validate()?;
        let db = Database::open(workspace.join(DATABASE_FILE))?;
        let services = PipelineServices::from_config(&config)?;
        Ok(Self::new(db, config, root, services))
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn build_dir(&self, build_id: &str) -> PathBuf {
        self.root.join(WORKSPACE_DIR).join("builds").join(build_id)
    }

    fn reindex_path(&self, build_id: &str, model_id: &str) -> PathBuf {
        let file: String = model_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || "-_.".contains(c) { c } else { '_' })
            .collect();
        self.root
            .join(WORKSPACE_DIR)
            .join("indexes")
            .join(build_id)
            .join(format!("{}.json", file))
    }

    /// Start a new build
    pub async fn run(&self, request: BuildRequest) -> Result<BuildOutcome> {
        if request.tickers.is_empty() {
            return Err(PipelineError::Config("a build needs at least one ticker".to_string()));
        }
        let mut tickers = Vec::with_capacity(request.tickers.len());
        for ticker in request.tickers {
            validate_ticker(&ticker)?;
            if !tickers.contains(&ticker) {
                tickers.push(ticker);
            }
        }

        let record = BuildRecord::new(
            &request.scope,
            tickers,
            &request.stages,
            &self.config.fingerprint(),
            Utc::now(),
        );
        self.db.save_build(&record)?;
        tracing::info!(
            build_id = %record.build_id,
            scope = %record.scope,
            tickers = ?record.ticker_set,
            "build created"
        );

        self.drive(record).await
    }

    /// Re-run the failed, skipped and pending stages of a non-finalized build
    pub async fn resume(&self, build_id: &str) -> Result<BuildOutcome> {
        let mut record = self.db.load_build(build_id)?;
        if record.config_fingerprint != self.config.fingerprint() {
            tracing::warn!(
                build_id,
                "configuration changed since the build started; completed stages are kept"
            );
        }

        let reopened = record.prepare_resume()?;
        self.db.save_build(&record)?;
        tracing::info!(build_id, stages = ?reopened, "resuming build");

        self.drive(record).await
    }

    async fn drive(&self, mut record: BuildRecord) -> Result<BuildOutcome> {
        let writer = ArtifactWriter::new(self.build_dir(&record.build_id));
        let tickers = record.ticker_set.clone();
        let build_id = record.build_id.clone();
        let env = StageEnv {
            db: &self.db,
            config: &self.config,
            corpus_root: self.config.corpus_path(&self.root),
            writer: &writer,
            services: &self.services,
            retry: self.retry.clone(),
            build_id: &build_id,
            tickers: &tickers,
        };

        while let Some(stage) = record.next_runnable() {
            if self.cancel.is_cancelled() {
                return self.abort(record, &writer, &format!("cancelled before {} stage", stage));
            }

            record.start_stage(stage, Utc::now())?;
            self.db.save_build(&record)?;
            tracing::info!(build_id = %build_id, %stage, "stage started");

            match env.run(stage).await {
                Ok(output) => {
                    for (name, path) in &output.artifacts {
                        record.record_artifact(name, path);
                    }
                    match output.outcome {
                        StageOutcome::Completed(notes) => {
                            record.complete_stage(stage, notes, Utc::now())?;
                            tracing::info!(build_id = %build_id, %stage, "stage completed");
                        }
                        StageOutcome::Skipped(reason) => {
                            record.skip_stage(stage, &reason, Utc::now())?;
                            tracing::info!(build_id = %build_id, %stage, %reason, "stage skipped");
                        }
                        StageOutcome::Failed(reason) => {
                            record.fail_stage(stage, &reason, Utc::now())?;
                            tracing::warn!(build_id = %build_id, %stage, %reason, "stage failed");
                        }
                    }
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(build_id = %build_id, %stage, error = %e, "fatal error, aborting build");
                    record.fail_stage(stage, &e.to_string(), Utc::now())?;
                    if let Err(save_err) = self.abort(record, &writer, &e.to_string()) {
                        tracing::error!(error = %save_err, "could not persist aborted build");
                    }
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(build_id = %build_id, %stage, error = %e, "stage failed");
                    record.fail_stage(stage, &e.to_string(), Utc::now())?;
                }
            }
            self.db.save_build(&record)?;
        }

        if !record.is_settled() {
            return Err(PipelineError::InvalidState(format!(
                "build {} stalled with unrunnable stages",
                build_id
            )));
        }

        self.finish(record, &writer)
    }

    fn abort(
        &self,
        mut record: BuildRecord,
        writer: &ArtifactWriter,
        reason: &str,
    ) -> Result<BuildOutcome> {
        record.abort(reason)?;
        record.record_artifact("manifest", artifacts::MANIFEST);
        self.db.save_build(&record)?;
        writer.write_json(artifacts::MANIFEST, &record)?;
        tracing::warn!(build_id = %record.build_id, reason, "build aborted");

        Ok(BuildOutcome {
            build_dir: writer.dir().to_path_buf(),
            record,
            latest_updated: false,
        })
    }

    fn finish(&self, mut record: BuildRecord, writer: &ArtifactWriter) -> Result<BuildOutcome> {
        record.finalize(Utc::now())?;

        let report = render_report(&record, writer, &self.config.retrieval.intents)
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "report rendering failed");
                format!("# Build {}\n\nReport unavailable: {}\n", record.build_id, e)
            });
        writer.write_text(artifacts::REPORT, &report)?;
        record.record_artifact("report", artifacts::REPORT);
        record.record_artifact("manifest", artifacts::MANIFEST);
        writer.write_json(artifacts::MANIFEST, &record)?;

        let latest_updated = self.db.finalize_build(&record)?;
        tracing::info!(
            build_id = %record.build_id,
            failed = ?record.failed_stages(),
            latest_updated,
            "build finalized"
        );

        Ok(BuildOutcome {
            build_dir: writer.dir().to_path_buf(),
            record,
            latest_updated,
        })
    }

    /// Resolve an explicit build id or the scope's latest successful build
    pub fn resolve_build(&self, build_id: Option<&str>, scope: &str) -> Result<BuildRecord> {
        let id = match build_id {
            Some(id) => id.to_string(),
            None => self
                .db
                .latest_build(scope)?
                .ok_or_else(|| PipelineError::not_found("latest build for scope", scope))?,
        };
        self.db.load_build(&id)
    }

    /// Index for the configured embedding model: the build's own snapshot, or
    /// one produced by `reindex`
    fn load_index(&self, build_id: &str) -> Result<VectorIndex> {
        let model_id = self.services.embedding.model_id();
        let reindexed = self.reindex_path(build_id, model_id);
        if reindexed.is_file() {
            return VectorIndex::load(&reindexed);
        }

        let path = self.build_dir(build_id).join(artifacts::INDEX);
        if !path.is_file() {
            return Err(PipelineError::not_found("index", path.display().to_string()));
        }
        let index = VectorIndex::load(&path)?;
        if index.model_id() != model_id {
            return Err(PipelineError::ModelUnavailable {
                model_id: model_id.to_string(),
                reason: format!(
                    "build {} was indexed with {}; run 'filinglens reindex --build {}'",
                    build_id,
                    index.model_id(),
                    build_id
                ),
            });
        }
        Ok(index)
    }

    /// Retrieve and assemble one intent for one ticker against a built index
    pub async fn query(
        &self,
        build_id: Option<&str>,
        scope: &str,
        ticker: &str,
        intent: &str,
    ) -> Result<QueryAnswer> {
        validate_ticker(ticker)?;
        let record = self.resolve_build(build_id, scope)?;
        let writer = ArtifactWriter::new(self.build_dir(&record.build_id));

        let index = Arc::new(self.load_index(&record.build_id)?);
        let catalog = Arc::new(ChunkCatalog::new(
            self.db.build_sourced_chunks(&record.build_id)?,
        ));
        let contexts: BTreeMap<String, FinancialContext> = writer
            .read_json(artifacts::FINANCIAL_CONTEXT)?
            .unwrap_or_default();
        let financial = contexts.get(ticker).cloned().unwrap_or_default();

        let retriever = Retriever::new(
            index,
            catalog.clone(),
            self.services.embedding.clone(),
            self.retry.clone(),
            self.config.retrieval.clone(),
        )?;
        let retrieval = retriever.retrieve_intent(intent, ticker, &financial).await?;

        let assembler = ContextAssembler::new(catalog, self.config.assembly.min_passage_chars);
        let context = assembler.assemble(
            intent,
            ticker,
            &retrieval.merged,
            self.config.assembly.budget_chars,
        )?;

        Ok(QueryAnswer {
            build_id: record.build_id,
            retrieval,
            context,
        })
    }

    /// Embed a build's chunks under the configured model (only the missing
    /// ones) and write a full index for that model. Existing vectors under
    /// other models and the build's own artifacts are left untouched.
    pub async fn reindex(&self, build_id: &str) -> Result<ReindexSummary> {
        let record = self.db.load_build(build_id)?;
        if record.status(StageName::Chunk) != Some(StageStatus::Completed) {
            return Err(PipelineError::InvalidState(format!(
                "build {} has no completed chunk stage",
                build_id
            )));
        }

        let chunks: Vec<_> = self
            .db
            .build_sourced_chunks(build_id)?
            .into_iter()
            .map(|s| s.chunk)
            .collect();

        let embedder = Embedder::new(
            self.services.embedding.clone(),
            self.retry.clone(),
            &self.config.embedding,
        );
        let model_id = embedder.model_id().to_string();
        let mut sink = &self.db;
        let embedded = embedder.embed(&chunks, &model_id, &mut sink).await?;

        let dimension = self.services.embedding.dimension();
        let entries = self.db.build_index_entries(build_id, &model_id)?;
        let mut index = VectorIndex::new(&model_id, dimension);
        index.rebuild(&model_id, dimension, entries)?;

        let path = self.reindex_path(build_id, &model_id);
        index.save(&path)?;
        tracing::info!(build_id, model_id = %model_id, entries = index.len(), "reindexed build");

        Ok(ReindexSummary {
            build_id: build_id.to_string(),
            model_id,
            embedded,
            entries: index.len(),
            path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::stages::StageOutput;
    use crate::build::{BuildState, GeneratedSection};
    use crate::config::{AssemblyConfig, ChunkingConfig, EmbeddingConfig, RetrievalConfig};
    use crate::corpus::loader::test_support::{filing_sidecar, write_doc};
    use crate::embed::test_support::CountingProvider;
    use crate::embed::HashEmbedding;
    use crate::llm::test_support::ScriptedGenerator;
    use async_trait::async_trait;
    use tempfile::TempDir;

    const ACME_10K: &str = "# Risk Factors\n\n\
        We are party to patent litigation in several jurisdictions. An adverse ruling could \
        require us to pay damages and change product designs. Legal proceedings are costly.\n\n\
        Competition in our markets is intense. Larger rivals may cut prices, and customers \
        could shift demand to cheaper products, which would reduce revenue and margins.\n\n\
        # Liquidity and Capital Resources\n\n\
        Cash flow from operating activities was $1.2 billion. Capital expenditures rose as we \
        expanded capacity. We funded share repurchases and dividends from free cash flow.\n\n\
        Our supply chain depends on a small number of suppliers in one region. Disruption \
        there would delay shipments and raise costs.";

    const ACME_10Q: &str = "Quarterly update. Revenue grew 8% on stronger demand in the \
        industrial segment. Operating cash flow improved and liquidity remains ample. \
        Regulatory review of our new product line is ongoing and its outcome is uncertain.";

    fn seed_corpus(root: &Path) {
        let corpus = root.join("corpus");
        write_doc(
            &corpus,
            "ACME",
            "filing",
            "2024-03-01",
            "10k.md",
            ACME_10K,
            &filing_sidecar("ACME", "10-K", "2024-02-15"),
        );
        write_doc(
            &corpus,
            "ACME",
            "filing",
            "2023-11-01",
            "10q.txt",
            ACME_10Q,
            &filing_sidecar("ACME", "10-Q", "2023-10-30"),
        );
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            ticker_set: vec!["ACME".to_string(), "NEWCO".to_string()],
            chunking: ChunkingConfig {
                max_chunk_length: 400,
                overlap: 50,
                min_chunk_length: 100,
            },
            embedding: EmbeddingConfig {
                model_id: "hash-64".to_string(),
                dimension: 64,
                batch_size: 2,
                ..Default::default()
            },
            retrieval: RetrievalConfig {
                top_k: 3,
                intents: vec!["risk_factors".to_string(), "cash_flow".to_string()],
                ..Default::default()
            },
            assembly: AssemblyConfig {
                budget_chars: 1000,
                min_passage_chars: 100,
            },
            ..Default::default()
        }
    }

    fn services(provider: Arc<dyn EmbeddingProvider>) -> PipelineServices {
        PipelineServices {
            embedding: provider,
            generator: None,
        }
    }

    fn hash_services() -> PipelineServices {
        services(Arc::new(HashEmbedding::new("hash-64", 64)))
    }

    fn orchestrator(root: &Path, services: PipelineServices) -> Orchestrator {
        let db = Database::open(root.join(WORKSPACE_DIR).join(DATABASE_FILE)).unwrap();
        Orchestrator::new(db, config(), root, services)
            .with_retry(crate::embed::test_support::no_retry())
    }

    fn seeded() -> (TempDir, Orchestrator) {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join(WORKSPACE_DIR)).unwrap();
        seed_corpus(temp.path());
        let orch = orchestrator(temp.path(), hash_services());
        (temp, orch)
    }

    fn request() -> BuildRequest {
        BuildRequest::resolve(&config(), None, &[]).unwrap()
    }

    /// Hash embeddings that trip the cancel flag on the first batch
    struct CancellingProvider {
        inner: HashEmbedding,
        cancel: CancelFlag,
    }

    #[async_trait]
    impl EmbeddingProvider for CancellingProvider {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.cancel.cancel();
            self.inner.embed_batch(texts).await
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        fn model_id(&self) -> &str {
            self.inner.model_id()
        }
    }

    #[tokio::test]
    async fn test_build_without_generator_finalizes() {
        let (_temp, orch) = seeded();
        let outcome = orch.run(request()).await.unwrap();
        let record = &outcome.record;

        assert_eq!(record.state, BuildState::Finalized);
        assert!(outcome.is_successful());
        assert!(outcome.latest_updated);
        assert_eq!(record.status(StageName::Generate), Some(StageStatus::Skipped));
        assert_eq!(
            orch.database().latest_build(DEFAULT_SCOPE).unwrap(),
            Some(record.build_id.clone())
        );

        for artifact in [
            artifacts::DOCUMENTS,
            artifacts::CHUNKS,
            artifacts::EMBEDDINGS,
            artifacts::INDEX,
            artifacts::REPORT,
            artifacts::MANIFEST,
        ] {
            assert!(outcome.build_dir.join(artifact).is_file(), "missing {}", artifact);
        }

        let writer = ArtifactWriter::new(&outcome.build_dir);
        let acme: AssembledContext = writer
            .read_json(&artifacts::context_path("ACME", "risk_factors"))
            .unwrap()
            .unwrap();
        assert!(!acme.no_data);
        assert!(acme.total_chars <= 1000);
        for chunk_id in &acme.selected_chunks {
            orch.database().get_chunk(chunk_id).unwrap();
        }

        let report = std::fs::read_to_string(outcome.build_dir.join(artifacts::REPORT)).unwrap();
        assert!(report.contains("## NEWCO"));
        assert!(report.contains("**No grounded context.**"));

        let stored = orch.database().load_build(&record.build_id).unwrap();
        assert_eq!(&stored, record);
    }

    #[tokio::test]
    async fn test_zero_filing_ticker_is_no_data() {
        let (_temp, orch) = seeded();
        let outcome = orch.run(request()).await.unwrap();

        let writer = ArtifactWriter::new(&outcome.build_dir);
        let context: AssembledContext = writer
            .read_json(&artifacts::context_path("NEWCO", "risk_factors"))
            .unwrap()
            .unwrap();
        assert!(context.no_data);
        assert!(context.selected_chunks.is_empty());

        let ingest = &outcome.record.stage_statuses[&StageName::Ingest];
        assert!(ingest.notes.iter().any(|n| n.starts_with("NEWCO: no documents")));
    }

    #[tokio::test]
    async fn test_rebuild_produces_identical_chunks_and_embeddings() {
        let (_temp, orch) = seeded();
        let first = orch.run(request()).await.unwrap();
        let second = orch.run(request()).await.unwrap();

        assert_ne!(first.record.build_id, second.record.build_id);
        for artifact in [artifacts::CHUNKS, artifacts::EMBEDDINGS, artifacts::DOCUMENTS] {
            let a = std::fs::read(first.build_dir.join(artifact)).unwrap();
            let b = std::fs::read(second.build_dir.join(artifact)).unwrap();
            assert_eq!(a, b, "{} differs between builds", artifact);
        }

        let embed = &second.record.stage_statuses[&StageName::Embed];
        assert!(embed.notes[0].contains(": 0 embedded"), "{:?}", embed.notes);
    }

    #[tokio::test]
    async fn test_empty_corpus_fails_ingest() {
        let (_temp, orch) = seeded();
        let request = BuildRequest::new("validation", vec!["NEWCO".to_string()]);
        let outcome = orch.run(request).await.unwrap();
        let record = &outcome.record;

        assert_eq!(record.state, BuildState::Finalized);
        assert!(!outcome.is_successful());
        assert!(!outcome.latest_updated);
        assert_eq!(record.failed_stages(), vec![StageName::Ingest]);
        let reason = record.stage_statuses[&StageName::Ingest].reason.clone().unwrap();
        assert!(reason.contains("corpus has no documents"));
        assert_eq!(record.status(StageName::Chunk), Some(StageStatus::Skipped));
        assert_eq!(orch.database().latest_build("validation").unwrap(), None);
    }

    #[tokio::test]
    async fn test_resume_after_cancel_keeps_completed_stages() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join(WORKSPACE_DIR)).unwrap();
        seed_corpus(temp.path());

        let cancel = CancelFlag::new();
        let provider = CancellingProvider {
            inner: HashEmbedding::new("hash-64", 64),
            cancel: cancel.clone(),
        };
        let orch = orchestrator(temp.path(), services(Arc::new(provider))).with_cancel(cancel);

        let outcome = orch.run(request()).await.unwrap();
        let build_id = outcome.record.build_id.clone();
        assert_eq!(outcome.record.state, BuildState::Aborted);
        assert_eq!(outcome.record.status(StageName::Embed), Some(StageStatus::Completed));
        assert_eq!(outcome.record.status(StageName::Index), Some(StageStatus::Pending));
        assert!(!outcome.latest_updated);
        let embedded = orch.database().count_embeddings("hash-64").unwrap();
        assert!(embedded > 0);
        drop(orch);

        let resumed = orchestrator(temp.path(), hash_services());
        let outcome = resumed.resume(&build_id).await.unwrap();
        let record = &outcome.record;

        assert!(outcome.is_successful());
        for stage in [StageName::Ingest, StageName::Chunk, StageName::Embed, StageName::Index] {
            assert_eq!(record.stage_statuses[&stage].attempts, 1, "{} re-ran", stage);
        }
        assert_eq!(resumed.database().count_embeddings("hash-64").unwrap(), embedded);
        assert!(record.abort_reason.is_none());

        let err = resumed.resume(&build_id).await.unwrap_err();
        assert!(matches!(err, PipelineError::BuildFinalized(_)));
    }

    #[tokio::test]
    async fn test_interrupted_running_stage_is_rerun() {
        let (_temp, orch) = seeded();
        let request = request().with_stages(vec![StageName::Chunk]);
        let mut record = BuildRecord::new(
            &request.scope,
            request.tickers.clone(),
            &request.stages,
            &orch.config().fingerprint(),
            Utc::now(),
        );
        record.start_stage(StageName::Ingest, Utc::now()).unwrap();
        orch.database().save_build(&record).unwrap();

        let outcome = orch.resume(&record.build_id).await.unwrap();
        assert!(outcome.is_successful());
        assert_eq!(outcome.record.stage_statuses[&StageName::Ingest].attempts, 2);
        assert!(!outcome.record.stage_statuses.contains_key(&StageName::Embed));
    }

    #[tokio::test]
    async fn test_resume_reattempts_only_failed_stage() {
        let (temp, _) = seeded();
        let down = CountingProvider::new("hash-64", 64).failing_after(0);
        let orch = orchestrator(temp.path(), services(Arc::new(down)));

        let outcome = orch.run(request()).await.unwrap();
        let build_id = outcome.record.build_id.clone();
        assert_eq!(outcome.record.state, BuildState::Finalized);
        assert_eq!(outcome.record.failed_stages(), vec![StageName::Embed]);
        assert_eq!(outcome.record.status(StageName::Index), Some(StageStatus::Skipped));
        assert!(!outcome.latest_updated);
        let chunks = orch.database().get_stats().unwrap().chunks;
        drop(orch);

        let healthy = orchestrator(temp.path(), hash_services());
        let outcome = healthy.resume(&build_id).await.unwrap();
        let record = &outcome.record;

        assert!(outcome.is_successful());
        assert!(outcome.latest_updated);
        assert_eq!(record.stage_statuses[&StageName::Ingest].attempts, 1);
        assert_eq!(record.stage_statuses[&StageName::Chunk].attempts, 1);
        assert_eq!(record.stage_statuses[&StageName::Embed].attempts, 2);
        for stage in [StageName::Index, StageName::Retrieve, StageName::Assemble] {
            assert_eq!(record.stage_statuses[&stage].attempts, 1, "{} attempts", stage);
        }
        assert_eq!(healthy.database().get_stats().unwrap().chunks, chunks);
        assert_eq!(
            healthy.database().latest_build(DEFAULT_SCOPE).unwrap(),
            Some(build_id.clone())
        );

        let err = healthy.resume(&build_id).await.unwrap_err();
        assert!(matches!(err, PipelineError::BuildFinalized(_)));
    }

    #[tokio::test]
    async fn test_generate_retry_keeps_successful_sections() {
        let (_temp, orch) = seeded();
        let outcome = orch.run(request()).await.unwrap();
        let writer = ArtifactWriter::new(&outcome.build_dir);
        let record = &outcome.record;

        let generator = Arc::new(ScriptedGenerator::new().failing_for("cash_flow"));
        let services = PipelineServices {
            embedding: Arc::new(HashEmbedding::new("hash-64", 64)),
            generator: Some(generator.clone()),
        };
        let env = StageEnv {
            db: orch.database(),
            config: orch.config(),
            corpus_root: PathBuf::new(),
            writer: &writer,
            services: &services,
            retry: crate::embed::test_support::no_retry(),
            build_id: &record.build_id,
            tickers: &record.ticker_set,
        };

        let StageOutput { outcome, .. } = env.run(StageName::Generate).await.unwrap();
        assert!(matches!(outcome, StageOutcome::Failed(ref r) if r.contains("1 of 2")));
        // NEWCO has no data and the default policy skips it without a call
        assert_eq!(generator.calls().len(), 2);

        let done: GeneratedSection = writer
            .read_json(&artifacts::generation_path("ACME", "risk_factors"))
            .unwrap()
            .unwrap();
        assert!(done.is_done());
        assert!(done.grounded);

        generator.heal();
        let StageOutput { outcome, .. } = env.run(StageName::Generate).await.unwrap();
        assert!(matches!(outcome, StageOutcome::Completed(_)));
        assert_eq!(generator.calls()[2..], ["ACME:cash_flow".to_string()]);
    }

    #[tokio::test]
    async fn test_query_against_latest_build() {
        let (_temp, orch) = seeded();
        let outcome = orch.run(request()).await.unwrap();

        let answer = orch
            .query(None, DEFAULT_SCOPE, "ACME", "risk_factors")
            .await
            .unwrap();
        assert_eq!(answer.build_id, outcome.record.build_id);
        assert!(!answer.context.no_data);
        assert_eq!(answer.retrieval.queries.len(), 5);

        let err = orch
            .query(None, "validation", "ACME", "risk_factors")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_reindex_migrates_to_new_model() {
        let (temp, orch) = seeded();
        let outcome = orch.run(request()).await.unwrap();
        let build_id = outcome.record.build_id.clone();
        let old_count = orch.database().count_embeddings("hash-64").unwrap();
        drop(orch);

        let migrated = orchestrator(
            temp.path(),
            services(Arc::new(HashEmbedding::new("hash-32", 32))),
        );
        let err = migrated
            .query(Some(&build_id), DEFAULT_SCOPE, "ACME", "cash_flow")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ModelUnavailable { .. }));

        let summary = migrated.reindex(&build_id).await.unwrap();
        assert_eq!(summary.model_id, "hash-32");
        assert_eq!(summary.embedded.embedded, old_count);
        assert_eq!(summary.entries, old_count);
        assert!(summary.path.is_file());
        assert_eq!(migrated.database().count_embeddings("hash-64").unwrap(), old_count);

        let answer = migrated
            .query(Some(&build_id), DEFAULT_SCOPE, "ACME", "cash_flow")
            .await
            .unwrap();
        assert!(!answer.context.no_data);
    }
}
