//! Command implementations

use super::OutputFormat;
use crate::build::{
    BuildOutcome, BuildRecord, BuildRequest, CancelFlag, Orchestrator, QueryAnswer,
    ReindexSummary, StageName, StageStatus,
};
use crate::config::{validate_ticker, PipelineConfig, CONFIG_FILE, DATABASE_FILE, WORKSPACE_DIR};
use crate::corpus::CorpusLoader;
use crate::storage::Database;
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Initialize a filinglens workspace
pub fn init(path: &Path, force: bool) -> Result<()> {
    let workspace = path.join(WORKSPACE_DIR);
    let config_path = workspace.join(CONFIG_FILE);

    if config_path.exists() && !force {
        anyhow::bail!("filinglens already initialized. Use --force to re-initialize.");
    }

    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("failed to create {}", workspace.display()))?;

    let db_path = workspace.join(DATABASE_FILE);
    let _db = Database::open(&db_path)?;

    let config = PipelineConfig::default();
    config.save(path)?;

    println!("✓ Initialized filinglens in {:?}", path);
    println!("  Database: {:?}", db_path);
    println!("  Config: {:?}", config_path);
    println!("  Corpus: {:?}", config.corpus_path(path));

    Ok(())
}

/// Documents loaded for one ticker by `ingest`
#[derive(Debug, Clone, Serialize)]
pub struct TickerIngest {
    pub ticker: String,
    pub documents: usize,
    /// Documents whose content was not already in the store
    pub new_documents: usize,
    pub skipped: Vec<String>,
}

/// Load corpus documents into the store without starting a build
pub fn ingest(path: &Path, tickers: &[String], scope: Option<&str>) -> Result<Vec<TickerIngest>> {
    let (config, db) = open_workspace(path)?;
    let request = BuildRequest::resolve(&config, scope, tickers)?;
    let loader = CorpusLoader::new(config.corpus_path(path));

    let mut results = Vec::new();
    for ticker in &request.tickers {
        validate_ticker(ticker)?;
        let before = db.get_stats()?.documents;

        let loaded = loader
            .load_ticker(ticker)
            .with_context(|| format!("failed to load corpus for {}", ticker))?;
        for document in &loaded.documents {
            db.put_document(document)?;
        }

        let after = db.get_stats()?.documents;
        results.push(TickerIngest {
            ticker: ticker.clone(),
            documents: loaded.documents.len(),
            new_documents: after.saturating_sub(before),
            skipped: loaded.skipped,
        });
    }

    Ok(results)
}

/// Print ingest results
pub fn print_ingest(results: &[TickerIngest], format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(results)?);
        return Ok(());
    }

    for result in results {
        if result.documents == 0 {
            println!("⚠ {}: no documents found", result.ticker);
        } else {
            println!(
                "✓ {}: {} documents ({} new)",
                result.ticker, result.documents, result.new_documents
            );
        }
        for skipped in &result.skipped {
            println!("    skipped {}", skipped);
        }
    }

    Ok(())
}

/// Run a new build, or resume an unfinished or failed one. Ctrl+C cancels
/// between stages; the build is left aborted and resumable. Progress goes to
/// the log so stdout carries only the printed outcome.
pub async fn build(
    path: &Path,
    tickers: &[String],
    scope: Option<&str>,
    stages: Option<Vec<StageName>>,
    resume: Option<&str>,
) -> Result<BuildOutcome> {
    let cancel = CancelFlag::new();
    cancel.cancel_on_ctrl_c();
    let orchestrator = Orchestrator::open(path)?.with_cancel(cancel);

    let outcome = match resume {
        Some(build_id) => {
            tracing::info!(build_id, "resuming build");
            orchestrator.resume(build_id).await?
        }
        None => {
            let mut request = BuildRequest::resolve(orchestrator.config(), scope, tickers)?;
            if let Some(stages) = stages {
                request = request.with_stages(stages);
            }
            tracing::info!(
                tickers = %request.tickers.join(", "),
                scope = %request.scope,
                "starting build"
            );
            orchestrator.run(request).await?
        }
    };

    Ok(outcome)
}

/// Print a build outcome
pub fn print_build(outcome: &BuildOutcome, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }

    let record = &outcome.record;
    if outcome.is_successful() {
        println!("✓ Build {} finalized", record.build_id);
    } else {
        println!("✗ Build {} {}", record.build_id, record.state);
        if let Some(ref reason) = record.abort_reason {
            println!("  Reason: {}", reason);
        }
    }
    print_stages(record);

    println!("\n  Artifacts: {:?}", outcome.build_dir);
    if outcome.latest_updated {
        println!("  Latest build for scope '{}'", record.scope);
    } else if !outcome.is_successful() {
        println!("  Retry with: filinglens build --resume {}", record.build_id);
    }

    Ok(())
}

/// Show one build
pub fn status(
    path: &Path,
    build_id: Option<&str>,
    scope: Option<&str>,
    format: OutputFormat,
) -> Result<()> {
    let orchestrator = Orchestrator::open(path)?;
    let scope = scope.unwrap_or(crate::config::DEFAULT_SCOPE);
    let record = orchestrator.resolve_build(build_id, scope)?;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    println!("Build: {}", record.build_id);
    println!("  Scope: {}", record.scope);
    println!("  State: {}", record.state);
    println!("  Tickers: {}", record.ticker_set.join(", "));
    println!("  Started: {}", record.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(finalized) = record.finalized_at {
        println!("  Finalized: {}", finalized.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(ref reason) = record.abort_reason {
        println!("  Abort reason: {}", reason);
    }
    print_stages(&record);

    if !record.artifact_paths.is_empty() {
        println!("\nArtifacts:");
        for (name, relative) in &record.artifact_paths {
            println!("  {} -> {}", name, relative);
        }
    }

    Ok(())
}

/// List all builds, newest first
pub fn builds(path: &Path, format: OutputFormat) -> Result<()> {
    let (_, db) = open_workspace(path)?;
    let records = db.list_builds()?;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No builds yet.");
        return Ok(());
    }

    for record in &records {
        let failed = record.failed_stages().len();
        println!(
            "{}  {:<12} {:<12} {}{}",
            record.build_id,
            record.scope,
            record.state.as_str(),
            record.ticker_set.join(","),
            if failed > 0 {
                format!("  ({} failed)", failed)
            } else {
                String::new()
            }
        );
    }

    Ok(())
}

/// Ad-hoc retrieval and assembly against a finished build
pub async fn query(
    path: &Path,
    ticker: &str,
    intent: &str,
    build_id: Option<&str>,
    scope: Option<&str>,
) -> Result<QueryAnswer> {
    let orchestrator = Orchestrator::open(path)?;
    let scope = scope.unwrap_or(crate::config::DEFAULT_SCOPE);
    let answer = orchestrator.query(build_id, scope, ticker, intent).await?;
    Ok(answer)
}

/// Print a query answer
pub fn print_query(answer: &QueryAnswer, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(answer)?);
        return Ok(());
    }

    let context = &answer.context;
    println!(
        "{} / {} (build {})",
        context.ticker, context.intent_label, answer.build_id
    );
    println!("\nQueries:");
    for query in &answer.retrieval.queries {
        println!("  {}  {}", query.query_id, query.query_text);
    }

    if context.no_data {
        println!("\nNo grounded context: nothing was retrieved for this ticker.");
        return Ok(());
    }

    println!("\nTop results:");
    for result in &answer.retrieval.merged {
        println!(
            "  #{:<2} {:.3}  {}  (sim {:.3}, kw {:.3}, rec {:.3})",
            result.rank,
            result.score,
            result.chunk_id,
            result.similarity_score,
            result.keyword_boost,
            result.recency_boost
        );
    }

    println!(
        "\nContext ({} / {} chars):",
        context.total_chars, context.budget_chars
    );
    for (citation, passage) in context.citation_index.iter().zip(&context.passages) {
        println!("\n{}", citation.render());
        println!("{}", passage.trim());
    }

    Ok(())
}

/// Rebuild a build's index, optionally migrating to another embedding model
pub async fn reindex(path: &Path, build_id: &str, model: Option<&str>) -> Result<ReindexSummary> {
    let mut config = PipelineConfig::load_or_default(path)?;
    if let Some(model) = model {
        config.embedding.model_id = model.to_string();
    }

    let orchestrator = Orchestrator::open_with_config(path, config)?;
    let summary = orchestrator.reindex(build_id).await?;
    Ok(summary)
}

/// Print a reindex summary
pub fn print_reindex(summary: &ReindexSummary, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!(
        "✓ Reindexed build {} under {}",
        summary.build_id, summary.model_id
    );
    println!(
        "  Chunks: {} ({} embedded, {} reused)",
        summary.embedded.requested, summary.embedded.embedded, summary.embedded.already_embedded
    );
    println!("  Index entries: {}", summary.entries);
    println!("  Index: {:?}", summary.path);

    Ok(())
}

/// Print the effective configuration
pub fn config(path: &Path, show: bool, format: OutputFormat) -> Result<()> {
    let config = PipelineConfig::load_or_default(path)?;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    if show {
        let content = toml::to_string_pretty(&config).context("failed to render config")?;
        println!("{}", content);
    } else {
        println!("Config: {:?}", path.join(WORKSPACE_DIR).join(CONFIG_FILE));
        println!("  Corpus: {:?}", config.corpus_path(path));
        println!("  Default tickers: {}", config.ticker_set.join(", "));
        println!(
            "  Embedding: {:?} ({}, dim {})",
            config.embedding.provider, config.embedding.model_id, config.embedding.dimension
        );
        println!("  Generation: {:?}", config.generation.provider);
        println!("  Intents: {}", config.retrieval.intents.join(", "));
        println!("\nUse --show for the full configuration.");
    }

    Ok(())
}

fn open_workspace(path: &Path) -> Result<(PipelineConfig, Database)> {
    let workspace: PathBuf = path.join(WORKSPACE_DIR);
    if !workspace.is_dir() {
        anyhow::bail!("filinglens not initialized. Run 'filinglens init' first.");
    }

    let config = PipelineConfig::load_or_default(path)?;
    let db = Database::open(workspace.join(DATABASE_FILE))?;
    Ok((config, db))
}

fn print_stages(record: &BuildRecord) {
    println!("\nStages:");
    for (stage, stage_record) in &record.stage_statuses {
        let icon = match stage_record.status {
            StageStatus::Completed => "✓",
            StageStatus::Failed => "✗",
            StageStatus::Skipped => "-",
            StageStatus::Running => "…",
            StageStatus::Pending => " ",
        };
        let detail = match stage_record.status {
            StageStatus::Completed => stage_record.notes.join("; "),
            _ => stage_record.reason.clone().unwrap_or_default(),
        };
        println!(
            "  {} {:<9} {:<9} x{}  {}",
            icon, stage, stage_record.status, stage_record.attempts, detail
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::loader::test_support::{filing_sidecar, write_doc};
    use tempfile::TempDir;

    #[test]
    fn test_init_refuses_second_run_without_force() {
        let temp = TempDir::new().unwrap();
        init(temp.path(), false).unwrap();
        assert!(temp.path().join(WORKSPACE_DIR).join(CONFIG_FILE).is_file());

        assert!(init(temp.path(), false).is_err());
        assert!(init(temp.path(), true).is_ok());
    }

    #[test]
    fn test_commands_require_init() {
        let temp = TempDir::new().unwrap();
        let err = builds(temp.path(), OutputFormat::Text).unwrap_err();
        assert!(err.to_string().contains("not initialized"));
    }

    #[test]
    fn test_ingest_counts_new_documents_once() {
        let temp = TempDir::new().unwrap();
        init(temp.path(), false).unwrap();

        let corpus = temp.path().join("corpus");
        write_doc(
            &corpus,
            "ACME",
            "filing",
            "2024-02-15",
            "10k.txt",
            "Risk factors include supplier concentration.",
            &filing_sidecar("ACME", "10-K", "2024-02-15"),
        );

        let tickers = vec!["ACME".to_string()];
        let first = ingest(temp.path(), &tickers, None).unwrap();
        assert_eq!(first[0].documents, 1);
        assert_eq!(first[0].new_documents, 1);

        let second = ingest(temp.path(), &tickers, None).unwrap();
        assert_eq!(second[0].documents, 1);
        assert_eq!(second[0].new_documents, 0);
    }

    #[test]
    fn test_ingest_rejects_bad_ticker() {
        let temp = TempDir::new().unwrap();
        init(temp.path(), false).unwrap();
        assert!(ingest(temp.path(), &["acme corp".to_string()], None).is_err());
    }
}
