//! filinglens - Versioned retrieval pipeline over company filings
//!
//! Ingests a per-ticker filings corpus, chunks and embeds it, and assembles
//! cited, budget-bounded context for valuation report sections.

use anyhow::Result;
use filinglens::cli::{
    self, builds, ingest, init, print_build, print_ingest, print_query, print_reindex, query,
    reindex, status, Commands,
};
use std::path::Path;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit status of a build that settled with failed stages or was aborted
const EXIT_BUILD_INCOMPLETE: i32 = 2;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = cli::parse_args();

    // Setup logging; stdout is reserved for command output
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    // Get workspace path
    let root = Path::new(&cli.path);

    // Execute command
    match cli.command {
        Commands::Init(args) => {
            init(root, args.force)?;
        }

        Commands::Ingest(args) => {
            let results = ingest(root, &args.tickers, args.scope.as_deref())?;
            print_ingest(&results, cli.format)?;
        }

        Commands::Build(args) => {
            let outcome = cli::build(
                root,
                &args.tickers,
                args.scope.as_deref(),
                args.stages,
                args.resume.as_deref(),
            )
            .await?;
            print_build(&outcome, cli.format)?;

            if !outcome.is_successful() {
                std::process::exit(EXIT_BUILD_INCOMPLETE);
            }
        }

        Commands::Status(args) => {
            status(root, args.build.as_deref(), args.scope.as_deref(), cli.format)?;
        }

        Commands::Builds => {
            builds(root, cli.format)?;
        }

        Commands::Query(args) => {
            let answer = query(
                root,
                &args.ticker,
                &args.intent,
                args.build.as_deref(),
                args.scope.as_deref(),
            )
            .await?;
            print_query(&answer, cli.format)?;
        }

        Commands::Reindex(args) => {
            let summary = reindex(root, &args.build, args.model.as_deref()).await?;
            print_reindex(&summary, cli.format)?;
        }

        Commands::Config(args) => {
            cli::config(root, args.show, cli.format)?;
        }
    }

    Ok(())
}
