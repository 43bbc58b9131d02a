//! CLI interface using clap
//!
//! Provides the command-line interface for filinglens

mod commands;

pub use commands::*;

use crate::build::StageName;
use clap::{Parser, Subcommand};

/// filinglens - Versioned retrieval pipeline over company filings
#[derive(Parser, Debug)]
#[command(name = "filinglens")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the workspace root (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    pub path: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json)
    #[arg(short = 'o', long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a workspace with a default configuration
    Init(InitArgs),

    /// Load corpus documents into the document store
    Ingest(IngestArgs),

    /// Run (or resume) a pipeline build
    Build(BuildArgs),

    /// Show the state of a build
    Status(StatusArgs),

    /// List builds
    Builds,

    /// Retrieve and assemble context for one ticker and intent
    Query(QueryArgs),

    /// Rebuild a build's index, optionally under another embedding model
    Reindex(ReindexArgs),

    /// Show configuration
    Config(ConfigArgs),
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Arguments for init command
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Overwrite an existing configuration
    #[arg(short, long)]
    pub force: bool,
}

/// Arguments for ingest command
#[derive(Parser, Debug)]
pub struct IngestArgs {
    /// Ticker to ingest (repeatable; defaults to the scope's ticker set)
    #[arg(short, long = "ticker")]
    pub tickers: Vec<String>,

    /// Named analysis scope
    #[arg(short, long)]
    pub scope: Option<String>,
}

/// Arguments for build command
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Ticker to build (repeatable; defaults to the scope's ticker set)
    #[arg(short, long = "ticker")]
    pub tickers: Vec<String>,

    /// Named analysis scope
    #[arg(short, long)]
    pub scope: Option<String>,

    /// Stages to run, closed over their dependencies (e.g. "index,retrieve")
    #[arg(long, value_delimiter = ',')]
    pub stages: Option<Vec<StageName>>,

    /// Resume an unfinished or failed build instead of starting a new one
    #[arg(short, long, conflicts_with_all = ["tickers", "scope", "stages"])]
    pub resume: Option<String>,
}

/// Arguments for status command
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Build id (defaults to the scope's latest successful build)
    #[arg(short, long)]
    pub build: Option<String>,

    /// Named analysis scope
    #[arg(short, long)]
    pub scope: Option<String>,
}

/// Arguments for query command
#[derive(Parser, Debug)]
pub struct QueryArgs {
    /// Ticker to query
    #[arg(short, long)]
    pub ticker: String,

    /// Analysis intent (e.g. risk_factors, cash_flow)
    #[arg(short, long)]
    pub intent: String,

    /// Build id (defaults to the scope's latest successful build)
    #[arg(short, long)]
    pub build: Option<String>,

    /// Named analysis scope
    #[arg(short, long)]
    pub scope: Option<String>,
}

/// Arguments for reindex command
#[derive(Parser, Debug)]
pub struct ReindexArgs {
    /// Build to reindex
    #[arg(short, long)]
    pub build: String,

    /// Embedding model id to migrate to (defaults to the configured one)
    #[arg(short, long)]
    pub model: Option<String>,
}

/// Arguments for config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Show current configuration
    #[arg(long)]
    pub show: bool,
}

/// Parse CLI arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}
