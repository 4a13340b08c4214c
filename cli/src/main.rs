use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use collector::{CollectorConfig, GraphClient, GraphCrawler};
use storage::{DiffConfig, DiffEngine, DirectoryStore};

mod output;

/// Watched fields for credential-rotation detection on service principals.
const WATCHED_SP_FIELDS: [&str; 2] = ["keyCredentials", "passwordCredentials"];

#[derive(Parser)]
#[command(name = "graphwatch", version, about = "Entra directory mirror and change auditor")]
struct Cli {
    /// Path to the cache database
    #[arg(long, default_value = "graph_data.db")]
    db_path: PathBuf,

    /// Path to the YAML configuration file
    #[arg(long, default_value = "graphwatch.yaml", env = "GRAPHWATCH_CONFIG")]
    config: PathBuf,

    /// Perform a Graph collection even when the cache is fresh
    #[arg(long)]
    collect: bool,

    /// Number of service principal entries to fetch, for bounded test runs
    #[arg(long)]
    debug_count: Option<usize>,

    /// Compare snapshots against the previous run and report changes
    #[arg(long)]
    diff: bool,

    /// Append the diff detail report to this file
    #[arg(long)]
    output_file: Option<PathBuf>,

    /// Age in days beyond which the cache counts as stale
    #[arg(long, default_value_t = 7)]
    refresh_days: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let diff = cli
        .diff
        .then(|| DiffEngine::new(DiffConfig::new().watch("service_principals", WATCHED_SP_FIELDS)));

    let store = Arc::new(DirectoryStore::open(&cli.db_path, diff).await?);

    if !cli.collect && store.fresh(cli.refresh_days) {
        info!(
            path = %cli.db_path.display(),
            "cache database is fresh; use --collect to force a refresh"
        );
        return Ok(());
    }
    if !cli.collect {
        warn!(
            days = cli.refresh_days,
            "cache database missing or stale, refreshing"
        );
    }

    let mut config = CollectorConfig::from_file(&cli.config)?;
    if cli.debug_count.is_some() {
        config.debug_count = cli.debug_count;
    }

    let client = GraphClient::new(config.graph.clone())?;
    let crawler = GraphCrawler::new(client, store.clone(), config);
    let report = crawler.fetch().await?;

    if report.has_errors() {
        warn!(
            errors = report.errors.len(),
            "collection completed with partial data"
        );
    }

    if let Some(engine) = store.diff() {
        output::report_diff(engine, cli.output_file.as_deref())?;
    }

    Ok(())
}
