//! Binary entry point for dormsoup.
//!
//! Replays pre-extracted mail through the deduplication pipeline and
//! inspects or edits the resulting index and event store.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// Allow print_stderr in main binary for CLI output
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]
// Allow multiple crate versions from transitive dependencies
#![allow(clippy::multiple_crate_versions)]

use anyhow::Context;
use clap::{Parser, Subcommand};
use dormsoup::embedding::Embedder;
use dormsoup::extraction::{FixtureExtractor, InboundRecord};
use dormsoup::observability::{self, LoggingConfig};
use dormsoup::services::deduplication::SimilarityIndex;
use dormsoup::storage::{EventStore, SqliteEventStore};
use dormsoup::{DormsoupConfig, EmailPipeline, EventId, Extractor};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

/// Dormsoup - deduplicates calendar events extracted from mailing-list email.
#[derive(Parser)]
#[command(name = "dormsoup")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to configuration file.
    #[arg(short, long, global = true, env = "DORMSOUP_CONFIG_PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Replay a JSON array of inbound records through the pipeline.
    Process {
        /// File with `[{ "email": ..., "extraction": ... }, ...]`.
        file: PathBuf,
    },

    /// Inspect the similarity index.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Manage stored events.
    Event {
        #[command(subcommand)]
        action: EventAction,
    },
}

/// Index subcommands.
#[derive(Subcommand)]
enum IndexAction {
    /// Show entry and event counts.
    Stats,

    /// Show the titles nearest to a title.
    Knn {
        /// Title to look up.
        title: String,

        /// Number of neighbors.
        #[arg(short, default_value_t = 3)]
        k: usize,
    },
}

/// Event subcommands.
#[derive(Subcommand)]
enum EventAction {
    /// Delete an event and remove it from the index.
    Delete {
        /// Event ID.
        id: i64,
    },
}

/// Main entry point.
#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e:#}");
            return ExitCode::FAILURE;
        },
    };

    let logging = LoggingConfig::from_settings(&config.logging, cli.verbose);
    if let Err(e) = observability::init(&logging) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    match run_command(cli.command, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        },
    }
}

/// Runs the selected command.
async fn run_command(command: Commands, config: &DormsoupConfig) -> anyhow::Result<()> {
    match command {
        Commands::Process { file } => cmd_process(config, &file).await,
        Commands::Index {
            action: IndexAction::Stats,
        } => cmd_index_stats(config),
        Commands::Index {
            action: IndexAction::Knn { title, k },
        } => cmd_index_knn(config, &title, k).await,
        Commands::Event {
            action: EventAction::Delete { id },
        } => cmd_event_delete(config, EventId::new(id)).await,
    }
}

/// Loads configuration: file (explicit or default location), then env.
fn load_config(path: Option<&Path>) -> anyhow::Result<DormsoupConfig> {
    let config = match path {
        Some(path) => DormsoupConfig::load_from_file(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => DormsoupConfig::load_default()?,
    };
    Ok(config.with_env_overrides()?)
}

#[cfg(feature = "fastembed-embeddings")]
fn build_embedder(_config: &DormsoupConfig) -> Arc<dyn Embedder> {
    Arc::new(dormsoup::embedding::FastEmbedEmbedder::new())
}

#[cfg(not(feature = "fastembed-embeddings"))]
fn build_embedder(config: &DormsoupConfig) -> Arc<dyn Embedder> {
    Arc::new(dormsoup::embedding::HashEmbedder::with_dimensions(
        config.index.dimensions,
    ))
}

fn open_index(config: &DormsoupConfig, embedder: &dyn Embedder) -> anyhow::Result<SimilarityIndex> {
    Ok(SimilarityIndex::open(
        config.snapshot_paths(),
        Some(embedder.dimensions()),
    )?)
}

fn build_pipeline(
    config: &DormsoupConfig,
    extractor: Arc<dyn Extractor>,
) -> anyhow::Result<Arc<EmailPipeline>> {
    let embedder = build_embedder(config);
    let index = open_index(config, embedder.as_ref())?;
    let store: Arc<dyn EventStore> = Arc::new(SqliteEventStore::open(&config.store_path())?);

    Ok(Arc::new(EmailPipeline::new(
        index,
        embedder,
        extractor,
        store,
        config.dedup_config(),
    )))
}

async fn cmd_process(config: &DormsoupConfig, file: &Path) -> anyhow::Result<()> {
    let contents =
        std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let records: Vec<InboundRecord> =
        serde_json::from_str(&contents).with_context(|| format!("parsing {}", file.display()))?;

    let extractor = Arc::new(FixtureExtractor::from_records(&records));
    let pipeline = build_pipeline(config, extractor)?;
    let flusher = pipeline.spawn_periodic_flush(config.flush_interval());

    // Futures are created in file order, which registers every message
    // before any of them runs.
    let tasks: Vec<_> = records
        .into_iter()
        .map(|record| {
            let message_id = record.email.message_id.clone();
            (message_id, tokio::spawn(pipeline.process_email(record.email)))
        })
        .collect();

    let mut failures = 0usize;
    for (message_id, task) in tasks {
        match task.await.context("pipeline task panicked")? {
            Ok(outcome) => println!("{message_id}\t{outcome}"),
            Err(e) => {
                failures += 1;
                println!("{message_id}\terror ({e})");
            },
        }
    }

    flusher.abort();
    pipeline.flush().await?;

    if failures > 0 {
        anyhow::bail!("{failures} message(s) failed");
    }
    Ok(())
}

fn cmd_index_stats(config: &DormsoupConfig) -> anyhow::Result<()> {
    let embedder = build_embedder(config);
    let index = open_index(config, embedder.as_ref())?;
    let paths = config.snapshot_paths();

    println!("snapshot:  {}", paths.primary.display());
    println!("backup:    {}", paths.backup.display());
    println!("entries:   {}", index.len());
    println!("event ids: {}", index.event_id_count());
    Ok(())
}

async fn cmd_index_knn(config: &DormsoupConfig, title: &str, k: usize) -> anyhow::Result<()> {
    let embedder = build_embedder(config);
    let index = open_index(config, embedder.as_ref())?;
    let target = embedder.embed(title).await?;

    for neighbor in index.knn(&target, k) {
        let ids: Vec<String> = index
            .get(&neighbor.key)
            .map(|e| e.event_ids.iter().map(ToString::to_string).collect())
            .unwrap_or_default();
        println!(
            "{:.4}\t{}\t[{}]",
            neighbor.distance,
            neighbor.key,
            ids.join(", ")
        );
    }
    Ok(())
}

async fn cmd_event_delete(config: &DormsoupConfig, id: EventId) -> anyhow::Result<()> {
    let pipeline = build_pipeline(config, Arc::new(FixtureExtractor::new()))?;
    if pipeline.engine().remove_event(id).await? {
        pipeline.flush().await?;
        println!("deleted event {id}");
        Ok(())
    } else {
        anyhow::bail!("event {id} not found")
    }
}
