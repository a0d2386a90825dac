//! Outline sync daemon entry point.
//!
//! Opens the configured document store and either follows its change feed,
//! resolving conflicts as they appear, or runs a one-shot maintenance
//! command.

mod signals;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use outline_sync_core::config::AppConfig;
use outline_sync_core::models::{NodeEvent, NodeMap};
use outline_sync_core::observer::ChangeObserver;
use outline_sync_core::save::SaveEngine;
use outline_sync_core::store::{replicate, DocumentStore, SqliteStore};

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// Outline sync daemon.
#[derive(Parser, Debug)]
#[command(
    name = "outline-sync-daemon",
    version,
    about = "Keeps an outline node map in sync with a replicated document store"
)]
struct Args {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow the change feed and resolve conflicts until shut down.
    Watch,
    /// Print the stored node map as JSON.
    Dump,
    /// Save a node map read from a JSON file.
    Import {
        /// JSON object mapping node ids to nodes.
        file: PathBuf,
    },
    /// Pull every revision from another store file into this one.
    Replicate {
        /// Path of the other store file.
        other: PathBuf,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => {
            AppConfig::load_and_validate(path).context("failed to load configuration file")?
        }
        None => AppConfig::default(),
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let store_path = config.store_path();
    let store = Arc::new(
        SqliteStore::open(&store_path, config.store.feed_capacity)
            .with_context(|| format!("failed to open store at {}", store_path.display()))?,
    );
    info!(path = %store_path.display(), "store opened");

    match args.command {
        Command::Watch => watch(store, &config).await,
        Command::Dump => dump(store).await,
        Command::Import { file } => import(store, &file).await,
        Command::Replicate { other } => {
            let source = SqliteStore::open(&other, config.store.feed_capacity)
                .with_context(|| format!("failed to open store at {}", other.display()))?;
            let changed = replicate(&source, store.as_ref())
                .await
                .context("replication failed")?;
            info!(changed, from = %other.display(), "replicated documents");
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn watch(store: Arc<SqliteStore>, config: &AppConfig) -> Result<()> {
    let observer = ChangeObserver::new(store.clone(), config.conflict.clone());
    // Subscribe before catching up so nothing written meanwhile is missed.
    let feed = store.subscribe();

    let backlog = store
        .changes_since(0)
        .await
        .context("failed to read change backlog")?;
    let conflicted = backlog.iter().filter(|e| e.is_conflicted()).count();
    info!(documents = backlog.len(), conflicted, "catching up on stored documents");
    for event in backlog.into_iter().filter(|e| e.is_conflicted()) {
        let id = event.id.clone();
        if let Err(e) = observer.handle(event).await {
            warn!(id = %id, error = %e, "could not resolve stored conflict");
        }
    }

    let (tx, mut rx) = mpsc::channel::<NodeEvent>(config.store.feed_capacity);
    let observer_handle = tokio::spawn(observer.run(feed, tx));
    let report_handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match &event {
                NodeEvent::Changed { id, fields } => {
                    info!(id = %id, rev = ?fields.rev, children = fields.children.len(), "node changed")
                }
                NodeEvent::Deleted { id } => info!(id = %id, "node deleted"),
                NodeEvent::ResolutionFailed { id, reason } => {
                    error!(id = %id, reason = %reason, "conflict needs attention")
                }
            }
        }
    });

    info!("watching change feed");
    signals::wait_for_shutdown().await;
    info!("shutdown signal received, stopping...");

    observer_handle.abort();
    if let Err(e) = report_handle.await {
        warn!(error = %e, "event reporter ended abnormally");
    }
    info!("outline sync daemon stopped");
    Ok(())
}

async fn dump<S: DocumentStore>(store: Arc<S>) -> Result<()> {
    let decoded = SaveEngine::new(store)
        .load()
        .await
        .context("failed to load node map")?;
    for err in &decoded.errors {
        warn!(id = %err.id, detail = %err.detail, "skipped malformed row");
    }
    let json = serde_json::to_string_pretty(&decoded.nodes).context("failed to encode node map")?;
    println!("{json}");
    Ok(())
}

async fn import<S: DocumentStore>(store: Arc<S>, file: &Path) -> Result<()> {
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let mut nodes: NodeMap =
        serde_json::from_str(&contents).context("file is not a JSON node map")?;

    let report = SaveEngine::new(store)
        .save(&mut nodes)
        .await
        .context("save failed")?;
    for rejected in report.rejected() {
        if let Err(reason) = &rejected.outcome {
            warn!(id = %rejected.id, reason = %reason, "node not saved");
        }
    }
    info!(
        submitted = report.submitted,
        written = report.written(),
        "import finished"
    );
    Ok(())
}
