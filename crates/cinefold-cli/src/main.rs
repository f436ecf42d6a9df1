use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use cinefold_storage::CheckpointStore;
use cinefold_sync::DocumentStore;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cinefold")]
#[command(about = "Incremental movie and TV metadata aggregator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl every enabled source once and refresh the snapshot document.
    Sync {
        /// Print the full run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Show checkpoint cursors and the current document totals.
    Status,
}

fn env_path(name: &str, default: &str) -> PathBuf {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

async fn status() -> Result<()> {
    let checkpoints = CheckpointStore::new(env_path("CHECKPOINT_PATH", "crawl_state.json"));
    let documents = DocumentStore::new(env_path("OUTPUT_PATH", "movies.json"));

    match documents.load().await? {
        Some(doc) => println!(
            "document: {} entries, last updated {}",
            doc.total_entries,
            doc.last_updated.to_rfc3339()
        ),
        None => println!("document: none at {}", documents.path().display()),
    }

    let state = checkpoints.load().await?;
    if state.is_empty() {
        println!("checkpoint: no cursors at {}", checkpoints.path().display());
    }
    for (key, cursor) in state.iter() {
        let last = cursor
            .last_success_timestamp
            .map(|ts| ts.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{key}: next={} exhausted={} last_success={last}",
            cursor.next_cursor, cursor.exhausted
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { json: false }) {
        Commands::Sync { json } => {
            let summary = cinefold_sync::run_sync_once_from_env().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "sync complete: run_id={} entries={}->{} incomplete={} document={}",
                    summary.run_id,
                    summary.total_before,
                    summary.total_after,
                    summary.incomplete.len(),
                    summary.document_path
                );
            }
            if !summary.incomplete.is_empty() {
                tracing::warn!(categories = ?summary.incomplete, "some categories did not finish this run");
            }
        }
        Commands::Status => status().await?,
    }

    Ok(())
}
