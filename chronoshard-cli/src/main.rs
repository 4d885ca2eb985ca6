//! ChronoShard catalog inspection CLI.
//!
//! Reads the catalog log of a data directory directly, so run it while the
//! server is stopped.
//!
//! ```bash
//! chronoshard-cli --data-dir data collections
//! chronoshard-cli --data-dir data chunks --collection trades
//! chronoshard-cli --data-dir data checkpoint
//! ```

use anyhow::Context;
use chrono::{DateTime, SecondsFormat};
use chronoshard_core::catalog::{CatalogConfig, Chunk, ChunkCatalog, CollectionMeta};
use chronoshard_core::{format_duration, TimeRange, Timestamp};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chronoshard-cli")]
#[command(about = "Inspect and maintain a ChronoShard catalog", long_about = None)]
#[command(version)]
struct Cli {
    /// Data directory holding catalog.log
    #[arg(short, long, global = true, default_value = "data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List chunks, optionally of a single collection
    Chunks {
        #[arg(short, long)]
        collection: Option<String>,
    },

    /// List collection definitions
    Collections,

    /// Rewrite the catalog log to its live records
    Checkpoint,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let catalog = open_catalog(&cli.data_dir)?;

    match cli.command {
        Commands::Chunks { collection } => {
            let names = match collection {
                Some(name) => vec![name],
                None => catalog.collections().into_iter().map(|m| m.name).collect(),
            };
            println!(
                "{:>8}  {:<20} {:<11} {:<25} {:<25} {:>10}",
                "ID", "COLLECTION", "STATE", "START", "END", "ROWS"
            );
            for name in names {
                for chunk in catalog.list_chunks(&name, TimeRange::all())? {
                    println!("{}", chunk_line(&chunk));
                }
            }
        }
        Commands::Collections => {
            for meta in catalog.collections() {
                println!("{}", collection_line(&meta));
            }
        }
        Commands::Checkpoint => {
            let bytes = catalog.checkpoint()?;
            println!("Catalog rewritten: {} bytes", bytes);
        }
    }

    Ok(())
}

fn open_catalog(dir: &Path) -> anyhow::Result<ChunkCatalog> {
    anyhow::ensure!(dir.is_dir(), "data directory {} does not exist", dir.display());
    ChunkCatalog::open(CatalogConfig::durable(dir))
        .with_context(|| format!("opening catalog in {}", dir.display()))
}

fn format_time(ts: Timestamp) -> String {
    DateTime::from_timestamp_nanos(ts).to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn chunk_line(chunk: &Chunk) -> String {
    let end = chunk.end.map(format_time).unwrap_or_else(|| "-".to_string());
    format!(
        "{:>8}  {:<20} {:<11} {:<25} {:<25} {:>10}",
        chunk.id,
        chunk.collection,
        chunk.state.to_string(),
        format_time(chunk.start),
        end,
        chunk.row_count
    )
}

fn collection_line(meta: &CollectionMeta) -> String {
    let retain = meta
        .retain_for
        .map(format_duration)
        .unwrap_or_else(|| "forever".to_string());
    format!(
        "{}: width={} compress_after={} retain_for={} segment_by={:?}",
        meta.name,
        format_duration(meta.chunk_width),
        format_duration(meta.compress_after),
        retain,
        meta.segment_by
    )
}
