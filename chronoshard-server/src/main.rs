//! ChronoShard Server - HTTP API for the chunked time-partition manager

mod api;
mod config;

use anyhow::Context;
use chronoshard_core::storage::Engine;
use clap::{Parser, ValueEnum};
use config::ServerConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// ChronoShard server
#[derive(Debug, Parser)]
#[command(name = "chronoshard", version, about)]
struct Args {
    /// JSON configuration file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Override the data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_format);

    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.http_addr = listen;
    }
    if let Some(dir) = args.data_dir {
        config.data_dir = Some(dir);
    }

    info!("Starting ChronoShard server...");
    match &config.data_dir {
        Some(dir) => info!("Data directory: {:?}", dir),
        None => warn!("No data directory configured; nothing is persisted"),
    }

    // Initialize storage engine
    let engine = Engine::open(config.engine_config()?).context("opening storage engine")?;
    for collection in &config.collections {
        let meta = engine
            .ensure_collection(collection.clone())
            .with_context(|| format!("registering collection {}", collection.name))?;
        info!("Collection {} ready", meta.name);
    }
    let engine = Arc::new(engine);

    let token = CancellationToken::new();
    let scheduler = engine.spawn_scheduler(token.clone());

    // Create router
    let app = api::create_router(engine.clone());

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!("ChronoShard server listening on http://{}", config.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(token.clone()))
        .await?;

    token.cancel();
    if let Err(e) = scheduler.await {
        warn!("Lifecycle scheduler ended abnormally: {}", e);
    }
    engine.checkpoint()?;
    info!("ChronoShard server stopped");

    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for ctrl-c: {}", e);
            }
            info!("Shutdown requested");
            token.cancel();
        }
        _ = token.cancelled() => {}
    }
}
