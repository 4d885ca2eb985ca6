//! Server configuration

use anyhow::Context;
use chronoshard_core::catalog::SegmentBy;
use chronoshard_core::rollup::RollupFields;
use chronoshard_core::storage::{CollectionConfig, EngineConfig};
use chronoshard_core::parse_duration;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration, read from a JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listen address
    pub http_addr: SocketAddr,
    /// Data directory, `None` keeps everything in memory
    pub data_dir: Option<PathBuf>,
    /// Time between lifecycle ticks
    pub scheduler_interval: String,
    /// Chunk width for collections that do not set one
    pub default_chunk_width: String,
    /// Collections registered at startup
    pub collections: Vec<CollectionConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8086)),
            data_dir: Some(PathBuf::from("data")),
            scheduler_interval: "1h".to_string(),
            default_chunk_width: "1d".to_string(),
            collections: vec![
                CollectionConfig::new("historical_data").rollup(RollupFields::bar()),
                CollectionConfig::new("trades").retain_for("90d"),
                CollectionConfig::new("orderbook_snapshots").retain_for("30d"),
                CollectionConfig::new("news_items")
                    .segment_by(SegmentBy::Field("category".into())),
            ],
        }
    }
}

impl ServerConfig {
    /// Load from `path`, or fall back to defaults when no path is given
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        let interval = parse_duration(&self.scheduler_interval)?;
        anyhow::ensure!(interval > 0, "scheduler interval must be positive");

        Ok(EngineConfig {
            data_dir: self.data_dir.clone(),
            default_chunk_width: parse_duration(&self.default_chunk_width)?,
            scheduler_interval: Duration::from_nanos(interval as u64),
            ..Default::default()
        })
    }
}
