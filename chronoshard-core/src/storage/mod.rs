//! Storage engine - coordinates catalog, router, row store, lifecycle and rollups

mod engine;

pub use engine::{Engine, EngineStats, WriteSummary};

use crate::catalog::{CatalogConfig, CollectionMeta, SegmentBy};
use crate::compression::{CompressionConfig, Compressor};
use crate::rollup::RollupFields;
use crate::store::{FileRowStore, MemoryRowStore, RowStore};
use crate::wal::SyncPolicy;
use crate::{format_duration, parse_duration, Nanos, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Storage engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Data directory holding the catalog log, row segments and rollup
    /// logs. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Sync policy of every log
    pub sync_policy: SyncPolicy,
    /// Chunk width for collections that do not set one
    pub default_chunk_width: Nanos,
    /// Time between lifecycle ticks
    pub scheduler_interval: Duration,
    /// Chunk compression settings
    pub compression: CompressionConfig,
}

impl EngineConfig {
    /// Configuration persisting everything under `dir`
    pub fn durable(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(dir.into()),
            ..Default::default()
        }
    }

    pub fn catalog_config(&self) -> CatalogConfig {
        CatalogConfig {
            dir: self.data_dir.clone(),
            sync_policy: self.sync_policy,
        }
    }

    /// Row store for this configuration: segment files under
    /// `<data_dir>/rows`, or memory without a data directory
    pub fn row_store(&self, compressor: Arc<dyn Compressor>) -> Result<Arc<dyn RowStore>> {
        Ok(match &self.data_dir {
            Some(dir) => Arc::new(FileRowStore::open(
                dir.join(crate::config::ROWS_DIR),
                self.sync_policy,
                compressor,
            )?),
            None => Arc::new(MemoryRowStore::with_compressor(compressor)),
        })
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            sync_policy: SyncPolicy::default(),
            default_chunk_width: crate::config::DEFAULT_CHUNK_WIDTH,
            scheduler_interval: Duration::from_secs(crate::config::DEFAULT_SCHEDULER_INTERVAL_SECS),
            compression: CompressionConfig::default(),
        }
    }
}

fn default_compress_after() -> String {
    format_duration(crate::config::DEFAULT_COMPRESS_AFTER)
}

/// Collection definition as written in configuration files.
///
/// Durations are compact strings such as `"1d"`, `"12h"` or `"90d"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub name: String,
    #[serde(default)]
    pub segment_by: SegmentBy,
    /// Falls back to the engine's default width
    #[serde(default)]
    pub chunk_width: Option<String>,
    #[serde(default = "default_compress_after")]
    pub compress_after: String,
    /// Unset keeps chunks forever
    #[serde(default)]
    pub retain_for: Option<String>,
    /// Maintain a daily rollup over this collection
    #[serde(default)]
    pub rollup: Option<RollupFields>,
}

impl CollectionConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            segment_by: SegmentBy::Entity,
            chunk_width: None,
            compress_after: default_compress_after(),
            retain_for: None,
            rollup: None,
        }
    }

    pub fn segment_by(mut self, segment_by: SegmentBy) -> Self {
        self.segment_by = segment_by;
        self
    }

    pub fn chunk_width(mut self, width: &str) -> Self {
        self.chunk_width = Some(width.to_string());
        self
    }

    pub fn compress_after(mut self, age: &str) -> Self {
        self.compress_after = age.to_string();
        self
    }

    pub fn retain_for(mut self, age: &str) -> Self {
        self.retain_for = Some(age.to_string());
        self
    }

    pub fn rollup(mut self, fields: RollupFields) -> Self {
        self.rollup = Some(fields);
        self
    }

    /// Resolve durations into collection metadata
    pub fn to_meta(&self, default_chunk_width: Nanos) -> Result<CollectionMeta> {
        let chunk_width = match &self.chunk_width {
            Some(width) => parse_duration(width)?,
            None => default_chunk_width,
        };
        let retain_for = self.retain_for.as_deref().map(parse_duration).transpose()?;

        let meta = CollectionMeta::new(&self.name)
            .with_segment_by(self.segment_by.clone())
            .with_chunk_width(chunk_width)
            .with_compress_after(parse_duration(&self.compress_after)?)
            .with_retain_for(retain_for);
        meta.validate()?;
        Ok(meta)
    }
}
