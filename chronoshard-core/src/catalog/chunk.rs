//! Chunk and collection metadata

use crate::{ChunkError, ChunkId, Nanos, Result, Row, TimeRange, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Storage state of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    /// The current chunk at the latest-time end of its collection
    Open,
    /// Bounded, raw rows
    ClosedUncompressed,
    /// Bounded, rows held as an encoded block
    Compressed,
}

impl fmt::Display for ChunkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChunkState::Open => "open",
            ChunkState::ClosedUncompressed => "closed",
            ChunkState::Compressed => "compressed",
        };
        f.write_str(s)
    }
}

/// A time-range partition of one collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub collection: String,
    /// Inclusive start
    pub start: Timestamp,
    /// Exclusive end, `None` while the chunk is open
    pub end: Option<Timestamp>,
    pub state: ChunkState,
    /// Row-count estimate
    pub row_count: u64,
}

impl Chunk {
    pub fn is_open(&self) -> bool {
        self.state == ChunkState::Open
    }

    /// Range used for routing lookups. An open chunk nominally spans one
    /// chunk width from its start.
    pub fn nominal_range(&self, width: Nanos) -> TimeRange {
        TimeRange::new(
            self.start,
            self.end.unwrap_or_else(|| self.start.saturating_add(width)),
        )
    }

    /// Range used for overlap checks. An open chunk has no upper bound.
    pub fn claimed_range(&self) -> TimeRange {
        TimeRange::new(self.start, self.end.unwrap_or(Timestamp::MAX))
    }

    /// Age reference for lifecycle thresholds: the end bound, if closed
    pub fn closed_end(&self) -> Option<Timestamp> {
        match self.state {
            ChunkState::Open => None,
            _ => self.end,
        }
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(
                f,
                "chunk {} of {} [{}, {}) {}",
                self.id, self.collection, self.start, end, self.state
            ),
            None => write!(
                f,
                "chunk {} of {} [{}, ..) {}",
                self.id, self.collection, self.start, self.state
            ),
        }
    }
}

/// Attribute grouping rows inside a compressed chunk
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentBy {
    /// The row's entity key (contract id)
    Entity,
    /// A named field (category id)
    Field(String),
}

impl SegmentBy {
    /// Segment label of a row; rows missing the field share the empty segment
    pub fn label(&self, row: &Row) -> String {
        match self {
            SegmentBy::Entity => row.entity.clone(),
            SegmentBy::Field(name) => row
                .fields
                .get(name)
                .map(|v| v.segment_label())
                .unwrap_or_default(),
        }
    }
}

impl Default for SegmentBy {
    fn default() -> Self {
        SegmentBy::Entity
    }
}

/// A registered time-series collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionMeta {
    pub name: String,
    pub segment_by: SegmentBy,
    /// Fixed width of every chunk
    pub chunk_width: Nanos,
    /// Minimum chunk age before compression
    pub compress_after: Nanos,
    /// Minimum chunk age before deletion, `None` keeps chunks forever
    pub retain_for: Option<Nanos>,
}

impl CollectionMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            segment_by: SegmentBy::Entity,
            chunk_width: crate::config::DEFAULT_CHUNK_WIDTH,
            compress_after: crate::config::DEFAULT_COMPRESS_AFTER,
            retain_for: None,
        }
    }

    pub fn with_segment_by(mut self, segment_by: SegmentBy) -> Self {
        self.segment_by = segment_by;
        self
    }

    pub fn with_chunk_width(mut self, width: Nanos) -> Self {
        self.chunk_width = width;
        self
    }

    pub fn with_compress_after(mut self, age: Nanos) -> Self {
        self.compress_after = age;
        self
    }

    pub fn with_retain_for(mut self, age: Option<Nanos>) -> Self {
        self.retain_for = age;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ChunkError::Config("Collection name must not be empty".into()));
        }
        if self.chunk_width <= 0 {
            return Err(ChunkError::Config(format!(
                "Chunk width of {} must be positive",
                self.name
            )));
        }
        validate_thresholds(&self.name, self.compress_after, self.retain_for)
    }
}

pub(crate) fn validate_thresholds(
    name: &str,
    compress_after: Nanos,
    retain_for: Option<Nanos>,
) -> Result<()> {
    if compress_after < 0 {
        return Err(ChunkError::Config(format!(
            "Compression threshold of {} must not be negative",
            name
        )));
    }
    if matches!(retain_for, Some(age) if age < 0) {
        return Err(ChunkError::Config(format!(
            "Retention threshold of {} must not be negative",
            name
        )));
    }
    Ok(())
}
