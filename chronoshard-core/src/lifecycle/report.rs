//! Lifecycle run reports

use crate::{ChunkId, Timestamp};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// What a run does to a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkAction {
    /// Close an idle open chunk at its nominal end
    Close,
    Compress,
    Drop,
}

impl fmt::Display for ChunkAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkAction::Close => f.write_str("close"),
            ChunkAction::Compress => f.write_str("compress"),
            ChunkAction::Drop => f.write_str("drop"),
        }
    }
}

/// A chunk the run could not process; it keeps its previous state
#[derive(Debug, Clone, Serialize)]
pub struct ChunkFailure {
    pub chunk: ChunkId,
    pub action: ChunkAction,
    pub error: String,
    pub retryable: bool,
}

/// Outcome of one collection's run
#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectionReport {
    pub collection: String,
    /// Idle open chunks closed by the run
    pub closed: Vec<ChunkId>,
    pub compressed: Vec<ChunkId>,
    pub dropped: Vec<ChunkId>,
    pub failures: Vec<ChunkFailure>,
    /// Another run held the collection
    pub skipped: bool,
    /// The run could not start
    pub error: Option<String>,
}

impl CollectionReport {
    pub fn new(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            ..Default::default()
        }
    }
}

/// Outcome of one scheduler tick
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub tick_id: Uuid,
    /// Clock reading at the start of the tick
    pub started_at: Timestamp,
    pub collections: Vec<CollectionReport>,
    pub cancelled: bool,
}

impl TickReport {
    pub fn new(tick_id: Uuid, started_at: Timestamp) -> Self {
        Self {
            tick_id,
            started_at,
            collections: Vec::new(),
            cancelled: false,
        }
    }

    pub fn closed(&self) -> usize {
        self.collections.iter().map(|c| c.closed.len()).sum()
    }

    pub fn compressed(&self) -> usize {
        self.collections.iter().map(|c| c.compressed.len()).sum()
    }

    pub fn dropped(&self) -> usize {
        self.collections.iter().map(|c| c.dropped.len()).sum()
    }

    pub fn failures(&self) -> Vec<&ChunkFailure> {
        self.collections.iter().flat_map(|c| &c.failures).collect()
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.collections
            .iter()
            .filter(|c| c.skipped)
            .map(|c| c.collection.as_str())
            .collect()
    }
}
