//! Row store seam
//!
//! The chunk manager never owns row bytes itself. Rows live behind
//! [`RowStore`], addressed by `(collection, chunk)`, and are read back
//! lazily through [`RowScan`].

mod file;
mod memory;
mod scan;

pub use file::{FileRowStore, SegmentRecord};
pub use memory::{MemoryRowStore, MemoryStoreStats};
pub use scan::RowScan;

use crate::compression::EncodedBlock;
use crate::{ChunkId, Result, Row, TimeRange};
use std::sync::Arc;

/// Filter applied to rows during a scan
pub type RowPredicate = Arc<dyn Fn(&Row) -> bool + Send + Sync>;

/// Keep rows whose time falls inside `range`
pub fn time_predicate(range: TimeRange) -> RowPredicate {
    Arc::new(move |row: &Row| range.contains(row.time))
}

/// Rows of one chunk at a given version
#[derive(Debug, Clone, Default)]
pub struct ChunkSnapshot {
    /// Every row of the chunk, ordered by row key
    pub rows: Vec<Row>,
    /// Bumped by every append and compressed swap
    pub version: u64,
}

/// Storage of rows, partitioned by chunk
pub trait RowStore: Send + Sync {
    /// Append a row. Returns `false` when a row with the same key exists.
    ///
    /// Fails with `ChunkNotFound` once the chunk's rows have been deleted.
    fn append(&self, collection: &str, chunk: ChunkId, row: Row) -> Result<bool>;

    /// Read every row of a chunk together with its version
    fn scan_chunk(&self, collection: &str, chunk: ChunkId) -> Result<ChunkSnapshot>;

    /// Replace a chunk's rows with an encoded block.
    ///
    /// Fails with `VersionConflict` if the chunk changed since the snapshot
    /// the block was built from.
    fn store_compressed(
        &self,
        collection: &str,
        chunk: ChunkId,
        block: EncodedBlock,
        expected_version: u64,
    ) -> Result<()>;

    /// Delete every row of a chunk. Deleting absent rows is a no-op.
    fn delete_chunk_rows(&self, collection: &str, chunk: ChunkId) -> Result<()>;

    /// Exact number of rows held for a chunk
    fn row_count(&self, collection: &str, chunk: ChunkId) -> Result<u64>;

    /// Ids of the chunks of `collection` that hold rows
    fn chunk_ids(&self, collection: &str) -> Result<Vec<ChunkId>>;

    /// Whether rows outlive the process
    fn is_durable(&self) -> bool {
        false
    }
}
