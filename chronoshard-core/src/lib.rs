//! ChronoShard Core - Chunked Time-Partition Manager
//!
//! Storage lifecycle for append-mostly, time-stamped datasets such as
//! market data (OHLCV bars, trade ticks, order-book snapshots, news).
//!
//! # Architecture
//!
//! - **Catalog**: chunk metadata per collection, made durable by an
//!   append-only checksummed log
//! - **Router**: maps write timestamps to chunks and prunes chunks for reads
//! - **Lifecycle**: background compression and retention enforcement
//! - **Rollup**: incrementally maintained daily OHLCV buckets
//! - **Store**: the row store seam, an in-memory store and a file-backed one
//! - **Compression**: columnar, segment-grouped chunk encoding

pub mod catalog;
pub mod clock;
pub mod compression;
pub mod lifecycle;
pub mod rollup;
pub mod router;
pub mod storage;
pub mod store;
pub mod wal;

mod error;
mod types;

pub use error::{ChunkError, Result};
pub use types::*;

/// ChronoShard version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    use crate::Nanos;

    /// One second in nanoseconds
    pub const SECOND: Nanos = 1_000_000_000;

    /// One hour in nanoseconds
    pub const HOUR: Nanos = 3_600 * SECOND;

    /// One day in nanoseconds
    pub const DAY: Nanos = 24 * HOUR;

    /// Default chunk width (one day)
    pub const DEFAULT_CHUNK_WIDTH: Nanos = DAY;

    /// Default compression threshold (seven days)
    pub const DEFAULT_COMPRESS_AFTER: Nanos = 7 * DAY;

    /// Default interval between lifecycle ticks (one hour)
    pub const DEFAULT_SCHEDULER_INTERVAL_SECS: u64 = 3_600;

    /// Attempts to re-resolve a route when a chunk disappears under a write
    pub const WRITE_ROUTE_ATTEMPTS: usize = 3;

    /// Catalog log file name inside the data directory
    pub const CATALOG_LOG_FILE: &str = "catalog.log";

    /// Directory of per-chunk row segments inside the data directory
    pub const ROWS_DIR: &str = "rows";

    /// Extension of a chunk's row segment file
    pub const SEGMENT_EXTENSION: &str = "seg";

    /// Directory of rollup logs inside the data directory
    pub const ROLLUPS_DIR: &str = "rollups";

    /// Deleted chunk ids a row store remembers per collection
    pub const TOMBSTONE_LIMIT: usize = 1024;
}
