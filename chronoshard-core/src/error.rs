//! Error types for ChronoShard

use crate::{ChunkId, Timestamp};
use thiserror::Error;

/// Result type alias for ChronoShard operations
pub type Result<T> = std::result::Result<T, ChunkError>;

/// ChronoShard error types
#[derive(Error, Debug)]
pub enum ChunkError {
    /// A new chunk would overlap an existing one. Indicates a routing bug.
    #[error("Chunk range [{start}, {end}) in {collection} overlaps chunk {existing}")]
    DuplicateRange {
        collection: String,
        start: Timestamp,
        end: Timestamp,
        existing: ChunkId,
    },

    /// Illegal state transition
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Unknown collection
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    /// Unknown chunk id
    #[error("Chunk not found: {0}")]
    ChunkNotFound(ChunkId),

    /// No rollup is maintained for the collection
    #[error("No rollup on collection: {0}")]
    RollupNotFound(String),

    /// Collection registered twice
    #[error("Collection already exists: {0}")]
    CollectionExists(String),

    /// The row store could not serve the request
    #[error("Row store unavailable: {0}")]
    StoreUnavailable(String),

    /// Chunk rows changed while a compression was in flight
    #[error("Chunk {chunk} changed during compression (expected version {expected}, found {actual})")]
    VersionConflict {
        chunk: ChunkId,
        expected: u64,
        actual: u64,
    },

    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// A batch failed after some of its rows were stored
    #[error("Batch stopped after {inserted} inserted and {duplicates} duplicate rows: {source}")]
    PartialBatch {
        inserted: usize,
        duplicates: usize,
        source: Box<ChunkError>,
    },
}

impl ChunkError {
    /// Check if the operation may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            ChunkError::PartialBatch { source, .. } => source.is_retryable(),
            _ => matches!(
                self,
                ChunkError::Io(_)
                    | ChunkError::StoreUnavailable(_)
                    | ChunkError::VersionConflict { .. }
            ),
        }
    }

    /// The error that stopped a batch, or `self`
    pub fn root(&self) -> &ChunkError {
        match self {
            ChunkError::PartialBatch { source, .. } => source.root(),
            _ => self,
        }
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            ChunkError::Corruption(_) | ChunkError::ChecksumMismatch { .. }
        )
    }

    /// Check if error references an unknown collection or chunk
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ChunkError::CollectionNotFound(_)
                | ChunkError::ChunkNotFound(_)
                | ChunkError::RollupNotFound(_)
        )
    }
}

impl From<bincode::Error> for ChunkError {
    fn from(e: bincode::Error) -> Self {
        ChunkError::InvalidFormat(e.to_string())
    }
}
