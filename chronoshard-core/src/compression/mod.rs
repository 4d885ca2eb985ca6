//! Chunk compression
//!
//! Compression is a capability handed to the lifecycle scheduler: it turns
//! the rows of one chunk into an [`EncodedBlock`] grouped by the
//! collection's segmentation key, and back. Nothing outside this module
//! looks inside a block.

mod columnar;

pub use columnar::ColumnarCompressor;

use crate::catalog::SegmentBy;
use crate::{Result, Row, Timestamp};
use serde::{Deserialize, Serialize};

/// Encode/decode rows of a chunk
pub trait Compressor: Send + Sync {
    /// Pack `rows` into a block, grouping by `segment_by`
    fn compress(&self, rows: &[Row], segment_by: &SegmentBy) -> Result<EncodedBlock>;

    /// Unpack every row of a block, ordered by row key
    fn decompress(&self, block: &EncodedBlock) -> Result<Vec<Row>>;
}

/// Byte codec applied to a frame after columnar packing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameCodec {
    Raw,
    Lz4,
}

/// Encoded rows of one segment (or a slice of a large segment)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentFrame {
    /// Segmentation key value shared by every row in the frame
    pub segment: String,
    pub row_count: usize,
    pub first_time: Timestamp,
    pub last_time: Timestamp,
    pub codec: FrameCodec,
    /// CRC32 of `data`
    pub checksum: u32,
    pub data: Vec<u8>,
}

/// Compressed contents of a chunk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncodedBlock {
    pub frames: Vec<SegmentFrame>,
    pub row_count: usize,
    /// Serialized size of the rows before encoding
    pub raw_size: usize,
}

impl EncodedBlock {
    /// Total encoded payload bytes
    pub fn encoded_size(&self) -> usize {
        self.frames.iter().map(|f| f.data.len()).sum()
    }

    /// Get compression ratio
    pub fn compression_ratio(&self) -> f64 {
        let encoded = self.encoded_size();
        if encoded == 0 {
            return 1.0;
        }
        self.raw_size as f64 / encoded as f64
    }

    /// Get bytes per row
    pub fn bytes_per_row(&self) -> f64 {
        if self.row_count == 0 {
            return 0.0;
        }
        self.encoded_size() as f64 / self.row_count as f64
    }

    /// Distinct segment labels, in frame order
    pub fn segments(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = self.frames.iter().map(|f| f.segment.as_str()).collect();
        labels.dedup();
        labels
    }
}

/// Compression configuration
#[derive(Debug, Clone, Copy)]
pub struct CompressionConfig {
    /// Maximum rows per frame
    pub frame_rows: usize,
    /// Whether to use LZ4 on top of columnar packing
    pub use_lz4: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            frame_rows: 1000,
            use_lz4: true,
        }
    }
}
