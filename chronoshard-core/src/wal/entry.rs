//! Log records and their framing

use crate::catalog::{Chunk, CollectionMeta};
use crate::{ChunkError, ChunkId, Nanos, Result, Timestamp};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A record that can be framed into a checksummed log file
pub trait LogRecord: Serialize + DeserializeOwned {
    /// Kind byte stored in the frame header
    fn kind_code(&self) -> u8;

    /// Serialize the record with length prefix and CRC checksum
    ///
    /// Format:
    /// - 4 bytes: frame length (excluding this field)
    /// - 1 byte: record kind
    /// - 4 bytes: payload length
    /// - N bytes: bincode payload
    /// - 4 bytes: CRC32 checksum
    fn serialize_with_checksum(&self) -> Result<Bytes> {
        let payload = bincode::serialize(self)?;
        let mut buf = BytesMut::with_capacity(payload.len() + 13);

        // Reserve space for length prefix
        buf.put_u32_le(0);
        buf.put_u8(self.kind_code());
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);

        // Checksum excludes the length prefix
        let checksum = crc32fast::hash(&buf[4..]);
        buf.put_u32_le(checksum);

        let len = (buf.len() - 4) as u32;
        buf[0..4].copy_from_slice(&len.to_le_bytes());

        Ok(buf.freeze())
    }

    /// Deserialize a record from bytes, validating checksum.
    /// Returns the record and the number of bytes consumed.
    fn deserialize_with_checksum(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 4 {
            return Err(ChunkError::InvalidFormat("Entry too short".into()));
        }

        let len = (&data[..4]).get_u32_le() as usize;
        if len < 9 || data.len() < 4 + len {
            return Err(ChunkError::InvalidFormat("Incomplete entry".into()));
        }

        let frame = &data[4..4 + len];
        let expected = (&frame[frame.len() - 4..]).get_u32_le();
        let actual = crc32fast::hash(&frame[..frame.len() - 4]);
        if expected != actual {
            return Err(ChunkError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = &frame[..frame.len() - 4];
        let kind = cursor.get_u8();
        let payload_len = cursor.get_u32_le() as usize;
        if cursor.len() != payload_len {
            return Err(ChunkError::Corruption(format!(
                "Payload length {} does not match frame ({} bytes)",
                payload_len,
                cursor.len()
            )));
        }

        let record: Self = bincode::deserialize(cursor)?;
        if record.kind_code() != kind {
            return Err(ChunkError::Corruption(format!(
                "Record kind {} does not match header {}",
                record.kind_code(),
                kind
            )));
        }

        Ok((record, 4 + len))
    }
}

/// Record kind byte stored in each frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RecordKind {
    RegisterCollection = 1,
    UpdateThresholds = 2,
    CreateChunk = 3,
    CloseChunk = 4,
    MarkCompressed = 5,
    DropChunk = 6,
    IdWatermark = 7,
    DropIntent = 8,
}

/// A single catalog mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CatalogRecord {
    RegisterCollection(CollectionMeta),
    UpdateThresholds {
        collection: String,
        compress_after: Nanos,
        retain_for: Option<Nanos>,
    },
    /// An open chunk, a gap chunk, or a snapshot of any chunk at checkpoint
    CreateChunk(Chunk),
    CloseChunk {
        id: ChunkId,
        end: Timestamp,
        row_count: u64,
    },
    MarkCompressed {
        id: ChunkId,
        row_count: u64,
    },
    DropChunk {
        id: ChunkId,
    },
    /// Rows of the chunk are about to be deleted
    DropIntent {
        id: ChunkId,
    },
    /// Next chunk id to assign; keeps ids unique across checkpoints
    IdWatermark(ChunkId),
}

impl CatalogRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            CatalogRecord::RegisterCollection(_) => RecordKind::RegisterCollection,
            CatalogRecord::UpdateThresholds { .. } => RecordKind::UpdateThresholds,
            CatalogRecord::CreateChunk(_) => RecordKind::CreateChunk,
            CatalogRecord::CloseChunk { .. } => RecordKind::CloseChunk,
            CatalogRecord::MarkCompressed { .. } => RecordKind::MarkCompressed,
            CatalogRecord::DropChunk { .. } => RecordKind::DropChunk,
            CatalogRecord::IdWatermark(_) => RecordKind::IdWatermark,
            CatalogRecord::DropIntent { .. } => RecordKind::DropIntent,
        }
    }
}

impl LogRecord for CatalogRecord {
    fn kind_code(&self) -> u8 {
        self.kind() as u8
    }
}
