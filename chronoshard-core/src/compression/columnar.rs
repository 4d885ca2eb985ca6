//! Columnar segment encoder
//!
//! Rows of a segment are split into columns: delta-encoded timestamps, a
//! dictionary-encoded entity column, discriminators, and one column per
//! field. The column set is bincode-encoded and optionally LZ4-compressed.

use super::{CompressionConfig, Compressor, EncodedBlock, FrameCodec, SegmentFrame};
use crate::catalog::SegmentBy;
use crate::{ChunkError, FieldValue, Fields, Result, Row, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default, Serialize, Deserialize)]
struct ColumnSet {
    /// First value absolute, then differences to the previous timestamp
    time_deltas: Vec<i64>,
    entity_dict: Vec<String>,
    entity_ids: Vec<u32>,
    discriminators: Vec<Option<i64>>,
    fields: BTreeMap<String, Vec<Option<FieldValue>>>,
}

impl ColumnSet {
    fn pack(rows: &[&Row]) -> Self {
        let mut set = ColumnSet::default();
        let mut dict: HashMap<&str, u32> = HashMap::new();
        let mut prev: Option<Timestamp> = None;

        for (i, row) in rows.iter().enumerate() {
            set.time_deltas.push(match prev {
                Some(p) => row.time.wrapping_sub(p),
                None => row.time,
            });
            prev = Some(row.time);

            let next_id = dict.len() as u32;
            let id = *dict.entry(row.entity.as_str()).or_insert_with(|| {
                set.entity_dict.push(row.entity.clone());
                next_id
            });
            set.entity_ids.push(id);
            set.discriminators.push(row.discriminator);

            for (name, value) in row.fields.iter() {
                let column = set
                    .fields
                    .entry(name.clone())
                    .or_insert_with(|| vec![None; i]);
                column.resize(i, None);
                column.push(Some(value.clone()));
            }
        }
        for column in set.fields.values_mut() {
            column.resize(rows.len(), None);
        }

        set
    }

    fn unpack(self, expected_rows: usize) -> Result<Vec<Row>> {
        let n = self.time_deltas.len();
        if n != expected_rows
            || self.entity_ids.len() != n
            || self.discriminators.len() != n
            || self.fields.values().any(|c| c.len() != n)
        {
            return Err(ChunkError::Corruption(format!(
                "Column lengths disagree with frame row count {}",
                expected_rows
            )));
        }

        let mut rows = Vec::with_capacity(n);
        let mut time: Timestamp = 0;
        let mut columns: Vec<(String, std::vec::IntoIter<Option<FieldValue>>)> = self
            .fields
            .into_iter()
            .map(|(name, values)| (name, values.into_iter()))
            .collect();

        for i in 0..n {
            time = if i == 0 {
                self.time_deltas[0]
            } else {
                time.wrapping_add(self.time_deltas[i])
            };
            let entity = self
                .entity_dict
                .get(self.entity_ids[i] as usize)
                .ok_or_else(|| {
                    ChunkError::Corruption(format!("Entity id {} out of range", self.entity_ids[i]))
                })?
                .clone();

            let mut fields = Fields::new();
            for (name, values) in columns.iter_mut() {
                if let Some(Some(value)) = values.next() {
                    fields.insert(name.clone(), value);
                }
            }

            rows.push(Row {
                time,
                entity,
                discriminator: self.discriminators[i],
                fields,
            });
        }

        Ok(rows)
    }
}

/// Default [`Compressor`]: group by segment, pack columns, LZ4
#[derive(Debug, Clone, Default)]
pub struct ColumnarCompressor {
    config: CompressionConfig,
}

impl ColumnarCompressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    fn encode_frame(&self, segment: &str, rows: &[&Row]) -> Result<SegmentFrame> {
        let packed = bincode::serialize(&ColumnSet::pack(rows))?;
        let (codec, data) = if self.config.use_lz4 {
            (FrameCodec::Lz4, lz4_flex::compress_prepend_size(&packed))
        } else {
            (FrameCodec::Raw, packed)
        };

        Ok(SegmentFrame {
            segment: segment.to_string(),
            row_count: rows.len(),
            first_time: rows.first().map(|r| r.time).unwrap_or_default(),
            last_time: rows.last().map(|r| r.time).unwrap_or_default(),
            codec,
            checksum: crc32fast::hash(&data),
            data,
        })
    }

    fn decode_frame(frame: &SegmentFrame) -> Result<Vec<Row>> {
        let actual = crc32fast::hash(&frame.data);
        if actual != frame.checksum {
            return Err(ChunkError::ChecksumMismatch {
                expected: frame.checksum,
                actual,
            });
        }

        let packed = match frame.codec {
            FrameCodec::Raw => frame.data.clone(),
            FrameCodec::Lz4 => lz4_flex::decompress_size_prepended(&frame.data)
                .map_err(|e| ChunkError::Compression(e.to_string()))?,
        };
        let set: ColumnSet = bincode::deserialize(&packed)?;
        set.unpack(frame.row_count)
    }
}

impl Compressor for ColumnarCompressor {
    fn compress(&self, rows: &[Row], segment_by: &SegmentBy) -> Result<EncodedBlock> {
        let mut segments: BTreeMap<String, Vec<&Row>> = BTreeMap::new();
        for row in rows {
            segments.entry(segment_by.label(row)).or_default().push(row);
        }

        let frame_rows = self.config.frame_rows.max(1);
        let mut frames = Vec::new();
        for (segment, mut members) in segments {
            members.sort_by(|a, b| a.key().cmp(&b.key()));
            for slice in members.chunks(frame_rows) {
                frames.push(self.encode_frame(&segment, slice)?);
            }
        }

        Ok(EncodedBlock {
            frames,
            row_count: rows.len(),
            raw_size: bincode::serialized_size(rows)? as usize,
        })
    }

    fn decompress(&self, block: &EncodedBlock) -> Result<Vec<Row>> {
        let mut rows = Vec::with_capacity(block.row_count);
        for frame in &block.frames {
            rows.extend(Self::decode_frame(frame)?);
        }
        if rows.len() != block.row_count {
            return Err(ChunkError::Corruption(format!(
                "Block holds {} rows, header says {}",
                rows.len(),
                block.row_count
            )));
        }
        rows.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(rows)
    }
}
