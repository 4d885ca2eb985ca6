//! Log replay

use super::{CatalogRecord, LogRecord, WalConfig};
use crate::{ChunkError, Result};
use std::fs;
use std::marker::PhantomData;
use tracing::{debug, warn};

/// Outcome of replaying a log
#[derive(Debug)]
pub struct Replay<R = CatalogRecord> {
    /// Records in log order
    pub records: Vec<R>,
    /// Length of the valid prefix in bytes
    pub valid_len: u64,
    /// Whether bytes past `valid_len` were discarded
    pub truncated: bool,
}

impl<R> Default for Replay<R> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            valid_len: 0,
            truncated: false,
        }
    }
}

/// Reads a log back after a restart
pub struct WalReader<R = CatalogRecord> {
    config: WalConfig,
    _record: PhantomData<fn() -> R>,
}

impl<R: LogRecord> WalReader<R> {
    pub fn new(config: WalConfig) -> Self {
        Self {
            config,
            _record: PhantomData,
        }
    }

    /// Read every intact record. Stops at the first torn or corrupt frame.
    pub fn replay(&self) -> Result<Replay<R>> {
        if !self.config.path.exists() {
            return Ok(Replay::default());
        }

        let data = fs::read(&self.config.path)?;
        let mut replay = Replay::default();
        let mut offset = 0usize;

        while offset < data.len() {
            match R::deserialize_with_checksum(&data[offset..]) {
                Ok((record, bytes_read)) => {
                    replay.records.push(record);
                    offset += bytes_read;
                }
                Err(ChunkError::ChecksumMismatch { .. }) => {
                    warn!(
                        "Checksum mismatch at offset {} in {:?}, truncating",
                        offset, self.config.path
                    );
                    break;
                }
                Err(ChunkError::InvalidFormat(msg)) => {
                    // crash during append
                    warn!(
                        "Torn record at offset {} in {:?} ({}), truncating",
                        offset, self.config.path, msg
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        replay.valid_len = offset as u64;
        replay.truncated = offset < data.len();

        debug!(
            "Replayed {} records from {:?}",
            replay.records.len(),
            self.config.path
        );

        Ok(replay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::WalWriter;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_replay_records() {
        let temp_dir = TempDir::new().unwrap();
        let config = WalConfig::new(temp_dir.path().join("catalog.log"));

        {
            let writer = WalWriter::open(config.clone(), 0).unwrap();
            for id in 0..10 {
                writer.append(&CatalogRecord::DropChunk { id }).unwrap();
            }
            writer.sync().unwrap();
        }

        let replay = WalReader::<CatalogRecord>::new(config).replay().unwrap();
        assert_eq!(replay.records.len(), 10);
        assert!(!replay.truncated);
    }

    #[test]
    fn test_replay_truncates_torn_tail() {
        let temp_dir = TempDir::new().unwrap();
        let config = WalConfig::new(temp_dir.path().join("catalog.log"));

        {
            let writer = WalWriter::open(config.clone(), 0).unwrap();
            writer.append(&CatalogRecord::IdWatermark(3)).unwrap();
            writer.sync().unwrap();
        }
        let intact = fs::metadata(&config.path).unwrap().len();
        {
            let mut file = fs::OpenOptions::new().append(true).open(&config.path).unwrap();
            file.write_all(&[42, 0, 0, 0, 3, 1]).unwrap();
        }

        let replay = WalReader::<CatalogRecord>::new(config.clone()).replay().unwrap();
        assert_eq!(replay.records, vec![CatalogRecord::IdWatermark(3)]);
        assert_eq!(replay.valid_len, intact);
        assert!(replay.truncated);

        // reopening for append cuts the torn bytes off
        let writer = WalWriter::open(config.clone(), replay.valid_len).unwrap();
        assert_eq!(fs::metadata(&config.path).unwrap().len(), intact);
        writer.append(&CatalogRecord::IdWatermark(4)).unwrap();
        assert_eq!(
            WalReader::<CatalogRecord>::new(config).replay().unwrap().records.len(),
            2
        );
    }

    #[test]
    fn test_replay_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = WalConfig::new(temp_dir.path().join("absent.log"));
        let replay = WalReader::<CatalogRecord>::new(config).replay().unwrap();
        assert!(replay.records.is_empty());
        assert_eq!(replay.valid_len, 0);
    }
}
