//! File-backed row store
//!
//! Rows are served from a [`MemoryRowStore`]; every accepted append is also
//! framed into a per-chunk segment file at
//! `<dir>/<collection>/<chunk>.seg`. Compressing a chunk rewrites its
//! segment to a single block frame, and deleting the chunk removes the
//! file. Opening the store replays every segment back into memory.

use super::{ChunkSnapshot, MemoryRowStore, RowStore};
use crate::compression::{Compressor, EncodedBlock};
use crate::wal::{file_stem, parse_file_stem, LogRecord, SyncPolicy, WalConfig, WalReader, WalWriter};
use crate::{ChunkError, ChunkId, Result, Row};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Frame of a chunk segment file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SegmentRecord {
    /// One accepted raw row
    Row(Row),
    /// Compressed rows replacing everything before it
    Block(EncodedBlock),
}

impl LogRecord for SegmentRecord {
    fn kind_code(&self) -> u8 {
        match self {
            SegmentRecord::Row(_) => 1,
            SegmentRecord::Block(_) => 2,
        }
    }
}

type SegmentKey = (String, ChunkId);

#[derive(Default)]
struct Segment {
    /// Opened on first write
    writer: Option<WalWriter<SegmentRecord>>,
}

/// [`RowStore`] persisting every chunk to its own segment file
pub struct FileRowStore {
    dir: PathBuf,
    sync_policy: SyncPolicy,
    memory: MemoryRowStore,
    /// Appends, swaps and deletes of one chunk hold its segment lock
    segments: RwLock<HashMap<SegmentKey, Arc<Mutex<Segment>>>>,
}

impl FileRowStore {
    /// Open the store under `dir`, replaying every segment found there
    pub fn open(
        dir: impl Into<PathBuf>,
        sync_policy: SyncPolicy,
        compressor: Arc<dyn Compressor>,
    ) -> Result<Self> {
        let store = Self {
            dir: dir.into(),
            sync_policy,
            memory: MemoryRowStore::with_compressor(compressor),
            segments: RwLock::new(HashMap::new()),
        };
        fs::create_dir_all(&store.dir)?;
        store.recover()?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Rows held in memory, see [`MemoryRowStore::stats`]
    pub fn stats(&self) -> super::MemoryStoreStats {
        self.memory.stats()
    }

    fn recover(&self) -> Result<()> {
        let mut recovered = 0usize;
        for collection_dir in fs::read_dir(&self.dir)? {
            let collection_dir = collection_dir?.path();
            if !collection_dir.is_dir() {
                continue;
            }
            let Some(collection) = collection_dir
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(parse_file_stem)
            else {
                warn!("Skipping unrecognised directory {:?}", collection_dir);
                continue;
            };

            for file in fs::read_dir(&collection_dir)? {
                let path = file?.path();
                if path.extension().and_then(|ext| ext.to_str())
                    != Some(crate::config::SEGMENT_EXTENSION)
                {
                    continue;
                }
                let Some(chunk) = path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .and_then(|stem| stem.parse::<ChunkId>().ok())
                else {
                    warn!("Skipping unrecognised segment {:?}", path);
                    continue;
                };
                self.recover_segment(&collection, chunk)?;
                recovered += 1;
            }
        }

        if recovered > 0 {
            info!("Recovered {} chunk segments from {:?}", recovered, self.dir);
        }
        Ok(())
    }

    fn recover_segment(&self, collection: &str, chunk: ChunkId) -> Result<()> {
        let config = self.segment_config(collection, chunk);
        let replay = WalReader::<SegmentRecord>::new(config.clone()).replay()?;

        for record in replay.records {
            match record {
                SegmentRecord::Row(row) => {
                    self.memory.append(collection, chunk, row)?;
                }
                SegmentRecord::Block(block) => {
                    self.memory.restore_block(collection, chunk, block)?;
                }
            }
        }

        // reopening cuts off a torn tail
        let writer = WalWriter::open(config, replay.valid_len)?;
        let segment = self.segment(collection, chunk);
        segment.lock().writer = Some(writer);
        Ok(())
    }

    fn segment_config(&self, collection: &str, chunk: ChunkId) -> WalConfig {
        let path = self
            .dir
            .join(file_stem(collection))
            .join(format!("{}.{}", chunk, crate::config::SEGMENT_EXTENSION));
        WalConfig::new(path).with_sync_policy(self.sync_policy)
    }

    fn segment(&self, collection: &str, chunk: ChunkId) -> Arc<Mutex<Segment>> {
        let key = (collection.to_string(), chunk);
        if let Some(segment) = self.segments.read().get(&key) {
            return segment.clone();
        }
        self.segments.write().entry(key).or_default().clone()
    }

    fn writer<'a>(
        &self,
        segment: &'a mut Segment,
        collection: &str,
        chunk: ChunkId,
    ) -> Result<&'a WalWriter<SegmentRecord>> {
        if segment.writer.is_none() {
            // no frames of this chunk are live, so stale bytes are discarded
            let writer = WalWriter::open(self.segment_config(collection, chunk), 0)?;
            segment.writer = Some(writer);
        }
        segment
            .writer
            .as_ref()
            .ok_or_else(|| ChunkError::Internal(format!("segment {} not open", chunk)))
    }
}

impl RowStore for FileRowStore {
    fn append(&self, collection: &str, chunk: ChunkId, row: Row) -> Result<bool> {
        let segment = self.segment(collection, chunk);
        let mut segment = segment.lock();

        let key = row.key();
        let record = SegmentRecord::Row(row.clone());
        if !self.memory.append(collection, chunk, row)? {
            return Ok(false);
        }

        let persisted = self
            .writer(&mut segment, collection, chunk)
            .and_then(|writer| writer.append(&record));
        if let Err(e) = persisted {
            self.memory.discard(collection, chunk, &key);
            return Err(e);
        }
        Ok(true)
    }

    fn scan_chunk(&self, collection: &str, chunk: ChunkId) -> Result<ChunkSnapshot> {
        self.memory.scan_chunk(collection, chunk)
    }

    fn store_compressed(
        &self,
        collection: &str,
        chunk: ChunkId,
        block: EncodedBlock,
        expected_version: u64,
    ) -> Result<()> {
        let segment = self.segment(collection, chunk);
        let mut segment = segment.lock();

        let record = SegmentRecord::Block(block.clone());
        self.memory
            .store_compressed(collection, chunk, block, expected_version)?;

        // on failure the old frames still hold the same rows
        let written = self
            .writer(&mut segment, collection, chunk)?
            .rewrite(std::slice::from_ref(&record))?;
        debug!(
            "Rewrote segment of chunk {} in {} as a {} byte block",
            chunk, collection, written
        );
        Ok(())
    }

    fn delete_chunk_rows(&self, collection: &str, chunk: ChunkId) -> Result<()> {
        let segment = self.segment(collection, chunk);
        let mut segment = segment.lock();

        self.memory.delete_chunk_rows(collection, chunk)?;
        segment.writer = None;

        let path = self.segment_config(collection, chunk).path;
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.segments
            .write()
            .remove(&(collection.to_string(), chunk));
        Ok(())
    }

    fn row_count(&self, collection: &str, chunk: ChunkId) -> Result<u64> {
        self.memory.row_count(collection, chunk)
    }

    fn chunk_ids(&self, collection: &str) -> Result<Vec<ChunkId>> {
        Ok(self.memory.chunk_ids(collection))
    }

    fn is_durable(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SegmentBy;
    use crate::compression::ColumnarCompressor;
    use std::io::Write;
    use tempfile::TempDir;

    fn open(dir: &Path) -> FileRowStore {
        FileRowStore::open(
            dir,
            SyncPolicy::Immediate,
            Arc::new(ColumnarCompressor::default()),
        )
        .unwrap()
    }

    fn tick(time: i64, price: f64) -> Row {
        Row::new(time, "ES").with_field("price", price)
    }

    #[test]
    fn test_rows_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = open(temp_dir.path());
            for t in 0..20 {
                assert!(store.append("trades", 1, tick(t, t as f64)).unwrap());
            }
            assert!(!store.append("trades", 1, tick(3, 0.0)).unwrap());
            store.append("news/items", 2, tick(5, 1.0)).unwrap();
        }

        let store = open(temp_dir.path());
        let rows = store.scan_chunk("trades", 1).unwrap().rows;
        assert_eq!(rows.len(), 20);
        assert_eq!(rows[3].fields.get_f64("price"), Some(3.0));
        assert_eq!(store.row_count("news/items", 2).unwrap(), 1);
        assert_eq!(store.chunk_ids("trades").unwrap(), vec![1]);

        // appends continue after the recovered frames
        store.append("trades", 1, tick(100, 1.0)).unwrap();
        drop(store);
        assert_eq!(open(temp_dir.path()).row_count("trades", 1).unwrap(), 21);
    }

    #[test]
    fn test_compressed_segment_reopens() {
        let temp_dir = TempDir::new().unwrap();
        let rows = {
            let store = open(temp_dir.path());
            for t in 0..50 {
                store.append("trades", 4, tick(t, t as f64)).unwrap();
            }
            let snapshot = store.scan_chunk("trades", 4).unwrap();
            let block = ColumnarCompressor::default()
                .compress(&snapshot.rows, &SegmentBy::Entity)
                .unwrap();
            store
                .store_compressed("trades", 4, block, snapshot.version)
                .unwrap();
            // late row after the swap
            store.append("trades", 4, tick(60, 6.0)).unwrap();
            store.scan_chunk("trades", 4).unwrap().rows
        };

        let store = open(temp_dir.path());
        assert_eq!(store.scan_chunk("trades", 4).unwrap().rows, rows);
        let stats = store.stats();
        assert_eq!(stats.compressed_rows, 50);
        assert_eq!(stats.raw_rows, 1);
        assert!(!store.append("trades", 4, tick(10, 0.0)).unwrap());
    }

    #[test]
    fn test_delete_removes_segment() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(temp_dir.path());
        store.append("trades", 1, tick(1, 1.0)).unwrap();
        store.append("trades", 2, tick(2, 1.0)).unwrap();
        store.delete_chunk_rows("trades", 1).unwrap();
        store.delete_chunk_rows("trades", 1).unwrap();

        assert!(!temp_dir.path().join("trades").join("1.seg").exists());
        assert!(matches!(
            store.append("trades", 1, tick(3, 1.0)),
            Err(ChunkError::ChunkNotFound(1))
        ));
        drop(store);

        let store = open(temp_dir.path());
        assert_eq!(store.chunk_ids("trades").unwrap(), vec![2]);
        assert_eq!(store.row_count("trades", 1).unwrap(), 0);
    }

    #[test]
    fn test_torn_segment_tail_dropped() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = open(temp_dir.path());
            store.append("trades", 1, tick(1, 1.0)).unwrap();
            store.append("trades", 1, tick(2, 2.0)).unwrap();
        }
        let path = temp_dir.path().join("trades").join("1.seg");
        let intact = fs::metadata(&path).unwrap().len();
        fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(&[1, 0, 0, 9])
            .unwrap();

        let store = open(temp_dir.path());
        assert_eq!(store.row_count("trades", 1).unwrap(), 2);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact);
        store.append("trades", 1, tick(3, 3.0)).unwrap();
        drop(store);
        assert_eq!(open(temp_dir.path()).row_count("trades", 1).unwrap(), 3);
    }

    #[test]
    fn test_unpersisted_append_rolled_back() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(temp_dir.path());
        store.append("trades", 1, tick(1, 1.0)).unwrap();

        // a directory where the segment file belongs makes the open fail
        fs::create_dir_all(temp_dir.path().join("trades").join("2.seg")).unwrap();
        assert!(store.append("trades", 2, tick(5, 1.0)).is_err());
        assert_eq!(store.row_count("trades", 2).unwrap(), 0);
        assert!(store.scan_chunk("trades", 2).unwrap().rows.is_empty());
    }
}
