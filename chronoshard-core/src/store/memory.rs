//! In-process row store
//!
//! Each chunk keeps its raw rows in a lock-free skip list keyed by row key,
//! plus an optional compressed block. Appends run concurrently; swapping
//! in a compressed block or deleting rows excludes appends to that chunk
//! only.

use super::{ChunkSnapshot, RowStore};
use crate::compression::{ColumnarCompressor, Compressor, EncodedBlock};
use crate::{ChunkError, ChunkId, Result, Row, RowKey};
use crossbeam_skiplist::{SkipMap, SkipSet};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

struct StoredRow {
    row: Row,
    /// Identifies the append that inserted this entry
    ticket: u64,
}

#[derive(Default)]
struct ChunkRows {
    raw: SkipMap<RowKey, StoredRow>,
    block: RwLock<Option<EncodedBlock>>,
    /// Keys already held by `block`
    sealed: SkipSet<RowKey>,
    version: AtomicU64,
    deleted: AtomicBool,
    /// Appends hold this shared; swaps and deletes hold it exclusively
    gate: RwLock<()>,
}

impl ChunkRows {
    fn row_count(&self) -> u64 {
        (self.raw.len() + self.sealed.len()) as u64
    }
}

#[derive(Default)]
struct CollectionRows {
    live: HashMap<ChunkId, Arc<ChunkRows>>,
    /// Chunks whose rows were deleted, at most `TOMBSTONE_LIMIT` of them
    deleted: HashSet<ChunkId>,
    /// Deletion order of `deleted`, oldest first
    deleted_order: VecDeque<ChunkId>,
}

impl CollectionRows {
    fn tombstone(&mut self, chunk: ChunkId) {
        if !self.deleted.insert(chunk) {
            return;
        }
        self.deleted_order.push_back(chunk);
        // a writer only races a drop for the duration of one append
        while self.deleted_order.len() > crate::config::TOMBSTONE_LIMIT {
            if let Some(oldest) = self.deleted_order.pop_front() {
                self.deleted.remove(&oldest);
            }
        }
    }
}

/// Memory store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStoreStats {
    pub chunks: usize,
    pub raw_rows: u64,
    pub compressed_rows: u64,
    pub encoded_bytes: u64,
    /// Deleted chunk ids still remembered
    pub tombstones: usize,
}

/// [`RowStore`] kept entirely in memory
pub struct MemoryRowStore {
    compressor: Arc<dyn Compressor>,
    collections: RwLock<HashMap<String, RwLock<CollectionRows>>>,
    next_ticket: AtomicU64,
}

impl MemoryRowStore {
    pub fn new() -> Self {
        Self::with_compressor(Arc::new(ColumnarCompressor::default()))
    }

    /// Store decoding compressed blocks with `compressor`
    pub fn with_compressor(compressor: Arc<dyn Compressor>) -> Self {
        Self {
            compressor,
            collections: RwLock::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
        }
    }

    pub fn stats(&self) -> MemoryStoreStats {
        let mut stats = MemoryStoreStats::default();
        for rows in self.collections.read().values() {
            let rows = rows.read();
            stats.tombstones += rows.deleted.len();
            for chunk in rows.live.values() {
                stats.chunks += 1;
                stats.raw_rows += chunk.raw.len() as u64;
                stats.compressed_rows += chunk.sealed.len() as u64;
                if let Some(block) = chunk.block.read().as_ref() {
                    stats.encoded_bytes += block.encoded_size() as u64;
                }
            }
        }
        stats
    }

    /// Ids of chunks holding rows in `collection`, ascending
    pub fn chunk_ids(&self, collection: &str) -> Vec<ChunkId> {
        let mut ids: Vec<ChunkId> = self
            .collections
            .read()
            .get(collection)
            .map(|rows| rows.read().live.keys().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Install a block restored from disk, sealing the keys it holds
    pub(crate) fn restore_block(
        &self,
        collection: &str,
        chunk: ChunkId,
        block: EncodedBlock,
    ) -> Result<()> {
        let rows = self.get_or_create(collection, chunk)?;
        let _gate = rows.gate.write();

        for row in self.compressor.decompress(&block)? {
            let key = row.key();
            rows.raw.remove(&key);
            rows.sealed.insert(key);
        }
        *rows.block.write() = Some(block);
        rows.version.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Take back a raw row whose append could not be persisted
    pub(crate) fn discard(&self, collection: &str, chunk: ChunkId, key: &RowKey) {
        if let Some(rows) = self.get(collection, chunk) {
            let _gate = rows.gate.read();
            if rows.raw.remove(key).is_some() {
                rows.version.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Existing chunk rows, `None` if never written or deleted
    fn get(&self, collection: &str, chunk: ChunkId) -> Option<Arc<ChunkRows>> {
        self.collections
            .read()
            .get(collection)
            .and_then(|rows| rows.read().live.get(&chunk).cloned())
    }

    fn get_or_create(&self, collection: &str, chunk: ChunkId) -> Result<Arc<ChunkRows>> {
        if let Some(rows) = self.get(collection, chunk) {
            return Ok(rows);
        }

        self.with_collection(collection, |rows| {
            if rows.deleted.contains(&chunk) {
                return Err(ChunkError::ChunkNotFound(chunk));
            }
            Ok(rows.live.entry(chunk).or_default().clone())
        })
    }

    /// Run `f` with exclusive access to a collection's chunk maps
    fn with_collection<R>(
        &self,
        collection: &str,
        f: impl FnOnce(&mut CollectionRows) -> R,
    ) -> R {
        if !self.collections.read().contains_key(collection) {
            self.collections
                .write()
                .entry(collection.to_string())
                .or_default();
        }
        let collections = self.collections.read();
        match collections.get(collection) {
            Some(rows) => f(&mut rows.write()),
            // collections are never removed
            None => f(&mut CollectionRows::default()),
        }
    }
}

impl Default for MemoryRowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RowStore for MemoryRowStore {
    fn append(&self, collection: &str, chunk: ChunkId, row: Row) -> Result<bool> {
        let rows = self.get_or_create(collection, chunk)?;
        let _gate = rows.gate.read();
        if rows.deleted.load(Ordering::SeqCst) {
            return Err(ChunkError::ChunkNotFound(chunk));
        }

        let key = row.key();
        if rows.sealed.contains(&key) {
            return Ok(false);
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let entry = rows.raw.get_or_insert(key, StoredRow { row, ticket });
        if entry.value().ticket != ticket {
            return Ok(false);
        }
        rows.version.fetch_add(1, Ordering::SeqCst);

        Ok(true)
    }

    fn scan_chunk(&self, collection: &str, chunk: ChunkId) -> Result<ChunkSnapshot> {
        let Some(rows) = self.get(collection, chunk) else {
            return Ok(ChunkSnapshot::default());
        };

        // version first: a racing append either shows up in the rows or
        // makes a later swap against this version fail
        let version = rows.version.load(Ordering::SeqCst);
        let mut out = match rows.block.read().as_ref() {
            Some(block) => self.compressor.decompress(block)?,
            None => Vec::new(),
        };
        out.extend(rows.raw.iter().map(|entry| entry.value().row.clone()));
        out.sort_by(|a, b| a.key().cmp(&b.key()));

        Ok(ChunkSnapshot { rows: out, version })
    }

    fn store_compressed(
        &self,
        collection: &str,
        chunk: ChunkId,
        block: EncodedBlock,
        expected_version: u64,
    ) -> Result<()> {
        let rows = self
            .get(collection, chunk)
            .ok_or(ChunkError::ChunkNotFound(chunk))?;
        let _gate = rows.gate.write();

        let actual = rows.version.load(Ordering::SeqCst);
        if actual != expected_version {
            return Err(ChunkError::VersionConflict {
                chunk,
                expected: expected_version,
                actual,
            });
        }

        for entry in rows.raw.iter() {
            rows.sealed.insert(entry.key().clone());
        }
        debug!(
            "Swapped {} rows of chunk {} for a {} byte block",
            block.row_count,
            chunk,
            block.encoded_size()
        );
        *rows.block.write() = Some(block);
        rows.raw.clear();
        rows.version.fetch_add(1, Ordering::SeqCst);

        Ok(())
    }

    fn delete_chunk_rows(&self, collection: &str, chunk: ChunkId) -> Result<()> {
        // the tombstone also stops a writer that resolved this chunk before
        // it held any rows
        let removed = self.with_collection(collection, |rows| {
            rows.tombstone(chunk);
            rows.live.remove(&chunk)
        });

        if let Some(rows) = removed {
            // wait for in-flight appends
            let _gate = rows.gate.write();
            rows.deleted.store(true, Ordering::SeqCst);
            rows.raw.clear();
            rows.sealed.clear();
            *rows.block.write() = None;
        }

        Ok(())
    }

    fn row_count(&self, collection: &str, chunk: ChunkId) -> Result<u64> {
        Ok(self
            .get(collection, chunk)
            .map_or(0, |rows| rows.row_count()))
    }

    fn chunk_ids(&self, collection: &str) -> Result<Vec<ChunkId>> {
        Ok(MemoryRowStore::chunk_ids(self, collection))
    }
}
