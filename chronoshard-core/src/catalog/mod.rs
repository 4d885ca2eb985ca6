//! Chunk catalog
//!
//! Single source of truth for the physical layout of every collection:
//! which chunks exist, the time range each one covers, and its storage
//! state. Nothing writes rows without first resolving a chunk here.
//!
//! With a data directory, mutations are appended to the catalog log before
//! they are applied in memory, and [`ChunkCatalog::open`] replays the log.

mod chunk;

pub use chunk::{Chunk, ChunkState, CollectionMeta, SegmentBy};
pub(crate) use chunk::validate_thresholds;

#[cfg(test)]
use crate::wal::RecordKind;
use crate::wal::{CatalogRecord, SyncPolicy, WalConfig, WalReader, WalWriter};
use crate::{format_duration, ChunkError, ChunkId, Nanos, Result, TimeRange, Timestamp};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Catalog configuration
#[derive(Debug, Clone, Default)]
pub struct CatalogConfig {
    /// Directory holding the catalog log, `None` for a purely in-memory catalog
    pub dir: Option<PathBuf>,
    /// Sync policy of the catalog log
    pub sync_policy: SyncPolicy,
}

impl CatalogConfig {
    pub fn durable(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            sync_policy: SyncPolicy::Immediate,
        }
    }
}

struct ChunkSlot {
    chunk: Chunk,
    rows: AtomicU64,
    /// A drop was logged but has not completed
    drop_pending: bool,
}

impl ChunkSlot {
    fn new(chunk: Chunk) -> Self {
        let rows = AtomicU64::new(chunk.row_count);
        Self {
            chunk,
            rows,
            drop_pending: false,
        }
    }

    fn snapshot(&self) -> Chunk {
        let mut chunk = self.chunk.clone();
        chunk.row_count = self.rows.load(Ordering::Relaxed);
        chunk
    }
}

struct CollectionEntry {
    meta: RwLock<CollectionMeta>,
    /// Chunks keyed by start
    chunks: RwLock<BTreeMap<Timestamp, ChunkSlot>>,
    /// Serializes open/close decisions for this collection
    transition: Mutex<()>,
}

impl CollectionEntry {
    fn new(meta: CollectionMeta) -> Self {
        Self {
            meta: RwLock::new(meta),
            chunks: RwLock::new(BTreeMap::new()),
            transition: Mutex::new(()),
        }
    }
}

/// Catalog statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatalogStats {
    pub collections: usize,
    pub open_chunks: usize,
    pub closed_chunks: usize,
    pub compressed_chunks: usize,
    pub estimated_rows: u64,
}

/// Chunk catalog service
pub struct ChunkCatalog {
    collections: RwLock<HashMap<String, Arc<CollectionEntry>>>,
    /// chunk id -> (collection, start)
    chunk_index: RwLock<HashMap<ChunkId, (String, Timestamp)>>,
    next_chunk_id: AtomicU64,
    wal: Option<WalWriter>,
    /// Mutations hold this shared; checkpoint holds it exclusively
    checkpoint_gate: RwLock<()>,
    /// Next log append of this kind fails
    #[cfg(test)]
    fail_next: Mutex<Option<RecordKind>>,
}

impl ChunkCatalog {
    /// Catalog without durable state
    pub fn in_memory() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            chunk_index: RwLock::new(HashMap::new()),
            next_chunk_id: AtomicU64::new(1),
            wal: None,
            checkpoint_gate: RwLock::new(()),
            #[cfg(test)]
            fail_next: Mutex::new(None),
        }
    }

    /// Open a catalog, replaying its log when a directory is configured
    pub fn open(config: CatalogConfig) -> Result<Self> {
        let Some(dir) = config.dir else {
            return Ok(Self::in_memory());
        };

        let wal_config = WalConfig {
            path: dir.join(crate::config::CATALOG_LOG_FILE),
            sync_policy: config.sync_policy,
        };
        let replay = WalReader::<CatalogRecord>::new(wal_config.clone()).replay()?;
        if replay.truncated {
            warn!(
                "Catalog log {:?} had a torn tail; keeping the first {} bytes",
                wal_config.path, replay.valid_len
            );
        }

        let mut catalog = Self::in_memory();
        for record in replay.records {
            catalog.apply_replayed(record)?;
        }
        catalog.wal = Some(WalWriter::open(wal_config, replay.valid_len)?);

        let stats = catalog.stats();
        info!(
            "Opened catalog at {:?}: {} collections, {} chunks",
            dir,
            stats.collections,
            stats.open_chunks + stats.closed_chunks + stats.compressed_chunks
        );

        Ok(catalog)
    }

    /// Whether mutations are persisted
    pub fn is_durable(&self) -> bool {
        self.wal.is_some()
    }

    // ------------------------------------------------------------------
    // Collections
    // ------------------------------------------------------------------

    /// Register a new collection
    pub fn register_collection(&self, meta: CollectionMeta) -> Result<()> {
        meta.validate()?;
        let _gate = self.checkpoint_gate.read();
        let mut collections = self.collections.write();

        if collections.contains_key(&meta.name) {
            return Err(ChunkError::CollectionExists(meta.name));
        }
        if matches!(meta.retain_for, Some(retain) if retain < meta.compress_after) {
            warn!(
                "Collection {} retains chunks for less than its compression threshold; \
                 expired chunks will be dropped without compression",
                meta.name
            );
        }

        self.log(&CatalogRecord::RegisterCollection(meta.clone()))?;
        info!("Registered collection: {}", meta.name);
        collections.insert(meta.name.clone(), Arc::new(CollectionEntry::new(meta)));

        Ok(())
    }

    /// Tune compression and retention thresholds
    pub fn update_thresholds(
        &self,
        collection: &str,
        compress_after: Nanos,
        retain_for: Option<Nanos>,
    ) -> Result<CollectionMeta> {
        validate_thresholds(collection, compress_after, retain_for)?;
        let _gate = self.checkpoint_gate.read();
        let entry = self.entry(collection)?;
        let mut meta = entry.meta.write();

        self.log(&CatalogRecord::UpdateThresholds {
            collection: collection.to_string(),
            compress_after,
            retain_for,
        })?;
        meta.compress_after = compress_after;
        meta.retain_for = retain_for;
        info!(
            "Updated thresholds of {}: compress after {}, retain for {}",
            collection,
            format_duration(compress_after),
            retain_for.map_or_else(|| "ever".to_string(), format_duration)
        );

        Ok(meta.clone())
    }

    /// Get a collection definition
    pub fn collection(&self, name: &str) -> Result<CollectionMeta> {
        Ok(self.entry(name)?.meta.read().clone())
    }

    /// All collection definitions, ordered by name
    pub fn collections(&self) -> Vec<CollectionMeta> {
        let mut metas: Vec<_> = self
            .collections
            .read()
            .values()
            .map(|e| e.meta.read().clone())
            .collect();
        metas.sort_by(|a, b| a.name.cmp(&b.name));
        metas
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    /// Chunk whose range contains `ts`, if any
    pub fn lookup_chunk(&self, collection: &str, ts: Timestamp) -> Result<Option<Chunk>> {
        let entry = self.entry(collection)?;
        let width = entry.meta.read().chunk_width;
        let chunks = entry.chunks.read();

        Ok(chunks
            .range(..=ts)
            .next_back()
            .map(|(_, slot)| slot)
            .filter(|slot| slot.chunk.nominal_range(width).contains(ts))
            .map(ChunkSlot::snapshot))
    }

    /// Chunks overlapping `range`, ordered by start
    pub fn list_chunks(&self, collection: &str, range: TimeRange) -> Result<Vec<Chunk>> {
        let entry = self.entry(collection)?;
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let chunks = entry.chunks.read();

        // Ranges are disjoint, so only the last chunk starting before
        // `range.start` can reach into the range.
        let straddling = chunks
            .range(..range.start)
            .next_back()
            .map(|(_, slot)| slot)
            .filter(|slot| slot.chunk.claimed_range().overlaps(&range));

        Ok(straddling
            .into_iter()
            .chain(chunks.range(range.start..range.end).map(|(_, slot)| slot))
            .map(ChunkSlot::snapshot)
            .collect())
    }

    /// The open chunk of a collection, if any
    pub fn current_open(&self, collection: &str) -> Result<Option<Chunk>> {
        let entry = self.entry(collection)?;
        let chunks = entry.chunks.read();
        Ok(chunks
            .values()
            .next_back()
            .filter(|slot| slot.chunk.is_open())
            .map(ChunkSlot::snapshot))
    }

    /// Closest chunks starting at or before `ts` and strictly after it
    pub fn neighbors(
        &self,
        collection: &str,
        ts: Timestamp,
    ) -> Result<(Option<Chunk>, Option<Chunk>)> {
        let entry = self.entry(collection)?;
        let chunks = entry.chunks.read();
        let prev = chunks.range(..=ts).next_back().map(|(_, s)| s.snapshot());
        let next = chunks
            .range((Bound::Excluded(ts), Bound::Unbounded))
            .next()
            .map(|(_, s)| s.snapshot());
        Ok((prev, next))
    }

    /// Get a chunk by id
    pub fn chunk(&self, id: ChunkId) -> Result<Chunk> {
        let (collection, start) = self.locate(id)?;
        let entry = self.entry(&collection)?;
        let chunks = entry.chunks.read();
        chunks
            .get(&start)
            .filter(|slot| slot.chunk.id == id)
            .map(ChunkSlot::snapshot)
            .ok_or(ChunkError::ChunkNotFound(id))
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Open a new chunk at the latest-time end of a collection.
    ///
    /// Compare-and-create: fails with `DuplicateRange` unless every existing
    /// chunk is closed and ends at or before `start`.
    pub fn open_chunk(&self, collection: &str, start: Timestamp) -> Result<Chunk> {
        let _gate = self.checkpoint_gate.read();
        let entry = self.entry(collection)?;
        let width = entry.meta.read().chunk_width;
        let mut chunks = entry.chunks.write();

        if let Some(last) = chunks.values().next_back() {
            if last.chunk.claimed_range().end > start {
                return Err(ChunkError::DuplicateRange {
                    collection: collection.to_string(),
                    start,
                    end: start.saturating_add(width),
                    existing: last.chunk.id,
                });
            }
        }

        let chunk = Chunk {
            id: self.next_chunk_id.fetch_add(1, Ordering::SeqCst),
            collection: collection.to_string(),
            start,
            end: None,
            state: ChunkState::Open,
            row_count: 0,
        };
        self.insert_slot(&mut chunks, chunk.clone())?;
        info!("Opened {}", chunk);

        Ok(chunk)
    }

    /// Create a bounded, closed chunk `[start, end)` for late writes
    pub fn insert_gap_chunk(
        &self,
        collection: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Chunk> {
        if end <= start {
            return Err(ChunkError::InvalidState(format!(
                "Gap chunk [{}, {}) in {} is empty",
                start, end, collection
            )));
        }
        let _gate = self.checkpoint_gate.read();
        let entry = self.entry(collection)?;
        let mut chunks = entry.chunks.write();
        let range = TimeRange::new(start, end);

        if let Some(prev) = chunks.range(..end).next_back().map(|(_, s)| s) {
            if prev.chunk.claimed_range().overlaps(&range) {
                return Err(ChunkError::DuplicateRange {
                    collection: collection.to_string(),
                    start,
                    end,
                    existing: prev.chunk.id,
                });
            }
        }

        let chunk = Chunk {
            id: self.next_chunk_id.fetch_add(1, Ordering::SeqCst),
            collection: collection.to_string(),
            start,
            end: Some(end),
            state: ChunkState::ClosedUncompressed,
            row_count: 0,
        };
        self.insert_slot(&mut chunks, chunk.clone())?;
        info!("Created gap {}", chunk);

        Ok(chunk)
    }

    /// Set the end bound of an open chunk: OPEN -> CLOSED_UNCOMPRESSED
    pub fn close_chunk(&self, id: ChunkId, end: Timestamp) -> Result<Chunk> {
        let _gate = self.checkpoint_gate.read();
        let (collection, start) = self.locate(id)?;
        let entry = self.entry(&collection)?;
        let mut chunks = entry.chunks.write();
        let slot = Self::slot_mut(&mut chunks, id, start)?;

        if slot.chunk.state != ChunkState::Open {
            return Err(ChunkError::InvalidState(format!(
                "Cannot close chunk {} in state {}",
                id, slot.chunk.state
            )));
        }
        if end <= slot.chunk.start {
            return Err(ChunkError::InvalidState(format!(
                "Chunk {} cannot end at {} before its start {}",
                id, end, slot.chunk.start
            )));
        }

        let row_count = slot.rows.load(Ordering::Relaxed);
        self.log(&CatalogRecord::CloseChunk { id, end, row_count })?;
        slot.chunk.end = Some(end);
        slot.chunk.state = ChunkState::ClosedUncompressed;
        info!("Closed {}", slot.chunk);

        Ok(slot.snapshot())
    }

    /// CLOSED_UNCOMPRESSED -> COMPRESSED.
    ///
    /// Returns `false` when the chunk is already compressed.
    pub fn mark_compressed(&self, id: ChunkId) -> Result<bool> {
        let _gate = self.checkpoint_gate.read();
        let (collection, start) = self.locate(id)?;
        let entry = self.entry(&collection)?;
        let mut chunks = entry.chunks.write();
        let slot = Self::slot_mut(&mut chunks, id, start)?;

        match slot.chunk.state {
            ChunkState::Compressed => Ok(false),
            ChunkState::Open => Err(ChunkError::InvalidState(format!(
                "Cannot compress open chunk {}",
                id
            ))),
            ChunkState::ClosedUncompressed => {
                let row_count = slot.rows.load(Ordering::Relaxed);
                self.log(&CatalogRecord::MarkCompressed { id, row_count })?;
                slot.chunk.state = ChunkState::Compressed;
                debug!("Marked chunk {} compressed", id);
                Ok(true)
            }
        }
    }

    /// Log the intent to drop a chunk before any of its rows are deleted.
    ///
    /// The chunk keeps its metadata until [`drop_chunk`](Self::drop_chunk);
    /// [`pending_drops`](Self::pending_drops) lists it until then, including
    /// after a restart. Repeating the call logs nothing.
    pub fn begin_drop(&self, id: ChunkId) -> Result<Chunk> {
        let _gate = self.checkpoint_gate.read();
        let (collection, start) = self.locate(id)?;
        let entry = self.entry(&collection)?;
        let mut chunks = entry.chunks.write();
        let slot = Self::slot_mut(&mut chunks, id, start)?;

        if !slot.drop_pending {
            self.log(&CatalogRecord::DropIntent { id })?;
            slot.drop_pending = true;
            debug!("Drop of chunk {} pending", id);
        }
        Ok(slot.snapshot())
    }

    /// Chunks of a collection with a drop started but not completed
    pub fn pending_drops(&self, collection: &str) -> Result<Vec<Chunk>> {
        let entry = self.entry(collection)?;
        let chunks = entry.chunks.read();
        Ok(chunks
            .values()
            .filter(|slot| slot.drop_pending)
            .map(ChunkSlot::snapshot)
            .collect())
    }

    /// Remove a chunk's metadata, whatever its state
    pub fn drop_chunk(&self, id: ChunkId) -> Result<Chunk> {
        let _gate = self.checkpoint_gate.read();
        let (collection, start) = self.locate(id)?;
        let entry = self.entry(&collection)?;
        let mut chunks = entry.chunks.write();
        Self::slot_mut(&mut chunks, id, start)?;

        self.log(&CatalogRecord::DropChunk { id })?;
        let slot = chunks.remove(&start).ok_or(ChunkError::ChunkNotFound(id))?;
        self.chunk_index.write().remove(&id);
        info!("Dropped {}", slot.chunk);

        Ok(slot.snapshot())
    }

    /// Add to a chunk's row-count estimate
    pub fn record_rows(&self, id: ChunkId, rows: u64) -> Result<()> {
        let (collection, start) = self.locate(id)?;
        let entry = self.entry(&collection)?;
        let chunks = entry.chunks.read();
        let slot = chunks
            .get(&start)
            .filter(|slot| slot.chunk.id == id)
            .ok_or(ChunkError::ChunkNotFound(id))?;
        slot.rows.fetch_add(rows, Ordering::Relaxed);
        Ok(())
    }

    /// Replace a chunk's row-count estimate with an exact count
    pub fn set_row_count(&self, id: ChunkId, rows: u64) -> Result<()> {
        let (collection, start) = self.locate(id)?;
        let entry = self.entry(&collection)?;
        let chunks = entry.chunks.read();
        let slot = chunks
            .get(&start)
            .filter(|slot| slot.chunk.id == id)
            .ok_or(ChunkError::ChunkNotFound(id))?;
        slot.rows.store(rows, Ordering::Relaxed);
        Ok(())
    }

    /// Run `f` while holding the collection's open/close mutex
    pub fn with_transition_lock<R>(
        &self,
        collection: &str,
        f: impl FnOnce() -> Result<R>,
    ) -> Result<R> {
        let entry = self.entry(collection)?;
        let _guard = entry.transition.lock();
        f()
    }

    /// Rewrite the catalog log as a compact snapshot of the current state.
    /// Returns the new log size in bytes, or 0 for an in-memory catalog.
    pub fn checkpoint(&self) -> Result<u64> {
        let Some(wal) = &self.wal else {
            return Ok(0);
        };
        let _gate = self.checkpoint_gate.write();

        let mut records = vec![CatalogRecord::IdWatermark(
            self.next_chunk_id.load(Ordering::SeqCst),
        )];
        let collections = self.collections.read();
        let mut names: Vec<_> = collections.keys().cloned().collect();
        names.sort();
        for name in names {
            let entry = &collections[&name];
            records.push(CatalogRecord::RegisterCollection(entry.meta.read().clone()));
            for slot in entry.chunks.read().values() {
                records.push(CatalogRecord::CreateChunk(slot.snapshot()));
                if slot.drop_pending {
                    records.push(CatalogRecord::DropIntent { id: slot.chunk.id });
                }
            }
        }

        let written = wal.rewrite(&records)?;
        info!(
            "Checkpointed catalog: {} records, {} bytes",
            records.len(),
            written
        );
        Ok(written)
    }

    /// Count chunks by state
    pub fn stats(&self) -> CatalogStats {
        let collections = self.collections.read();
        let mut stats = CatalogStats {
            collections: collections.len(),
            ..Default::default()
        };
        for entry in collections.values() {
            for slot in entry.chunks.read().values() {
                match slot.chunk.state {
                    ChunkState::Open => stats.open_chunks += 1,
                    ChunkState::ClosedUncompressed => stats.closed_chunks += 1,
                    ChunkState::Compressed => stats.compressed_chunks += 1,
                }
                stats.estimated_rows += slot.rows.load(Ordering::Relaxed);
            }
        }
        stats
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn entry(&self, collection: &str) -> Result<Arc<CollectionEntry>> {
        self.collections
            .read()
            .get(collection)
            .cloned()
            .ok_or_else(|| ChunkError::CollectionNotFound(collection.to_string()))
    }

    fn locate(&self, id: ChunkId) -> Result<(String, Timestamp)> {
        self.chunk_index
            .read()
            .get(&id)
            .cloned()
            .ok_or(ChunkError::ChunkNotFound(id))
    }

    fn slot_mut(
        chunks: &mut BTreeMap<Timestamp, ChunkSlot>,
        id: ChunkId,
        start: Timestamp,
    ) -> Result<&mut ChunkSlot> {
        chunks
            .get_mut(&start)
            .filter(|slot| slot.chunk.id == id)
            .ok_or(ChunkError::ChunkNotFound(id))
    }

    fn insert_slot(
        &self,
        chunks: &mut BTreeMap<Timestamp, ChunkSlot>,
        chunk: Chunk,
    ) -> Result<()> {
        self.log(&CatalogRecord::CreateChunk(chunk.clone()))?;
        self.chunk_index
            .write()
            .insert(chunk.id, (chunk.collection.clone(), chunk.start));
        chunks.insert(chunk.start, ChunkSlot::new(chunk));
        Ok(())
    }

    fn log(&self, record: &CatalogRecord) -> Result<()> {
        #[cfg(test)]
        {
            let mut fail = self.fail_next.lock();
            if *fail == Some(record.kind()) {
                *fail = None;
                return Err(ChunkError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "catalog log unavailable",
                )));
            }
        }
        if let Some(wal) = &self.wal {
            wal.append(record)?;
        }
        Ok(())
    }

    fn apply_replayed(&mut self, record: CatalogRecord) -> Result<()> {
        match record {
            CatalogRecord::RegisterCollection(meta) => {
                self.collections
                    .get_mut()
                    .insert(meta.name.clone(), Arc::new(CollectionEntry::new(meta)));
            }
            CatalogRecord::UpdateThresholds {
                collection,
                compress_after,
                retain_for,
            } => {
                let entry = self.collections.get_mut().get(&collection).ok_or_else(|| {
                    ChunkError::Corruption(format!("Thresholds for unknown collection {}", collection))
                })?;
                let mut meta = entry.meta.write();
                meta.compress_after = compress_after;
                meta.retain_for = retain_for;
            }
            CatalogRecord::CreateChunk(chunk) => {
                let entry = self.collections.get_mut().get(&chunk.collection).ok_or_else(|| {
                    ChunkError::Corruption(format!(
                        "Chunk {} for unknown collection {}",
                        chunk.id, chunk.collection
                    ))
                })?;
                self.next_chunk_id.fetch_max(chunk.id + 1, Ordering::SeqCst);
                self.chunk_index
                    .get_mut()
                    .insert(chunk.id, (chunk.collection.clone(), chunk.start));
                entry.chunks.write().insert(chunk.start, ChunkSlot::new(chunk));
            }
            CatalogRecord::CloseChunk { id, end, row_count } => {
                self.replay_slot(id, |slot| {
                    slot.chunk.end = Some(end);
                    slot.chunk.state = ChunkState::ClosedUncompressed;
                    slot.rows.store(row_count, Ordering::Relaxed);
                })?;
            }
            CatalogRecord::MarkCompressed { id, row_count } => {
                self.replay_slot(id, |slot| {
                    slot.chunk.state = ChunkState::Compressed;
                    slot.rows.store(row_count, Ordering::Relaxed);
                })?;
            }
            CatalogRecord::DropChunk { id } => {
                let (collection, start) = self
                    .chunk_index
                    .get_mut()
                    .remove(&id)
                    .ok_or_else(|| ChunkError::Corruption(format!("Drop of unknown chunk {}", id)))?;
                if let Some(entry) = self.collections.get_mut().get(&collection) {
                    entry.chunks.write().remove(&start);
                }
            }
            CatalogRecord::DropIntent { id } => {
                self.replay_slot(id, |slot| slot.drop_pending = true)?;
            }
            CatalogRecord::IdWatermark(next) => {
                self.next_chunk_id.fetch_max(next, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    /// Make the next log append of `kind` fail with an IO error
    #[cfg(test)]
    pub(crate) fn fail_next_append(&self, kind: RecordKind) {
        *self.fail_next.lock() = Some(kind);
    }

    fn replay_slot(&mut self, id: ChunkId, f: impl FnOnce(&mut ChunkSlot)) -> Result<()> {
        let (collection, start) = self
            .chunk_index
            .get_mut()
            .get(&id)
            .cloned()
            .ok_or_else(|| ChunkError::Corruption(format!("Record for unknown chunk {}", id)))?;
        let entry = self
            .collections
            .get_mut()
            .get(&collection)
            .ok_or_else(|| ChunkError::Corruption(format!("Chunk {} lost its collection", id)))?;
        let mut chunks = entry.chunks.write();
        let slot = Self::slot_mut(&mut chunks, id, start)
            .map_err(|_| ChunkError::Corruption(format!("Record for unknown chunk {}", id)))?;
        f(slot);
        Ok(())
    }
}
