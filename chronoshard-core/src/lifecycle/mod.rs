//! Background compression and retention
//!
//! Each tick walks the catalog collection by collection. An open chunk whose
//! nominal end has aged past either threshold is closed first, so idle
//! collections age like busy ones. Closed chunks past the retention
//! threshold are then dropped: the drop intent is logged, rows are deleted,
//! then metadata. Closed chunks past the compression threshold are
//! compressed. Every step is idempotent, so a failed chunk is simply retried
//! on the next tick.

mod report;

pub use report::{ChunkAction, ChunkFailure, CollectionReport, TickReport};

use crate::catalog::{Chunk, ChunkCatalog, ChunkState, CollectionMeta};
use crate::clock::Clock;
use crate::compression::Compressor;
use crate::store::RowStore;
use crate::{format_duration, ChunkError, ChunkId, Result, TimeRange, Timestamp};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

/// Decide what a run should do with each chunk of a collection at `now`.
///
/// Retention wins over compression: an expired chunk is dropped without
/// being compressed first. An open chunk ages from its nominal end; when
/// that is past a threshold it is closed first, then handled like any
/// closed chunk.
pub fn plan(meta: &CollectionMeta, chunks: &[Chunk], now: Timestamp) -> Vec<(ChunkId, ChunkAction)> {
    let compress_before = now.saturating_sub(meta.compress_after);
    let drop_before = meta.retain_for.map(|age| now.saturating_sub(age));

    let mut actions = Vec::new();
    for chunk in chunks {
        let end = chunk
            .closed_end()
            .unwrap_or_else(|| chunk.start.saturating_add(meta.chunk_width));
        let action = if matches!(drop_before, Some(limit) if end <= limit) {
            ChunkAction::Drop
        } else if chunk.state != ChunkState::Compressed && end <= compress_before {
            ChunkAction::Compress
        } else {
            continue;
        };

        if chunk.is_open() {
            actions.push((chunk.id, ChunkAction::Close));
        }
        actions.push((chunk.id, action));
    }
    actions
}

/// Lifecycle scheduler
pub struct LifecycleScheduler {
    catalog: Arc<ChunkCatalog>,
    store: Arc<dyn RowStore>,
    compressor: Arc<dyn Compressor>,
    clock: Arc<dyn Clock>,
    /// One run per collection at a time
    running: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LifecycleScheduler {
    pub fn new(
        catalog: Arc<ChunkCatalog>,
        store: Arc<dyn RowStore>,
        compressor: Arc<dyn Compressor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            catalog,
            store,
            compressor,
            clock,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Run every collection once
    pub fn tick(&self) -> TickReport {
        self.tick_until_cancelled(&CancellationToken::new())
    }

    /// Run every collection once, stopping between collections when
    /// `token` is cancelled
    pub fn tick_until_cancelled(&self, token: &CancellationToken) -> TickReport {
        let mut report = TickReport::new(Uuid::new_v4(), self.clock.now());
        let span = info_span!("lifecycle_tick", tick = %report.tick_id);
        let _enter = span.enter();

        for meta in self.catalog.collections() {
            if token.is_cancelled() {
                info!("Lifecycle tick cancelled before {}", meta.name);
                report.cancelled = true;
                break;
            }
            match self.run_collection(&meta.name) {
                Ok(collection) => report.collections.push(collection),
                Err(e) => {
                    warn!("Lifecycle run of {} failed: {}", meta.name, e);
                    let mut collection = CollectionReport::new(&meta.name);
                    collection.error = Some(e.to_string());
                    report.collections.push(collection);
                }
            }
        }

        if report.compressed() + report.dropped() > 0 || !report.failures().is_empty() {
            info!(
                "Lifecycle tick finished: {} compressed, {} dropped, {} failed",
                report.compressed(),
                report.dropped(),
                report.failures().len()
            );
        }
        report
    }

    /// Apply compression and retention to one collection.
    ///
    /// Returns a report marked `skipped` if another run of the same
    /// collection is in progress.
    pub fn run_collection(&self, collection: &str) -> Result<CollectionReport> {
        let mut report = CollectionReport::new(collection);
        let lock = self.collection_lock(collection);
        let Some(_running) = lock.try_lock() else {
            debug!("Lifecycle run of {} already in progress, skipping", collection);
            report.skipped = true;
            return Ok(report);
        };

        let meta = self.catalog.collection(collection)?;
        let now = self.clock.now();

        let chunks = self.catalog.list_chunks(collection, TimeRange::all())?;
        let mut actions = plan(&meta, &chunks, now);
        // interrupted drops finish whatever the thresholds say now
        for pending in self.catalog.pending_drops(collection)? {
            match actions.iter_mut().find(|(id, _)| *id == pending.id) {
                Some(entry) => entry.1 = ChunkAction::Drop,
                None => actions.push((pending.id, ChunkAction::Drop)),
            }
        }

        let mut still_open = None;
        for (id, action) in actions {
            if still_open == Some(id) {
                continue;
            }
            let outcome = match action {
                ChunkAction::Close => self.close_idle(&meta, id),
                ChunkAction::Compress => self.compress(&meta, id),
                ChunkAction::Drop => self.drop_expired(collection, id),
            };
            match outcome {
                Ok(true) => match action {
                    ChunkAction::Compress => report.compressed.push(id),
                    ChunkAction::Drop => report.dropped.push(id),
                    ChunkAction::Close => report.closed.push(id),
                },
                Ok(false) => {}
                Err(e) => {
                    if action == ChunkAction::Close {
                        still_open = Some(id);
                    }
                    warn!("Failed to {} chunk {} of {}: {}", action, id, collection, e);
                    report.failures.push(ChunkFailure {
                        chunk: id,
                        action,
                        retryable: e.is_retryable(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    /// Compress a closed chunk now, regardless of its age.
    ///
    /// Returns `false` if the chunk is already compressed.
    pub fn compress_chunk(&self, id: ChunkId) -> Result<bool> {
        let chunk = self.catalog.chunk(id)?;
        let meta = self.catalog.collection(&chunk.collection)?;
        self.compress(&meta, id)
    }

    /// Drop a closed chunk now, regardless of its age.
    ///
    /// Returns `false` if the chunk no longer exists.
    pub fn drop_chunk(&self, id: ChunkId) -> Result<bool> {
        match self.catalog.chunk(id) {
            Ok(chunk) => self.drop_expired(&chunk.collection, id),
            Err(ChunkError::ChunkNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Run ticks every `interval` until `token` is cancelled
    pub fn spawn(self: Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!("Lifecycle scheduler running every {:?}", interval);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let scheduler = self.clone();
                        let tick_token = token.clone();
                        let handle = tokio::task::spawn_blocking(move || {
                            scheduler.tick_until_cancelled(&tick_token)
                        });
                        match handle.await {
                            Ok(report) => debug!(
                                "Tick {} done: {} compressed, {} dropped",
                                report.tick_id,
                                report.compressed(),
                                report.dropped()
                            ),
                            Err(e) => warn!("Lifecycle tick aborted: {}", e),
                        }
                    }
                }
            }

            info!("Lifecycle scheduler stopped");
        })
    }

    /// Close an idle open chunk at its nominal end. Returns `false` if a
    /// write already rolled it over. A later write opens a fresh chunk.
    fn close_idle(&self, meta: &CollectionMeta, id: ChunkId) -> Result<bool> {
        self.catalog.with_transition_lock(&meta.name, || {
            let chunk = self.catalog.chunk(id)?;
            if !chunk.is_open() {
                return Ok(false);
            }

            let end = chunk.start.saturating_add(meta.chunk_width);
            let closed = self.catalog.close_chunk(id, end)?;
            info!(
                "Closed idle chunk {} of {} at {} ({} rows)",
                id, meta.name, end, closed.row_count
            );
            Ok(true)
        })
    }

    fn compress(&self, meta: &CollectionMeta, id: ChunkId) -> Result<bool> {
        let chunk = self.catalog.chunk(id)?;
        match chunk.state {
            ChunkState::Compressed => return Ok(false),
            ChunkState::Open => {
                return Err(ChunkError::InvalidState(format!(
                    "Cannot compress open chunk {}",
                    id
                )))
            }
            ChunkState::ClosedUncompressed => {}
        }

        let snapshot = self.store.scan_chunk(&meta.name, id)?;
        let block = self.compressor.compress(&snapshot.rows, &meta.segment_by)?;
        let ratio = block.compression_ratio();
        let (rows, bytes) = (block.row_count, block.encoded_size());

        self.store
            .store_compressed(&meta.name, id, block, snapshot.version)?;
        let marked = self.catalog.mark_compressed(id)?;

        if marked {
            info!(
                "Compressed chunk {} of {}: {} rows into {} bytes ({:.1}x)",
                id, meta.name, rows, bytes, ratio
            );
        }
        Ok(marked)
    }

    fn drop_expired(&self, collection: &str, id: ChunkId) -> Result<bool> {
        let chunk = match self.catalog.chunk(id) {
            Ok(chunk) => chunk,
            Err(ChunkError::ChunkNotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if chunk.is_open() {
            return Err(ChunkError::InvalidState(format!(
                "Cannot drop open chunk {}",
                id
            )));
        }

        // the logged intent finishes the drop after a crash or a failed
        // metadata removal; if logging fails nothing has changed
        self.catalog.begin_drop(id)?;
        self.store.delete_chunk_rows(collection, id)?;
        match self.catalog.drop_chunk(id) {
            Ok(dropped) => {
                let age = self.clock.now().saturating_sub(dropped.end.unwrap_or(dropped.start));
                info!(
                    "Dropped chunk {} of {} ({} rows, {} old)",
                    id,
                    collection,
                    dropped.row_count,
                    format_duration(age)
                );
                Ok(true)
            }
            Err(ChunkError::ChunkNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn collection_lock(&self, collection: &str) -> Arc<Mutex<()>> {
        self.running
            .lock()
            .entry(collection.to_string())
            .or_default()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::compression::{ColumnarCompressor, EncodedBlock};
    use crate::config::{DAY, HOUR};
    use crate::router::PartitionRouter;
    use crate::store::{ChunkSnapshot, MemoryRowStore};
    use crate::wal::RecordKind;
    use crate::Row;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Row store that can be told to fail swaps or deletes
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryRowStore,
        fail_swap: AtomicBool,
        fail_delete: AtomicBool,
    }

    impl RowStore for FlakyStore {
        fn append(&self, collection: &str, chunk: ChunkId, row: Row) -> Result<bool> {
            self.inner.append(collection, chunk, row)
        }

        fn scan_chunk(&self, collection: &str, chunk: ChunkId) -> Result<ChunkSnapshot> {
            self.inner.scan_chunk(collection, chunk)
        }

        fn store_compressed(
            &self,
            collection: &str,
            chunk: ChunkId,
            block: EncodedBlock,
            expected_version: u64,
        ) -> Result<()> {
            if self.fail_swap.load(Ordering::SeqCst) {
                return Err(ChunkError::StoreUnavailable("swap refused".into()));
            }
            self.inner
                .store_compressed(collection, chunk, block, expected_version)
        }

        fn delete_chunk_rows(&self, collection: &str, chunk: ChunkId) -> Result<()> {
            if self.fail_delete.load(Ordering::SeqCst) {
                return Err(ChunkError::StoreUnavailable("delete refused".into()));
            }
            self.inner.delete_chunk_rows(collection, chunk)
        }

        fn row_count(&self, collection: &str, chunk: ChunkId) -> Result<u64> {
            self.inner.row_count(collection, chunk)
        }

        fn chunk_ids(&self, collection: &str) -> Result<Vec<ChunkId>> {
            Ok(self.inner.chunk_ids(collection))
        }
    }

    struct Fixture {
        catalog: Arc<ChunkCatalog>,
        store: Arc<FlakyStore>,
        clock: Arc<ManualClock>,
        scheduler: LifecycleScheduler,
    }

    /// `days` daily chunks of "trades", one row each; the last one open
    fn fixture(days: i64, compress_after: i64, retain_for: Option<i64>) -> Fixture {
        let catalog = Arc::new(ChunkCatalog::in_memory());
        catalog
            .register_collection(
                CollectionMeta::new("trades")
                    .with_chunk_width(DAY)
                    .with_compress_after(compress_after)
                    .with_retain_for(retain_for),
            )
            .unwrap();
        let store = Arc::new(FlakyStore::default());
        let router = PartitionRouter::new(catalog.clone());
        for day in 0..days {
            let chunk = router.route_write("trades", day * DAY + HOUR).unwrap();
            store
                .append("trades", chunk.id, Row::new(day * DAY + HOUR, "ES"))
                .unwrap();
        }

        let clock = Arc::new(ManualClock::new(days * DAY));
        let scheduler = LifecycleScheduler::new(
            catalog.clone(),
            store.clone(),
            Arc::new(ColumnarCompressor::default()),
            clock.clone(),
        );
        Fixture {
            catalog,
            store,
            clock,
            scheduler,
        }
    }

    fn chunk_at(catalog: &ChunkCatalog, day: i64) -> Chunk {
        catalog.lookup_chunk("trades", day * DAY).unwrap().unwrap()
    }

    #[test]
    fn test_plan_prefers_retention() {
        let meta = CollectionMeta::new("trades")
            .with_compress_after(7 * DAY)
            .with_retain_for(Some(3 * DAY));
        let closed = |id, day| Chunk {
            id,
            collection: "trades".into(),
            start: day * DAY,
            end: Some((day + 1) * DAY),
            state: ChunkState::ClosedUncompressed,
            row_count: 0,
        };
        let chunks = vec![closed(1, 0), closed(2, 5), closed(3, 8)];
        let plan = plan(&meta, &chunks, 10 * DAY);
        assert_eq!(plan, vec![(1, ChunkAction::Drop), (2, ChunkAction::Drop)]);
    }

    #[test]
    fn test_compresses_old_chunks_only() {
        let f = fixture(10, 3 * DAY, None);
        let report = f.scheduler.run_collection("trades").unwrap();
        // chunk of day d ends at (d+1)*DAY; eligible when <= 7*DAY
        assert_eq!(report.compressed.len(), 7);
        assert!(report.dropped.is_empty());

        assert_eq!(chunk_at(&f.catalog, 6).state, ChunkState::Compressed);
        assert_eq!(chunk_at(&f.catalog, 7).state, ChunkState::ClosedUncompressed);
        assert!(chunk_at(&f.catalog, 9).is_open());

        // rows are still readable after compression
        let id = chunk_at(&f.catalog, 2).id;
        assert_eq!(f.store.scan_chunk("trades", id).unwrap().rows.len(), 1);
    }

    #[test]
    fn test_tick_is_idempotent() {
        let f = fixture(10, 3 * DAY, Some(8 * DAY));
        let first = f.scheduler.tick();
        assert_eq!(first.dropped(), 2);
        assert_eq!(first.compressed(), 5);

        let second = f.scheduler.tick();
        assert_eq!(second.compressed() + second.dropped(), 0);
        assert!(second.failures().is_empty());

        let id = chunk_at(&f.catalog, 3).id;
        assert!(!f.scheduler.compress_chunk(id).unwrap());
        assert!(!f.scheduler.drop_chunk(first.collections[0].dropped[0]).unwrap());
    }

    #[test]
    fn test_plan_closes_stale_open_chunk() {
        let meta = CollectionMeta::new("trades")
            .with_chunk_width(DAY)
            .with_compress_after(7 * DAY)
            .with_retain_for(Some(30 * DAY));
        let open = Chunk {
            id: 4,
            collection: "trades".into(),
            start: 2 * DAY,
            end: None,
            state: ChunkState::Open,
            row_count: 1,
        };
        let chunks = vec![open];

        assert!(plan(&meta, &chunks, 9 * DAY).is_empty());
        assert_eq!(
            plan(&meta, &chunks, 10 * DAY),
            vec![(4, ChunkAction::Close), (4, ChunkAction::Compress)]
        );
        assert_eq!(
            plan(&meta, &chunks, 40 * DAY),
            vec![(4, ChunkAction::Close), (4, ChunkAction::Drop)]
        );
    }

    #[test]
    fn test_idle_collection_expires_open_chunk() {
        let f = fixture(3, 30 * DAY, Some(3 * DAY));
        f.clock.set(100 * DAY);

        let report = f.scheduler.tick();
        assert_eq!(report.closed(), 1);
        assert_eq!(report.dropped(), 3);
        assert!(report.failures().is_empty());
        assert!(f
            .catalog
            .list_chunks("trades", TimeRange::all())
            .unwrap()
            .is_empty());
        assert_eq!(f.store.inner.stats().raw_rows, 0);

        // the next write starts a fresh chunk
        let chunk = PartitionRouter::new(f.catalog.clone())
            .route_write("trades", 100 * DAY + HOUR)
            .unwrap();
        assert!(chunk.is_open());
        assert_eq!(chunk.start, 100 * DAY);
    }

    #[test]
    fn test_idle_open_chunk_compressed() {
        let f = fixture(1, DAY, None);
        f.clock.set(3 * DAY);

        let report = f.scheduler.run_collection("trades").unwrap();
        let chunk = chunk_at(&f.catalog, 0);
        assert_eq!(report.closed, vec![chunk.id]);
        assert_eq!(report.compressed, vec![chunk.id]);
        assert_eq!(chunk.state, ChunkState::Compressed);
        assert_eq!(chunk.end, Some(DAY));
        assert_eq!(f.store.scan_chunk("trades", chunk.id).unwrap().rows.len(), 1);
    }

    #[test]
    fn test_explicit_actions_refuse_open_chunk() {
        let f = fixture(1, 0, Some(0));
        let id = chunk_at(&f.catalog, 0).id;
        assert!(matches!(
            f.scheduler.compress_chunk(id),
            Err(ChunkError::InvalidState(_))
        ));
        assert!(matches!(
            f.scheduler.drop_chunk(id),
            Err(ChunkError::InvalidState(_))
        ));
        assert!(f.catalog.pending_drops("trades").unwrap().is_empty());
    }

    #[test]
    fn test_failed_compression_keeps_state() {
        let f = fixture(5, DAY, None);
        f.store.fail_swap.store(true, Ordering::SeqCst);

        let report = f.scheduler.run_collection("trades").unwrap();
        assert!(report.compressed.is_empty());
        assert_eq!(report.failures.len(), 4);
        assert!(report.failures.iter().all(|failure| failure.retryable));
        assert_eq!(chunk_at(&f.catalog, 0).state, ChunkState::ClosedUncompressed);

        f.store.fail_swap.store(false, Ordering::SeqCst);
        assert_eq!(f.scheduler.run_collection("trades").unwrap().compressed.len(), 4);
    }

    #[test]
    fn test_failed_drop_keeps_metadata_and_rows() {
        let f = fixture(5, 30 * DAY, Some(2 * DAY));
        f.store.fail_delete.store(true, Ordering::SeqCst);

        let report = f.scheduler.run_collection("trades").unwrap();
        assert!(report.dropped.is_empty());
        assert_eq!(report.failures.len(), 3);

        let chunk = chunk_at(&f.catalog, 0);
        assert_eq!(f.store.row_count("trades", chunk.id).unwrap(), 1);

        f.store.fail_delete.store(false, Ordering::SeqCst);
        assert_eq!(f.scheduler.run_collection("trades").unwrap().dropped.len(), 3);
        assert!(f.catalog.lookup_chunk("trades", 0).unwrap().is_none());
        assert_eq!(f.store.row_count("trades", chunk.id).unwrap(), 0);
    }

    #[test]
    fn test_failed_drop_intent_keeps_rows() {
        let f = fixture(5, 30 * DAY, Some(2 * DAY));
        f.catalog.fail_next_append(RecordKind::DropIntent);

        let report = f.scheduler.run_collection("trades").unwrap();
        assert_eq!(report.dropped.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].retryable);

        let kept = report.failures[0].chunk;
        assert_eq!(kept, chunk_at(&f.catalog, 0).id);
        assert_eq!(f.store.row_count("trades", kept).unwrap(), 1);
        assert!(f.catalog.pending_drops("trades").unwrap().is_empty());
        // the chunk still takes writes
        assert!(f.store.append("trades", kept, Row::new(2 * HOUR, "ES")).unwrap());
    }

    #[test]
    fn test_failed_metadata_drop_finishes_next_run() {
        let f = fixture(5, 30 * DAY, Some(2 * DAY));
        f.catalog.fail_next_append(RecordKind::DropChunk);

        let report = f.scheduler.run_collection("trades").unwrap();
        assert_eq!(report.dropped.len(), 2);
        assert_eq!(report.failures.len(), 1);
        let interrupted = report.failures[0].chunk;
        assert!(f.catalog.chunk(interrupted).is_ok());
        assert_eq!(f.catalog.pending_drops("trades").unwrap()[0].id, interrupted);

        // lifting retention does not strand the half-dropped chunk
        f.catalog.update_thresholds("trades", 30 * DAY, None).unwrap();
        let report = f.scheduler.run_collection("trades").unwrap();
        assert_eq!(report.dropped, vec![interrupted]);
        assert!(matches!(
            f.catalog.chunk(interrupted),
            Err(ChunkError::ChunkNotFound(_))
        ));
        assert!(f.catalog.pending_drops("trades").unwrap().is_empty());
    }

    #[test]
    fn test_busy_collection_skipped() {
        let f = fixture(5, DAY, None);
        let lock = f.scheduler.collection_lock("trades");
        let _held = lock.lock();

        let report = f.scheduler.run_collection("trades").unwrap();
        assert!(report.skipped);
        assert!(report.compressed.is_empty());
    }

    #[test]
    fn test_cancelled_tick_stops() {
        let f = fixture(5, DAY, None);
        let token = CancellationToken::new();
        token.cancel();

        let report = f.scheduler.tick_until_cancelled(&token);
        assert!(report.cancelled);
        assert!(report.collections.is_empty());
        assert_eq!(chunk_at(&f.catalog, 0).state, ChunkState::ClosedUncompressed);
    }

    #[tokio::test]
    async fn test_spawned_loop_ticks_and_stops() {
        let f = fixture(5, DAY, None);
        let scheduler = Arc::new(f.scheduler);
        let token = CancellationToken::new();
        let handle = scheduler.clone().spawn(Duration::from_secs(60), token.clone());

        // the first tick fires immediately
        for _ in 0..200 {
            if chunk_at(&f.catalog, 0).state == ChunkState::Compressed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(chunk_at(&f.catalog, 0).state, ChunkState::Compressed);

        token.cancel();
        handle.await.unwrap();
    }
}
