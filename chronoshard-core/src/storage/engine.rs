//! Storage engine - top-level coordinator

use super::{CollectionConfig, EngineConfig};
use crate::catalog::{CatalogStats, Chunk, ChunkCatalog, CollectionMeta};
use crate::clock::{Clock, SystemClock};
use crate::compression::{ColumnarCompressor, Compressor};
use crate::lifecycle::{LifecycleScheduler, TickReport};
use crate::rollup::{DailyBucket, RollupMaintainer, RollupSpec};
use crate::router::PartitionRouter;
use crate::store::{time_predicate, RowScan, RowStore};
use crate::wal::{file_stem, WalConfig};
use crate::{
    floor_day, format_duration, grid_cell, ChunkError, Nanos, Result, Row, TimeRange, Timestamp,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of a batch write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteSummary {
    pub inserted: usize,
    pub duplicates: usize,
}

/// ChronoShard storage engine
pub struct Engine {
    config: EngineConfig,
    catalog: Arc<ChunkCatalog>,
    router: PartitionRouter,
    store: Arc<dyn RowStore>,
    scheduler: Arc<LifecycleScheduler>,
    /// Rollups keyed by source collection
    rollups: RwLock<HashMap<String, Arc<RollupMaintainer>>>,
}

impl Engine {
    /// Open an engine with the row store `config` calls for and the wall clock
    pub fn open(config: EngineConfig) -> Result<Self> {
        let compressor: Arc<dyn Compressor> =
            Arc::new(ColumnarCompressor::new(config.compression));
        let store = config.row_store(compressor.clone())?;
        Self::with_parts(config, store, compressor, Arc::new(SystemClock::new()))
    }

    /// Open an engine over the given collaborators.
    ///
    /// A configuration with a data directory needs a durable row store.
    pub fn with_parts(
        config: EngineConfig,
        store: Arc<dyn RowStore>,
        compressor: Arc<dyn Compressor>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if let Some(dir) = &config.data_dir {
            if !store.is_durable() {
                return Err(ChunkError::Config(format!(
                    "Data directory {} needs a durable row store",
                    dir.display()
                )));
            }
            std::fs::create_dir_all(dir)?;
        }

        let catalog = Arc::new(ChunkCatalog::open(config.catalog_config())?);
        let router = PartitionRouter::new(catalog.clone());
        let scheduler = Arc::new(LifecycleScheduler::new(
            catalog.clone(),
            store.clone(),
            compressor,
            clock,
        ));

        let engine = Self {
            config,
            catalog,
            router,
            store,
            scheduler,
            rollups: RwLock::new(HashMap::new()),
        };
        engine.recover()?;
        Ok(engine)
    }

    /// Finish interrupted drops and reconcile the catalog with stored rows
    fn recover(&self) -> Result<()> {
        for meta in self.catalog.collections() {
            for pending in self.catalog.pending_drops(&meta.name)? {
                match self.scheduler.drop_chunk(pending.id) {
                    Ok(_) => info!("Finished interrupted drop of chunk {}", pending.id),
                    Err(e) => warn!(
                        "Drop of chunk {} of {} still pending: {}",
                        pending.id, meta.name, e
                    ),
                }
            }

            if !self.store.is_durable() {
                continue;
            }
            for id in self.store.chunk_ids(&meta.name)? {
                match self.catalog.chunk(id) {
                    Ok(chunk) if chunk.collection == meta.name => {
                        let rows = self.store.row_count(&meta.name, id)?;
                        self.catalog.set_row_count(id, rows)?;
                    }
                    Ok(_) | Err(ChunkError::ChunkNotFound(_)) => {
                        warn!("Deleting rows of chunk {} unknown to {}", id, meta.name);
                        self.store.delete_chunk_rows(&meta.name, id)?;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<ChunkCatalog> {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<dyn RowStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<LifecycleScheduler> {
        &self.scheduler
    }

    // ------------------------------------------------------------------
    // Collections
    // ------------------------------------------------------------------

    /// Register a new collection, and its rollup if configured
    pub fn register_collection(&self, config: CollectionConfig) -> Result<CollectionMeta> {
        let meta = config.to_meta(self.config.default_chunk_width)?;
        self.catalog.register_collection(meta.clone())?;
        if let Some(fields) = config.rollup {
            let rollup = self.attach_rollup(RollupSpec::new(&meta.name, fields))?;
            if !rollup.is_empty() {
                // buckets logged for an earlier collection of the same name
                self.rebuild_rollup(&meta.name)?;
            }
        }
        Ok(meta)
    }

    /// Register a collection unless the catalog already holds it.
    ///
    /// An existing collection keeps its persisted definition; only the
    /// rollup is attached. Buckets come from the rollup log when there is
    /// one, otherwise they are rebuilt from stored rows.
    pub fn ensure_collection(&self, config: CollectionConfig) -> Result<CollectionMeta> {
        let meta = match self.catalog.collection(&config.name) {
            Ok(meta) => meta,
            Err(ChunkError::CollectionNotFound(_)) => return self.register_collection(config),
            Err(e) => return Err(e),
        };

        let wanted = config.to_meta(self.config.default_chunk_width)?;
        if wanted.chunk_width != meta.chunk_width {
            warn!(
                "Collection {} keeps its chunk width {}; configured width {} is ignored",
                meta.name,
                format_duration(meta.chunk_width),
                format_duration(wanted.chunk_width)
            );
        }
        if let Some(fields) = config.rollup {
            if self.rollup(&meta.name).is_err() {
                let rollup = self.attach_rollup(RollupSpec::new(&meta.name, fields))?;
                if rollup.is_empty() {
                    self.rebuild_rollup(&meta.name)?;
                }
            }
        }
        Ok(meta)
    }

    /// Tune compression and retention of a collection
    pub fn update_thresholds(
        &self,
        collection: &str,
        compress_after: Nanos,
        retain_for: Option<Nanos>,
    ) -> Result<CollectionMeta> {
        self.catalog
            .update_thresholds(collection, compress_after, retain_for)
    }

    /// All collection definitions, ordered by name
    pub fn collections(&self) -> Vec<CollectionMeta> {
        self.catalog.collections()
    }

    // ------------------------------------------------------------------
    // Writes and reads
    // ------------------------------------------------------------------

    /// Write one row. Returns `false` if a row with the same key exists.
    pub fn write(&self, collection: &str, row: Row) -> Result<bool> {
        // held until the row is folded into its rollup
        let rollups = self.rollups.read();
        let rollup = rollups.get(collection).map(Arc::as_ref);

        self.validate_row(collection, &row, rollup)?;
        self.write_validated(collection, row, rollup)
    }

    /// Write rows in order.
    ///
    /// Every row is validated first, so a malformed row stores nothing. A
    /// store failure after some rows were written is reported as
    /// `PartialBatch`; retrying the whole batch only adds the missing rows.
    pub fn write_batch(&self, collection: &str, rows: Vec<Row>) -> Result<WriteSummary> {
        let rollups = self.rollups.read();
        let rollup = rollups.get(collection).map(Arc::as_ref);

        for row in &rows {
            self.validate_row(collection, row, rollup)?;
        }

        let mut summary = WriteSummary::default();
        for row in rows {
            match self.write_validated(collection, row, rollup) {
                Ok(true) => summary.inserted += 1,
                Ok(false) => summary.duplicates += 1,
                Err(e) if summary.inserted == 0 => return Err(e),
                Err(e) => {
                    return Err(ChunkError::PartialBatch {
                        inserted: summary.inserted,
                        duplicates: summary.duplicates,
                        source: Box::new(e),
                    })
                }
            }
        }
        Ok(summary)
    }

    /// Reject a row the router or the rollup would refuse, before any row
    /// is stored
    fn validate_row(
        &self,
        collection: &str,
        row: &Row,
        rollup: Option<&RollupMaintainer>,
    ) -> Result<()> {
        let meta = self.catalog.collection(collection)?;
        grid_cell(row.time, meta.chunk_width)?;
        if let Some(rollup) = rollup {
            rollup.spec().fields.sample(row)?;
            floor_day(row.time)?;
        }
        Ok(())
    }

    fn write_validated(
        &self,
        collection: &str,
        row: Row,
        rollup: Option<&RollupMaintainer>,
    ) -> Result<bool> {
        for attempt in 1..=crate::config::WRITE_ROUTE_ATTEMPTS {
            let chunk = self.router.route_write(collection, row.time)?;
            match self.store.append(collection, chunk.id, row.clone()) {
                Ok(true) => {
                    if let Err(e) = self.catalog.record_rows(chunk.id, 1) {
                        debug!("Row count of chunk {} not updated: {}", chunk.id, e);
                    }
                    if let Some(rollup) = rollup {
                        rollup.observe(&row)?;
                    }
                    return Ok(true);
                }
                Ok(false) => return Ok(false),
                Err(ChunkError::ChunkNotFound(id)) => {
                    debug!(
                        "Chunk {} of {} dropped under a write (attempt {}), re-routing",
                        id, collection, attempt
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(ChunkError::StoreUnavailable(format!(
            "No live chunk for {} at {} after {} attempts",
            collection,
            row.time,
            crate::config::WRITE_ROUTE_ATTEMPTS
        )))
    }

    /// Lazily scan the rows of `collection` in `range`, in time order
    pub fn read(&self, collection: &str, range: TimeRange) -> Result<RowScan> {
        let chunks = self.router.route_read(collection, range)?;
        let ids = chunks.iter().map(|c| c.id).collect();
        Ok(RowScan::new(
            self.store.clone(),
            collection,
            ids,
            Some(time_predicate(range)),
        ))
    }

    /// Chunks of `collection` overlapping `range`
    pub fn chunks(&self, collection: &str, range: TimeRange) -> Result<Vec<Chunk>> {
        self.router.route_read(collection, range)
    }

    // ------------------------------------------------------------------
    // Rollups
    // ------------------------------------------------------------------

    /// Start maintaining a rollup. Replaces any rollup on the same source.
    ///
    /// With a data directory the buckets are logged under `rollups/` and
    /// any buckets already logged for the source are restored.
    pub fn attach_rollup(&self, spec: RollupSpec) -> Result<Arc<RollupMaintainer>> {
        let source = spec.source.clone();
        let maintainer = match &self.config.data_dir {
            Some(dir) => {
                let path = dir
                    .join(crate::config::ROLLUPS_DIR)
                    .join(format!("{}.log", file_stem(&source)));
                let log = WalConfig::new(path).with_sync_policy(self.config.sync_policy);
                Arc::new(RollupMaintainer::open(spec, log)?)
            }
            None => Arc::new(RollupMaintainer::new(spec)),
        };
        self.rollups.write().insert(source.clone(), maintainer.clone());
        info!("Maintaining daily rollup of {}", source);
        Ok(maintainer)
    }

    pub fn rollup(&self, collection: &str) -> Result<Arc<RollupMaintainer>> {
        self.rollups
            .read()
            .get(collection)
            .cloned()
            .ok_or_else(|| ChunkError::RollupNotFound(collection.to_string()))
    }

    /// Daily bucket of `entity` for the day containing `day`
    pub fn rollup_bucket(
        &self,
        collection: &str,
        entity: &str,
        day: Timestamp,
    ) -> Result<Option<DailyBucket>> {
        Ok(self.rollup(collection)?.bucket(entity, day))
    }

    /// Daily buckets of `entity` in `range`, by day
    pub fn rollup_range(
        &self,
        collection: &str,
        entity: &str,
        range: TimeRange,
    ) -> Result<Vec<DailyBucket>> {
        Ok(self.rollup(collection)?.range(entity, range.start, range.end))
    }

    /// Recompute a rollup from the rows currently stored.
    ///
    /// Writes to every collection wait until the rebuild is done.
    pub fn rebuild_rollup(&self, collection: &str) -> Result<u64> {
        let rollups = self.rollups.write();
        let rollup = rollups
            .get(collection)
            .ok_or_else(|| ChunkError::RollupNotFound(collection.to_string()))?;
        rollup.rebuild(self.read(collection, TimeRange::all())?)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Run one lifecycle tick
    pub fn tick(&self) -> TickReport {
        self.scheduler.tick()
    }

    /// Run lifecycle ticks in the background until `token` is cancelled
    pub fn spawn_scheduler(&self, token: CancellationToken) -> JoinHandle<()> {
        self.scheduler
            .clone()
            .spawn(self.config.scheduler_interval, token)
    }

    /// Compact the catalog log and every rollup log. Returns the catalog
    /// log size.
    pub fn checkpoint(&self) -> Result<u64> {
        let written = self.catalog.checkpoint()?;
        let rollups: Vec<_> = self.rollups.read().values().cloned().collect();
        for rollup in rollups {
            rollup.checkpoint()?;
        }
        Ok(written)
    }

    /// Get engine statistics
    pub fn stats(&self) -> EngineStats {
        let rollups = self.rollups.read();
        let mut rollup_buckets: Vec<_> = rollups
            .iter()
            .map(|(name, rollup)| (name.clone(), rollup.len()))
            .collect();
        rollup_buckets.sort();

        EngineStats {
            version: crate::VERSION,
            durable: self.catalog.is_durable() && self.store.is_durable(),
            catalog: self.catalog.stats(),
            rollup_buckets,
        }
    }
}

/// Storage engine statistics
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub version: &'static str,
    pub durable: bool,
    pub catalog: CatalogStats,
    /// Bucket count per rollup source
    pub rollup_buckets: Vec<(String, usize)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ChunkState;
    use crate::clock::ManualClock;
    use crate::config::{DAY, HOUR};
    use crate::compression::EncodedBlock;
    use crate::rollup::RollupFields;
    use crate::store::{ChunkSnapshot, MemoryRowStore};
    use crate::ChunkId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn engine_at(now: Timestamp) -> (Engine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now));
        let compressor: Arc<dyn Compressor> = Arc::new(ColumnarCompressor::default());
        let engine = Engine::with_parts(
            EngineConfig::default(),
            Arc::new(MemoryRowStore::with_compressor(compressor.clone())),
            compressor,
            clock.clone(),
        )
        .unwrap();
        (engine, clock)
    }

    fn trade(time: Timestamp, id: i64) -> Row {
        Row::new(time, "ES")
            .with_discriminator(id)
            .with_field("price", 5000.0 + id as f64)
            .with_field("quantity", 1i64)
    }

    #[test]
    fn test_write_and_read_range() {
        let (engine, _) = engine_at(0);
        engine.register_collection(CollectionConfig::new("trades")).unwrap();

        for i in 0..48 {
            assert!(engine.write("trades", trade(i * HOUR, i)).unwrap());
        }
        assert!(!engine.write("trades", trade(0, 0)).unwrap());

        let rows = engine
            .read("trades", TimeRange::new(12 * HOUR, 36 * HOUR))
            .unwrap()
            .collect_rows()
            .unwrap();
        assert_eq!(rows.len(), 24);
        assert_eq!(rows[0].time, 12 * HOUR);

        let chunks = engine.chunks("trades", TimeRange::all()).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].row_count, 24);
    }

    #[test]
    fn test_write_unknown_collection() {
        let (engine, _) = engine_at(0);
        assert!(matches!(
            engine.write("quotes", trade(0, 0)),
            Err(ChunkError::CollectionNotFound(_))
        ));
        assert!(engine.read("quotes", TimeRange::all()).is_err());
    }

    #[test]
    fn test_rollup_follows_writes() {
        let (engine, _) = engine_at(0);
        engine
            .register_collection(CollectionConfig::new("trades").rollup(RollupFields::tick()))
            .unwrap();

        engine.write("trades", trade(DAY + HOUR, 1)).unwrap();
        engine.write("trades", trade(DAY + 2 * HOUR, 2)).unwrap();
        // duplicate is not counted twice
        engine.write("trades", trade(DAY + 2 * HOUR, 2)).unwrap();

        let bucket = engine.rollup_bucket("trades", "ES", DAY).unwrap().unwrap();
        assert_eq!(bucket.bars, 2);
        assert_eq!(bucket.open, 5001.0);
        assert_eq!(bucket.close, 5002.0);

        let err = engine.write("trades", Row::new(DAY, "ES")).unwrap_err();
        assert!(matches!(err, ChunkError::InvalidFormat(_)));
        assert_eq!(engine.read("trades", TimeRange::all()).unwrap().count(), 2);

        assert!(matches!(
            engine.rollup_range("missing", "ES", TimeRange::all()),
            Err(ChunkError::RollupNotFound(_))
        ));
    }

    #[test]
    fn test_tick_compresses_through_engine() {
        let (engine, clock) = engine_at(0);
        engine
            .register_collection(CollectionConfig::new("trades").compress_after("1d"))
            .unwrap();
        for day in 0..4 {
            engine.write("trades", trade(day * DAY, day)).unwrap();
        }

        clock.set(4 * DAY);
        let report = engine.tick();
        // chunks of days 0..=2 end by 3d
        assert_eq!(report.compressed(), 3);

        let chunks = engine.chunks("trades", TimeRange::all()).unwrap();
        assert_eq!(chunks[0].state, ChunkState::Compressed);
        assert_eq!(
            engine.read("trades", TimeRange::all()).unwrap().count(),
            4
        );
        assert_eq!(engine.stats().catalog.compressed_chunks, 3);
    }

    /// Memory store refusing appends once its budget is spent
    struct AppendBudget {
        inner: MemoryRowStore,
        remaining: AtomicUsize,
    }

    impl RowStore for AppendBudget {
        fn append(&self, collection: &str, chunk: ChunkId, row: Row) -> Result<bool> {
            let spent = self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if spent.is_err() {
                return Err(ChunkError::StoreUnavailable("append budget spent".into()));
            }
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
            self.inner
                .store_compressed(collection, chunk, block, expected_version)
        }

        fn delete_chunk_rows(&self, collection: &str, chunk: ChunkId) -> Result<()> {
            self.inner.delete_chunk_rows(collection, chunk)
        }

        fn row_count(&self, collection: &str, chunk: ChunkId) -> Result<u64> {
            self.inner.row_count(collection, chunk)
        }

        fn chunk_ids(&self, collection: &str) -> Result<Vec<ChunkId>> {
            Ok(self.inner.chunk_ids(collection))
        }
    }

    #[test]
    fn test_invalid_row_fails_whole_batch() {
        let (engine, _) = engine_at(0);
        engine
            .register_collection(CollectionConfig::new("trades").rollup(RollupFields::tick()))
            .unwrap();

        let missing_price = Row::new(2 * HOUR, "ES").with_field("quantity", 1i64);
        let err = engine
            .write_batch("trades", vec![trade(HOUR, 1), missing_price, trade(3 * HOUR, 3)])
            .unwrap_err();
        assert!(matches!(err, ChunkError::InvalidFormat(_)));

        let err = engine
            .write_batch("trades", vec![trade(HOUR, 1), trade(i64::MIN + 1, 2)])
            .unwrap_err();
        assert!(matches!(err, ChunkError::InvalidFormat(_)));

        assert_eq!(engine.read("trades", TimeRange::all()).unwrap().count(), 0);
        assert!(engine.chunks("trades", TimeRange::all()).unwrap().is_empty());
        assert!(engine.rollup("trades").unwrap().is_empty());
    }

    #[test]
    fn test_store_failure_reports_partial_batch() {
        let compressor: Arc<dyn Compressor> = Arc::new(ColumnarCompressor::default());
        let store = Arc::new(AppendBudget {
            inner: MemoryRowStore::with_compressor(compressor.clone()),
            remaining: AtomicUsize::new(2),
        });
        let engine = Engine::with_parts(
            EngineConfig::default(),
            store.clone(),
            compressor,
            Arc::new(ManualClock::new(0)),
        )
        .unwrap();
        engine.register_collection(CollectionConfig::new("trades")).unwrap();

        let rows: Vec<Row> = (0..4).map(|i| trade(i * HOUR, i)).collect();
        let err = engine.write_batch("trades", rows.clone()).unwrap_err();
        match &err {
            ChunkError::PartialBatch {
                inserted,
                duplicates,
                source,
            } => {
                assert_eq!((*inserted, *duplicates), (2, 0));
                assert!(matches!(**source, ChunkError::StoreUnavailable(_)));
            }
            other => panic!("expected a partial batch, got {:?}", other),
        }
        assert!(err.is_retryable());

        // the retry stores only what is missing
        store.remaining.store(usize::MAX, Ordering::SeqCst);
        let summary = engine.write_batch("trades", rows).unwrap();
        assert_eq!(summary, WriteSummary { inserted: 2, duplicates: 2 });
    }

    #[test]
    fn test_rebuild_during_writes_counts_every_row() {
        let (engine, _) = engine_at(0);
        let engine = Arc::new(engine);
        engine
            .register_collection(CollectionConfig::new("trades").rollup(RollupFields::tick()))
            .unwrap();

        let writer = {
            let engine = engine.clone();
            std::thread::spawn(move || {
                for i in 0..2_000 {
                    engine.write("trades", trade(DAY + i, i)).unwrap();
                }
            })
        };
        for _ in 0..20 {
            engine.rebuild_rollup("trades").unwrap();
        }
        writer.join().unwrap();

        let bucket = engine.rollup_bucket("trades", "ES", DAY).unwrap().unwrap();
        assert_eq!(bucket.bars, 2_000);
        assert_eq!(engine.rebuild_rollup("trades").unwrap(), 2_000);
        assert_eq!(
            engine.rollup_bucket("trades", "ES", DAY).unwrap().unwrap().bars,
            2_000
        );
    }

    #[test]
    fn test_data_dir_needs_durable_store() {
        let temp_dir = TempDir::new().unwrap();
        let compressor: Arc<dyn Compressor> = Arc::new(ColumnarCompressor::default());
        let result = Engine::with_parts(
            EngineConfig::durable(temp_dir.path()),
            Arc::new(MemoryRowStore::with_compressor(compressor.clone())),
            compressor,
            Arc::new(ManualClock::new(0)),
        );
        assert!(matches!(result, Err(ChunkError::Config(_))));
    }

    #[test]
    fn test_ensure_collection_after_restart() {
        let temp_dir = TempDir::new().unwrap();
        let config = CollectionConfig::new("historical_data")
            .retain_for("90d")
            .rollup(RollupFields::bar());
        {
            let engine = Engine::open(EngineConfig::durable(temp_dir.path())).unwrap();
            engine.ensure_collection(config.clone()).unwrap();
            engine.update_thresholds("historical_data", DAY, None).unwrap();
        }

        let engine = Engine::open(EngineConfig::durable(temp_dir.path())).unwrap();
        let meta = engine.ensure_collection(config).unwrap();
        assert_eq!(meta.compress_after, DAY);
        assert_eq!(meta.retain_for, None);
        assert!(engine.rollup("historical_data").is_ok());
        assert!(engine.stats().durable);
    }
}
