//! Incrementally maintained daily rollups
//!
//! A [`RollupMaintainer`] folds every row written to its source collection
//! into one [`DailyBucket`] per `(entity, UTC day)`. Late rows update the
//! affected bucket in place; reads never touch raw rows, so buckets outlive
//! the retention of the rows they were built from.
//!
//! A durable maintainer appends each new bucket state to its own log before
//! applying it, and replays the latest state per bucket on open.

mod bucket;

pub use bucket::{DailyBucket, Sample, Stamp};

use crate::wal::{LogRecord, WalConfig, WalReader, WalWriter};
use crate::{floor_day, ChunkError, Result, Row, Timestamp};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Where the rollup reads prices and volume from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RollupFields {
    /// Rows are bars with their own OHLCV fields
    Bar {
        open: String,
        high: String,
        low: String,
        close: String,
        volume: String,
    },
    /// Rows are individual trades
    Tick { price: String, quantity: String },
}

impl RollupFields {
    /// Bars with fields named `open`, `high`, `low`, `close`, `volume`
    pub fn bar() -> Self {
        RollupFields::Bar {
            open: "open".into(),
            high: "high".into(),
            low: "low".into(),
            close: "close".into(),
            volume: "volume".into(),
        }
    }

    /// Trades with fields named `price` and `quantity`
    pub fn tick() -> Self {
        RollupFields::Tick {
            price: "price".into(),
            quantity: "quantity".into(),
        }
    }

    /// Extract the sample a row contributes
    pub fn sample(&self, row: &Row) -> Result<Sample> {
        let get = |name: &str| {
            row.fields.get_f64(name).ok_or_else(|| {
                ChunkError::InvalidFormat(format!(
                    "Row of {} at {} has no numeric field {:?}",
                    row.entity, row.time, name
                ))
            })
        };
        match self {
            RollupFields::Bar {
                open,
                high,
                low,
                close,
                volume,
            } => Ok(Sample {
                open: get(open)?,
                high: get(high)?,
                low: get(low)?,
                close: get(close)?,
                volume: get(volume)?,
            }),
            RollupFields::Tick { price, quantity } => {
                Ok(Sample::trade(get(price)?, get(quantity)?))
            }
        }
    }
}

/// Rollup definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupSpec {
    /// Source collection
    pub source: String,
    pub fields: RollupFields,
}

impl RollupSpec {
    pub fn new(source: impl Into<String>, fields: RollupFields) -> Self {
        Self {
            source: source.into(),
            fields,
        }
    }
}

/// Frame of a rollup log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RollupRecord {
    /// Latest state of one bucket
    Bucket(DailyBucket),
}

impl LogRecord for RollupRecord {
    fn kind_code(&self) -> u8 {
        match self {
            RollupRecord::Bucket(_) => 1,
        }
    }
}

type BucketKey = (String, Timestamp);
type BucketMap = BTreeMap<BucketKey, Arc<Mutex<DailyBucket>>>;

/// Maintains the daily buckets of one source collection
pub struct RollupMaintainer {
    spec: RollupSpec,
    buckets: RwLock<BucketMap>,
    /// Arrival counter breaking timestamp ties
    sequence: AtomicU64,
    /// Bucket log, `None` keeps buckets in memory only
    log: Option<WalWriter<RollupRecord>>,
    /// Observers hold this shared; rebuilds and checkpoints exclusively
    gate: RwLock<()>,
}

impl RollupMaintainer {
    /// In-memory maintainer
    pub fn new(spec: RollupSpec) -> Self {
        Self::with_buckets(spec, BTreeMap::new(), 0, None)
    }

    /// Maintainer logging its buckets to `config.path`, restoring any
    /// buckets already logged there
    pub fn open(spec: RollupSpec, config: WalConfig) -> Result<Self> {
        let replay = WalReader::<RollupRecord>::new(config.clone()).replay()?;

        let mut buckets = BTreeMap::new();
        let mut sequence = 0;
        for record in replay.records {
            let RollupRecord::Bucket(bucket) = record;
            sequence = sequence
                .max(bucket.open_stamp.1 + 1)
                .max(bucket.close_stamp.1 + 1);
            buckets.insert(
                (bucket.entity.clone(), bucket.day),
                Arc::new(Mutex::new(bucket)),
            );
        }
        if !buckets.is_empty() {
            info!(
                "Restored {} buckets of the {} rollup",
                buckets.len(),
                spec.source
            );
        }

        let log = WalWriter::open(config, replay.valid_len)?;
        Ok(Self::with_buckets(spec, buckets, sequence, Some(log)))
    }

    fn with_buckets(
        spec: RollupSpec,
        buckets: BucketMap,
        sequence: u64,
        log: Option<WalWriter<RollupRecord>>,
    ) -> Self {
        Self {
            spec,
            buckets: RwLock::new(buckets),
            sequence: AtomicU64::new(sequence),
            log,
            gate: RwLock::new(()),
        }
    }

    pub fn spec(&self) -> &RollupSpec {
        &self.spec
    }

    pub fn is_durable(&self) -> bool {
        self.log.is_some()
    }

    /// Fold a newly written row into its bucket.
    ///
    /// Returns `true` if the row created the bucket.
    pub fn observe(&self, row: &Row) -> Result<bool> {
        let sample = self.spec.fields.sample(row)?;
        let key = (row.entity.clone(), floor_day(row.time)?);

        let _gate = self.gate.read();
        let stamp = (row.time, self.sequence.fetch_add(1, Ordering::Relaxed));

        let existing = self.buckets.read().get(&key).cloned();
        let bucket = match existing {
            Some(bucket) => bucket,
            None => {
                let mut buckets = self.buckets.write();
                match buckets.get(&key) {
                    Some(bucket) => bucket.clone(),
                    None => {
                        let day = key.1;
                        let bucket = DailyBucket::seed(&row.entity, day, stamp, sample);
                        self.persist(&bucket)?;
                        buckets.insert(key, Arc::new(Mutex::new(bucket)));
                        debug!("Seeded {} bucket {} day {}", self.spec.source, row.entity, day);
                        return Ok(true);
                    }
                }
            }
        };

        let mut bucket = bucket.lock();
        let mut merged = bucket.clone();
        merged.merge(stamp, sample);
        self.persist(&merged)?;
        *bucket = merged;
        Ok(false)
    }

    fn persist(&self, bucket: &DailyBucket) -> Result<()> {
        if let Some(log) = &self.log {
            log.append(&RollupRecord::Bucket(bucket.clone()))?;
        }
        Ok(())
    }

    /// Bucket of `entity` for the day containing `day`
    pub fn bucket(&self, entity: &str, day: Timestamp) -> Option<DailyBucket> {
        let day = floor_day(day).ok()?;
        self.buckets
            .read()
            .get(&(entity.to_string(), day))
            .map(|bucket| bucket.lock().clone())
    }

    /// Buckets of `entity` whose day starts in `[floor_day(start), end)`, by day
    pub fn range(&self, entity: &str, start: Timestamp, end: Timestamp) -> Vec<DailyBucket> {
        // no bucket starts before the first whole day
        let from = (entity.to_string(), floor_day(start).unwrap_or(Timestamp::MIN));
        let to = (entity.to_string(), end);
        if from >= to {
            return Vec::new();
        }
        self.buckets
            .read()
            .range(from..to)
            .map(|(_, bucket)| bucket.lock().clone())
            .collect()
    }

    /// Entities with at least one bucket
    pub fn entities(&self) -> Vec<String> {
        let mut entities: Vec<String> = self
            .buckets
            .read()
            .keys()
            .map(|(entity, _)| entity.clone())
            .collect();
        entities.dedup();
        entities
    }

    pub fn len(&self) -> usize {
        self.buckets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compact the bucket log to one record per bucket. Returns bytes written.
    pub fn checkpoint(&self) -> Result<u64> {
        let Some(log) = &self.log else {
            return Ok(0);
        };
        let _gate = self.gate.write();
        log.rewrite(&self.snapshot())
    }

    fn snapshot(&self) -> Vec<RollupRecord> {
        self.buckets
            .read()
            .values()
            .map(|bucket| RollupRecord::Bucket(bucket.lock().clone()))
            .collect()
    }

    /// Replace every bucket with the fold of `rows`. Returns rows folded.
    ///
    /// The caller must keep rows of the source collection from being
    /// written until this returns; a row stored while `rows` is read would
    /// be folded twice or not at all.
    pub(crate) fn rebuild<I>(&self, rows: I) -> Result<u64>
    where
        I: IntoIterator<Item = Result<Row>>,
    {
        let rebuilt = RollupMaintainer::new(self.spec.clone());
        let mut folded = 0;
        for row in rows {
            rebuilt.observe(&row?)?;
            folded += 1;
        }

        let _gate = self.gate.write();
        *self.buckets.write() = rebuilt.buckets.into_inner();
        self.sequence
            .fetch_max(rebuilt.sequence.load(Ordering::Relaxed), Ordering::Relaxed);
        if let Some(log) = &self.log {
            log.rewrite(&self.snapshot())?;
        }
        info!(
            "Rebuilt rollup of {} from {} rows: {} buckets",
            self.spec.source,
            folded,
            self.len()
        );
        Ok(folded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DAY, HOUR};
    use rand::seq::SliceRandom;

    const MINUTE: i64 = 60 * crate::config::SECOND;

    fn bar(time: Timestamp, o: f64, h: f64, l: f64, c: f64, v: f64) -> Row {
        Row::new(time, "AAPL")
            .with_field("open", o)
            .with_field("high", h)
            .with_field("low", l)
            .with_field("close", c)
            .with_field("volume", v)
    }

    fn maintainer() -> RollupMaintainer {
        RollupMaintainer::new(RollupSpec::new("historical_data", RollupFields::bar()))
    }

    #[test]
    fn test_late_bar_updates_open() {
        let rollup = maintainer();
        let day = 20 * DAY;
        assert!(rollup.observe(&bar(day + 9 * HOUR, 10.0, 11.0, 8.5, 10.5, 100.0)).unwrap());
        assert!(!rollup.observe(&bar(day + 16 * HOUR, 11.0, 12.5, 10.0, 12.0, 200.0)).unwrap());
        rollup
            .observe(&bar(day + 8 * HOUR + 30 * MINUTE, 9.0, 9.5, 9.0, 9.2, 50.0))
            .unwrap();

        let bucket = rollup.bucket("AAPL", day + HOUR).unwrap();
        assert_eq!(bucket.day, day);
        assert_eq!(bucket.open, 9.0);
        assert_eq!(bucket.high, 12.5);
        assert_eq!(bucket.low, 8.5);
        assert_eq!(bucket.close, 12.0);
        assert_eq!(bucket.volume, 350.0);
        assert_eq!(bucket.bars, 3);
    }

    #[test]
    fn test_arrival_order_irrelevant() {
        let mut rows: Vec<Row> = (0..48)
            .map(|i| {
                let price = 100.0 + ((i * 37) % 11) as f64;
                bar(i * HOUR, price, price + 1.0, price - 1.0, price + 0.5, 10.0)
            })
            .collect();

        let sorted = maintainer();
        for row in &rows {
            sorted.observe(row).unwrap();
        }

        rows.shuffle(&mut rand::thread_rng());
        let shuffled = maintainer();
        for row in &rows {
            shuffled.observe(row).unwrap();
        }

        for day in [0, DAY] {
            let a = sorted.bucket("AAPL", day).unwrap();
            let b = shuffled.bucket("AAPL", day).unwrap();
            assert_eq!(
                (a.open, a.high, a.low, a.close, a.volume, a.bars),
                (b.open, b.high, b.low, b.close, b.volume, b.bars)
            );
        }
    }

    #[test]
    fn test_range_and_entities() {
        let rollup = RollupMaintainer::new(RollupSpec::new("trades", RollupFields::tick()));
        for (entity, day) in [("ES", 0), ("ES", 1), ("ES", 2), ("NQ", 1)] {
            let row = Row::new(day * DAY + HOUR, entity)
                .with_field("price", 5000.0)
                .with_field("quantity", 2i64);
            rollup.observe(&row).unwrap();
        }

        let days: Vec<_> = rollup
            .range("ES", DAY + HOUR, 3 * DAY)
            .iter()
            .map(|b| b.day)
            .collect();
        assert_eq!(days, vec![DAY, 2 * DAY]);
        assert!(rollup.range("ES", 3 * DAY, DAY).is_empty());
        assert_eq!(rollup.entities(), vec!["ES".to_string(), "NQ".to_string()]);
        assert_eq!(rollup.len(), 4);
    }

    #[test]
    fn test_missing_field_rejected() {
        let rollup = maintainer();
        let err = rollup.observe(&Row::new(0, "AAPL").with_field("close", 1.0)).unwrap_err();
        assert!(matches!(err, ChunkError::InvalidFormat(_)));
        assert!(rollup.is_empty());
    }

    #[test]
    fn test_rebuild_replaces_buckets() {
        let rollup = maintainer();
        rollup.observe(&bar(0, 1.0, 1.0, 1.0, 1.0, 1.0)).unwrap();

        let rows = vec![
            Ok(bar(DAY, 5.0, 6.0, 4.0, 5.5, 10.0)),
            Ok(bar(DAY + HOUR, 5.5, 7.0, 5.0, 6.0, 10.0)),
        ];
        assert_eq!(rollup.rebuild(rows).unwrap(), 2);
        assert!(rollup.bucket("AAPL", 0).is_none());
        assert_eq!(rollup.bucket("AAPL", DAY).unwrap().close, 6.0);
    }

    #[test]
    fn test_unalignable_row_rejected() {
        let rollup = maintainer();
        let err = rollup
            .observe(&bar(i64::MIN + 1, 1.0, 1.0, 1.0, 1.0, 1.0))
            .unwrap_err();
        assert!(matches!(err, ChunkError::InvalidFormat(_)));
        assert!(rollup.is_empty());
        assert!(rollup.bucket("AAPL", i64::MIN + 1).is_none());
        assert!(rollup.range("AAPL", i64::MIN + 1, i64::MAX).is_empty());
    }

    #[test]
    fn test_buckets_survive_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = WalConfig::new(temp_dir.path().join("historical_data.log"));
        let spec = RollupSpec::new("historical_data", RollupFields::bar());
        let day = 3 * DAY;
        {
            let rollup = RollupMaintainer::open(spec.clone(), config.clone()).unwrap();
            assert!(rollup.is_durable());
            rollup.observe(&bar(day + 9 * HOUR, 10.0, 11.0, 8.5, 10.5, 100.0)).unwrap();
            rollup.observe(&bar(day + 16 * HOUR, 11.0, 12.5, 10.0, 12.0, 200.0)).unwrap();
            rollup.observe(&bar(4 * DAY, 1.0, 1.0, 1.0, 1.0, 1.0)).unwrap();
        }

        let rollup = RollupMaintainer::open(spec.clone(), config.clone()).unwrap();
        assert_eq!(rollup.len(), 2);
        let bucket = rollup.bucket("AAPL", day).unwrap();
        assert_eq!((bucket.open, bucket.close, bucket.bars), (10.0, 12.0, 2));

        // a same-time row arriving after the restart still closes the day
        rollup.observe(&bar(day + 16 * HOUR, 12.0, 12.0, 11.0, 11.5, 5.0)).unwrap();
        assert_eq!(rollup.bucket("AAPL", day).unwrap().close, 11.5);

        let before = std::fs::metadata(&config.path).unwrap().len();
        let written = rollup.checkpoint().unwrap();
        assert!(written < before);
        drop(rollup);

        let rollup = RollupMaintainer::open(spec, config).unwrap();
        let bucket = rollup.bucket("AAPL", day).unwrap();
        assert_eq!((bucket.close, bucket.volume, bucket.bars), (11.5, 305.0, 3));
    }

    #[test]
    fn test_rebuild_rewrites_log() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = WalConfig::new(temp_dir.path().join("historical_data.log"));
        let spec = RollupSpec::new("historical_data", RollupFields::bar());
        {
            let rollup = RollupMaintainer::open(spec.clone(), config.clone()).unwrap();
            rollup.observe(&bar(0, 1.0, 1.0, 1.0, 1.0, 1.0)).unwrap();
            rollup
                .rebuild(vec![Ok(bar(DAY, 5.0, 6.0, 4.0, 5.5, 10.0))])
                .unwrap();
        }

        let rollup = RollupMaintainer::open(spec, config).unwrap();
        assert!(rollup.bucket("AAPL", 0).is_none());
        assert_eq!(rollup.bucket("AAPL", DAY).unwrap().close, 5.5);
    }

    #[test]
    fn test_concurrent_observers() {
        let rollup = Arc::new(maintainer());
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let rollup = rollup.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        let t = (worker * 250 + i) * MINUTE;
                        rollup.observe(&bar(t, 1.0, 2.0, 0.5, 1.5, 1.0)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let bucket = rollup.bucket("AAPL", 0).unwrap();
        assert_eq!(bucket.bars, 1000);
        assert_eq!(bucket.volume, 1000.0);
    }
}
