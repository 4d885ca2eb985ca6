//! Partition router
//!
//! Maps a row's timestamp to the chunk that must hold it, creating chunks
//! on demand. The fast path is a catalog lookup; misses are resolved under
//! the collection's transition lock so that concurrent writers agree on a
//! single new chunk.

use crate::catalog::{Chunk, ChunkCatalog};
use crate::{grid_cell, ChunkError, Result, TimeRange, Timestamp};
use std::sync::Arc;
use tracing::debug;

/// Routes writes and reads to chunks
#[derive(Clone)]
pub struct PartitionRouter {
    catalog: Arc<ChunkCatalog>,
}

impl PartitionRouter {
    pub fn new(catalog: Arc<ChunkCatalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &Arc<ChunkCatalog> {
        &self.catalog
    }

    /// Resolve the chunk for a row at `ts`, creating one if none covers it.
    ///
    /// A timestamp past the open chunk's nominal end closes it and opens the
    /// next one; a timestamp falling between existing chunks gets a bounded
    /// gap chunk clipped to its neighbors.
    pub fn route_write(&self, collection: &str, ts: Timestamp) -> Result<Chunk> {
        if let Some(chunk) = self.catalog.lookup_chunk(collection, ts)? {
            return Ok(chunk);
        }

        match self.resolve_miss(collection, ts) {
            Err(ChunkError::DuplicateRange { existing, .. }) => {
                // lost a race with another creator
                debug!(
                    "Chunk creation for {} at {} collided with chunk {}, re-resolving",
                    collection, ts, existing
                );
                self.resolve_miss(collection, ts)
            }
            result => result,
        }
    }

    /// Chunks that may hold rows in `range`, ordered by start
    pub fn route_read(&self, collection: &str, range: TimeRange) -> Result<Vec<Chunk>> {
        self.catalog.list_chunks(collection, range)
    }

    fn resolve_miss(&self, collection: &str, ts: Timestamp) -> Result<Chunk> {
        self.catalog.with_transition_lock(collection, || {
            if let Some(chunk) = self.catalog.lookup_chunk(collection, ts)? {
                return Ok(chunk);
            }

            let width = self.catalog.collection(collection)?.chunk_width;
            let cell = grid_cell(ts, width)?;
            let aligned = cell.start;
            let (prev, next) = self.catalog.neighbors(collection, ts)?;

            if let Some(open) = prev.as_ref().filter(|c| c.is_open()) {
                // ts lies past the open chunk's nominal range
                let end = open.start.saturating_add(width);
                self.catalog.close_chunk(open.id, end)?;
                return self.catalog.open_chunk(collection, aligned.max(end));
            }

            let floor = prev.and_then(|c| c.end).unwrap_or(Timestamp::MIN);
            match next {
                None => self.catalog.open_chunk(collection, aligned.max(floor)),
                Some(next) => {
                    let start = aligned.max(floor);
                    let end = cell.end.min(next.start);
                    self.catalog.insert_gap_chunk(collection, start, end)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ChunkState, CollectionMeta};
    use crate::config::{DAY, HOUR};

    fn router() -> PartitionRouter {
        let catalog = Arc::new(ChunkCatalog::in_memory());
        catalog
            .register_collection(CollectionMeta::new("trades").with_chunk_width(DAY))
            .unwrap();
        PartitionRouter::new(catalog)
    }

    #[test]
    fn test_first_write_opens_aligned_chunk() {
        let router = router();
        let chunk = router.route_write("trades", 3 * DAY + 5 * HOUR).unwrap();
        assert!(chunk.is_open());
        assert_eq!(chunk.start, 3 * DAY);

        let again = router.route_write("trades", 3 * DAY + 23 * HOUR).unwrap();
        assert_eq!(again.id, chunk.id);
    }

    #[test]
    fn test_rollover_closes_previous() {
        let router = router();
        let day0 = router.route_write("trades", HOUR).unwrap();
        let day1 = router.route_write("trades", DAY + HOUR).unwrap();
        assert_ne!(day0.id, day1.id);

        let closed = router.catalog().chunk(day0.id).unwrap();
        assert_eq!(closed.state, ChunkState::ClosedUncompressed);
        assert_eq!(closed.end, Some(DAY));
        assert_eq!(day1.start, DAY);
    }

    #[test]
    fn test_skipping_days_leaves_hole() {
        let router = router();
        router.route_write("trades", HOUR).unwrap();
        let later = router.route_write("trades", 10 * DAY + HOUR).unwrap();
        assert_eq!(later.start, 10 * DAY);

        let chunks = router.route_read("trades", TimeRange::all()).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].end, Some(DAY));
    }

    #[test]
    fn test_late_write_gets_gap_chunk() {
        let router = router();
        router.route_write("trades", HOUR).unwrap();
        let open = router.route_write("trades", 10 * DAY + HOUR).unwrap();

        let gap = router.route_write("trades", 4 * DAY + HOUR).unwrap();
        assert_eq!(gap.state, ChunkState::ClosedUncompressed);
        assert_eq!((gap.start, gap.end), (4 * DAY, Some(5 * DAY)));
        assert_eq!(router.catalog().current_open("trades").unwrap().unwrap().id, open.id);

        // the gap chunk now owns the whole day
        assert_eq!(router.route_write("trades", 4 * DAY + 20 * HOUR).unwrap().id, gap.id);
    }

    #[test]
    fn test_gap_chunk_clipped_to_neighbors() {
        let catalog = Arc::new(ChunkCatalog::in_memory());
        catalog
            .register_collection(CollectionMeta::new("trades").with_chunk_width(DAY))
            .unwrap();
        let router = PartitionRouter::new(catalog.clone());

        // an existing chunk starting mid-grid
        catalog.insert_gap_chunk("trades", 2 * DAY + 6 * HOUR, 2 * DAY + 12 * HOUR).unwrap();
        catalog.open_chunk("trades", 5 * DAY).unwrap();

        let before = router.route_write("trades", 2 * DAY + HOUR).unwrap();
        assert_eq!((before.start, before.end), (2 * DAY, Some(2 * DAY + 6 * HOUR)));

        let after = router.route_write("trades", 2 * DAY + 13 * HOUR).unwrap();
        assert_eq!((after.start, after.end), (2 * DAY + 12 * HOUR, Some(3 * DAY)));
    }

    #[test]
    fn test_unalignable_timestamp_rejected() {
        let router = router();
        assert!(matches!(
            router.route_write("trades", i64::MIN + 1),
            Err(ChunkError::InvalidFormat(_))
        ));
        assert!(router.route_read("trades", TimeRange::all()).unwrap().is_empty());

        // the partial cell at the top of the timeline has no end bound
        assert!(matches!(
            router.route_write("trades", i64::MAX),
            Err(ChunkError::InvalidFormat(_))
        ));
        let top = i64::MAX - i64::MAX % DAY;
        let last = router.route_write("trades", top - 1).unwrap();
        assert_eq!(last.start, top - DAY);
        assert_eq!(router.route_write("trades", top - DAY).unwrap().id, last.id);
    }

    #[test]
    fn test_unknown_collection() {
        let router = router();
        assert!(matches!(
            router.route_write("quotes", 0),
            Err(ChunkError::CollectionNotFound(_))
        ));
    }

    #[test]
    fn test_concurrent_writers_share_chunk() {
        let router = router();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let router = router.clone();
                std::thread::spawn(move || {
                    router.route_write("trades", 7 * DAY + i * HOUR).unwrap().id
                })
            })
            .collect();
        let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(router.catalog().stats().open_chunks, 1);
    }
}
