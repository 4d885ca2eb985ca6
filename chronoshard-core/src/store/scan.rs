//! Lazy range scan

use super::{RowPredicate, RowStore};
use crate::{ChunkId, Result, Row};
use std::sync::Arc;

/// Iterator over the rows of a list of chunks.
///
/// Loads one chunk at a time, in the order given. Chunks are disjoint and
/// time-ordered and rows within a chunk are key-ordered, so rows come out
/// in time order. A scan can be restarted from the beginning at any point.
pub struct RowScan {
    store: Arc<dyn RowStore>,
    collection: String,
    chunks: Vec<ChunkId>,
    predicate: Option<RowPredicate>,
    next_chunk: usize,
    buffer: std::vec::IntoIter<Row>,
    failed: bool,
}

impl RowScan {
    pub fn new(
        store: Arc<dyn RowStore>,
        collection: impl Into<String>,
        chunks: Vec<ChunkId>,
        predicate: Option<RowPredicate>,
    ) -> Self {
        Self {
            store,
            collection: collection.into(),
            chunks,
            predicate,
            next_chunk: 0,
            buffer: Vec::new().into_iter(),
            failed: false,
        }
    }

    /// Scan over nothing
    pub fn empty(store: Arc<dyn RowStore>, collection: impl Into<String>) -> Self {
        Self::new(store, collection, Vec::new(), None)
    }

    /// Chunks this scan visits
    pub fn chunk_ids(&self) -> &[ChunkId] {
        &self.chunks
    }

    /// A fresh scan over the same chunks and predicate
    pub fn restart(&self) -> RowScan {
        Self::new(
            self.store.clone(),
            self.collection.clone(),
            self.chunks.clone(),
            self.predicate.clone(),
        )
    }

    /// Drain the scan into a vector, stopping at the first error
    pub fn collect_rows(self) -> Result<Vec<Row>> {
        self.collect()
    }
}

impl Iterator for RowScan {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            for row in self.buffer.by_ref() {
                if self.predicate.as_ref().map_or(true, |keep| keep(&row)) {
                    return Some(Ok(row));
                }
            }

            if self.failed || self.next_chunk >= self.chunks.len() {
                return None;
            }
            let chunk = self.chunks[self.next_chunk];
            self.next_chunk += 1;

            match self.store.scan_chunk(&self.collection, chunk) {
                Ok(snapshot) => self.buffer = snapshot.rows.into_iter(),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

impl std::fmt::Debug for RowScan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowScan")
            .field("collection", &self.collection)
            .field("chunks", &self.chunks)
            .field("next_chunk", &self.next_chunk)
            .finish()
    }
}
