//! Introspection counters, cheap enough to update unconditionally on
//! every chunk: items processed, chunks committed/aborted, last vacuum
//! tick. Readable as a point-in-time snapshot via `QueueStats::snapshot`.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct Counters {
    items_processed: AtomicU64,
    chunks_committed: AtomicU64,
    chunks_aborted: AtomicU64,
    last_vacuum_tick: AtomicI64,
}

/// A cheap `Arc`-shared handle; the worker updates it in place, callers
/// read a point-in-time snapshot via `QueueStats::snapshot`.
#[derive(Clone, Default)]
pub struct QueueStats(Arc<Counters>);

/// An immutable point-in-time read of `QueueStats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub items_processed: u64,
    pub chunks_committed: u64,
    pub chunks_aborted: u64,
    pub last_vacuum_tick: i64,
}

impl QueueStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_commit(&self, items_in_chunk: u64) {
        self.0
            .items_processed
            .fetch_add(items_in_chunk, Ordering::Relaxed);
        self.0.chunks_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_abort(&self) {
        self.0.chunks_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_vacuum(&self, tick: i64) {
        self.0.last_vacuum_tick.store(tick, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            items_processed: self.0.items_processed.load(Ordering::Relaxed),
            chunks_committed: self.0.chunks_committed.load(Ordering::Relaxed),
            chunks_aborted: self.0.chunks_aborted.load(Ordering::Relaxed),
            last_vacuum_tick: self.0.last_vacuum_tick.load(Ordering::Relaxed),
        }
    }
}
