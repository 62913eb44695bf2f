// Raiko
// Copyright (c) 2024 Taiko Labs
// Licensed and distributed under either of
//   * MIT license (license terms in the root directory or at http://opensource.org/licenses/MIT).
//   * Apache v2 license (license terms in the root directory or at http://www.apache.org/licenses/LICENSE-2.0).
// at your option. This file may not be copied, modified, or distributed except according to those terms.

//! A persistent key/value blob cache backed by a single embedded SQLite
//! connection.
//!
//! Producers call the `enqueue_*` methods on [`OperationQueue`] from as
//! many threads or tasks as they like; every request lands on one bounded
//! channel and is executed, coalesced and batched, by a single worker
//! task that owns the connection exclusively. See [`worker`] for the
//! state machine and [`coalesce`] for the batching rules.

pub mod clock;
pub mod coalesce;
pub mod config;
pub mod db;
pub mod entry;
pub mod error;
pub mod ops;
mod flush;
mod stats;
mod statements;
mod vacuum;
mod worker;

use std::path::Path;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Notify};
use tracing::info;

pub use clock::{Clock, FakeClock, SystemClock};
pub use config::CacheConfig;
pub use entry::Entry;
pub use error::{CacheError, CacheResult};
pub use stats::{QueueStats, StatsSnapshot};

use flush::FlushLock;
use ops::{Op, SelectCompletion, UnitCompletion};
use worker::Worker;

/// A running operation queue: one bounded MPSC sender shared by all
/// producers, plus a shutdown signal and an introspection handle. Cheap
/// to clone; every clone shares the same underlying worker.
#[derive(Clone)]
pub struct OperationQueue {
    sender: mpsc::Sender<Op>,
    shutdown: Arc<Notify>,
    stats: QueueStats,
    worker_handle: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl OperationQueue {
    /// Opens (or creates) the database at `path` and spawns the worker
    /// task. The returned queue is immediately usable; dropping every
    /// clone of it (or calling [`OperationQueue::dispose`]) lets the
    /// worker finish its current chunk, drain whatever remains, and
    /// exit.
    pub fn start(path: &Path, clock: Arc<dyn Clock>, config: CacheConfig) -> CacheResult<Self> {
        let conn = db::open_or_create(path)?;
        Self::spawn(conn, clock, config)
    }

    /// Same as [`OperationQueue::start`] but against an in-memory
    /// database; used by tests and by callers that don't need
    /// durability across restarts.
    pub fn start_in_memory(clock: Arc<dyn Clock>, config: CacheConfig) -> CacheResult<Self> {
        let conn = db::open_in_memory()?;
        Self::spawn(conn, clock, config)
    }

    fn spawn(
        conn: rusqlite::Connection,
        clock: Arc<dyn Clock>,
        config: CacheConfig,
    ) -> CacheResult<Self> {
        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let shutdown = Arc::new(Notify::new());
        let stats = QueueStats::new();
        let flush_lock = FlushLock::new();

        let worker = Worker::new(conn, clock, flush_lock, stats.clone(), &config);
        let worker_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move {
            worker.run(receiver, worker_shutdown).await;
            info!("operation queue worker exited");
        });

        Ok(Self {
            sender,
            shutdown,
            stats,
            worker_handle: Arc::new(tokio::sync::Mutex::new(Some(handle))),
        })
    }

    /// `enqueue_select(keys) -> completion<sequence<entry>>`. Entries
    /// whose `Expiration` has passed are filtered out.
    pub async fn enqueue_select(&self, keys: Vec<String>) -> CacheResult<Vec<Entry>> {
        let (tx, rx) = oneshot::channel();
        self.send(Op::BulkSelectByKey {
            keys,
            completion: SelectCompletion::single(tx),
        })
        .await?;
        rx.await.map_err(|_| CacheError::Disposed)?
    }

    pub async fn enqueue_select_by_type(&self, type_names: Vec<String>) -> CacheResult<Vec<Entry>> {
        let (tx, rx) = oneshot::channel();
        self.send(Op::BulkSelectByType {
            type_names,
            completion: tx,
        })
        .await?;
        rx.await.map_err(|_| CacheError::Disposed)?
    }

    pub async fn enqueue_insert(&self, entries: Vec<Entry>) -> CacheResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Op::BulkInsert {
            entries,
            completion: UnitCompletion::single(tx),
        })
        .await?;
        rx.await.map_err(|_| CacheError::Disposed)?
    }

    pub async fn enqueue_invalidate(&self, keys: Vec<String>) -> CacheResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Op::BulkInvalidateByKey {
            keys,
            completion: UnitCompletion::single(tx),
        })
        .await?;
        rx.await.map_err(|_| CacheError::Disposed)?
    }

    pub async fn enqueue_invalidate_by_type(&self, type_names: Vec<String>) -> CacheResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Op::BulkInvalidateByType {
            type_names,
            completion: tx,
        })
        .await?;
        rx.await.map_err(|_| CacheError::Disposed)?
    }

    pub async fn enqueue_invalidate_all(&self) -> CacheResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Op::InvalidateAll { completion: tx }).await?;
        rx.await.map_err(|_| CacheError::Disposed)?
    }

    /// Only keys whose `Expiration` has not yet passed.
    pub async fn enqueue_get_all_keys(&self) -> CacheResult<Vec<String>> {
        let (tx, rx) = oneshot::channel();
        self.send(Op::GetAllKeys { completion: tx }).await?;
        rx.await.map_err(|_| CacheError::Disposed)?
    }

    /// Removes every row whose `Expiration` has passed, inside the
    /// normal per-chunk transaction (unlike [`OperationQueue::enqueue_vacuum`],
    /// which runs its own delete-expired outside any chunk).
    pub async fn enqueue_delete_expired(&self) -> CacheResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Op::DeleteExpired { completion: tx }).await?;
        rx.await.map_err(|_| CacheError::Disposed)?
    }

    /// Runs delete-expired then `VACUUM`, both outside the normal
    /// per-chunk transaction.
    pub async fn enqueue_vacuum(&self) -> CacheResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Op::Vacuum { completion: tx }).await?;
        rx.await.map_err(|_| CacheError::Disposed)?
    }

    /// Returns once every request enqueued before this call has
    /// committed or errored.
    pub async fn enqueue_flush(&self) -> CacheResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Op::DoNothing { completion: tx }).await?;
        rx.await.map_err(|_| CacheError::Disposed)?
    }

    /// A point-in-time snapshot of worker counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Cooperative shutdown: the worker stops taking new items, finishes
    /// whatever is already queued, then exits. Requests enqueued after
    /// this call may be observed or may fail with
    /// [`CacheError::Disposed`], depending on the race.
    pub fn dispose(&self) {
        self.shutdown.notify_one();
    }

    /// Like [`OperationQueue::dispose`], but waits for the worker task to
    /// actually finish draining and exit before returning. Safe to call
    /// from more than one clone concurrently; only the first call joins
    /// the task, later calls see `None` and return immediately.
    pub async fn shutdown(&self) -> CacheResult<()> {
        self.shutdown.notify_one();
        let mut slot = self.worker_handle.lock().await;
        if let Some(handle) = slot.take() {
            handle.await.map_err(|e| CacheError::ItemExecutionFailed(e.to_string()))?;
        }
        Ok(())
    }

    async fn send(&self, op: Op) -> CacheResult<()> {
        self.sender.send(op).await.map_err(|_| CacheError::Disposed)
    }
}
