//! The queue worker: a single long-running task, the exclusive owner of
//! the database connection, draining the queue in
//! `Idle -> Filling -> Processing -> Committed/Aborted` cycles.
//!
//! One `loop { select! { ... } }` owned by a single spawned task,
//! `tracing` at the transitions that matter, cooperative shutdown
//! observed only at a safe boundary rather than mid-work.

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, instrument, warn};

use crate::clock::Clock;
use crate::coalesce::coalesce;
use crate::config::CacheConfig;
use crate::entry::Entry;
use crate::error::CacheError;
use crate::flush::FlushLock;
use crate::ops::Op;
use crate::stats::QueueStats;
use crate::{statements, vacuum};

/// A completion already executed but awaiting the chunk's commit
/// outcome: every completion resolves exactly once, after COMMIT is
/// known, trading latency for simpler signalling.
type PendingFinalizer = Box<dyn FnOnce(Result<(), CacheError>) + Send>;

pub struct Worker {
    conn: Connection,
    clock: Arc<dyn Clock>,
    flush_lock: FlushLock,
    stats: QueueStats,
    chunk_size: usize,
}

impl Worker {
    pub fn new(
        conn: Connection,
        clock: Arc<dyn Clock>,
        flush_lock: FlushLock,
        stats: QueueStats,
        config: &CacheConfig,
    ) -> Self {
        Self {
            conn,
            clock,
            flush_lock,
            stats,
            chunk_size: config.chunk_size,
        }
    }

    /// The main loop. Returns once `rx` is closed and fully drained,
    /// which happens when every `QueueHandle` clone has been dropped or
    /// `QueueHandle::dispose` closed the receiver explicitly.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Op>, shutdown: Arc<Notify>) {
        // An item pulled one cycle ahead of its turn (only ever a
        // `Vacuum`, see the filling loop below) carries over here so it
        // isn't dropped.
        let mut carry: Option<Op> = None;

        loop {
            let first = match carry.take() {
                Some(op) => op,
                None => {
                    let next = tokio::select! {
                        biased;
                        _ = shutdown.notified() => {
                            debug!("worker observed shutdown signal, closing queue");
                            rx.close();
                            rx.try_recv().ok()
                        }
                        maybe_op = rx.recv() => maybe_op,
                    };
                    match next {
                        Some(op) => op,
                        None => break,
                    }
                }
            };

            if matches!(first, Op::Vacuum { .. }) {
                let Op::Vacuum { completion } = first else {
                    unreachable!()
                };
                let result = vacuum::run_vacuum_cycle(
                    &self.conn,
                    &self.flush_lock,
                    self.clock.as_ref(),
                    &self.stats,
                )
                .await;
                let _ = completion.send(result);
                continue;
            }

            let mut chunk = vec![first];
            while chunk.len() < self.chunk_size {
                match rx.try_recv() {
                    Ok(op) if matches!(op, Op::Vacuum { .. }) => {
                        // Leave it for the next cycle so it always runs
                        // alone, never folded into a BEGIN/COMMIT chunk.
                        carry = Some(op);
                        break;
                    }
                    Ok(op) => chunk.push(op),
                    Err(_) => break,
                }
            }

            // BEGIN failures are retried in place: nothing in the chunk
            // was applied, and the whole (already-coalesced) chunk
            // goes back for another attempt on the same worker task
            // rather than through the bounded mpsc channel it reads
            // from, which would risk a self-deadlock if that channel
            // were already full.
            let mut to_process = chunk;
            loop {
                match self.process_chunk(to_process).await {
                    ChunkOutcome::Done => break,
                    ChunkOutcome::RetryBegin(c) => {
                        tokio::task::yield_now().await;
                        to_process = c;
                    }
                }
            }
        }
        debug!("worker loop exiting, queue closed and drained");
    }

    #[instrument(skip(self, chunk), fields(chunk_len = chunk.len()))]
    async fn process_chunk(&mut self, chunk: Vec<Op>) -> ChunkOutcome {
        let guard = self.flush_lock.inner().lock().await;
        let chunk_len = chunk.len() as u64;
        let coalesced = coalesce(chunk);

        if let Err(e) = statements::begin(&self.conn) {
            warn!(error = %e, "BEGIN failed, re-enqueueing chunk for retry");
            self.stats.record_abort();
            drop(guard);
            return ChunkOutcome::RetryBegin(coalesced);
        }

        let mut pending: Vec<PendingFinalizer> = Vec::with_capacity(coalesced.len());
        let now = self.clock.now_tick();
        for op in coalesced {
            match execute_item(&self.conn, op, now) {
                ItemOutcome::Immediate => {}
                ItemOutcome::Pending(finalizer) => pending.push(finalizer),
            }
        }

        match statements::commit(&self.conn) {
            Ok(()) => {
                for finalizer in pending {
                    finalizer(Ok(()));
                }
                self.stats.record_commit(chunk_len);
            }
            Err(e) => {
                error!(error = %e, "COMMIT failed, rolling back chunk");
                let _ = statements::rollback(&self.conn);
                let commit_err = CacheError::CommitFailed(e.to_string());
                for finalizer in pending {
                    finalizer(Err(commit_err.clone()));
                }
                self.stats.record_abort();
            }
        }
        drop(guard);
        ChunkOutcome::Done
    }
}

enum ChunkOutcome {
    Done,
    RetryBegin(Vec<Op>),
}

enum ItemOutcome {
    Immediate,
    Pending(PendingFinalizer),
}

/// Executes one item's prepared statement and returns how its completion
/// should be finalized. A failure here is terminal immediately (commit
/// cannot un-fail a statement that already errored); a success is
/// deferred until the chunk's commit outcome is known.
fn execute_item(conn: &Connection, op: Op, now: i64) -> ItemOutcome {
    match op {
        Op::BulkSelectByKey { keys, completion } => {
            match statements::select_by_key(conn, &keys, now) {
                Ok(rows) => {
                    let by_key: HashMap<String, Entry> =
                        rows.into_iter().map(|e| (e.key.clone(), e)).collect();
                    ItemOutcome::Pending(Box::new(move |commit| match commit {
                        Ok(()) => completion.resolve_ok(by_key),
                        Err(e) => completion.resolve_err(Err(e)),
                    }))
                }
                Err(e) => {
                    completion.resolve_err(Err(e));
                    ItemOutcome::Immediate
                }
            }
        }
        Op::BulkSelectByType {
            type_names,
            completion,
        } => match statements::select_by_type(conn, &type_names, now) {
            Ok(rows) => ItemOutcome::Pending(Box::new(move |commit| {
                let _ = completion.send(commit.map(|()| rows));
            })),
            Err(e) => {
                let _ = completion.send(Err(e));
                ItemOutcome::Immediate
            }
        },
        Op::BulkInsert {
            entries,
            completion,
        } => match statements::insert_bulk(conn, &entries) {
            Ok(()) => ItemOutcome::Pending(Box::new(move |commit| completion.resolve(commit))),
            Err(e) => {
                completion.resolve(Err(e));
                ItemOutcome::Immediate
            }
        },
        Op::BulkInvalidateByKey { keys, completion } => {
            match statements::invalidate_by_key(conn, &keys) {
                Ok(()) => {
                    ItemOutcome::Pending(Box::new(move |commit| completion.resolve(commit)))
                }
                Err(e) => {
                    completion.resolve(Err(e));
                    ItemOutcome::Immediate
                }
            }
        }
        Op::BulkInvalidateByType {
            type_names,
            completion,
        } => match statements::invalidate_by_type(conn, &type_names) {
            Ok(()) => ItemOutcome::Pending(Box::new(move |commit| {
                let _ = completion.send(commit);
            })),
            Err(e) => {
                let _ = completion.send(Err(e));
                ItemOutcome::Immediate
            }
        },
        Op::InvalidateAll { completion } => match statements::invalidate_all(conn) {
            Ok(()) => ItemOutcome::Pending(Box::new(move |commit| {
                let _ = completion.send(commit);
            })),
            Err(e) => {
                let _ = completion.send(Err(e));
                ItemOutcome::Immediate
            }
        },
        Op::GetAllKeys { completion } => match statements::get_all_keys(conn, now) {
            Ok(keys) => ItemOutcome::Pending(Box::new(move |commit| {
                let _ = completion.send(commit.map(|()| keys));
            })),
            Err(e) => {
                let _ = completion.send(Err(e));
                ItemOutcome::Immediate
            }
        },
        Op::DeleteExpired { completion } => match statements::delete_expired(conn, now) {
            Ok(()) => ItemOutcome::Pending(Box::new(move |commit| {
                let _ = completion.send(commit);
            })),
            Err(e) => {
                let _ = completion.send(Err(e));
                ItemOutcome::Immediate
            }
        },
        Op::DoNothing { completion } => {
            ItemOutcome::Pending(Box::new(move |commit| {
                let _ = completion.send(commit);
            }))
        }
        Op::Vacuum { completion } => {
            // Never reached: the worker's filling loop always isolates
            // `Vacuum` into its own single-item cycle before handing
            // anything to `execute_item`.
            let _ = completion.send(Err(CacheError::UnknownOp(
                "Vacuum dispatched through the normal chunk path".into(),
            )));
            ItemOutcome::Immediate
        }
    }
}
