//! Request items and their completions.
//!
//! `Op` is a tagged sum, one variant per `OpKind`, one completion type
//! per variant; dispatch is exhaustive pattern matching (see
//! `worker::execute_item`). There are no `Any`/downcast sites in this
//! crate.

use tokio::sync::oneshot;

use crate::entry::Entry;
use crate::error::CacheResult;

/// A completion shared by `n` original requests that the coalescer folded
/// into one physical select. Built once the coalescer decides to merge;
/// a request that was never merged carries `One`. Each `Many` entry keeps
/// the full key list its original request asked for (not just one key),
/// so a multi-key `enqueue_select` still gets every one of its rows back
/// even after folding with unrelated requests.
pub enum SelectCompletion {
    One(oneshot::Sender<CacheResult<Vec<Entry>>>),
    Many(Vec<(Vec<String>, oneshot::Sender<CacheResult<Vec<Entry>>>)>),
}

/// A completion shared by `n` original write requests (insert or
/// invalidate-by-key) folded into one physical statement. All originals
/// see the same outcome.
pub enum UnitCompletion {
    One(oneshot::Sender<CacheResult<()>>),
    Many(Vec<oneshot::Sender<CacheResult<()>>>),
}

impl SelectCompletion {
    pub fn single(sender: oneshot::Sender<CacheResult<Vec<Entry>>>) -> Self {
        SelectCompletion::One(sender)
    }

    /// Flattens into `(keys, sender)` pairs. `own_keys` is the full key
    /// list carried by the enclosing `Op::BulkSelectByKey` and is only
    /// consulted for the `One` variant (a `Many` completion already
    /// carries its own per-original key lists from an earlier merge).
    pub fn into_parts(
        self,
        own_keys: &[String],
    ) -> Vec<(Vec<String>, oneshot::Sender<CacheResult<Vec<Entry>>>)> {
        match self {
            SelectCompletion::One(tx) => vec![(own_keys.to_vec(), tx)],
            SelectCompletion::Many(parts) => parts,
        }
    }

    /// Merge a batch of select completions into one. Panics if `parts` is
    /// empty; the coalescer never calls this with an empty group.
    pub fn merge(parts: Vec<(Vec<String>, oneshot::Sender<CacheResult<Vec<Entry>>>)>) -> Self {
        assert!(!parts.is_empty(), "cannot merge zero select completions");
        SelectCompletion::Many(parts)
    }

    /// Deliver the physical select's result map to every original
    /// subscriber, addressing each by its own key list.
    pub fn resolve_ok(self, rows_by_key: std::collections::HashMap<String, Entry>) {
        match self {
            SelectCompletion::One(tx) => {
                let rows = rows_by_key.into_values().collect();
                let _ = tx.send(Ok(rows));
            }
            SelectCompletion::Many(parts) => {
                for (keys, tx) in parts {
                    let rows = keys
                        .iter()
                        .filter_map(|k| rows_by_key.get(k).cloned())
                        .collect();
                    let _ = tx.send(Ok(rows));
                }
            }
        }
    }

    pub fn resolve_err(self, error: CacheResult<Vec<Entry>>) {
        let error = error.expect_err("resolve_err called with an Ok result");
        match self {
            SelectCompletion::One(tx) => {
                let _ = tx.send(Err(error));
            }
            SelectCompletion::Many(parts) => {
                for (_, tx) in parts {
                    let _ = tx.send(Err(error.clone()));
                }
            }
        }
    }
}

impl UnitCompletion {
    pub fn single(sender: oneshot::Sender<CacheResult<()>>) -> Self {
        UnitCompletion::One(sender)
    }

    pub fn into_parts(self) -> Vec<oneshot::Sender<CacheResult<()>>> {
        match self {
            UnitCompletion::One(tx) => vec![tx],
            UnitCompletion::Many(parts) => parts,
        }
    }

    pub fn merge(parts: Vec<oneshot::Sender<CacheResult<()>>>) -> Self {
        assert!(!parts.is_empty(), "cannot merge zero unit completions");
        UnitCompletion::Many(parts)
    }

    pub fn resolve(self, result: CacheResult<()>) {
        match self {
            UnitCompletion::One(tx) => {
                let _ = tx.send(result);
            }
            UnitCompletion::Many(parts) => {
                for tx in parts {
                    let _ = tx.send(result.clone());
                }
            }
        }
    }
}

/// The closed set of request kinds, each carrying its own params and
/// completion. `DoNothing` is the flush barrier.
pub enum Op {
    BulkSelectByKey {
        keys: Vec<String>,
        completion: SelectCompletion,
    },
    BulkSelectByType {
        type_names: Vec<String>,
        completion: oneshot::Sender<CacheResult<Vec<Entry>>>,
    },
    BulkInsert {
        entries: Vec<Entry>,
        completion: UnitCompletion,
    },
    BulkInvalidateByKey {
        keys: Vec<String>,
        completion: UnitCompletion,
    },
    BulkInvalidateByType {
        type_names: Vec<String>,
        completion: oneshot::Sender<CacheResult<()>>,
    },
    InvalidateAll {
        completion: oneshot::Sender<CacheResult<()>>,
    },
    GetAllKeys {
        completion: oneshot::Sender<CacheResult<Vec<String>>>,
    },
    Vacuum {
        completion: oneshot::Sender<CacheResult<()>>,
    },
    DeleteExpired {
        completion: oneshot::Sender<CacheResult<()>>,
    },
    DoNothing {
        completion: oneshot::Sender<CacheResult<()>>,
    },
}

impl Op {
    /// The coalescing key: `Some` for the three fan-outable, by-key
    /// kinds, `None` (the sentinel) for everything else. Relies on the
    /// façade's invariant that one enqueued item carries exactly one
    /// logical key for these three kinds.
    pub fn coalescing_key(&self) -> Option<&str> {
        match self {
            Op::BulkSelectByKey { keys, .. } | Op::BulkInvalidateByKey { keys, .. } => {
                keys.first().map(String::as_str)
            }
            Op::BulkInsert { entries, .. } => entries.first().map(|e| e.key.as_str()),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Op::BulkSelectByKey { .. } => "BulkSelectByKey",
            Op::BulkSelectByType { .. } => "BulkSelectByType",
            Op::BulkInsert { .. } => "BulkInsert",
            Op::BulkInvalidateByKey { .. } => "BulkInvalidateByKey",
            Op::BulkInvalidateByType { .. } => "BulkInvalidateByType",
            Op::InvalidateAll { .. } => "InvalidateAll",
            Op::GetAllKeys { .. } => "GetAllKeys",
            Op::Vacuum { .. } => "Vacuum",
            Op::DeleteExpired { .. } => "DeleteExpired",
            Op::DoNothing { .. } => "DoNothing",
        }
    }

    /// Bypasses the coalescer: these two kinds have order-sensitive
    /// semantics it isn't smart enough to preserve.
    pub fn blocks_coalescing(&self) -> bool {
        matches!(self, Op::GetAllKeys { .. } | Op::InvalidateAll { .. })
    }

    /// Fail this request's completion immediately, without ever reaching
    /// the database. Used for `Disposed` and for chunk-terminal errors
    /// that apply uniformly regardless of op kind.
    pub fn fail(self, error: CacheResult<()>) {
        let error = error.expect_err("Op::fail called with an Ok result");
        match self {
            Op::BulkSelectByKey { completion, .. } => completion.resolve_err(Err(error)),
            Op::BulkSelectByType { completion, .. } => {
                let _ = completion.send(Err(error));
            }
            Op::BulkInsert { completion, .. } => completion.resolve(Err(error)),
            Op::BulkInvalidateByKey { completion, .. } => completion.resolve(Err(error)),
            Op::BulkInvalidateByType { completion, .. } => {
                let _ = completion.send(Err(error));
            }
            Op::InvalidateAll { completion } => {
                let _ = completion.send(Err(error));
            }
            Op::GetAllKeys { completion } => {
                let _ = completion.send(Err(error));
            }
            Op::Vacuum { completion } => {
                let _ = completion.send(Err(error));
            }
            Op::DeleteExpired { completion } => {
                let _ = completion.send(Err(error));
            }
            Op::DoNothing { completion } => {
                let _ = completion.send(Err(error));
            }
        }
    }
}
