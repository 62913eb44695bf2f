//! The coalescer: a pure function over one chunk that folds redundant
//! same-key work into fewer physical statements while preserving per-key
//! ordering and fanning results back out to every original completion.
//!
//! Kept free of any I/O or async; it operates on owned `Op` values and
//! returns a new `Vec<Op>`. The worker is the only caller, once per
//! chunk (see `worker.rs`).

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::entry::Entry;
use crate::error::CacheResult;
use crate::ops::{Op, SelectCompletion, UnitCompletion};

/// Runs the coalescer over one chunk. Returns the chunk unchanged (same
/// order) if it contains a blocking op (one whose correctness depends on
/// seeing the whole table, e.g. `GetAllKeys`/`InvalidateAll`) or has at
/// most one item.
pub fn coalesce(chunk: Vec<Op>) -> Vec<Op> {
    if chunk.len() <= 1 || chunk.iter().any(Op::blocks_coalescing) {
        return chunk;
    }

    // Group by coalescing key, preserving insertion order. `None` is the
    // sentinel "no optimisation" group: ops with no single key to fold on
    // (type-scoped ops, delete-expired, the flush barrier). Everything in
    // it keeps its own FIFO order and is never merged with anything else.
    // The other groups are keyed by the op's coalescing key, each holding
    // that key's ops in FIFO order.
    let mut sentinel: Vec<Op> = Vec::new();
    let mut keyed: Vec<(String, Vec<Op>)> = Vec::new();
    let mut index_of_key: HashMap<String, usize> = HashMap::new();

    for op in chunk {
        match op.coalescing_key() {
            None => sentinel.push(op),
            Some(key) => {
                let key = key.to_string();
                let idx = *index_of_key.entry(key.clone()).or_insert_with(|| {
                    keyed.push((key.clone(), Vec::new()));
                    keyed.len() - 1
                });
                keyed[idx].1.push(op);
            }
        }
    }

    // Intra-key dedup, per group, in fixed kind priority order.
    for (_, group) in keyed.iter_mut() {
        let folded = std::mem::take(group);
        *group = dedup_group(folded);
    }

    // Round-robin drain: each wave takes the first remaining op from
    // every non-empty group, the sentinel stream counting as one more
    // group alongside the keyed ones (rather than being drained only
    // after every keyed group empties out), then fan-out-merges the wave
    // by op kind. This keeps a sentinel op roughly in the wave it
    // originally fell in instead of pushing it past writes that were
    // enqueued after it; within one wave, a merged op (built from
    // several keys) is still emitted before any passthrough op, since a
    // multi-source merge has no single original position to slot into.
    let mut out = Vec::new();
    let mut sentinel = sentinel.into_iter();
    loop {
        let mut wave: Vec<Op> = Vec::new();
        let mut any = false;
        for (_, group) in keyed.iter_mut() {
            if !group.is_empty() {
                any = true;
                wave.push(group.remove(0));
            }
        }
        if let Some(op) = sentinel.next() {
            any = true;
            wave.push(op);
        }
        if !any {
            break;
        }
        out.extend(merge_wave(wave));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_op(key: &str, value: u8) -> (Op, oneshot::Receiver<CacheResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Op::BulkInsert {
                entries: vec![Entry::new(key, vec![value], 0, 0)],
                completion: UnitCompletion::single(tx),
            },
            rx,
        )
    }

    fn select_op(key: &str) -> (Op, oneshot::Receiver<CacheResult<Vec<Entry>>>) {
        let (tx, rx) = oneshot::channel();
        (
            Op::BulkSelectByKey {
                keys: vec![key.to_string()],
                completion: SelectCompletion::single(tx),
            },
            rx,
        )
    }

    #[test]
    fn folds_consecutive_same_key_inserts_then_merges_wave_across_keys() {
        // The intra-key fold collapses the three same-key "a" inserts
        // into a single physical `BulkInsert` op (one run, since they're
        // consecutive and same-kind within the "a" group); the wave drain
        // then merges that with the unrelated "b" insert in the same
        // pass, since `BulkInsert` is one of the fan-outable kinds and
        // the wave merge applies across keys too. The fold doesn't need
        // to drop the superseded "a" values itself: all entries for "a"
        // ride in the same physical statement and `insert_bulk` applies
        // them via replace-on-conflict in order, so the last one (value
        // 3) is what's durably visible after commit regardless of how
        // many entries got folded in.
        let (op1, _rx1) = insert_op("a", 1);
        let (op2, _rx2) = insert_op("a", 2);
        let (op3, _rx3) = insert_op("a", 3);
        let (op4, _rx4) = insert_op("b", 9);
        let result = coalesce(vec![op1, op2, op3, op4]);

        assert_eq!(result.len(), 1);
        match &result[0] {
            Op::BulkInsert { entries, .. } => {
                assert_eq!(entries.len(), 4);
                assert_eq!(entries[0].value, vec![1]);
                assert_eq!(entries[1].value, vec![2]);
                assert_eq!(entries[2].value, vec![3]);
                assert_eq!(entries[3].value, vec![9]);
            }
            other => panic!("expected BulkInsert, got {}", other.kind_name()),
        }
    }

    #[test]
    fn merged_multi_key_select_keeps_every_requested_key() {
        // A single request for keys ["a", "b"] folded together with an
        // unrelated request for "c" must still return both "a" and "b"
        // to the first caller, not just "a" (its first key).
        let (tx1, _rx1) = oneshot::channel();
        let multi = Op::BulkSelectByKey {
            keys: vec!["a".to_string(), "b".to_string()],
            completion: SelectCompletion::single(tx1),
        };
        let (other, _rx2) = select_op("c");
        let result = coalesce(vec![multi, other]);

        assert_eq!(result.len(), 1);
        match &result[0] {
            Op::BulkSelectByKey { keys, .. } => {
                assert!(keys.contains(&"a".to_string()));
                assert!(keys.contains(&"b".to_string()));
                assert!(keys.contains(&"c".to_string()));
            }
            other => panic!("expected BulkSelectByKey, got {}", other.kind_name()),
        }
    }

    #[test]
    fn single_item_chunk_is_unchanged() {
        let (op, _rx) = insert_op("a", 1);
        let result = coalesce(vec![op]);
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn get_all_keys_bypasses_coalescing() {
        let (tx, _rx) = oneshot::channel();
        let get_all = Op::GetAllKeys { completion: tx };
        let (insert, _rx2) = insert_op("x", 1);
        let chunk = vec![insert, get_all];
        let result = coalesce(chunk);
        assert_eq!(result.len(), 2, "chunk with GetAllKeys returned unchanged");
    }

    #[test]
    fn invalidate_then_insert_on_same_key_is_a_barrier() {
        let (tx, _rx) = oneshot::channel();
        let invalidate = Op::BulkInvalidateByKey {
            keys: vec!["a".to_string()],
            completion: UnitCompletion::single(tx),
        };
        let (insert, _rx2) = insert_op("a", 1);
        let (select, _rx3) = select_op("a");
        let result = coalesce(vec![invalidate, insert, select]);
        assert_eq!(
            result.len(),
            3,
            "distinct op kinds in a single-key group are not folded together"
        );
    }
}

/// Fold consecutive same-kind ops within a single key's group, for each
/// of `BulkInvalidateByKey`, `BulkInsert`, `BulkSelectByKey` in that
/// fixed priority order. A non-matching op breaks the run (acts as a
/// barrier).
fn dedup_group(group: Vec<Op>) -> Vec<Op> {
    const PRIORITY: [&str; 3] = ["BulkInvalidateByKey", "BulkInsert", "BulkSelectByKey"];

    let mut result = group;
    for kind in PRIORITY {
        result = fold_runs(result, kind);
    }
    result
}

fn fold_runs(ops: Vec<Op>, kind: &str) -> Vec<Op> {
    let mut out: Vec<Op> = Vec::new();
    let mut run: Vec<Op> = Vec::new();

    let flush_run = |run: &mut Vec<Op>, out: &mut Vec<Op>| {
        if run.is_empty() {
            return;
        }
        let folded = std::mem::take(run);
        out.push(merge_same_kind(folded));
    };

    for op in ops {
        if op.kind_name() == kind {
            run.push(op);
        } else {
            flush_run(&mut run, &mut out);
            out.push(op);
        }
    }
    flush_run(&mut run, &mut out);
    out
}

/// Merges a run of one or more same-kind ops (all drawn from the same
/// key's group, so same op kind by construction) into a single op. With
/// one element this degenerates to returning it unchanged.
fn merge_same_kind(run: Vec<Op>) -> Op {
    if run.len() == 1 {
        return run.into_iter().next().unwrap();
    }
    merge_wave(run)
        .into_iter()
        .next()
        .expect("a non-empty same-kind run always yields exactly one merged op")
}

/// Groups one wave (one op taken from each non-empty group) by op kind
/// and merges the three fan-outable kinds. Other kinds in the wave pass
/// through unchanged, in their original relative order within the wave.
fn merge_wave(wave: Vec<Op>) -> Vec<Op> {
    let mut select_parts: Vec<(Vec<String>, oneshot::Sender<CacheResult<Vec<Entry>>>)> =
        Vec::new();
    let mut insert_entries: Vec<Entry> = Vec::new();
    let mut insert_completions: Vec<oneshot::Sender<CacheResult<()>>> = Vec::new();
    let mut invalidate_keys: Vec<String> = Vec::new();
    let mut invalidate_completions: Vec<oneshot::Sender<CacheResult<()>>> = Vec::new();
    let mut passthrough: Vec<Op> = Vec::new();

    for op in wave {
        match op {
            Op::BulkSelectByKey { keys, completion } => {
                select_parts.extend(completion.into_parts(&keys));
            }
            Op::BulkInsert { entries, completion } => {
                insert_entries.extend(entries);
                insert_completions.extend(completion.into_parts());
            }
            Op::BulkInvalidateByKey { keys, completion } => {
                invalidate_keys.extend(keys);
                invalidate_completions.extend(completion.into_parts());
            }
            other => passthrough.push(other),
        }
    }

    let mut out = Vec::with_capacity(passthrough.len() + 3);
    if !select_parts.is_empty() {
        let mut seen = std::collections::HashSet::new();
        let mut keys: Vec<String> = Vec::new();
        for (own_keys, _) in &select_parts {
            for key in own_keys {
                if seen.insert(key.clone()) {
                    keys.push(key.clone());
                }
            }
        }
        out.push(Op::BulkSelectByKey {
            keys,
            completion: SelectCompletion::merge(select_parts),
        });
    }
    if !insert_entries.is_empty() {
        out.push(Op::BulkInsert {
            entries: insert_entries,
            completion: UnitCompletion::merge(insert_completions),
        });
    }
    if !invalidate_keys.is_empty() {
        out.push(Op::BulkInvalidateByKey {
            keys: invalidate_keys,
            completion: UnitCompletion::merge(invalidate_completions),
        });
    }
    out.extend(passthrough);
    out
}
