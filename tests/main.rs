// Raiko
// Copyright (c) 2024 Taiko Labs
// Licensed and distributed under either of
//   * MIT license (license terms in the root directory or at http://opensource.org/licenses/MIT).
//   * Apache v2 license (license terms in the root directory or at http://www.apache.org/licenses/LICENSE-2.0).
// at your option. This file may not be copied, modified, or distributed except according to those terms.

//! End-to-end scenarios against a running [`OperationQueue`]. A BEGIN
//! failure under contention and a COMMIT failure mid-chunk aren't
//! exercised here: the worker owns a real `rusqlite::Connection`
//! directly rather than through an injectable trait, so there's no seam
//! to force either failure without a fake SQL driver. Both paths are
//! reviewed by hand against `worker::process_chunk`'s `BEGIN`/`COMMIT`
//! error arms; see DESIGN.md.

use std::sync::Arc;

use blobcache_opqueue::{CacheConfig, CacheError, Entry, FakeClock, OperationQueue};

/// Installs a `tracing` subscriber so worker/coalescer events show up
/// under `cargo test -- --nocapture`. Never called by the library
/// itself, only by this test binary.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn start(chunk_size: usize) -> (OperationQueue, Arc<FakeClock>) {
    let clock = Arc::new(FakeClock::new(0));
    let config = CacheConfig {
        chunk_size,
        ..CacheConfig::default()
    };
    let queue = OperationQueue::start_in_memory(clock.clone(), config).unwrap();
    (queue, clock)
}

#[tokio::test]
async fn insert_then_select_round_trip() {
    let (queue, _clock) = start(64);
    queue
        .enqueue_insert(vec![Entry::new("a", vec![1, 2, 3], 3_600_000, 0)])
        .await
        .unwrap();
    let rows = queue.enqueue_select(vec!["a".to_string()]).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].value, vec![1, 2, 3]);
}

#[tokio::test]
async fn coalesced_concurrent_inserts_leave_exactly_one_winner() {
    let (queue, _clock) = start(64);
    let insert_a = |value: Vec<u8>| {
        let queue = queue.clone();
        async move {
            queue
                .enqueue_insert(vec![Entry::new("a", value, 1_000, 0)])
                .await
        }
    };
    let (r1, r2, r3) = tokio::join!(insert_a(vec![1]), insert_a(vec![2]), insert_a(vec![3]));
    r1.unwrap();
    r2.unwrap();
    r3.unwrap();

    let rows = queue.enqueue_select(vec!["a".to_string()]).await.unwrap();
    assert_eq!(rows.len(), 1);
    // The three concurrent inserts may reach the channel in any order;
    // replace-on-conflict guarantees exactly one of them wins, never a
    // mix or a duplicate row.
    assert!(
        [vec![1], vec![2], vec![3]].contains(&rows[0].value),
        "unexpected value {:?}",
        rows[0].value
    );
}

#[tokio::test]
async fn expired_row_invisible_to_select() {
    let (queue, _clock) = start(64);
    queue
        .enqueue_insert(vec![Entry::new("a", vec![1], -1, 0)])
        .await
        .unwrap();
    let rows = queue.enqueue_select(vec!["a".to_string()]).await.unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn hundred_inserts_span_two_chunks() {
    let (queue, _clock) = start(64);
    let mut handles = Vec::new();
    for i in 0..100 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            queue
                .enqueue_insert(vec![Entry::new(format!("k{i}"), vec![i as u8], 1_000, 0)])
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let mut keys = queue.enqueue_get_all_keys().await.unwrap();
    keys.sort();
    assert_eq!(keys.len(), 100);

    let stats = queue.stats();
    assert_eq!(stats.items_processed, 100);
    assert!(
        stats.chunks_committed >= 2,
        "100 items at ChunkSize=64 needs at least two chunks"
    );
}

#[tokio::test]
async fn insert_then_invalidate_then_select() {
    let (queue, _clock) = start(64);
    queue
        .enqueue_insert(vec![Entry::new("a", vec![1], 1_000, 0)])
        .await
        .unwrap();
    queue
        .enqueue_invalidate(vec!["a".to_string()])
        .await
        .unwrap();
    let rows = queue.enqueue_select(vec!["a".to_string()]).await.unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn get_all_keys_bypasses_coalescer_but_never_returns_garbage() {
    let (queue, _clock) = start(64);
    let insert = queue.enqueue_insert(vec![Entry::new("x", vec![1], 1_000, 0)]);
    let keys = queue.enqueue_get_all_keys();
    let (insert_result, keys_result) = tokio::join!(insert, keys);
    insert_result.unwrap();
    let keys = keys_result.unwrap();
    // Either interleaving is legal; the only thing that must never
    // happen is a key that was never inserted, or one inserted-but-
    // already-expired, showing up.
    for key in &keys {
        assert_eq!(key, "x");
    }
}

#[tokio::test]
async fn invalidating_a_missing_key_is_a_noop() {
    let (queue, _clock) = start(64);
    queue
        .enqueue_invalidate(vec!["never-existed".to_string()])
        .await
        .unwrap();
    let rows = queue
        .enqueue_select(vec!["never-existed".to_string()])
        .await
        .unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn empty_key_list_select_and_invalidate_are_noops() {
    let (queue, _clock) = start(64);
    queue
        .enqueue_insert(vec![Entry::new("a", vec![1], 1_000, 0)])
        .await
        .unwrap();
    let rows = queue.enqueue_select(Vec::new()).await.unwrap();
    assert!(rows.is_empty());
    queue.enqueue_invalidate(Vec::new()).await.unwrap();
    let rows = queue.enqueue_select(vec!["a".to_string()]).await.unwrap();
    assert_eq!(rows.len(), 1, "unrelated empty-key invalidate must not touch other rows");
}

#[tokio::test]
async fn flush_barrier_waits_for_prior_work() {
    let (queue, _clock) = start(64);
    for i in 0..10 {
        queue
            .enqueue_insert(vec![Entry::new(format!("k{i}"), vec![i as u8], 1_000, 0)])
            .await
            .unwrap();
    }
    queue.enqueue_flush().await.unwrap();
    let keys = queue.enqueue_get_all_keys().await.unwrap();
    assert_eq!(keys.len(), 10);
}

#[tokio::test]
async fn chunk_size_bound_is_respected() {
    let (queue, _clock) = start(4);
    for i in 0..17 {
        queue
            .enqueue_insert(vec![Entry::new(format!("k{i}"), vec![i as u8], 1_000, 0)])
            .await
            .unwrap();
    }
    let stats = queue.stats();
    assert!(
        stats.chunks_committed >= 5,
        "17 items at ChunkSize=4 needs at least five chunks"
    );
}

#[tokio::test]
async fn delete_expired_removes_rows_inside_normal_chunk() {
    init_tracing();
    let (queue, clock) = start(64);
    queue
        .enqueue_insert(vec![
            Entry::new("dead", vec![1], 0, 0),
            Entry::new("alive", vec![2], 1_000, 0),
        ])
        .await
        .unwrap();
    clock.advance(500);
    queue.enqueue_delete_expired().await.unwrap();

    let mut keys = queue.enqueue_get_all_keys().await.unwrap();
    keys.sort();
    assert_eq!(keys, vec!["alive".to_string()]);
}

#[tokio::test]
async fn vacuum_removes_expired_rows_end_to_end() {
    let (queue, clock) = start(64);
    queue
        .enqueue_insert(vec![
            Entry::new("dead", vec![1], 0, 0),
            Entry::new("alive", vec![2], 1_000, 0),
        ])
        .await
        .unwrap();
    clock.advance(500);
    queue.enqueue_vacuum().await.unwrap();

    let mut keys = queue.enqueue_get_all_keys().await.unwrap();
    keys.sort();
    assert_eq!(keys, vec!["alive".to_string()]);
}

#[tokio::test]
async fn dispose_drains_queue_then_fails_late_enqueues() {
    let (queue, _clock) = start(64);
    queue
        .enqueue_insert(vec![Entry::new("a", vec![1], 1_000, 0)])
        .await
        .unwrap();
    queue.dispose();

    // Give the worker a chance to observe the shutdown signal and exit.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let result = queue
        .enqueue_insert(vec![Entry::new("b", vec![2], 1_000, 0)])
        .await;
    assert!(matches!(result, Err(CacheError::Disposed)));
}

#[tokio::test]
async fn shutdown_joins_the_worker_task() {
    let (queue, _clock) = start(64);
    queue
        .enqueue_insert(vec![Entry::new("a", vec![1], 1_000, 0)])
        .await
        .unwrap();

    // Unlike `dispose`, this only returns once the worker task has
    // actually finished draining and exited.
    queue.shutdown().await.unwrap();

    let result = queue
        .enqueue_insert(vec![Entry::new("b", vec![2], 1_000, 0)])
        .await;
    assert!(matches!(result, Err(CacheError::Disposed)));

    // Safe to call again from a clone; the second call just sees the
    // handle already taken and returns immediately.
    queue.shutdown().await.unwrap();
}
