//! The vacuum path: the one worker operation that cannot run inside a
//! transaction. Driven entirely on the worker's own task
//! (it is the sole owner of the connection), so the flush lock it takes
//! here is uncontended by construction rather than a true mutual
//! exclusion against a second task. Kept anyway so the lock's role as
//! "the thing shutdown and flush also wait on" stays meaningful if a
//! future caller ever drives vacuum from elsewhere. See DESIGN.md.

use rusqlite::Connection;

use crate::clock::Clock;
use crate::error::{CacheError, CacheResult};
use crate::flush::FlushLock;
use crate::stats::QueueStats;
use crate::statements;

/// Runs one vacuum cycle: delete-expired in its own transaction, then
/// VACUUM outside any transaction.
pub async fn run_vacuum_cycle(
    conn: &Connection,
    flush_lock: &FlushLock,
    clock: &dyn Clock,
    stats: &QueueStats,
) -> CacheResult<()> {
    let _guard = flush_lock.inner().lock().await;
    let now = clock.now_tick();

    statements::begin(conn).map_err(|e| CacheError::TransientStorageBusy(e.to_string()))?;
    if let Err(e) = statements::delete_expired(conn, now) {
        let _ = statements::rollback(conn);
        return Err(e);
    }
    statements::commit(conn).map_err(|e| CacheError::CommitFailed(e.to_string()))?;

    statements::vacuum(conn)?;
    stats.record_vacuum(now);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::db::open_in_memory;
    use crate::entry::Entry;

    #[tokio::test]
    async fn vacuum_removes_expired_rows() {
        let conn = open_in_memory().unwrap();
        statements::insert_bulk(
            &conn,
            &[
                Entry::new("dead", vec![1], 0, 0),
                Entry::new("alive", vec![2], 1_000, 0),
            ],
        )
        .unwrap();

        let clock = FakeClock::new(500);
        let flush_lock = FlushLock::new();
        let stats = QueueStats::new();
        run_vacuum_cycle(&conn, &flush_lock, &clock, &stats)
            .await
            .unwrap();

        let remaining = statements::get_all_keys(&conn, 0).unwrap();
        assert_eq!(remaining, vec!["alive".to_string()]);
        assert_eq!(stats.snapshot().last_vacuum_tick, 500);
    }
}
