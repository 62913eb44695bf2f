//! The ten prepared operations, one function each, operating on a
//! caller-supplied `Connection`.
//!
//! Each function here collapses `prepare(params) -> thunk` into a single
//! call: binding and stepping happen together because
//! `rusqlite::Connection::prepare_cached` already gives "prepared once,
//! reused forever" behavior, keyed by the generated SQL text (which
//! varies with list length, covering the family-of-N-statements need for
//! the bulk-by-list ops without a hand-maintained array of fixed
//! `Statement<'db>` fields).
//!
//! Every statement is reset by `prepare_cached`'s `Drop` impl when the
//! guard goes out of scope, so it's always reset before returning
//! regardless of which branch returns.

use rusqlite::{named_params, Connection};

use crate::entry::Entry;
use crate::error::CacheResult;

/// Builds `?1,?2,...,?n` for a dynamic `IN (...)` clause. `n` must be in
/// `[1, CHUNK_SIZE]`; callers enforce that bound before calling (see
/// `coalesce.rs`, which never emits a merged group larger than a chunk).
fn in_placeholders(n: usize) -> String {
    (1..=n)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<Entry> {
    Ok(Entry {
        key: row.get("Key")?,
        type_name: row.get("TypeName")?,
        value: row.get("Value")?,
        expiration: row.get("Expiration")?,
        created_at: row.get("CreatedAt")?,
    })
}

/// `BulkSelectByKey`. Filters out rows whose expiration has passed;
/// `now` is sampled once by the caller and passed in. An empty key list
/// is a valid no-op request and returns no rows without touching the
/// database.
pub fn select_by_key(conn: &Connection, keys: &[String], now: i64) -> CacheResult<Vec<Entry>> {
    if keys.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT Key, TypeName, Value, Expiration, CreatedAt FROM CacheElement \
         WHERE Key IN ({}) AND Expiration >= ?{}",
        in_placeholders(keys.len()),
        keys.len() + 1
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut stmt_params: Vec<&dyn rusqlite::ToSql> =
        keys.iter().map(|k| k as &dyn rusqlite::ToSql).collect();
    stmt_params.push(&now);
    let rows = stmt
        .query_map(stmt_params.as_slice(), row_to_entry)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// `BulkSelectByType`.
pub fn select_by_type(
    conn: &Connection,
    type_names: &[String],
    now: i64,
) -> CacheResult<Vec<Entry>> {
    if type_names.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT Key, TypeName, Value, Expiration, CreatedAt FROM CacheElement \
         WHERE TypeName IN ({}) AND Expiration >= ?{}",
        in_placeholders(type_names.len()),
        type_names.len() + 1
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut stmt_params: Vec<&dyn rusqlite::ToSql> = type_names
        .iter()
        .map(|t| t as &dyn rusqlite::ToSql)
        .collect();
    stmt_params.push(&now);
    let rows = stmt
        .query_map(stmt_params.as_slice(), row_to_entry)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// `BulkInsert`. Replaces the existing row on a `Key` conflict rather
/// than erroring. An empty entry list is a no-op.
pub fn insert_bulk(conn: &Connection, entries: &[Entry]) -> CacheResult<()> {
    if entries.is_empty() {
        return Ok(());
    }
    let mut stmt = conn.prepare_cached(
        "INSERT INTO CacheElement(Key, TypeName, Value, Expiration, CreatedAt) \
         VALUES (:key, :type_name, :value, :expiration, :created_at) \
         ON CONFLICT(Key) DO UPDATE SET \
           TypeName = excluded.TypeName, \
           Value = excluded.Value, \
           Expiration = excluded.Expiration, \
           CreatedAt = excluded.CreatedAt",
    )?;
    for entry in entries {
        stmt.execute(named_params! {
            ":key": entry.key,
            ":type_name": entry.type_name,
            ":value": entry.value,
            ":expiration": entry.expiration,
            ":created_at": entry.created_at,
        })?;
    }
    Ok(())
}

/// `BulkInvalidateByKey`. Deleting a key that isn't present is a no-op,
/// and so is an empty key list.
pub fn invalidate_by_key(conn: &Connection, keys: &[String]) -> CacheResult<()> {
    if keys.is_empty() {
        return Ok(());
    }
    let sql = format!(
        "DELETE FROM CacheElement WHERE Key IN ({})",
        in_placeholders(keys.len())
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let stmt_params: Vec<&dyn rusqlite::ToSql> =
        keys.iter().map(|k| k as &dyn rusqlite::ToSql).collect();
    stmt.execute(stmt_params.as_slice())?;
    Ok(())
}

/// `BulkInvalidateByType`.
pub fn invalidate_by_type(conn: &Connection, type_names: &[String]) -> CacheResult<()> {
    if type_names.is_empty() {
        return Ok(());
    }
    let sql = format!(
        "DELETE FROM CacheElement WHERE TypeName IN ({})",
        in_placeholders(type_names.len())
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let stmt_params: Vec<&dyn rusqlite::ToSql> = type_names
        .iter()
        .map(|t| t as &dyn rusqlite::ToSql)
        .collect();
    stmt.execute(stmt_params.as_slice())?;
    Ok(())
}

/// `InvalidateAll`.
pub fn invalidate_all(conn: &Connection) -> CacheResult<()> {
    conn.prepare_cached("DELETE FROM CacheElement")?.execute([])?;
    Ok(())
}

/// `GetAllKeys`. Only keys whose `Expiration >= now`.
pub fn get_all_keys(conn: &Connection, now: i64) -> CacheResult<Vec<String>> {
    let mut stmt =
        conn.prepare_cached("SELECT Key FROM CacheElement WHERE Expiration >= ?1")?;
    let keys = stmt
        .query_map([now], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(keys)
}

/// `DeleteExpired`. Uses worker-sourced "now".
pub fn delete_expired(conn: &Connection, now: i64) -> CacheResult<()> {
    conn.prepare_cached("DELETE FROM CacheElement WHERE Expiration < ?1")?
        .execute([now])?;
    Ok(())
}

/// `Vacuum`. Must run outside any transaction; the caller (`vacuum.rs`)
/// is responsible for ensuring no BEGIN is open.
pub fn vacuum(conn: &Connection) -> CacheResult<()> {
    conn.execute_batch("VACUUM")?;
    Ok(())
}

// BEGIN/COMMIT/ROLLBACK return the raw rusqlite error rather than
// `CacheResult` so the worker can classify a BEGIN failure as
// `TransientStorageBusy` and a COMMIT failure as `CommitFailed` instead
// of the generic `ItemExecutionFailed` the blanket `From` impl would
// produce.
pub fn begin(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("BEGIN IMMEDIATE")
}

pub fn commit(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("COMMIT")
}

pub fn rollback(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("ROLLBACK")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;

    #[test]
    fn insert_then_select_round_trip() {
        let conn = open_in_memory().unwrap();
        let entry = Entry::new("a", vec![1, 2, 3], 1_000, 0);
        insert_bulk(&conn, &[entry.clone()]).unwrap();
        let rows = select_by_key(&conn, &["a".to_string()], 0).unwrap();
        assert_eq!(rows, vec![entry]);
    }

    #[test]
    fn select_filters_expired_rows() {
        let conn = open_in_memory().unwrap();
        let entry = Entry::new("a", vec![1], 100, 0);
        insert_bulk(&conn, &[entry]).unwrap();
        let rows = select_by_key(&conn, &["a".to_string()], 500).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn invalidate_missing_key_is_noop() {
        let conn = open_in_memory().unwrap();
        invalidate_by_key(&conn, &["ghost".to_string()]).unwrap();
    }

    #[test]
    fn empty_key_list_select_and_invalidate_are_noops() {
        let conn = open_in_memory().unwrap();
        assert!(select_by_key(&conn, &[], 0).unwrap().is_empty());
        invalidate_by_key(&conn, &[]).unwrap();
    }

    #[test]
    fn insert_replaces_on_conflict() {
        let conn = open_in_memory().unwrap();
        insert_bulk(&conn, &[Entry::new("a", vec![1], 1_000, 0)]).unwrap();
        insert_bulk(&conn, &[Entry::new("a", vec![2], 1_000, 1)]).unwrap();
        let rows = select_by_key(&conn, &["a".to_string()], 0).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, vec![2]);
    }

    #[test]
    fn get_all_keys_excludes_expired() {
        let conn = open_in_memory().unwrap();
        insert_bulk(
            &conn,
            &[
                Entry::new("live", vec![1], 1_000, 0),
                Entry::new("dead", vec![2], 0, 0),
            ],
        )
        .unwrap();
        let mut keys = get_all_keys(&conn, 500).unwrap();
        keys.sort();
        assert_eq!(keys, vec!["live".to_string()]);
    }
}
