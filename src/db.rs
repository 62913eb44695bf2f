//! Connection lifecycle and schema for the `CacheElement` table.
//!
//! Open-flags-then-pragma sequence, with a create-file-then-create-tables
//! split so a half-created database can't be mistaken for an existing
//! one.

use std::fs::File;
use std::path::Path;

use rusqlite::{Connection, OpenFlags};

use crate::error::CacheResult;

/// Opens (or creates) the single connection the worker owns for its
/// lifetime. Only one connection is ever created, so batching and
/// EXCLUSIVE locking mean what they say.
pub fn open_or_create(path: &Path) -> CacheResult<Connection> {
    let conn = if path.exists() {
        open(path)?
    } else {
        create(path)?
    };
    Ok(conn)
}

/// An in-memory database, for tests that don't need to survive past the
/// process.
pub fn open_in_memory() -> CacheResult<Connection> {
    let conn = Connection::open_in_memory()?;
    apply_pragmas(&conn)?;
    create_tables(&conn)?;
    Ok(conn)
}

fn open(path: &Path) -> CacheResult<Connection> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
    apply_pragmas(&conn)?;
    Ok(conn)
}

fn create(path: &Path) -> CacheResult<Connection> {
    let _file = File::options()
        .write(true)
        .read(true)
        .create_new(true)
        .open(path)?;

    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
    apply_pragmas(&conn)?;
    create_tables(&conn)?;
    Ok(conn)
}

fn apply_pragmas(conn: &Connection) -> CacheResult<()> {
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.pragma_update(None, "locking_mode", "EXCLUSIVE")?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    Ok(())
}

fn create_tables(conn: &Connection) -> CacheResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE CacheElement(
          Key        TEXT PRIMARY KEY NOT NULL,
          TypeName   TEXT,
          Value      BLOB NOT NULL,
          Expiration INTEGER NOT NULL,
          CreatedAt  INTEGER NOT NULL
        );

        CREATE INDEX idx_cacheelement_typename ON CacheElement(TypeName);
        CREATE INDEX idx_cacheelement_expiration ON CacheElement(Expiration);
        "#,
    )?;
    Ok(())
}
