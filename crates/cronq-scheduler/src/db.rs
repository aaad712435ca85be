use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;

use crate::error::Result;

/// One SQLite connection shared by the store and the lock of a process.
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `period_tasks` hash table and the `leader_locks` lease table
/// (both idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS period_tasks (
            hash_key    TEXT    NOT NULL,   -- <group>.<period_key>
            uid         TEXT    NOT NULL,
            record      TEXT    NOT NULL,   -- JSON-encoded PeriodTask
            updated_at  TEXT    NOT NULL,
            PRIMARY KEY (hash_key, uid)
        ) STRICT;

        CREATE TABLE IF NOT EXISTS leader_locks (
            lock_key    TEXT    NOT NULL PRIMARY KEY,
            holder      TEXT    NOT NULL,   -- lease token
            expires_at  INTEGER NOT NULL    -- unix millis
        ) STRICT;
        ",
    )?;
    Ok(())
}

/// Open (or create) the database file at `path` with the schema applied.
pub fn open(path: &str) -> Result<SharedConnection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
    init_db(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

pub fn open_in_memory() -> Result<SharedConnection> {
    let conn = Connection::open_in_memory()?;
    init_db(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

pub(crate) fn lock_conn(conn: &SharedConnection) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|e| e.into_inner())
}
