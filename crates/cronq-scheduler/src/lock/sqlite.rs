use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::params;

use super::{Lease, LeaderLock};
use crate::db::{lock_conn, SharedConnection};
use crate::error::Result;

/// Lease lock on a row of `leader_locks`. Expiry uses wall-clock millis.
#[derive(Clone)]
pub struct SqliteLeaderLock {
    conn: SharedConnection,
    key: String,
    lease: Duration,
}

impl SqliteLeaderLock {
    pub fn new(conn: SharedConnection, key: impl Into<String>, lease: Duration) -> Self {
        Self {
            conn,
            key: key.into(),
            lease,
        }
    }
}

#[async_trait]
impl LeaderLock for SqliteLeaderLock {
    async fn try_acquire(&self) -> Result<Option<Lease>> {
        let now = Utc::now().timestamp_millis();
        let expires_at = now + self.lease.as_millis() as i64;
        let lease = Lease::new();

        // The upsert only overwrites an expired row; 0 changes means busy.
        let conn = lock_conn(&self.conn);
        let n = conn.execute(
            "INSERT INTO leader_locks (lock_key, holder, expires_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (lock_key) DO UPDATE
             SET holder = excluded.holder, expires_at = excluded.expires_at
             WHERE leader_locks.expires_at <= ?4",
            params![self.key, lease.token(), expires_at, now],
        )?;
        Ok((n > 0).then_some(lease))
    }

    async fn release(&self, lease: Lease) -> Result<()> {
        let conn = lock_conn(&self.conn);
        conn.execute(
            "DELETE FROM leader_locks WHERE lock_key = ?1 AND holder = ?2",
            params![self.key, lease.token()],
        )?;
        Ok(())
    }
}
