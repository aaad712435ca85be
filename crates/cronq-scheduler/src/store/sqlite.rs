use async_trait::async_trait;
use chrono::Utc;
use cronq_core::PeriodTask;
use rusqlite::{params, OptionalExtension};

use super::{decode_all, decode_one, TaskStore};
use crate::db::{lock_conn, SharedConnection};
use crate::error::Result;

const UPSERT: &str = "INSERT INTO period_tasks (hash_key, uid, record, updated_at)
     VALUES (?1, ?2, ?3, ?4)
     ON CONFLICT (hash_key, uid) DO UPDATE
     SET record = excluded.record, updated_at = excluded.updated_at";

/// Store backed by the `period_tasks` table. Suitable for a single node.
#[derive(Clone)]
pub struct SqliteTaskStore {
    conn: SharedConnection,
    hash_key: String,
}

impl SqliteTaskStore {
    /// `conn` must already carry the schema (see [`crate::db::open`]).
    pub fn new(conn: SharedConnection, hash_key: impl Into<String>) -> Self {
        Self {
            conn,
            hash_key: hash_key.into(),
        }
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn save(&self, task: &PeriodTask) -> Result<()> {
        let raw = task.to_json()?;
        let conn = lock_conn(&self.conn);
        conn.execute(
            UPSERT,
            params![self.hash_key, task.uid, raw, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    async fn save_batch(&self, tasks: &[PeriodTask]) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        let now = Utc::now().to_rfc3339();
        let mut conn = lock_conn(&self.conn);
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(UPSERT)?;
            for task in tasks {
                stmt.execute(params![self.hash_key, task.uid, task.to_json()?, now])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn get(&self, uid: &str) -> Result<Option<PeriodTask>> {
        let raw: Option<String> = {
            let conn = lock_conn(&self.conn);
            conn.query_row(
                "SELECT record FROM period_tasks WHERE hash_key = ?1 AND uid = ?2",
                params![self.hash_key, uid],
                |row| row.get(0),
            )
            .optional()?
        };
        raw.map(|r| decode_one(uid, &r)).transpose()
    }

    async fn delete(&self, uid: &str) -> Result<bool> {
        let conn = lock_conn(&self.conn);
        let n = conn.execute(
            "DELETE FROM period_tasks WHERE hash_key = ?1 AND uid = ?2",
            params![self.hash_key, uid],
        )?;
        Ok(n > 0)
    }

    async fn list_all(&self) -> Result<Vec<PeriodTask>> {
        let raw = {
            let conn = lock_conn(&self.conn);
            let mut stmt = conn.prepare_cached(
                "SELECT uid, record FROM period_tasks WHERE hash_key = ?1 ORDER BY uid",
            )?;
            let rows = stmt
                .query_map([&self.hash_key], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        Ok(decode_all(&self.hash_key, raw))
    }
}
