use std::collections::BTreeMap;

use async_trait::async_trait;
use cronq_core::PeriodTask;
use redis::{aio::ConnectionManager, AsyncCommands};

use super::{decode_all, decode_one, TaskStore};
use crate::error::{Result, SchedulerError};

/// Store backed by a single Redis hash per group.
#[derive(Clone)]
pub struct RedisTaskStore {
    conn: ConnectionManager,
    hash_key: String,
}

impl RedisTaskStore {
    pub fn new(conn: ConnectionManager, hash_key: impl Into<String>) -> Self {
        Self {
            conn,
            hash_key: hash_key.into(),
        }
    }

    /// Connect to `uri`. An unparseable URI is a configuration error.
    pub async fn connect(uri: &str, hash_key: impl Into<String>) -> Result<Self> {
        let conn = connect(uri).await?;
        Ok(Self::new(conn, hash_key))
    }
}

/// Open a managed (auto-reconnecting) connection to `uri`.
pub async fn connect(uri: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(uri)
        .map_err(|e| SchedulerError::Config(format!("invalid redis uri: {e}")))?;
    Ok(ConnectionManager::new(client).await?)
}

#[async_trait]
impl TaskStore for RedisTaskStore {
    async fn save(&self, task: &PeriodTask) -> Result<()> {
        let mut conn = self.conn.clone();
        let raw = task.to_json()?;
        let _: () = conn.hset(&self.hash_key, &task.uid, raw).await?;
        Ok(())
    }

    async fn save_batch(&self, tasks: &[PeriodTask]) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for task in tasks {
            pipe.hset(&self.hash_key, &task.uid, task.to_json()?).ignore();
        }
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, uid: &str) -> Result<Option<PeriodTask>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.hget(&self.hash_key, uid).await?;
        raw.map(|r| decode_one(uid, &r)).transpose()
    }

    async fn delete(&self, uid: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.hdel(&self.hash_key, uid).await?;
        Ok(removed > 0)
    }

    async fn list_all(&self) -> Result<Vec<PeriodTask>> {
        let mut conn = self.conn.clone();
        let raw: BTreeMap<String, String> = conn.hgetall(&self.hash_key).await?;
        Ok(decode_all(&self.hash_key, raw))
    }
}
