use std::sync::Arc;
use std::time::Duration;

use cronq_core::config::{CronqConfig, StoreBackend};
use tracing::info;

use crate::{
    db,
    error::{Result, SchedulerError},
    lock::{LeaderLock, MemoryLeaderLock, RedisLeaderLock, SqliteLeaderLock},
    store::{self, MemoryTaskStore, RedisTaskStore, SqliteTaskStore, TaskStore},
};

/// Store and lock of one group, sharing a single connection.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn TaskStore>,
    pub lock: Arc<dyn LeaderLock>,
}

/// Build the store and lock selected by `config.store`.
pub async fn open_backends(config: &CronqConfig) -> Result<Backends> {
    let hash_key = config.worker.hash_key();
    let lock_key = config.worker.lock_key();
    let lease = Duration::from_secs(config.lock.lease_secs);

    let backends = match config.store.backend {
        StoreBackend::Redis => {
            let uri = required(&config.store.uri, "store.uri")?;
            let conn = store::redis::connect(uri).await?;
            Backends {
                store: Arc::new(RedisTaskStore::new(conn.clone(), hash_key.clone())),
                lock: Arc::new(RedisLeaderLock::new(conn, lock_key, lease)),
            }
        }
        StoreBackend::Sqlite => {
            let path = required(&config.store.path, "store.path")?;
            let conn = db::open(path)?;
            Backends {
                store: Arc::new(SqliteTaskStore::new(conn.clone(), hash_key.clone())),
                lock: Arc::new(SqliteLeaderLock::new(conn, lock_key, lease)),
            }
        }
        StoreBackend::Memory => Backends {
            store: Arc::new(MemoryTaskStore::new(hash_key.clone())),
            lock: Arc::new(MemoryLeaderLock::new(lease)),
        },
    };

    info!(backend = ?config.store.backend, hash = %hash_key, "scheduler backends ready");
    Ok(backends)
}

fn required<'a>(value: &'a Option<String>, key: &str) -> Result<&'a str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| SchedulerError::Config(format!("{key} is required for this backend")))
}
