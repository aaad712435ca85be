//! Persistence of periodic-task definitions.
//!
//! One hash per scheduler group (`<group>.<period_key>`), field = uid,
//! value = JSON-encoded [`PeriodTask`]. No transactions: callers serialize
//! same-uid read-modify-write sequences through the leader lock.

use async_trait::async_trait;
use cronq_core::PeriodTask;

use crate::error::Result;

pub mod memory;
pub mod redis;
pub mod sqlite;

pub use memory::MemoryTaskStore;
pub use self::redis::RedisTaskStore;
pub use sqlite::SqliteTaskStore;

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Upsert `task` under its uid.
    async fn save(&self, task: &PeriodTask) -> Result<()>;

    /// Upsert many tasks in one round trip.
    async fn save_batch(&self, tasks: &[PeriodTask]) -> Result<()>;

    async fn get(&self, uid: &str) -> Result<Option<PeriodTask>>;

    /// Returns whether a record was removed.
    async fn delete(&self, uid: &str) -> Result<bool>;

    /// Every decodable record of the group. Undecodable records are logged
    /// and skipped.
    async fn list_all(&self) -> Result<Vec<PeriodTask>>;
}

/// Decode the raw field values of a hash, dropping (and logging) bad ones.
pub(crate) fn decode_all<I>(hash_key: &str, raw: I) -> Vec<PeriodTask>
where
    I: IntoIterator<Item = (String, String)>,
{
    raw.into_iter()
        .filter_map(|(uid, value)| match PeriodTask::from_json(&value) {
            Ok(task) => Some(task),
            Err(e) => {
                tracing::warn!(hash = %hash_key, %uid, error = %e, "skipping undecodable task record");
                None
            }
        })
        .collect()
}

pub(crate) fn decode_one(uid: &str, raw: &str) -> Result<PeriodTask> {
    PeriodTask::from_json(raw).map_err(|e| {
        crate::error::SchedulerError::Store(format!("undecodable record for '{uid}': {e}"))
    })
}
