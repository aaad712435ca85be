//! Cluster-wide mutual exclusion with an expiring lease.
//!
//! A [`Lease`] carries a random token; `release` only removes the lock while
//! that token still owns it, so a holder whose lease already expired cannot
//! release somebody else's lock.

use std::time::Duration;

use async_trait::async_trait;
use cronq_core::config::LockConfig;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, SchedulerError};

pub mod memory;
pub mod redis;
pub mod sqlite;

pub use memory::MemoryLeaderLock;
pub use self::redis::RedisLeaderLock;
pub use sqlite::SqliteLeaderLock;

/// Proof of ownership returned by a successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    token: String,
}

impl Lease {
    pub(crate) fn new() -> Self {
        Self {
            token: Uuid::new_v4().to_string(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

#[async_trait]
pub trait LeaderLock: Send + Sync {
    /// Take the lock if it is free or its lease expired. Never blocks.
    async fn try_acquire(&self) -> Result<Option<Lease>>;

    /// Drop the lock if `lease` still owns it.
    async fn release(&self, lease: Lease) -> Result<()>;
}

/// Polling policy of the blocking [`acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquirePolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_wait: Duration,
}

impl Default for AcquirePolicy {
    fn default() -> Self {
        Self::from(&LockConfig::default())
    }
}

impl From<&LockConfig> for AcquirePolicy {
    fn from(c: &LockConfig) -> Self {
        Self {
            initial_interval: Duration::from_millis(c.poll_initial_ms.max(1)),
            max_interval: Duration::from_millis(c.poll_max_ms.max(c.poll_initial_ms).max(1)),
            max_wait: Duration::from_secs(c.max_wait_secs),
        }
    }
}

/// Block until the lock is taken, polling with exponential backoff, and fail
/// with [`SchedulerError::LockTimeout`] once `policy.max_wait` has elapsed.
pub async fn acquire(lock: &dyn LeaderLock, policy: &AcquirePolicy) -> Result<Lease> {
    let started = Instant::now();
    let mut delay = policy.initial_interval;

    loop {
        if let Some(lease) = lock.try_acquire().await? {
            return Ok(lease);
        }
        let waited = started.elapsed();
        if waited >= policy.max_wait {
            return Err(SchedulerError::LockTimeout { waited });
        }
        debug!(?delay, ?waited, "leader lock busy, backing off");
        tokio::time::sleep(delay.min(policy.max_wait - waited)).await;
        delay = (delay * 2).min(policy.max_interval);
    }
}
