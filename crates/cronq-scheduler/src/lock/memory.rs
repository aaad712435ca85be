use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{Lease, LeaderLock};
use crate::error::Result;

struct Held {
    token: String,
    expires_at: Instant,
}

/// Process-local lease lock. Clones contend for the same lock, which is how
/// tests simulate several replicas sharing one lock service.
#[derive(Clone)]
pub struct MemoryLeaderLock {
    held: Arc<Mutex<Option<Held>>>,
    lease: Duration,
}

impl MemoryLeaderLock {
    pub fn new(lease: Duration) -> Self {
        Self {
            held: Arc::new(Mutex::new(None)),
            lease,
        }
    }

    /// True while an unexpired lease exists.
    pub fn is_held(&self) -> bool {
        self.held()
            .as_ref()
            .is_some_and(|h| h.expires_at > Instant::now())
    }

    fn held(&self) -> MutexGuard<'_, Option<Held>> {
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl LeaderLock for MemoryLeaderLock {
    async fn try_acquire(&self) -> Result<Option<Lease>> {
        let now = Instant::now();
        let mut held = self.held();
        if held.as_ref().is_some_and(|h| h.expires_at > now) {
            return Ok(None);
        }
        let lease = Lease::new();
        *held = Some(Held {
            token: lease.token().to_string(),
            expires_at: now + self.lease,
        });
        Ok(Some(lease))
    }

    async fn release(&self, lease: Lease) -> Result<()> {
        let mut held = self.held();
        if held.as_ref().is_some_and(|h| h.token == lease.token()) {
            *held = None;
        }
        Ok(())
    }
}
