use std::sync::Arc;
use std::time::Duration;

use cronq_core::config::WorkerConfig;

use crate::lock::{AcquirePolicy, LeaderLock};
use crate::queue::QueueEngine;
use crate::store::TaskStore;

/// Everything a scheduler loop needs, passed explicitly instead of living in
/// process-wide state. Shared by the scan loop, the dispatcher, the reaper and
/// the registration API of one group.
pub struct SchedulerContext {
    pub store: Arc<dyn TaskStore>,
    pub lock: Arc<dyn LeaderLock>,
    pub queue: Arc<dyn QueueEngine>,
    pub config: WorkerConfig,
    pub acquire: AcquirePolicy,
}

impl SchedulerContext {
    /// Queue all submissions of this group go to.
    pub fn queue_name(&self) -> &str {
        &self.config.group
    }

    pub fn max_retry(&self, overridden: u32) -> u32 {
        if overridden > 0 {
            overridden
        } else {
            self.config.max_retry
        }
    }

    pub fn timeout(&self, overridden_secs: u64) -> Duration {
        if overridden_secs > 0 {
            Duration::from_secs(overridden_secs)
        } else {
            Duration::from_secs(self.config.timeout_secs)
        }
    }
}
