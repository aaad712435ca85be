use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use cronq_core::PeriodTask;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    context::SchedulerContext,
    error::Result,
    queue::{Job, ProcessSchedule, QueueError, SubmitOptions},
    schedule::next_occurrence,
};

const TICK: Duration = Duration::from_secs(1);
/// Gaps at or below this get no retention hint.
const RETENTION_MIN_GAP_SECS: i64 = 10;
const RETENTION_MAX_SECS: i64 = 600;

/// Outcome of one scan tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Records read from the store.
    pub loaded: usize,
    /// Occurrences accepted by the queue engine (and advanced).
    pub submitted: usize,
    /// Occurrences whose id the engine still held.
    pub conflicts: usize,
    /// Submissions that failed for any other reason.
    pub failed: usize,
    /// Records with an expression that no longer evaluates.
    pub skipped: usize,
}

/// How long the engine should keep a completed periodic occurrence, given the
/// gap to the following one. Keeping it around blocks a resubmission of the
/// same id for a third of the gap, at most ten minutes.
pub fn retention_hint(gap_secs: i64) -> Option<Duration> {
    (gap_secs > RETENTION_MIN_GAP_SECS)
        .then(|| Duration::from_secs((gap_secs / 3).min(RETENTION_MAX_SECS) as u64))
}

/// Scan loop: once a second, the replica holding the leader lock submits the
/// pending occurrence of every periodic task and advances it.
pub struct SchedulerEngine {
    ctx: Arc<SchedulerContext>,
}

impl SchedulerEngine {
    pub fn new(ctx: Arc<SchedulerContext>) -> Self {
        Self { ctx }
    }

    /// Main event loop. Ticks every second until `shutdown` broadcasts `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(group = %self.ctx.config.group, "scheduler engine started");

        let mut interval = tokio::time::interval(TICK);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(Some(s)) if s.submitted > 0 || s.failed > 0 => {
                            info!(loaded = s.loaded, submitted = s.submitted, failed = s.failed, "scan tick");
                        }
                        Ok(_) => {}
                        Err(e) => error!(code = e.code(), "scheduler tick error: {e}"),
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run one scan. Returns `None` when another replica holds the lock.
    pub async fn tick(&self) -> Result<Option<ScanSummary>> {
        let Some(lease) = self.ctx.lock.try_acquire().await? else {
            return Ok(None);
        };
        let result = self.scan().await;
        if let Err(e) = self.ctx.lock.release(lease).await {
            warn!(code = e.code(), "leader lock release failed: {e}");
        }
        result.map(Some)
    }

    async fn scan(&self) -> Result<ScanSummary> {
        let tasks = self.ctx.store.list_all().await?;
        let mut summary = ScanSummary {
            loaded: tasks.len(),
            ..ScanSummary::default()
        };

        let mut advanced: Vec<PeriodTask> = Vec::new();
        for mut task in tasks {
            // Anchored at the stored occurrence, not at now, so a late tick
            // never skips one.
            let following = match next_occurrence(&task.expr, task.next) {
                Ok(t) => t,
                Err(e) => {
                    warn!(uid = %task.uid, expr = %task.expr, "skipping task: {e}");
                    summary.skipped += 1;
                    continue;
                }
            };
            let Some(process_at) = DateTime::from_timestamp(task.next, 0) else {
                warn!(uid = %task.uid, next = task.next, "skipping task: next out of range");
                summary.skipped += 1;
                continue;
            };

            let job = Job {
                id: task.uid.clone(),
                task_type: task.task_type.clone(),
                payload: task.payload.clone(),
            };
            let opts = SubmitOptions {
                queue: self.ctx.queue_name().to_string(),
                max_retry: self.ctx.max_retry(task.max_retry),
                timeout: self.ctx.timeout(task.timeout),
                retention: retention_hint(following - task.next),
                schedule: ProcessSchedule::At(process_at),
            };

            match self.ctx.queue.submit(job, opts).await {
                Ok(_) => {
                    debug!(uid = %task.uid, at = %process_at, following, "occurrence submitted");
                    task.next = following;
                    advanced.push(task);
                    summary.submitted += 1;
                }
                Err(QueueError::TaskIdConflict { .. }) => {
                    debug!(uid = %task.uid, "occurrence still held by the queue");
                    summary.conflicts += 1;
                }
                Err(e) => {
                    warn!(uid = %task.uid, error = %e, "occurrence submit failed; retrying next tick");
                    summary.failed += 1;
                }
            }
        }

        self.ctx.store.save_batch(&advanced).await?;
        Ok(summary)
    }
}
