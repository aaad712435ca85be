use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cronq_core::types::is_periodic;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    context::SchedulerContext,
    error::Result,
    queue::ArchivedJob,
    schedule::next_occurrence,
};

/// Archived jobs inspected per run.
pub const PAGE_SIZE: usize = 100;
pub const ONE_OFF_GRACE: Duration = Duration::from_secs(5 * 60);
/// Shortest run interval; smaller values are raised to it.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Grace window of a periodic job given its cadence gap in seconds.
pub fn grace_for_gap(gap_secs: i64) -> Duration {
    let secs = if gap_secs <= 60 {
        5 * 60
    } else if gap_secs <= 600 {
        30 * 60
    } else if gap_secs <= 3600 {
        2 * 3600
    } else {
        5 * 3600
    };
    Duration::from_secs(secs)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapSummary {
    pub scanned: usize,
    pub deleted: usize,
    /// Inside their grace window, without a record, or not deletable.
    pub skipped: usize,
}

/// Deletes archived jobs of the group once they outlive their grace window.
pub struct ArchiveReaper {
    ctx: Arc<SchedulerContext>,
    interval: Duration,
}

impl ArchiveReaper {
    pub fn new(ctx: Arc<SchedulerContext>, interval: Duration) -> Self {
        Self {
            ctx,
            interval: interval.max(MIN_INTERVAL),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.interval, "archive reaper started");

        let mut interval = tokio::time::interval(self.interval);
        // the first tick completes immediately
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.reap_once(Utc::now()).await {
                        Ok(Some(s)) if s.deleted > 0 => {
                            info!(scanned = s.scanned, deleted = s.deleted, skipped = s.skipped, "archived jobs reaped");
                        }
                        Ok(_) => {}
                        Err(e) => error!(code = e.code(), "archive reaper error: {e}"),
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        info!("archive reaper shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One run evaluated at `now`. Returns `None` when another replica holds
    /// the lock.
    pub async fn reap_once(&self, now: DateTime<Utc>) -> Result<Option<ReapSummary>> {
        let Some(lease) = self.ctx.lock.try_acquire().await? else {
            return Ok(None);
        };
        let result = self.reap(now).await;
        if let Err(e) = self.ctx.lock.release(lease).await {
            warn!(code = e.code(), "leader lock release failed: {e}");
        }
        result.map(Some)
    }

    async fn reap(&self, now: DateTime<Utc>) -> Result<ReapSummary> {
        let queue = self.ctx.queue_name();
        let archived = self.ctx.queue.list_archived(queue, 1, PAGE_SIZE).await?;
        let mut summary = ReapSummary {
            scanned: archived.len(),
            ..ReapSummary::default()
        };

        for job in archived {
            if !self.expired(&job, now).await {
                summary.skipped += 1;
                continue;
            }
            match self.ctx.queue.delete_task(queue, &job.id).await {
                Ok(()) => {
                    debug!(id = %job.id, task_type = %job.task_type, "archived job deleted");
                    summary.deleted += 1;
                }
                Err(e) => {
                    warn!(id = %job.id, error = %e, "archived job not deleted");
                    summary.skipped += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn expired(&self, job: &ArchivedJob, now: DateTime<Utc>) -> bool {
        if job.retried >= job.max_retry {
            return true;
        }
        let Some(grace) = self.grace(job).await else {
            return false;
        };
        let failed_at = job.last_failed_at.unwrap_or(DateTime::UNIX_EPOCH);
        (now - failed_at).to_std().is_ok_and(|elapsed| elapsed >= grace)
    }

    async fn grace(&self, job: &ArchivedJob) -> Option<Duration> {
        if !is_periodic(&job.task_type) {
            return Some(ONE_OFF_GRACE);
        }
        let task = match self.ctx.store.get(&job.id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                debug!(id = %job.id, "archived periodic job has no record; left alone");
                return None;
            }
            Err(e) => {
                warn!(id = %job.id, code = e.code(), "record lookup failed: {e}");
                return None;
            }
        };
        match next_occurrence(&task.expr, task.next) {
            Ok(following) => Some(grace_for_gap(following - task.next)),
            Err(e) => {
                warn!(id = %job.id, expr = %task.expr, "cadence unknown: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{fixture, Fixture};
    use crate::lock::LeaderLock;
    use crate::queue::{Job, QueueEngine, QueueError, SubmitOptions};
    use crate::store::TaskStore;
    use async_trait::async_trait;
    use cronq_core::PeriodTask;
    use std::sync::Mutex;

    /// 2023-11-14T22:13:20Z
    const T: i64 = 1_700_000_000;

    /// Queue that only knows a fixed archive and records deletions.
    #[derive(Default)]
    struct Archive {
        jobs: Vec<ArchivedJob>,
        deleted: Mutex<Vec<String>>,
    }

    impl Archive {
        fn deleted(&self) -> Vec<String> {
            self.deleted.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl QueueEngine for Archive {
        async fn submit(&self, _job: Job, _opts: SubmitOptions) -> std::result::Result<String, QueueError> {
            Err(QueueError::Backend("read-only".to_string()))
        }

        async fn delete_task(&self, _queue: &str, id: &str) -> std::result::Result<(), QueueError> {
            self.deleted.lock().unwrap().push(id.to_string());
            Ok(())
        }

        async fn list_archived(
            &self,
            _queue: &str,
            page: usize,
            page_size: usize,
        ) -> std::result::Result<Vec<ArchivedJob>, QueueError> {
            let skip = (page - 1) * page_size;
            Ok(self.jobs.iter().skip(skip).take(page_size).cloned().collect())
        }
    }

    fn at(ts: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(ts, 0).unwrap()
    }

    fn archived(id: &str, task_type: &str, retried: u32, max_retry: u32) -> ArchivedJob {
        ArchivedJob {
            id: id.to_string(),
            task_type: task_type.to_string(),
            last_failed_at: Some(at(T)),
            retried,
            max_retry,
        }
    }

    fn record(uid: &str, expr: &str, next: i64) -> PeriodTask {
        PeriodTask {
            expr: expr.to_string(),
            task_type: "report.cron".to_string(),
            uid: uid.to_string(),
            payload: String::new(),
            next,
            processed: 0,
            max_retry: 0,
            timeout: 0,
        }
    }

    fn reaper(f: &Fixture, archive: Arc<Archive>) -> ArchiveReaper {
        let ctx = SchedulerContext {
            store: Arc::clone(&f.ctx.store),
            lock: Arc::clone(&f.ctx.lock),
            queue: archive,
            config: f.ctx.config.clone(),
            acquire: f.ctx.acquire,
        };
        ArchiveReaper::new(Arc::new(ctx), Duration::from_secs(60))
    }

    #[test]
    fn grace_tiers() {
        assert_eq!(grace_for_gap(1), Duration::from_secs(300));
        assert_eq!(grace_for_gap(60), Duration::from_secs(300));
        assert_eq!(grace_for_gap(61), Duration::from_secs(1800));
        assert_eq!(grace_for_gap(600), Duration::from_secs(1800));
        assert_eq!(grace_for_gap(3600), Duration::from_secs(7200));
        assert_eq!(grace_for_gap(3601), Duration::from_secs(18_000));
        assert_eq!(grace_for_gap(86_400), Duration::from_secs(18_000));
    }

    #[tokio::test]
    async fn one_off_waits_five_minutes() {
        let f = fixture();
        let archive = Arc::new(Archive {
            jobs: vec![archived("m", "mail.once", 0, 3)],
            ..Archive::default()
        });
        let reaper = reaper(&f, Arc::clone(&archive));

        let s = reaper.reap_once(at(T + 4 * 60)).await.unwrap().unwrap();
        assert_eq!(s, ReapSummary { scanned: 1, deleted: 0, skipped: 1 });

        reaper.reap_once(at(T + 6 * 60)).await.unwrap().unwrap();
        assert_eq!(archive.deleted(), vec!["m".to_string()]);
    }

    #[tokio::test]
    async fn periodic_thirty_second_gap_waits_five_minutes() {
        let f = fixture();
        // 22:13:30Z, then every 30 s
        f.store
            .save(&record("fast", "*/30 * * * * *", T + 10))
            .await
            .unwrap();
        let archive = Arc::new(Archive {
            jobs: vec![archived("fast", "report.cron", 1, 3)],
            ..Archive::default()
        });
        let reaper = reaper(&f, Arc::clone(&archive));

        reaper.reap_once(at(T + 299)).await.unwrap();
        assert!(archive.deleted().is_empty());
        reaper.reap_once(at(T + 300)).await.unwrap();
        assert_eq!(archive.deleted(), vec!["fast".to_string()]);
    }

    #[tokio::test]
    async fn periodic_hourly_gap_waits_two_hours() {
        let f = fixture();
        // 23:00:00Z, then hourly
        f.store
            .save(&record("hourly", "0 0 * * * *", T + 2_800))
            .await
            .unwrap();
        let archive = Arc::new(Archive {
            jobs: vec![archived("hourly", "report.cron", 0, 3)],
            ..Archive::default()
        });
        let reaper = reaper(&f, Arc::clone(&archive));

        reaper.reap_once(at(T + 2 * 3600 - 1)).await.unwrap();
        assert!(archive.deleted().is_empty());
        reaper.reap_once(at(T + 2 * 3600)).await.unwrap();
        assert_eq!(archive.deleted().len(), 1);
    }

    #[tokio::test]
    async fn periodic_daily_gap_waits_five_hours() {
        let f = fixture();
        // 2023-11-15T03:00:00Z, then daily
        f.store
            .save(&record("daily", "0 0 3 * * *", 1_700_017_200))
            .await
            .unwrap();
        let archive = Arc::new(Archive {
            jobs: vec![archived("daily", "report.cron", 0, 3)],
            ..Archive::default()
        });
        let reaper = reaper(&f, Arc::clone(&archive));

        reaper.reap_once(at(T + 5 * 3600 - 1)).await.unwrap();
        assert!(archive.deleted().is_empty());
        reaper.reap_once(at(T + 5 * 3600)).await.unwrap();
        assert_eq!(archive.deleted().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_are_deleted_immediately() {
        let f = fixture();
        let archive = Arc::new(Archive {
            jobs: vec![
                archived("once", "mail.once", 3, 3),
                archived("gone", "report.cron", 2, 2),
            ],
            ..Archive::default()
        });
        let reaper = reaper(&f, Arc::clone(&archive));

        let s = reaper.reap_once(at(T)).await.unwrap().unwrap();
        assert_eq!(s.deleted, 2);
        assert_eq!(archive.deleted(), vec!["once".to_string(), "gone".to_string()]);
    }

    #[tokio::test]
    async fn periodic_without_record_is_left_alone() {
        let f = fixture();
        let archive = Arc::new(Archive {
            jobs: vec![archived("orphan", "report.cron", 0, 3)],
            ..Archive::default()
        });
        let reaper = reaper(&f, Arc::clone(&archive));

        let s = reaper.reap_once(at(T + 86_400)).await.unwrap().unwrap();
        assert_eq!(s.skipped, 1);
        assert!(archive.deleted().is_empty());
    }

    #[tokio::test]
    async fn missing_failure_time_counts_as_epoch() {
        let f = fixture();
        let mut job = archived("m", "mail.once", 0, 3);
        job.last_failed_at = None;
        let archive = Arc::new(Archive {
            jobs: vec![job],
            ..Archive::default()
        });

        reaper(&f, Arc::clone(&archive)).reap_once(at(T)).await.unwrap();
        assert_eq!(archive.deleted().len(), 1);
    }

    #[tokio::test]
    async fn busy_lock_skips_run() {
        let f = fixture();
        let archive = Arc::new(Archive {
            jobs: vec![archived("once", "mail.once", 3, 3)],
            ..Archive::default()
        });
        let _other_replica = f.lock.try_acquire().await.unwrap().unwrap();

        let reaper = reaper(&f, Arc::clone(&archive));
        assert!(reaper.reap_once(at(T)).await.unwrap().is_none());
        assert!(archive.deleted().is_empty());
    }

    #[tokio::test]
    async fn only_first_page_is_inspected() {
        let f = fixture();
        let jobs = (0..PAGE_SIZE + 5)
            .map(|i| archived(&format!("j{i}"), "mail.once", 3, 3))
            .collect();
        let archive = Arc::new(Archive {
            jobs,
            ..Archive::default()
        });

        let s = reaper(&f, Arc::clone(&archive))
            .reap_once(at(T))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(s.scanned, PAGE_SIZE);
        assert_eq!(archive.deleted().len(), PAGE_SIZE);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_is_raised_to_the_minimum() {
        let f = fixture();
        let archive = Arc::new(Archive {
            jobs: vec![archived("once", "mail.once", 3, 3)],
            ..Archive::default()
        });
        let ctx = SchedulerContext {
            store: Arc::clone(&f.ctx.store),
            lock: Arc::clone(&f.ctx.lock),
            queue: Arc::clone(&archive) as Arc<dyn QueueEngine>,
            config: f.ctx.config.clone(),
            acquire: f.ctx.acquire,
        };
        let reaper = ArchiveReaper::new(Arc::new(ctx), Duration::ZERO);
        assert_eq!(reaper.interval, MIN_INTERVAL);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(reaper.run(rx));
        tokio::time::sleep(MIN_INTERVAL + Duration::from_millis(10)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(archive.deleted(), vec!["once".to_string()]);
    }
}
