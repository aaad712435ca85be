use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ArchivedJob, Job, JobHandler, QueueEngine, QueueError, SubmitOptions};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const MAX_RETRY_DELAY_SECS: i64 = 300;

/// Where a task sits inside [`MemoryQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting for `at`; also used for retries.
    Scheduled { at: DateTime<Utc> },
    Active,
    /// Finished; the id stays reserved until `expires_at`.
    Completed { expires_at: DateTime<Utc> },
    /// Retries exhausted. Stays until deleted.
    Archived { last_failed_at: DateTime<Utc> },
}

struct Entry {
    job: Job,
    state: TaskState,
    retried: u32,
    max_retry: u32,
    timeout: Duration,
    retention: Option<Duration>,
    last_error: Option<String>,
}

type Key = (String, String);

struct Claimed {
    key: Key,
    job: Job,
    timeout: Duration,
}

/// Process-local queue engine.
///
/// Honors the contract the scheduler relies on: task ids are unique per queue
/// for as long as the task is scheduled, running, retained or archived;
/// failed attempts are retried with exponential backoff up to `max_retry` and
/// then archived. Clones share the same task table.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    tasks: Arc<Mutex<HashMap<Key, Entry>>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of a task, if the queue still holds it.
    pub fn state(&self, queue: &str, id: &str) -> Option<TaskState> {
        self.tasks()
            .get(&(queue.to_string(), id.to_string()))
            .map(|e| e.state)
    }

    /// Error message of the task's most recent failed attempt.
    pub fn last_error(&self, queue: &str, id: &str) -> Option<String> {
        self.tasks()
            .get(&(queue.to_string(), id.to_string()))
            .and_then(|e| e.last_error.clone())
    }

    /// Scheduled jobs of `queue`, earliest first.
    pub fn scheduled(&self, queue: &str) -> Vec<(Job, DateTime<Utc>)> {
        let tasks = self.tasks();
        let mut jobs: Vec<_> = tasks
            .iter()
            .filter(|((q, _), _)| q == queue)
            .filter_map(|(_, e)| match e.state {
                TaskState::Scheduled { at } => Some((e.job.clone(), at)),
                _ => None,
            })
            .collect();
        jobs.sort_by_key(|(_, at)| *at);
        jobs
    }

    /// Number of tasks held across all queues.
    pub fn len(&self) -> usize {
        self.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every job that is due right now, one after another, and return how
    /// many ran.
    pub async fn run_due(&self, handler: &dyn JobHandler) -> usize {
        let claimed = self.claim_due(Utc::now(), usize::MAX);
        let count = claimed.len();
        for c in claimed {
            let outcome = execute(handler, &c).await;
            self.finish(c.key, outcome, Utc::now());
        }
        count
    }

    /// Poll for due jobs until `shutdown` flips to `true`, running at most
    /// `concurrency` handlers at once.
    pub async fn serve(
        &self,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(concurrency, "memory queue serving");
        let permits = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut interval = tokio::time::interval(POLL_INTERVAL);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let mut held = Vec::new();
                    while let Ok(permit) = Arc::clone(&permits).try_acquire_owned() {
                        held.push(permit);
                    }
                    if held.is_empty() {
                        continue;
                    }
                    let claimed = self.claim_due(Utc::now(), held.len());
                    for (c, permit) in claimed.into_iter().zip(held) {
                        let queue = self.clone();
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            let outcome = execute(handler.as_ref(), &c).await;
                            queue.finish(c.key, outcome, Utc::now());
                            drop(permit);
                        });
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        info!("memory queue stopping");
                        break;
                    }
                }
            }
        }
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<Key, Entry>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Vec<Claimed> {
        let mut tasks = self.tasks();
        // retention over: the id is free again
        tasks.retain(|_, e| {
            !matches!(e.state, TaskState::Completed { expires_at } if expires_at <= now)
        });

        let mut due: Vec<(Key, DateTime<Utc>)> = tasks
            .iter()
            .filter_map(|(k, e)| match e.state {
                TaskState::Scheduled { at } if at <= now => Some((k.clone(), at)),
                _ => None,
            })
            .collect();
        due.sort_by_key(|(_, at)| *at);
        due.truncate(limit);

        due.into_iter()
            .filter_map(|(key, _)| {
                let entry = tasks.get_mut(&key)?;
                entry.state = TaskState::Active;
                Some(Claimed {
                    job: entry.job.clone(),
                    timeout: entry.timeout,
                    key,
                })
            })
            .collect()
    }

    fn finish(&self, key: Key, outcome: Result<(), String>, now: DateTime<Utc>) {
        let mut tasks = self.tasks();
        let Some(entry) = tasks.get_mut(&key) else {
            return;
        };

        let keep = match outcome {
            Ok(()) => match entry.retention.filter(|r| !r.is_zero()) {
                Some(retention) => {
                    entry.state = TaskState::Completed {
                        expires_at: now + to_chrono(retention),
                    };
                    true
                }
                None => false,
            },
            Err(reason) => {
                if entry.retried < entry.max_retry {
                    entry.retried += 1;
                    let at = now + retry_delay(entry.retried);
                    debug!(queue = %key.0, id = %key.1, retried = entry.retried, %at, error = %reason, "task scheduled for retry");
                    entry.state = TaskState::Scheduled { at };
                } else {
                    warn!(queue = %key.0, id = %key.1, retried = entry.retried, error = %reason, "task archived");
                    entry.state = TaskState::Archived { last_failed_at: now };
                }
                entry.last_error = Some(reason);
                true
            }
        };

        if !keep {
            tasks.remove(&key);
        }
    }
}

async fn execute(handler: &dyn JobHandler, claimed: &Claimed) -> Result<(), String> {
    handler
        .process(&claimed.job, claimed.timeout)
        .await
        .map_err(|e| e.to_string())
}

fn retry_delay(retried: u32) -> chrono::Duration {
    let secs = (1i64 << retried.min(16)).min(MAX_RETRY_DELAY_SECS);
    chrono::Duration::seconds(secs)
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero())
}

#[async_trait]
impl QueueEngine for MemoryQueue {
    async fn submit(&self, mut job: Job, opts: SubmitOptions) -> Result<String, QueueError> {
        if job.id.is_empty() {
            job.id = Uuid::new_v4().to_string();
        }
        let now = Utc::now();
        let key = (opts.queue.clone(), job.id.clone());
        let mut tasks = self.tasks();

        if let Some(existing) = tasks.get(&key) {
            let expired = matches!(existing.state, TaskState::Completed { expires_at } if expires_at <= now);
            if !expired {
                return Err(QueueError::TaskIdConflict { id: job.id });
            }
        }

        let at = opts.schedule.resolve(now);
        debug!(queue = %opts.queue, id = %job.id, task_type = %job.task_type, %at, "task enqueued");
        let id = job.id.clone();
        tasks.insert(
            key,
            Entry {
                job,
                state: TaskState::Scheduled { at },
                retried: 0,
                max_retry: opts.max_retry,
                timeout: opts.timeout,
                retention: opts.retention,
                last_error: None,
            },
        );
        Ok(id)
    }

    async fn delete_task(&self, queue: &str, id: &str) -> Result<(), QueueError> {
        let key = (queue.to_string(), id.to_string());
        let mut tasks = self.tasks();
        match tasks.get(&key).map(|e| e.state) {
            None => Err(QueueError::TaskNotFound {
                queue: queue.to_string(),
                id: id.to_string(),
            }),
            Some(TaskState::Active) => Err(QueueError::TaskActive { id: id.to_string() }),
            Some(_) => {
                tasks.remove(&key);
                Ok(())
            }
        }
    }

    async fn list_archived(
        &self,
        queue: &str,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<ArchivedJob>, QueueError> {
        let tasks = self.tasks();
        let mut archived: Vec<ArchivedJob> = tasks
            .iter()
            .filter(|((q, _), _)| q == queue)
            .filter_map(|(_, e)| match e.state {
                TaskState::Archived { last_failed_at } => Some(ArchivedJob {
                    id: e.job.id.clone(),
                    task_type: e.job.task_type.clone(),
                    last_failed_at: Some(last_failed_at),
                    retried: e.retried,
                    max_retry: e.max_retry,
                }),
                _ => None,
            })
            .collect();
        archived.sort_by(|a, b| {
            b.last_failed_at
                .cmp(&a.last_failed_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        let skip = page.max(1).saturating_sub(1).saturating_mul(page_size);
        Ok(archived.into_iter().skip(skip).take(page_size).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SchedulerError;
    use crate::queue::ProcessSchedule;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    impl Counting {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl JobHandler for Counting {
        async fn process(&self, _job: &Job, _timeout: Duration) -> Result<(), SchedulerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(SchedulerError::Validation("intentional failure".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn job(id: &str) -> Job {
        Job {
            id: id.to_string(),
            task_type: "test.once".to_string(),
            payload: "p".to_string(),
        }
    }

    fn opts(max_retry: u32, retention: Option<Duration>) -> SubmitOptions {
        SubmitOptions {
            queue: "q".to_string(),
            max_retry,
            timeout: Duration::from_secs(5),
            retention,
            schedule: ProcessSchedule::Now,
        }
    }

    #[tokio::test]
    async fn duplicate_id_conflicts_while_scheduled() {
        let queue = MemoryQueue::new();
        queue.submit(job("a"), opts(0, None)).await.unwrap();
        let err = queue.submit(job("a"), opts(0, None)).await.unwrap_err();
        assert!(matches!(err, QueueError::TaskIdConflict { .. }));
    }

    #[tokio::test]
    async fn same_id_in_other_queue_is_independent() {
        let queue = MemoryQueue::new();
        queue.submit(job("a"), opts(0, None)).await.unwrap();
        let mut other = opts(0, None);
        other.queue = "other".to_string();
        assert!(queue.submit(job("a"), other).await.is_ok());
    }

    #[tokio::test]
    async fn completed_task_is_retained_then_released() {
        let queue = MemoryQueue::new();
        let handler = Counting::new(false);

        queue
            .submit(job("r"), opts(0, Some(Duration::from_secs(60))))
            .await
            .unwrap();
        assert_eq!(queue.run_due(&handler).await, 1);
        assert!(matches!(queue.state("q", "r"), Some(TaskState::Completed { .. })));
        assert!(queue.submit(job("r"), opts(0, None)).await.is_err());

        queue.submit(job("n"), opts(0, None)).await.unwrap();
        queue.run_due(&handler).await;
        assert_eq!(queue.state("q", "n"), None);
        assert!(queue.submit(job("n"), opts(0, None)).await.is_ok());
    }

    #[tokio::test]
    async fn expired_completions_are_evicted() {
        let queue = MemoryQueue::new();
        let handler = Counting::new(false);
        for i in 0..200 {
            queue
                .submit(job(&format!("o{i}")), opts(0, Some(Duration::from_millis(1))))
                .await
                .unwrap();
        }
        assert_eq!(queue.run_due(&handler).await, 200);
        assert_eq!(queue.len(), 200);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.run_due(&handler).await, 0);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn handler_receives_the_job_timeout() {
        struct Deadline(Mutex<Option<Duration>>);

        #[async_trait]
        impl JobHandler for Deadline {
            async fn process(&self, _job: &Job, timeout: Duration) -> Result<(), SchedulerError> {
                *self.0.lock().unwrap() = Some(timeout);
                Ok(())
            }
        }

        let queue = MemoryQueue::new();
        let handler = Deadline(Mutex::new(None));
        queue.submit(job("t"), opts(0, None)).await.unwrap();
        queue.run_due(&handler).await;
        assert_eq!(*handler.0.lock().unwrap(), Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn failure_without_retries_archives() {
        let queue = MemoryQueue::new();
        let handler = Counting::new(true);
        queue.submit(job("f"), opts(0, None)).await.unwrap();
        queue.run_due(&handler).await;

        let archived = queue.list_archived("q", 1, 100).await.unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].id, "f");
        assert_eq!(archived[0].retried, 0);
        assert!(archived[0].last_failed_at.is_some());
        assert!(queue
            .last_error("q", "f")
            .unwrap()
            .contains("intentional failure"));
        // archived ids stay reserved
        assert!(queue.submit(job("f"), opts(0, None)).await.is_err());
    }

    #[tokio::test]
    async fn failure_with_retries_reschedules() {
        let queue = MemoryQueue::new();
        let handler = Counting::new(true);
        queue.submit(job("f"), opts(2, None)).await.unwrap();
        queue.run_due(&handler).await;

        match queue.state("q", "f") {
            Some(TaskState::Scheduled { at }) => assert!(at > Utc::now()),
            other => panic!("expected retry schedule, got {other:?}"),
        }
        assert!(queue.list_archived("q", 1, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn future_jobs_are_not_due() {
        let queue = MemoryQueue::new();
        let handler = Counting::new(false);
        let mut o = opts(0, None);
        o.schedule = ProcessSchedule::In(Duration::from_secs(3600));
        queue.submit(job("later"), o).await.unwrap();

        assert_eq!(queue.run_due(&handler).await, 0);
        assert_eq!(queue.scheduled("q").len(), 1);
    }

    #[tokio::test]
    async fn delete_respects_state() {
        let queue = MemoryQueue::new();
        let err = queue.delete_task("q", "missing").await.unwrap_err();
        assert!(matches!(err, QueueError::TaskNotFound { .. }));

        queue.submit(job("d"), opts(0, None)).await.unwrap();
        queue.delete_task("q", "d").await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn archived_listing_is_paginated() {
        let queue = MemoryQueue::new();
        let handler = Counting::new(true);
        for i in 0..5 {
            queue.submit(job(&format!("j{i}")), opts(0, None)).await.unwrap();
        }
        queue.run_due(&handler).await;

        assert_eq!(queue.list_archived("q", 1, 2).await.unwrap().len(), 2);
        assert_eq!(queue.list_archived("q", 3, 2).await.unwrap().len(), 1);
        assert!(queue.list_archived("q", 4, 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn serve_runs_due_jobs_until_shutdown() {
        let queue = MemoryQueue::new();
        let handler = Arc::new(Counting::new(false));
        queue.submit(job("s"), opts(0, None)).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let server = {
            let queue = queue.clone();
            let handler: Arc<dyn JobHandler> = handler.clone();
            tokio::spawn(async move { queue.serve(handler, 2, rx).await })
        };

        for _ in 0..50 {
            if handler.calls.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tx.send(true).unwrap();
        server.await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }
}
