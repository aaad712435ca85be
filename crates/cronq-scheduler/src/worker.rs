use std::sync::Arc;
use std::time::Duration;

use cronq_core::{
    config::WorkerConfig,
    types::{cron_type, once_type},
    PeriodTask,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    backend::Backends,
    context::SchedulerContext,
    dispatch::{Dispatcher, HttpCallback, TaskHandler},
    engine::SchedulerEngine,
    error::{Result, SchedulerError},
    lock::{acquire, AcquirePolicy, LeaderLock},
    queue::{Job, JobHandler, QueueEngine, QueueError, SubmitOptions},
    reaper::ArchiveReaper,
    schedule::next_occurrence,
    store::TaskStore,
    types::RunOptions,
};

/// Registration API and loop owner of one scheduler group.
pub struct Worker {
    ctx: Arc<SchedulerContext>,
    dispatcher: Arc<Dispatcher>,
}

pub struct WorkerBuilder {
    config: WorkerConfig,
    acquire: AcquirePolicy,
    store: Option<Arc<dyn TaskStore>>,
    lock: Option<Arc<dyn LeaderLock>>,
    queue: Option<Arc<dyn QueueEngine>>,
    handler: Option<Arc<dyn TaskHandler>>,
}

impl WorkerBuilder {
    pub fn acquire_policy(mut self, policy: AcquirePolicy) -> Self {
        self.acquire = policy;
        self
    }

    pub fn backends(mut self, backends: Backends) -> Self {
        self.store = Some(backends.store);
        self.lock = Some(backends.lock);
        self
    }

    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn lock(mut self, lock: Arc<dyn LeaderLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn queue(mut self, queue: Arc<dyn QueueEngine>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Local handler; takes precedence over `WorkerConfig::callback`.
    pub fn handler(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn build(self) -> Result<Worker> {
        if self.config.group.trim().is_empty() {
            return Err(SchedulerError::Config("group must not be empty".to_string()));
        }
        let store = self
            .store
            .ok_or_else(|| SchedulerError::Config("no task store configured".to_string()))?;
        let lock = self
            .lock
            .ok_or_else(|| SchedulerError::Config("no leader lock configured".to_string()))?;
        let queue = self
            .queue
            .ok_or_else(|| SchedulerError::Config("no queue engine configured".to_string()))?;

        let callback = match self.config.callback.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => Some(HttpCallback::new(
                url,
                Duration::from_secs(self.config.callback_timeout_secs),
            )?),
            _ => None,
        };

        let ctx = Arc::new(SchedulerContext {
            store,
            lock,
            queue,
            config: self.config,
            acquire: self.acquire,
        });
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&ctx), self.handler, callback));
        Ok(Worker { ctx, dispatcher })
    }
}

impl Worker {
    pub fn builder(config: WorkerConfig) -> WorkerBuilder {
        WorkerBuilder {
            config,
            acquire: AcquirePolicy::default(),
            store: None,
            lock: None,
            queue: None,
            handler: None,
        }
    }

    pub fn context(&self) -> &Arc<SchedulerContext> {
        &self.ctx
    }

    /// The handler to register with the queue engine.
    pub fn dispatcher(&self) -> Arc<dyn JobHandler> {
        Arc::clone(&self.dispatcher) as Arc<dyn JobHandler>
    }

    /// Register (or replace) a periodic task. The first occurrence is the
    /// next one after now; the scan loop submits it.
    ///
    /// Re-registering an existing uid keeps its `processed` count.
    pub async fn cron(&self, opts: RunOptions) -> Result<()> {
        require_uid(&opts.uid)?;
        let expr = opts
            .expr
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| SchedulerError::InvalidExpression {
                expr: String::new(),
                reason: "missing cron expression".to_string(),
            })?;
        let next = next_occurrence(expr, 0)?;

        let mut task = PeriodTask {
            expr: expr.to_string(),
            task_type: cron_type(&opts.category),
            uid: opts.uid.clone(),
            payload: opts.payload,
            next,
            processed: 0,
            max_retry: opts.max_retry,
            timeout: opts.timeout.map_or(0, |t| t.as_secs()),
        };

        let lease = acquire(self.ctx.lock.as_ref(), &self.ctx.acquire).await?;
        let result = async {
            if let Some(existing) = self.ctx.store.get(&task.uid).await? {
                task.processed = existing.processed;
            }
            self.ctx.store.save(&task).await
        }
        .await;
        self.release(lease).await;
        result?;

        info!(uid = %task.uid, expr = %task.expr, next = task.next, "periodic task registered");
        Ok(())
    }

    /// Submit a one-off job straight to the queue engine.
    pub async fn once(&self, opts: RunOptions) -> Result<()> {
        require_uid(&opts.uid)?;
        let config = &self.ctx.config;
        let retention = opts
            .retention
            .unwrap_or(Duration::from_secs(config.retention_secs));

        let submit = SubmitOptions {
            queue: self.ctx.queue_name().to_string(),
            max_retry: self.ctx.max_retry(opts.max_retry),
            timeout: opts
                .timeout
                .unwrap_or(Duration::from_secs(config.timeout_secs)),
            retention: (!retention.is_zero()).then_some(retention),
            schedule: opts.process_schedule(),
        };
        let job = Job {
            id: opts.uid,
            task_type: once_type(&opts.category),
            payload: opts.payload,
        };

        let id = self.ctx.queue.submit(job, submit).await?;
        info!(uid = %id, "one-off task submitted");
        Ok(())
    }

    /// Delete a periodic task and any not-yet-running instance of it.
    pub async fn remove(&self, uid: &str) -> Result<()> {
        require_uid(uid)?;
        let lease = acquire(self.ctx.lock.as_ref(), &self.ctx.acquire).await?;
        let result = self.remove_locked(uid).await;
        self.release(lease).await;
        result
    }

    async fn remove_locked(&self, uid: &str) -> Result<()> {
        let removed = self.ctx.store.delete(uid).await?;
        match self.ctx.queue.delete_task(self.ctx.queue_name(), uid).await {
            Ok(()) => debug!(%uid, "pending instance deleted"),
            Err(QueueError::TaskNotFound { .. }) => {}
            Err(QueueError::TaskActive { .. }) => {
                debug!(%uid, "instance is running and will finish");
            }
            Err(e) => return Err(e.into()),
        }
        info!(%uid, removed, "periodic task removed");
        Ok(())
    }

    pub async fn get(&self, uid: &str) -> Result<Option<PeriodTask>> {
        self.ctx.store.get(uid).await
    }

    pub async fn list(&self) -> Result<Vec<PeriodTask>> {
        self.ctx.store.list_all().await
    }

    /// Spawn the scan loop, plus the archive reaper when
    /// `clear_archived_secs` is set. Both stop when `shutdown` flips to true.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = vec![tokio::spawn(
            SchedulerEngine::new(Arc::clone(&self.ctx)).run(shutdown.clone()),
        )];
        let every = self.ctx.config.clear_archived_secs;
        if every > 0 {
            let reaper = ArchiveReaper::new(Arc::clone(&self.ctx), Duration::from_secs(every));
            handles.push(tokio::spawn(reaper.run(shutdown)));
        }
        handles
    }

    async fn release(&self, lease: crate::lock::Lease) {
        if let Err(e) = self.ctx.lock.release(lease).await {
            warn!(code = e.code(), "leader lock release failed: {e}");
        }
    }
}

fn require_uid(uid: &str) -> Result<()> {
    if uid.trim().is_empty() {
        return Err(SchedulerError::Validation("uid must not be empty".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryLeaderLock;
    use crate::queue::{MemoryQueue, ProcessSchedule, TaskState};
    use crate::store::MemoryTaskStore;
    use chrono::Utc;

    struct Parts {
        worker: Worker,
        store: MemoryTaskStore,
        queue: MemoryQueue,
    }

    fn parts() -> Parts {
        let config = WorkerConfig::default();
        let store = MemoryTaskStore::new(config.hash_key());
        let queue = MemoryQueue::new();
        let worker = Worker::builder(config)
            .store(Arc::new(store.clone()))
            .lock(Arc::new(MemoryLeaderLock::new(Duration::from_secs(10))))
            .queue(Arc::new(queue.clone()))
            .build()
            .unwrap();
        Parts { worker, store, queue }
    }

    #[tokio::test]
    async fn cron_stores_definition() {
        let Parts { worker, .. } = parts();
        let before = Utc::now().timestamp();
        worker
            .cron(
                RunOptions::new("a")
                    .category("report")
                    .cron("*/5 * * * * *")
                    .payload("p1"),
            )
            .await
            .unwrap();

        let task = worker.get("a").await.unwrap().unwrap();
        assert_eq!(task.task_type, "report.cron");
        assert_eq!(task.payload, "p1");
        assert!(task.next > before);
        assert_eq!(task.next % 5, 0);
        assert_eq!(worker.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cron_rejects_bad_input_without_writing() {
        let Parts { worker, store, .. } = parts();

        let err = worker.cron(RunOptions::new("").cron("* * * * * *")).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let err = worker.cron(RunOptions::new("a")).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_EXPRESSION");

        let err = worker.cron(RunOptions::new("a").cron("every tuesday")).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_EXPRESSION");

        assert!(store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn re_registration_keeps_processed() {
        let Parts { worker, store, .. } = parts();
        worker.cron(RunOptions::new("a").cron("0 * * * * *")).await.unwrap();
        let mut task = store.get("a").await.unwrap().unwrap();
        task.processed = 7;
        store.save(&task).await.unwrap();

        worker.cron(RunOptions::new("a").cron("0 */2 * * * *")).await.unwrap();
        let task = store.get("a").await.unwrap().unwrap();
        assert_eq!(task.processed, 7);
        assert_eq!(task.expr, "0 */2 * * * *");
    }

    #[tokio::test]
    async fn once_submits_with_group_defaults() {
        let Parts { worker, queue, .. } = parts();
        worker
            .once(RunOptions::new("m-1").category("mail").payload("hi").immediately())
            .await
            .unwrap();

        let scheduled = queue.scheduled("task");
        assert_eq!(scheduled.len(), 1);
        let (job, at) = &scheduled[0];
        assert_eq!(job.task_type, "mail.once");
        assert_eq!(job.id, "m-1");
        assert!(*at > Utc::now());

        // the uid is the task id, so a duplicate conflicts
        let err = worker.once(RunOptions::new("m-1")).await.unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Queue(QueueError::TaskIdConflict { .. })
        ));
    }

    #[tokio::test]
    async fn once_without_schedule_is_due_now() {
        let Parts { worker, queue, .. } = parts();
        worker.once(RunOptions::new("now")).await.unwrap();
        assert_eq!(queue.run_due(worker.dispatcher().as_ref()).await, 1);
        // retained for the group default
        assert!(matches!(
            queue.state("task", "now"),
            Some(TaskState::Completed { .. })
        ));
    }

    #[tokio::test]
    async fn once_rejects_empty_uid() {
        let Parts { worker, queue, .. } = parts();
        let err = worker.once(RunOptions::new("  ")).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn remove_deletes_record_and_pending_instance() {
        let Parts { worker, store, queue } = parts();
        worker.cron(RunOptions::new("a").cron("0 0 * * * *")).await.unwrap();
        let task = store.get("a").await.unwrap().unwrap();
        queue
            .submit(
                Job {
                    id: "a".to_string(),
                    task_type: task.task_type,
                    payload: String::new(),
                },
                SubmitOptions {
                    queue: "task".to_string(),
                    max_retry: 0,
                    timeout: Duration::from_secs(1),
                    retention: None,
                    schedule: ProcessSchedule::In(Duration::from_secs(3600)),
                },
            )
            .await
            .unwrap();

        worker.remove("a").await.unwrap();
        assert!(worker.get("a").await.unwrap().is_none());
        assert!(queue.is_empty());

        // unknown uid is fine
        worker.remove("a").await.unwrap();
    }

    #[tokio::test]
    async fn build_requires_collaborators() {
        let err = Worker::builder(WorkerConfig::default()).build().err().unwrap();
        assert_eq!(err.code(), "CONFIG_ERROR");

        let mut config = WorkerConfig::default();
        config.group = String::new();
        let err = Worker::builder(config)
            .store(Arc::new(MemoryTaskStore::new("x")))
            .lock(Arc::new(MemoryLeaderLock::new(Duration::from_secs(1))))
            .queue(Arc::new(MemoryQueue::new()))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("group"));
    }

    #[tokio::test]
    async fn start_spawns_reaper_only_when_enabled() {
        let Parts { worker, .. } = parts();
        let (tx, rx) = watch::channel(false);
        let handles = worker.start(rx);
        assert_eq!(handles.len(), 1);
        tx.send(true).unwrap();
        for h in handles {
            h.await.unwrap();
        }

        let mut config = WorkerConfig::default();
        config.clear_archived_secs = 30;
        let worker = Worker::builder(config)
            .store(Arc::new(MemoryTaskStore::new("x")))
            .lock(Arc::new(MemoryLeaderLock::new(Duration::from_secs(1))))
            .queue(Arc::new(MemoryQueue::new()))
            .build()
            .unwrap();
        let (tx, rx) = watch::channel(false);
        let handles = worker.start(rx);
        assert_eq!(handles.len(), 2);
        tx.send(true).unwrap();
        for h in handles {
            h.await.unwrap();
        }
    }
}
