//! Boundary to the underlying work-queue engine.
//!
//! The scheduler only needs "enqueue now / enqueue at a deadline", deletion of
//! a not-yet-running task and a listing of archived (terminally failed) tasks.
//! Dispatch, retry and backoff belong to the engine.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::error::SchedulerError;

pub mod memory;

pub use memory::{MemoryQueue, TaskState};

/// A unit of work as the engine sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Task id; unique per queue while the engine still holds the task.
    pub id: String,
    /// Task type, `<category>.cron` or `<category>.once`.
    pub task_type: String,
    pub payload: String,
}

/// When the engine should make the job available to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSchedule {
    Now,
    At(DateTime<Utc>),
    In(Duration),
}

impl ProcessSchedule {
    pub fn resolve(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            ProcessSchedule::Now => now,
            ProcessSchedule::At(at) => *at,
            ProcessSchedule::In(delay) => chrono::Duration::from_std(*delay)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOptions {
    pub queue: String,
    pub max_retry: u32,
    pub timeout: Duration,
    /// How long the engine keeps a completed task around, blocking reuse of its id.
    pub retention: Option<Duration>,
    pub schedule: ProcessSchedule,
}

/// A terminally failed task as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedJob {
    pub id: String,
    pub task_type: String,
    pub last_failed_at: Option<DateTime<Utc>>,
    pub retried: u32,
    pub max_retry: u32,
}

#[derive(Debug, Error)]
pub enum QueueError {
    /// A task with this id is still held (scheduled, running or retained).
    #[error("task id conflicts with another task: {id}")]
    TaskIdConflict { id: String },

    #[error("task not found: {queue}/{id}")]
    TaskNotFound { queue: String, id: String },

    /// Running tasks cannot be deleted.
    #[error("task is running: {id}")]
    TaskActive { id: String },

    #[error("queue backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait QueueEngine: Send + Sync {
    /// Enqueue `job`; returns the task id.
    async fn submit(&self, job: Job, opts: SubmitOptions) -> Result<String, QueueError>;

    /// Delete a task that is not running.
    async fn delete_task(&self, queue: &str, id: &str) -> Result<(), QueueError>;

    /// One page (1-based) of archived tasks, most recent failure first.
    async fn list_archived(
        &self,
        queue: &str,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<ArchivedJob>, QueueError>;
}

/// Invoked by the engine once per fired job. An `Err` counts as a failed
/// attempt and is subject to the engine's retry policy.
///
/// `timeout` is the job's deadline (zero for none). The handler enforces it,
/// so bookkeeping that must follow every attempt is never cut off.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn process(&self, job: &Job, timeout: Duration) -> Result<(), SchedulerError>;
}
