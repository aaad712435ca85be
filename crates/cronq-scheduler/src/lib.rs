//! `cronq-scheduler`: cron and one-off scheduling on top of a work-queue
//! engine that only understands "enqueue now / enqueue at a deadline".
//!
//! # Overview
//!
//! Periodic task definitions live in a [`store::TaskStore`] hash, one per
//! group. Every second the [`engine::SchedulerEngine`] of whichever replica
//! holds the group's [`lock::LeaderLock`] submits each task's pending
//! occurrence to the [`queue::QueueEngine`], using the task uid as queue task
//! id. The engine's id uniqueness turns repeated submissions into harmless
//! conflicts, so a fleet of replicas fires each occurrence once.
//!
//! | Piece                     | Role                                              |
//! |---------------------------|---------------------------------------------------|
//! | [`schedule`]              | next occurrence of a cron expression (UTC)        |
//! | [`store`]                 | redis / sqlite / memory record store              |
//! | [`lock`]                  | expiring lease lock, bounded blocking acquire     |
//! | [`engine`]                | scan loop                                         |
//! | [`dispatch`]              | runs fired jobs, counts executions                |
//! | [`reaper`]                | deletes archived jobs after a cadence-based grace |
//! | [`Worker`]                | registration API, spawns the loops                |

pub mod backend;
pub mod context;
pub mod db;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod lock;
pub mod queue;
pub mod reaper;
pub mod schedule;
pub mod store;
pub mod types;
pub mod worker;

pub use backend::{open_backends, Backends};
pub use context::SchedulerContext;
pub use dispatch::{handler_fn, Dispatcher, HttpCallback, TaskHandler};
pub use engine::{ScanSummary, SchedulerEngine};
pub use error::{Result, SchedulerError};
pub use queue::{MemoryQueue, QueueEngine, QueueError};
pub use reaper::{ArchiveReaper, ReapSummary};
pub use types::{OnceSchedule, RunOptions};
pub use worker::{Worker, WorkerBuilder};
