use std::time::Duration;

use thiserror::Error;

use crate::queue::QueueError;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Missing or invalid backend settings, detected at construction.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rejected registration input (e.g. empty uid). Nothing was written.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidExpression { expr: String, reason: String },

    #[error("Cron expression '{expr}' has no future occurrence")]
    NoOccurrence { expr: String },

    /// Backend-independent store failure (undecodable record, poisoned handle).
    #[error("Store error: {0}")]
    Store(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Bounded lock acquisition gave up.
    #[error("Leader lock not acquired within {waited:?}")]
    LockTimeout { waited: Duration },

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// The handler or callback outlived the job's timeout.
    #[error("Job deadline exceeded after {timeout:?}")]
    DeadlineExceeded { timeout: Duration },

    #[error("HTTP callback returned status {status}")]
    CallbackStatus { status: u16 },

    #[error("HTTP callback failed: {0}")]
    Http(#[from] reqwest::Error),

    /// A local task handler returned an error.
    #[error("Handler failed: {0:#}")]
    Handler(anyhow::Error),
}

impl SchedulerError {
    /// Short error code string used in structured logs.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Config(_) => "CONFIG_ERROR",
            SchedulerError::Validation(_) => "VALIDATION_ERROR",
            SchedulerError::InvalidExpression { .. } => "INVALID_EXPRESSION",
            SchedulerError::NoOccurrence { .. } => "NO_OCCURRENCE",
            SchedulerError::Store(_) => "STORE_ERROR",
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::Redis(_) => "REDIS_ERROR",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
            SchedulerError::LockTimeout { .. } => "LOCK_TIMEOUT",
            SchedulerError::Queue(_) => "QUEUE_ERROR",
            SchedulerError::DeadlineExceeded { .. } => "DEADLINE_EXCEEDED",
            SchedulerError::CallbackStatus { .. } => "CALLBACK_STATUS",
            SchedulerError::Http(_) => "CALLBACK_TRANSPORT",
            SchedulerError::Handler(_) => "HANDLER_ERROR",
        }
    }
}

impl From<cronq_core::CoreError> for SchedulerError {
    fn from(e: cronq_core::CoreError) -> Self {
        match e {
            cronq_core::CoreError::Config(msg) => SchedulerError::Config(msg),
            cronq_core::CoreError::Serialization(e) => SchedulerError::Serialization(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
