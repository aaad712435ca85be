use std::time::Duration;

use chrono::{DateTime, Utc};
use cronq_core::config::DEFAULT_CATEGORY;

use crate::queue::ProcessSchedule;

/// When a one-off registration should fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnceSchedule {
    /// At an absolute UTC instant.
    At(DateTime<Utc>),
    /// After a delay from submission.
    In(Duration),
    /// As soon as a worker is free; submitted with a one second delay.
    Immediately,
}

impl OnceSchedule {
    pub(crate) fn to_process(self) -> ProcessSchedule {
        match self {
            OnceSchedule::At(at) => ProcessSchedule::At(at),
            OnceSchedule::In(delay) => ProcessSchedule::In(delay),
            OnceSchedule::Immediately => ProcessSchedule::In(Duration::from_secs(1)),
        }
    }
}

/// Per-registration settings for [`crate::Worker::cron`] and
/// [`crate::Worker::once`].
///
/// ```
/// use std::time::Duration;
/// use cronq_scheduler::RunOptions;
///
/// let opts = RunOptions::new("nightly-report")
///     .category("report")
///     .cron("0 0 3 * * *")
///     .payload(r#"{"format":"pdf"}"#)
///     .max_retry(5)
///     .timeout(Duration::from_secs(120));
/// assert_eq!(opts.uid, "nightly-report");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub uid: String,
    pub category: String,
    pub payload: String,
    /// Cron expression; required by `cron`, ignored by `once`.
    pub expr: Option<String>,
    /// Fire time of a one-off job. `None` enqueues for immediate processing.
    pub schedule: Option<OnceSchedule>,
    /// 0 means the group default.
    pub max_retry: u32,
    pub timeout: Option<Duration>,
    /// One-off only; overrides the group retention.
    pub retention: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            uid: String::new(),
            category: DEFAULT_CATEGORY.to_string(),
            payload: String::new(),
            expr: None,
            schedule: None,
            max_retry: 0,
            timeout: None,
            retention: None,
        }
    }
}

impl RunOptions {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            ..Self::default()
        }
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn cron(mut self, expr: impl Into<String>) -> Self {
        self.expr = Some(expr.into());
        self
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.schedule = Some(OnceSchedule::At(at));
        self
    }

    pub fn process_in(mut self, delay: Duration) -> Self {
        self.schedule = Some(OnceSchedule::In(delay));
        self
    }

    pub fn immediately(mut self) -> Self {
        self.schedule = Some(OnceSchedule::Immediately);
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    pub(crate) fn process_schedule(&self) -> ProcessSchedule {
        self.schedule
            .map(OnceSchedule::to_process)
            .unwrap_or(ProcessSchedule::Now)
    }
}
