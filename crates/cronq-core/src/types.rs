use serde::{Deserialize, Serialize};

/// Task type suffix carried by every periodic submission.
pub const CRON_SUFFIX: &str = ".cron";
/// Task type suffix carried by every one-off submission.
pub const ONCE_SUFFIX: &str = ".once";

/// A recurring job definition, persisted as JSON under its `uid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodTask {
    /// Cron expression; the source of truth for recurrence.
    pub expr: String,
    /// Queue task type the occurrence is submitted under (`<category>.cron`).
    #[serde(rename = "group")]
    pub task_type: String,
    pub uid: String,
    /// Opaque content handed to the handler verbatim.
    #[serde(default)]
    pub payload: String,
    /// Unix timestamp of the occurrence not yet submitted.
    pub next: i64,
    /// Completed executions. Never decreases.
    #[serde(default)]
    pub processed: i64,
    /// 0 falls back to the group default.
    #[serde(default)]
    pub max_retry: u32,
    /// Seconds; 0 falls back to the group default.
    #[serde(default)]
    pub timeout: u64,
}

impl PeriodTask {
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Envelope handed to the dispatcher (and POSTed to the HTTP callback) for
/// every fired job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Queue task type, e.g. `report.cron` or `mail.once`.
    pub category: String,
    /// Queue task id; the registration uid.
    pub uid: String,
    pub payload: String,
}

impl Payload {
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Build the queue task type for a periodic registration.
pub fn cron_type(category: &str) -> String {
    format!("{category}{CRON_SUFFIX}")
}

/// Build the queue task type for a one-off registration.
pub fn once_type(category: &str) -> String {
    format!("{category}{ONCE_SUFFIX}")
}

/// True when `task_type` names a periodic submission.
pub fn is_periodic(task_type: &str) -> bool {
    task_type.ends_with(CRON_SUFFIX)
}
