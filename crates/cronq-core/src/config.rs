use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

pub const DEFAULT_GROUP: &str = "task";
pub const DEFAULT_PERIOD_KEY: &str = "period.task";
pub const DEFAULT_CATEGORY: &str = "task";
pub const DEFAULT_MAX_RETRY: u32 = 3;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_RETENTION_SECS: u64 = 60;
pub const DEFAULT_CALLBACK_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONCURRENCY: usize = 10;
pub const DEFAULT_LEASE_SECS: u64 = 10;
pub const DEFAULT_POLL_INITIAL_MS: u64 = 100;
pub const DEFAULT_POLL_MAX_MS: u64 = 1_000;
pub const DEFAULT_MAX_WAIT_SECS: u64 = 30;

/// Top-level config (cronq.toml + CRONQ_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronqConfig {
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub lock: LockConfig,
    /// Periodic tasks registered by the server on start.
    #[serde(default)]
    pub tasks: Vec<TaskSeed>,
}

/// Group-wide scheduling defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Queue name; also namespaces the task hash and the lock key.
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default = "default_period_key")]
    pub period_key: String,
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retention applied to one-off submissions without an explicit override.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Archive reaper interval. 0 disables the reaper.
    #[serde(default)]
    pub clear_archived_secs: u64,
    /// HTTP endpoint receiving fired jobs when no local handler is set.
    #[serde(default)]
    pub callback: Option<String>,
    #[serde(default = "default_callback_timeout_secs")]
    pub callback_timeout_secs: u64,
    /// Handler parallelism of the bundled in-memory queue engine.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            group: default_group(),
            period_key: default_period_key(),
            max_retry: DEFAULT_MAX_RETRY,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            retention_secs: DEFAULT_RETENTION_SECS,
            clear_archived_secs: 0,
            callback: None,
            callback_timeout_secs: DEFAULT_CALLBACK_TIMEOUT_SECS,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl WorkerConfig {
    /// Hash holding every periodic task of this group.
    pub fn hash_key(&self) -> String {
        format!("{}.{}", self.group, self.period_key)
    }

    /// Key of the group's leader lock.
    pub fn lock_key(&self) -> String {
        format!("{}.lock", self.hash_key())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreBackend {
    /// Shared hash + `SET NX` lease; the only backend suitable for a fleet.
    #[default]
    Redis,
    /// Single file, single node.
    Sqlite,
    /// Process-local; lost on restart.
    Memory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Redis connection URI, e.g. `redis://127.0.0.1:6379/0`.
    #[serde(default)]
    pub uri: Option<String>,
    /// SQLite database file.
    #[serde(default)]
    pub path: Option<String>,
}

/// Leader lock lease and bounded-acquire policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_poll_initial_ms")]
    pub poll_initial_ms: u64,
    #[serde(default = "default_poll_max_ms")]
    pub poll_max_ms: u64,
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_secs: DEFAULT_LEASE_SECS,
            poll_initial_ms: DEFAULT_POLL_INITIAL_MS,
            poll_max_ms: DEFAULT_POLL_MAX_MS,
            max_wait_secs: DEFAULT_MAX_WAIT_SECS,
        }
    }
}

/// A periodic task declared in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSeed {
    pub uid: String,
    #[serde(default = "default_category")]
    pub category: String,
    pub expr: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub max_retry: u32,
    #[serde(default)]
    pub timeout_secs: u64,
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}
fn default_period_key() -> String {
    DEFAULT_PERIOD_KEY.to_string()
}
fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}
fn default_max_retry() -> u32 {
    DEFAULT_MAX_RETRY
}
fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}
fn default_retention_secs() -> u64 {
    DEFAULT_RETENTION_SECS
}
fn default_callback_timeout_secs() -> u64 {
    DEFAULT_CALLBACK_TIMEOUT_SECS
}
fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}
fn default_lease_secs() -> u64 {
    DEFAULT_LEASE_SECS
}
fn default_poll_initial_ms() -> u64 {
    DEFAULT_POLL_INITIAL_MS
}
fn default_poll_max_ms() -> u64 {
    DEFAULT_POLL_MAX_MS
}
fn default_max_wait_secs() -> u64 {
    DEFAULT_MAX_WAIT_SECS
}

impl CronqConfig {
    /// Load config from a TOML file with CRONQ_* env var overrides.
    ///
    /// Nested keys use a double underscore: `CRONQ_WORKER__GROUP=billing`.
    /// A missing file is not an error; every field has a default.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("CRONQ_").split("__")),
        )
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let config: CronqConfig = figment
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would only fail later, at first use.
    pub fn validate(&self) -> Result<()> {
        if self.worker.group.trim().is_empty() {
            return Err(CoreError::Config("worker.group must not be empty".to_string()));
        }
        if self.worker.concurrency == 0 {
            return Err(CoreError::Config("worker.concurrency must be at least 1".to_string()));
        }
        if self.lock.lease_secs == 0 {
            return Err(CoreError::Config("lock.lease_secs must be at least 1".to_string()));
        }
        match self.store.backend {
            StoreBackend::Redis if blank(&self.store.uri) => Err(CoreError::Config(
                "store.uri is required for the redis backend".to_string(),
            )),
            StoreBackend::Sqlite if blank(&self.store.path) => Err(CoreError::Config(
                "store.path is required for the sqlite backend".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

fn blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cronq/cronq.toml", home)
}
