//! Execution of fired jobs.
//!
//! The queue engine calls [`Dispatcher`] once per attempt. A local
//! [`TaskHandler`] wins over the HTTP callback; with neither configured the
//! attempt succeeds without doing anything. Every attempt, successful or not,
//! bumps the `processed` counter of the matching periodic record.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cronq_core::Payload;
use reqwest::StatusCode;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    context::SchedulerContext,
    error::{Result, SchedulerError},
    lock::acquire,
    queue::{Job, JobHandler},
};

/// User code run for every fired job.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, payload: &Payload) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`TaskHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, payload: &Payload) -> anyhow::Result<()> {
        (self.0)(payload.clone()).await
    }
}

/// POSTs the JSON envelope to a fixed URL. Only HTTP 200 counts as success.
#[derive(Clone)]
pub struct HttpCallback {
    client: reqwest::Client,
    url: String,
}

impl HttpCallback {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn post(&self, payload: &Payload) -> Result<()> {
        let body = payload.to_json()?;
        let resp = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if status != StatusCode::OK {
            return Err(SchedulerError::CallbackStatus {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

pub struct Dispatcher {
    ctx: Arc<SchedulerContext>,
    handler: Option<Arc<dyn TaskHandler>>,
    callback: Option<HttpCallback>,
}

impl Dispatcher {
    pub fn new(
        ctx: Arc<SchedulerContext>,
        handler: Option<Arc<dyn TaskHandler>>,
        callback: Option<HttpCallback>,
    ) -> Self {
        Self {
            ctx,
            handler,
            callback,
        }
    }

    /// The handler or callback part of an attempt, bounded by `timeout`.
    async fn attempt(&self, payload: &Payload, correlation: Uuid, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return self.execute(payload, correlation).await;
        }
        tokio::time::timeout(timeout, self.execute(payload, correlation))
            .await
            .unwrap_or(Err(SchedulerError::DeadlineExceeded { timeout }))
    }

    async fn execute(&self, payload: &Payload, correlation: Uuid) -> Result<()> {
        if let Some(handler) = &self.handler {
            return handler
                .handle(payload)
                .await
                .map_err(SchedulerError::Handler);
        }
        if let Some(callback) = &self.callback {
            return callback.post(payload).await;
        }
        info!(%correlation, category = %payload.category, uid = %payload.uid, "no task handler");
        Ok(())
    }

    /// Best effort: the attempt's outcome never depends on this.
    async fn record_processed(&self, uid: &str) {
        let lease = match acquire(self.ctx.lock.as_ref(), &self.ctx.acquire).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(%uid, code = e.code(), "processed count not updated: {e}");
                return;
            }
        };
        let result = self.increment(uid).await;
        if let Err(e) = self.ctx.lock.release(lease).await {
            warn!(code = e.code(), "leader lock release failed: {e}");
        }
        if let Err(e) = result {
            warn!(%uid, code = e.code(), "processed count not updated: {e}");
        }
    }

    async fn increment(&self, uid: &str) -> Result<()> {
        let Some(mut task) = self.ctx.store.get(uid).await? else {
            debug!(%uid, "no periodic record; processed count skipped");
            return Ok(());
        };
        task.processed += 1;
        self.ctx.store.save(&task).await
    }
}

#[async_trait]
impl JobHandler for Dispatcher {
    async fn process(&self, job: &Job, timeout: Duration) -> Result<()> {
        let correlation = Uuid::new_v4();
        let payload = Payload {
            category: job.task_type.clone(),
            uid: job.id.clone(),
            payload: job.payload.clone(),
        };

        let result = self.attempt(&payload, correlation, timeout).await;
        if let Err(e) = &result {
            error!(
                %correlation,
                code = e.code(),
                category = %payload.category,
                uid = %payload.uid,
                payload = %payload.payload,
                "run task failed: {e}"
            );
        }

        self.record_processed(&payload.uid).await;
        result
    }
}
