use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use cronq_core::config::{CronqConfig, StoreBackend, TaskSeed};
use cronq_scheduler::{lock::AcquirePolicy, open_backends, MemoryQueue, RunOptions, Worker};
use tracing::{info, warn};

/// Runs the scan loop, the dispatcher and the archive reaper of one group.
#[derive(Debug, Parser)]
#[command(name = "cronq-server", version)]
struct Args {
    /// Config file. Falls back to $CRONQ_CONFIG, then ~/.cronq/cronq.toml.
    #[arg(long)]
    config: Option<String>,

    /// Override `worker.group`.
    #[arg(long)]
    group: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cronq_server=info,cronq_scheduler=info".into()),
        )
        .init();

    let args = Args::parse();

    // load config: --config > CRONQ_CONFIG env > ~/.cronq/cronq.toml
    let config_path = args.config.or_else(|| std::env::var("CRONQ_CONFIG").ok());
    let mut config = CronqConfig::load(config_path.as_deref())?;
    if let Some(group) = args.group {
        config.worker.group = group;
        config.validate()?;
    }

    let backends = open_backends(&config).await?;
    if let Some(note) = shared_store_note(config.store.backend) {
        warn!("{note}");
    }
    let queue = MemoryQueue::new();
    let worker = Worker::builder(config.worker.clone())
        .acquire_policy(AcquirePolicy::from(&config.lock))
        .backends(backends)
        .queue(Arc::new(queue.clone()))
        .build()?;

    seed_tasks(&worker, &config.tasks).await;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut loops = worker.start(shutdown_rx.clone());
    {
        let queue = queue.clone();
        let handler = worker.dispatcher();
        let concurrency = config.worker.concurrency;
        loops.push(tokio::spawn(async move {
            queue.serve(handler, concurrency, shutdown_rx).await
        }));
    }

    info!(
        group = %config.worker.group,
        backend = ?config.store.backend,
        callback = config.worker.callback.as_deref().unwrap_or("-"),
        "cronq server running"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    // signal every loop to stop
    let _ = shutdown_tx.send(true);
    for handle in loops {
        if let Err(e) = handle.await {
            warn!("loop task ended abnormally: {e}");
        }
    }
    Ok(())
}

/// Register the `[[tasks]]` declared in the config. A bad entry is logged and
/// skipped so the rest still run.
async fn seed_tasks(worker: &Worker, seeds: &[TaskSeed]) {
    for seed in seeds {
        match worker.cron(seed_options(seed)).await {
            Ok(()) => info!(uid = %seed.uid, expr = %seed.expr, "seeded periodic task"),
            Err(e) => warn!(uid = %seed.uid, code = e.code(), "seed task rejected: {e}"),
        }
    }
}

/// The queue of this binary lives in the process. With a fleet-shared store,
/// `remove` on one replica cannot reach an instance queued by another.
fn shared_store_note(backend: StoreBackend) -> Option<&'static str> {
    match backend {
        StoreBackend::Redis => Some(
            "store and lock are shared but the queue is process-local; \
             pending instances queued by other replicas survive a remove",
        ),
        StoreBackend::Sqlite | StoreBackend::Memory => None,
    }
}

fn seed_options(seed: &TaskSeed) -> RunOptions {
    let mut opts = RunOptions::new(seed.uid.clone())
        .category(seed.category.clone())
        .cron(seed.expr.clone())
        .payload(seed.payload.clone())
        .max_retry(seed.max_retry);
    if seed.timeout_secs > 0 {
        opts = opts.timeout(Duration::from_secs(seed.timeout_secs));
    }
    opts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_maps_to_cron_registration() {
        let seed = TaskSeed {
            uid: "nightly".to_string(),
            category: "report".to_string(),
            expr: "0 0 3 * * *".to_string(),
            payload: "{}".to_string(),
            max_retry: 2,
            timeout_secs: 0,
        };
        let opts = seed_options(&seed);
        assert_eq!(opts.uid, "nightly");
        assert_eq!(opts.category, "report");
        assert_eq!(opts.expr.as_deref(), Some("0 0 3 * * *"));
        assert_eq!(opts.max_retry, 2);
        assert_eq!(opts.timeout, None);
    }

    #[test]
    fn only_shared_backends_warn_about_the_local_queue() {
        assert!(shared_store_note(StoreBackend::Redis).is_some());
        assert!(shared_store_note(StoreBackend::Sqlite).is_none());
        assert!(shared_store_note(StoreBackend::Memory).is_none());
    }

    #[test]
    fn args_parse() {
        let args = Args::parse_from(["cronq-server", "--config", "/etc/cronq.toml", "--group", "billing"]);
        assert_eq!(args.config.as_deref(), Some("/etc/cronq.toml"));
        assert_eq!(args.group.as_deref(), Some("billing"));
    }
}
