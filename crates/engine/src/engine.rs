use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;
use tracing::{error, info, warn};

use jobmill_store::JobStore;

use crate::api::{EngineConfig, EngineHandle, RunSummary};
use crate::worker::run_worker;

pub(crate) struct EngineInner {
    stop_requested: AtomicBool,
}

impl EngineInner {
    pub(crate) fn new() -> Self {
        Self {
            stop_requested: AtomicBool::new(false),
        }
    }

    pub(crate) fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            info!("Stop requested; workers will exit after their current job.");
        }
    }

    pub(crate) fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

pub(crate) fn start_engine(config: EngineConfig) -> EngineHandle {
    let inner = Arc::new(EngineInner::new());
    let join = tokio::spawn(run_engine(inner.clone(), config));
    EngineHandle { inner, join }
}

async fn run_engine(
    inner: Arc<EngineInner>,
    mut config: EngineConfig,
) -> anyhow::Result<RunSummary> {
    if config.parallel == 0 {
        config.parallel = 1;
    }
    let start = Instant::now();

    info!("jobmill {} starting", env!("CARGO_PKG_VERSION"));
    info!("Database: {}", config.db_file.display());
    info!("Command: {}", config.command);
    info!(
        "Max runtime: {}s, margin: {}s, speed factor: {}, smart scheduling: {}, named args: {}, parallel: {}",
        config.max_runtime,
        config.margin_time,
        config.speed_factor,
        config.smart_scheduling,
        config.named_args,
        config.parallel
    );

    let store = JobStore::open(&config.db_file).await?;

    // Rows still 'running' were abandoned by a crashed scheduler; reclaim
    // them before any worker can observe them.
    info!("Checking for stuck jobs...");
    let jobs_recovered = match store.recover_orphans().await {
        Ok(0) => {
            info!("No stuck jobs found");
            0
        }
        Ok(count) => {
            warn!("Reset {count} stuck jobs from 'running' back to 'pending'");
            count
        }
        Err(err) => {
            error!("Failed to recover stuck jobs: {err:#}");
            0
        }
    };

    let config = Arc::new(config);
    let mut workers = JoinSet::new();
    for worker_idx in 0..config.parallel {
        workers.spawn(run_worker(
            worker_idx,
            inner.clone(),
            store.clone(),
            config.clone(),
        ));
    }

    let mut summary = RunSummary {
        jobs_recovered,
        ..Default::default()
    };
    while let Some(res) = workers.join_next().await {
        match res {
            Ok(stats) => {
                summary.jobs_completed += stats.jobs_completed;
                summary.jobs_failed += stats.jobs_failed;
            }
            Err(err) => error!("worker task join error: {err:#}"),
        }
    }

    summary.total_runtime = start.elapsed();
    info!(
        "jobmill finished in {:.2}s: {} completed, {} failed",
        summary.total_runtime.as_secs_f64(),
        summary.jobs_completed,
        summary.jobs_failed
    );
    Ok(summary)
}
