use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info};

use jobmill_store::{JobStatus, JobStore, StoreError};

use crate::api::EngineConfig;
use crate::command::build_argv;
use crate::engine::EngineInner;
use crate::supervisor::{self, RETRY_EXIT_CODE};

/// Delay between retries after a fatal store error.
const STORE_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Consecutive fatal store failures a worker tolerates before giving up.
const MAX_STORE_FAILURES: u32 = 10;

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct WorkerStats {
    pub(crate) jobs_completed: u64,
    pub(crate) jobs_failed: u64,
}

fn is_busy(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<StoreError>(), Some(StoreError::Busy))
}

pub(crate) async fn run_worker(
    worker_idx: usize,
    inner: Arc<EngineInner>,
    store: JobStore,
    config: Arc<EngineConfig>,
) -> WorkerStats {
    let worker_name = format!("worker-{worker_idx}");
    let start = Instant::now();
    let mut stats = WorkerStats::default();
    let mut claim_failures: u32 = 0;

    while !inner.should_stop() {
        let elapsed = start.elapsed().as_secs_f64();
        if elapsed >= config.max_runtime as f64 {
            info!("Worker {worker_idx}: reached maximum total runtime. Stopping.");
            break;
        }
        let available = config.max_runtime as f64 - elapsed - config.margin_time as f64;
        if available <= 0.0 {
            info!("Worker {worker_idx}: no time left within the margin. Stopping.");
            break;
        }

        let job = match store
            .claim_next(
                &worker_name,
                available,
                config.speed_factor,
                config.smart_scheduling,
            )
            .await
        {
            Ok(Some(job)) => {
                claim_failures = 0;
                job
            }
            Ok(None) => {
                info!("Worker {worker_idx}: no eligible jobs available. Stopping.");
                break;
            }
            Err(err) if is_busy(&err) => {
                // Another claimer held the write lock. Not exhaustion; the
                // next attempt may well succeed.
                continue;
            }
            Err(err) => {
                claim_failures += 1;
                if claim_failures >= MAX_STORE_FAILURES {
                    error!(
                        "Worker {worker_idx}: claim failed {claim_failures} times in a row, giving up: {err:#}"
                    );
                    break;
                }
                error!(
                    "Worker {worker_idx}: claim failed (attempt {claim_failures}): {err:#}; retrying in {}s",
                    STORE_RETRY_DELAY.as_secs()
                );
                tokio::time::sleep(STORE_RETRY_DELAY).await;
                continue;
            }
        };

        let argv = build_argv(&config.command, config.named_args, &job);
        let outcome = supervisor::run_job(
            &inner,
            &job.job_id,
            &argv,
            Duration::from_secs_f64(available),
        )
        .await;

        let (status, message) = match outcome.exit_code {
            0 => (JobStatus::Done, None),
            RETRY_EXIT_CODE => (JobStatus::Pending, outcome.error_message),
            _ => (JobStatus::Error, outcome.error_message),
        };

        let mut finalize_failures: u32 = 0;
        let recorded = loop {
            match store
                .finalize(
                    &job.job_id,
                    status,
                    outcome.elapsed_seconds,
                    message.as_deref(),
                )
                .await
            {
                Ok(()) => break true,
                // The busy timeout already waited; go straight back in.
                Err(err) if is_busy(&err) => continue,
                Err(err) => {
                    finalize_failures += 1;
                    if finalize_failures >= MAX_STORE_FAILURES {
                        error!(
                            "Worker {worker_idx}: failed to record job {} as {status} after {finalize_failures} attempts, giving up: {err:#}",
                            job.job_id
                        );
                        break false;
                    }
                    error!(
                        "Worker {worker_idx}: failed to record job {} as {status} (attempt {finalize_failures}): {err:#}; retrying in {}s",
                        job.job_id,
                        STORE_RETRY_DELAY.as_secs()
                    );
                    tokio::time::sleep(STORE_RETRY_DELAY).await;
                }
            }
        };
        if !recorded {
            // The row stays 'running'; the next startup recovery re-queues it.
            break;
        }

        match status {
            JobStatus::Done => stats.jobs_completed += 1,
            JobStatus::Error => stats.jobs_failed += 1,
            JobStatus::Pending => info!(
                "Job {} re-queued for retry: {}",
                job.job_id,
                message.as_deref().unwrap_or("interrupted")
            ),
            JobStatus::Running => {}
        }
        // The outcome above is durable even under shutdown (a killed child
        // was re-queued as pending), so exiting here loses nothing.
        if inner.should_stop() {
            break;
        }
    }

    stats
}
