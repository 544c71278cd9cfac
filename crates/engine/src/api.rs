//! Public API types for the `jobmill` scheduling engine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for a scheduler run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// SQLite job database path.
    pub db_file: PathBuf,

    /// Command executed for each job. Tokenized on whitespace; the job's
    /// user columns are appended as arguments.
    pub command: String,

    /// Total wall-clock budget per worker, in seconds.
    pub max_runtime: u64,

    /// Safety margin subtracted from the remaining budget when deciding
    /// eligibility and computing deadlines, in seconds.
    pub margin_time: u64,

    /// Host speed divisor applied to job time estimates (this host is N×
    /// a reference host).
    pub speed_factor: f64,

    /// Whether claiming filters out jobs whose estimated runtime does not
    /// fit the remaining budget.
    pub smart_scheduling: bool,

    /// Pass user columns as `--column value` pairs instead of positional
    /// arguments.
    pub named_args: bool,

    /// Number of concurrent workers.
    pub parallel: usize,
}

/// Aggregate result of a finished run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunSummary {
    /// Jobs that finished with exit code 0.
    pub jobs_completed: u64,

    /// Jobs recorded as `error`.
    pub jobs_failed: u64,

    /// Orphaned `running` rows reset to `pending` before workers started.
    pub jobs_recovered: u64,

    /// Total wall-clock runtime of the pool.
    pub total_runtime: Duration,
}

/// Handle to a running engine instance.
pub struct EngineHandle {
    pub(crate) inner: Arc<crate::engine::EngineInner>,
    pub(crate) join: tokio::task::JoinHandle<anyhow::Result<RunSummary>>,
}

/// Clonable stop switch for a running engine, usable from signal handlers.
#[derive(Clone)]
pub struct EngineStopper(pub(crate) Arc<crate::engine::EngineInner>);

impl EngineStopper {
    /// Request a graceful shutdown (finish in-flight jobs, claim nothing new).
    pub fn request_stop(&self) {
        self.0.request_stop();
    }
}

/// Start a new engine instance.
pub fn start_engine(config: EngineConfig) -> EngineHandle {
    crate::engine::start_engine(config)
}

impl EngineHandle {
    /// Stop switch detached from the handle's lifetime.
    pub fn stopper(&self) -> EngineStopper {
        EngineStopper(self.inner.clone())
    }

    /// Request a graceful shutdown.
    pub fn request_stop(&self) {
        self.inner.request_stop();
    }

    /// Wait for the engine to finish and return its summary.
    pub async fn wait(self) -> anyhow::Result<RunSummary> {
        match self.join.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("engine task join error: {err}")),
        }
    }
}
