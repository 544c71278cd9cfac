use anyhow::Context as _;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column as _, Row as _};

/// Prefix shared by every scheduler-owned column. Columns carrying this
/// prefix are never forwarded to the job subprocess.
pub const RESERVED_PREFIX: &str = "JOBSCHEDULER_";

/// Lifecycle state of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Waiting to be claimed (initial state, and the retry state after a
    /// timeout, interrupt, or orphan recovery).
    Pending,
    /// Claimed by a worker; a subprocess may be executing it.
    Running,
    /// Finished with exit code 0.
    Done,
    /// Finished with a failure.
    Error,
}

impl JobStatus {
    /// Store representation of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }

}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One user column of a claimed job, in table declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobArg {
    /// Column name as declared by the batch file.
    pub column: String,
    /// Column value; `None` (SQL NULL) values are skipped when building argv.
    pub value: Option<String>,
}

/// A job atomically transitioned from `pending` to `running` by this worker.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    /// Stable job identity.
    pub job_id: String,
    /// Scheduling priority (higher wins).
    pub priority: i64,
    /// Estimated runtime in hours.
    pub estimate_time: f64,
    /// User columns in table declaration order.
    pub args: Vec<JobArg>,
}

impl ClaimedJob {
    pub(crate) fn from_row(row: &SqliteRow) -> anyhow::Result<Self> {
        let job_id: String = row
            .try_get("JOBSCHEDULER_JOB_ID")
            .context("job row is missing JOBSCHEDULER_JOB_ID")?;
        let priority = row
            .try_get::<Option<i64>, _>("JOBSCHEDULER_PRIORITY")?
            .unwrap_or(0);
        let estimate_time = row
            .try_get::<Option<f64>, _>("JOBSCHEDULER_ESTIMATE_TIME")?
            .unwrap_or(0.0);

        let mut args = Vec::new();
        for column in row.columns() {
            let name = column.name();
            if name.starts_with(RESERVED_PREFIX) {
                continue;
            }
            args.push(JobArg {
                column: name.to_string(),
                value: row.try_get::<Option<String>, _>(column.ordinal())?,
            });
        }

        Ok(Self {
            job_id,
            priority,
            estimate_time,
            args,
        })
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    /// All rows.
    pub total: i64,
    /// Rows in `pending`.
    pub pending: i64,
    /// Rows in `running`.
    pub running: i64,
    /// Rows in `done`.
    pub done: i64,
    /// Rows in `error`.
    pub error: i64,
}
