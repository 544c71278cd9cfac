use chrono::{NaiveDateTime, Utc};

use crate::store::JobStore;

/// Breakdown of `pending` jobs by dependency state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingBreakdown {
    /// Pending jobs with every dependency `done` (claimable now).
    pub ready: i64,
    /// Pending jobs waiting on a dependency that is `pending` or `running`.
    pub waiting: i64,
    /// Pending jobs blocked by an errored or missing dependency.
    pub blocked: i64,
}

/// A job currently in `running`.
#[derive(Debug, Clone)]
pub struct RunningJob {
    /// Job identity.
    pub job_id: String,
    /// Claim timestamp.
    pub started_at: Option<String>,
    /// Scheduling priority.
    pub priority: i64,
    /// Claiming worker, when the store tracks workers.
    pub worker_id: Option<String>,
    /// Last heartbeat timestamp, when the store tracks heartbeats.
    pub heartbeat: Option<String>,
}

impl RunningJob {
    /// Age of the last heartbeat in seconds, if one was recorded.
    pub fn heartbeat_age_seconds(&self) -> Option<i64> {
        let heartbeat = self.heartbeat.as_deref()?;
        let parsed = NaiveDateTime::parse_from_str(heartbeat, "%Y-%m-%d %H:%M:%S").ok()?;
        Some((Utc::now().naive_utc() - parsed).num_seconds())
    }
}

/// A recently finished job.
#[derive(Debug, Clone)]
pub struct CompletedJob {
    /// Job identity.
    pub job_id: String,
    /// Terminal status (`done` or `error`).
    pub status: String,
    /// Wall-clock runtime in seconds.
    pub elapsed_time: Option<f64>,
}

impl JobStore {
    /// Classify pending jobs by dependency state, or `None` when the store
    /// has no dependency relation.
    pub async fn pending_breakdown(&self) -> anyhow::Result<Option<PendingBreakdown>> {
        let has_deps: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'job_dependencies'",
        )
        .fetch_one(&self.pool)
        .await?;
        if has_deps == 0 {
            return Ok(None);
        }

        let ready: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs j \
             WHERE j.JOBSCHEDULER_STATUS = 'pending' \
             AND NOT EXISTS ( \
               SELECT 1 FROM job_dependencies d \
               LEFT JOIN jobs dep ON d.depends_on = dep.JOBSCHEDULER_JOB_ID \
               WHERE d.job_id = j.JOBSCHEDULER_JOB_ID \
               AND (dep.JOBSCHEDULER_STATUS IS NULL OR dep.JOBSCHEDULER_STATUS != 'done'))",
        )
        .fetch_one(&self.pool)
        .await?;

        let waiting: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs j \
             WHERE j.JOBSCHEDULER_STATUS = 'pending' \
             AND EXISTS ( \
               SELECT 1 FROM job_dependencies d \
               JOIN jobs dep ON d.depends_on = dep.JOBSCHEDULER_JOB_ID \
               WHERE d.job_id = j.JOBSCHEDULER_JOB_ID \
               AND dep.JOBSCHEDULER_STATUS IN ('running', 'pending'))",
        )
        .fetch_one(&self.pool)
        .await?;

        let blocked: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs j \
             WHERE j.JOBSCHEDULER_STATUS = 'pending' \
             AND EXISTS ( \
               SELECT 1 FROM job_dependencies d \
               LEFT JOIN jobs dep ON d.depends_on = dep.JOBSCHEDULER_JOB_ID \
               WHERE d.job_id = j.JOBSCHEDULER_JOB_ID \
               AND (dep.JOBSCHEDULER_STATUS IS NULL OR dep.JOBSCHEDULER_STATUS = 'error'))",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(Some(PendingBreakdown {
            ready,
            waiting,
            blocked,
        }))
    }

    /// Jobs currently in `running`, most recently started first.
    pub async fn running_jobs(&self) -> anyhow::Result<Vec<RunningJob>> {
        let has_worker_cols: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pragma_table_info('jobs') \
             WHERE name IN ('JOBSCHEDULER_WORKER_ID', 'JOBSCHEDULER_HEARTBEAT')",
        )
        .fetch_one(&self.pool)
        .await?;

        if has_worker_cols == 2 {
            let rows: Vec<(String, Option<String>, Option<i64>, Option<String>, Option<String>)> =
                sqlx::query_as(
                    "SELECT JOBSCHEDULER_JOB_ID, JOBSCHEDULER_STARTED_AT, JOBSCHEDULER_PRIORITY, \
                     JOBSCHEDULER_WORKER_ID, JOBSCHEDULER_HEARTBEAT \
                     FROM jobs WHERE JOBSCHEDULER_STATUS = 'running' \
                     ORDER BY JOBSCHEDULER_STARTED_AT DESC",
                )
                .fetch_all(&self.pool)
                .await?;
            Ok(rows
                .into_iter()
                .map(|(job_id, started_at, priority, worker_id, heartbeat)| RunningJob {
                    job_id,
                    started_at,
                    priority: priority.unwrap_or(0),
                    worker_id,
                    heartbeat,
                })
                .collect())
        } else {
            let rows: Vec<(String, Option<String>, Option<i64>)> = sqlx::query_as(
                "SELECT JOBSCHEDULER_JOB_ID, JOBSCHEDULER_STARTED_AT, JOBSCHEDULER_PRIORITY \
                 FROM jobs WHERE JOBSCHEDULER_STATUS = 'running' \
                 ORDER BY JOBSCHEDULER_STARTED_AT DESC",
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(rows
                .into_iter()
                .map(|(job_id, started_at, priority)| RunningJob {
                    job_id,
                    started_at,
                    priority: priority.unwrap_or(0),
                    worker_id: None,
                    heartbeat: None,
                })
                .collect())
        }
    }

    /// The most recently finished jobs (done or error), newest first.
    pub async fn recent_completed(&self, limit: i64) -> anyhow::Result<Vec<CompletedJob>> {
        let rows: Vec<(String, String, Option<f64>)> = sqlx::query_as(
            "SELECT JOBSCHEDULER_JOB_ID, JOBSCHEDULER_STATUS, JOBSCHEDULER_ELAPSED_TIME \
             FROM jobs WHERE JOBSCHEDULER_STATUS IN ('done', 'error') \
             ORDER BY JOBSCHEDULER_FINISHED_AT DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(job_id, status, elapsed_time)| CompletedJob {
                job_id,
                status,
                elapsed_time,
            })
            .collect())
    }

    /// Mean elapsed time of done jobs multiplied by the pending count, or
    /// `None` before the first completion.
    pub async fn estimated_remaining_seconds(&self) -> anyhow::Result<Option<f64>> {
        let avg: Option<f64> = sqlx::query_scalar(
            "SELECT AVG(JOBSCHEDULER_ELAPSED_TIME) FROM jobs \
             WHERE JOBSCHEDULER_STATUS = 'done' AND JOBSCHEDULER_ELAPSED_TIME IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        let Some(avg) = avg else {
            return Ok(None);
        };
        let pending: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE JOBSCHEDULER_STATUS = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        Ok(Some(avg * pending as f64))
    }
}
