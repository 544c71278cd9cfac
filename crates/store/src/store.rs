use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::SqlitePool;
use tracing::warn;

use crate::job::{ClaimedJob, JobStatus, StatusCounts};

/// How long a connection waits on the SQLite write lock before reporting
/// SQLITE_BUSY.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Store-level failures a caller may want to tell apart.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Another writer held the database lock past the busy timeout. The
    /// operation was rolled back and can simply be attempted again.
    #[error("database is locked")]
    Busy,
}

fn is_busy(err: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db) = err else {
        return false;
    };
    if matches!(db.code().as_deref(), Some("5") | Some("6")) {
        return true;
    }
    let msg = db.message().to_ascii_lowercase();
    msg.contains("database is locked") || msg.contains("database table is locked")
}

fn lock_aware(err: sqlx::Error) -> anyhow::Error {
    if is_busy(&err) {
        anyhow::Error::new(StoreError::Busy)
    } else {
        anyhow::Error::new(err)
    }
}

/// Gateway to the shared `jobs` table.
///
/// Every write path runs under `BEGIN IMMEDIATE` so the write lock is taken
/// up front and claim conflicts surface before any mutation. Lock conflicts
/// roll back and surface as [`StoreError::Busy`]; the store never retries
/// internally.
#[derive(Clone)]
pub struct JobStore {
    pub(crate) pool: SqlitePool,
}

impl JobStore {
    /// Open an existing job database.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        Self::open_inner(path, false).await
    }

    /// Open a job database, creating the file if it does not exist yet.
    pub async fn open_or_create(path: &Path) -> anyhow::Result<Self> {
        Self::open_inner(path, true).await
    }

    async fn open_inner(path: &Path, create: bool) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(create)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(32)
            .acquire_timeout(BUSY_TIMEOUT)
            .connect_with(options)
            .await
            .with_context(|| format!("open job database {}", path.display()))?;

        Ok(Self { pool })
    }

    /// Atomically claim the next eligible pending job and transition it to
    /// `running`.
    ///
    /// Eligibility: `pending` status; every dependency `done` (when the
    /// dependency relation exists — a missing dependency row blocks); and,
    /// with `smart` enabled, an estimated runtime that fits
    /// `available_seconds` after normalizing by `speed_factor`. Ties are
    /// broken by priority (higher first), then job id.
    ///
    /// Returns `Ok(None)` when no job is eligible, and
    /// [`StoreError::Busy`] when a concurrent claimer held the write lock.
    pub async fn claim_next(
        &self,
        worker: &str,
        available_seconds: f64,
        speed_factor: f64,
        smart: bool,
    ) -> anyhow::Result<Option<ClaimedJob>> {
        if available_seconds <= 0.0 {
            return Ok(None);
        }

        let mut tx = match self.pool.begin_with("BEGIN IMMEDIATE").await {
            Ok(tx) => tx,
            Err(err) if is_busy(&err) => {
                warn!("Database lock conflict while claiming: {err}");
                return Err(anyhow::Error::new(StoreError::Busy));
            }
            Err(err) => return Err(err.into()),
        };

        let has_deps: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'job_dependencies'",
        )
        .fetch_one(&mut *tx)
        .await?;

        let mut sql = String::from("SELECT j.* FROM jobs j WHERE j.JOBSCHEDULER_STATUS = 'pending'");
        if has_deps > 0 {
            // A dependency row pointing at a missing or non-done job blocks
            // the dependent.
            sql.push_str(
                " AND NOT EXISTS ( \
                   SELECT 1 FROM job_dependencies d \
                   LEFT JOIN jobs dep ON d.depends_on = dep.JOBSCHEDULER_JOB_ID \
                   WHERE d.job_id = j.JOBSCHEDULER_JOB_ID \
                   AND (dep.JOBSCHEDULER_STATUS IS NULL OR dep.JOBSCHEDULER_STATUS != 'done'))",
            );
        }
        if smart {
            sql.push_str(" AND (j.JOBSCHEDULER_ESTIMATE_TIME * 3600.0 / ?) <= ?");
        }
        sql.push_str(" ORDER BY j.JOBSCHEDULER_PRIORITY DESC, j.JOBSCHEDULER_JOB_ID LIMIT 1");

        let mut query = sqlx::query(&sql);
        if smart {
            query = query.bind(speed_factor).bind(available_seconds);
        }
        let Some(row) = query.fetch_optional(&mut *tx).await? else {
            return Ok(None);
        };
        let job = ClaimedJob::from_row(&row)?;

        let has_worker_cols: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pragma_table_info('jobs') \
             WHERE name IN ('JOBSCHEDULER_WORKER_ID', 'JOBSCHEDULER_HEARTBEAT')",
        )
        .fetch_one(&mut *tx)
        .await?;

        let update = if has_worker_cols == 2 {
            sqlx::query(
                "UPDATE jobs SET JOBSCHEDULER_STATUS = 'running', \
                 JOBSCHEDULER_STARTED_AT = datetime('now'), \
                 JOBSCHEDULER_WORKER_ID = ?, \
                 JOBSCHEDULER_HEARTBEAT = datetime('now') \
                 WHERE JOBSCHEDULER_JOB_ID = ?",
            )
            .bind(worker)
            .bind(&job.job_id)
        } else {
            sqlx::query(
                "UPDATE jobs SET JOBSCHEDULER_STATUS = 'running', \
                 JOBSCHEDULER_STARTED_AT = datetime('now') \
                 WHERE JOBSCHEDULER_JOB_ID = ?",
            )
            .bind(&job.job_id)
        };
        update.execute(&mut *tx).await.map_err(lock_aware)?;

        match tx.commit().await {
            Ok(()) => Ok(Some(job)),
            Err(err) if is_busy(&err) => {
                warn!("Database lock conflict while claiming: {err}");
                Err(anyhow::Error::new(StoreError::Busy))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Reset every orphaned `running` row back to `pending`, clearing its
    /// start timestamp. Returns the number of rows recovered.
    pub async fn recover_orphans(&self) -> anyhow::Result<u64> {
        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(lock_aware)?;
        let result = sqlx::query(
            "UPDATE jobs SET JOBSCHEDULER_STATUS = 'pending', \
             JOBSCHEDULER_STARTED_AT = NULL \
             WHERE JOBSCHEDULER_STATUS = 'running'",
        )
        .execute(&mut *tx)
        .await
        .map_err(lock_aware)?;
        tx.commit().await.map_err(lock_aware)?;
        Ok(result.rows_affected())
    }

    /// Record a job's terminal state (or re-queue it as `pending` after a
    /// retryable interruption).
    pub async fn finalize(
        &self,
        job_id: &str,
        status: JobStatus,
        elapsed_seconds: f64,
        error_message: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(lock_aware)?;
        sqlx::query(
            "UPDATE jobs SET JOBSCHEDULER_STATUS = ?, \
             JOBSCHEDULER_ELAPSED_TIME = ?, \
             JOBSCHEDULER_FINISHED_AT = datetime('now'), \
             JOBSCHEDULER_ERROR_MESSAGE = ? \
             WHERE JOBSCHEDULER_JOB_ID = ?",
        )
        .bind(status.as_str())
        .bind(elapsed_seconds)
        .bind(error_message)
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(lock_aware)?;
        tx.commit().await.map_err(lock_aware)?;
        Ok(())
    }

    /// Count rows per status.
    pub async fn count_by_status(&self) -> anyhow::Result<StatusCounts> {
        let row: (i64, i64, i64, i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), \
             COALESCE(SUM(JOBSCHEDULER_STATUS = 'pending'), 0), \
             COALESCE(SUM(JOBSCHEDULER_STATUS = 'running'), 0), \
             COALESCE(SUM(JOBSCHEDULER_STATUS = 'done'), 0), \
             COALESCE(SUM(JOBSCHEDULER_STATUS = 'error'), 0) \
             FROM jobs",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StatusCounts {
            total: row.0,
            pending: row.1,
            running: row.2,
            done: row.3,
            error: row.4,
        })
    }

    /// Rewrite every row back to `pending`, clearing all execution fields.
    /// Administrative; the scheduler itself never calls this.
    pub async fn reset_all(&self) -> anyhow::Result<u64> {
        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(lock_aware)?;
        let result = sqlx::query(
            "UPDATE jobs SET JOBSCHEDULER_STATUS = 'pending', \
             JOBSCHEDULER_STARTED_AT = NULL, \
             JOBSCHEDULER_FINISHED_AT = NULL, \
             JOBSCHEDULER_ELAPSED_TIME = NULL, \
             JOBSCHEDULER_ERROR_MESSAGE = NULL",
        )
        .execute(&mut *tx)
        .await
        .map_err(lock_aware)?;
        tx.commit().await.map_err(lock_aware)?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch;
    use tempfile::TempDir;

    async fn scratch_store(user_columns: &[&str]) -> (TempDir, JobStore) {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open_or_create(&dir.path().join("jobs.db"))
            .await
            .unwrap();
        let columns: Vec<String> = user_columns.iter().map(|c| c.to_string()).collect();
        batch::create_schema(&store, &columns).await.unwrap();
        (dir, store)
    }

    async fn insert_job(store: &JobStore, job_id: &str, priority: i64, estimate_hours: f64) {
        sqlx::query(
            "INSERT INTO jobs (JOBSCHEDULER_JOB_ID, JOBSCHEDULER_STATUS, \
             JOBSCHEDULER_PRIORITY, JOBSCHEDULER_ESTIMATE_TIME) VALUES (?, 'pending', ?, ?)",
        )
        .bind(job_id)
        .bind(priority)
        .bind(estimate_hours)
        .execute(&store.pool)
        .await
        .unwrap();
    }

    async fn insert_dependency(store: &JobStore, job_id: &str, depends_on: &str) {
        sqlx::query("INSERT INTO job_dependencies (job_id, depends_on) VALUES (?, ?)")
            .bind(job_id)
            .bind(depends_on)
            .execute(&store.pool)
            .await
            .unwrap();
    }

    async fn status_of(store: &JobStore, job_id: &str) -> String {
        sqlx::query_scalar("SELECT JOBSCHEDULER_STATUS FROM jobs WHERE JOBSCHEDULER_JOB_ID = ?")
            .bind(job_id)
            .fetch_one(&store.pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn claim_prefers_priority_then_job_id() {
        let (_dir, store) = scratch_store(&[]).await;
        insert_job(&store, "lo-b", 1, 0.0).await;
        insert_job(&store, "hi", 9, 0.0).await;
        insert_job(&store, "lo-a", 1, 0.0).await;

        let first = store.claim_next("w", 60.0, 1.0, true).await.unwrap().unwrap();
        let second = store.claim_next("w", 60.0, 1.0, true).await.unwrap().unwrap();
        let third = store.claim_next("w", 60.0, 1.0, true).await.unwrap().unwrap();

        assert_eq!(first.job_id, "hi");
        assert_eq!(second.job_id, "lo-a");
        assert_eq!(third.job_id, "lo-b");
        assert!(store.claim_next("w", 60.0, 1.0, true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_marks_row_running_and_stamps_worker() {
        let (_dir, store) = scratch_store(&[]).await;
        insert_job(&store, "a", 0, 0.0).await;

        let job = store
            .claim_next("worker-3", 60.0, 1.0, true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.job_id, "a");

        let (status, started_at, worker_id, heartbeat): (
            String,
            Option<String>,
            Option<String>,
            Option<String>,
        ) = sqlx::query_as(
            "SELECT JOBSCHEDULER_STATUS, JOBSCHEDULER_STARTED_AT, \
             JOBSCHEDULER_WORKER_ID, JOBSCHEDULER_HEARTBEAT \
             FROM jobs WHERE JOBSCHEDULER_JOB_ID = 'a'",
        )
        .fetch_one(&store.pool)
        .await
        .unwrap();
        assert_eq!(status, "running");
        assert!(started_at.is_some());
        assert_eq!(worker_id.as_deref(), Some("worker-3"));
        assert!(heartbeat.is_some());
    }

    #[tokio::test]
    async fn claim_collects_user_columns_in_declared_order() {
        let (_dir, store) = scratch_store(&["alpha", "beta"]).await;
        sqlx::query(
            "INSERT INTO jobs (JOBSCHEDULER_JOB_ID, alpha, beta) VALUES ('a', '1', NULL)",
        )
        .execute(&store.pool)
        .await
        .unwrap();

        let job = store.claim_next("w", 60.0, 1.0, true).await.unwrap().unwrap();
        let columns: Vec<&str> = job.args.iter().map(|a| a.column.as_str()).collect();
        assert_eq!(columns, vec!["alpha", "beta"]);
        assert_eq!(job.args[0].value.as_deref(), Some("1"));
        assert_eq!(job.args[1].value, None);
    }

    #[tokio::test]
    async fn claim_returns_none_on_empty_store() {
        let (_dir, store) = scratch_store(&[]).await;
        assert!(store.claim_next("w", 60.0, 1.0, true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_returns_none_when_no_time_remains() {
        let (_dir, store) = scratch_store(&[]).await;
        insert_job(&store, "a", 0, 0.0).await;
        assert!(store.claim_next("w", 0.0, 1.0, true).await.unwrap().is_none());
        assert!(store.claim_next("w", -5.0, 1.0, true).await.unwrap().is_none());
        assert_eq!(status_of(&store, "a").await, "pending");
    }

    #[tokio::test]
    async fn smart_scheduling_filters_by_estimate_and_speed() {
        let (_dir, store) = scratch_store(&[]).await;
        // 2 hours of estimated work does not fit into one hour at speed 1.
        insert_job(&store, "long", 0, 2.0).await;

        assert!(store.claim_next("w", 3600.0, 1.0, true).await.unwrap().is_none());

        // A 4x host brings it down to 1800s, which fits.
        let job = store.claim_next("w", 3600.0, 4.0, true).await.unwrap().unwrap();
        assert_eq!(job.job_id, "long");
    }

    #[tokio::test]
    async fn smart_scheduling_off_ignores_estimates() {
        let (_dir, store) = scratch_store(&[]).await;
        insert_job(&store, "long", 0, 100.0).await;
        let job = store.claim_next("w", 1.0, 1.0, false).await.unwrap().unwrap();
        assert_eq!(job.job_id, "long");
    }

    #[tokio::test]
    async fn zero_estimate_is_always_deadline_eligible() {
        let (_dir, store) = scratch_store(&[]).await;
        insert_job(&store, "a", 0, 0.0).await;
        let job = store.claim_next("w", 0.5, 1.0, true).await.unwrap().unwrap();
        assert_eq!(job.job_id, "a");
    }

    #[tokio::test]
    async fn dependencies_gate_claiming() {
        let (_dir, store) = scratch_store(&[]).await;
        insert_job(&store, "a", 0, 0.0).await;
        insert_job(&store, "b", 9, 0.0).await;
        insert_dependency(&store, "b", "a").await;

        // Despite its higher priority, b is blocked until a is done.
        let first = store.claim_next("w", 60.0, 1.0, true).await.unwrap().unwrap();
        assert_eq!(first.job_id, "a");
        assert!(store.claim_next("w", 60.0, 1.0, true).await.unwrap().is_none());

        store.finalize("a", JobStatus::Done, 0.1, None).await.unwrap();
        let second = store.claim_next("w", 60.0, 1.0, true).await.unwrap().unwrap();
        assert_eq!(second.job_id, "b");
    }

    #[tokio::test]
    async fn dangling_dependency_blocks() {
        let (_dir, store) = scratch_store(&[]).await;
        insert_job(&store, "b", 0, 0.0).await;
        insert_dependency(&store, "b", "missing").await;
        assert!(store.claim_next("w", 60.0, 1.0, true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn errored_dependency_blocks() {
        let (_dir, store) = scratch_store(&[]).await;
        insert_job(&store, "a", 0, 0.0).await;
        insert_job(&store, "b", 0, 0.0).await;
        insert_dependency(&store, "b", "a").await;

        let first = store.claim_next("w", 60.0, 1.0, true).await.unwrap().unwrap();
        assert_eq!(first.job_id, "a");
        store
            .finalize("a", JobStatus::Error, 0.1, Some("boom"))
            .await
            .unwrap();
        assert!(store.claim_next("w", 60.0, 1.0, true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recover_orphans_is_idempotent() {
        let (_dir, store) = scratch_store(&[]).await;
        insert_job(&store, "a", 0, 0.0).await;
        insert_job(&store, "b", 0, 0.0).await;
        store.claim_next("w", 60.0, 1.0, true).await.unwrap().unwrap();
        store.claim_next("w", 60.0, 1.0, true).await.unwrap().unwrap();

        assert_eq!(store.recover_orphans().await.unwrap(), 2);
        let (started_a, started_b): (Option<String>, Option<String>) = sqlx::query_as(
            "SELECT (SELECT JOBSCHEDULER_STARTED_AT FROM jobs WHERE JOBSCHEDULER_JOB_ID = 'a'), \
             (SELECT JOBSCHEDULER_STARTED_AT FROM jobs WHERE JOBSCHEDULER_JOB_ID = 'b')",
        )
        .fetch_one(&store.pool)
        .await
        .unwrap();
        assert_eq!(started_a, None);
        assert_eq!(started_b, None);
        assert_eq!(status_of(&store, "a").await, "pending");

        // Quiescent store: running recovery again touches nothing.
        assert_eq!(store.recover_orphans().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn finalize_records_terminal_fields() {
        let (_dir, store) = scratch_store(&[]).await;
        insert_job(&store, "a", 0, 0.0).await;
        store.claim_next("w", 60.0, 1.0, true).await.unwrap().unwrap();
        store.finalize("a", JobStatus::Done, 1.25, None).await.unwrap();

        let (status, elapsed, finished, error): (String, Option<f64>, Option<String>, Option<String>) =
            sqlx::query_as(
                "SELECT JOBSCHEDULER_STATUS, JOBSCHEDULER_ELAPSED_TIME, \
                 JOBSCHEDULER_FINISHED_AT, JOBSCHEDULER_ERROR_MESSAGE \
                 FROM jobs WHERE JOBSCHEDULER_JOB_ID = 'a'",
            )
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(status, "done");
        assert_eq!(elapsed, Some(1.25));
        assert!(finished.is_some());
        assert_eq!(error, None);
    }

    #[tokio::test]
    async fn finalize_pending_requeues_for_retry() {
        let (_dir, store) = scratch_store(&[]).await;
        insert_job(&store, "a", 0, 0.0).await;
        store.claim_next("w", 60.0, 1.0, true).await.unwrap().unwrap();
        store
            .finalize(
                "a",
                JobStatus::Pending,
                2.0,
                Some("Timeout: exceeded maximum runtime"),
            )
            .await
            .unwrap();

        assert_eq!(status_of(&store, "a").await, "pending");
        let again = store.claim_next("w", 60.0, 1.0, true).await.unwrap().unwrap();
        assert_eq!(again.job_id, "a");
    }

    #[tokio::test]
    async fn count_by_status_reports_all_buckets() {
        let (_dir, store) = scratch_store(&[]).await;
        for id in ["a", "b", "c", "d"] {
            insert_job(&store, id, 0, 0.0).await;
        }
        store.claim_next("w", 60.0, 1.0, true).await.unwrap().unwrap();
        store.finalize("a", JobStatus::Done, 0.1, None).await.unwrap();
        store.claim_next("w", 60.0, 1.0, true).await.unwrap().unwrap();
        store
            .finalize("b", JobStatus::Error, 0.1, Some("Process exited with code 3"))
            .await
            .unwrap();
        store.claim_next("w", 60.0, 1.0, true).await.unwrap().unwrap();

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.total, 4);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.running, 1);
        assert_eq!(counts.done, 1);
        assert_eq!(counts.error, 1);
    }

    #[tokio::test]
    async fn reset_all_clears_execution_fields() {
        let (_dir, store) = scratch_store(&[]).await;
        insert_job(&store, "a", 0, 0.0).await;
        store.claim_next("w", 60.0, 1.0, true).await.unwrap().unwrap();
        store
            .finalize("a", JobStatus::Error, 0.5, Some("boom"))
            .await
            .unwrap();

        assert_eq!(store.reset_all().await.unwrap(), 1);
        let (status, started, finished, elapsed, error): (
            String,
            Option<String>,
            Option<String>,
            Option<f64>,
            Option<String>,
        ) = sqlx::query_as(
            "SELECT JOBSCHEDULER_STATUS, JOBSCHEDULER_STARTED_AT, JOBSCHEDULER_FINISHED_AT, \
             JOBSCHEDULER_ELAPSED_TIME, JOBSCHEDULER_ERROR_MESSAGE \
             FROM jobs WHERE JOBSCHEDULER_JOB_ID = 'a'",
        )
        .fetch_one(&store.pool)
        .await
        .unwrap();
        assert_eq!(status, "pending");
        assert_eq!(started, None);
        assert_eq!(finished, None);
        assert_eq!(elapsed, None);
        assert_eq!(error, None);
    }
}
