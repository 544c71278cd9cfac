use std::collections::HashSet;
use std::path::Path;

use anyhow::Context as _;
use sqlx::sqlite::{SqliteColumn, SqliteRow};
use sqlx::{Column as _, Row as _};
use tracing::{info, warn};

use crate::job::RESERVED_PREFIX;
use crate::store::JobStore;

/// Scheduler-owned columns created for every job table, in schema order.
const RESERVED_COLUMNS: &[(&str, &str)] = &[
    ("JOBSCHEDULER_JOB_ID", "TEXT PRIMARY KEY"),
    ("JOBSCHEDULER_STATUS", "TEXT NOT NULL DEFAULT 'pending'"),
    ("JOBSCHEDULER_PRIORITY", "INTEGER DEFAULT 0"),
    ("JOBSCHEDULER_ESTIMATE_TIME", "REAL DEFAULT 0"),
    ("JOBSCHEDULER_ELAPSED_TIME", "REAL"),
    ("JOBSCHEDULER_CREATED_AT", "TEXT DEFAULT (datetime('now'))"),
    ("JOBSCHEDULER_STARTED_AT", "TEXT"),
    ("JOBSCHEDULER_FINISHED_AT", "TEXT"),
    ("JOBSCHEDULER_ERROR_MESSAGE", "TEXT"),
    ("JOBSCHEDULER_DEPENDS_ON", "TEXT"),
    ("JOBSCHEDULER_WORKER_ID", "TEXT"),
    ("JOBSCHEDULER_HEARTBEAT", "TEXT"),
];

fn validate_column_name(name: &str) -> anyhow::Result<()> {
    let mut chars = name.chars();
    let ok = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    anyhow::ensure!(ok, "invalid column name in batch file: {name:?}");
    Ok(())
}

/// Create the `jobs` table, its indexes, and the dependency relation.
/// User columns are always `TEXT`; the subprocess owns their interpretation.
pub async fn create_schema(store: &JobStore, user_columns: &[String]) -> anyhow::Result<()> {
    let mut columns: Vec<String> = RESERVED_COLUMNS
        .iter()
        .map(|(name, ty)| format!("{name} {ty}"))
        .collect();
    for column in user_columns {
        if column.starts_with(RESERVED_PREFIX) {
            continue;
        }
        validate_column_name(column)?;
        columns.push(format!("{column} TEXT"));
    }

    let create = format!("CREATE TABLE IF NOT EXISTS jobs ({})", columns.join(", "));
    sqlx::query(&create).execute(&store.pool).await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_status_priority \
         ON jobs (JOBSCHEDULER_STATUS, JOBSCHEDULER_PRIORITY DESC)",
    )
    .execute(&store.pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_status_estimate \
         ON jobs (JOBSCHEDULER_STATUS, JOBSCHEDULER_ESTIMATE_TIME)",
    )
    .execute(&store.pool)
    .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS job_dependencies ( \
         job_id TEXT NOT NULL, \
         depends_on TEXT NOT NULL, \
         PRIMARY KEY (job_id, depends_on))",
    )
    .execute(&store.pool)
    .await?;

    Ok(())
}

/// Import a CSV batch file into the job table.
///
/// The header row defines the schema: reserved `JOBSCHEDULER_*` columns are
/// typed per the fixed schema, every other column becomes (or already is) a
/// `TEXT` user column in header order. Re-imports may introduce new user
/// columns; rows are insert-or-replace keyed on job id. Empty cells are
/// stored as NULL. `JOBSCHEDULER_DEPENDS_ON` (space-separated ids) is also
/// exploded into the `job_dependencies` relation; self-edges are warned
/// about and skipped so a job can never be blocked by itself.
///
/// Returns the number of imported rows.
pub async fn import_csv(
    store: &JobStore,
    csv_path: &Path,
    reset_status: bool,
) -> anyhow::Result<u64> {
    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("open batch file {}", csv_path.display()))?;
    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    let records = reader
        .records()
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("read batch file {}", csv_path.display()))?;
    if records.is_empty() {
        warn!("Batch file {} has no job rows", csv_path.display());
        return Ok(0);
    }

    let known_reserved: HashSet<&str> = RESERVED_COLUMNS.iter().map(|(name, _)| *name).collect();
    let mut user_columns = Vec::new();
    for header in &headers {
        if header.starts_with(RESERVED_PREFIX) {
            if !known_reserved.contains(header.as_str()) {
                warn!("Ignoring unknown reserved column {header}");
            }
            continue;
        }
        validate_column_name(header)?;
        user_columns.push(header.clone());
    }

    create_schema(store, &user_columns).await?;

    // A later batch file may introduce columns the table does not have yet.
    let existing: HashSet<String> =
        sqlx::query_scalar::<_, String>("SELECT name FROM pragma_table_info('jobs')")
            .fetch_all(&store.pool)
            .await?
            .into_iter()
            .collect();
    for column in &user_columns {
        if !existing.contains(column) {
            sqlx::query(&format!("ALTER TABLE jobs ADD COLUMN {column} TEXT"))
                .execute(&store.pool)
                .await?;
        }
    }

    let column_index = |name: &str| headers.iter().position(|h| h == name);
    let has_dep_column = column_index("JOBSCHEDULER_DEPENDS_ON").is_some();

    let mut insert_columns = vec![
        "JOBSCHEDULER_JOB_ID".to_string(),
        "JOBSCHEDULER_STATUS".to_string(),
        "JOBSCHEDULER_PRIORITY".to_string(),
        "JOBSCHEDULER_ESTIMATE_TIME".to_string(),
    ];
    if has_dep_column {
        insert_columns.push("JOBSCHEDULER_DEPENDS_ON".to_string());
    }
    insert_columns.extend(user_columns.iter().cloned());
    let placeholders = vec!["?"; insert_columns.len()].join(", ");
    let insert_sql = format!(
        "INSERT OR REPLACE INTO jobs ({}) VALUES ({placeholders})",
        insert_columns.join(", ")
    );

    let mut tx = store.pool.begin_with("BEGIN IMMEDIATE").await?;
    let mut imported: u64 = 0;
    for (row_idx, record) in records.iter().enumerate() {
        let cell = |name: &str| -> Option<&str> {
            column_index(name)
                .and_then(|idx| record.get(idx))
                .filter(|value| !value.is_empty())
        };

        let job_id = match cell("JOBSCHEDULER_JOB_ID") {
            Some(id) => id.to_string(),
            None => format!("job_{row_idx:08}"),
        };
        let status = if reset_status {
            "pending"
        } else {
            cell("JOBSCHEDULER_STATUS").unwrap_or("pending")
        };
        let priority: i64 = match cell("JOBSCHEDULER_PRIORITY") {
            Some(value) => value
                .trim()
                .parse()
                .with_context(|| format!("invalid JOBSCHEDULER_PRIORITY for job {job_id}"))?,
            None => 0,
        };
        let estimate_time: f64 = match cell("JOBSCHEDULER_ESTIMATE_TIME") {
            Some(value) => value
                .trim()
                .parse()
                .with_context(|| format!("invalid JOBSCHEDULER_ESTIMATE_TIME for job {job_id}"))?,
            None => 0.0,
        };
        let depends_on = cell("JOBSCHEDULER_DEPENDS_ON");

        let mut query = sqlx::query(&insert_sql)
            .bind(&job_id)
            .bind(status)
            .bind(priority)
            .bind(estimate_time);
        if has_dep_column {
            query = query.bind(depends_on);
        }
        for column in &user_columns {
            query = query.bind(cell(column));
        }
        query.execute(&mut *tx).await?;

        // Keep the relation in sync with the dotted-text column.
        sqlx::query("DELETE FROM job_dependencies WHERE job_id = ?")
            .bind(&job_id)
            .execute(&mut *tx)
            .await?;
        if let Some(dep_text) = depends_on {
            for dep in dep_text.split_whitespace() {
                if dep == job_id {
                    warn!("Job {job_id} depends on itself; ignoring self-dependency");
                    continue;
                }
                sqlx::query(
                    "INSERT OR REPLACE INTO job_dependencies (job_id, depends_on) VALUES (?, ?)",
                )
                .bind(&job_id)
                .bind(dep)
                .execute(&mut *tx)
                .await?;
            }
        }

        imported += 1;
    }
    tx.commit().await?;

    info!("Imported {imported} jobs from {}", csv_path.display());
    Ok(imported)
}

fn cell_text(row: &SqliteRow, column: &SqliteColumn) -> anyhow::Result<String> {
    let text = match column.name() {
        "JOBSCHEDULER_PRIORITY" => row
            .try_get::<Option<i64>, _>(column.ordinal())?
            .map(|v| v.to_string()),
        "JOBSCHEDULER_ESTIMATE_TIME" | "JOBSCHEDULER_ELAPSED_TIME" => row
            .try_get::<Option<f64>, _>(column.ordinal())?
            .map(|v| v.to_string()),
        _ => row.try_get::<Option<String>, _>(column.ordinal())?,
    };
    Ok(text.unwrap_or_default())
}

/// Export the job table to a CSV file, optionally filtered by status.
/// Returns the number of exported rows.
pub async fn export_csv(
    store: &JobStore,
    csv_path: &Path,
    status_filter: Option<&str>,
) -> anyhow::Result<u64> {
    let rows = match status_filter {
        Some(status) => {
            sqlx::query(
                "SELECT * FROM jobs WHERE JOBSCHEDULER_STATUS = ? ORDER BY JOBSCHEDULER_JOB_ID",
            )
            .bind(status)
            .fetch_all(&store.pool)
            .await?
        }
        None => {
            sqlx::query("SELECT * FROM jobs ORDER BY JOBSCHEDULER_JOB_ID")
                .fetch_all(&store.pool)
                .await?
        }
    };
    if rows.is_empty() {
        warn!("No jobs to export");
        return Ok(0);
    }

    let mut writer = csv::Writer::from_path(csv_path)
        .with_context(|| format!("create export file {}", csv_path.display()))?;
    let header: Vec<&str> = rows[0].columns().iter().map(|c| c.name()).collect();
    writer.write_record(&header)?;
    for row in &rows {
        let mut record = Vec::with_capacity(header.len());
        for column in row.columns() {
            record.push(cell_text(row, column)?);
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;

    info!("Exported {} jobs to {}", rows.len(), csv_path.display());
    Ok(rows.len() as u64)
}
