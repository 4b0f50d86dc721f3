use super::model::{JobRow, JOB_COLUMNS};
use crate::model::{BatchJob, JobPayload, JobStatus, NewBatchJob};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::instrument;
use uuid::Uuid;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// Expand a leading `~/` in a file-backed SQLite URL and make sure the parent
/// directory exists. In-memory and non-sqlite URLs are returned untouched.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }

    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{path}?{q}"),
        None => format!("sqlite://{path}"),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn rows_to_jobs(rows: Vec<sqlx::sqlite::SqliteRow>) -> Result<Vec<BatchJob>> {
    rows.iter()
        .map(|row| JobRow::from_row(row)?.into_job())
        .collect()
}

#[instrument(skip_all)]
pub async fn insert_job(pool: &Pool, job: &NewBatchJob) -> Result<i64> {
    let payload = serde_json::to_string(&job.payload).context("failed to encode job payload")?;
    let now = Utc::now();
    let rec = sqlx::query(
        "INSERT INTO batch_jobs (group_id, batch_index, total_batches, payload, status, \
         scheduled_start_time, created_at, updated_at) \
         VALUES (?, ?, ?, ?, 'pending', ?, ?, ?) RETURNING id",
    )
    .bind(job.group_id.to_string())
    .bind(i64::from(job.batch_index))
    .bind(i64::from(job.total_batches))
    .bind(payload)
    .bind(job.scheduled_start_time)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn fetch_job(pool: &Pool, id: i64) -> Result<Option<BatchJob>> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM batch_jobs WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.map(|row| JobRow::from_row(&row)?.into_job()).transpose()
}

/// All jobs, optionally restricted to one status, in start order.
#[instrument(skip_all)]
pub async fn list_jobs(pool: &Pool, status: Option<JobStatus>) -> Result<Vec<BatchJob>> {
    let order = "ORDER BY julianday(scheduled_start_time) ASC, batch_index ASC, id ASC";
    let rows = match status {
        Some(status) => {
            sqlx::query(&format!(
                "SELECT {JOB_COLUMNS} FROM batch_jobs WHERE status = ? {order}"
            ))
            .bind(status.as_str())
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM batch_jobs {order}"))
                .fetch_all(pool)
                .await?
        }
    };
    rows_to_jobs(rows)
}

#[instrument(skip_all)]
pub async fn list_group_jobs(pool: &Pool, group_id: Uuid) -> Result<Vec<BatchJob>> {
    let rows = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM batch_jobs WHERE group_id = ? ORDER BY batch_index ASC"
    ))
    .bind(group_id.to_string())
    .fetch_all(pool)
    .await?;
    rows_to_jobs(rows)
}

/// Compare-and-set on the status column. Returns whether the row changed.
#[instrument(skip_all)]
pub async fn set_status_if(
    pool: &Pool,
    id: i64,
    from: JobStatus,
    to: JobStatus,
    error: Option<&str>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE batch_jobs SET status = ?, error = ?, updated_at = ? WHERE id = ? AND status = ?",
    )
    .bind(to.as_str())
    .bind(error)
    .bind(Utc::now())
    .bind(id)
    .bind(from.as_str())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// pending -> processing for `owner`. Only one claimant can win.
#[instrument(skip_all)]
pub async fn claim_job(pool: &Pool, id: i64, owner: Uuid) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE batch_jobs SET status = 'processing', claimed_by = ?, error = NULL, updated_at = ? \
         WHERE id = ? AND status = 'pending'",
    )
    .bind(owner.to_string())
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn reschedule_job(
    pool: &Pool,
    id: i64,
    payload: &JobPayload,
    scheduled_start_time: DateTime<Utc>,
) -> Result<bool> {
    let payload = serde_json::to_string(payload).context("failed to encode job payload")?;
    let res = sqlx::query(
        "UPDATE batch_jobs SET payload = ?, scheduled_start_time = ?, updated_at = ? \
         WHERE id = ? AND status = 'pending'",
    )
    .bind(payload)
    .bind(scheduled_start_time)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn touch_job(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("UPDATE batch_jobs SET updated_at = ? WHERE id = ? AND status = 'processing'")
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Earliest pending job whose start time has arrived.
#[instrument(skip_all)]
pub async fn next_due_job(pool: &Pool, now: DateTime<Utc>) -> Result<Option<BatchJob>> {
    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM batch_jobs \
         WHERE status = 'pending' AND julianday(scheduled_start_time) <= julianday(?) \
         ORDER BY julianday(scheduled_start_time) ASC, batch_index ASC, id ASC LIMIT 1"
    ))
    .bind(now)
    .fetch_optional(pool)
    .await?;
    row.map(|row| JobRow::from_row(&row)?.into_job()).transpose()
}

/// Fail `processing` jobs whose last heartbeat is older than `cutoff`.
#[instrument(skip_all)]
pub async fn fail_stale_jobs(pool: &Pool, cutoff: DateTime<Utc>, reason: &str) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE batch_jobs SET status = 'failed', error = ?, updated_at = ? \
         WHERE status = 'processing' AND julianday(updated_at) < julianday(?)",
    )
    .bind(reason)
    .bind(Utc::now())
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn delete_job(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM batch_jobs WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn delete_jobs_with_status(pool: &Pool, statuses: &[JobStatus]) -> Result<u64> {
    if statuses.is_empty() {
        return Ok(0);
    }
    let placeholders = vec!["?"; statuses.len()].join(", ");
    let sql = format!("DELETE FROM batch_jobs WHERE status IN ({placeholders})");
    let mut query = sqlx::query(&sql);
    for status in statuses {
        query = query.bind(status.as_str());
    }
    let res = query.execute(pool).await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn count_jobs(pool: &Pool, status: JobStatus) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM batch_jobs WHERE status = ?")
        .bind(status.as_str())
        .fetch_one(pool)
        .await?;
    Ok(count)
}
