//! Durable job queue shared by live sessions and the background poller.
//!
//! Every status transition here is a conditional write against the current
//! row. Entering `processing` only happens through [`JobQueueStore::claim`],
//! which succeeds for exactly one caller.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::db::{self, Pool};
use crate::error::PersistenceError;
use crate::model::{BatchJob, JobPayload, JobStatus, NewBatchJob};

pub type QueueResult<T> = std::result::Result<T, PersistenceError>;

/// Reason recorded on jobs abandoned by a driver that stopped heartbeating.
pub const STALE_REASON: &str = "abandoned: no heartbeat";

#[async_trait]
pub trait JobQueueStore: Send + Sync {
    /// Insert a new job with status `pending`.
    async fn enqueue(&self, job: NewBatchJob) -> QueueResult<i64>;

    /// Jobs ordered by scheduled start time, optionally filtered by status.
    async fn list(&self, filter: Option<JobStatus>) -> QueueResult<Vec<BatchJob>>;

    async fn list_group(&self, group_id: Uuid) -> QueueResult<Vec<BatchJob>>;

    async fn get(&self, id: i64) -> QueueResult<Option<BatchJob>>;

    /// Move `id` from `from` to `to`. Returns `false` when the job is no longer in `from`.
    async fn update_status(
        &self,
        id: i64,
        from: JobStatus,
        to: JobStatus,
        error: Option<&str>,
    ) -> QueueResult<bool>;

    /// Atomically take a pending job for `owner`.
    async fn claim(&self, id: i64, owner: Uuid) -> QueueResult<bool>;

    /// Replace payload and start time of a job that is still pending.
    async fn reschedule(
        &self,
        id: i64,
        payload: &JobPayload,
        scheduled_start_time: DateTime<Utc>,
    ) -> QueueResult<bool>;

    async fn heartbeat(&self, id: i64) -> QueueResult<()>;

    async fn next_due(&self, now: DateTime<Utc>) -> QueueResult<Option<BatchJob>>;

    /// Fail `processing` jobs whose heartbeat predates `older_than`.
    async fn fail_stale(&self, older_than: DateTime<Utc>) -> QueueResult<u64>;

    async fn remove(&self, id: i64) -> QueueResult<()>;

    async fn remove_where(&self, statuses: &[JobStatus]) -> QueueResult<u64>;
}

/// [`JobQueueStore`] backed by the SQLite `batch_jobs` table.
#[derive(Debug, Clone)]
pub struct SqliteJobQueue {
    pool: Pool,
}

impl SqliteJobQueue {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Open (or create) the database at `database_url` and apply migrations.
    pub async fn connect(database_url: &str) -> QueueResult<Self> {
        let pool = db::init_pool(database_url).await?;
        db::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl JobQueueStore for SqliteJobQueue {
    #[instrument(skip_all, fields(group_id = %job.group_id, batch_index = job.batch_index))]
    async fn enqueue(&self, job: NewBatchJob) -> QueueResult<i64> {
        let id = db::insert_job(&self.pool, &job).await?;
        debug!(job_id = id, "job enqueued");
        Ok(id)
    }

    async fn list(&self, filter: Option<JobStatus>) -> QueueResult<Vec<BatchJob>> {
        Ok(db::list_jobs(&self.pool, filter).await?)
    }

    async fn list_group(&self, group_id: Uuid) -> QueueResult<Vec<BatchJob>> {
        Ok(db::list_group_jobs(&self.pool, group_id).await?)
    }

    async fn get(&self, id: i64) -> QueueResult<Option<BatchJob>> {
        Ok(db::fetch_job(&self.pool, id).await?)
    }

    #[instrument(skip_all, fields(job_id = id, from = from.as_str(), to = to.as_str()))]
    async fn update_status(
        &self,
        id: i64,
        from: JobStatus,
        to: JobStatus,
        error: Option<&str>,
    ) -> QueueResult<bool> {
        let changed = db::set_status_if(&self.pool, id, from, to, error).await?;
        if !changed {
            debug!("status precondition failed; job changed underneath us");
        }
        Ok(changed)
    }

    async fn claim(&self, id: i64, owner: Uuid) -> QueueResult<bool> {
        Ok(db::claim_job(&self.pool, id, owner).await?)
    }

    async fn reschedule(
        &self,
        id: i64,
        payload: &JobPayload,
        scheduled_start_time: DateTime<Utc>,
    ) -> QueueResult<bool> {
        Ok(db::reschedule_job(&self.pool, id, payload, scheduled_start_time).await?)
    }

    async fn heartbeat(&self, id: i64) -> QueueResult<()> {
        Ok(db::touch_job(&self.pool, id).await?)
    }

    async fn next_due(&self, now: DateTime<Utc>) -> QueueResult<Option<BatchJob>> {
        Ok(db::next_due_job(&self.pool, now).await?)
    }

    async fn fail_stale(&self, older_than: DateTime<Utc>) -> QueueResult<u64> {
        Ok(db::fail_stale_jobs(&self.pool, older_than, STALE_REASON).await?)
    }

    async fn remove(&self, id: i64) -> QueueResult<()> {
        Ok(db::delete_job(&self.pool, id).await?)
    }

    async fn remove_where(&self, statuses: &[JobStatus]) -> QueueResult<u64> {
        Ok(db::delete_jobs_with_status(&self.pool, statuses).await?)
    }
}
