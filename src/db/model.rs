//! Row models returned by the batch job repository.
//!
//! Rows are decoded column by column and converted into the domain
//! `BatchJob` here, so SQL stays in `repo.rs` and business rules stay in the
//! orchestrator.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::model::{BatchJob, JobPayload, JobStatus};

/// Columns selected by every batch job query, in row order.
pub const JOB_COLUMNS: &str = "id, group_id, batch_index, total_batches, payload, status, \
     scheduled_start_time, error, claimed_by, created_at, updated_at";

/// Raw `batch_jobs` row before payload and enum decoding.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: i64,
    pub group_id: String,
    pub batch_index: i64,
    pub total_batches: i64,
    pub payload: String,
    pub status: String,
    pub scheduled_start_time: DateTime<Utc>,
    pub error: Option<String>,
    pub claimed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRow {
    pub fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            group_id: row.try_get("group_id")?,
            batch_index: row.try_get("batch_index")?,
            total_batches: row.try_get("total_batches")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            scheduled_start_time: row.try_get("scheduled_start_time")?,
            error: row.try_get("error")?,
            claimed_by: row
                .try_get::<Option<String>, _>("claimed_by")?
                .filter(|s| !s.trim().is_empty()),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    pub fn into_job(self) -> Result<BatchJob> {
        let status = JobStatus::parse_status(&self.status)
            .ok_or_else(|| anyhow!("job {} has unknown status {}", self.id, self.status))?;
        let payload: JobPayload = serde_json::from_str(&self.payload)
            .with_context(|| format!("job {} has an unreadable payload", self.id))?;
        let group_id = Uuid::parse_str(&self.group_id)
            .with_context(|| format!("job {} has an invalid group id", self.id))?;
        let claimed_by = match self.claimed_by {
            Some(owner) => Some(
                Uuid::parse_str(&owner)
                    .with_context(|| format!("job {} has an invalid claim owner", self.id))?,
            ),
            None => None,
        };
        let batch_index = u32::try_from(self.batch_index)
            .with_context(|| format!("job {} has an invalid batch index", self.id))?;
        let total_batches = u32::try_from(self.total_batches)
            .ok()
            .filter(|total| *total > batch_index)
            .ok_or_else(|| anyhow!("job {} has an invalid batch count {}", self.id, self.total_batches))?;
        Ok(BatchJob {
            id: self.id,
            group_id,
            batch_index,
            total_batches,
            payload,
            status,
            scheduled_start_time: self.scheduled_start_time,
            error: self.error,
            claimed_by,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
