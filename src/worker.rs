//! Background poller: picks up due jobs nobody is driving.
use anyhow::Result;
use chrono::{Duration, Utc};
use tracing::{debug, info, instrument, warn};

use crate::error::Error;
use crate::orchestrator::BulkPostOrchestrator;
use crate::model::JobStatus;
use crate::queue::JobQueueStore;

/// One poll tick. Returns `true` when a job was handed to the orchestrator.
///
/// Stale `processing` jobs (no heartbeat for `stale_after`) are failed first so
/// they stop blocking the queue. Nothing new is claimed while this orchestrator
/// is busy or while any other driver still holds a `processing` job, and a
/// batch never starts before the earlier batches of its group are done.
#[instrument(skip_all)]
pub async fn process_next_job(
    queue: &dyn JobQueueStore,
    orchestrator: &BulkPostOrchestrator,
    stale_after: Duration,
) -> Result<bool> {
    let cutoff = Utc::now() - stale_after;
    let failed = queue.fail_stale(cutoff).await?;
    if failed > 0 {
        warn!(failed, "failed abandoned processing jobs");
    }

    if orchestrator.is_active() {
        debug!("orchestrator busy; not polling");
        return Ok(false);
    }

    // Whatever is still processing after the stale sweep has a live heartbeat.
    let held = queue.list(Some(JobStatus::Processing)).await?;
    if let Some(job) = held.first() {
        debug!(job_id = job.id, claimed_by = ?job.claimed_by, "another driver holds a job; not polling");
        return Ok(false);
    }

    let Some(job) = queue.next_due(Utc::now()).await? else {
        return Ok(false);
    };
    let blocked_by = queue
        .list_group(job.group_id)
        .await?
        .into_iter()
        .find(|other| other.batch_index < job.batch_index && !other.status.is_terminal());
    if let Some(earlier) = blocked_by {
        debug!(job_id = job.id, earlier = earlier.id, "earlier batch of the group not finished");
        return Ok(false);
    }
    let job_id = job.id;
    match orchestrator.process_job(job).await {
        Ok(()) => {
            info!(job_id, "picked up due job");
            Ok(true)
        }
        Err(Error::AlreadyActive) => Ok(false),
        Err(err) => {
            warn!(job_id, %err, "due job could not be started");
            Ok(true)
        }
    }
}
