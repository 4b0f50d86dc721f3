//! Bulk post engine.
//!
//! A run takes the batches of one bulk post and publishes their items one at
//! a time, in slot order. Control (pause/resume/stop) is a `watch` channel
//! checked every time the loop wakes up, before anything is posted. Progress
//! is published through a second `watch` channel holding
//! [`OrchestratorState`], so presentation code subscribes instead of polling.
//!
//! The job queue stays the system of record: a batch is only posted after
//! this orchestrator won the pending -> processing claim, and every exit path
//! leaves each claimed batch `completed` or `failed`.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{
    BatchJob, ContentItem, EntryStatus, JobPayload, JobStatus, NewBatchJob, PostingScheduleEntry,
    PostingStrategy, ScheduleSettings,
};
use crate::posting::PostingApi;
use crate::queue::JobQueueStore;
use crate::schedule::{apply_schedule_constraints, batch_slots, compute_schedule, validate_settings};

/// Period at which a run touches the job it holds, also while waiting for a slot.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 60;

const HEARTBEAT_EVERY: Duration = Duration::from_secs(HEARTBEAT_INTERVAL_SECS);

/// Recorded on a batch whose driver panicked.
pub const CRASH_REASON: &str = "orchestrator terminated unexpectedly";

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Consecutive transport/auth failures after which the run is abandoned. 0 disables.
    pub max_consecutive_failures: u32,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
        }
    }
}

impl OrchestratorOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_consecutive_failures: cfg.orchestrator.max_consecutive_failures,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Idle,
    Scheduling,
    Processing,
    Paused,
    Completed,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Completed,
    Failed,
    Stopped,
}

impl RunOutcome {
    fn phase(self) -> Phase {
        match self {
            RunOutcome::Completed => Phase::Completed,
            RunOutcome::Failed => Phase::Failed,
            RunOutcome::Stopped => Phase::Stopped,
        }
    }
}

/// Final report of one run. Entries keep their last status; untouched ones stay `pending`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub group_id: Uuid,
    pub job_ids: Vec<i64>,
    pub outcome: RunOutcome,
    pub entries: Vec<PostingScheduleEntry>,
    pub success_count: usize,
    pub error_count: usize,
    /// Batches another consumer claimed first.
    pub skipped_jobs: Vec<i64>,
    pub error: Option<String>,
}

/// Observable snapshot published on every change.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrchestratorState {
    pub phase: Phase,
    pub is_posting: bool,
    pub is_paused: bool,
    pub job_queue: Vec<BatchJob>,
    pub posting_schedule: Vec<PostingScheduleEntry>,
    pub current_job_id: Option<i64>,
    pub current_group_id: Option<Uuid>,
    pub current_batch_index: Option<u32>,
    pub total_batches: u32,
    pub next_batch_start_time: Option<DateTime<Utc>>,
    pub error_count: usize,
    pub last_summary: Option<RunSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Running,
    Paused,
    Stopped,
}

enum Wake {
    Ready,
    Stopped,
}

/// A status write that failed during a run, retried by `refresh_queue`.
#[derive(Debug, Clone)]
struct PendingWrite {
    id: i64,
    from: JobStatus,
    to: JobStatus,
    error: Option<String>,
}

struct PlannedBatch {
    job: BatchJob,
    entries: Vec<PostingScheduleEntry>,
}

struct RunPlan {
    group_id: Uuid,
    batches: Vec<PlannedBatch>,
}

impl RunPlan {
    fn job_ids(&self) -> Vec<i64> {
        self.batches.iter().map(|b| b.job.id).collect()
    }
}

struct Inner {
    queue: Arc<dyn JobQueueStore>,
    api: Arc<dyn PostingApi>,
    options: OrchestratorOptions,
    owner: Uuid,
    active: AtomicBool,
    control: watch::Sender<Control>,
    state: watch::Sender<OrchestratorState>,
    unsynced: Mutex<Vec<PendingWrite>>,
}

/// Drives bulk posts. Cheap to clone; clones share the same run.
#[derive(Clone)]
pub struct BulkPostOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for BulkPostOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkPostOrchestrator")
            .field("owner", &self.inner.owner)
            .field("active", &self.inner.active.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl BulkPostOrchestrator {
    pub fn new(
        queue: Arc<dyn JobQueueStore>,
        api: Arc<dyn PostingApi>,
        options: OrchestratorOptions,
    ) -> Self {
        let (control, _) = watch::channel(Control::Running);
        let (state, _) = watch::channel(OrchestratorState::default());
        Self {
            inner: Arc::new(Inner {
                queue,
                api,
                options,
                owner: Uuid::new_v4(),
                active: AtomicBool::new(false),
                control,
                state,
                unsynced: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Identity written into `claimed_by` for batches this orchestrator drives.
    pub fn owner_id(&self) -> Uuid {
        self.inner.owner
    }

    pub fn subscribe(&self) -> watch::Receiver<OrchestratorState> {
        self.inner.state.subscribe()
    }

    pub fn state(&self) -> OrchestratorState {
        self.inner.state.borrow().clone()
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Schedule, persist and start posting `items`. Returns the ids of the created batch jobs.
    ///
    /// Fails with `AlreadyActive` while another run is in progress, `InvalidConfig` for bad
    /// input and `Persistence` when the jobs cannot be stored. A failed call leaves nothing
    /// behind in the queue.
    #[instrument(skip_all, fields(items = items.len(), strategy = strategy.as_str()))]
    pub async fn start_bulk_post(
        &self,
        items: Vec<ContentItem>,
        strategy: PostingStrategy,
        settings: ScheduleSettings,
    ) -> Result<Vec<i64>> {
        self.reserve()?;
        self.inner.publish(|s| {
            s.phase = Phase::Scheduling;
            s.error_count = 0;
        });

        let plan = match self.schedule(items, strategy, settings).await {
            Ok(plan) => plan,
            Err(err) => {
                self.release();
                return Err(err);
            }
        };
        let ids = plan.job_ids();
        info!(group_id = %plan.group_id, batches = ids.len(), "bulk post scheduled");

        if let Err(err) = self.inner.publish_queue().await {
            warn!(?err, "failed to refresh queue view after scheduling");
        }
        self.launch(plan);
        Ok(ids)
    }

    /// Drive a job that is already in the queue, e.g. one the background poller found due.
    pub async fn process_job(&self, job: BatchJob) -> Result<()> {
        self.reserve()?;
        let entries = match job_entries(&job) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(job_id = job.id, %err, "stored job cannot be scheduled; failing it");
                let reason = err.to_string();
                if let Err(write_err) = self
                    .inner
                    .queue
                    .update_status(job.id, JobStatus::Pending, JobStatus::Failed, Some(&reason))
                    .await
                {
                    warn!(?write_err, job_id = job.id, "failed to mark unschedulable job");
                }
                self.release();
                return Err(err);
            }
        };
        self.inner.publish(|s| {
            s.phase = Phase::Scheduling;
            s.error_count = 0;
        });
        let plan = RunPlan {
            group_id: job.group_id,
            batches: vec![PlannedBatch { job, entries }],
        };
        self.launch(plan);
        Ok(())
    }

    /// Hold posting before the next item. An in-flight post finishes normally.
    pub fn pause_bulk_post(&self) {
        if !self.is_active() {
            return;
        }
        let changed = self.inner.control.send_if_modified(|c| {
            if *c == Control::Running {
                *c = Control::Paused;
                true
            } else {
                false
            }
        });
        if changed {
            info!("bulk post paused");
            self.inner.publish(|s| {
                s.is_paused = true;
                if s.phase == Phase::Processing {
                    s.phase = Phase::Paused;
                }
            });
        }
    }

    pub fn resume_bulk_post(&self) {
        if !self.is_active() {
            return;
        }
        let changed = self.inner.control.send_if_modified(|c| {
            if *c == Control::Paused {
                *c = Control::Running;
                true
            } else {
                false
            }
        });
        if changed {
            info!("bulk post resumed");
            self.inner.publish(|s| {
                s.is_paused = false;
                if s.phase == Phase::Paused {
                    s.phase = Phase::Processing;
                }
            });
        }
    }

    /// Halt after the in-flight post. Safe to call repeatedly and from any task.
    pub fn stop_bulk_post(&self) {
        if !self.is_active() {
            return;
        }
        let changed = self.inner.control.send_if_modified(|c| {
            if *c == Control::Stopped {
                false
            } else {
                *c = Control::Stopped;
                true
            }
        });
        if changed {
            info!("bulk post stop requested");
        }
    }

    /// Wait for the active run to end. Returns the most recent summary if nothing is running.
    pub async fn wait(&self) -> Option<RunSummary> {
        let mut rx = self.subscribe();
        while self.is_active() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        self.state().last_summary
    }

    /// Stop the active run and wait until its batches carry a final status.
    pub async fn shutdown(&self) -> Option<RunSummary> {
        self.stop_bulk_post();
        self.wait().await
    }

    /// Re-anchor every pending job to the next allowed slot after now.
    pub async fn reschedule_queue(&self) -> Result<usize> {
        self.reschedule_queue_at(Utc::now()).await
    }

    /// Shift pending jobs so the earliest starts at the first allowed slot at or after `now`.
    ///
    /// All jobs move by the same offset, so their relative spacing is kept. Jobs of the
    /// run currently being driven are left alone.
    #[instrument(skip(self))]
    pub async fn reschedule_queue_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let active_group = if self.is_active() {
            self.state().current_group_id
        } else {
            None
        };
        let pending: Vec<BatchJob> = self
            .inner
            .queue
            .list(Some(JobStatus::Pending))
            .await?
            .into_iter()
            .filter(|job| Some(job.group_id) != active_group)
            .collect();
        let Some(earliest) = pending.first() else {
            return Ok(0);
        };

        let anchor = apply_schedule_constraints(now, earliest.payload.settings.timezone);
        let delta = anchor - earliest.scheduled_start_time;

        let mut moved = 0;
        for job in pending {
            let mut payload = job.payload.clone();
            let start = apply_schedule_constraints(
                job.scheduled_start_time + delta,
                payload.settings.timezone,
            );
            payload.settings.start_time = start;
            payload.first_index = 0;
            if self.inner.queue.reschedule(job.id, &payload, start).await? {
                moved += 1;
            } else {
                warn!(job_id = job.id, "job left pending before it could be rescheduled");
            }
        }
        info!(moved, %anchor, "queue rescheduled");

        self.refresh_queue().await?;
        Ok(moved)
    }

    /// Reconcile failed status writes, then republish the queue view.
    pub async fn refresh_queue(&self) -> Result<Vec<BatchJob>> {
        self.inner.retry_unsynced().await;
        let jobs = self.inner.publish_queue().await?;
        Ok(jobs)
    }

    fn reserve(&self) -> Result<()> {
        self.inner
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::AlreadyActive)?;
        self.inner.control.send_replace(Control::Running);
        Ok(())
    }

    fn release(&self) {
        self.inner.publish(|s| {
            s.phase = Phase::Idle;
            self.inner.active.store(false, Ordering::SeqCst);
        });
    }

    async fn schedule(
        &self,
        items: Vec<ContentItem>,
        strategy: PostingStrategy,
        settings: ScheduleSettings,
    ) -> Result<RunPlan> {
        if items.is_empty() {
            return Err(Error::invalid("items must be non-empty"));
        }
        validate_settings(&settings)?;
        let slots = compute_schedule(strategy, &settings, items.len())?;

        let chunk = match strategy {
            PostingStrategy::Batch => settings.batch_size as usize,
            PostingStrategy::SequentialInterval => items.len(),
        };
        let total_batches = items.len().div_ceil(chunk) as u32;
        let group_id = Uuid::new_v4();

        let mut batches = Vec::with_capacity(total_batches as usize);
        for (batch_index, chunk_items) in items.chunks(chunk).enumerate() {
            let first_index = batch_index * chunk;
            let chunk_slots = &slots[first_index..first_index + chunk_items.len()];
            let entries = chunk_items
                .iter()
                .zip(chunk_slots)
                .map(|(item, slot)| PostingScheduleEntry::pending(item, *slot))
                .collect();
            let new_job = NewBatchJob {
                group_id,
                batch_index: batch_index as u32,
                total_batches,
                payload: JobPayload {
                    items: chunk_items.to_vec(),
                    settings: settings.clone(),
                    strategy,
                    first_index,
                },
                scheduled_start_time: chunk_slots[0],
            };

            let id = match self.inner.queue.enqueue(new_job.clone()).await {
                Ok(id) => id,
                Err(err) => {
                    self.discard(&batches).await;
                    return Err(err.into());
                }
            };
            let now = Utc::now();
            batches.push(PlannedBatch {
                job: BatchJob {
                    id,
                    group_id,
                    batch_index: new_job.batch_index,
                    total_batches,
                    payload: new_job.payload,
                    status: JobStatus::Pending,
                    scheduled_start_time: new_job.scheduled_start_time,
                    error: None,
                    claimed_by: None,
                    created_at: now,
                    updated_at: now,
                },
                entries,
            });
        }

        Ok(RunPlan { group_id, batches })
    }

    /// Remove batches written by a start that could not finish.
    async fn discard(&self, batches: &[PlannedBatch]) {
        for batch in batches {
            if let Err(err) = self.inner.queue.remove(batch.job.id).await {
                warn!(?err, job_id = batch.job.id, "failed to remove partially scheduled job");
            }
        }
    }

    fn launch(&self, plan: RunPlan) {
        let inner = self.inner.clone();
        let control = inner.control.subscribe();

        let first = plan.batches.first().map(|b| &b.job);
        let total_batches = first.map(|j| j.total_batches).unwrap_or(0);
        let next_start = first.map(|j| j.scheduled_start_time);
        let group_id = plan.group_id;
        let job_ids = plan.job_ids();
        inner.publish(|s| {
            s.phase = Phase::Processing;
            s.is_posting = true;
            s.is_paused = false;
            s.current_group_id = Some(group_id);
            s.total_batches = total_batches;
            s.next_batch_start_time = next_start;
        });

        let supervisor_inner = inner.clone();
        tokio::spawn(async move {
            let runner = tokio::spawn(run(supervisor_inner.clone(), plan, control));
            let summary = match runner.await {
                Ok(summary) => summary,
                Err(err) => {
                    error!(?err, %group_id, "bulk post run terminated unexpectedly");
                    supervisor_inner.recover_crash(group_id, job_ids).await
                }
            };
            supervisor_inner.finish(&summary).await;
        });
    }
}

fn job_entries(job: &BatchJob) -> Result<Vec<PostingScheduleEntry>> {
    let payload = &job.payload;
    if payload.items.is_empty() {
        return Err(Error::invalid("stored job has no items"));
    }
    validate_settings(&payload.settings)?;
    let slots = batch_slots(
        payload.strategy,
        &payload.settings,
        payload.first_index,
        payload.items.len(),
    )?;
    Ok(payload
        .items
        .iter()
        .zip(slots)
        .map(|(item, slot)| PostingScheduleEntry::pending(item, slot))
        .collect())
}

/// How a batch left the posting loop.
enum BatchEnd {
    Done,
    Stopped,
    Aborted(String),
}

async fn run(inner: Arc<Inner>, plan: RunPlan, mut control: watch::Receiver<Control>) -> RunSummary {
    let group_id = plan.group_id;
    let job_ids = plan.job_ids();
    let threshold = inner.options.max_consecutive_failures;

    let mut all_entries: Vec<PostingScheduleEntry> = Vec::new();
    let mut skipped_jobs = Vec::new();
    let mut error_count = 0;
    let mut consecutive_systemic = 0u32;
    let mut outcome = RunOutcome::Completed;
    let mut failure: Option<String> = None;
    let mut unfinished: Vec<i64> = Vec::new();

    let mut batches = plan.batches.into_iter();
    while let Some(PlannedBatch { job, entries }) = batches.next() {
        inner.publish(|s| {
            s.current_batch_index = Some(job.batch_index);
            s.next_batch_start_time = Some(job.scheduled_start_time);
            s.posting_schedule = entries.clone();
        });

        if let Wake::Stopped = inner
            .wait_until(job.scheduled_start_time, &mut control, None)
            .await
        {
            outcome = RunOutcome::Stopped;
            unfinished.push(job.id);
            all_entries.extend(entries);
            break;
        }

        match inner.queue.claim(job.id, inner.owner).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(job_id = job.id, "batch already claimed elsewhere; skipping");
                skipped_jobs.push(job.id);
                all_entries.extend(entries);
                continue;
            }
            Err(err) => {
                // Unclaimed work is never posted; the job stays pending for a later consumer.
                warn!(?err, job_id = job.id, "could not claim batch");
                outcome = RunOutcome::Failed;
                failure = Some(format!("could not claim batch {}: {err}", job.id));
                all_entries.extend(entries);
                break;
            }
        }
        // The stored row wins over the plan: another process may have rescheduled it.
        let (job, mut entries) = match inner.queue.get(job.id).await {
            Ok(Some(stored)) => match job_entries(&stored) {
                Ok(fresh) => (stored, fresh),
                Err(err) => {
                    warn!(job_id = job.id, %err, "stored schedule unusable; keeping planned slots");
                    (job, entries)
                }
            },
            Ok(None) => {
                warn!(job_id = job.id, "claimed job vanished; keeping planned slots");
                (job, entries)
            }
            Err(err) => {
                warn!(?err, job_id = job.id, "could not re-read claimed job; keeping planned slots");
                (job, entries)
            }
        };
        info!(job_id = job.id, %group_id, batch_index = job.batch_index, items = entries.len(), "batch started");
        inner.publish(|s| {
            s.current_job_id = Some(job.id);
            s.posting_schedule = entries.clone();
        });

        let mut end = BatchEnd::Done;
        for idx in 0..entries.len() {
            if let Wake::Stopped = inner
                .wait_until(entries[idx].scheduled_time, &mut control, Some(job.id))
                .await
            {
                end = BatchEnd::Stopped;
                break;
            }

            entries[idx].status = EntryStatus::Posting;
            inner.publish_entry(idx, &entries[idx]);

            let item = &job.payload.items[idx];
            let targets = item.target_profiles(&job.payload.settings);
            match inner
                .api
                .create_post(&item.caption, targets, &item.media_urls, None)
                .await
            {
                Ok(result) => {
                    info!(job_id = job.id, slideshow_id = %item.id, post_id = %result.id, "item posted");
                    entries[idx].status = EntryStatus::Success;
                    consecutive_systemic = 0;
                }
                Err(err) => {
                    warn!(job_id = job.id, slideshow_id = %item.id, %err, "item failed to post");
                    entries[idx].status = EntryStatus::Error;
                    entries[idx].error_message = Some(err.message.clone());
                    error_count += 1;
                    if err.is_systemic() {
                        consecutive_systemic += 1;
                    } else {
                        consecutive_systemic = 0;
                    }
                    if threshold > 0 && consecutive_systemic >= threshold {
                        end = BatchEnd::Aborted(format!(
                            "aborted after {consecutive_systemic} consecutive posting failures: {}",
                            err.message
                        ));
                    }
                }
            }
            inner.publish_entry(idx, &entries[idx]);
            inner.publish(|s| s.error_count = error_count);
            if let Err(err) = inner.queue.heartbeat(job.id).await {
                warn!(?err, job_id = job.id, "heartbeat failed");
            }
            if matches!(end, BatchEnd::Aborted(_)) {
                break;
            }
        }

        all_entries.extend(entries);
        match end {
            BatchEnd::Done => {
                inner
                    .write_status(job.id, JobStatus::Processing, JobStatus::Completed, None)
                    .await;
                info!(job_id = job.id, "batch completed");
            }
            BatchEnd::Stopped => {
                inner
                    .write_status(
                        job.id,
                        JobStatus::Processing,
                        JobStatus::Failed,
                        Some(Error::UserCancelled.to_string()),
                    )
                    .await;
                outcome = RunOutcome::Stopped;
                break;
            }
            BatchEnd::Aborted(reason) => {
                error!(job_id = job.id, %reason, "bulk post aborted");
                inner
                    .write_status(
                        job.id,
                        JobStatus::Processing,
                        JobStatus::Failed,
                        Some(reason.clone()),
                    )
                    .await;
                outcome = RunOutcome::Failed;
                failure = Some(reason);
                break;
            }
        }
    }

    // Batches never reached: cancelled along with the run.
    let rest: Vec<PlannedBatch> = batches.collect();
    if outcome != RunOutcome::Completed {
        let reason = match outcome {
            RunOutcome::Stopped => Error::UserCancelled.to_string(),
            _ => failure.clone().unwrap_or_else(|| "bulk post failed".to_string()),
        };
        let claim_failed = failure
            .as_deref()
            .is_some_and(|f| f.starts_with("could not claim"));
        if !claim_failed {
            for id in unfinished.iter().copied().chain(rest.iter().map(|b| b.job.id)) {
                inner
                    .write_status(id, JobStatus::Pending, JobStatus::Failed, Some(reason.clone()))
                    .await;
            }
        }
    }
    for batch in rest {
        all_entries.extend(batch.entries);
    }

    let success_count = all_entries
        .iter()
        .filter(|e| e.status == EntryStatus::Success)
        .count();
    let error = match outcome {
        RunOutcome::Stopped => Some(Error::UserCancelled.to_string()),
        _ => failure,
    };
    RunSummary {
        group_id,
        job_ids,
        outcome,
        entries: all_entries,
        success_count,
        error_count,
        skipped_jobs,
        error,
    }
}

impl Inner {
    fn publish(&self, f: impl FnOnce(&mut OrchestratorState)) {
        self.state.send_modify(f);
    }

    fn publish_entry(&self, idx: usize, entry: &PostingScheduleEntry) {
        self.publish(|s| {
            if let Some(slot) = s.posting_schedule.get_mut(idx) {
                *slot = entry.clone();
            }
        });
    }

    async fn publish_queue(&self) -> Result<Vec<BatchJob>> {
        let jobs = self.queue.list(None).await?;
        let idle = !self.active.load(Ordering::SeqCst);
        self.publish(|s| {
            s.job_queue = jobs.clone();
            if idle {
                s.current_job_id = jobs
                    .iter()
                    .find(|j| j.status == JobStatus::Processing)
                    .map(|j| j.id);
                s.next_batch_start_time = jobs
                    .iter()
                    .find(|j| j.status == JobStatus::Pending)
                    .map(|j| j.scheduled_start_time);
            }
        });
        Ok(jobs)
    }

    /// Sleep until `at`, honouring pause and stop. Heartbeats `job` while waiting.
    async fn wait_until(
        &self,
        at: DateTime<Utc>,
        control: &mut watch::Receiver<Control>,
        job: Option<i64>,
    ) -> Wake {
        let mut last_beat = Instant::now();
        loop {
            let current = *control.borrow_and_update();
            match current {
                Control::Stopped => return Wake::Stopped,
                Control::Paused => {
                    tokio::select! {
                        res = control.changed() => {
                            if res.is_err() {
                                return Wake::Stopped;
                            }
                        }
                        _ = tokio::time::sleep(HEARTBEAT_EVERY) => {}
                    }
                    self.beat_if_due(job, &mut last_beat).await;
                    continue;
                }
                Control::Running => {}
            }

            let now = Utc::now();
            if at <= now {
                return Wake::Ready;
            }
            let remaining = (at - now)
                .to_std()
                .unwrap_or_default()
                .min(HEARTBEAT_EVERY);
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                res = control.changed() => {
                    if res.is_err() {
                        return Wake::Stopped;
                    }
                }
            }
            self.beat_if_due(job, &mut last_beat).await;
        }
    }

    async fn beat_if_due(&self, job: Option<i64>, last_beat: &mut Instant) {
        let Some(id) = job else {
            return;
        };
        if last_beat.elapsed() < HEARTBEAT_EVERY {
            return;
        }
        if let Err(err) = self.queue.heartbeat(id).await {
            warn!(?err, job_id = id, "heartbeat failed");
        }
        *last_beat = Instant::now();
    }

    /// Conditional status write. Storage failures are remembered for reconciliation.
    async fn write_status(&self, id: i64, from: JobStatus, to: JobStatus, error: Option<String>) {
        match self
            .queue
            .update_status(id, from, to, error.as_deref())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(job_id = id, from = from.as_str(), to = to.as_str(), "job status changed concurrently; left as is");
            }
            Err(err) => {
                warn!(?err, job_id = id, to = to.as_str(), "failed to persist job status; will retry on refresh");
                self.unsynced.lock().await.push(PendingWrite {
                    id,
                    from,
                    to,
                    error,
                });
            }
        }
    }

    async fn retry_unsynced(&self) {
        let pending: Vec<PendingWrite> = std::mem::take(&mut *self.unsynced.lock().await);
        for write in pending {
            match self
                .queue
                .update_status(write.id, write.from, write.to, write.error.as_deref())
                .await
            {
                Ok(applied) => {
                    info!(job_id = write.id, applied, "reconciled job status");
                }
                Err(err) => {
                    warn!(?err, job_id = write.id, "job status still not persisted");
                    self.unsynced.lock().await.push(write);
                }
            }
        }
    }

    /// The run task died: fail the batch it held so nobody mistakes it for live work.
    async fn recover_crash(&self, group_id: Uuid, job_ids: Vec<i64>) -> RunSummary {
        let snapshot = self.state.borrow().clone();
        if let Some(id) = snapshot.current_job_id {
            self.write_status(
                id,
                JobStatus::Processing,
                JobStatus::Failed,
                Some(CRASH_REASON.to_string()),
            )
            .await;
        }
        let entries = snapshot.posting_schedule;
        let success_count = entries
            .iter()
            .filter(|e| e.status == EntryStatus::Success)
            .count();
        RunSummary {
            group_id,
            job_ids,
            outcome: RunOutcome::Failed,
            entries,
            success_count,
            error_count: snapshot.error_count,
            skipped_jobs: Vec::new(),
            error: Some(CRASH_REASON.to_string()),
        }
    }

    async fn finish(&self, summary: &RunSummary) {
        info!(
            group_id = %summary.group_id,
            outcome = ?summary.outcome,
            success = summary.success_count,
            errors = summary.error_count,
            "bulk post finished"
        );
        self.publish(|s| {
            s.phase = summary.outcome.phase();
            s.is_posting = false;
            s.is_paused = false;
            s.error_count = summary.error_count;
            s.last_summary = Some(summary.clone());
        });
        // Released inside the same update so waiters never observe Idle while still active.
        self.publish(|s| {
            s.phase = Phase::Idle;
            s.posting_schedule.clear();
            s.current_job_id = None;
            s.current_group_id = None;
            s.current_batch_index = None;
            s.total_batches = 0;
            s.next_batch_start_time = None;
            self.active.store(false, Ordering::SeqCst);
        });
        if let Err(err) = self.publish_queue().await {
            warn!(?err, "failed to refresh queue view after run");
        }
    }
}
