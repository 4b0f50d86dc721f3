use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use postcadence::error::{Error, PersistenceError};
use postcadence::model::{
    BatchJob, ContentItem, EntryStatus, JobPayload, JobStatus, NewBatchJob, PostResult,
    PostingStrategy, Profile, ScheduleSettings,
};
use postcadence::orchestrator::{
    BulkPostOrchestrator, OrchestratorOptions, Phase, RunOutcome, CRASH_REASON,
};
use postcadence::posting::{PostingApi, PostingError};
use postcadence::queue::{JobQueueStore, QueueResult, SqliteJobQueue};
use postcadence::schedule::batch_slots;
use postcadence::worker;
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

async fn setup_queue() -> Arc<SqliteJobQueue> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    Arc::new(SqliteJobQueue::new(pool))
}

/// Pauses the fake API inside the n-th `create_post` call until released.
struct Gate {
    at_call: usize,
    reached: Notify,
    release: Notify,
}

#[derive(Default)]
struct FakeApi {
    calls: Mutex<Vec<String>>,
    failures: HashMap<usize, PostingError>,
    gate: Option<Gate>,
    panic_on: Option<usize>,
}

impl FakeApi {
    fn failing(failures: impl IntoIterator<Item = (usize, PostingError)>) -> Self {
        Self {
            failures: failures.into_iter().collect(),
            ..Default::default()
        }
    }

    fn gated(at_call: usize) -> Self {
        Self {
            gate: Some(Gate {
                at_call,
                reached: Notify::new(),
                release: Notify::new(),
            }),
            ..Default::default()
        }
    }

    async fn captions(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl PostingApi for FakeApi {
    async fn list_profiles(&self) -> Result<Vec<Profile>, PostingError> {
        Ok(vec![])
    }

    async fn create_post(
        &self,
        text: &str,
        _profile_ids: &[String],
        _media_urls: &[String],
        _scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<PostResult, PostingError> {
        let call = {
            let mut calls = self.calls.lock().await;
            calls.push(text.to_string());
            calls.len()
        };
        if self.panic_on == Some(call) {
            panic!("aggregator client blew up on call {call}");
        }
        if let Some(gate) = &self.gate {
            if gate.at_call == call {
                gate.reached.notify_one();
                gate.release.notified().await;
            }
        }
        match self.failures.get(&call) {
            Some(err) => Err(err.clone()),
            None => Ok(PostResult {
                id: format!("post-{call}"),
            }),
        }
    }
}

/// Delegates to SQLite but refuses inserts once `allow` enqueues went through,
/// and fails the first `failing_updates` status writes.
struct FlakyQueue {
    inner: Arc<SqliteJobQueue>,
    allow: usize,
    enqueued: AtomicUsize,
    failing_updates: AtomicUsize,
}

impl FlakyQueue {
    fn new(inner: Arc<SqliteJobQueue>) -> Self {
        Self {
            inner,
            allow: usize::MAX,
            enqueued: AtomicUsize::new(0),
            failing_updates: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl JobQueueStore for FlakyQueue {
    async fn enqueue(&self, job: NewBatchJob) -> QueueResult<i64> {
        if self.enqueued.fetch_add(1, Ordering::SeqCst) >= self.allow {
            return Err(PersistenceError(anyhow::anyhow!("disk full")));
        }
        self.inner.enqueue(job).await
    }
    async fn list(&self, filter: Option<JobStatus>) -> QueueResult<Vec<BatchJob>> {
        self.inner.list(filter).await
    }
    async fn list_group(&self, group_id: Uuid) -> QueueResult<Vec<BatchJob>> {
        self.inner.list_group(group_id).await
    }
    async fn get(&self, id: i64) -> QueueResult<Option<BatchJob>> {
        self.inner.get(id).await
    }
    async fn update_status(
        &self,
        id: i64,
        from: JobStatus,
        to: JobStatus,
        error: Option<&str>,
    ) -> QueueResult<bool> {
        let failing = self
            .failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PersistenceError(anyhow::anyhow!("database is locked")));
        }
        self.inner.update_status(id, from, to, error).await
    }
    async fn claim(&self, id: i64, owner: Uuid) -> QueueResult<bool> {
        self.inner.claim(id, owner).await
    }
    async fn reschedule(
        &self,
        id: i64,
        payload: &JobPayload,
        scheduled_start_time: DateTime<Utc>,
    ) -> QueueResult<bool> {
        self.inner.reschedule(id, payload, scheduled_start_time).await
    }
    async fn heartbeat(&self, id: i64) -> QueueResult<()> {
        self.inner.heartbeat(id).await
    }
    async fn next_due(&self, now: DateTime<Utc>) -> QueueResult<Option<BatchJob>> {
        self.inner.next_due(now).await
    }
    async fn fail_stale(&self, older_than: DateTime<Utc>) -> QueueResult<u64> {
        self.inner.fail_stale(older_than).await
    }
    async fn remove(&self, id: i64) -> QueueResult<()> {
        self.inner.remove(id).await
    }
    async fn remove_where(&self, statuses: &[JobStatus]) -> QueueResult<u64> {
        self.inner.remove_where(statuses).await
    }
}

fn items(n: usize) -> Vec<ContentItem> {
    (0..n)
        .map(|i| ContentItem {
            id: format!("slides-{i}"),
            title: format!("Slideshow {i}"),
            media_urls: vec![format!("https://cdn.example/{i}.jpg")],
            caption: format!("caption {i}"),
            profile_ids: vec![],
        })
        .collect()
}

/// 10:00 UTC two days ago: every slot a few minutes apart is already due.
fn past_morning() -> DateTime<Utc> {
    let day = (Utc::now() - Duration::days(2)).date_naive();
    Utc.from_utc_datetime(&day.and_hms_opt(10, 0, 0).unwrap())
}

fn settings(start: DateTime<Utc>) -> ScheduleSettings {
    ScheduleSettings {
        start_time: start,
        interval_hours: 0.05,
        post_interval_minutes: 1.0,
        profile_ids: vec!["profile-a".into(), "profile-b".into()],
        batch_size: 10,
        timezone: chrono_tz::Tz::UTC,
    }
}

fn orchestrator(
    queue: Arc<dyn JobQueueStore>,
    api: Arc<FakeApi>,
    max_consecutive_failures: u32,
) -> BulkPostOrchestrator {
    BulkPostOrchestrator::new(
        queue,
        api,
        OrchestratorOptions {
            max_consecutive_failures,
        },
    )
}

#[tokio::test]
async fn item_failure_does_not_stop_the_batch() {
    let queue = setup_queue().await;
    let api = Arc::new(FakeApi::failing([(3, PostingError::http(422, "caption too long"))]));
    let orch = orchestrator(queue.clone(), api.clone(), 3);

    let ids = orch
        .start_bulk_post(items(5), PostingStrategy::Batch, settings(past_morning()))
        .await
        .unwrap();
    assert_eq!(ids.len(), 1);

    let summary = orch.wait().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.success_count, 4);
    assert_eq!(summary.error_count, 1);
    assert_eq!(summary.entries[2].status, EntryStatus::Error);
    assert_eq!(summary.entries[2].error_message.as_deref(), Some("caption too long"));

    let job = queue.get(ids[0]).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.claimed_by, Some(orch.owner_id()));
    assert_eq!(api.captions().await.len(), 5);

    let state = orch.state();
    assert_eq!(state.phase, Phase::Idle);
    assert!(!state.is_posting);
    assert_eq!(state.job_queue.len(), 1);
}

#[tokio::test]
async fn items_post_in_slot_order_across_batches() {
    let queue = setup_queue().await;
    let api = Arc::new(FakeApi::default());
    let orch = orchestrator(queue.clone(), api.clone(), 3);
    let mut s = settings(past_morning());
    s.batch_size = 2;

    let ids = orch
        .start_bulk_post(items(5), PostingStrategy::Batch, s)
        .await
        .unwrap();
    assert_eq!(ids.len(), 3);

    let summary = orch.wait().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.success_count, 5);
    let expected: Vec<String> = (0..5).map(|i| format!("caption {i}")).collect();
    assert_eq!(api.captions().await, expected);

    let jobs = queue.list(None).await.unwrap();
    assert!(jobs.iter().all(|j| j.status == JobStatus::Completed));
    assert!(jobs.iter().all(|j| j.group_id == summary.group_id));
    let batches: Vec<u32> = jobs.iter().map(|j| j.batch_index).collect();
    assert_eq!(batches, vec![0, 1, 2]);
    assert!(jobs.iter().all(|j| j.total_batches == 3));
}

#[tokio::test]
async fn stop_mid_batch_fails_the_job() {
    let queue = setup_queue().await;
    let api = Arc::new(FakeApi::gated(2));
    let orch = orchestrator(queue.clone(), api.clone(), 3);

    let ids = orch
        .start_bulk_post(items(5), PostingStrategy::Batch, settings(past_morning()))
        .await
        .unwrap();

    api.gate.as_ref().unwrap().reached.notified().await;
    orch.stop_bulk_post();
    orch.stop_bulk_post();
    api.gate.as_ref().unwrap().release.notify_one();

    let summary = orch.wait().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Stopped);
    assert_eq!(summary.error.as_deref(), Some("cancelled by user"));
    assert_eq!(summary.success_count, 2);
    let statuses: Vec<EntryStatus> = summary.entries.iter().map(|e| e.status).collect();
    assert_eq!(
        statuses,
        vec![
            EntryStatus::Success,
            EntryStatus::Success,
            EntryStatus::Pending,
            EntryStatus::Pending,
            EntryStatus::Pending,
        ]
    );
    assert_eq!(api.captions().await.len(), 2);

    let job = queue.get(ids[0]).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("cancelled by user"));
    assert!(!orch.is_active());
}

#[tokio::test]
async fn pause_holds_posting_until_resume() {
    let queue = setup_queue().await;
    let api = Arc::new(FakeApi::gated(1));
    let orch = orchestrator(queue.clone(), api.clone(), 3);

    orch.start_bulk_post(items(3), PostingStrategy::Batch, settings(past_morning()))
        .await
        .unwrap();

    api.gate.as_ref().unwrap().reached.notified().await;
    orch.pause_bulk_post();
    api.gate.as_ref().unwrap().release.notify_one();

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(api.captions().await.len(), 1);
    let state = orch.state();
    assert!(state.is_paused);
    assert_eq!(state.phase, Phase::Paused);
    assert_eq!(state.posting_schedule[0].status, EntryStatus::Success);
    assert_eq!(state.posting_schedule[1].status, EntryStatus::Pending);

    orch.resume_bulk_post();
    let summary = orch.wait().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.success_count, 3);
    assert_eq!(api.captions().await.len(), 3);
}

#[tokio::test]
async fn only_one_bulk_post_at_a_time() {
    let queue = setup_queue().await;
    let api = Arc::new(FakeApi::default());
    let orch = orchestrator(queue.clone(), api.clone(), 3);
    let tomorrow = Utc::now().date_naive() + Duration::days(2);
    let future = Utc.from_utc_datetime(&tomorrow.and_hms_opt(12, 0, 0).unwrap());

    let ids = orch
        .start_bulk_post(items(2), PostingStrategy::Batch, settings(future))
        .await
        .unwrap();
    let state = orch.state();
    assert!(state.is_posting);
    assert_eq!(state.phase, Phase::Processing);
    assert_eq!(state.next_batch_start_time, Some(future));

    let second = orch
        .start_bulk_post(items(1), PostingStrategy::Batch, settings(past_morning()))
        .await;
    assert!(matches!(second, Err(Error::AlreadyActive)));
    assert_eq!(queue.list(None).await.unwrap().len(), 1);

    let summary = orch.shutdown().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Stopped);
    assert!(api.captions().await.is_empty());
    let job = queue.get(ids[0]).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("cancelled by user"));
}

#[tokio::test]
async fn systemic_failures_abort_the_run() {
    let queue = setup_queue().await;
    let api = Arc::new(FakeApi::failing([
        (1, PostingError::transport("connection refused")),
        (2, PostingError::http(401, "bad key")),
    ]));
    let orch = orchestrator(queue.clone(), api.clone(), 2);
    let mut s = settings(past_morning());
    s.batch_size = 3;

    let ids = orch
        .start_bulk_post(items(4), PostingStrategy::Batch, s)
        .await
        .unwrap();
    let summary = orch.wait().await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Failed);
    assert_eq!(summary.error_count, 2);
    assert!(summary.error.as_deref().unwrap().contains("consecutive"));
    assert_eq!(api.captions().await.len(), 2);

    let first = queue.get(ids[0]).await.unwrap().unwrap();
    let second = queue.get(ids[1]).await.unwrap().unwrap();
    assert_eq!(first.status, JobStatus::Failed);
    assert_eq!(second.status, JobStatus::Failed);
    assert_eq!(first.error, second.error);
}

#[tokio::test]
async fn invalid_input_is_rejected_before_anything_is_stored() {
    let queue = setup_queue().await;
    let api = Arc::new(FakeApi::default());
    let orch = orchestrator(queue.clone(), api, 3);

    let empty = orch
        .start_bulk_post(vec![], PostingStrategy::Batch, settings(past_morning()))
        .await;
    assert!(matches!(empty, Err(Error::InvalidConfig(_))));

    let mut s = settings(past_morning());
    s.profile_ids.clear();
    let no_profiles = orch
        .start_bulk_post(items(2), PostingStrategy::SequentialInterval, s)
        .await;
    assert!(matches!(no_profiles, Err(Error::InvalidConfig(_))));

    let mut s = settings(past_morning());
    s.interval_hours = -1.0;
    let negative = orch
        .start_bulk_post(items(2), PostingStrategy::SequentialInterval, s)
        .await;
    assert!(matches!(negative, Err(Error::InvalidConfig(_))));

    assert!(queue.list(None).await.unwrap().is_empty());
    assert!(!orch.is_active());
    assert_eq!(orch.state().phase, Phase::Idle);
}

#[tokio::test]
async fn failed_enqueue_leaves_no_partial_group() {
    let sqlite = setup_queue().await;
    let queue = Arc::new(FlakyQueue {
        allow: 1,
        ..FlakyQueue::new(sqlite.clone())
    });
    let api = Arc::new(FakeApi::default());
    let orch = orchestrator(queue, api.clone(), 3);
    let mut s = settings(past_morning());
    s.batch_size = 2;

    let res = orch.start_bulk_post(items(4), PostingStrategy::Batch, s).await;
    assert!(matches!(res, Err(Error::Persistence(_))));
    assert!(sqlite.list(None).await.unwrap().is_empty());
    assert!(!orch.is_active());
    assert!(api.captions().await.is_empty());
}

fn stored_job(start: DateTime<Utc>, count: usize) -> NewBatchJob {
    let mut s = settings(start);
    s.post_interval_minutes = 10.0;
    NewBatchJob {
        group_id: Uuid::new_v4(),
        batch_index: 0,
        total_batches: 1,
        payload: JobPayload {
            items: items(count),
            settings: s,
            strategy: PostingStrategy::Batch,
            first_index: 0,
        },
        scheduled_start_time: start,
    }
}

#[tokio::test]
async fn reschedule_keeps_relative_spacing() {
    let queue = setup_queue().await;
    let orch = orchestrator(queue.clone(), Arc::new(FakeApi::default()), 3);
    let start = past_morning();
    let first = queue.enqueue(stored_job(start, 3)).await.unwrap();
    let second = queue
        .enqueue(stored_job(start + Duration::hours(3), 3))
        .await
        .unwrap();

    let now = start + Duration::hours(50);
    assert_eq!(orch.reschedule_queue_at(now).await.unwrap(), 2);

    let first = queue.get(first).await.unwrap().unwrap();
    let second = queue.get(second).await.unwrap().unwrap();
    assert_eq!(first.scheduled_start_time, now);
    assert_eq!(second.scheduled_start_time, now + Duration::hours(3));

    let slots = batch_slots(
        first.payload.strategy,
        &first.payload.settings,
        first.payload.first_index,
        first.payload.items.len(),
    )
    .unwrap();
    assert_eq!(
        slots,
        vec![now, now + Duration::minutes(10), now + Duration::minutes(20)]
    );
    assert_eq!(orch.state().next_batch_start_time, Some(now));
}

#[tokio::test]
async fn reschedule_moves_out_of_quiet_hours() {
    let queue = setup_queue().await;
    let orch = orchestrator(queue.clone(), Arc::new(FakeApi::default()), 3);
    let start = past_morning();
    let id = queue.enqueue(stored_job(start, 1)).await.unwrap();

    // 23:30 on the start day.
    let now = start + Duration::minutes(13 * 60 + 30);
    orch.reschedule_queue_at(now).await.unwrap();

    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.scheduled_start_time, start + Duration::hours(23));
}

#[tokio::test]
async fn claimed_elsewhere_is_skipped() {
    let queue = setup_queue().await;
    let api = Arc::new(FakeApi::default());
    let orch = orchestrator(queue.clone(), api.clone(), 3);
    let id = queue.enqueue(stored_job(past_morning(), 2)).await.unwrap();
    let job = queue.get(id).await.unwrap().unwrap();

    let other = Uuid::new_v4();
    assert!(queue.claim(id, other).await.unwrap());

    orch.process_job(job).await.unwrap();
    let summary = orch.wait().await.unwrap();
    assert_eq!(summary.skipped_jobs, vec![id]);
    assert_eq!(summary.success_count, 0);
    assert!(api.captions().await.is_empty());

    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.claimed_by, Some(other));
}

#[tokio::test]
async fn worker_drives_due_jobs() {
    let queue = setup_queue().await;
    let api = Arc::new(FakeApi::default());
    let orch = orchestrator(queue.clone(), api.clone(), 3);
    let id = queue.enqueue(stored_job(past_morning(), 2)).await.unwrap();

    let stale_after = Duration::minutes(10);
    assert!(worker::process_next_job(queue.as_ref(), &orch, stale_after)
        .await
        .unwrap());
    let summary = orch.wait().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.job_ids, vec![id]);
    assert_eq!(api.captions().await.len(), 2);

    assert!(!worker::process_next_job(queue.as_ref(), &orch, stale_after)
        .await
        .unwrap());
    assert_eq!(
        queue.get(id).await.unwrap().unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn failed_status_write_is_reconciled_on_refresh() {
    let sqlite = setup_queue().await;
    let queue = Arc::new(FlakyQueue::new(sqlite.clone()));
    queue.failing_updates.store(1, Ordering::SeqCst);
    let api = Arc::new(FakeApi::default());
    let orch = orchestrator(queue, api, 3);

    let ids = orch
        .start_bulk_post(items(2), PostingStrategy::Batch, settings(past_morning()))
        .await
        .unwrap();
    let summary = orch.wait().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.success_count, 2);

    // The completion write was lost; the row still shows the claim.
    let job = sqlite.get(ids[0]).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);

    let jobs = orch.refresh_queue().await.unwrap();
    assert_eq!(jobs[0].status, JobStatus::Completed);
    let job = sqlite.get(ids[0]).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn panicking_run_fails_the_held_batch() {
    let queue = setup_queue().await;
    let api = Arc::new(FakeApi {
        panic_on: Some(2),
        ..Default::default()
    });
    let orch = orchestrator(queue.clone(), api.clone(), 3);

    let ids = orch
        .start_bulk_post(items(3), PostingStrategy::Batch, settings(past_morning()))
        .await
        .unwrap();
    let summary = orch.wait().await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Failed);
    assert_eq!(summary.error.as_deref(), Some(CRASH_REASON));
    assert_eq!(summary.success_count, 1);

    let job = queue.get(ids[0]).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some(CRASH_REASON));

    assert!(!orch.is_active());
    let state = orch.state();
    assert_eq!(state.phase, Phase::Idle);
    assert!(!state.is_posting);

    // The orchestrator is usable again afterwards.
    orch.start_bulk_post(items(1), PostingStrategy::Batch, settings(past_morning()))
        .await
        .unwrap();
    assert_eq!(orch.wait().await.unwrap().outcome, RunOutcome::Completed);
}

#[tokio::test]
async fn worker_leaves_jobs_held_by_another_driver_alone() {
    let queue = setup_queue().await;
    let live_api = Arc::new(FakeApi::gated(1));
    let live = orchestrator(queue.clone(), live_api.clone(), 3);
    let mut s = settings(past_morning());
    s.batch_size = 1;

    let ids = live
        .start_bulk_post(items(2), PostingStrategy::Batch, s)
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);
    live_api.gate.as_ref().unwrap().reached.notified().await;
    live.pause_bulk_post();

    let poller_api = Arc::new(FakeApi::default());
    let poller = orchestrator(queue.clone(), poller_api.clone(), 3);
    let picked = worker::process_next_job(queue.as_ref(), &poller, Duration::minutes(10))
        .await
        .unwrap();
    assert!(!picked);
    assert!(!poller.is_active());
    assert_eq!(
        queue.get(ids[1]).await.unwrap().unwrap().status,
        JobStatus::Pending
    );

    live_api.gate.as_ref().unwrap().release.notify_one();
    live.resume_bulk_post();
    let summary = live.wait().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert!(summary.skipped_jobs.is_empty());
    assert_eq!(live_api.captions().await, vec!["caption 0", "caption 1"]);
    assert!(poller_api.captions().await.is_empty());
}

#[tokio::test]
async fn worker_keeps_batch_order_within_a_group() {
    let queue = setup_queue().await;
    let api = Arc::new(FakeApi::default());
    let orch = orchestrator(queue.clone(), api.clone(), 3);
    let group_id = Uuid::new_v4();
    let later = Utc::now() + Duration::days(2);

    let mut first = stored_job(later, 1);
    first.group_id = group_id;
    first.total_batches = 2;
    let first = queue.enqueue(first).await.unwrap();

    let mut second = stored_job(past_morning(), 1);
    second.group_id = group_id;
    second.batch_index = 1;
    second.total_batches = 2;
    let second = queue.enqueue(second).await.unwrap();

    assert!(!worker::process_next_job(queue.as_ref(), &orch, Duration::minutes(10))
        .await
        .unwrap());
    assert!(api.captions().await.is_empty());

    queue
        .update_status(first, JobStatus::Pending, JobStatus::Failed, Some("dropped"))
        .await
        .unwrap();
    assert!(worker::process_next_job(queue.as_ref(), &orch, Duration::minutes(10))
        .await
        .unwrap());
    let summary = orch.wait().await.unwrap();
    assert_eq!(summary.job_ids, vec![second]);
    assert_eq!(summary.outcome, RunOutcome::Completed);
}

#[tokio::test]
async fn run_follows_a_schedule_changed_by_another_process() {
    let queue = setup_queue().await;
    let api = Arc::new(FakeApi::gated(1));
    let live = orchestrator(queue.clone(), api.clone(), 3);
    let mut s = settings(past_morning());
    s.batch_size = 1;

    let ids = live
        .start_bulk_post(items(2), PostingStrategy::Batch, s)
        .await
        .unwrap();
    api.gate.as_ref().unwrap().reached.notified().await;

    // A separate operator session moves the still-pending second batch.
    let operator = orchestrator(queue.clone(), Arc::new(FakeApi::default()), 3);
    let moved_to = past_morning() + Duration::hours(25);
    assert_eq!(operator.reschedule_queue_at(moved_to).await.unwrap(), 1);

    api.gate.as_ref().unwrap().release.notify_one();
    let summary = live.wait().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.entries.len(), 2);
    assert_eq!(summary.entries[1].scheduled_time, moved_to);
    assert_eq!(
        queue.get(ids[1]).await.unwrap().unwrap().scheduled_start_time,
        moved_to
    );
}
