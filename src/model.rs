use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One publishable unit (a slideshow).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentItem {
    pub id: String,
    pub title: String,
    pub media_urls: Vec<String>,
    pub caption: String,
    #[serde(default)]
    pub profile_ids: Vec<String>,
}

impl ContentItem {
    /// Profiles this item posts to: its own targets, or the batch-wide list when it has none.
    pub fn target_profiles<'a>(&'a self, settings: &'a ScheduleSettings) -> &'a [String] {
        if self.profile_ids.is_empty() {
            &settings.profile_ids
        } else {
            &self.profile_ids
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PostingStrategy {
    SequentialInterval,
    Batch,
}

impl PostingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostingStrategy::SequentialInterval => "sequential-interval",
            PostingStrategy::Batch => "batch",
        }
    }
}

fn default_interval_hours() -> f64 {
    1.0
}

fn default_post_interval_minutes() -> f64 {
    15.0
}

fn default_batch_size() -> u32 {
    10
}

fn default_timezone() -> Tz {
    Tz::UTC
}

/// Immutable scheduling input captured when a bulk post is confirmed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleSettings {
    pub start_time: DateTime<Utc>,
    #[serde(default = "default_interval_hours")]
    pub interval_hours: f64,
    #[serde(default = "default_post_interval_minutes")]
    pub post_interval_minutes: f64,
    pub profile_ids: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Zone in which quiet hours are evaluated.
    #[serde(default = "default_timezone")]
    pub timezone: Tz,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse_status(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Structured record stored with every batch job. Only this crate reads it back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobPayload {
    pub items: Vec<ContentItem>,
    pub settings: ScheduleSettings,
    pub strategy: PostingStrategy,
    /// Position of `items[0]` within the whole bulk post.
    #[serde(default)]
    pub first_index: usize,
}

/// A batch job as it is about to be inserted.
#[derive(Debug, Clone)]
pub struct NewBatchJob {
    pub group_id: Uuid,
    pub batch_index: u32,
    pub total_batches: u32,
    pub payload: JobPayload,
    pub scheduled_start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: i64,
    pub group_id: Uuid,
    pub batch_index: u32,
    pub total_batches: u32,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub scheduled_start_time: DateTime<Utc>,
    pub error: Option<String>,
    pub claimed_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Posting,
    Success,
    Error,
}

/// Progress of one item inside the batch currently being processed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostingScheduleEntry {
    pub slideshow_id: String,
    pub slideshow_title: String,
    pub scheduled_time: DateTime<Utc>,
    pub status: EntryStatus,
    pub error_message: Option<String>,
}

impl PostingScheduleEntry {
    pub fn pending(item: &ContentItem, scheduled_time: DateTime<Utc>) -> Self {
        Self {
            slideshow_id: item.id.clone(),
            slideshow_title: item.title.clone(),
            scheduled_time,
            status: EntryStatus::Pending,
            error_message: None,
        }
    }
}

/// A connected social account on the aggregator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostResult {
    pub id: String,
}
