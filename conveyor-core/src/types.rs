use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobFailure;

/// Public lifecycle of a job. `queued → processing → {completed | failed |
/// cancelled}`; `cancelled` is also reachable from `queued`, and
/// `processing → queued` happens only when the janitor returns a stalled
/// lease for redelivery. Terminal states are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "job_state", rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            invalid => Err(format!("{invalid} is not a valid JobState")),
        }
    }
}

/// Submission priority. The wire names map to fixed scheduling weights;
/// within a weight, dequeue order is FIFO by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn weight(&self) -> i16 {
        match self {
            Priority::Low => 1,
            Priority::Normal => 5,
            Priority::High => 8,
            Priority::Urgent => 10,
        }
    }

    pub fn from_weight(weight: i16) -> Priority {
        match weight {
            w if w <= 1 => Priority::Low,
            w if w <= 5 => Priority::Normal,
            w if w <= 8 => Priority::High,
            _ => Priority::Urgent,
        }
    }
}

/// The closed set of operations a job may request. Unknown tags are rejected
/// at admission with `INVALID_OPERATION` instead of being silently ignored
/// at execution time.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    Transcode {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        video_codec: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_codec: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        crf: Option<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bitrate: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resolution: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preset: Option<String>,
    },
    Trim {
        start_seconds: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_seconds: Option<f64>,
    },
    Filter {
        name: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        params: BTreeMap<String, String>,
    },
    Analyze {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        metrics: Vec<String>,
    },
    Stream {
        format: StreamFormat,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        segment_seconds: Option<u32>,
    },
    Watermark {
        image: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        opacity: Option<f32>,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Transcode { .. } => "transcode",
            Operation::Trim { .. } => "trim",
            Operation::Filter { .. } => "filter",
            Operation::Analyze { .. } => "analyze",
            Operation::Stream { .. } => "stream",
            Operation::Watermark { .. } => "watermark",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamFormat {
    Hls,
    Dash,
}

impl StreamFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamFormat::Hls => "hls",
            StreamFormat::Dash => "dash",
        }
    }
}

/// A normalized submission as handed to the admission pipeline, after the
/// API layer has parsed the request body. Everything here is still
/// untrusted; `admission::validate` runs the full check sequence.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Submission {
    pub input: String,
    pub output: String,
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub progress_webhook: bool,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// A full job row. The same table carries both the public record and the
/// queue bookkeeping (lease, heartbeat, scheduling), so a dequeue is a
/// single atomic state transition.
#[derive(Debug, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    pub owner_id: String,
    pub idempotency_key: Option<String>,

    pub state: JobState,
    pub priority: i16,
    pub operations: sqlx::types::Json<Vec<Operation>>,
    pub input_url: String,
    pub output_url: String,
    pub options: sqlx::types::Json<BTreeMap<String, serde_json::Value>>,
    pub webhook_url: Option<String>,
    pub progress_webhook: bool,

    pub progress: f64,
    pub stage: Option<String>,
    pub fps: Option<f64>,
    pub eta_seconds: Option<i64>,
    pub error: Option<sqlx::types::Json<JobFailure>>,
    pub cancel_requested: bool,

    pub attempt: i32,
    pub max_attempts: i32,
    pub worker_id: Option<String>,
    pub lock_id: Option<Uuid>,
    pub lease_epoch: i64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub janitor_touch_count: i16,
    pub event_seq: i64,

    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn priority_label(&self) -> Priority {
        Priority::from_weight(self.priority)
    }
}

/// The chunk of data needed to persist a new job. Produced by admission
/// after validation; the id is generated inside the creating transaction.
#[derive(Debug, Clone)]
pub struct JobInit {
    pub owner_id: String,
    pub idempotency_key: Option<String>,
    pub priority: Priority,
    pub operations: Vec<Operation>,
    pub input_url: String,
    pub output_url: String,
    pub options: BTreeMap<String, serde_json::Value>,
    pub webhook_url: Option<String>,
    pub progress_webhook: bool,
    pub max_attempts: i32,
}

/// An in-flight progress sample from the worker, flushed on the debounce
/// interval or on stage change.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub percent: f64,
    pub stage: String,
    pub fps: Option<f64>,
    pub eta_seconds: Option<i64>,
}

/// One frame on the progress bus / SSE stream. Also the shape persisted in
/// the per-job event ring for `Last-Event-ID` replay. A frame carrying
/// `terminal` is the last frame ever emitted for its job.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProgressFrame {
    pub job_id: Uuid,
    pub seq: i64,
    pub recorded_at: DateTime<Utc>,
    pub percent: f64,
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal: Option<JobState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
}

#[derive(Debug, sqlx::FromRow)]
pub struct ProgressEventRow {
    pub job_id: Uuid,
    pub seq: i64,
    pub recorded_at: DateTime<Utc>,
    pub percent: f64,
    pub stage: String,
    pub fps: Option<f64>,
    pub eta_seconds: Option<i64>,
    pub terminal: Option<JobState>,
    pub error: Option<sqlx::types::Json<JobFailure>>,
}

impl From<ProgressEventRow> for ProgressFrame {
    fn from(row: ProgressEventRow) -> Self {
        ProgressFrame {
            job_id: row.job_id,
            seq: row.seq,
            recorded_at: row.recorded_at,
            percent: row.percent,
            stage: row.stage,
            fps: row.fps,
            eta_seconds: row.eta_seconds,
            terminal: row.terminal,
            error: row.error.map(|e| e.0),
        }
    }
}

/// Lifecycle of a webhook delivery record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "delivery_state", rename_all = "lowercase")]
pub enum DeliveryState {
    Available,
    Running,
    Delivered,
    Dead,
}

/// Which job event a delivery notifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookEvent {
    Completed,
    Failed,
    Cancelled,
    Progress,
}

impl WebhookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEvent::Completed => "completed",
            WebhookEvent::Failed => "failed",
            WebhookEvent::Cancelled => "cancelled",
            WebhookEvent::Progress => "progress",
        }
    }

    pub fn from_terminal(state: JobState) -> Option<WebhookEvent> {
        match state {
            JobState::Completed => Some(WebhookEvent::Completed),
            JobState::Failed => Some(WebhookEvent::Failed),
            JobState::Cancelled => Some(WebhookEvent::Cancelled),
            _ => None,
        }
    }
}

impl FromStr for WebhookEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(WebhookEvent::Completed),
            "failed" => Ok(WebhookEvent::Failed),
            "cancelled" => Ok(WebhookEvent::Cancelled),
            "progress" => Ok(WebhookEvent::Progress),
            invalid => Err(format!("{invalid} is not a valid WebhookEvent")),
        }
    }
}

/// The body POSTed to a webhook target. The error member is always the
/// sanitized object; raw transcoder output never reaches this type.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookPayload {
    pub job_id: Uuid,
    pub event: WebhookEvent,
    pub state: JobState,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
    pub attempt: i32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDelivery {
    pub job_id: Uuid,
    pub owner_id: String,
    pub event: WebhookEvent,
    pub url: String,
    pub payload: WebhookPayload,
    pub max_attempts: i32,
}

#[derive(Debug, sqlx::FromRow)]
pub struct Delivery {
    pub id: i64,
    pub job_id: Uuid,
    pub owner_id: String,
    pub event: String,
    pub url: String,
    pub payload: sqlx::types::Json<WebhookPayload>,
    pub state: DeliveryState,
    pub attempt: i32,
    pub max_attempts: i32,
    pub scheduled_at: DateTime<Utc>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub attempted_by: Vec<String>,
    pub last_status: Option<i16>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Per-owner status counts, produced by a single grouped aggregation.
#[derive(Debug, Default, Clone, Serialize)]
pub struct JobStats {
    pub queued: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}

impl JobStats {
    pub fn apply(&mut self, state: JobState, count: i64) {
        match state {
            JobState::Queued => self.queued = count,
            JobState::Processing => self.processing = count,
            JobState::Completed => self.completed = count,
            JobState::Failed => self.failed = count,
            JobState::Cancelled => self.cancelled = count,
        }
    }
}

/// Resolved API key record as handed back by the auth collaborator.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiKeyRecord {
    pub key_id: String,
    pub owner_id: String,
    pub quota: i32,
    pub secret: String,
}
