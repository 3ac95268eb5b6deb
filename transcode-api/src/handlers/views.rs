use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use conveyor_core::{Job, JobFailure, JobState, Priority};

/// The public job record. Queue internals (lease id, heartbeat, epoch) stay
/// server-side.
#[derive(Debug, Serialize)]
pub struct JobView {
    pub id: Uuid,
    pub status: JobState,
    pub priority: Priority,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
    pub attempt: i32,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub links: JobLinks,
}

#[derive(Debug, Serialize)]
pub struct JobLinks {
    #[serde(rename = "self")]
    pub self_link: String,
    pub events: String,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        JobView {
            id: job.id,
            status: job.state,
            priority: job.priority_label(),
            progress: job.progress,
            stage: job.stage.clone(),
            fps: job.fps,
            eta_seconds: job.eta_seconds,
            error: job.error.as_ref().map(|e| e.0.clone()),
            attempt: job.attempt,
            cancel_requested: job.cancel_requested,
            created_at: job.created_at,
            started_at: job.started_at,
            updated_at: job.updated_at,
            finished_at: job.finished_at,
            links: JobLinks {
                self_link: format!("/api/v1/jobs/{}", job.id),
                events: format!("/api/v1/jobs/{}/events", job.id),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobEnvelope {
    pub job: JobView,
}

impl JobEnvelope {
    pub fn new(job: &Job) -> Self {
        Self {
            job: JobView::from(job),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Pagination {
    pub page: i64,
    pub per_page: i64,
    pub total: i64,
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobView>,
    pub pagination: Pagination,
}
