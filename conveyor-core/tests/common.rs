use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use conveyor_core::storage::MockStorage;
use conveyor_core::{
    AdmissionLimits, JobManager, Operation, Priority, Submission, SubmitOutcome,
};

#[allow(dead_code)]
pub const INPUT_LOCATOR: &str = "file:///storage/in/clip.mov";

#[allow(dead_code)]
pub fn limits() -> AdmissionLimits {
    AdmissionLimits {
        local_roots: vec![PathBuf::from("/storage")],
        ..Default::default()
    }
}

#[allow(dead_code)]
pub fn storage_with_input() -> MockStorage {
    MockStorage::new().with_object(INPUT_LOCATOR, vec![0u8; 2048])
}

#[allow(dead_code)]
pub fn transcode_submission() -> Submission {
    Submission {
        input: INPUT_LOCATOR.to_owned(),
        output: "mp4".to_owned(),
        operations: vec![Operation::Transcode {
            video_codec: Some("h264".to_owned()),
            audio_codec: None,
            crf: Some(23),
            bitrate: None,
            resolution: None,
            preset: None,
        }],
        priority: Priority::Normal,
        options: BTreeMap::new(),
        webhook_url: None,
        progress_webhook: false,
        idempotency_key: None,
    }
}

/// Submit one job for `owner` and hand back its id.
#[allow(dead_code)]
pub async fn submit_one(pool: &PgPool, owner: &str, quota: i32) -> Uuid {
    submit(pool, owner, quota, transcode_submission()).await
}

#[allow(dead_code)]
pub async fn submit(pool: &PgPool, owner: &str, quota: i32, submission: Submission) -> Uuid {
    let manager = JobManager::from_pool(pool.clone());
    let outcome = manager
        .submit(owner, quota, &submission, &limits(), &storage_with_input())
        .await
        .expect("submission should be admitted");
    match outcome {
        SubmitOutcome::Created(id) => id,
        SubmitOutcome::Existing(id) => id,
    }
}

/// Age a processing job's heartbeat so the janitor sees it as stalled.
#[allow(dead_code)]
pub async fn age_heartbeat(pool: &PgPool, job_id: Uuid, by: Duration) {
    let old: DateTime<Utc> = Utc::now() - by;
    sqlx::query("UPDATE conveyor_jobs SET last_heartbeat = $2 WHERE id = $1")
        .bind(job_id)
        .bind(old)
        .execute(pool)
        .await
        .expect("failed to age heartbeat");
}

/// Pull a scheduled-in-the-future job back so it can be dequeued now.
#[allow(dead_code)]
pub async fn make_due(pool: &PgPool, job_id: Uuid) {
    sqlx::query("UPDATE conveyor_jobs SET scheduled_at = NOW() - INTERVAL '1 second' WHERE id = $1")
        .bind(job_id)
        .execute(pool)
        .await
        .expect("failed to reschedule job for tests");
}

#[allow(dead_code)]
pub async fn in_flight(pool: &PgPool, owner: &str) -> i32 {
    sqlx::query_scalar::<_, Option<i32>>(
        "SELECT in_flight FROM conveyor_owner_quotas WHERE owner_id = $1",
    )
    .bind(owner)
    .fetch_optional(pool)
    .await
    .expect("quota query failed")
    .flatten()
    .unwrap_or(0)
}
