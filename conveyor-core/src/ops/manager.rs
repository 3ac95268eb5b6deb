use chrono::Utc;
use uuid::Uuid;

use crate::error::QueueError;
use crate::types::{Job, JobInit, JobState, JobStats};

/// Conditionally bump the owner's in-flight counter. Returns false when the
/// ceiling is already reached; run inside the same transaction as the job
/// insert so admission is check-and-increment, not check-then-insert.
pub async fn try_increment_quota<'c, E>(
    executor: E,
    owner_id: &str,
    quota: i32,
) -> Result<bool, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    if quota <= 0 {
        return Ok(false);
    }

    let updated: Option<i32> = sqlx::query_scalar(
        r#"
INSERT INTO conveyor_owner_quotas (owner_id, in_flight)
VALUES ($1, 1)
ON CONFLICT (owner_id) DO UPDATE
SET in_flight = conveyor_owner_quotas.in_flight + 1
WHERE conveyor_owner_quotas.in_flight < $2
RETURNING in_flight
        "#,
    )
    .bind(owner_id)
    .bind(quota)
    .fetch_optional(executor)
    .await?;

    Ok(updated.is_some())
}

pub async fn decrement_quota<'c, E>(executor: E, owner_id: &str) -> Result<(), QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query(
        "UPDATE conveyor_owner_quotas SET in_flight = GREATEST(in_flight - 1, 0) WHERE owner_id = $1",
    )
    .bind(owner_id)
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn in_flight_count<'c, E>(executor: E, owner_id: &str) -> Result<i32, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let count: Option<i32> =
        sqlx::query_scalar("SELECT in_flight FROM conveyor_owner_quotas WHERE owner_id = $1")
            .bind(owner_id)
            .fetch_optional(executor)
            .await?;

    Ok(count.unwrap_or(0))
}

/// Insert a fresh job row. The id is generated here, inside the caller's
/// transaction, so there is no generate-before-commit window.
pub async fn insert_job<'c, E>(executor: E, init: &JobInit) -> Result<Uuid, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let id = Uuid::now_v7();

    sqlx::query(
        r#"
INSERT INTO conveyor_jobs
    (id, owner_id, idempotency_key, state, priority, operations, input_url, output_url,
     options, webhook_url, progress_webhook, max_attempts, scheduled_at, created_at, updated_at)
VALUES
    ($1, $2, $3, 'queued', $4, $5, $6, $7, $8, $9, $10, $11, NOW(), NOW(), NOW())
        "#,
    )
    .bind(id)
    .bind(&init.owner_id)
    .bind(&init.idempotency_key)
    .bind(init.priority.weight())
    .bind(sqlx::types::Json(&init.operations))
    .bind(&init.input_url)
    .bind(&init.output_url)
    .bind(sqlx::types::Json(&init.options))
    .bind(&init.webhook_url)
    .bind(init.progress_webhook)
    .bind(init.max_attempts)
    .execute(executor)
    .await?;

    Ok(id)
}

pub async fn find_by_idempotency_key<'c, E>(
    executor: E,
    owner_id: &str,
    key: &str,
) -> Result<Option<Uuid>, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let id: Option<Uuid> = sqlx::query_scalar(
        "SELECT id FROM conveyor_jobs WHERE owner_id = $1 AND idempotency_key = $2",
    )
    .bind(owner_id)
    .bind(key)
    .fetch_optional(executor)
    .await?;

    Ok(id)
}

pub async fn load_job<'c, E>(executor: E, id: Uuid) -> Result<Option<Job>, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let job = sqlx::query_as::<_, Job>("SELECT * FROM conveyor_jobs WHERE id = $1")
        .bind(id)
        .fetch_optional(executor)
        .await?;

    Ok(job)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListOrder {
    CreatedAsc,
    CreatedDesc,
}

pub async fn list_jobs<'c, E>(
    executor: E,
    owner_id: &str,
    state: Option<JobState>,
    order: ListOrder,
    limit: i64,
    offset: i64,
) -> Result<Vec<Job>, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let order_clause = match order {
        ListOrder::CreatedAsc => "created_at ASC",
        ListOrder::CreatedDesc => "created_at DESC",
    };

    let query = format!(
        r#"
SELECT * FROM conveyor_jobs
WHERE owner_id = $1 AND ($2::job_state IS NULL OR state = $2)
ORDER BY {order_clause}
LIMIT $3 OFFSET $4
        "#
    );

    let jobs = sqlx::query_as::<_, Job>(&query)
        .bind(owner_id)
        .bind(state)
        .bind(limit)
        .bind(offset)
        .fetch_all(executor)
        .await?;

    Ok(jobs)
}

pub async fn count_jobs<'c, E>(
    executor: E,
    owner_id: &str,
    state: Option<JobState>,
) -> Result<i64, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM conveyor_jobs WHERE owner_id = $1 AND ($2::job_state IS NULL OR state = $2)",
    )
    .bind(owner_id)
    .bind(state)
    .fetch_one(executor)
    .await?;

    Ok(count)
}

/// A single grouped aggregation; no per-status round-trips.
pub async fn job_stats<'c, E>(executor: E, owner_id: &str) -> Result<JobStats, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let rows: Vec<(JobState, i64)> = sqlx::query_as(
        "SELECT state, COUNT(*) FROM conveyor_jobs WHERE owner_id = $1 GROUP BY state",
    )
    .bind(owner_id)
    .fetch_all(executor)
    .await?;

    let mut stats = JobStats::default();
    for (state, count) in rows {
        stats.apply(state, count);
    }
    Ok(stats)
}

/// Cancel a job that has not started yet. Returns the cancelled row when the
/// transition happened; the caller owns the follow-up bookkeeping (quota
/// decrement, terminal event) inside its transaction.
pub async fn cancel_if_pending<'c, E>(executor: E, id: Uuid) -> Result<Option<Job>, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let job = sqlx::query_as::<_, Job>(
        r#"
UPDATE conveyor_jobs
SET state = 'cancelled', finished_at = NOW(), updated_at = NOW()
WHERE id = $1 AND state = 'queued'
RETURNING *
        "#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await?;

    Ok(job)
}

/// Flag a running job for cooperative cancellation. The worker observes the
/// flag at its next debounce point and signals the transcoder.
pub async fn request_cancel<'c, E>(executor: E, id: Uuid) -> Result<bool, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let res = sqlx::query(
        "UPDATE conveyor_jobs SET cancel_requested = TRUE, updated_at = NOW() WHERE id = $1 AND state = 'processing'",
    )
    .bind(id)
    .execute(executor)
    .await?;

    Ok(res.rows_affected() > 0)
}

/// Terminal event appended outside a worker lease (queued-cancel, janitor
/// dead-letter). Bumps the job's event counter without a lock condition.
pub async fn append_unfenced_terminal_event<'c, E>(
    executor: E,
    id: Uuid,
    state: JobState,
    percent: f64,
    stage: &str,
    error: Option<&crate::error::JobFailure>,
) -> Result<i64, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let seq: Option<i64> = sqlx::query_scalar(
        r#"
WITH bumped AS (
    UPDATE conveyor_jobs SET event_seq = event_seq + 1
    WHERE id = $1
    RETURNING event_seq
)
INSERT INTO conveyor_progress_events (job_id, seq, recorded_at, percent, stage, terminal, error)
SELECT $1, event_seq, $2, $3, $4, $5, $6 FROM bumped
RETURNING seq
        "#,
    )
    .bind(id)
    .bind(Utc::now())
    .bind(percent)
    .bind(stage)
    .bind(state)
    .bind(error.map(sqlx::types::Json))
    .fetch_optional(executor)
    .await?;

    seq.ok_or(QueueError::JobNotFound(id))
}
