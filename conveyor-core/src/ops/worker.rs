use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{JobFailure, QueueError};
use crate::ops::meta::throw_if_no_rows;
use crate::types::{Job, JobState, ProgressEventRow, ProgressUpdate};

/// How many ring entries are kept per job.
pub const PROGRESS_RING_SIZE: i64 = 256;

/// Atomically lease the next batch of runnable jobs. This is both the queue
/// lease and the per-job lock: the `FOR UPDATE SKIP LOCKED` CTE guarantees a
/// job row moves to `processing` under exactly one `lock_id`, and
/// `lease_epoch` increases with every successful grant so stale holders can
/// be recognized. Higher priority weight wins; within a weight, FIFO.
pub async fn dequeue_jobs<'c, E>(
    executor: E,
    worker_id: &str,
    max: usize,
) -> Result<Vec<Job>, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let lock_id = Uuid::now_v7();

    let jobs = sqlx::query_as::<_, Job>(
        r#"
WITH available AS (
    SELECT id
    FROM conveyor_jobs
    WHERE state = 'queued' AND scheduled_at <= NOW()
    ORDER BY priority DESC, created_at ASC
    LIMIT $1
    FOR UPDATE SKIP LOCKED
)
UPDATE conveyor_jobs
SET
    state = 'processing',
    lock_id = $2,
    worker_id = $3,
    lease_epoch = conveyor_jobs.lease_epoch + 1,
    attempt = conveyor_jobs.attempt + 1,
    last_heartbeat = NOW(),
    started_at = COALESCE(conveyor_jobs.started_at, NOW()),
    updated_at = NOW()
FROM available
WHERE conveyor_jobs.id = available.id
RETURNING conveyor_jobs.*
        "#,
    )
    .bind(max as i64)
    .bind(lock_id)
    .bind(worker_id)
    .fetch_all(executor)
    .await?;

    Ok(jobs)
}

/// Renew the lease. Called on a timer at a third of the lease TTL.
pub async fn set_heartbeat<'c, E>(executor: E, job_id: Uuid, lock_id: Uuid) -> Result<(), QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let res = sqlx::query(
        "UPDATE conveyor_jobs SET last_heartbeat = NOW() WHERE id = $1 AND lock_id = $2 AND state = 'processing'",
    )
    .bind(job_id)
    .bind(lock_id)
    .execute(executor)
    .await?;

    throw_if_no_rows(res, job_id, lock_id)
}

/// Flush a progress sample onto the job row. Progress is monotonic within an
/// attempt (`GREATEST` guards against late out-of-order samples). Returns
/// the current `cancel_requested` flag, making every flush a cancellation
/// observation point.
pub async fn flush_progress<'c, E>(
    executor: E,
    job_id: Uuid,
    lock_id: Uuid,
    update: &ProgressUpdate,
) -> Result<bool, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let cancel_requested: Option<bool> = sqlx::query_scalar(
        r#"
UPDATE conveyor_jobs
SET
    progress = LEAST(GREATEST(progress, $3), 100),
    stage = $4,
    fps = $5,
    eta_seconds = $6,
    last_heartbeat = NOW(),
    updated_at = NOW()
WHERE id = $1 AND lock_id = $2 AND state = 'processing'
RETURNING cancel_requested
        "#,
    )
    .bind(job_id)
    .bind(lock_id)
    .bind(update.percent)
    .bind(&update.stage)
    .bind(update.fps)
    .bind(update.eta_seconds)
    .fetch_optional(executor)
    .await?;

    cancel_requested.ok_or(QueueError::InvalidLock {
        lock: lock_id,
        job: job_id,
    })
}

/// Append one frame to the job's event ring, fenced by the lease. Returns
/// the assigned sequence number.
pub async fn append_progress_event<'c, E>(
    executor: E,
    job_id: Uuid,
    lock_id: Uuid,
    recorded_at: DateTime<Utc>,
    update: &ProgressUpdate,
    terminal: Option<JobState>,
    error: Option<&JobFailure>,
) -> Result<i64, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let seq: Option<i64> = sqlx::query_scalar(
        r#"
WITH bumped AS (
    UPDATE conveyor_jobs SET event_seq = event_seq + 1
    WHERE id = $1 AND lock_id = $2
    RETURNING event_seq
)
INSERT INTO conveyor_progress_events
    (job_id, seq, recorded_at, percent, stage, fps, eta_seconds, terminal, error)
SELECT $1, event_seq, $3, $4, $5, $6, $7, $8, $9 FROM bumped
RETURNING seq
        "#,
    )
    .bind(job_id)
    .bind(lock_id)
    .bind(recorded_at)
    .bind(update.percent)
    .bind(&update.stage)
    .bind(update.fps)
    .bind(update.eta_seconds)
    .bind(terminal)
    .bind(error.map(sqlx::types::Json))
    .fetch_optional(executor)
    .await?;

    seq.ok_or(QueueError::InvalidLock {
        lock: lock_id,
        job: job_id,
    })
}

/// Keep the ring bounded; called opportunistically after appends.
pub async fn trim_progress_events<'c, E>(
    executor: E,
    job_id: Uuid,
    latest_seq: i64,
) -> Result<u64, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let res = sqlx::query("DELETE FROM conveyor_progress_events WHERE job_id = $1 AND seq <= $2")
        .bind(job_id)
        .bind(latest_seq - PROGRESS_RING_SIZE)
        .execute(executor)
        .await?;

    Ok(res.rows_affected())
}

/// Replay support for `Last-Event-ID`: everything after `after_seq`, in
/// order.
pub async fn events_after<'c, E>(
    executor: E,
    job_id: Uuid,
    after_seq: i64,
) -> Result<Vec<ProgressEventRow>, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let rows = sqlx::query_as::<_, ProgressEventRow>(
        "SELECT * FROM conveyor_progress_events WHERE job_id = $1 AND seq > $2 ORDER BY seq ASC",
    )
    .bind(job_id)
    .bind(after_seq)
    .fetch_all(executor)
    .await?;

    Ok(rows)
}

/// Fenced terminal transition. Terminal states are immutable: the guard on
/// `state = 'processing'` means a second writer (or a stale lease) affects
/// zero rows and gets `InvalidLock` instead of clobbering the outcome.
pub async fn transition_terminal<'c, E>(
    executor: E,
    job_id: Uuid,
    lock_id: Uuid,
    state: JobState,
    error: Option<&JobFailure>,
) -> Result<(), QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    debug_assert!(state.is_terminal());

    let res = sqlx::query(
        r#"
UPDATE conveyor_jobs
SET
    state = $3,
    error = $4,
    progress = CASE WHEN $3 = 'completed'::job_state THEN 100 ELSE progress END,
    finished_at = NOW(),
    updated_at = NOW(),
    lock_id = NULL,
    last_heartbeat = NULL,
    worker_id = NULL
WHERE id = $1 AND lock_id = $2 AND state = 'processing'
        "#,
    )
    .bind(job_id)
    .bind(lock_id)
    .bind(state)
    .bind(error.map(sqlx::types::Json))
    .execute(executor)
    .await?;

    throw_if_no_rows(res, job_id, lock_id)
}

/// Return a leased job to the queue for a later attempt (retryable failure).
/// The last failure is recorded on the row so `GET /jobs/{id}` shows why the
/// job is waiting.
pub async fn reschedule<'c, E>(
    executor: E,
    job_id: Uuid,
    lock_id: Uuid,
    scheduled_at: DateTime<Utc>,
    error: &JobFailure,
) -> Result<(), QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let res = sqlx::query(
        r#"
UPDATE conveyor_jobs
SET
    state = 'queued',
    scheduled_at = $3,
    error = $4,
    lock_id = NULL,
    last_heartbeat = NULL,
    worker_id = NULL,
    updated_at = NOW()
WHERE id = $1 AND lock_id = $2 AND state = 'processing'
        "#,
    )
    .bind(job_id)
    .bind(lock_id)
    .bind(scheduled_at)
    .bind(sqlx::types::Json(error))
    .execute(executor)
    .await?;

    throw_if_no_rows(res, job_id, lock_id)
}

/// Release a duplicate delivery untouched: the job was already terminal when
/// a worker received it again. No state is written.
pub async fn is_terminal<'c, E>(executor: E, job_id: Uuid) -> Result<bool, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let state: Option<JobState> =
        sqlx::query_scalar("SELECT state FROM conveyor_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(executor)
            .await?;

    match state {
        Some(state) => Ok(state.is_terminal()),
        None => Err(QueueError::JobNotFound(job_id)),
    }
}
