use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::error::QueueError;

/// Jobs are considered stalled when their lease is held but the heartbeat is
/// older than the visibility timeout. Returning them to `queued` is the only
/// path from `processing` back to the queue; workers never do this
/// themselves. The lease TTL used by workers is shorter than this timeout,
/// so a worker that lost its lease has stopped writing long before the job
/// is redelivered.
pub async fn reset_stalled_jobs<'c, E>(executor: E, timeout: Duration) -> Result<u64, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let oldest_valid_heartbeat = Utc::now() - timeout;
    let res = sqlx::query(
        r#"
WITH stalled AS (
    SELECT id FROM conveyor_jobs
    WHERE state = 'processing' AND COALESCE(last_heartbeat, $1) <= $1
    FOR UPDATE SKIP LOCKED
)
UPDATE conveyor_jobs
SET state = 'queued', lock_id = NULL, last_heartbeat = NULL, worker_id = NULL,
    janitor_touch_count = janitor_touch_count + 1, updated_at = NOW()
FROM stalled
WHERE conveyor_jobs.id = stalled.id
        "#,
    )
    .bind(oldest_valid_heartbeat)
    .execute(executor)
    .await?;

    Ok(res.rows_affected())
}

/// Poison pills are stalled jobs the janitor has already returned more than
/// `max_janitor_touched` times. They get dead-lettered instead of being
/// redelivered forever.
pub async fn detect_poison_pills<'c, E>(
    executor: E,
    timeout: Duration,
    max_janitor_touched: i16,
) -> Result<Vec<Uuid>, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let oldest_valid_heartbeat = Utc::now() - timeout;
    let ids: Vec<Uuid> = sqlx::query_scalar(
        r#"
SELECT id FROM conveyor_jobs
WHERE state = 'processing'
  AND COALESCE(last_heartbeat, $1) <= $1
  AND janitor_touch_count >= $2
        "#,
    )
    .bind(oldest_valid_heartbeat)
    .bind(max_janitor_touched)
    .fetch_all(executor)
    .await?;

    Ok(ids)
}

/// Terminal transition used by the janitor for poison pills. Not fenced on a
/// lease (the holder is gone); guarded on the non-terminal state instead so
/// an outcome that landed in the meantime is never overwritten. Returns the
/// owner for quota bookkeeping when the transition happened.
pub async fn dead_letter_job<'c, E>(
    executor: E,
    job_id: Uuid,
    error: &crate::error::JobFailure,
) -> Result<Option<String>, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let owner: Option<String> = sqlx::query_scalar(
        r#"
UPDATE conveyor_jobs
SET state = 'failed', error = $2, finished_at = NOW(), updated_at = NOW(),
    lock_id = NULL, last_heartbeat = NULL, worker_id = NULL
WHERE id = $1 AND state IN ('queued', 'processing')
RETURNING owner_id
        "#,
    )
    .bind(job_id)
    .bind(sqlx::types::Json(error))
    .fetch_optional(executor)
    .await?;

    Ok(owner)
}

/// Retention: drop terminal jobs whose `finished_at` is past the window.
/// Progress events go with them via the FK cascade.
pub async fn sweep_expired_jobs<'c, E>(executor: E, retention: Duration) -> Result<u64, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let cutoff = Utc::now() - retention;
    let res = sqlx::query(
        r#"
DELETE FROM conveyor_jobs
WHERE state IN ('completed', 'failed', 'cancelled') AND finished_at <= $1
        "#,
    )
    .bind(cutoff)
    .execute(executor)
    .await?;

    Ok(res.rows_affected())
}

/// Webhook deliveries stuck in `running` (dispatcher died mid-send) go back
/// to `available` for redelivery; at-least-once is fine for webhooks.
pub async fn reset_stalled_deliveries<'c, E>(
    executor: E,
    timeout: Duration,
) -> Result<u64, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let cutoff = Utc::now() - timeout;
    let res = sqlx::query(
        r#"
UPDATE conveyor_webhook_deliveries
SET state = 'available', scheduled_at = NOW()
WHERE state = 'running' AND attempted_at <= $1
        "#,
    )
    .bind(cutoff)
    .execute(executor)
    .await?;

    Ok(res.rows_affected())
}

/// Delivered and dead records past the retention window are dropped.
pub async fn purge_finished_deliveries<'c, E>(
    executor: E,
    retention: Duration,
) -> Result<u64, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let cutoff = Utc::now() - retention;
    let res = sqlx::query(
        r#"
DELETE FROM conveyor_webhook_deliveries
WHERE state IN ('delivered', 'dead') AND finished_at <= $1
        "#,
    )
    .bind(cutoff)
    .execute(executor)
    .await?;

    Ok(res.rows_affected())
}
