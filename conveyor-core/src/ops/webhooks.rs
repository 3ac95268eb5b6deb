use chrono::{DateTime, Utc};

use crate::error::QueueError;
use crate::types::{Delivery, NewDelivery};

pub async fn enqueue_delivery<'c, E>(executor: E, delivery: &NewDelivery) -> Result<i64, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let id: i64 = sqlx::query_scalar(
        r#"
INSERT INTO conveyor_webhook_deliveries
    (job_id, owner_id, event, url, payload, state, max_attempts, scheduled_at, created_at)
VALUES
    ($1, $2, $3, $4, $5, 'available', $6, NOW(), NOW())
RETURNING id
        "#,
    )
    .bind(delivery.job_id)
    .bind(&delivery.owner_id)
    .bind(delivery.event.as_str())
    .bind(&delivery.url)
    .bind(sqlx::types::Json(&delivery.payload))
    .bind(delivery.max_attempts)
    .fetch_one(executor)
    .await?;

    Ok(id)
}

/// Lease the next batch of due deliveries; same SKIP LOCKED discipline as
/// the job queue.
pub async fn dequeue_deliveries<'c, E>(
    executor: E,
    worker_id: &str,
    max: usize,
) -> Result<Vec<Delivery>, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let deliveries = sqlx::query_as::<_, Delivery>(
        r#"
WITH available AS (
    SELECT id
    FROM conveyor_webhook_deliveries
    WHERE state = 'available' AND scheduled_at <= NOW()
    ORDER BY id
    LIMIT $1
    FOR UPDATE SKIP LOCKED
)
UPDATE conveyor_webhook_deliveries
SET state = 'running',
    attempt = conveyor_webhook_deliveries.attempt + 1,
    attempted_at = NOW(),
    attempted_by = array_append(conveyor_webhook_deliveries.attempted_by, $2::text)
FROM available
WHERE conveyor_webhook_deliveries.id = available.id
RETURNING conveyor_webhook_deliveries.*
        "#,
    )
    .bind(max as i64)
    .bind(worker_id)
    .fetch_all(executor)
    .await?;

    Ok(deliveries)
}

pub async fn complete_delivery<'c, E>(
    executor: E,
    id: i64,
    status: i16,
) -> Result<(), QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query(
        r#"
UPDATE conveyor_webhook_deliveries
SET state = 'delivered', last_status = $2, finished_at = NOW()
WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(status)
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn retry_delivery<'c, E>(
    executor: E,
    id: i64,
    scheduled_at: DateTime<Utc>,
    status: Option<i16>,
    error: &str,
) -> Result<(), QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query(
        r#"
UPDATE conveyor_webhook_deliveries
SET state = 'available', scheduled_at = $2, last_status = $3, last_error = $4
WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(scheduled_at)
    .bind(status)
    .bind(error)
    .execute(executor)
    .await?;

    Ok(())
}

/// After retry exhaustion (or a forbidden target) the record is parked as
/// dead and never retried again.
pub async fn dead_letter_delivery<'c, E>(
    executor: E,
    id: i64,
    status: Option<i16>,
    error: &str,
) -> Result<(), QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query(
        r#"
UPDATE conveyor_webhook_deliveries
SET state = 'dead', last_status = $2, last_error = $3, finished_at = NOW()
WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(status)
    .bind(error)
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn count_pending_deliveries<'c, E>(executor: E) -> Result<u64, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM conveyor_webhook_deliveries WHERE state = 'available'",
    )
    .fetch_one(executor)
    .await?;

    Ok(count as u64)
}
