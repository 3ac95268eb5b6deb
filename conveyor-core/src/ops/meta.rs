use sqlx::postgres::PgQueryResult;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::QueueError;

pub async fn run_migrations(pool: &PgPool) {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .expect("failed to run migrations");
}

pub async fn count_waiting_jobs<'c, E>(executor: E) -> Result<u64, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM conveyor_jobs WHERE state = 'queued' AND scheduled_at <= NOW()",
    )
    .fetch_one(executor)
    .await?;

    Ok(count as u64)
}

/// Every fenced write goes through this: zero rows affected means the lease
/// was stolen or expired, and the caller must stop writing.
pub fn throw_if_no_rows(res: PgQueryResult, job: Uuid, lock: Uuid) -> Result<(), QueueError> {
    if res.rows_affected() == 0 {
        Err(QueueError::InvalidLock { lock, job })
    } else {
        Ok(())
    }
}
