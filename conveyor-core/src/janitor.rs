use chrono::Duration;
use sqlx::PgPool;

use crate::error::{ErrorCode, JobFailure, QueueError};
use crate::ops::janitor as ops;
use crate::ops::manager as manager_ops;
use crate::ops::meta::{count_waiting_jobs, run_migrations};
use crate::ops::webhooks as webhook_ops;
use crate::types::{JobState, NewDelivery, WebhookEvent, WebhookPayload};

/// Cleanup knobs. `stalled_after` is the queue's visibility timeout: it must
/// exceed the worst-case job duration plus margin, and the workers' lease
/// TTL must be comfortably below it.
#[derive(Debug, Clone)]
pub struct JanitorSettings {
    pub stalled_after: Duration,
    pub retention: Duration,
    pub max_janitor_touches: i16,
    pub delivery_stalled_after: Duration,
    pub delivery_retention: Duration,
}

impl Default for JanitorSettings {
    fn default() -> Self {
        Self {
            stalled_after: Duration::hours(7),
            retention: Duration::days(7),
            max_janitor_touches: 3,
            delivery_stalled_after: Duration::minutes(5),
            delivery_retention: Duration::days(7),
        }
    }
}

// Thin layer on top of the raw janitor operations - mostly just avoids users
// having to take a dep on sqlx.
pub struct Janitor {
    pool: PgPool,
    settings: JanitorSettings,
}

impl Janitor {
    pub fn from_pool(pool: PgPool, settings: JanitorSettings) -> Self {
        Self { pool, settings }
    }

    pub async fn run_migrations(&self) {
        run_migrations(&self.pool).await;
    }

    /// Visibility-timeout expiry: stalled leases go back to `queued` for
    /// redelivery. This is the only trigger for redelivery in the system.
    pub async fn reset_stalled(&self) -> Result<u64, QueueError> {
        let reset = ops::reset_stalled_jobs(&self.pool, self.settings.stalled_after).await?;
        if reset > 0 {
            metrics::counter!("janitor_jobs_reset_total").increment(reset);
        }
        Ok(reset)
    }

    /// Jobs the janitor keeps rescuing get dead-lettered as failed, with the
    /// quota released and subscribers notified, so one crashing input cannot
    /// loop through the fleet forever.
    pub async fn dead_letter_poison_pills(&self) -> Result<u64, QueueError> {
        let poison = ops::detect_poison_pills(
            &self.pool,
            self.settings.stalled_after,
            self.settings.max_janitor_touches,
        )
        .await?;

        let failure = JobFailure::from_code(ErrorCode::Internal);
        let mut dead = 0;
        for job_id in poison {
            let job = manager_ops::load_job(&self.pool, job_id).await?;

            let mut tx = self.pool.begin().await?;
            let Some(owner) = ops::dead_letter_job(&mut *tx, job_id, &failure).await? else {
                // Someone else finished it in the meantime.
                continue;
            };
            manager_ops::decrement_quota(&mut *tx, &owner).await?;
            manager_ops::append_unfenced_terminal_event(
                &mut *tx,
                job_id,
                JobState::Failed,
                0.0,
                "failed",
                Some(&failure),
            )
            .await?;

            if let Some(job) = job {
                if let Some(url) = job.webhook_url.clone() {
                    let delivery = NewDelivery {
                        job_id,
                        owner_id: owner.clone(),
                        event: WebhookEvent::Failed,
                        url,
                        payload: WebhookPayload {
                            job_id,
                            event: WebhookEvent::Failed,
                            state: JobState::Failed,
                            progress: job.progress,
                            stage: job.stage.clone(),
                            error: Some(failure.clone()),
                            attempt: job.attempt,
                            occurred_at: chrono::Utc::now(),
                        },
                        max_attempts: job.max_attempts,
                    };
                    webhook_ops::enqueue_delivery(&mut *tx, &delivery).await?;
                }
            }
            tx.commit().await?;
            dead += 1;
        }

        if dead > 0 {
            metrics::counter!("janitor_poison_pills_total").increment(dead);
        }
        Ok(dead)
    }

    /// Retention: terminal jobs (and their event rings, via cascade) are
    /// reclaimed once `finished_at` passes the window.
    pub async fn sweep_expired(&self) -> Result<u64, QueueError> {
        let swept = ops::sweep_expired_jobs(&self.pool, self.settings.retention).await?;
        if swept > 0 {
            metrics::counter!("janitor_jobs_swept_total").increment(swept);
        }
        Ok(swept)
    }

    pub async fn reset_stalled_deliveries(&self) -> Result<u64, QueueError> {
        ops::reset_stalled_deliveries(&self.pool, self.settings.delivery_stalled_after).await
    }

    pub async fn purge_finished_deliveries(&self) -> Result<u64, QueueError> {
        ops::purge_finished_deliveries(&self.pool, self.settings.delivery_retention).await
    }

    pub async fn waiting_jobs(&self) -> Result<u64, QueueError> {
        count_waiting_jobs(&self.pool).await
    }
}
