use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::admission::{self, AdmissionLimits};
use crate::error::{QueueError, SubmitError};
use crate::ops::manager as ops;
use crate::ops::webhooks as webhook_ops;
use crate::ops::worker as worker_ops;
use crate::storage::StorageBackend;
use crate::types::{
    Job, JobState, JobStats, NewDelivery, ProgressFrame, Submission, WebhookEvent, WebhookPayload,
};

pub use crate::ops::manager::ListOrder;

/// The admission-facing handle to the job store: submission, lookup,
/// cancellation, stats. Workers use `QueueWorker`, cleanup uses `Janitor`.
/// Handles consume a ready pool; services build theirs through
/// `common_database` with their own sizing.
pub struct JobManager {
    pool: PgPool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A new job was created.
    Created(Uuid),
    /// An idempotency token replay; the original job id is returned.
    Existing(Uuid),
}

impl SubmitOutcome {
    pub fn job_id(&self) -> Uuid {
        match self {
            SubmitOutcome::Created(id) | SubmitOutcome::Existing(id) => *id,
        }
    }
}

/// What `cancel` found. Cancellation is idempotent: repeating it on a
/// cancelled job reports the unchanged record.
#[derive(Debug)]
pub enum CancelOutcome {
    /// The job was still queued and is now cancelled. The frame should be
    /// published to the bus after this call returns.
    Cancelled(Job, ProgressFrame),
    /// The job is processing; the flag is set and the worker will stop it.
    CancelRequested(Job),
    /// Already cancelled before this call: nothing changed.
    AlreadyCancelled(Job),
    /// Completed or failed: cancellation conflicts with the outcome.
    TerminalConflict(Job),
    NotFound,
}

impl JobManager {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Full admission: validate, then create the job id, the job row and the
    /// quota increment inside one transaction. The transaction commits
    /// before the job becomes visible to any dequeue.
    pub async fn submit(
        &self,
        owner_id: &str,
        quota: i32,
        submission: &Submission,
        limits: &AdmissionLimits,
        storage: &dyn StorageBackend,
    ) -> Result<SubmitOutcome, SubmitError> {
        let init = admission::validate(owner_id, submission, limits, storage).await?;

        // Token replays answer with the original job, never a duplicate.
        if let Some(key) = init.idempotency_key.as_deref() {
            if let Some(existing) =
                ops::find_by_idempotency_key(&self.pool, owner_id, key).await?
            {
                return Ok(SubmitOutcome::Existing(existing));
            }
        }

        let mut tx = self.pool.begin().await.map_err(QueueError::from)?;

        if !ops::try_increment_quota(&mut *tx, owner_id, quota).await? {
            // Dropping the transaction rolls the increment attempt back.
            return Err(SubmitError::QuotaExceeded);
        }

        let id = match ops::insert_job(&mut *tx, &init).await {
            Ok(id) => id,
            Err(QueueError::Sqlx(err)) if common_database::is_unique_violation(&err) => {
                // A concurrent replay with the same token won the race.
                drop(tx);
                if let Some(key) = init.idempotency_key.as_deref() {
                    if let Some(existing) =
                        ops::find_by_idempotency_key(&self.pool, owner_id, key).await?
                    {
                        return Ok(SubmitOutcome::Existing(existing));
                    }
                }
                return Err(SubmitError::Queue(QueueError::Sqlx(err)));
            }
            Err(err) => return Err(err.into()),
        };

        tx.commit().await.map_err(QueueError::from)?;

        metrics::counter!("jobs_submitted_total").increment(1);
        Ok(SubmitOutcome::Created(id))
    }

    pub async fn load(&self, id: Uuid) -> Result<Option<Job>, QueueError> {
        ops::load_job(&self.pool, id).await
    }

    pub async fn list(
        &self,
        owner_id: &str,
        state: Option<JobState>,
        order: ListOrder,
        page: i64,
        per_page: i64,
    ) -> Result<(Vec<Job>, i64), QueueError> {
        let offset = (page.max(1) - 1) * per_page;
        let jobs = ops::list_jobs(&self.pool, owner_id, state, order, per_page, offset).await?;
        let total = ops::count_jobs(&self.pool, owner_id, state).await?;
        Ok((jobs, total))
    }

    pub async fn stats(&self, owner_id: &str) -> Result<JobStats, QueueError> {
        ops::job_stats(&self.pool, owner_id).await
    }

    pub async fn in_flight(&self, owner_id: &str) -> Result<i32, QueueError> {
        ops::in_flight_count(&self.pool, owner_id).await
    }

    /// Cancel a job. Queued jobs are cancelled synchronously here (with the
    /// quota release, terminal event and webhook enqueue in one
    /// transaction); processing jobs get the cooperative flag.
    pub async fn cancel(&self, id: Uuid) -> Result<CancelOutcome, QueueError> {
        let Some(job) = ops::load_job(&self.pool, id).await? else {
            return Ok(CancelOutcome::NotFound);
        };

        match job.state {
            JobState::Cancelled => return Ok(CancelOutcome::AlreadyCancelled(job)),
            JobState::Completed | JobState::Failed => {
                return Ok(CancelOutcome::TerminalConflict(job));
            }
            _ => {}
        }

        let mut tx = self.pool.begin().await?;
        if let Some(cancelled) = ops::cancel_if_pending(&mut *tx, id).await? {
            ops::decrement_quota(&mut *tx, &cancelled.owner_id).await?;
            let seq = ops::append_unfenced_terminal_event(
                &mut *tx,
                id,
                JobState::Cancelled,
                cancelled.progress,
                "cancelled",
                None,
            )
            .await?;

            if let Some(url) = cancelled.webhook_url.clone() {
                let delivery = NewDelivery {
                    job_id: id,
                    owner_id: cancelled.owner_id.clone(),
                    event: WebhookEvent::Cancelled,
                    url,
                    payload: WebhookPayload {
                        job_id: id,
                        event: WebhookEvent::Cancelled,
                        state: JobState::Cancelled,
                        progress: cancelled.progress,
                        stage: cancelled.stage.clone(),
                        error: None,
                        attempt: cancelled.attempt,
                        occurred_at: Utc::now(),
                    },
                    max_attempts: cancelled.max_attempts,
                };
                webhook_ops::enqueue_delivery(&mut *tx, &delivery).await?;
            }
            tx.commit().await?;

            metrics::counter!("jobs_cancelled_total", "phase" => "queued").increment(1);
            let frame = ProgressFrame {
                job_id: id,
                seq,
                recorded_at: Utc::now(),
                percent: cancelled.progress,
                stage: "cancelled".to_owned(),
                fps: None,
                eta_seconds: None,
                terminal: Some(JobState::Cancelled),
                error: None,
            };
            return Ok(CancelOutcome::Cancelled(cancelled, frame));
        }
        drop(tx);

        // Not pending anymore: either processing (flag it) or it reached a
        // terminal state between the load and the update.
        if ops::request_cancel(&self.pool, id).await? {
            metrics::counter!("jobs_cancelled_total", "phase" => "processing").increment(1);
            let job = ops::load_job(&self.pool, id)
                .await?
                .ok_or(QueueError::JobNotFound(id))?;
            return Ok(CancelOutcome::CancelRequested(job));
        }

        let job = ops::load_job(&self.pool, id)
            .await?
            .ok_or(QueueError::JobNotFound(id))?;
        match job.state {
            JobState::Cancelled => Ok(CancelOutcome::AlreadyCancelled(job)),
            _ => Ok(CancelOutcome::TerminalConflict(job)),
        }
    }

    /// SSE replay: all frames after `after_seq`, oldest first.
    pub async fn events_after(
        &self,
        job_id: Uuid,
        after_seq: i64,
    ) -> Result<Vec<ProgressFrame>, QueueError> {
        let rows = worker_ops::events_after(&self.pool, job_id, after_seq).await?;
        Ok(rows.into_iter().map(ProgressFrame::from).collect())
    }

    /// Cheap store liveness probe.
    pub async fn ping(&self) -> Result<(), QueueError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Advisory queue depth (runnable jobs right now).
    pub async fn waiting_jobs(&self) -> Result<u64, QueueError> {
        crate::ops::meta::count_waiting_jobs(&self.pool).await
    }
}
