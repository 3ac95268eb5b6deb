use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{JobFailure, QueueError};
use crate::ops::manager as manager_ops;
use crate::ops::meta::count_waiting_jobs;
use crate::ops::webhooks as webhook_ops;
use crate::ops::worker as ops;
use crate::types::{
    Job, JobState, NewDelivery, ProgressFrame, ProgressUpdate, WebhookEvent, WebhookPayload,
};

/// Result of a progress flush: the frame to publish once the write is
/// committed, plus the cooperative cancellation flag read in the same
/// round-trip.
#[derive(Debug)]
pub struct ProgressFlush {
    pub frame: ProgressFrame,
    pub cancel_requested: bool,
}

/// The worker's interface to the queue. Dequeueing grants both the queue
/// lease and the per-job lock (one atomic transition); every write after
/// that is fenced on the lease id, so a worker whose lease was reaped can
/// only observe `InvalidLock`, never corrupt another holder's job.
pub struct QueueWorker {
    pool: PgPool,
    name: String,
}

impl QueueWorker {
    pub fn from_pool(pool: PgPool, name: &str) -> Self {
        Self {
            pool,
            name: name.to_owned(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn dequeue(&self, max: usize) -> Result<Vec<Job>, QueueError> {
        let jobs = ops::dequeue_jobs(&self.pool, &self.name, max).await?;
        if !jobs.is_empty() {
            metrics::counter!("jobs_dequeued_total").increment(jobs.len() as u64);
        }
        Ok(jobs)
    }

    /// Lease renewal; call on a timer at a third of the visibility TTL.
    pub async fn heartbeat(&self, job_id: Uuid, lock_id: Uuid) -> Result<(), QueueError> {
        ops::set_heartbeat(&self.pool, job_id, lock_id).await
    }

    /// Absorb duplicate deliveries: a redelivered job that is already
    /// terminal must be released untouched.
    pub async fn is_terminal(&self, job_id: Uuid) -> Result<bool, QueueError> {
        ops::is_terminal(&self.pool, job_id).await
    }

    /// Debounced progress write: row update, ring append and trim in one
    /// transaction. The caller publishes the returned frame to the bus after
    /// this returns (write first, publish after commit).
    pub async fn flush_progress(
        &self,
        job_id: Uuid,
        lock_id: Uuid,
        update: &ProgressUpdate,
    ) -> Result<ProgressFlush, QueueError> {
        let recorded_at = Utc::now();
        let mut tx = self.pool.begin().await?;

        let cancel_requested = ops::flush_progress(&mut *tx, job_id, lock_id, update).await?;
        let seq =
            ops::append_progress_event(&mut *tx, job_id, lock_id, recorded_at, update, None, None)
                .await?;
        ops::trim_progress_events(&mut *tx, job_id, seq).await?;

        tx.commit().await?;

        Ok(ProgressFlush {
            frame: ProgressFrame {
                job_id,
                seq,
                recorded_at,
                percent: update.percent,
                stage: update.stage.clone(),
                fps: update.fps,
                eta_seconds: update.eta_seconds,
                terminal: None,
                error: None,
            },
            cancel_requested,
        })
    }

    pub async fn complete(&self, job: &Job) -> Result<ProgressFrame, QueueError> {
        self.finish(job, JobState::Completed, 100.0, "completed", None)
            .await
    }

    pub async fn fail(&self, job: &Job, failure: &JobFailure) -> Result<ProgressFrame, QueueError> {
        self.finish(job, JobState::Failed, job.progress, "failed", Some(failure))
            .await
    }

    pub async fn cancelled(&self, job: &Job) -> Result<ProgressFrame, QueueError> {
        self.finish(job, JobState::Cancelled, job.progress, "cancelled", None)
            .await
    }

    /// Terminal transition: event append, fenced state write, quota release
    /// and webhook enqueue commit together. The frame is published by the
    /// caller afterwards; it is the last frame on the job's channel.
    async fn finish(
        &self,
        job: &Job,
        state: JobState,
        percent: f64,
        stage: &str,
        failure: Option<&JobFailure>,
    ) -> Result<ProgressFrame, QueueError> {
        let lock_id = job.lock_id.ok_or(QueueError::JobNotFound(job.id))?;
        let recorded_at = Utc::now();
        let update = ProgressUpdate {
            percent,
            stage: stage.to_owned(),
            fps: None,
            eta_seconds: None,
        };

        let mut tx = self.pool.begin().await?;
        let seq = ops::append_progress_event(
            &mut *tx,
            job.id,
            lock_id,
            recorded_at,
            &update,
            Some(state),
            failure,
        )
        .await?;
        ops::transition_terminal(&mut *tx, job.id, lock_id, state, failure).await?;
        manager_ops::decrement_quota(&mut *tx, &job.owner_id).await?;

        if let Some(url) = job.webhook_url.clone() {
            if let Some(event) = WebhookEvent::from_terminal(state) {
                let delivery = NewDelivery {
                    job_id: job.id,
                    owner_id: job.owner_id.clone(),
                    event,
                    url,
                    payload: WebhookPayload {
                        job_id: job.id,
                        event,
                        state,
                        progress: percent,
                        stage: Some(stage.to_owned()),
                        error: failure.cloned(),
                        attempt: job.attempt,
                        occurred_at: recorded_at,
                    },
                    max_attempts: job.max_attempts,
                };
                webhook_ops::enqueue_delivery(&mut *tx, &delivery).await?;
            }
        }

        tx.commit().await?;

        metrics::counter!("jobs_finished_total", "state" => state.as_str()).increment(1);
        Ok(ProgressFrame {
            job_id: job.id,
            seq,
            recorded_at,
            percent,
            stage: stage.to_owned(),
            fps: None,
            eta_seconds: None,
            terminal: Some(state),
            error: failure.cloned(),
        })
    }

    /// Return a leased job to the queue for a later attempt, with the
    /// backoff already applied to `delay`.
    pub async fn reschedule(
        &self,
        job: &Job,
        delay: std::time::Duration,
        failure: &JobFailure,
    ) -> Result<(), QueueError> {
        let lock_id = job.lock_id.ok_or(QueueError::JobNotFound(job.id))?;
        let scheduled_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));
        ops::reschedule(&self.pool, job.id, lock_id, scheduled_at, failure).await?;
        metrics::counter!("jobs_rescheduled_total").increment(1);
        Ok(())
    }

    /// Stage-change progress notifications for jobs that opted in.
    pub async fn enqueue_progress_webhook(
        &self,
        job: &Job,
        update: &ProgressUpdate,
    ) -> Result<(), QueueError> {
        let Some(url) = job.webhook_url.clone() else {
            return Ok(());
        };
        let delivery = NewDelivery {
            job_id: job.id,
            owner_id: job.owner_id.clone(),
            event: WebhookEvent::Progress,
            url,
            payload: WebhookPayload {
                job_id: job.id,
                event: WebhookEvent::Progress,
                state: JobState::Processing,
                progress: update.percent,
                stage: Some(update.stage.clone()),
                error: None,
                attempt: job.attempt,
                occurred_at: Utc::now(),
            },
            max_attempts: job.max_attempts,
        };
        webhook_ops::enqueue_delivery(&self.pool, &delivery).await?;
        Ok(())
    }

    /// Queue depth, for the worker's readiness probe and gauges.
    pub async fn waiting_jobs(&self) -> Result<u64, QueueError> {
        count_waiting_jobs(&self.pool).await
    }
}
