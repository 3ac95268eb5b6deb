use sqlx::PgPool;
use uuid::Uuid;

use conveyor_core::{
    CancelOutcome, ErrorCode, JobFailure, JobManager, JobState, Priority, ProgressUpdate,
    QueueError, QueueWorker, SubmitError, SubmitOutcome,
};

mod common;
use common::{
    in_flight, limits, make_due, storage_with_input, submit, submit_one, transcode_submission,
};

#[sqlx::test(migrations = "./migrations")]
async fn submit_creates_a_queued_job_and_counts_quota(db: PgPool) {
    let manager = JobManager::from_pool(db.clone());
    let id = submit_one(&db, "owner-1", 10).await;

    let job = manager.load(id).await.unwrap().expect("job exists");
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.owner_id, "owner-1");
    assert_eq!(job.progress, 0.0);
    assert_eq!(job.attempt, 0);
    assert_eq!(job.priority, Priority::Normal.weight());
    assert_eq!(job.input_url, common::INPUT_LOCATOR);

    assert_eq!(in_flight(&db, "owner-1").await, 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn quota_is_checked_atomically_at_admission(db: PgPool) {
    let manager = JobManager::from_pool(db.clone());
    let _first = submit_one(&db, "owner-1", 1).await;

    let err = manager
        .submit(
            "owner-1",
            1,
            &transcode_submission(),
            &limits(),
            &storage_with_input(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::QuotaExceeded));

    // The rejected submission left nothing behind.
    assert_eq!(in_flight(&db, "owner-1").await, 1);
    let (_, total) = manager
        .list("owner-1", None, conveyor_core::ListOrder::CreatedDesc, 1, 10)
        .await
        .unwrap();
    assert_eq!(total, 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn idempotency_token_replay_returns_the_original_job(db: PgPool) {
    let manager = JobManager::from_pool(db.clone());
    let mut submission = transcode_submission();
    submission.idempotency_key = Some("retry-batch-7".to_owned());

    let first = manager
        .submit("owner-1", 10, &submission, &limits(), &storage_with_input())
        .await
        .unwrap();
    let second = manager
        .submit("owner-1", 10, &submission, &limits(), &storage_with_input())
        .await
        .unwrap();

    assert!(matches!(first, SubmitOutcome::Created(_)));
    match second {
        SubmitOutcome::Existing(id) => assert_eq!(id, first.job_id()),
        other => panic!("expected a replay, got {other:?}"),
    }
    assert_eq!(in_flight(&db, "owner-1").await, 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn dequeue_grants_the_lease_and_orders_by_priority(db: PgPool) {
    let normal = submit_one(&db, "owner-1", 10).await;
    let mut urgent_submission = transcode_submission();
    urgent_submission.priority = Priority::Urgent;
    let urgent = submit(&db, "owner-1", 10, urgent_submission).await;

    let worker = QueueWorker::from_pool(db.clone(), "worker-a");
    let jobs = worker.dequeue(2).await.unwrap();

    // Urgent wins even though it was created later.
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].id, urgent);
    assert_eq!(jobs[1].id, normal);

    for job in &jobs {
        assert_eq!(job.state, JobState::Processing);
        assert_eq!(job.attempt, 1);
        assert_eq!(job.lease_epoch, 1);
        assert!(job.lock_id.is_some());
        assert!(job.started_at.is_some());
        assert_eq!(job.worker_id.as_deref(), Some("worker-a"));
    }

    // Nothing left to lease.
    assert!(worker.dequeue(1).await.unwrap().is_empty());
}

#[sqlx::test(migrations = "./migrations")]
async fn writes_are_fenced_on_the_lease(db: PgPool) {
    let id = submit_one(&db, "owner-1", 10).await;
    let worker = QueueWorker::from_pool(db.clone(), "worker-a");
    let job = worker.dequeue(1).await.unwrap().pop().unwrap();
    let lock = job.lock_id.unwrap();

    worker.heartbeat(id, lock).await.unwrap();

    let stale = Uuid::now_v7();
    let err = worker.heartbeat(id, stale).await.unwrap_err();
    assert!(matches!(err, QueueError::InvalidLock { .. }));

    let update = ProgressUpdate {
        percent: 10.0,
        stage: "encode".to_owned(),
        fps: None,
        eta_seconds: None,
    };
    let err = worker.flush_progress(id, stale, &update).await.unwrap_err();
    assert!(matches!(err, QueueError::InvalidLock { .. }));
}

#[sqlx::test(migrations = "./migrations")]
async fn progress_flush_is_monotonic_and_feeds_the_ring(db: PgPool) {
    let id = submit_one(&db, "owner-1", 10).await;
    let manager = JobManager::from_pool(db.clone());
    let worker = QueueWorker::from_pool(db.clone(), "worker-a");
    let job = worker.dequeue(1).await.unwrap().pop().unwrap();
    let lock = job.lock_id.unwrap();

    let mut update = ProgressUpdate {
        percent: 30.0,
        stage: "encode".to_owned(),
        fps: Some(48.0),
        eta_seconds: Some(90),
    };
    let first = worker.flush_progress(id, lock, &update).await.unwrap();
    assert!(!first.cancel_requested);
    assert_eq!(first.frame.seq, 1);

    // A late out-of-order sample cannot move the row backwards.
    update.percent = 20.0;
    worker.flush_progress(id, lock, &update).await.unwrap();
    let job = manager.load(id).await.unwrap().unwrap();
    assert_eq!(job.progress, 30.0);
    assert_eq!(job.stage.as_deref(), Some("encode"));

    // Replay from the ring picks up everything after the watermark.
    let frames = manager.events_after(id, 0).await.unwrap();
    assert_eq!(frames.len(), 2);
    assert!(frames.windows(2).all(|w| w[0].seq < w[1].seq));

    let tail = manager.events_after(id, 1).await.unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].seq, 2);
}

#[sqlx::test(migrations = "./migrations")]
async fn completion_is_terminal_and_releases_the_quota(db: PgPool) {
    let manager = JobManager::from_pool(db.clone());
    let mut submission = transcode_submission();
    submission.webhook_url = Some("https://hooks.example.com/jobs".to_owned());
    let id = submit(&db, "owner-1", 10, submission).await;

    let worker = QueueWorker::from_pool(db.clone(), "worker-a");
    let job = worker.dequeue(1).await.unwrap().pop().unwrap();

    let frame = worker.complete(&job).await.unwrap();
    assert_eq!(frame.terminal, Some(JobState::Completed));
    assert_eq!(frame.percent, 100.0);

    let finished = manager.load(id).await.unwrap().unwrap();
    assert_eq!(finished.state, JobState::Completed);
    assert_eq!(finished.progress, 100.0);
    assert!(finished.finished_at.is_some());
    assert!(finished.lock_id.is_none());
    assert_eq!(in_flight(&db, "owner-1").await, 0);

    // Terminal states are immutable: the old lease writes nothing.
    let failure = JobFailure::from_code(ErrorCode::Internal);
    let err = worker.fail(&job, &failure).await.unwrap_err();
    assert!(matches!(err, QueueError::InvalidLock { .. }));
    let still = manager.load(id).await.unwrap().unwrap();
    assert_eq!(still.state, JobState::Completed);

    // The terminal webhook was enqueued in the same transaction.
    let deliveries: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM conveyor_webhook_deliveries WHERE job_id = $1")
            .bind(id)
            .fetch_one(&db)
            .await
            .unwrap();
    assert_eq!(deliveries, 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn retryable_failures_reschedule_and_preserve_attempt_counting(db: PgPool) {
    let id = submit_one(&db, "owner-1", 10).await;
    let manager = JobManager::from_pool(db.clone());
    let worker = QueueWorker::from_pool(db.clone(), "worker-a");
    let job = worker.dequeue(1).await.unwrap().pop().unwrap();
    assert_eq!(job.attempt, 1);

    let failure = JobFailure::from_code(ErrorCode::StorageUnavailable);
    worker
        .reschedule(&job, std::time::Duration::from_secs(60), &failure)
        .await
        .unwrap();

    let waiting = manager.load(id).await.unwrap().unwrap();
    assert_eq!(waiting.state, JobState::Queued);
    assert!(waiting.lock_id.is_none());
    assert!(waiting.scheduled_at > waiting.created_at);
    assert_eq!(
        waiting.error.as_ref().map(|e| e.0.code),
        Some(ErrorCode::StorageUnavailable)
    );

    // Not due yet.
    assert!(worker.dequeue(1).await.unwrap().is_empty());

    make_due(&db, id).await;
    let retried = worker.dequeue(1).await.unwrap().pop().unwrap();
    assert_eq!(retried.id, id);
    assert_eq!(retried.attempt, 2);
    assert_eq!(retried.lease_epoch, 2);
}

#[sqlx::test(migrations = "./migrations")]
async fn cancel_of_a_queued_job_is_synchronous_and_idempotent(db: PgPool) {
    let manager = JobManager::from_pool(db.clone());
    let id = submit_one(&db, "owner-1", 10).await;

    match manager.cancel(id).await.unwrap() {
        CancelOutcome::Cancelled(job, frame) => {
            assert_eq!(job.state, JobState::Cancelled);
            assert_eq!(frame.terminal, Some(JobState::Cancelled));
        }
        other => panic!("expected a synchronous cancel, got {other:?}"),
    }
    assert_eq!(in_flight(&db, "owner-1").await, 0);

    // Applying DELETE twice leaves the store unchanged.
    let before = manager.load(id).await.unwrap().unwrap();
    match manager.cancel(id).await.unwrap() {
        CancelOutcome::AlreadyCancelled(job) => {
            assert_eq!(job.state, JobState::Cancelled);
            assert_eq!(job.finished_at, before.finished_at);
        }
        other => panic!("expected idempotent cancel, got {other:?}"),
    }
    assert_eq!(in_flight(&db, "owner-1").await, 0);
}

#[sqlx::test(migrations = "./migrations")]
async fn cancel_of_a_processing_job_sets_the_cooperative_flag(db: PgPool) {
    let manager = JobManager::from_pool(db.clone());
    let id = submit_one(&db, "owner-1", 10).await;
    let worker = QueueWorker::from_pool(db.clone(), "worker-a");
    let job = worker.dequeue(1).await.unwrap().pop().unwrap();
    let lock = job.lock_id.unwrap();

    match manager.cancel(id).await.unwrap() {
        CancelOutcome::CancelRequested(job) => assert!(job.cancel_requested),
        other => panic!("expected a flagged cancel, got {other:?}"),
    }

    // The worker observes the flag at its next flush (debounce point) and
    // records the terminal state itself.
    let update = ProgressUpdate {
        percent: 35.0,
        stage: "encode".to_owned(),
        fps: None,
        eta_seconds: None,
    };
    let flush = worker.flush_progress(id, lock, &update).await.unwrap();
    assert!(flush.cancel_requested);

    let frame = worker.cancelled(&job).await.unwrap();
    assert_eq!(frame.terminal, Some(JobState::Cancelled));
    assert_eq!(in_flight(&db, "owner-1").await, 0);
}

#[sqlx::test(migrations = "./migrations")]
async fn cancel_of_a_completed_job_conflicts(db: PgPool) {
    let manager = JobManager::from_pool(db.clone());
    let id = submit_one(&db, "owner-1", 10).await;
    let worker = QueueWorker::from_pool(db.clone(), "worker-a");
    let job = worker.dequeue(1).await.unwrap().pop().unwrap();
    worker.complete(&job).await.unwrap();

    match manager.cancel(id).await.unwrap() {
        CancelOutcome::TerminalConflict(job) => assert_eq!(job.state, JobState::Completed),
        other => panic!("expected a conflict, got {other:?}"),
    }
}

#[sqlx::test(migrations = "./migrations")]
async fn stats_come_from_one_grouped_aggregation(db: PgPool) {
    let manager = JobManager::from_pool(db.clone());
    let worker = QueueWorker::from_pool(db.clone(), "worker-a");

    let _queued = submit_one(&db, "owner-1", 10).await;
    let _running = submit_one(&db, "owner-1", 10).await;
    let done = submit_one(&db, "owner-1", 10).await;
    let _foreign = submit_one(&db, "owner-2", 10).await;

    // owner-1 jobs first in FIFO order: leave one queued, run two.
    let jobs = worker.dequeue(2).await.unwrap();
    let finished = jobs.iter().find(|j| j.id == done);
    if let Some(job) = finished {
        worker.complete(job).await.unwrap();
    } else {
        // `done` was the job left queued; complete any dequeued one instead.
        worker.complete(&jobs[0]).await.unwrap();
    }

    let stats = manager.stats("owner-1").await.unwrap();
    assert_eq!(stats.queued, 1);
    assert_eq!(stats.processing, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.cancelled, 0);
}
