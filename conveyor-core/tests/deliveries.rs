use chrono::{Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use conveyor_core::deliveries;
use conveyor_core::{
    DeliveryState, Janitor, JanitorSettings, JobState, NewDelivery, WebhookEvent, WebhookPayload,
};

fn new_delivery(job_id: Uuid, max_attempts: i32) -> NewDelivery {
    NewDelivery {
        job_id,
        owner_id: "owner-1".to_owned(),
        event: WebhookEvent::Completed,
        url: "https://hooks.example.com/jobs".to_owned(),
        payload: WebhookPayload {
            job_id,
            event: WebhookEvent::Completed,
            state: JobState::Completed,
            progress: 100.0,
            stage: Some("completed".to_owned()),
            error: None,
            attempt: 1,
            occurred_at: Utc::now(),
        },
        max_attempts,
    }
}

#[sqlx::test(migrations = "./migrations")]
async fn deliveries_roundtrip_through_the_queue(db: PgPool) {
    let job_id = Uuid::now_v7();
    let id = deliveries::enqueue_delivery(&db, &new_delivery(job_id, 5))
        .await
        .unwrap();

    let batch = deliveries::dequeue_deliveries(&db, "dispatcher-1", 10)
        .await
        .unwrap();
    assert_eq!(batch.len(), 1);
    let delivery = &batch[0];
    assert_eq!(delivery.id, id);
    assert_eq!(delivery.state, DeliveryState::Running);
    assert_eq!(delivery.attempt, 1);
    assert!(delivery
        .attempted_by
        .contains(&"dispatcher-1".to_owned()));
    assert_eq!(delivery.payload.0.event, WebhookEvent::Completed);

    // Leased means invisible to other dispatchers.
    assert!(deliveries::dequeue_deliveries(&db, "dispatcher-2", 10)
        .await
        .unwrap()
        .is_empty());

    deliveries::complete_delivery(&db, id, 200).await.unwrap();
    let state: DeliveryState =
        sqlx::query_scalar("SELECT state FROM conveyor_webhook_deliveries WHERE id = $1")
            .bind(id)
            .fetch_one(&db)
            .await
            .unwrap();
    assert_eq!(state, DeliveryState::Delivered);
}

#[sqlx::test(migrations = "./migrations")]
async fn retried_deliveries_come_back_when_due(db: PgPool) {
    let job_id = Uuid::now_v7();
    let id = deliveries::enqueue_delivery(&db, &new_delivery(job_id, 5))
        .await
        .unwrap();
    let _unused = deliveries::dequeue_deliveries(&db, "dispatcher-1", 10)
        .await
        .unwrap();

    deliveries::retry_delivery(&db, id, Utc::now() + Duration::minutes(5), Some(503), "boom")
        .await
        .unwrap();

    // Not due yet.
    assert!(deliveries::dequeue_deliveries(&db, "dispatcher-1", 10)
        .await
        .unwrap()
        .is_empty());

    sqlx::query(
        "UPDATE conveyor_webhook_deliveries SET scheduled_at = NOW() - INTERVAL '1 second' WHERE id = $1",
    )
    .bind(id)
    .execute(&db)
    .await
    .unwrap();

    let retried = deliveries::dequeue_deliveries(&db, "dispatcher-1", 10)
        .await
        .unwrap()
        .pop()
        .unwrap();
    assert_eq!(retried.attempt, 2);
    assert_eq!(retried.last_status, Some(503));
    assert_eq!(retried.last_error.as_deref(), Some("boom"));
}

#[sqlx::test(migrations = "./migrations")]
async fn dead_letters_are_never_redelivered(db: PgPool) {
    let job_id = Uuid::now_v7();
    let id = deliveries::enqueue_delivery(&db, &new_delivery(job_id, 1))
        .await
        .unwrap();
    let _unused = deliveries::dequeue_deliveries(&db, "dispatcher-1", 10)
        .await
        .unwrap();

    deliveries::dead_letter_delivery(&db, id, Some(500), "retries exhausted")
        .await
        .unwrap();

    assert!(deliveries::dequeue_deliveries(&db, "dispatcher-1", 10)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(deliveries::count_pending_deliveries(&db).await.unwrap(), 0);
}

#[sqlx::test(migrations = "./migrations")]
async fn stalled_running_deliveries_are_reset_by_the_janitor(db: PgPool) {
    let job_id = Uuid::now_v7();
    let id = deliveries::enqueue_delivery(&db, &new_delivery(job_id, 5))
        .await
        .unwrap();
    let _unused = deliveries::dequeue_deliveries(&db, "dispatcher-1", 10)
        .await
        .unwrap();

    sqlx::query(
        "UPDATE conveyor_webhook_deliveries SET attempted_at = NOW() - INTERVAL '10 minutes' WHERE id = $1",
    )
    .bind(id)
    .execute(&db)
    .await
    .unwrap();

    let janitor = Janitor::from_pool(
        db.clone(),
        JanitorSettings {
            delivery_stalled_after: Duration::minutes(5),
            ..Default::default()
        },
    );
    assert_eq!(janitor.reset_stalled_deliveries().await.unwrap(), 1);

    let redelivered = deliveries::dequeue_deliveries(&db, "dispatcher-2", 10)
        .await
        .unwrap()
        .pop()
        .unwrap();
    assert_eq!(redelivered.id, id);
    assert_eq!(redelivered.attempt, 2);
}
