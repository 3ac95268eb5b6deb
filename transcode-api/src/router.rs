use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use common_health::HealthRegistry;
use common_redis::BusClient;
use conveyor_core::storage::StorageBackend;
use conveyor_core::{AdmissionLimits, JobManager};

use crate::auth::{extract_key_material, KeyStore};
use crate::errors::ApiError;
use crate::handlers;
use crate::limits::RateGate;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<JobManager>,
    pub storage: Arc<dyn StorageBackend>,
    pub bus: Arc<dyn BusClient + Send + Sync>,
    pub keys: Arc<dyn KeyStore>,
    pub gate: Arc<RateGate>,
    pub limits: Arc<AdmissionLimits>,
    pub liveness: HealthRegistry,
}

async fn index() -> &'static str {
    "conveyor api"
}

/// Resolve the API key before any authenticated handler runs; the record
/// rides along in request extensions.
async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(material) = extract_key_material(request.headers()) else {
        return ApiError::unauthorized().into_response();
    };

    match state.keys.resolve(&material).await {
        Ok(Some(record)) => {
            request.extensions_mut().insert(record);
            next.run(request).await
        }
        Ok(None) => ApiError::unauthorized().into_response(),
        Err(err) => {
            tracing::error!("key store failure: {}", err);
            ApiError::internal().into_response()
        }
    }
}

pub fn add_routes(router: Router, state: AppState, max_body_size: usize) -> Router {
    let liveness = state.liveness.clone();

    let authenticated = Router::new()
        .route("/api/v1/convert", post(handlers::submit::convert))
        .route("/api/v1/analyze", post(handlers::submit::analyze))
        .route("/api/v1/stream", post(handlers::submit::stream))
        .route("/api/v1/batch", post(handlers::submit::batch))
        .route("/api/v1/jobs", get(handlers::jobs::list))
        .route(
            "/api/v1/jobs/:id",
            get(handlers::jobs::get).delete(handlers::jobs::cancel),
        )
        .route("/api/v1/jobs/:id/events", get(handlers::events::stream))
        .route("/api/v1/stats", get(handlers::jobs::stats))
        .layer(middleware::from_fn_with_state(state.clone(), authenticate))
        .layer(RequestBodyLimitLayer::new(max_body_size))
        .with_state(state.clone());

    let public = Router::new()
        .route("/", get(index))
        .route(
            "/_liveness",
            get(move || {
                let liveness = liveness.clone();
                async move { liveness.get_status() }
            }),
        )
        .route("/api/v1/health", get(handlers::health::health))
        .with_state(state);

    router
        .merge(public)
        .merge(authenticated)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MockKeyStore;
    use crate::limits::{RateGate, RateSettings};
    use axum::body::Body;
    use axum::http::{self, Request, StatusCode};
    use common_redis::MockBusClient;
    use conveyor_core::storage::MockStorage;
    use conveyor_core::{ApiKeyRecord, QueueWorker};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use sqlx::PgPool;
    use std::path::PathBuf;
    use tower::ServiceExt; // for `oneshot`

    const API_KEY: &str = "ck_test_1234567890";
    const INPUT: &str = "file:///storage/in/clip.mov";

    fn record(quota: i32) -> ApiKeyRecord {
        ApiKeyRecord {
            key_id: "key-1".to_owned(),
            owner_id: "owner-1".to_owned(),
            quota,
            secret: "whsec_test".to_owned(),
        }
    }

    fn state(db: PgPool, quota: i32) -> AppState {
        let storage = MockStorage::new().with_object(INPUT, vec![0u8; 4096]);
        AppState {
            manager: Arc::new(JobManager::from_pool(db)),
            storage: Arc::new(storage),
            bus: Arc::new(MockBusClient::new()),
            keys: Arc::new(MockKeyStore::new().with_key(API_KEY, record(quota))),
            gate: Arc::new(RateGate::new(RateSettings::default())),
            limits: Arc::new(AdmissionLimits {
                local_roots: vec![PathBuf::from("/storage")],
                ..Default::default()
            }),
            liveness: HealthRegistry::new("liveness"),
        }
    }

    fn app(state: AppState) -> Router {
        add_routes(Router::new(), state, 1_000_000)
    }

    fn submission_body() -> String {
        json!({
            "input": INPUT,
            "output": "mp4",
            "operations": [{"kind": "transcode", "video_codec": "h264", "crf": 23}],
        })
        .to_string()
    }

    fn post(uri: &str, body: String) -> Request<Body> {
        Request::builder()
            .method(http::Method::POST)
            .uri(uri)
            .header(http::header::CONTENT_TYPE, "application/json")
            .header("x-api-key", API_KEY)
            .body(Body::from(body))
            .unwrap()
    }

    fn get_with_key(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("x-api-key", API_KEY)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[sqlx::test(migrations = "../conveyor-core/migrations")]
    async fn requests_without_a_key_are_unauthorized(db: PgPool) {
        let app = app(state(db, 10));

        let response = app
            .oneshot(
                Request::builder()
                    .method(http::Method::POST)
                    .uri("/api/v1/convert")
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .body(Body::from(submission_body()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "UNAUTHORIZED");
    }

    #[sqlx::test(migrations = "../conveyor-core/migrations")]
    async fn convert_creates_a_queued_job(db: PgPool) {
        let app = app(state(db, 10));

        let response = app
            .oneshot(post("/api/v1/convert", submission_body()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["job"]["status"], "queued");
        assert_eq!(body["job"]["progress"], 0.0);
        let id = body["job"]["id"].as_str().unwrap();
        assert_eq!(
            body["job"]["links"]["self"],
            format!("/api/v1/jobs/{id}")
        );
        assert_eq!(
            body["job"]["links"]["events"],
            format!("/api/v1/jobs/{id}/events")
        );
    }

    #[sqlx::test(migrations = "../conveyor-core/migrations")]
    async fn quota_exhaustion_is_429_with_retry_after(db: PgPool) {
        let state = state(db.clone(), 1);

        let first = app(state.clone())
            .oneshot(post("/api/v1/convert", submission_body()))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = app(state)
            .oneshot(post("/api/v1/convert", submission_body()))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key(http::header::RETRY_AFTER));
        let body = body_json(second).await;
        assert_eq!(body["error"]["code"], "QUOTA_EXCEEDED");

        // No second job was created.
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conveyor_jobs")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(total, 1);
    }

    #[sqlx::test(migrations = "../conveyor-core/migrations")]
    async fn loopback_webhooks_are_rejected_at_admission(db: PgPool) {
        let app = app(state(db.clone(), 10));

        let body = json!({
            "input": INPUT,
            "output": "mp4",
            "operations": [{"kind": "transcode", "video_codec": "h264"}],
            "webhook_url": "http://127.0.0.1:22",
        })
        .to_string();

        let response = app.oneshot(post("/api/v1/convert", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "WEBHOOK_FORBIDDEN");

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conveyor_jobs")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(total, 0);
    }

    #[sqlx::test(migrations = "../conveyor-core/migrations")]
    async fn path_traversal_is_rejected_after_canonicalization(db: PgPool) {
        let app = app(state(db.clone(), 10));

        let body = json!({
            "input": "file:///storage/../etc/passwd",
            "output": "mp4",
            "operations": [{"kind": "transcode", "video_codec": "h264"}],
        })
        .to_string();

        let response = app.oneshot(post("/api/v1/convert", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "PATH_OUT_OF_SCOPE");
    }

    #[sqlx::test(migrations = "../conveyor-core/migrations")]
    async fn unknown_operation_tags_are_rejected(db: PgPool) {
        let app = app(state(db, 10));

        let body = json!({
            "input": INPUT,
            "output": "mp4",
            "operations": [{"kind": "upscale_ai", "model": "x4"}],
        })
        .to_string();

        let response = app.oneshot(post("/api/v1/convert", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[sqlx::test(migrations = "../conveyor-core/migrations")]
    async fn oversized_bitrate_is_invalid_not_truncated(db: PgPool) {
        let app = app(state(db, 10));

        let body = json!({
            "input": INPUT,
            "output": "mp4",
            "operations": [{
                "kind": "transcode",
                "video_codec": "h264",
                "bitrate": "9223372036854775807k",
            }],
        })
        .to_string();

        let response = app.oneshot(post("/api/v1/convert", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "INVALID_BITRATE");
    }

    #[sqlx::test(migrations = "../conveyor-core/migrations")]
    async fn idempotent_replay_returns_the_original_job(db: PgPool) {
        let state = state(db, 10);
        let body = json!({
            "input": INPUT,
            "output": "mp4",
            "operations": [{"kind": "transcode", "video_codec": "h264"}],
            "idempotency_key": "batch-42",
        })
        .to_string();

        let first = app(state.clone())
            .oneshot(post("/api/v1/convert", body.clone()))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);
        let first_id = body_json(first).await["job"]["id"]
            .as_str()
            .unwrap()
            .to_owned();

        let second = app(state)
            .oneshot(post("/api/v1/convert", body))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(body_json(second).await["job"]["id"], first_id.as_str());
    }

    #[sqlx::test(migrations = "../conveyor-core/migrations")]
    async fn unknown_jobs_and_foreign_jobs_are_not_found(db: PgPool) {
        let state = state(db.clone(), 10);

        let response = app(state.clone())
            .oneshot(get_with_key(&format!(
                "/api/v1/jobs/{}",
                uuid::Uuid::now_v7()
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // A job owned by someone else looks identical to a missing one.
        let created = app(state.clone())
            .oneshot(post("/api/v1/convert", submission_body()))
            .await
            .unwrap();
        let id = body_json(created).await["job"]["id"]
            .as_str()
            .unwrap()
            .to_owned();
        sqlx::query("UPDATE conveyor_jobs SET owner_id = 'someone-else' WHERE id = $1::uuid")
            .bind(&id)
            .execute(&db)
            .await
            .unwrap();

        let response = app(state)
            .oneshot(get_with_key(&format!("/api/v1/jobs/{id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[sqlx::test(migrations = "../conveyor-core/migrations")]
    async fn cancel_is_idempotent_and_conflicts_with_completion(db: PgPool) {
        let state = state(db.clone(), 10);

        let created = app(state.clone())
            .oneshot(post("/api/v1/convert", submission_body()))
            .await
            .unwrap();
        let id = body_json(created).await["job"]["id"]
            .as_str()
            .unwrap()
            .to_owned();

        let delete = |app_state: AppState, id: String| async move {
            app(app_state)
                .oneshot(
                    Request::builder()
                        .method(http::Method::DELETE)
                        .uri(format!("/api/v1/jobs/{id}"))
                        .header("x-api-key", API_KEY)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap()
        };

        let first = delete(state.clone(), id.clone()).await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(body_json(first).await["job"]["status"], "cancelled");

        // Applied twice: identical response, store unchanged.
        let second = delete(state.clone(), id.clone()).await;
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(body_json(second).await["job"]["status"], "cancelled");

        // A completed job refuses cancellation.
        let created = app(state.clone())
            .oneshot(post("/api/v1/convert", submission_body()))
            .await
            .unwrap();
        let completed_id = body_json(created).await["job"]["id"]
            .as_str()
            .unwrap()
            .to_owned();
        let worker = QueueWorker::from_pool(db, "test-worker");
        let job = worker.dequeue(1).await.unwrap().pop().unwrap();
        worker.complete(&job).await.unwrap();

        let conflict = delete(state, completed_id).await;
        assert_eq!(conflict.status(), StatusCode::CONFLICT);
    }

    #[sqlx::test(migrations = "../conveyor-core/migrations")]
    async fn listing_is_scoped_and_paginated(db: PgPool) {
        let state = state(db, 10);

        for _ in 0..3 {
            let response = app(state.clone())
                .oneshot(post("/api/v1/convert", submission_body()))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
        }

        let response = app(state.clone())
            .oneshot(get_with_key("/api/v1/jobs?per_page=2&page=1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["jobs"].as_array().unwrap().len(), 2);
        assert_eq!(body["pagination"]["total"], 3);

        let response = app(state.clone())
            .oneshot(get_with_key("/api/v1/jobs?status=completed"))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["jobs"].as_array().unwrap().len(), 0);

        let response = app(state)
            .oneshot(get_with_key("/api/v1/jobs?status=sideways"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[sqlx::test(migrations = "../conveyor-core/migrations")]
    async fn sse_replays_the_ring_and_ends_on_terminal(db: PgPool) {
        let state = state(db.clone(), 10);

        let created = app(state.clone())
            .oneshot(post("/api/v1/convert", submission_body()))
            .await
            .unwrap();
        let id = body_json(created).await["job"]["id"]
            .as_str()
            .unwrap()
            .to_owned();

        let worker = QueueWorker::from_pool(db, "test-worker");
        let job = worker.dequeue(1).await.unwrap().pop().unwrap();
        let lock = job.lock_id.unwrap();
        worker
            .flush_progress(
                job.id,
                lock,
                &conveyor_core::ProgressUpdate {
                    percent: 40.0,
                    stage: "encode".to_owned(),
                    fps: Some(30.0),
                    eta_seconds: None,
                },
            )
            .await
            .unwrap();
        worker.complete(&job).await.unwrap();

        let response = app(state)
            .oneshot(get_with_key(&format!("/api/v1/jobs/{id}/events")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(http::header::CONTENT_TYPE)
                .unwrap()
                .to_str()
                .unwrap(),
            "text/event-stream"
        );

        // The stream closes after the terminal frame, so the body is finite.
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&bytes).replace(": ", ":");
        assert!(text.contains("event:progress"));
        assert!(text.contains("event:completed"));
        assert!(text.contains("id:1"));
        assert!(text.contains("id:2"));
        let progress_pos = text.find("event:progress").unwrap();
        let completed_pos = text.find("event:completed").unwrap();
        assert!(progress_pos < completed_pos);
    }
}
