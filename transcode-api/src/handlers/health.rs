use std::collections::HashMap;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_derive::Serialize;

use conveyor_core::storage::{Locator, StorageError};

use crate::router::AppState;

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
enum Probe {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    healthy: bool,
    components: HashMap<&'static str, Probe>,
}

/// GET /api/v1/health: aggregated on-demand probes of the fabric's
/// dependencies as seen from this API node. The store, queue and lease
/// state share one Postgres, so the store ping and the queue-depth query
/// cover all three; the transcoder itself is probed by the workers and
/// surfaces through their sidecar probes.
pub async fn health(State(state): State<AppState>) -> Response {
    let mut components = HashMap::new();

    let store = state.manager.ping().await;
    components.insert(
        "store",
        if store.is_ok() {
            Probe::Healthy
        } else {
            Probe::Unhealthy
        },
    );

    let queue = state.manager.waiting_jobs().await;
    components.insert(
        "queue",
        if queue.is_ok() {
            Probe::Healthy
        } else {
            Probe::Unhealthy
        },
    );

    let bus = state
        .bus
        .publish("conveyor:health".to_owned(), "ping".to_owned())
        .await;
    components.insert(
        "bus",
        if bus.is_ok() {
            Probe::Healthy
        } else {
            Probe::Unhealthy
        },
    );

    let probe_locator = state
        .limits
        .local_roots
        .first()
        .map(|root| Locator::File(root.join(".conveyor-health-probe")));
    let storage = match probe_locator {
        Some(locator) => match state.storage.exists(&locator).await {
            Ok(_) | Err(StorageError::NotFound(_)) => Probe::Healthy,
            Err(_) => Probe::Unhealthy,
        },
        None => Probe::Healthy,
    };
    components.insert("storage", storage);

    let healthy = components.values().all(|probe| *probe == Probe::Healthy);
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };

    (
        status,
        Json(HealthResponse {
            healthy,
            components,
        }),
    )
        .into_response()
}
