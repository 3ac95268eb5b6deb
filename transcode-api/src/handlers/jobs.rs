use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde_derive::Deserialize;
use uuid::Uuid;

use conveyor_core::bus::publish_frame;
use conveyor_core::{ApiKeyRecord, CancelOutcome, ErrorCode, Job, JobState, ListOrder};

use crate::errors::ApiError;
use crate::handlers::views::{JobEnvelope, JobListResponse, JobView, Pagination};
use crate::limits::EndpointClass;
use crate::router::AppState;

const MAX_PER_PAGE: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
    pub sort: Option<String>,
}

/// Load a job and hide its existence from other owners.
async fn load_owned(state: &AppState, key: &ApiKeyRecord, id: Uuid) -> Result<Job, ApiError> {
    let job = state.manager.load(id).await?.ok_or_else(ApiError::not_found)?;
    if job.owner_id != key.owner_id {
        return Err(ApiError::not_found());
    }
    Ok(job)
}

/// GET /api/v1/jobs: paginated listing scoped to the authenticated owner.
pub async fn list(
    State(state): State<AppState>,
    Extension(key): Extension<ApiKeyRecord>,
    Query(params): Query<ListParams>,
) -> Result<Response, ApiError> {
    state
        .gate
        .check(EndpointClass::Query, &key.key_id)
        .map_err(|wait| ApiError::rate_limited(wait.as_secs()))?;

    let status = match params.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(raw.parse::<JobState>().map_err(|_| {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                ErrorCode::InvalidInput,
                format!("unknown status filter: {raw}"),
            )
        })?),
    };

    let order = match params.sort.as_deref() {
        None | Some("-created_at") => ListOrder::CreatedDesc,
        Some("created_at") => ListOrder::CreatedAsc,
        Some(other) => {
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                ErrorCode::InvalidInput,
                format!("unknown sort key: {other}"),
            ))
        }
    };

    let page = params.page.unwrap_or(1).max(1);
    let per_page = params.per_page.unwrap_or(20).clamp(1, MAX_PER_PAGE);

    let (jobs, total) = state
        .manager
        .list(&key.owner_id, status, order, page, per_page)
        .await?;

    let response = JobListResponse {
        jobs: jobs.iter().map(JobView::from).collect(),
        pagination: Pagination {
            page,
            per_page,
            total,
        },
    };
    Ok(Json(response).into_response())
}

/// GET /api/v1/jobs/{id}
pub async fn get(
    State(state): State<AppState>,
    Extension(key): Extension<ApiKeyRecord>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    state
        .gate
        .check(EndpointClass::Query, &key.key_id)
        .map_err(|wait| ApiError::rate_limited(wait.as_secs()))?;

    let job = load_owned(&state, &key, id).await?;
    Ok(Json(JobEnvelope::new(&job)).into_response())
}

/// DELETE /api/v1/jobs/{id}: cancel. Idempotent for already-cancelled
/// jobs; conflicts with completed/failed outcomes.
pub async fn cancel(
    State(state): State<AppState>,
    Extension(key): Extension<ApiKeyRecord>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    state
        .gate
        .check(EndpointClass::Query, &key.key_id)
        .map_err(|wait| ApiError::rate_limited(wait.as_secs()))?;

    // Ownership first, so a foreign job id cancels nothing and leaks nothing.
    load_owned(&state, &key, id).await?;

    match state.manager.cancel(id).await? {
        CancelOutcome::Cancelled(job, frame) => {
            // Publish only after the transaction committed.
            publish_frame(state.bus.as_ref(), &frame).await;
            Ok((StatusCode::OK, Json(JobEnvelope::new(&job))).into_response())
        }
        CancelOutcome::CancelRequested(job) => {
            Ok((StatusCode::ACCEPTED, Json(JobEnvelope::new(&job))).into_response())
        }
        CancelOutcome::AlreadyCancelled(job) => {
            Ok((StatusCode::OK, Json(JobEnvelope::new(&job))).into_response())
        }
        CancelOutcome::TerminalConflict(job) => Err(ApiError::new(
            StatusCode::CONFLICT,
            ErrorCode::InvalidInput,
            format!("job already {}", job.state.as_str()),
        )),
        CancelOutcome::NotFound => Err(ApiError::not_found()),
    }
}

/// GET /api/v1/stats: grouped per-status counts for the owner.
pub async fn stats(
    State(state): State<AppState>,
    Extension(key): Extension<ApiKeyRecord>,
) -> Result<Response, ApiError> {
    state
        .gate
        .check(EndpointClass::Query, &key.key_id)
        .map_err(|wait| ApiError::rate_limited(wait.as_secs()))?;

    let stats = state.manager.stats(&key.owner_id).await?;
    Ok(Json(stats).into_response())
}
