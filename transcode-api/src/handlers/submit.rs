use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde_derive::{Deserialize, Serialize};
use tracing::debug;

use conveyor_core::{ApiKeyRecord, Operation, StreamFormat, Submission, SubmitOutcome};

use crate::errors::ApiError;
use crate::handlers::views::JobEnvelope;
use crate::limits::EndpointClass;
use crate::router::AppState;

const MAX_BATCH_JOBS: usize = 20;

async fn run_submission(
    state: &AppState,
    key: &ApiKeyRecord,
    submission: &Submission,
) -> Result<(StatusCode, JobEnvelope), ApiError> {
    let outcome = state
        .manager
        .submit(
            &key.owner_id,
            key.quota,
            submission,
            &state.limits,
            state.storage.as_ref(),
        )
        .await?;

    let job_id = outcome.job_id();
    let job = state
        .manager
        .load(job_id)
        .await?
        .ok_or_else(ApiError::internal)?;

    let status = match outcome {
        SubmitOutcome::Created(_) => StatusCode::CREATED,
        SubmitOutcome::Existing(_) => StatusCode::OK,
    };
    Ok((status, JobEnvelope::new(&job)))
}

fn gate(state: &AppState, key: &ApiKeyRecord, class: EndpointClass) -> Result<(), ApiError> {
    state
        .gate
        .check(class, &key.key_id)
        .map_err(|wait| ApiError::rate_limited(wait.as_secs()))
}

/// POST /api/v1/convert: the general submission endpoint.
pub async fn convert(
    State(state): State<AppState>,
    Extension(key): Extension<ApiKeyRecord>,
    Json(submission): Json<Submission>,
) -> Result<Response, ApiError> {
    gate(&state, &key, EndpointClass::Convert)?;
    debug!(owner = %key.owner_id, "received convert submission");

    let (status, envelope) = run_submission(&state, &key, &submission).await?;
    Ok((status, Json(envelope)).into_response())
}

/// POST /api/v1/analyze: same pipeline, defaulting to a single analyze
/// operation whose artifact is a json report.
pub async fn analyze(
    State(state): State<AppState>,
    Extension(key): Extension<ApiKeyRecord>,
    Json(mut submission): Json<Submission>,
) -> Result<Response, ApiError> {
    gate(&state, &key, EndpointClass::Analyze)?;

    if submission.operations.is_empty() {
        submission.operations = vec![Operation::Analyze { metrics: vec![] }];
    }
    let analyze_only = submission
        .operations
        .iter()
        .all(|op| matches!(op, Operation::Analyze { .. }));
    if submission.output.is_empty() {
        submission.output = if analyze_only {
            "json".to_owned()
        } else {
            container_of(&submission.input).unwrap_or("mkv").to_owned()
        };
    }

    let (status, envelope) = run_submission(&state, &key, &submission).await?;
    Ok((status, Json(envelope)).into_response())
}

/// POST /api/v1/stream: defaults to HLS packaging.
pub async fn stream(
    State(state): State<AppState>,
    Extension(key): Extension<ApiKeyRecord>,
    Json(mut submission): Json<Submission>,
) -> Result<Response, ApiError> {
    gate(&state, &key, EndpointClass::Stream)?;

    let has_stream_op = submission
        .operations
        .iter()
        .any(|op| matches!(op, Operation::Stream { .. }));
    if !has_stream_op {
        submission.operations.push(Operation::Stream {
            format: StreamFormat::Hls,
            segment_seconds: None,
        });
    }
    if submission.output.is_empty() {
        submission.output = "hls".to_owned();
    }

    let (status, envelope) = run_submission(&state, &key, &submission).await?;
    Ok((status, Json(envelope)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub jobs: Vec<Submission>,
}

#[derive(Debug, Serialize)]
pub struct BatchItemResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<JobEnvelope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<crate::errors::ErrorObject>,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub results: Vec<BatchItemResult>,
}

/// POST /api/v1/batch: submissions are admitted independently; one
/// rejection does not fail the batch.
pub async fn batch(
    State(state): State<AppState>,
    Extension(key): Extension<ApiKeyRecord>,
    Json(request): Json<BatchRequest>,
) -> Result<Response, ApiError> {
    gate(&state, &key, EndpointClass::Convert)?;

    if request.jobs.is_empty() || request.jobs.len() > MAX_BATCH_JOBS {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            conveyor_core::ErrorCode::InvalidInput,
            format!("a batch carries 1..={MAX_BATCH_JOBS} jobs"),
        ));
    }

    let mut results = Vec::with_capacity(request.jobs.len());
    for submission in &request.jobs {
        match run_submission(&state, &key, submission).await {
            Ok((_, envelope)) => results.push(BatchItemResult {
                job: Some(envelope),
                error: None,
            }),
            Err(err) => {
                // A store failure mid-batch aborts the whole request; an
                // admission rejection only fails its own item.
                if err.status == StatusCode::INTERNAL_SERVER_ERROR {
                    return Err(err);
                }
                results.push(BatchItemResult {
                    job: None,
                    error: Some(crate::errors::ErrorObject {
                        kind: err.code.kind(),
                        code: err.code,
                        message: err.message,
                        suggestion: err.code.suggestion().map(str::to_owned),
                    }),
                });
            }
        }
    }

    Ok((StatusCode::OK, Json(BatchResponse { results })).into_response())
}

fn container_of(input: &str) -> Option<&str> {
    let (_, extension) = input.rsplit_once('.')?;
    if extension.chars().all(|c| c.is_ascii_alphanumeric()) {
        Some(extension)
    } else {
        None
    }
}
