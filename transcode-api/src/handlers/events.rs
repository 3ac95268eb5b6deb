use std::convert::Infallible;
use std::pin::Pin;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Extension;
use futures_util::stream::Stream;
use tracing::debug;
use uuid::Uuid;

use conveyor_core::bus::{decode_frame, subscribe_job};
use conveyor_core::{ApiKeyRecord, ProgressFrame};

use crate::errors::ApiError;
use crate::limits::EndpointClass;
use crate::router::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

fn frame_event(frame: &ProgressFrame) -> Event {
    let name = match frame.terminal {
        Some(state) => state.as_str(),
        None => "progress",
    };
    let event = Event::default().id(frame.seq.to_string()).event(name);
    match serde_json::to_string(frame) {
        Ok(data) => event.data(data),
        Err(_) => event.comment("undecodable frame"),
    }
}

/// GET /api/v1/jobs/{id}/events: Server-Sent Events.
///
/// Replays the durable ring past `Last-Event-ID`, then follows the live
/// bus. Frames are strictly ordered by sequence number and deduplicated on
/// the replay/live boundary; a terminal frame is the last thing sent. A
/// client disconnect tears down only this subscription, never the job.
pub async fn stream(
    State(state): State<AppState>,
    Extension(key): Extension<ApiKeyRecord>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Sse<Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>>, ApiError> {
    state
        .gate
        .check(EndpointClass::Query, &key.key_id)
        .map_err(|wait| ApiError::rate_limited(wait.as_secs()))?;

    let job = state.manager.load(id).await?.ok_or_else(ApiError::not_found)?;
    if job.owner_id != key.owner_id {
        return Err(ApiError::not_found());
    }

    let last_event_id = headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(0);

    // Subscribe before reading the ring so no frame can fall between the
    // replay query and the live feed; the seq watermark dedupes overlap.
    let mut subscription = subscribe_job(state.bus.as_ref(), id).await.map_err(|err| {
        tracing::error!("bus subscribe failed: {}", err);
        ApiError::internal()
    })?;
    let replay = state.manager.events_after(id, last_event_id).await?;

    debug!(job_id = %id, last_event_id, replayed = replay.len(), "sse stream opened");

    let terminal_job_state = job.state;
    let stream = async_stream::stream! {
        let mut last_seq = last_event_id;
        let mut done = false;

        for frame in replay {
            last_seq = frame.seq;
            let terminal = frame.terminal.is_some();
            yield Ok(frame_event(&frame));
            if terminal {
                done = true;
                break;
            }
        }

        // The job finished long ago and its terminal frame fell out of the
        // ring: synthesize one so the client still observes the end.
        if !done && terminal_job_state.is_terminal() && last_seq == last_event_id {
            let synthetic = ProgressFrame {
                job_id: id,
                seq: last_seq + 1,
                recorded_at: chrono::Utc::now(),
                percent: if terminal_job_state == conveyor_core::JobState::Completed { 100.0 } else { 0.0 },
                stage: terminal_job_state.as_str().to_owned(),
                fps: None,
                eta_seconds: None,
                terminal: Some(terminal_job_state),
                error: None,
            };
            yield Ok(frame_event(&synthetic));
            done = true;
        }

        while !done {
            match tokio::time::timeout(HEARTBEAT_INTERVAL, subscription.recv()).await {
                Ok(Some(payload)) => {
                    let Some(frame) = decode_frame(&payload) else {
                        continue;
                    };
                    if frame.seq <= last_seq {
                        continue;
                    }
                    last_seq = frame.seq;
                    let terminal = frame.terminal.is_some();
                    yield Ok(frame_event(&frame));
                    if terminal {
                        done = true;
                    }
                }
                Ok(None) => {
                    // Bus subscription dropped (laggard or shutdown).
                    done = true;
                }
                Err(_) => {
                    yield Ok(Event::default().comment("heartbeat"));
                }
            }
        }
    };

    let boxed: Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>> = Box::pin(stream);
    Ok(Sse::new(boxed).keep_alive(KeepAlive::default()))
}
