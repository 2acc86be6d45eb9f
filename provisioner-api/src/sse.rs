//! Server-Sent Events stream of one job's events.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::StreamExt;
use futures::stream::Stream;
use tracing::{debug, warn};

use provisioner::core::types::EventKind;

use crate::error::{ApiError, ApiResult};
use crate::routes::parse_job_id;
use crate::state::AppState;

/// GET /api/jobs/{id}/events - backlog then live events, closed after the
/// terminal state event.
pub async fn job_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let id = parse_job_id(&id)?;
    let mut events = state
        .orchestrator
        .stream_events(id)
        .ok_or_else(|| ApiError::NotFound(format!("job {id} not found")))?;
    debug!(job_id = %id, "SSE client subscribed");

    let stream = async_stream::stream! {
        while let Some(event) = events.next().await {
            let name = match event.kind {
                EventKind::Output { .. } => "output",
                EventKind::State { .. } => "state",
            };
            match serde_json::to_string(&event) {
                Ok(json) => {
                    yield Ok(Event::default()
                        .event(name)
                        .id(event.seq.to_string())
                        .data(json));
                }
                Err(e) => warn!(job_id = %id, err = %e, "failed to encode job event"),
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    ))
}
