//! SSE streaming endpoint.
//!
//! GET /api/runs/{id}/events?from_seq=N
//!
//! Subscribe-with-replay: all persisted events with `seq >= from_seq`, then
//! live events until the terminal event closes the stream or the client
//! disconnects. Each event is framed as `data: <json>\n\n` with the envelope
//! `{run_id, seq, type, payload, ts}`; a `: keepalive` comment defeats
//! idle-proxy timeouts.

use std::convert::Infallible;

use axum::extract::{Extension, Path, Query};
use axum::http::header::{HeaderName, CACHE_CONTROL};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures::StreamExt;
use serde::Deserialize;
use uuid::Uuid;

use crate::common::error::ApiError;
use crate::server::app::AppState;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Replay from this sequence number (default 0).
    pub from_seq: Option<i64>,
}

/// SSE handler for a run's event stream.
pub async fn run_events_handler(
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<StreamQuery>,
) -> Result<impl IntoResponse, ApiError> {
    // 404 before committing to a stream response.
    state
        .kernel
        .queue
        .get(id)
        .await?
        .ok_or(ApiError::NotFound("run"))?;

    let events = state
        .kernel
        .bus
        .subscribe(id, query.from_seq.unwrap_or(0).max(0))
        .await?;

    let stream = events.map(|event| {
        Ok::<_, Infallible>(Event::default().data(event.envelope().to_string()))
    });

    let sse = Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(state.kernel.settings.sse_keepalive)
            .text("keepalive"),
    );

    Ok((
        [
            (CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        sse,
    ))
}
