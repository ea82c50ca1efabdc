use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;

use crate::reporters::exposition;
use crate::AppState;

const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

// ─── GET /metrics ────────────────────────────────────────────────
/// Exposition text for the latest snapshot; empty before the first tick.

pub async fn get_exposition(State(state): State<Arc<AppState>>) -> Response {
    let body = state
        .endpoint
        .latest()
        .map(|snapshot| exposition::format_snapshot(&snapshot))
        .unwrap_or_default();

    ([(header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)], body).into_response()
}

// ─── GET /api/metrics ────────────────────────────────────────────
/// Latest snapshot as JSON, for curl and debugging. 204 before the first tick.

pub async fn get_metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.endpoint.latest() {
        Some(snapshot) => Json(snapshot.as_ref().clone()).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

// ─── GET /api/metrics/stream ─────────────────────────────────────
/// Server-Sent Events endpoint.
/// Pushes the latest snapshot as JSON on every stream tick; ticks before
/// the first capture are skipped.

pub async fn metrics_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let interval = tokio::time::interval(Duration::from_millis(state.stream_interval_ms));

    let stream = IntervalStream::new(interval).filter_map(move |_| {
        let snapshot = state.endpoint.latest()?;
        let json = serde_json::to_string(snapshot.as_ref()).unwrap_or_default();
        Some(Ok(Event::default().data(json)))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
