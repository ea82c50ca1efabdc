use axum::{middleware as axum_mw, routing::get, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::metrics::stream;
use crate::middleware::timing;
use crate::AppState;

/// Builds the scrape `Router`: exposition text, JSON view and SSE stream.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // ── Scrape target ───────────────────────────────────────
        .route("/metrics", get(stream::get_exposition))
        // ── JSON views ──────────────────────────────────────────
        .route("/api/metrics", get(stream::get_metrics))
        .route("/api/metrics/stream", get(stream::metrics_stream))
        // ── Provide shared state to all routes above ────────────
        .with_state(state)
        // ── Global middleware (applied bottom-up) ───────────────
        .layer(axum_mw::from_fn(timing::timing_middleware))
        .layer(CorsLayer::permissive())
}
