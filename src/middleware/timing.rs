use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{debug, warn};

/// Adds `X-Response-Time-Us` and `Server-Timing` headers and logs each
/// request's latency.
pub async fn timing_middleware(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    let start = Instant::now();
    let mut response = next.run(req).await;
    let elapsed = start.elapsed();
    let us = elapsed.as_micros();

    // ── Inject response headers ─────────────────────────────────
    if let Ok(val) = us.to_string().parse() {
        response.headers_mut().insert("X-Response-Time-Us", val);
    }

    let server_timing = format!("total;dur={:.3}", elapsed.as_secs_f64() * 1000.0);
    if let Ok(val) = server_timing.parse() {
        response.headers_mut().insert("Server-Timing", val);
    }

    // SSE connections live as long as the client; their latency is noise.
    if path.ends_with("/stream") {
        return response;
    }

    let status = response.status().as_u16();
    if status >= 400 {
        warn!(%method, %path, status, us = us as u64, "request failed");
    } else {
        debug!(%method, %path, status, us = us as u64, "request served");
    }

    response
}
