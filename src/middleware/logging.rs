//! Request logging middleware.
//!
//! Logs every HTTP request with method, path, status code, and latency.
//! Health checks are skipped to keep the noise down.

use axum::{body::Body, http::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{info, warn};

pub async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    if path == "/health" {
        return next.run(request).await;
    }

    let start = Instant::now();
    let response = next.run(request).await;
    let latency = start.elapsed();
    let status = response.status().as_u16();

    if status >= 500 {
        warn!(
            method = %method,
            path = %path,
            status,
            latency_ms = latency.as_millis() as u64,
            "Request failed (5xx)"
        );
    } else {
        info!(
            method = %method,
            path = %path,
            status,
            latency_ms = latency.as_millis() as u64,
            "Request completed"
        );
    }

    response
}
