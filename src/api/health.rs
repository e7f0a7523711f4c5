//! Liveness probe endpoint.

use axum::http::StatusCode;

/// `GET /health` — always returns 200 with a plain `OK` body.
///
/// This endpoint has no dependencies and never blocks, making it safe to use
/// as a Docker / Kubernetes liveness probe.
pub async fn health() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}
