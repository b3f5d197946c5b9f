//! Health and readiness probes.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use tracing::warn;

use crate::server::AppState;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Basic health check: the process is up and serving requests.
pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

/// Readiness check: verifies the job store is reachable.
///
/// Used by orchestrators to gate traffic until the database connection
/// works.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.storage.health_check().await {
        Ok(()) => (StatusCode::OK, Json(HealthResponse { status: "ready" })),
        Err(probe_error) => {
            warn!(error = %probe_error, "readiness check failed");
            (StatusCode::SERVICE_UNAVAILABLE, Json(HealthResponse { status: "degraded" }))
        },
    }
}

/// Liveness check: the event loop is responsive.
pub async fn liveness_check() -> impl IntoResponse {
    Json(HealthResponse { status: "alive" })
}
