//! `/health*` and `/system/info` routes (spec.md §4.8, §6). Unauthenticated
//! by design, same as the teacher's `/health` in `api/mod.rs` — orchestrators
//! and load balancers must be able to probe without a token.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::jobs::JobRuntime;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", version: env!("CARGO_PKG_VERSION") })
}

/// Readiness: can the service actually take work right now — reachable
/// database, writable storage root. Distinct from liveness, which only
/// asks whether the process is still running its event loop.
async fn ready(State(runtime): State<JobRuntime>) -> impl IntoResponse {
    match runtime.store.ping().await {
        Ok(()) => (StatusCode::OK, Json(HealthResponse { status: "ready", version: env!("CARGO_PKG_VERSION") })),
        Err(e) => {
            tracing::warn!(error = %e, "readiness probe failed: database unreachable");
            (StatusCode::SERVICE_UNAVAILABLE, Json(HealthResponse { status: "not_ready", version: env!("CARGO_PKG_VERSION") }))
        }
    }
}

async fn live() -> Json<HealthResponse> {
    Json(HealthResponse { status: "alive", version: env!("CARGO_PKG_VERSION") })
}

#[derive(Debug, Serialize)]
struct SystemInfo {
    version: &'static str,
    worker_count: usize,
    translation_concurrency: usize,
    max_file_size_mb: u64,
    analysis_timeout_seconds: u64,
}

async fn system_info(State(runtime): State<JobRuntime>) -> Json<SystemInfo> {
    Json(SystemInfo {
        version: env!("CARGO_PKG_VERSION"),
        worker_count: runtime.config.worker_count,
        translation_concurrency: runtime.config.translation_concurrency,
        max_file_size_mb: runtime.config.max_file_size_mb,
        analysis_timeout_seconds: runtime.config.analysis_timeout_seconds,
    })
}

pub fn create_health_router() -> Router<JobRuntime> {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
        .route("/health/live", get(live))
        .route("/system/info", get(system_info))
}
