//! REST API module (spec.md §4.8, §6).
//!
//! Generalizes the teacher's `api/mod.rs` (one `pub mod` + `pub use` per
//! route file) from the DSL/entity/session surface to the decompile, LLM
//! provider, health, and admin surfaces this spec names.

pub mod admin_routes;
pub mod auth_middleware;
pub mod decompile_routes;
pub mod health_routes;
pub mod provider_routes;

pub use admin_routes::{create_admin_router, evaluate_alerts};
pub use decompile_routes::create_decompile_router;
pub use health_routes::create_health_router;
pub use provider_routes::create_provider_router;

use axum::extract::DefaultBodyLimit;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::jobs::JobRuntime;

/// Assemble the full service router. Each concern builds (and permission-
/// layers) its own sub-router; this function only merges them and applies
/// the cross-cutting CORS/tracing layers, same split of responsibility as
/// the teacher's `create_agentic_router` plus its call site in
/// `bin/agentic_server.rs`.
pub fn build_router(runtime: JobRuntime) -> Router {
    // axum's multipart extractor inherits the default 2 MB body limit;
    // raise it to the configured upload ceiling plus headroom for
    // multipart field boundaries/form fields, so `max_file_size_mb`
    // (spec.md §6) is enforced by `jobs::submit`'s own check (413 with a
    // readable reason) rather than a generic body-too-large rejection.
    let body_limit = runtime.config.max_file_size_bytes() as usize + 64 * 1024;

    Router::new()
        .merge(create_decompile_router(runtime.clone()))
        .merge(create_provider_router(runtime.clone()))
        .merge(create_health_router())
        .merge(create_admin_router(runtime.clone()))
        .with_state(runtime)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}
