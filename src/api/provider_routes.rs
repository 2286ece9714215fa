//! `/llm-providers*` routes (spec.md §4.8, §6): listing the supported
//! wire-protocol families and an on-demand health probe. Construction is
//! always per-request (spec.md §4.3) — these routes never cache or reuse
//! a provider instance across calls.

use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::api::auth_middleware::{self};
use crate::error::{AppError, AppResult};
use crate::jobs::JobRuntime;
use crate::providers::{CallContext, Capabilities};
use crate::storage::models::ProviderParams;

#[derive(Debug, Serialize)]
struct ProviderDescription {
    provider_id: &'static str,
    wire_protocol: &'static str,
    requires_api_key: bool,
    default_model: &'static str,
}

const KNOWN_PROVIDERS: &[ProviderDescription] = &[
    ProviderDescription { provider_id: "openai", wire_protocol: "openai-chat-completions", requires_api_key: true, default_model: "gpt-4o-mini" },
    ProviderDescription { provider_id: "anthropic", wire_protocol: "anthropic-messages", requires_api_key: true, default_model: "claude-3-5-sonnet-latest" },
    ProviderDescription { provider_id: "gemini", wire_protocol: "gemini-generate-content", requires_api_key: true, default_model: "gemini-1.5-flash" },
    ProviderDescription { provider_id: "local", wire_protocol: "openai-compatible", requires_api_key: false, default_model: "local-model" },
];

#[derive(Debug, Serialize)]
struct ProvidersListResponse {
    providers: &'static [ProviderDescription],
}

async fn list_providers() -> Json<ProvidersListResponse> {
    Json(ProvidersListResponse { providers: KNOWN_PROVIDERS })
}

async fn get_provider(Path(id): Path<String>) -> AppResult<Json<ProviderDescription>> {
    KNOWN_PROVIDERS
        .iter()
        .find(|p| p.provider_id == id)
        .map(|p| Json(ProviderDescription { provider_id: p.provider_id, wire_protocol: p.wire_protocol, requires_api_key: p.requires_api_key, default_model: p.default_model }))
        .ok_or_else(|| AppError::NotFound(format!("llm provider '{id}'")))
}

#[derive(Debug, Deserialize, Default)]
struct HealthCheckRequest {
    model: Option<String>,
    endpoint_url: Option<String>,
    api_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthCheckResponse {
    provider_id: String,
    healthy: bool,
    latency_ms: u64,
    error: Option<String>,
    capabilities: Capabilities,
}

/// `POST /llm-providers/{id}/health-check` — constructs a live provider
/// instance from the request body (same contract as `/decompile`'s
/// `llm_*` fields) and issues the minimal probe request (spec.md §4.3).
/// Feeds the result to the circuit breaker the same way a translation
/// call would, so a string of failing health checks trips the breaker
/// before any job is submitted against that key.
async fn health_check_provider(
    State(runtime): State<JobRuntime>,
    Path(id): Path<String>,
    body: Option<Json<HealthCheckRequest>>,
) -> AppResult<Json<HealthCheckResponse>> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let params = ProviderParams { provider_id: id.clone(), model: body.model, endpoint_url: body.endpoint_url, api_key: body.api_key };

    let (key, provider) = runtime
        .registry
        .build(&params)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    if crate::breaker::Admission::Rejected == runtime.breaker.admit(&key).await {
        return Err(AppError::CircuitOpen(key.to_string()));
    }

    let ctx = CallContext::new(Instant::now() + Duration::from_secs(30));
    let result = provider.health_check(&ctx).await;

    match &result {
        Ok(status) if status.healthy => runtime.breaker.record(&key, crate::breaker::CallOutcome::Success).await,
        _ => runtime.breaker.record(&key, crate::breaker::CallOutcome::Failure).await,
    }

    let status = result.map_err(|e| AppError::ProviderFailure(e.to_string()))?;
    Ok(Json(HealthCheckResponse {
        provider_id: id,
        healthy: status.healthy,
        latency_ms: status.latency_ms,
        error: status.error,
        capabilities: provider.capabilities(),
    }))
}

pub fn create_provider_router(runtime: JobRuntime) -> Router<JobRuntime> {
    Router::new()
        .route("/llm-providers", get(list_providers))
        .route("/llm-providers/{id}", get(get_provider))
        .route("/llm-providers/{id}/health-check", post(health_check_provider))
        .route_layer(axum::middleware::from_fn_with_state(runtime, auth_middleware::require_read))
}
