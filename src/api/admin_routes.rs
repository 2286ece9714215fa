//! `/admin/*` routes (spec.md §4.9, §6): operational stats, config echo,
//! circuit-breaker overrides, alerts, API-key lifecycle, and the one-shot
//! bootstrap endpoint. Generalizes the teacher's `api/admin_routes.rs`
//! (stats + config dump over a single `PgPool`) to the richer admin
//! surface this spec names.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::auth_middleware;
use crate::auth::{self, NewApiKeyRequest};
use crate::error::{AppError, AppResult};
use crate::jobs::JobRuntime;
use crate::providers::ProviderKey;
use crate::storage::models::{Alert, ApiKeyTier, BreakerState, JobStatus};

// ---------------------------------------------------------------------
// Stats / config / system metrics
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct StatsResponse {
    jobs_by_status: std::collections::HashMap<JobStatus, i64>,
    total_tokens_in: i64,
    total_tokens_out: i64,
    total_estimated_cost: f64,
    active_api_keys: i64,
    cache_entries: i64,
}

async fn get_stats(State(runtime): State<JobRuntime>) -> AppResult<Json<StatsResponse>> {
    let counts = runtime.store.job_counts_by_status().await?;
    let (tokens_in, tokens_out, cost) = runtime.store.job_totals().await?;
    let active_api_keys = runtime.store.count_active_api_keys().await?;
    let cache_entries = runtime.store.count_cache_entries().await?;
    Ok(Json(StatsResponse {
        jobs_by_status: counts.into_iter().collect(),
        total_tokens_in: tokens_in,
        total_tokens_out: tokens_out,
        total_estimated_cost: cost,
        active_api_keys,
        cache_entries,
    }))
}

#[derive(Debug, Serialize)]
struct ConfigResponse {
    worker_count: usize,
    translation_concurrency: usize,
    max_file_size_mb: u64,
    analysis_timeout_seconds: u64,
    result_ttl_hours: u64,
    upload_ttl_seconds: u64,
    retry_cap: i32,
    stale_lease_seconds: i64,
}

/// Echoes the operational config, never secrets — `api_key_salt` and any
/// `llm_api_key` never appear here (spec.md §4.9 "no secret material in
/// any admin response").
async fn get_config(State(runtime): State<JobRuntime>) -> Json<ConfigResponse> {
    let config = &runtime.config;
    Json(ConfigResponse {
        worker_count: config.worker_count,
        translation_concurrency: config.translation_concurrency,
        max_file_size_mb: config.max_file_size_mb,
        analysis_timeout_seconds: config.analysis_timeout_seconds,
        result_ttl_hours: config.result_ttl_hours,
        upload_ttl_seconds: config.upload_ttl_seconds,
        retry_cap: config.retry_cap,
        stale_lease_seconds: config.stale_lease_seconds,
    })
}

#[derive(Debug, Serialize)]
struct MetricsResponse {
    worker_heartbeats: Vec<crate::storage::models::WorkerHeartbeat>,
}

/// `/admin/metrics/workers` — the only metrics sub-path spec.md names
/// explicitly; other `metrics/*` paths are left to future operators, per
/// spec.md §4.9's open-ended admin surface.
async fn get_worker_metrics(State(runtime): State<JobRuntime>) -> AppResult<Json<MetricsResponse>> {
    let worker_heartbeats = runtime.store.list_worker_heartbeats().await?;
    Ok(Json(MetricsResponse { worker_heartbeats }))
}

#[derive(Debug, Serialize)]
struct MonitoringSummary {
    open_alerts: usize,
    circuit_breakers_open: usize,
}

/// `/admin/monitoring/summary` — a quick aggregate view combining the
/// alert and breaker surfaces, for a landing dashboard.
async fn get_monitoring_summary(State(runtime): State<JobRuntime>) -> AppResult<Json<MonitoringSummary>> {
    let alerts = runtime.store.list_alerts(false).await?;
    let breakers = runtime.breaker.list_keys().await;
    let open = breakers.iter().filter(|(_, s)| *s != BreakerState::Closed).count();
    Ok(Json(MonitoringSummary { open_alerts: alerts.len(), circuit_breakers_open: open }))
}

/// `/admin/dashboards/overview` — same data as `get_stats`, under the
/// dashboards namespace spec.md §6 lists alongside `metrics`/`monitoring`.
async fn get_dashboard_overview(State(runtime): State<JobRuntime>) -> AppResult<Json<StatsResponse>> {
    get_stats(State(runtime)).await
}

// ---------------------------------------------------------------------
// Circuit breakers
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct BreakerEntry {
    provider_id: String,
    model: String,
    endpoint: Option<String>,
    state: BreakerState,
}

async fn list_breakers(State(runtime): State<JobRuntime>) -> Json<Vec<BreakerEntry>> {
    let keys = runtime.breaker.list_keys().await;
    Json(
        keys.into_iter()
            .map(|(key, state)| BreakerEntry { provider_id: key.provider_id, model: key.model, endpoint: key.endpoint, state })
            .collect(),
    )
}

fn parse_breaker_key(name: &str) -> AppResult<ProviderKey> {
    // "{provider_id}:{model}" or "{provider_id}:{model}@{endpoint}", matching
    // ProviderKey's Display impl, so the name from list_breakers round-trips.
    let (head, endpoint) = match name.split_once('@') {
        Some((h, e)) => (h, Some(e.to_string())),
        None => (name, None),
    };
    let (provider_id, model) = head
        .split_once(':')
        .ok_or_else(|| AppError::InvalidRequest(format!("malformed breaker key: {name}")))?;
    Ok(ProviderKey { provider_id: provider_id.to_string(), model: model.to_string(), endpoint })
}

async fn get_breaker(State(runtime): State<JobRuntime>, Path(name): Path<String>) -> AppResult<Json<BreakerEntry>> {
    let key = parse_breaker_key(&name)?;
    let state = runtime
        .breaker
        .status(&key)
        .await
        .ok_or_else(|| AppError::NotFound(format!("circuit breaker '{name}'")))?;
    Ok(Json(BreakerEntry { provider_id: key.provider_id, model: key.model, endpoint: key.endpoint, state }))
}

async fn reset_breaker(State(runtime): State<JobRuntime>, Path(name): Path<String>) -> AppResult<StatusCode> {
    let key = parse_breaker_key(&name)?;
    runtime.breaker.reset(&key).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn force_open_breaker(State(runtime): State<JobRuntime>, Path(name): Path<String>) -> AppResult<StatusCode> {
    let key = parse_breaker_key(&name)?;
    runtime.breaker.force_open(&key).await;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct BreakerHealthAll {
    breakers: Vec<BreakerEntry>,
}

async fn health_check_all_breakers(State(runtime): State<JobRuntime>) -> Json<BreakerHealthAll> {
    let keys = runtime.breaker.list_keys().await;
    Json(BreakerHealthAll {
        breakers: keys
            .into_iter()
            .map(|(key, state)| BreakerEntry { provider_id: key.provider_id, model: key.model, endpoint: key.endpoint, state })
            .collect(),
    })
}

// ---------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------

async fn list_alerts(State(runtime): State<JobRuntime>) -> AppResult<Json<Vec<Alert>>> {
    Ok(Json(runtime.store.list_alerts(true).await?))
}

/// Re-evaluate the standing conditions this service monitors (stale
/// worker heartbeats, open circuit breakers) and raise or clear alerts
/// accordingly. Shared by `POST /admin/alerts/check` (an operator forcing
/// an immediate pass) and the background maintenance timer in the server
/// binary, which runs the identical pass on its own schedule (spec.md §9
/// "alerts as a thin wrapper around counters crossing thresholds").
pub async fn evaluate_alerts(runtime: &JobRuntime) -> AppResult<()> {
    let breakers = runtime.breaker.list_keys().await;
    for (key, state) in &breakers {
        let condition_key = format!("circuit_open:{key}");
        if *state == BreakerState::Open {
            runtime
                .store
                .raise_alert(&condition_key, crate::storage::models::AlertSeverity::Warning, &format!("circuit breaker open for {key}"))
                .await?;
        } else {
            runtime.store.resolve_alerts_for_condition(&condition_key).await?;
        }
    }

    let stale_cutoff = chrono::Utc::now() - chrono::Duration::seconds(runtime.config.stale_lease_seconds * 3);
    for heartbeat in runtime.store.list_worker_heartbeats().await? {
        let condition_key = format!("stale_worker:{}", heartbeat.worker_id);
        if heartbeat.last_heartbeat < stale_cutoff {
            runtime
                .store
                .raise_alert(&condition_key, crate::storage::models::AlertSeverity::Critical, &format!("worker {} has not sent a heartbeat recently", heartbeat.worker_id))
                .await?;
        } else {
            runtime.store.resolve_alerts_for_condition(&condition_key).await?;
        }
    }

    Ok(())
}

async fn check_alerts(State(runtime): State<JobRuntime>) -> AppResult<Json<Vec<Alert>>> {
    evaluate_alerts(&runtime).await?;
    Ok(Json(runtime.store.list_alerts(false).await?))
}

async fn acknowledge_alert(State(runtime): State<JobRuntime>, Path(id): Path<Uuid>) -> AppResult<Json<Alert>> {
    runtime.store.acknowledge_alert(id).await?;
    Ok(Json(runtime.store.get_alert(id).await?))
}

async fn resolve_alert(State(runtime): State<JobRuntime>, Path(id): Path<Uuid>) -> AppResult<Json<Alert>> {
    runtime.store.resolve_alert(id).await?;
    Ok(Json(runtime.store.get_alert(id).await?))
}

// ---------------------------------------------------------------------
// API keys
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateApiKeyRequest {
    user_id: String,
    tier: ApiKeyTier,
    permissions: Vec<String>,
    expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Serialize)]
struct CreateApiKeyResponse {
    key_id: String,
    token: String,
    user_id: String,
    tier: ApiKeyTier,
    permissions: Vec<String>,
}

/// Returns the raw bearer token exactly once (spec.md §4.9); it is never
/// retrievable again after this response.
async fn create_api_key(
    State(runtime): State<JobRuntime>,
    Json(body): Json<CreateApiKeyRequest>,
) -> AppResult<impl IntoResponse> {
    let (key, token) = auth::create_api_key(
        &runtime.store,
        &runtime.config.api_key_salt,
        NewApiKeyRequest { user_id: body.user_id, tier: body.tier, permissions: body.permissions, expires_at: body.expires_at },
    )
    .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateApiKeyResponse { key_id: key.key_id, token, user_id: key.user_id, tier: key.tier, permissions: key.permissions }),
    ))
}

async fn list_api_keys(State(runtime): State<JobRuntime>, Path(user_id): Path<String>) -> AppResult<Json<Vec<crate::storage::models::ApiKey>>> {
    Ok(Json(runtime.store.list_api_keys_for_user(&user_id).await?))
}

async fn revoke_api_key(
    State(runtime): State<JobRuntime>,
    Path((user_id, key_id)): Path<(String, String)>,
) -> AppResult<StatusCode> {
    let revoked = runtime.store.revoke_api_key(&user_id, &key_id).await?;
    if revoked {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("api key '{key_id}' for user '{user_id}'")))
    }
}

// ---------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BootstrapRequest {
    user_id: String,
}

/// `POST /admin/bootstrap/create-admin` — one-shot (spec.md §4.9); once
/// any admin key exists this always answers 403, regardless of caller.
/// Deliberately unauthenticated at the route layer since its entire
/// purpose is minting the very first credential.
async fn bootstrap_create_admin(
    State(runtime): State<JobRuntime>,
    Json(body): Json<BootstrapRequest>,
) -> AppResult<impl IntoResponse> {
    let (key, token) = auth::bootstrap_admin(&runtime.store, &runtime.config.api_key_salt, &body.user_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateApiKeyResponse { key_id: key.key_id, token, user_id: key.user_id, tier: key.tier, permissions: key.permissions }),
    ))
}

pub fn create_admin_router(runtime: JobRuntime) -> Router<JobRuntime> {
    let protected = Router::new()
        .route("/admin/stats", get(get_stats))
        .route("/admin/config", get(get_config))
        .route("/admin/metrics/workers", get(get_worker_metrics))
        .route("/admin/monitoring/summary", get(get_monitoring_summary))
        .route("/admin/dashboards/overview", get(get_dashboard_overview))
        .route("/admin/circuit-breakers", get(list_breakers))
        .route("/admin/circuit-breakers/health-check/all", get(health_check_all_breakers))
        .route("/admin/circuit-breakers/{name}", get(get_breaker))
        .route("/admin/circuit-breakers/{name}/reset", post(reset_breaker))
        .route("/admin/circuit-breakers/{name}/force-open", post(force_open_breaker))
        .route("/admin/alerts", get(list_alerts))
        .route("/admin/alerts/check", post(check_alerts))
        .route("/admin/alerts/{id}/acknowledge", post(acknowledge_alert))
        .route("/admin/alerts/{id}/resolve", post(resolve_alert))
        .route("/admin/api-keys", post(create_api_key))
        .route("/admin/api-keys/{user_id}", get(list_api_keys))
        .route("/admin/api-keys/{user_id}/{key_id}", axum::routing::delete(revoke_api_key))
        .route_layer(axum::middleware::from_fn_with_state(runtime, auth_middleware::require_admin));

    let bootstrap = Router::new().route("/admin/bootstrap/create-admin", post(bootstrap_create_admin));

    protected.merge(bootstrap)
}
