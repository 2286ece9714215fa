//! `/decompile*` routes (spec.md §4.8, §6): upload, status/result, cancel,
//! and a smoke-test endpoint. Styled after the teacher's `agent_routes.rs`
//! (`Router::new().route(...).with_state(state)`), generalized from a
//! single `PgPool` state to the full [`JobRuntime`].

use axum::extract::{Multipart, Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Serialize;
use uuid::Uuid;

use crate::api::auth_middleware::{self, Identity};
use crate::error::{AppError, AppResult};
use crate::jobs::{self, JobRuntime, SubmitRequest};
use crate::storage::models::{
    AnalysisConfig, AnalysisDepth, Job, JobStatus, Priority, ProviderParams, TranslationDetail,
};

#[derive(Debug, Serialize)]
struct FileInfoEcho {
    filename: String,
    size_bytes: u64,
    content_type: Option<String>,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    job_id: Uuid,
    status: &'static str,
    file_info: FileInfoEcho,
    config: serde_json::Value,
    check_status_url: String,
}

fn parse_depth(value: Option<String>) -> AppResult<AnalysisDepth> {
    match value.as_deref().unwrap_or("standard") {
        "basic" => Ok(AnalysisDepth::Basic),
        "standard" => Ok(AnalysisDepth::Standard),
        "comprehensive" => Ok(AnalysisDepth::Comprehensive),
        other => Err(AppError::ValidationError(format!("unknown analysis_depth: {other}"))),
    }
}

fn parse_detail(value: Option<String>) -> AppResult<TranslationDetail> {
    match value.as_deref().unwrap_or("standard") {
        "basic" => Ok(TranslationDetail::Basic),
        "standard" => Ok(TranslationDetail::Standard),
        "detailed" => Ok(TranslationDetail::Detailed),
        other => Err(AppError::ValidationError(format!("unknown translation_detail: {other}"))),
    }
}

/// Upload sanitization: strip any path component, keep only the basename,
/// per spec.md §3 "`filename` (original upload name, sanitized)".
fn sanitize_filename(raw: &str) -> String {
    raw.rsplit(['/', '\\']).next().unwrap_or(raw).to_string()
}

/// `POST /decompile` — multipart upload (spec.md §6). Fields: `file`
/// (required), `analysis_depth`, `translation_detail`, `llm_provider`,
/// `llm_model`, `llm_endpoint_url`, `llm_api_key` (never logged).
async fn submit_decompile(
    State(runtime): State<JobRuntime>,
    Extension(identity): Extension<Identity>,
    mut multipart: Multipart,
) -> AppResult<impl IntoResponse> {
    let mut filename: Option<String> = None;
    let mut content_type: Option<String> = None;
    let mut bytes: Option<Vec<u8>> = None;
    let mut analysis_depth: Option<String> = None;
    let mut translation_detail: Option<String> = None;
    let mut provider_id: Option<String> = None;
    let mut model: Option<String> = None;
    let mut endpoint_url: Option<String> = None;
    let mut api_key: Option<String> = None;
    let mut priority = Priority::Normal;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::InvalidRequest(format!("malformed multipart body: {e}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                filename = field.file_name().map(sanitize_filename);
                content_type = field.content_type().map(str::to_string);
                bytes = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| AppError::InvalidRequest(format!("reading file field: {e}")))?
                        .to_vec(),
                );
            }
            "analysis_depth" => analysis_depth = Some(field_text(field).await?),
            "translation_detail" => translation_detail = Some(field_text(field).await?),
            "llm_provider" => provider_id = Some(field_text(field).await?),
            "llm_model" => model = Some(field_text(field).await?),
            "llm_endpoint_url" => endpoint_url = Some(field_text(field).await?),
            "llm_api_key" => api_key = Some(field_text(field).await?),
            "priority" => {
                priority = match field_text(field).await?.as_str() {
                    "urgent" => Priority::Urgent,
                    "high" => Priority::High,
                    "normal" => Priority::Normal,
                    "low" => Priority::Low,
                    other => return Err(AppError::ValidationError(format!("unknown priority: {other}"))),
                };
            }
            _ => {
                let _ = field.bytes().await;
            }
        }
    }

    let bytes = bytes.ok_or_else(|| AppError::InvalidRequest("missing required 'file' field".to_string()))?;
    let filename = filename.unwrap_or_else(|| "upload.bin".to_string());

    let analysis_config = AnalysisConfig {
        analysis_depth: parse_depth(analysis_depth)?,
        translation_detail: parse_detail(translation_detail)?,
        provider_params: ProviderParams {
            provider_id: provider_id.unwrap_or_else(|| "openai".to_string()),
            model,
            endpoint_url,
            api_key,
        },
        timeout_seconds: runtime.config.analysis_timeout_seconds,
    };

    let size_bytes = bytes.len() as u64;
    let job = jobs::submit(
        &runtime,
        SubmitRequest {
            filename: filename.clone(),
            bytes,
            analysis_config: analysis_config.clone(),
            priority,
            submitted_by: Some(identity.key_id.clone()),
            correlation_id: None,
        },
    )
    .await?;

    let status = match job.status {
        JobStatus::Completed => "completed",
        _ => "queued",
    };

    Ok((
        axum::http::StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id: job.id,
            status,
            file_info: FileInfoEcho { filename, size_bytes, content_type },
            config: serde_json::json!({
                "analysis_depth": analysis_config.analysis_depth,
                "translation_detail": analysis_config.translation_detail,
                "provider_params": analysis_config.provider_params.redacted(),
                "timeout_seconds": analysis_config.timeout_seconds,
            }),
            check_status_url: format!("/decompile/{}", job.id),
        }),
    ))
}

async fn field_text(field: axum::extract::multipart::Field<'_>) -> AppResult<String> {
    field
        .text()
        .await
        .map_err(|e| AppError::InvalidRequest(format!("reading form field: {e}")))
}

#[derive(Debug, Serialize)]
struct JobStatusResponse {
    #[serde(flatten)]
    job: Job,
    result: Option<serde_json::Value>,
}

/// `GET /decompile/{id}` — status, and the merged result document once terminal.
async fn get_decompile(
    State(runtime): State<JobRuntime>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<JobStatusResponse>> {
    let job = runtime.store.get_job(id).await?;
    let result = match &job.result_reference {
        Some(reference) => {
            let handle = crate::storage::blobs::BlobHandle(reference.clone());
            let bytes = runtime.blobs.get_blob(&handle).await?;
            Some(
                serde_json::from_slice(&bytes)
                    .map_err(|e| AppError::Internal(anyhow::anyhow!("corrupt result blob: {e}")))?,
            )
        }
        None => None,
    };
    Ok(Json(JobStatusResponse { job, result }))
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    job_id: Uuid,
    cancelled: bool,
}

/// `DELETE /decompile/{id}` — cancel. Applies immediately for `pending`
/// jobs; sets a flag a worker observes at its next checkpoint for
/// `in_progress` jobs (spec.md §4.7 "Cancellation").
async fn cancel_decompile(
    State(runtime): State<JobRuntime>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<CancelResponse>> {
    let cancelled = runtime.store.cancel_job(id).await?;
    Ok(Json(CancelResponse { job_id: id, cancelled }))
}

#[derive(Debug, Serialize)]
struct SmokeResponse {
    ok: bool,
    message: &'static str,
}

async fn smoke_test() -> Json<SmokeResponse> {
    Json(SmokeResponse { ok: true, message: "decompile service reachable" })
}

/// Permission split per spec.md §4.8: submitting and cancelling are write
/// operations, reading status/results only needs read, the smoke endpoint
/// needs nothing. Two method routers sharing `/decompile/{id}` are built
/// separately and merged so each can carry its own permission layer — a
/// single `.route_layer` call applies to every route registered before it,
/// which would conflate the two permissions if GET and DELETE sat on the
/// same router.
pub fn create_decompile_router(runtime: JobRuntime) -> Router<JobRuntime> {
    let write_routes = Router::new()
        .route("/decompile", post(submit_decompile))
        .route("/decompile/{id}", axum::routing::delete(cancel_decompile))
        .route_layer(axum::middleware::from_fn_with_state(runtime.clone(), auth_middleware::require_write));

    let read_routes = Router::new()
        .route("/decompile/{id}", get(get_decompile))
        .route_layer(axum::middleware::from_fn_with_state(runtime.clone(), auth_middleware::require_read));

    write_routes.merge(read_routes).route("/decompile/test", get(smoke_test))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_filename_strips_path_components() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\Users\\a\\evil.exe"), "evil.exe");
        assert_eq!(sanitize_filename("plain.bin"), "plain.bin");
    }

    #[test]
    fn parse_depth_rejects_unknown_values() {
        assert!(parse_depth(Some("basic".to_string())).is_ok());
        assert!(parse_depth(Some("nonsense".to_string())).is_err());
        assert!(matches!(parse_depth(None), Ok(AnalysisDepth::Standard)));
    }
}
