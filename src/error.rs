//! Error taxonomy, mirroring spec.md §7.
//!
//! Component-level errors (`DisasmError`, `ProviderError`, `StoreError`)
//! are typed with `thiserror`, the way the teacher's `AiError` is defined
//! in `ai/mod.rs`. `AppError` is the surface-level kind the HTTP layer
//! maps to a status code; everything below it converts via `#[from]`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("tool failure: {0}")]
    ToolFailure(String),

    #[error("provider failure: {0}")]
    ProviderFailure(String),

    #[error("circuit open for provider key {0}")]
    CircuitOpen(String),

    #[error("rate limited, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    #[error("job deadline exceeded")]
    Timeout,

    #[error("worker lost, retry cap reached")]
    WorkerLost,

    #[error("cancelled")]
    Cancelled,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("unsupported media type")]
    UnsupportedMediaType,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Machine-readable kind, per spec.md §7's taxonomy.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::InvalidRequest(_) => "invalid_request",
            AppError::ValidationError(_) => "validation_error",
            AppError::UnsupportedFormat(_) => "unsupported_format",
            AppError::ToolFailure(_) => "tool_failure",
            AppError::ProviderFailure(_) => "provider_failure",
            AppError::CircuitOpen(_) => "circuit_open",
            AppError::RateLimited { .. } => "rate_limited",
            AppError::Timeout => "timeout",
            AppError::WorkerLost => "worker_lost",
            AppError::Cancelled => "cancelled",
            AppError::NotFound(_) => "not_found",
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden => "forbidden",
            AppError::Conflict(_) => "conflict",
            AppError::PayloadTooLarge => "payload_too_large",
            AppError::UnsupportedMediaType => "unsupported_media_type",
            AppError::Internal(_) => "internal_error",
            AppError::Database(_) => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::UnsupportedFormat(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::ToolFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::ProviderFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Timeout => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::WorkerLost => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Cancelled => StatusCode::CONFLICT,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    detail: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(kind = self.kind(), error = %self, "request failed");
        } else {
            tracing::warn!(kind = self.kind(), error = %self, "request rejected");
        }
        let mut response = (
            status,
            Json(ErrorBody {
                error: self.kind(),
                detail: self.to_string(),
            }),
        )
            .into_response();
        if let AppError::RateLimited { retry_after_seconds } = self {
            response
                .headers_mut()
                .insert("Retry-After", retry_after_seconds.to_string().parse().unwrap());
        }
        response
    }
}
