//! Row types for the structured store, matching spec.md §3.
//!
//! Styled after `database/session_repository.rs`: `sqlx::Type` enums with
//! explicit `VARCHAR` mapping, `chrono::DateTime<Utc>` timestamps, `Uuid`
//! primary keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    // Order matters: derives Ord so urgent sorts first (§4.7 priority order).
    Urgent,
    High,
    Normal,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AnalysisDepth {
    Basic,
    Standard,
    Comprehensive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TranslationDetail {
    Basic,
    Standard,
    Detailed,
}

/// Provider construction parameters, supplied by the request (spec.md §4.3).
/// Never logged with `api_key` populated — see `ProviderParams::redacted`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderParams {
    pub provider_id: String,
    pub model: Option<String>,
    pub endpoint_url: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl ProviderParams {
    pub fn redacted(&self) -> serde_json::Value {
        serde_json::json!({
            "provider_id": self.provider_id,
            "model": self.model,
            "endpoint_url": self.endpoint_url,
            "api_key": self.api_key.as_ref().map(|_| "***redacted***"),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub analysis_depth: AnalysisDepth,
    pub translation_detail: TranslationDetail,
    pub provider_params: ProviderParams,
    pub timeout_seconds: u64,
}

impl AnalysisConfig {
    /// Stable serialization used as the cache key input — field order is
    /// fixed by `serde_json`'s struct-field order, so round-tripping
    /// through `serde_json::to_string`/`from_str` always yields the same
    /// bytes (spec.md §8 "canonicalization is stable").
    pub fn canonical(&self) -> String {
        serde_json::to_string(self).expect("AnalysisConfig always serializes")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub priority: Priority,
    pub file_hash: String,
    pub filename: String,
    pub file_reference: String,
    pub analysis_config: serde_json::Value,
    pub result_reference: Option<String>,
    pub error_message: Option<String>,
    pub progress_percentage: i32,
    pub current_stage: String,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub submitted_by: Option<String>,
    pub correlation_id: Option<String>,
    pub processing_time_seconds: Option<f64>,
    pub estimated_completion_seconds: Option<f64>,
    pub retry_count: i32,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub estimated_cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CacheEntry {
    pub cache_key: String,
    pub file_path: String,
    pub expires_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: i64,
    pub tags: Vec<String>,
    pub data_size_bytes: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyTier {
    Basic,
    Standard,
    Premium,
    Enterprise,
}

impl ApiKeyTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiKeyTier::Basic => "basic",
            ApiKeyTier::Standard => "standard",
            ApiKeyTier::Premium => "premium",
            ApiKeyTier::Enterprise => "enterprise",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyStatus {
    Active,
    Revoked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    Read,
    Write,
    Admin,
}

impl Permission {
    pub fn parse_set(values: &[String]) -> Result<Vec<Permission>, String> {
        values
            .iter()
            .map(|v| match v.as_str() {
                "read" => Ok(Permission::Read),
                "write" => Ok(Permission::Write),
                "admin" => Ok(Permission::Admin),
                other => Err(format!("unknown permission: {other}")),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ApiKey {
    pub key_id: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub user_id: String,
    pub tier: ApiKeyTier,
    pub permissions: Vec<String>,
    pub status: ApiKeyStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitBucket {
    pub scope: String,
    pub identifier: String,
    pub window_start: DateTime<Utc>,
    pub request_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub last_heartbeat: DateTime<Utc>,
    pub current_job_id: Option<Uuid>,
}

/// Temporary upload metadata, kept only so blob GC and admin listings can
/// see which uploads are still within their TTL without scanning the
/// filesystem (spec.md §3 "Session / UploadSession").
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UploadSession {
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// A standing condition the admin surface surfaces (e.g. a provider's
/// circuit breaker open, a stale worker). Not tied 1:1 to any component —
/// `condition_key` identifies the underlying check so repeated evaluation
/// updates the same row instead of duplicating it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Alert {
    pub id: Uuid,
    pub severity: AlertSeverity,
    pub message: String,
    pub condition_key: String,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Identifier whitelist from spec.md §3 / §9: no path separators, dots, or
/// whitespace. Applied to `user_id` and `key_id`.
pub fn validate_identifier(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err("identifier must not be empty".to_string());
    }
    let forbidden = ['/', '\\', '.', ':', ' ', '\t', '\n', '\r'];
    if value.chars().any(|c| forbidden.contains(&c)) {
        return Err(format!("identifier '{value}' contains a forbidden character"));
    }
    Ok(())
}
