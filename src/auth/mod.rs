//! C9 — API-key auth & admin primitives (spec.md §4.9).
//!
//! Bearer tokens are opaque random strings; only `sha256(salt || token)`
//! is ever stored or logged. Mirrors the teacher's bearer-extraction
//! helper in `api/client_auth.rs`, generalized from a single
//! base64-encoded client id to hashed, permissioned API keys.

use chrono::Utc;
use rand::RngCore;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::storage::db::Store;
use crate::storage::models::{validate_identifier, ApiKey, ApiKeyStatus, ApiKeyTier, Permission};

/// Minimum entropy required of a bearer token, in bytes (spec.md §4.9).
const TOKEN_BYTES: usize = 32;

pub fn hash_key(raw_key: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(raw_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generate a new opaque bearer token. Returns `(key_id, raw_token)` —
/// the raw token is shown to the caller exactly once and never stored.
pub fn generate_token() -> (String, String) {
    let key_id = Uuid::new_v4().to_string();
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    let raw_token = hex::encode(bytes);
    (key_id, raw_token)
}

pub fn extract_bearer_token(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

#[derive(Debug, Clone)]
pub struct AuthenticatedKey {
    pub key_id: String,
    pub user_id: String,
    pub tier: ApiKeyTier,
    pub permissions: Vec<Permission>,
}

impl AuthenticatedKey {
    pub fn has_permission(&self, required: Permission) -> bool {
        self.permissions.contains(&required)
    }
}

/// Resolve a bearer token to an [`AuthenticatedKey`], enforcing status
/// and expiry (request-pipeline steps 2–3 of spec.md §4.8).
pub async fn authenticate(store: &Store, salt: &str, raw_token: &str) -> AppResult<AuthenticatedKey> {
    let hash = hash_key(raw_token, salt);
    let key = store
        .find_api_key_by_hash(&hash)
        .await?
        .ok_or(AppError::Unauthorized)?;

    if key.status != ApiKeyStatus::Active {
        return Err(AppError::Unauthorized);
    }
    if let Some(expires_at) = key.expires_at {
        if expires_at <= Utc::now() {
            return Err(AppError::Unauthorized);
        }
    }

    let permissions = Permission::parse_set(&key.permissions)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("corrupt permission set for key {}: {e}", key.key_id)))?;

    store.touch_api_key_last_used(&key.key_id).await?;

    Ok(AuthenticatedKey { key_id: key.key_id, user_id: key.user_id, tier: key.tier, permissions })
}

/// Enforce a route's permission requirement as a set-contains check —
/// never as an "admin OR read" style conflation (spec.md §4.9 names
/// that conflation as a known defect to avoid).
pub fn require_permission(auth: &AuthenticatedKey, required: Permission) -> AppResult<()> {
    if auth.has_permission(required) {
        Ok(())
    } else {
        Err(AppError::Forbidden)
    }
}

pub struct NewApiKeyRequest {
    pub user_id: String,
    pub tier: ApiKeyTier,
    pub permissions: Vec<String>,
    pub expires_at: Option<chrono::DateTime<Utc>>,
}

/// Create and persist a new API key, returning the raw token exactly once.
pub async fn create_api_key(store: &Store, salt: &str, request: NewApiKeyRequest) -> AppResult<(ApiKey, String)> {
    validate_identifier(&request.user_id).map_err(AppError::ValidationError)?;
    let permissions = Permission::parse_set(&request.permissions).map_err(AppError::ValidationError)?;
    let _ = permissions;

    let (key_id, raw_token) = generate_token();
    validate_identifier(&key_id).map_err(AppError::ValidationError)?;
    let key_hash = hash_key(&raw_token, salt);

    let key = ApiKey {
        key_id,
        key_hash,
        user_id: request.user_id,
        tier: request.tier,
        permissions: request.permissions,
        status: ApiKeyStatus::Active,
        expires_at: request.expires_at,
        created_at: Utc::now(),
        last_used_at: None,
    };
    store.insert_api_key(&key).await?;
    Ok((key, raw_token))
}

/// One-shot bootstrap admin creation (spec.md §4.9 "Bootstrap: one-shot;
/// subsequent calls return 403"). Callers must check `any_admin_exists`
/// themselves and reject with `Forbidden` before calling this — kept as
/// a separate step so the check and the insert can be wrapped by a
/// caller-chosen transaction boundary if ever needed.
pub async fn bootstrap_admin(store: &Store, salt: &str, user_id: &str) -> AppResult<(ApiKey, String)> {
    if store.any_admin_exists().await? {
        return Err(AppError::Forbidden);
    }
    create_api_key(
        store,
        salt,
        NewApiKeyRequest {
            user_id: user_id.to_string(),
            tier: ApiKeyTier::Enterprise,
            permissions: vec!["read".to_string(), "write".to_string(), "admin".to_string()],
            expires_at: None,
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_and_salt_sensitive() {
        let a = hash_key("token", "salt-a");
        let b = hash_key("token", "salt-a");
        let c = hash_key("token", "salt-b");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn generated_tokens_are_unique_and_long_enough() {
        let (_, t1) = generate_token();
        let (_, t2) = generate_token();
        assert_ne!(t1, t2);
        assert!(t1.len() >= TOKEN_BYTES * 2);
    }

    #[test]
    fn permission_check_is_set_contains_not_admin_or_read() {
        let auth = AuthenticatedKey {
            key_id: "k1".to_string(),
            user_id: "u1".to_string(),
            tier: ApiKeyTier::Basic,
            permissions: vec![Permission::Read],
        };
        assert!(require_permission(&auth, Permission::Read).is_ok());
        assert!(require_permission(&auth, Permission::Admin).is_err());
    }
}
