//! HTTP-level integration tests exercising the full router through a single
//! in-process `tower::ServiceExt::oneshot` call, same pattern as the
//! teacher's `tests/chat_verb_profiles_integration.rs` (`build_test_app()` +
//! `.oneshot(req)` against a real database).
//!
//! Requires: `DATABASE_URL` pointing at a scratch Postgres with this
//! crate's migrations applied.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use bintranslate::breaker::CircuitBreaker;
use bintranslate::config::Config;
use bintranslate::jobs::JobRuntime;
use bintranslate::providers::registry::Registry;
use bintranslate::storage::blobs::BlobStore;
use bintranslate::storage::db::Store;

async fn build_test_app() -> Router {
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");
    let store = Store::connect(&database_url).await.expect("failed to connect to test database");
    store.migrate().await.expect("failed to run migrations");

    let tmp_dir = tempfile::tempdir().expect("failed to create scratch dir").into_path();
    let blobs = BlobStore::new(tmp_dir);

    let config = Arc::new(Config {
        database_url,
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        max_file_size_mb: 100,
        analysis_timeout_seconds: 120,
        disassembler_step_timeout_seconds: 10,
        result_ttl_hours: 24,
        upload_ttl_seconds: 3600,
        worker_count: 1,
        translation_concurrency: 2,
        stale_lease_seconds: 5,
        heartbeat_interval_seconds: 1,
        retry_cap: 3,
        rate_limits: Default::default(),
        global_rate_limit: bintranslate::config::RateLimitTier { window_seconds: 60, max_requests: 10_000 },
        circuit_breaker: Default::default(),
        storage_root_dir: "./data".into(),
        api_key_salt: "test-salt".to_string(),
        provider_defaults: Default::default(),
        max_strings_standard: 200,
        max_strings_comprehensive: 1000,
        disassembler_bin: "r2".to_string(),
    });

    let runtime = JobRuntime {
        store,
        blobs,
        registry: Arc::new(Registry::new(&config)),
        breaker: Arc::new(CircuitBreaker::new(config.circuit_breaker.clone())),
        config,
    };

    bintranslate::api::build_router(runtime)
}

#[tokio::test]
async fn health_liveness_requires_no_auth() {
    let app = build_test_app().await;
    let response = app
        .oneshot(Request::builder().uri("/health/live").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn decompile_routes_reject_requests_with_no_bearer_token() {
    let app = build_test_app().await;
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/decompile")
                .header("content-type", "multipart/form-data; boundary=X")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn submit_then_fetch_status_round_trip() {
    let app = build_test_app().await;

    // bootstrap_admin is the one-shot path to a usable bearer token in an
    // otherwise-empty keys table, same as standing up the first admin in a
    // fresh deployment (spec.md §4.9).
    let user_id = format!("itest-{}", uuid::Uuid::new_v4());
    let bootstrap_body = serde_json::json!({ "user_id": user_id }).to_string();
    let bootstrap_response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/admin/bootstrap/create-admin")
                .header("content-type", "application/json")
                .body(Body::from(bootstrap_body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(bootstrap_response.status(), StatusCode::CREATED);
    let bootstrap_bytes = axum::body::to_bytes(bootstrap_response.into_body(), usize::MAX).await.unwrap();
    let bootstrap_json: Value = serde_json::from_slice(&bootstrap_bytes).unwrap();
    let token = bootstrap_json["token"].as_str().expect("bootstrap response should include a token");

    let boundary = "itest-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Disposition: form-data; name=\"file\"; filename=\"sample.bin\"\r\n");
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(format!("MZ-itest-{}", uuid::Uuid::new_v4()).as_bytes());
    body.extend_from_slice(format!("\r\n--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Disposition: form-data; name=\"llm_provider\"\r\n\r\n");
    body.extend_from_slice(b"local");
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    let submit_response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/decompile")
                .header("authorization", format!("Bearer {token}"))
                .header("content-type", format!("multipart/form-data; boundary={boundary}"))
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(submit_response.status(), StatusCode::ACCEPTED);
    let submit_bytes = axum::body::to_bytes(submit_response.into_body(), usize::MAX).await.unwrap();
    let submit_json: Value = serde_json::from_slice(&submit_bytes).unwrap();
    let job_id = submit_json["job_id"].as_str().expect("submit response should include a job_id");

    let status_response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/decompile/{job_id}"))
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(status_response.status(), StatusCode::OK);
    let status_bytes = axum::body::to_bytes(status_response.into_body(), usize::MAX).await.unwrap();
    let status_json: Value = serde_json::from_slice(&status_bytes).unwrap();
    assert_eq!(status_json["id"].as_str(), Some(job_id));
}
