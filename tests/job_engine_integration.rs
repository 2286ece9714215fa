//! Integration tests for job submission, caching, and concurrent dequeue.
//!
//! Requires: `DATABASE_URL` pointing at a scratch Postgres with this
//! crate's migrations applied (matching `lock_contention_integration.rs`'s
//! `get_test_pool` convention in the teacher repo).

use std::sync::Arc;

use bintranslate::breaker::CircuitBreaker;
use bintranslate::config::Config;
use bintranslate::jobs::{self, JobRuntime, SubmitRequest};
use bintranslate::providers::registry::Registry;
use bintranslate::storage::blobs::BlobStore;
use bintranslate::storage::db::Store;
use bintranslate::storage::models::{AnalysisConfig, AnalysisDepth, Priority, ProviderParams, TranslationDetail};

async fn test_runtime() -> JobRuntime {
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");
    let store = Store::connect(&database_url).await.expect("failed to connect to test database");
    store.migrate().await.expect("failed to run migrations");

    // `.into_path()` hands ownership of the directory to the OS temp-dir
    // cleanup convention instead of deleting it on drop, since the
    // returned `JobRuntime` must outlive this function.
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

    JobRuntime {
        store,
        blobs,
        registry: Arc::new(Registry::new(&config)),
        breaker: Arc::new(CircuitBreaker::new(config.circuit_breaker.clone())),
        config,
    }
}

fn basic_config() -> AnalysisConfig {
    AnalysisConfig {
        analysis_depth: AnalysisDepth::Basic,
        translation_detail: TranslationDetail::Basic,
        provider_params: ProviderParams { provider_id: "local".to_string(), model: None, endpoint_url: Some("http://127.0.0.1:0".to_string()), api_key: None },
        timeout_seconds: 60,
    }
}

#[tokio::test]
async fn duplicate_submission_is_served_from_cache() {
    let runtime = test_runtime().await;
    let bytes = format!("MZ-fixture-{}", uuid::Uuid::new_v4()).into_bytes();

    let first = jobs::submit(
        &runtime,
        SubmitRequest { filename: "a.bin".to_string(), bytes: bytes.clone(), analysis_config: basic_config(), priority: Priority::Normal, submitted_by: None, correlation_id: None },
    )
    .await
    .expect("first submission should succeed");

    // Manually complete the job and populate the cache entry, simulating a
    // worker run without needing a live disassembler binary in CI.
    runtime.store.complete_job(first.id, "result/fixture", 10, 20, 0.01).await.expect("completing job failed");
    let cache_entry = bintranslate::storage::models::CacheEntry {
        cache_key: format!("{}:{}", first.file_hash, basic_config().canonical()),
        file_path: "result/fixture".to_string(),
        expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
        last_accessed: chrono::Utc::now(),
        access_count: 1,
        tags: Vec::new(),
        data_size_bytes: 4,
    };
    runtime.store.upsert_cache_entry(&cache_entry).await.expect("seeding cache entry failed");

    let second = jobs::submit(
        &runtime,
        SubmitRequest { filename: "a.bin".to_string(), bytes, analysis_config: basic_config(), priority: Priority::Normal, submitted_by: None, correlation_id: None },
    )
    .await
    .expect("second submission should succeed");

    assert_eq!(second.status, bintranslate::storage::models::JobStatus::Completed);
    assert_eq!(second.result_reference.as_deref(), Some("result/fixture"));

    let entry = runtime.store.find_cache_entry(&cache_entry.cache_key).await.expect("lookup failed").expect("cache entry should exist");
    assert!(entry.access_count >= 2, "duplicate submission should touch the cache entry's access_count");
}

#[tokio::test]
async fn empty_upload_is_rejected() {
    let runtime = test_runtime().await;
    let result = jobs::submit(
        &runtime,
        SubmitRequest { filename: "empty.bin".to_string(), bytes: Vec::new(), analysis_config: basic_config(), priority: Priority::Normal, submitted_by: None, correlation_id: None },
    )
    .await;
    assert!(matches!(result, Err(bintranslate::AppError::InvalidRequest(_))));
}

#[tokio::test]
async fn oversized_upload_is_rejected_with_413() {
    let mut runtime = test_runtime().await;
    if let Some(c) = Arc::get_mut(&mut runtime.config) {
        c.max_file_size_mb = 0;
    }
    // max_file_size_bytes() is now 0, so any non-empty upload exceeds it.
    let result = jobs::submit(
        &runtime,
        SubmitRequest { filename: "big.bin".to_string(), bytes: vec![0u8; 1], analysis_config: basic_config(), priority: Priority::Normal, submitted_by: None, correlation_id: None },
    )
    .await;
    assert!(matches!(result, Err(bintranslate::AppError::PayloadTooLarge)));
}

/// Invariant 3 (spec.md §8): with N workers racing `dequeue_next_job`
/// against M pending jobs, exactly min(N, M) calls return `Some` and no
/// job is returned twice.
#[tokio::test]
async fn concurrent_dequeue_hands_each_job_to_exactly_one_worker() {
    let runtime = test_runtime().await;
    let job_count = 5;
    let mut job_ids = Vec::with_capacity(job_count);
    for i in 0..job_count {
        let bytes = format!("fixture-{}-{}", uuid::Uuid::new_v4(), i).into_bytes();
        let job = jobs::submit(
            &runtime,
            SubmitRequest { filename: format!("f{i}.bin"), bytes, analysis_config: basic_config(), priority: Priority::Normal, submitted_by: None, correlation_id: None },
        )
        .await
        .expect("submission should succeed");
        job_ids.push(job.id);
    }

    let worker_count = 8;
    let mut handles = Vec::with_capacity(worker_count);
    for w in 0..worker_count {
        let store = runtime.store.clone();
        handles.push(tokio::spawn(async move { store.dequeue_next_job(&format!("test-worker-{w}")).await }));
    }

    let mut dequeued = Vec::new();
    for handle in handles {
        if let Ok(Ok(Some(job))) = handle.await {
            dequeued.push(job.id);
        }
    }

    assert_eq!(dequeued.len(), job_count, "exactly min(N, M) workers should receive a job");
    let mut unique = dequeued.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), dequeued.len(), "no job should be dequeued twice");
    for id in &job_ids {
        assert!(dequeued.contains(id), "every submitted job should eventually be dequeued");
    }
}
