//! Integration tests for job lifecycle invariants that don't need a live
//! disassembler binary or LLM provider: cancellation semantics, terminal
//! timestamp ordering, and crash-recovery lease reclaim.
//!
//! Requires: `DATABASE_URL` pointing at a scratch Postgres with this
//! crate's migrations applied.

use uuid::Uuid;

use bintranslate::storage::db::Store;
use bintranslate::storage::models::{AnalysisConfig, AnalysisDepth, Job, JobStatus, Priority, ProviderParams, TranslationDetail};

async fn test_store() -> Store {
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");
    let store = Store::connect(&database_url).await.expect("failed to connect to test database");
    store.migrate().await.expect("failed to run migrations");
    store
}

fn new_job_with_priority(status: JobStatus, priority: Priority) -> Job {
    let mut job = new_job(status);
    job.priority = priority;
    job
}

fn new_job(status: JobStatus) -> Job {
    let now = chrono::Utc::now();
    let config = AnalysisConfig {
        analysis_depth: AnalysisDepth::Basic,
        translation_detail: TranslationDetail::Basic,
        provider_params: ProviderParams { provider_id: "local".to_string(), model: None, endpoint_url: None, api_key: None },
        timeout_seconds: 60,
    };
    Job {
        id: Uuid::new_v4(),
        status,
        priority: Priority::Normal,
        file_hash: format!("hash-{}", Uuid::new_v4()),
        filename: "fixture.bin".to_string(),
        file_reference: "upload/fixture".to_string(),
        analysis_config: serde_json::to_value(&config).unwrap(),
        result_reference: None,
        error_message: None,
        progress_percentage: 0,
        current_stage: "queued".to_string(),
        worker_id: None,
        created_at: now,
        started_at: None,
        updated_at: now,
        completed_at: None,
        submitted_by: None,
        correlation_id: None,
        processing_time_seconds: None,
        estimated_completion_seconds: None,
        retry_count: 0,
        tokens_in: 0,
        tokens_out: 0,
        estimated_cost: 0.0,
    }
}

/// `pending` jobs cancel immediately (spec.md §4.7 "Cancellation").
#[tokio::test]
async fn cancelling_a_pending_job_applies_immediately() {
    let store = test_store().await;
    let job = new_job(JobStatus::Pending);
    store.insert_job(&job).await.expect("insert failed");

    let cancelled = store.cancel_job(job.id).await.expect("cancel call failed");
    assert!(cancelled);

    let reloaded = store.get_job(job.id).await.expect("fetch failed");
    assert_eq!(reloaded.status, JobStatus::Cancelled);
}

/// `in_progress` jobs only have a flag set; the worker observes it at its
/// next checkpoint via `is_cancel_requested` rather than transitioning
/// immediately (spec.md §4.7).
#[tokio::test]
async fn cancelling_an_in_progress_job_sets_a_flag_instead_of_transitioning_immediately() {
    let store = test_store().await;
    let mut job = new_job(JobStatus::InProgress);
    job.worker_id = Some("test-worker".to_string());
    job.started_at = Some(job.created_at);
    store.insert_job(&job).await.expect("insert failed");

    let cancelled = store.cancel_job(job.id).await.expect("cancel call failed");
    assert!(cancelled);

    let reloaded = store.get_job(job.id).await.expect("fetch failed");
    assert_eq!(reloaded.status, JobStatus::InProgress, "status should not change until the worker checkpoints");
    assert!(store.is_cancel_requested(job.id).await.expect("flag read failed"));

    store.finalize_cancelled(job.id).await.expect("finalize failed");
    let finalized = store.get_job(job.id).await.expect("fetch failed");
    assert_eq!(finalized.status, JobStatus::Cancelled);
    assert!(finalized.completed_at.is_some());
}

/// Cancelling an already-terminal job is a no-op (no matching row to update).
#[tokio::test]
async fn cancelling_a_completed_job_is_a_no_op() {
    let store = test_store().await;
    let job = new_job(JobStatus::Pending);
    store.insert_job(&job).await.expect("insert failed");
    store.complete_job(job.id, "result/fixture", 1, 1, 0.0).await.expect("complete failed");

    let cancelled = store.cancel_job(job.id).await.expect("cancel call failed");
    assert!(!cancelled);

    let reloaded = store.get_job(job.id).await.expect("fetch failed");
    assert_eq!(reloaded.status, JobStatus::Completed);
}

/// Invariant 1 (spec.md §8): for a terminal job,
/// `completed_at >= started_at >= created_at`.
#[tokio::test]
async fn completed_job_timestamps_are_monotonic() {
    let store = test_store().await;
    let job = new_job(JobStatus::Pending);
    store.insert_job(&job).await.expect("insert failed");

    // Dequeue by id rather than trusting priority/FIFO ordering against a
    // shared table that other tests in this run may also have populated.
    let leased = loop {
        let candidate = store.dequeue_next_job("test-worker").await.expect("dequeue failed").expect("job should be dequeued");
        if candidate.id == job.id {
            break candidate;
        }
    };
    assert!(leased.started_at.unwrap() >= leased.created_at);

    store.complete_job(leased.id, "result/fixture", 1, 1, 0.0).await.expect("complete failed");
    let completed = store.get_job(leased.id).await.expect("fetch failed");
    assert!(completed.started_at.unwrap() >= completed.created_at);
    assert!(completed.completed_at.unwrap() >= completed.started_at.unwrap());
}

/// Invariant 2 (spec.md §8): at most one worker holds a job's lease at a
/// time — leasing an already-`in_progress` job is impossible through
/// `dequeue_next_job` since it only selects `status = 'pending'` rows.
#[tokio::test]
async fn in_progress_jobs_are_never_redequeued() {
    let store = test_store().await;
    let job = new_job(JobStatus::Pending);
    store.insert_job(&job).await.expect("insert failed");

    let first = store.dequeue_next_job("worker-a").await.expect("dequeue failed");
    assert!(first.is_some());

    let second = store.dequeue_next_job("worker-b").await.expect("dequeue failed");
    assert!(second.is_none(), "an in_progress job must not be handed out again");
}

/// Crash recovery (spec.md §5 "Crash safety"): a stale `in_progress` lease
/// under the retry cap is requeued to `pending`; one at the cap is failed
/// with `worker_lost`.
#[tokio::test]
async fn stale_lease_reclaim_requeues_under_cap_and_fails_at_cap() {
    let store = test_store().await;

    let mut under_cap = new_job(JobStatus::InProgress);
    under_cap.worker_id = Some("dead-worker".to_string());
    under_cap.started_at = Some(under_cap.created_at);
    under_cap.retry_count = 0;
    store.insert_job(&under_cap).await.expect("insert failed");

    let mut at_cap = new_job(JobStatus::InProgress);
    at_cap.worker_id = Some("dead-worker".to_string());
    at_cap.started_at = Some(at_cap.created_at);
    at_cap.retry_count = 3;
    store.insert_job(&at_cap).await.expect("insert failed");

    // Both jobs' `updated_at` is "now" from insertion, so a 0-second
    // staleness window treats them as immediately stale without needing
    // to sleep in the test.
    let (requeued, failed) = store.reclaim_stale_leases(0, 3).await.expect("reclaim failed");

    assert!(requeued.contains(&under_cap.id));
    assert!(failed.contains(&at_cap.id));

    let reloaded_under_cap = store.get_job(under_cap.id).await.expect("fetch failed");
    assert_eq!(reloaded_under_cap.status, JobStatus::Pending);
    assert_eq!(reloaded_under_cap.retry_count, 1);
    assert!(reloaded_under_cap.worker_id.is_none());

    let reloaded_at_cap = store.get_job(at_cap.id).await.expect("fetch failed");
    assert_eq!(reloaded_at_cap.status, JobStatus::Failed);
    assert_eq!(reloaded_at_cap.error_message.as_deref(), Some("worker_lost"));
}
