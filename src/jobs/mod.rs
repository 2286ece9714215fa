//! C7 — job submission, worker execution loop, crash recovery (spec.md §4.7).
//!
//! The worker loop's poll-then-sleep-or-shutdown shape mirrors the
//! teacher's `bpmn_integration::PendingDispatchWorker`: no sleep between
//! consecutive successful dequeues, a short sleep when the queue is
//! empty, and a `watch::Receiver<bool>` for cooperative shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::breaker::CircuitBreaker;
use crate::config::Config;
use crate::disasm::adapter::{AdapterConfig, DisasmAdapter};
use crate::disasm::types::Disassembly;
use crate::error::{AppError, AppResult};
use crate::orchestrator::{self, OrchestratorConfig, OrchestratorError, TranslatedResult};
use crate::providers::tokio_util_cancel::CancelToken;
use crate::providers::registry::Registry;
use crate::storage::blobs::{BlobHandle, BlobKind, BlobStore};
use crate::storage::db::Store;
use crate::storage::models::{AnalysisConfig, CacheEntry, Job, JobStatus, Priority};

/// Everything a submit call or a worker needs to act on a job, bundled
/// so `main` only has to construct it once and hand out clones.
#[derive(Clone)]
pub struct JobRuntime {
    pub store: Store,
    pub blobs: BlobStore,
    pub registry: Arc<Registry>,
    pub breaker: Arc<CircuitBreaker>,
    pub config: Arc<Config>,
}

pub struct SubmitRequest {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub analysis_config: AnalysisConfig,
    pub priority: Priority,
    pub submitted_by: Option<String>,
    pub correlation_id: Option<String>,
}

fn cache_key_for(file_hash: &str, config: &AnalysisConfig) -> String {
    format!("{file_hash}:{}", config.canonical())
}

/// Submit a new decompilation job (spec.md §4.7 "Submission"). On a cache
/// hit the returned job is already `completed`.
pub async fn submit(runtime: &JobRuntime, request: SubmitRequest) -> AppResult<Job> {
    if request.bytes.len() as u64 > runtime.config.max_file_size_bytes() {
        return Err(AppError::PayloadTooLarge);
    }
    if request.bytes.is_empty() {
        return Err(AppError::InvalidRequest("uploaded file is empty".to_string()));
    }

    let (handle, _size, file_hash) = runtime.blobs.put_blob(BlobKind::Upload, &request.bytes).await?;
    let now = Utc::now();
    let cache_key = cache_key_for(&file_hash, &request.analysis_config);

    if let Some(entry) = runtime.store.find_cache_entry(&cache_key).await? {
        runtime.store.touch_cache_entry(&cache_key).await?;
        runtime.blobs.delete_blob(&handle).await.ok();

        let job = Job {
            id: Uuid::new_v4(),
            status: JobStatus::Completed,
            priority: request.priority,
            file_hash,
            filename: request.filename,
            file_reference: handle.to_string(),
            analysis_config: serde_json::to_value(&request.analysis_config)
                .map_err(|e| AppError::Internal(anyhow::anyhow!("serializing analysis_config: {e}")))?,
            result_reference: Some(entry.file_path),
            error_message: None,
            progress_percentage: 100,
            current_stage: "completed".to_string(),
            worker_id: None,
            created_at: now,
            started_at: Some(now),
            updated_at: now,
            completed_at: Some(now),
            submitted_by: request.submitted_by,
            correlation_id: request.correlation_id,
            processing_time_seconds: Some(0.0),
            estimated_completion_seconds: Some(0.0),
            retry_count: 0,
            tokens_in: 0,
            tokens_out: 0,
            estimated_cost: 0.0,
        };
        runtime.store.insert_job(&job).await?;
        tracing::info!(job_id = %job.id, cache_key, "job satisfied from cache");
        return Ok(job);
    }

    let job = Job {
        id: Uuid::new_v4(),
        status: JobStatus::Pending,
        priority: request.priority,
        file_hash,
        filename: request.filename,
        file_reference: handle.to_string(),
        analysis_config: serde_json::to_value(&request.analysis_config)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("serializing analysis_config: {e}")))?,
        result_reference: None,
        error_message: None,
        progress_percentage: 0,
        current_stage: "queued".to_string(),
        worker_id: None,
        created_at: now,
        started_at: None,
        updated_at: now,
        completed_at: None,
        submitted_by: request.submitted_by,
        correlation_id: request.correlation_id,
        processing_time_seconds: None,
        estimated_completion_seconds: None,
        retry_count: 0,
        tokens_in: 0,
        tokens_out: 0,
        estimated_cost: 0.0,
    };
    runtime.store.insert_job(&job).await?;
    Ok(job)
}

enum ProcessOutcome {
    Completed,
    Cancelled,
    Failed(String, Option<String>),
}

fn failed(message: impl Into<String>) -> ProcessOutcome {
    ProcessOutcome::Failed(message.into(), None)
}

pub struct Worker {
    id: String,
    runtime: JobRuntime,
    disasm: DisasmAdapter,
}

impl Worker {
    pub fn new(runtime: JobRuntime) -> Self {
        let id = format!("worker-{}", Uuid::new_v4());
        let disasm = DisasmAdapter::new(AdapterConfig {
            binary: runtime.config.disassembler_bin.clone(),
            step_timeout: runtime.config.disassembler_step_timeout(),
            cumulative_timeout: runtime.config.analysis_timeout(),
            max_strings_standard: runtime.config.max_strings_standard,
            max_strings_comprehensive: runtime.config.max_strings_comprehensive,
        });
        Self { id, runtime, disasm }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run until `shutdown_rx` reports `true`.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!(worker_id = %self.id, "worker started");
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            match self.runtime.store.dequeue_next_job(&self.id).await {
                Ok(Some(job)) => {
                    self.process_job(job).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => tracing::error!(worker_id = %self.id, error = %e, "dequeue failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                _ = shutdown_rx.changed() => break,
            }
        }
        tracing::info!(worker_id = %self.id, "worker stopped");
    }

    async fn process_job(&self, job: Job) {
        let job_id = job.id;
        let heartbeat = self.spawn_heartbeat(job_id);

        let outcome = self.process_job_inner(&job).await;
        heartbeat.abort();

        match outcome {
            ProcessOutcome::Completed => {
                tracing::info!(worker_id = %self.id, job_id = %job_id, "job completed");
            }
            ProcessOutcome::Cancelled => {
                if let Err(e) = self.runtime.store.finalize_cancelled(job_id).await {
                    tracing::error!(worker_id = %self.id, job_id = %job_id, error = %e, "failed to finalize cancellation");
                } else {
                    tracing::info!(worker_id = %self.id, job_id = %job_id, "job cancelled");
                }
            }
            ProcessOutcome::Failed(message, result_reference) => {
                tracing::warn!(worker_id = %self.id, job_id = %job_id, error = %message, "job failed");
                if let Err(e) = self.runtime.store.fail_job(job_id, &message, result_reference.as_deref()).await {
                    tracing::error!(worker_id = %self.id, job_id = %job_id, error = %e, "failed to record job failure");
                }
            }
        }
    }

    async fn process_job_inner(&self, job: &Job) -> ProcessOutcome {
        let analysis_config: AnalysisConfig = match serde_json::from_value(job.analysis_config.clone()) {
            Ok(c) => c,
            Err(e) => return failed(format!("corrupt analysis_config: {e}")),
        };

        if let Some(outcome) = self.check_cancelled(job.id).await {
            return outcome;
        }

        if let Err(e) = self.runtime.store.update_progress(job.id, 5, "fetching_upload").await {
            return failed(e.to_string());
        }

        let handle = BlobHandle(job.file_reference.clone());
        let bytes = match self.runtime.blobs.get_blob(&handle).await {
            Ok(b) => b,
            Err(e) => return failed(format!("fetching upload: {e}")),
        };

        let tmp_dir = self.runtime.config.storage_root_dir.join("tmp");
        if let Err(e) = tokio::fs::create_dir_all(&tmp_dir).await {
            return failed(format!("preparing scratch dir: {e}"));
        }
        let tmp_path = tmp_dir.join(format!("{}-{}", job.id, Uuid::new_v4()));
        if let Err(e) = tokio::fs::write(&tmp_path, &bytes).await {
            return failed(format!("writing scratch file: {e}"));
        }

        if let Err(e) = self.runtime.store.update_progress(job.id, 10, "disassembling").await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return failed(e.to_string());
        }

        let disassembly = self.disasm.disassemble(&tmp_path, analysis_config.analysis_depth).await;
        let _ = tokio::fs::remove_file(&tmp_path).await;

        let disassembly: Disassembly = match disassembly {
            Ok(d) => d,
            Err(e) => return failed(format!("disassembly failed: {e}")),
        };

        if let Some(outcome) = self.check_cancelled(job.id).await {
            return outcome;
        }
        if let Err(e) = self.runtime.store.update_progress(job.id, 60, "translating").await {
            return failed(e.to_string());
        }

        let (provider_key, provider) = match self.runtime.registry.build(&analysis_config.provider_params) {
            Ok(p) => p,
            Err(e) => return failed(format!("constructing provider: {e}")),
        };

        let cancel = CancelToken::new();
        let cancel_watch = self.spawn_cancel_watch(job.id, cancel.clone());

        // No dedicated provider-call-timeout key is recognized (spec.md §6);
        // reuse the configured step timeout as the bound for a single
        // external call, same as it bounds one disassembler subprocess step.
        let orch_config = OrchestratorConfig {
            concurrency: self.runtime.config.translation_concurrency,
            per_call_timeout: self.runtime.config.disassembler_step_timeout(),
        };

        let translated = orchestrator::translate(
            provider.clone(),
            &provider_key,
            &self.runtime.breaker,
            &disassembly,
            analysis_config.translation_detail,
            &orch_config,
            &cancel,
        )
        .await;
        cancel_watch.abort();

        let translated: TranslatedResult = match translated {
            Ok(t) => t,
            Err(OrchestratorError::Cancelled) => return ProcessOutcome::Cancelled,
            Err(OrchestratorError::BelowPartialFailureFloor(partial)) => {
                let message = "fewer than 50% of function translations succeeded and the overall summary also failed".to_string();
                let estimated_cost = estimate_cost(&provider, &partial);
                let result_document = build_result_document(job, &provider_key, &disassembly, &partial, estimated_cost);
                let result_reference = match serde_json::to_vec(&result_document) {
                    Ok(bytes) => match self.runtime.blobs.put_blob(BlobKind::Result, &bytes).await {
                        Ok((handle, ..)) => Some(handle.to_string()),
                        Err(e) => {
                            tracing::warn!(job_id = %job.id, error = %e, "failed to persist partial result blob");
                            None
                        }
                    },
                    Err(e) => {
                        tracing::warn!(job_id = %job.id, error = %e, "failed to serialize partial result");
                        None
                    }
                };
                return ProcessOutcome::Failed(message, result_reference);
            }
        };

        if let Some(outcome) = self.check_cancelled(job.id).await {
            return outcome;
        }
        if let Err(e) = self.runtime.store.update_progress(job.id, 95, "persisting_result").await {
            return failed(e.to_string());
        }

        let estimated_cost = estimate_cost(&provider, &translated);
        let result_document = build_result_document(job, &provider_key, &disassembly, &translated, estimated_cost);
        let result_bytes = match serde_json::to_vec(&result_document) {
            Ok(b) => b,
            Err(e) => return failed(format!("serializing result: {e}")),
        };

        let (result_handle, data_size, _hash) = match self.runtime.blobs.put_blob(BlobKind::Result, &result_bytes).await {
            Ok(h) => h,
            Err(e) => return failed(format!("persisting result blob: {e}")),
        };

        if let Err(e) = self
            .runtime
            .store
            .complete_job(
                job.id,
                &result_handle.to_string(),
                translated.totals.tokens_in as i64,
                translated.totals.tokens_out as i64,
                estimated_cost,
            )
            .await
        {
            return failed(e.to_string());
        }

        let cache_key = cache_key_for(&job.file_hash, &analysis_config);
        let cache_entry = CacheEntry {
            cache_key,
            file_path: result_handle.to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(self.runtime.config.result_ttl_hours as i64),
            last_accessed: Utc::now(),
            access_count: 1,
            tags: Vec::new(),
            data_size_bytes: data_size as i64,
        };
        if let Err(e) = self.runtime.store.upsert_cache_entry(&cache_entry).await {
            tracing::warn!(job_id = %job.id, error = %e, "failed to refresh cache entry after completing job");
        }

        self.runtime.blobs.delete_blob(&handle).await.ok();

        ProcessOutcome::Completed
    }

    async fn check_cancelled(&self, job_id: Uuid) -> Option<ProcessOutcome> {
        match self.runtime.store.is_cancel_requested(job_id).await {
            Ok(true) => Some(ProcessOutcome::Cancelled),
            Ok(false) => None,
            Err(e) => Some(failed(e.to_string())),
        }
    }

    fn spawn_heartbeat(&self, job_id: Uuid) -> tokio::task::JoinHandle<()> {
        let store = self.runtime.store.clone();
        let worker_id = self.id.clone();
        let interval = self.runtime.config.heartbeat_interval();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = store.touch_heartbeat(job_id).await {
                    tracing::warn!(job_id = %job_id, error = %e, "heartbeat update failed");
                }
                if let Err(e) = store.upsert_worker_heartbeat(&worker_id, Some(job_id)).await {
                    tracing::warn!(worker_id, error = %e, "worker heartbeat upsert failed");
                }
            }
        })
    }

    /// Polls `is_cancel_requested` so the orchestrator's cooperative
    /// cancellation token reflects a cancel request made mid-translation
    /// (spec.md §4.7 "workers check it at each checkpoint").
    fn spawn_cancel_watch(&self, job_id: Uuid, cancel: CancelToken) -> tokio::task::JoinHandle<()> {
        let store = self.runtime.store.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(2)).await;
                match store.is_cancel_requested(job_id).await {
                    Ok(true) => {
                        cancel.cancel();
                        break;
                    }
                    Ok(false) => {}
                    Err(_) => break,
                }
            }
        })
    }
}

fn estimate_cost(provider: &Arc<dyn crate::providers::Provider>, translated: &TranslatedResult) -> f64 {
    match provider.capabilities().cost_per_1k_tokens {
        Some(rate) => ((translated.totals.tokens_in + translated.totals.tokens_out) as f64 / 1000.0) * rate,
        None => 0.0,
    }
}

fn build_result_document(
    job: &Job,
    provider_key: &crate::providers::ProviderKey,
    disassembly: &Disassembly,
    translated: &TranslatedResult,
    estimated_cost: f64,
) -> serde_json::Value {
    serde_json::json!({
        "metadata": {
            "job_id": job.id,
            "created_at": job.created_at,
            "completed_at": Utc::now(),
            "versions": { "service": env!("CARGO_PKG_VERSION") },
        },
        "disassembly": disassembly,
        "translations": {
            "overall_summary": translated.overall_summary,
            "functions": translated.function_translations,
            "imports": translated.import_translations,
            "strings": translated.string_translations,
        },
        "accounting": {
            "provider_id": provider_key.provider_id,
            "model": provider_key.model,
            "total_tokens_in": translated.totals.tokens_in,
            "total_tokens_out": translated.totals.tokens_out,
            "estimated_cost": estimated_cost,
            "durations": { "translation_ms": translated.totals.latency_ms },
        },
    })
}

/// Crash recovery: requeue jobs whose lease went stale while a worker
/// was down (spec.md §5 "Crash safety").
pub async fn reclaim_stale_leases(runtime: &JobRuntime) -> AppResult<()> {
    let (requeued, failed) = runtime
        .store
        .reclaim_stale_leases(runtime.config.stale_lease_seconds, runtime.config.retry_cap)
        .await?;
    if !requeued.is_empty() || !failed.is_empty() {
        tracing::warn!(
            requeued = requeued.len(),
            worker_lost = failed.len(),
            "reclaimed jobs with stale worker leases"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::{ProviderParams, TranslationDetail};
    use crate::storage::models::AnalysisDepth;

    #[test]
    fn cache_key_is_stable_for_identical_config() {
        let config = AnalysisConfig {
            analysis_depth: AnalysisDepth::Standard,
            translation_detail: TranslationDetail::Standard,
            provider_params: ProviderParams { provider_id: "openai".to_string(), model: None, endpoint_url: None, api_key: None },
            timeout_seconds: 1200,
        };
        let a = cache_key_for("abc123", &config);
        let b = cache_key_for("abc123", &config);
        assert_eq!(a, b);
    }

    #[test]
    fn cache_key_differs_for_different_hash() {
        let config = AnalysisConfig {
            analysis_depth: AnalysisDepth::Basic,
            translation_detail: TranslationDetail::Basic,
            provider_params: ProviderParams { provider_id: "local".to_string(), model: None, endpoint_url: Some("http://x".to_string()), api_key: None },
            timeout_seconds: 60,
        };
        assert_ne!(cache_key_for("a", &config), cache_key_for("b", &config));
    }
}
