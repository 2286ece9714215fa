//! Service entry point: load config, connect storage, spawn workers and
//! background maintenance tasks, serve the HTTP API. Generalizes the
//! teacher's `bin/agentic_server.rs` from a single pool + one router to
//! the full job-runtime/worker-pool shape spec.md §4.7 and §5 describe.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use bintranslate::api;
use bintranslate::breaker::CircuitBreaker;
use bintranslate::config::Config;
use bintranslate::jobs::{self, JobRuntime, Worker};
use bintranslate::providers::registry::Registry;
use bintranslate::storage::blobs::{BlobKind, BlobStore};
use bintranslate::storage::db::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let config = Config::from_env()?;
    tracing::info!(bind_addr = %config.bind_addr, workers = config.worker_count, "starting bintranslate-server");

    let store = Store::connect(&config.database_url).await?;
    store.migrate().await?;
    tracing::info!("database migrations applied");

    tokio::fs::create_dir_all(&config.storage_root_dir).await?;
    let blobs = BlobStore::new(config.storage_root_dir.clone());
    let registry = Arc::new(Registry::new(&config));
    let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
    let config = Arc::new(config);

    let runtime = JobRuntime { store, blobs, registry, breaker, config: config.clone() };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut worker_handles = Vec::with_capacity(config.worker_count);
    for _ in 0..config.worker_count {
        let worker = Worker::new(runtime.clone());
        let rx = shutdown_rx.clone();
        worker_handles.push(tokio::spawn(async move { worker.run(rx).await }));
    }
    tracing::info!(count = config.worker_count, "worker pool started");

    let maintenance_handle = spawn_maintenance(runtime.clone(), shutdown_rx.clone());

    let app = api::build_router(runtime);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown_signal())
        .await?;

    tracing::info!("shutdown signal received, draining workers");
    let _ = shutdown_tx.send(true);
    for handle in worker_handles {
        let _ = handle.await;
    }
    maintenance_handle.abort();

    tracing::info!("bintranslate-server stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Periodic housekeeping: reclaim stale job leases, garbage-collect
/// expired blobs/cache entries/rate-limit buckets/upload sessions, and
/// re-evaluate standing alert conditions (spec.md §5 "Crash safety",
/// §4.1 "TTL-driven cleanup").
fn spawn_maintenance(runtime: JobRuntime, mut shutdown_rx: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_rx.changed() => break,
            }
            if *shutdown_rx.borrow() {
                break;
            }

            if let Err(e) = jobs::reclaim_stale_leases(&runtime).await {
                tracing::error!(error = %e, "reclaiming stale leases failed");
            }
            if let Err(e) = runtime.blobs.gc_expired(BlobKind::Upload, runtime.config.upload_ttl_seconds as i64).await {
                tracing::warn!(error = %e, "blob gc (uploads) failed");
            }
            if let Err(e) = runtime.blobs.gc_expired(BlobKind::Result, (runtime.config.result_ttl_hours * 3600) as i64).await {
                tracing::warn!(error = %e, "blob gc (results) failed");
            }
            if let Err(e) = runtime.store.gc_expired_cache_entries().await {
                tracing::warn!(error = %e, "cache entry gc failed");
            }
            if let Err(e) = runtime.store.gc_stale_rate_limit_buckets().await {
                tracing::warn!(error = %e, "rate limit bucket gc failed");
            }
            if let Err(e) = runtime.store.gc_expired_upload_sessions().await {
                tracing::warn!(error = %e, "upload session gc failed");
            }
            if let Err(e) = api::evaluate_alerts(&runtime).await {
                tracing::warn!(error = %e, "alert condition re-evaluation failed");
            }
        }
    })
}
