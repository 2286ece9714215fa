//! Structured store operations over Postgres.
//!
//! Every multi-statement write goes through a `sqlx::Transaction`, the
//! same discipline `database/locks.rs` uses for advisory locks — "the
//! whole thing happens inside one `Transaction<'_, Postgres>` or not at
//! all".

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::storage::models::*;

#[derive(Clone)]
pub struct Store {
    pub pool: PgPool,
}

impl Store {
    pub async fn connect(database_url: &str) -> AppResult<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> AppResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("migration failed: {e}")))
    }

    pub async fn begin(&self) -> AppResult<Transaction<'_, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Cheap connectivity probe for the readiness endpoint.
    pub async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Jobs
    // ---------------------------------------------------------------

    /// Insert a new job row in `pending`.
    pub async fn insert_job(&self, job: &Job) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, status, priority, file_hash, filename, file_reference,
                analysis_config, result_reference, error_message,
                progress_percentage, current_stage, worker_id,
                created_at, started_at, updated_at, completed_at,
                submitted_by, correlation_id, processing_time_seconds,
                estimated_completion_seconds, retry_count, tokens_in,
                tokens_out, estimated_cost
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24
            )
            "#,
        )
        .bind(job.id)
        .bind(job.status)
        .bind(job.priority)
        .bind(&job.file_hash)
        .bind(&job.filename)
        .bind(&job.file_reference)
        .bind(&job.analysis_config)
        .bind(&job.result_reference)
        .bind(&job.error_message)
        .bind(job.progress_percentage)
        .bind(&job.current_stage)
        .bind(&job.worker_id)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.updated_at)
        .bind(job.completed_at)
        .bind(&job.submitted_by)
        .bind(&job.correlation_id)
        .bind(job.processing_time_seconds)
        .bind(job.estimated_completion_seconds)
        .bind(job.retry_count)
        .bind(job.tokens_in)
        .bind(job.tokens_out)
        .bind(job.estimated_cost)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_job(&self, id: Uuid) -> AppResult<Job> {
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("job {id}")))
    }

    /// Atomically lease the highest-priority, oldest pending job.
    /// Uses `FOR UPDATE SKIP LOCKED` so concurrent workers never collide
    /// (spec.md §4.7, invariant 3 in §8).
    pub async fn dequeue_next_job(&self, worker_id: &str) -> AppResult<Option<Job>> {
        let mut tx = self.begin().await?;
        let row = sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM jobs
            WHERE status = 'pending'
            ORDER BY
                CASE priority
                    WHEN 'urgent' THEN 0
                    WHEN 'high' THEN 1
                    WHEN 'normal' THEN 2
                    WHEN 'low' THEN 3
                END ASC,
                created_at ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(mut job) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'in_progress', worker_id = $2, started_at = $3, updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(worker_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        job.status = JobStatus::InProgress;
        job.worker_id = Some(worker_id.to_string());
        job.started_at = Some(now);
        job.updated_at = now;
        Ok(Some(job))
    }

    pub async fn update_progress(&self, id: Uuid, percentage: i32, stage: &str) -> AppResult<()> {
        sqlx::query(
            "UPDATE jobs SET progress_percentage = $2, current_stage = $3, updated_at = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(percentage)
        .bind(stage)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn touch_heartbeat(&self, id: Uuid) -> AppResult<()> {
        sqlx::query("UPDATE jobs SET updated_at = $2 WHERE id = $1")
            .bind(id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn complete_job(
        &self,
        id: Uuid,
        result_reference: &str,
        tokens_in: i64,
        tokens_out: i64,
        estimated_cost: f64,
    ) -> AppResult<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', result_reference = $2, progress_percentage = 100,
                current_stage = 'completed', completed_at = $3, updated_at = $3,
                worker_id = NULL, tokens_in = $4, tokens_out = $5, estimated_cost = $6,
                processing_time_seconds = EXTRACT(EPOCH FROM ($3 - started_at))
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(result_reference)
        .bind(now)
        .bind(tokens_in)
        .bind(tokens_out)
        .bind(estimated_cost)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fail_job(&self, id: Uuid, error_message: &str, result_reference: Option<&str>) -> AppResult<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', error_message = $2, result_reference = $3,
                completed_at = $4, updated_at = $4, worker_id = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error_message)
        .bind(result_reference)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Cancel a job. Returns `true` if the cancellation was applied.
    /// `pending` jobs cancel immediately; `in_progress` jobs only have a
    /// flag set (read by the worker at its next checkpoint via
    /// `is_cancel_requested`).
    pub async fn cancel_job(&self, id: Uuid) -> AppResult<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled', completed_at = $2, updated_at = $2
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let result = sqlx::query(
            r#"
            UPDATE jobs SET cancel_requested = true, updated_at = $2
            WHERE id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn is_cancel_requested(&self, id: Uuid) -> AppResult<bool> {
        let row: Option<(bool,)> = sqlx::query_as("SELECT cancel_requested FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.0).unwrap_or(false))
    }

    pub async fn finalize_cancelled(&self, id: Uuid) -> AppResult<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE jobs SET status = 'cancelled', completed_at = $2, updated_at = $2, worker_id = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Crash recovery: requeue jobs whose lease has gone stale.
    /// Returns the ids of jobs that were requeued and the ids of jobs that
    /// hit the retry cap and were failed with `worker_lost`.
    pub async fn reclaim_stale_leases(
        &self,
        stale_lease_seconds: i64,
        retry_cap: i32,
    ) -> AppResult<(Vec<Uuid>, Vec<Uuid>)> {
        let cutoff = Utc::now() - chrono::Duration::seconds(stale_lease_seconds);
        let mut tx = self.begin().await?;

        let stale: Vec<(Uuid, i32)> = sqlx::query_as(
            "SELECT id, retry_count FROM jobs WHERE status = 'in_progress' AND updated_at < $1 FOR UPDATE SKIP LOCKED",
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        let mut requeued = Vec::new();
        let mut failed = Vec::new();
        let now = Utc::now();
        for (id, retry_count) in stale {
            if retry_count + 1 > retry_cap {
                sqlx::query(
                    r#"
                    UPDATE jobs SET status = 'failed', error_message = 'worker_lost',
                        completed_at = $2, updated_at = $2, worker_id = NULL
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                failed.push(id);
            } else {
                sqlx::query(
                    r#"
                    UPDATE jobs SET status = 'pending', worker_id = NULL, started_at = NULL,
                        retry_count = retry_count + 1, updated_at = $2
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                requeued.push(id);
            }
        }
        tx.commit().await?;
        Ok((requeued, failed))
    }

    // ---------------------------------------------------------------
    // Cache
    // ---------------------------------------------------------------

    pub async fn find_cache_entry(&self, cache_key: &str) -> AppResult<Option<CacheEntry>> {
        let entry = sqlx::query_as::<_, CacheEntry>(
            "SELECT * FROM cache_entries WHERE cache_key = $1 AND expires_at > now()",
        )
        .bind(cache_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    pub async fn touch_cache_entry(&self, cache_key: &str) -> AppResult<()> {
        sqlx::query(
            "UPDATE cache_entries SET access_count = access_count + 1, last_accessed = now() WHERE cache_key = $1",
        )
        .bind(cache_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_cache_entry(&self, entry: &CacheEntry) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cache_entries (cache_key, file_path, expires_at, last_accessed, access_count, tags, data_size_bytes)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (cache_key) DO UPDATE SET
                file_path = EXCLUDED.file_path,
                expires_at = EXCLUDED.expires_at,
                last_accessed = EXCLUDED.last_accessed,
                access_count = cache_entries.access_count + 1,
                data_size_bytes = EXCLUDED.data_size_bytes
            "#,
        )
        .bind(&entry.cache_key)
        .bind(&entry.file_path)
        .bind(entry.expires_at)
        .bind(entry.last_accessed)
        .bind(entry.access_count)
        .bind(&entry.tags)
        .bind(entry.data_size_bytes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn gc_expired_cache_entries(&self) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ---------------------------------------------------------------
    // API keys
    // ---------------------------------------------------------------

    pub async fn insert_api_key(&self, key: &ApiKey) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO api_keys (key_id, key_hash, user_id, tier, permissions, status, expires_at, created_at, last_used_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&key.key_id)
        .bind(&key.key_hash)
        .bind(&key.user_id)
        .bind(key.tier)
        .bind(&key.permissions)
        .bind(key.status)
        .bind(key.expires_at)
        .bind(key.created_at)
        .bind(key.last_used_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_api_key_by_hash(&self, key_hash: &str) -> AppResult<Option<ApiKey>> {
        let key = sqlx::query_as::<_, ApiKey>("SELECT * FROM api_keys WHERE key_hash = $1")
            .bind(key_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(key)
    }

    pub async fn list_api_keys_for_user(&self, user_id: &str) -> AppResult<Vec<ApiKey>> {
        let keys = sqlx::query_as::<_, ApiKey>("SELECT * FROM api_keys WHERE user_id = $1 ORDER BY created_at DESC")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(keys)
    }

    pub async fn revoke_api_key(&self, user_id: &str, key_id: &str) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE api_keys SET status = 'revoked' WHERE user_id = $1 AND key_id = $2",
        )
        .bind(user_id)
        .bind(key_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn touch_api_key_last_used(&self, key_id: &str) -> AppResult<()> {
        sqlx::query("UPDATE api_keys SET last_used_at = now() WHERE key_id = $1")
            .bind(key_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn any_admin_exists(&self) -> AppResult<bool> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM api_keys WHERE status = 'active' AND 'admin' = ANY(permissions)",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 > 0)
    }

    // ---------------------------------------------------------------
    // Rate limiting (see also ratelimit::check_and_consume, which wraps
    // these primitives in the required single transaction)
    // ---------------------------------------------------------------

    pub async fn prune_and_sum_buckets(
        tx: &mut Transaction<'_, Postgres>,
        scope: &str,
        identifier: &str,
        window_seconds: u64,
    ) -> AppResult<i64> {
        let cutoff = Utc::now() - chrono::Duration::seconds(window_seconds as i64);
        sqlx::query("DELETE FROM rate_limits WHERE scope = $1 AND identifier = $2 AND window_start < $3")
            .bind(scope)
            .bind(identifier)
            .bind(cutoff)
            .execute(&mut **tx)
            .await?;

        let row: (Option<i64>,) = sqlx::query_as(
            "SELECT SUM(request_count) FROM rate_limits WHERE scope = $1 AND identifier = $2",
        )
        .bind(scope)
        .bind(identifier)
        .fetch_one(&mut **tx)
        .await?;
        Ok(row.0.unwrap_or(0))
    }

    pub async fn increment_current_window(
        tx: &mut Transaction<'_, Postgres>,
        scope: &str,
        identifier: &str,
        window_seconds: u64,
    ) -> AppResult<()> {
        let now = Utc::now();
        let bucket_start = bucket_window_start(now, window_seconds);
        sqlx::query(
            r#"
            INSERT INTO rate_limits (scope, identifier, window_start, request_count, window_size_seconds, max_requests)
            VALUES ($1, $2, $3, 1, $4, 0)
            ON CONFLICT (scope, identifier, window_start)
            DO UPDATE SET request_count = rate_limits.request_count + 1
            "#,
        )
        .bind(scope)
        .bind(identifier)
        .bind(bucket_start)
        .bind(window_seconds as i64)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn gc_stale_rate_limit_buckets(&self) -> AppResult<u64> {
        let result = sqlx::query(
            "DELETE FROM rate_limits WHERE window_start < now() - (window_size_seconds || ' seconds')::interval",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ---------------------------------------------------------------
    // Worker heartbeats
    // ---------------------------------------------------------------

    pub async fn upsert_worker_heartbeat(&self, worker_id: &str, current_job_id: Option<Uuid>) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO worker_heartbeats (worker_id, last_heartbeat, current_job_id)
            VALUES ($1, now(), $2)
            ON CONFLICT (worker_id) DO UPDATE SET last_heartbeat = now(), current_job_id = EXCLUDED.current_job_id
            "#,
        )
        .bind(worker_id)
        .bind(current_job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_worker_heartbeats(&self) -> AppResult<Vec<WorkerHeartbeat>> {
        let rows: Vec<(String, DateTime<Utc>, Option<Uuid>)> =
            sqlx::query_as("SELECT worker_id, last_heartbeat, current_job_id FROM worker_heartbeats ORDER BY worker_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(worker_id, last_heartbeat, current_job_id)| WorkerHeartbeat { worker_id, last_heartbeat, current_job_id })
            .collect())
    }

    // ---------------------------------------------------------------
    // Upload sessions
    // ---------------------------------------------------------------

    pub async fn insert_upload_session(&self, session: &UploadSession) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO sessions (session_id, created_at, expires_at, metadata) VALUES ($1, $2, $3, $4)",
        )
        .bind(session.session_id)
        .bind(session.created_at)
        .bind(session.expires_at)
        .bind(&session.metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn gc_expired_upload_sessions(&self) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ---------------------------------------------------------------
    // Alerts — re-evaluated standing conditions, keyed by `condition_key`
    // so repeated checks update rather than duplicate.
    // ---------------------------------------------------------------

    pub async fn raise_alert(&self, condition_key: &str, severity: AlertSeverity, message: &str) -> AppResult<()> {
        let existing: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM alerts WHERE condition_key = $1 AND resolved_at IS NULL",
        )
        .bind(condition_key)
        .fetch_optional(&self.pool)
        .await?;
        if existing.is_some() {
            return Ok(());
        }
        sqlx::query(
            "INSERT INTO alerts (id, severity, message, condition_key, created_at) VALUES ($1, $2, $3, $4, now())",
        )
        .bind(Uuid::new_v4())
        .bind(severity)
        .bind(message)
        .bind(condition_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Clear any still-open alert for `condition_key` once the underlying
    /// condition is no longer observed.
    pub async fn resolve_alerts_for_condition(&self, condition_key: &str) -> AppResult<()> {
        sqlx::query("UPDATE alerts SET resolved_at = now() WHERE condition_key = $1 AND resolved_at IS NULL")
            .bind(condition_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_alerts(&self, include_resolved: bool) -> AppResult<Vec<Alert>> {
        let query = if include_resolved {
            "SELECT * FROM alerts ORDER BY created_at DESC"
        } else {
            "SELECT * FROM alerts WHERE resolved_at IS NULL ORDER BY created_at DESC"
        };
        let alerts = sqlx::query_as::<_, Alert>(query).fetch_all(&self.pool).await?;
        Ok(alerts)
    }

    pub async fn get_alert(&self, id: Uuid) -> AppResult<Alert> {
        sqlx::query_as::<_, Alert>("SELECT * FROM alerts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("alert {id}")))
    }

    pub async fn acknowledge_alert(&self, id: Uuid) -> AppResult<()> {
        sqlx::query("UPDATE alerts SET acknowledged_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn resolve_alert(&self, id: Uuid) -> AppResult<()> {
        sqlx::query("UPDATE alerts SET resolved_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Admin stats
    // ---------------------------------------------------------------

    pub async fn job_counts_by_status(&self) -> AppResult<Vec<(JobStatus, i64)>> {
        let rows: Vec<(JobStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    pub async fn job_totals(&self) -> AppResult<(i64, i64, f64)> {
        let row: (Option<i64>, Option<i64>, Option<f64>) =
            sqlx::query_as("SELECT SUM(tokens_in), SUM(tokens_out), SUM(estimated_cost) FROM jobs")
                .fetch_one(&self.pool)
                .await?;
        Ok((row.0.unwrap_or(0), row.1.unwrap_or(0), row.2.unwrap_or(0.0)))
    }

    pub async fn count_active_api_keys(&self) -> AppResult<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM api_keys WHERE status = 'active'")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    pub async fn count_cache_entries(&self) -> AppResult<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cache_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

fn bucket_window_start(now: DateTime<Utc>, window_seconds: u64) -> DateTime<Utc> {
    let epoch_seconds = now.timestamp();
    let bucket = epoch_seconds - (epoch_seconds % window_seconds.max(1) as i64);
    DateTime::from_timestamp(bucket, 0).unwrap_or(now)
}
