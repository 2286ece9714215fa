//! C5 — sliding-window rate limiting (spec.md §4.5).
//!
//! The window is approximated by fixed buckets: prune buckets older than
//! the window, sum what remains, and only admit the request if the sum
//! is still under the cap — then increment the current bucket. All three
//! steps run inside one transaction so concurrent requests against the
//! same `(scope, identifier)` never both observe room under the cap
//! (the same all-or-nothing transaction discipline `database/locks.rs`
//! uses for advisory locks, applied here to counters instead of locks).

use crate::error::AppResult;
use crate::storage::db::Store;

#[derive(Debug, Clone, Copy)]
pub struct LimitDecision {
    pub allowed: bool,
    pub current_count: i64,
    pub max_requests: u32,
    pub window_seconds: u64,
    pub retry_after_seconds: u64,
}

/// Check and, if allowed, consume one unit of quota for `(scope, identifier)`.
pub async fn check_and_consume(
    store: &Store,
    scope: &str,
    identifier: &str,
    window_seconds: u64,
    max_requests: u32,
) -> AppResult<LimitDecision> {
    let mut tx = store.begin().await?;

    let current = Store::prune_and_sum_buckets(&mut tx, scope, identifier, window_seconds).await?;

    if current >= max_requests as i64 {
        tx.commit().await?;
        return Ok(LimitDecision {
            allowed: false,
            current_count: current,
            max_requests,
            window_seconds,
            retry_after_seconds: window_seconds,
        });
    }

    Store::increment_current_window(&mut tx, scope, identifier, window_seconds).await?;
    tx.commit().await?;

    Ok(LimitDecision {
        allowed: true,
        current_count: current + 1,
        max_requests,
        window_seconds,
        retry_after_seconds: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denied_decision_reports_retry_after_the_full_window() {
        let decision = LimitDecision { allowed: false, current_count: 10, max_requests: 10, window_seconds: 60, retry_after_seconds: 60 };
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_seconds, 60);
    }
}
