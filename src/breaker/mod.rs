//! C4 — per-provider-key circuit breaker (spec.md §4.4).
//!
//! Entirely in-memory, never persisted: a restart starts every provider
//! back in the closed state. States are materialized lazily on first
//! use, mirroring the teacher's `SessionManager`
//! (`api/session_manager.rs`) — an `Arc<RwLock<HashMap<_, _>>>` guarding
//! per-key state, rather than a fixed-size table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};

use crate::config::CircuitBreakerConfig;
use crate::providers::ProviderKey;
use crate::storage::models::BreakerState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
}

struct KeyState {
    state: BreakerState,
    failures_in_window: Vec<Instant>,
    half_open_successes: u32,
    half_open_in_flight: u32,
    opened_at: Option<Instant>,
    forced_open: bool,
}

impl KeyState {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failures_in_window: Vec::new(),
            half_open_successes: 0,
            half_open_in_flight: 0,
            opened_at: None,
            forced_open: false,
        }
    }
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    states: RwLock<HashMap<ProviderKey, Arc<Mutex<KeyState>>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Rejected,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self { config, states: RwLock::new(HashMap::new()) }
    }

    async fn entry(&self, key: &ProviderKey) -> Arc<Mutex<KeyState>> {
        if let Some(existing) = self.states.read().await.get(key) {
            return existing.clone();
        }
        let mut write = self.states.write().await;
        write.entry(key.clone()).or_insert_with(|| Arc::new(Mutex::new(KeyState::new()))).clone()
    }

    /// Decide whether a call against `key` may proceed, transitioning
    /// open -> half-open once the cool-down has elapsed. Limits
    /// concurrent half-open probes to `probe_limit`.
    pub async fn admit(&self, key: &ProviderKey) -> Admission {
        let entry = self.entry(key).await;
        let mut state = entry.lock().await;

        if state.forced_open {
            return Admission::Rejected;
        }

        match state.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open => {
                let cool_down = Duration::from_secs(self.config.cool_down_seconds);
                if state.opened_at.map(|t| t.elapsed() >= cool_down).unwrap_or(false) {
                    state.state = BreakerState::HalfOpen;
                    state.half_open_successes = 0;
                    state.half_open_in_flight = 1;
                    tracing::debug!(provider = %key, "circuit breaker transitioning to half-open");
                    Admission::Allowed
                } else {
                    Admission::Rejected
                }
            }
            BreakerState::HalfOpen => {
                if state.half_open_in_flight < self.config.probe_limit {
                    state.half_open_in_flight += 1;
                    Admission::Allowed
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    /// Record the outcome of a call previously admitted by [`Self::admit`].
    pub async fn record(&self, key: &ProviderKey, outcome: CallOutcome) {
        let entry = self.entry(key).await;
        let mut state = entry.lock().await;

        match (state.state, outcome) {
            (BreakerState::Closed, CallOutcome::Failure) => {
                let now = Instant::now();
                let window = Duration::from_secs(self.config.window_seconds);
                state.failures_in_window.retain(|t| now.duration_since(*t) < window);
                state.failures_in_window.push(now);
                if state.failures_in_window.len() as u32 >= self.config.failure_threshold {
                    state.state = BreakerState::Open;
                    state.opened_at = Some(now);
                    tracing::warn!(provider = %key, failures = state.failures_in_window.len(), "circuit breaker opened");
                }
            }
            (BreakerState::Closed, CallOutcome::Success) => {
                state.failures_in_window.clear();
            }
            (BreakerState::HalfOpen, CallOutcome::Success) => {
                state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
                state.half_open_successes += 1;
                if state.half_open_successes >= self.config.success_threshold {
                    state.state = BreakerState::Closed;
                    state.failures_in_window.clear();
                    tracing::info!(provider = %key, "circuit breaker closed after successful probes");
                }
            }
            (BreakerState::HalfOpen, CallOutcome::Failure) => {
                state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
                state.state = BreakerState::Open;
                state.opened_at = Some(Instant::now());
                state.failures_in_window.clear();
                tracing::warn!(provider = %key, "circuit breaker re-opened after failed probe");
            }
            (BreakerState::Open, _) => {
                // Outcome arrived for a call that was admitted before the
                // breaker opened underneath it; nothing to update.
            }
        }
    }

    /// Returns `None` for a key the breaker has never seen, per spec.md
    /// §4.4's "not_found for never-seen keys" admin contract.
    pub async fn status(&self, key: &ProviderKey) -> Option<BreakerState> {
        let states = self.states.read().await;
        match states.get(key) {
            Some(entry) => Some(entry.lock().await.state),
            None => None,
        }
    }

    pub async fn list_keys(&self) -> Vec<(ProviderKey, BreakerState)> {
        let states = self.states.read().await;
        let mut result = Vec::with_capacity(states.len());
        for (key, entry) in states.iter() {
            result.push((key.clone(), entry.lock().await.state));
        }
        result
    }

    /// Admin override: force a provider key open regardless of observed
    /// failures (spec.md §4.9 admin surface).
    pub async fn force_open(&self, key: &ProviderKey) {
        let entry = self.entry(key).await;
        let mut state = entry.lock().await;
        state.forced_open = true;
        state.state = BreakerState::Open;
        state.opened_at = Some(Instant::now());
    }

    /// Admin override: reset a provider key back to closed.
    pub async fn reset(&self, key: &ProviderKey) {
        let entry = self.entry(key).await;
        let mut state = entry.lock().await;
        *state = KeyState::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ProviderKey {
        ProviderKey { provider_id: "openai".to_string(), model: "gpt-4o".to_string(), endpoint: None }
    }

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig { failure_threshold: 2, window_seconds: 60, cool_down_seconds: 30, success_threshold: 1, probe_limit: 1 }
    }

    #[tokio::test]
    async fn unseen_key_reports_no_status() {
        let breaker = CircuitBreaker::new(config());
        assert_eq!(breaker.status(&key()).await, None);
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(config());
        let k = key();
        assert_eq!(breaker.admit(&k).await, Admission::Allowed);
        breaker.record(&k, CallOutcome::Failure).await;
        assert_eq!(breaker.admit(&k).await, Admission::Allowed);
        breaker.record(&k, CallOutcome::Failure).await;
        assert_eq!(breaker.status(&k).await, Some(BreakerState::Open));
        assert_eq!(breaker.admit(&k).await, Admission::Rejected);
    }

    #[tokio::test]
    async fn force_open_rejects_regardless_of_history() {
        let breaker = CircuitBreaker::new(config());
        let k = key();
        breaker.force_open(&k).await;
        assert_eq!(breaker.admit(&k).await, Admission::Rejected);
        breaker.reset(&k).await;
        assert_eq!(breaker.admit(&k).await, Admission::Allowed);
    }
}
