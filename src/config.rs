//! Process-wide configuration, loaded from environment variables.
//!
//! Mirrors the teacher's habit of reading individual env vars per
//! component (`AnthropicClient::from_env`, `AiConfig::default`) rather than
//! a config-file framework. Only the keys listed in spec.md §6 are
//! recognized; everything else is rejected at startup.

use std::collections::HashMap;
use std::time::Duration;

/// Per-tier (window, max_requests) rate limit pair.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitTier {
    pub window_seconds: u64,
    pub max_requests: u32,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub window_seconds: u64,
    pub cool_down_seconds: u64,
    pub success_threshold: u32,
    pub probe_limit: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_seconds: 60,
            cool_down_seconds: 30,
            success_threshold: 2,
            probe_limit: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderDefaults {
    pub endpoint_url: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: std::net::SocketAddr,

    pub max_file_size_mb: u64,
    pub analysis_timeout_seconds: u64,
    pub disassembler_step_timeout_seconds: u64,
    pub result_ttl_hours: u64,
    pub upload_ttl_seconds: u64,
    pub worker_count: usize,
    pub translation_concurrency: usize,
    pub stale_lease_seconds: i64,
    pub heartbeat_interval_seconds: u64,
    pub retry_cap: i32,

    pub rate_limits: HashMap<String, RateLimitTier>,
    pub global_rate_limit: RateLimitTier,
    pub circuit_breaker: CircuitBreakerConfig,

    pub storage_root_dir: std::path::PathBuf,

    pub api_key_salt: String,

    pub provider_defaults: HashMap<String, ProviderDefaults>,

    pub max_strings_standard: usize,
    pub max_strings_comprehensive: usize,

    pub disassembler_bin: String,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from the environment, applying `.env` first if present.
    pub fn from_env() -> anyhow::Result<Self> {
        // Best-effort; a missing .env is not an error (matches teacher's
        // client constructors, which tolerate absent env files).
        let _ = dotenvy::dotenv();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable not set"))?;

        let api_key_salt = std::env::var("AUTH_API_KEY_SALT")
            .map_err(|_| anyhow::anyhow!("AUTH_API_KEY_SALT environment variable not set"))?;
        if api_key_salt == "default-insecure-salt-change-me" {
            tracing::warn!("AUTH_API_KEY_SALT is using the known default value; set a real secret in production");
        }

        let bind_host = env_or("BIND_HOST", "127.0.0.1");
        let bind_port: u16 = env_parse("BIND_PORT", 8080);
        let bind_addr = format!("{bind_host}:{bind_port}")
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid BIND_HOST/BIND_PORT: {e}"))?;

        let mut rate_limits = HashMap::new();
        for tier in ["basic", "standard", "premium", "enterprise"] {
            let window = env_parse(&format!("RATE_LIMITS_{}_WINDOW_SECONDS", tier.to_uppercase()), 60);
            let max = env_parse(&format!("RATE_LIMITS_{}_MAX_REQUESTS", tier.to_uppercase()), default_tier_max(tier));
            rate_limits.insert(tier.to_string(), RateLimitTier { window_seconds: window, max_requests: max });
        }

        let global_rate_limit = RateLimitTier {
            window_seconds: env_parse("RATE_LIMITS_GLOBAL_WINDOW_SECONDS", 60),
            max_requests: env_parse("RATE_LIMITS_GLOBAL_MAX_REQUESTS", 10_000),
        };

        let circuit_breaker = CircuitBreakerConfig {
            failure_threshold: env_parse("CIRCUIT_BREAKER_FAILURE_THRESHOLD", 5),
            window_seconds: env_parse("CIRCUIT_BREAKER_WINDOW_SECONDS", 60),
            cool_down_seconds: env_parse("CIRCUIT_BREAKER_COOL_DOWN_SECONDS", 30),
            success_threshold: env_parse("CIRCUIT_BREAKER_SUCCESS_THRESHOLD", 2),
            probe_limit: env_parse("CIRCUIT_BREAKER_PROBE_LIMIT", 1),
        };

        let mut provider_defaults = HashMap::new();
        for id in ["openai", "anthropic", "gemini", "local"] {
            let endpoint_url = std::env::var(format!("PROVIDERS_{}_ENDPOINT_URL", id.to_uppercase())).ok();
            let model = std::env::var(format!("PROVIDERS_{}_MODEL", id.to_uppercase())).ok();
            if endpoint_url.is_some() || model.is_some() {
                provider_defaults.insert(id.to_string(), ProviderDefaults { endpoint_url, model });
            }
        }

        Ok(Self {
            database_url,
            bind_addr,
            max_file_size_mb: env_parse("MAX_FILE_SIZE_MB", 100),
            analysis_timeout_seconds: env_parse("ANALYSIS_TIMEOUT_SECONDS", 1200),
            disassembler_step_timeout_seconds: env_parse("DISASSEMBLER_STEP_TIMEOUT_SECONDS", 60),
            result_ttl_hours: env_parse("RESULT_TTL_HOURS", 24),
            upload_ttl_seconds: env_parse("STORAGE_UPLOAD_TTL_SECONDS", 3600),
            worker_count: env_parse("WORKER_COUNT", 2),
            translation_concurrency: env_parse("TRANSLATION_CONCURRENCY", 4),
            stale_lease_seconds: env_parse("STALE_LEASE_SECONDS", 60),
            heartbeat_interval_seconds: env_parse("HEARTBEAT_INTERVAL_SECONDS", 10),
            retry_cap: env_parse("JOB_RETRY_CAP", 3),
            rate_limits,
            global_rate_limit,
            circuit_breaker,
            storage_root_dir: env_or("STORAGE_ROOT_DIR", "./data").into(),
            api_key_salt,
            provider_defaults,
            max_strings_standard: env_parse("MAX_STRINGS_STANDARD", 200),
            max_strings_comprehensive: env_parse("MAX_STRINGS_COMPREHENSIVE", 1000),
            disassembler_bin: env_or("DISASSEMBLER_BIN", "r2"),
        })
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }

    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_secs(self.analysis_timeout_seconds)
    }

    pub fn disassembler_step_timeout(&self) -> Duration {
        Duration::from_secs(self.disassembler_step_timeout_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn rate_limit_for(&self, tier: &str) -> RateLimitTier {
        self.rate_limits
            .get(tier)
            .copied()
            .unwrap_or(RateLimitTier { window_seconds: 60, max_requests: default_tier_max(tier) })
    }
}

fn default_tier_max(tier: &str) -> u32 {
    match tier {
        "basic" => 10,
        "standard" => 60,
        "premium" => 300,
        "enterprise" => 1000,
        _ => 10,
    }
}
