//! On-demand provider construction, generalized from the teacher's
//! `agentic/client_factory.rs`. Where the teacher picks one of two
//! hardcoded backends from an `AGENT_BACKEND` env var, spec.md §4.3
//! requires the opposite: every request carries its own provider
//! parameters (`provider_id`, optional `model`/`endpoint_url`/`api_key`),
//! and the registry's job is only to fill in whatever the request left
//! blank from `Config.provider_defaults` and build a fresh client — it
//! never selects a provider itself or fails over between providers.

use std::sync::Arc;

use crate::config::Config;
use crate::storage::models::ProviderParams;

use super::local::LocalProvider;
use super::{anthropic::AnthropicProvider, gemini::GeminiProvider, openai::OpenAiProvider};
use super::{Provider, ProviderError, ProviderResult};

/// Identifies a provider configuration for circuit-breaker and health
/// bookkeeping: same provider_id with a different model or endpoint is
/// tracked independently (spec.md §4.4 "breaker state is keyed, not global").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderKey {
    pub provider_id: String,
    pub model: String,
    pub endpoint: Option<String>,
}

impl std::fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.endpoint {
            Some(endpoint) => write!(f, "{}:{}@{}", self.provider_id, self.model, endpoint),
            None => write!(f, "{}:{}", self.provider_id, self.model),
        }
    }
}

pub struct Registry {
    defaults: std::collections::HashMap<String, crate::config::ProviderDefaults>,
}

impl Registry {
    pub fn new(config: &Config) -> Self {
        Self { defaults: config.provider_defaults.clone() }
    }

    /// Resolve request-supplied `ProviderParams` against configured
    /// defaults for fields the request left blank, then construct a
    /// fresh provider instance. Never consults any other provider's
    /// configuration — there is no failover list.
    pub fn build(&self, params: &ProviderParams) -> ProviderResult<(ProviderKey, Arc<dyn Provider>)> {
        let defaults = self.defaults.get(&params.provider_id);
        let model = params
            .model
            .clone()
            .or_else(|| defaults.and_then(|d| d.model.clone()));
        let endpoint = params
            .endpoint_url
            .clone()
            .or_else(|| defaults.and_then(|d| d.endpoint_url.clone()));

        let provider: Arc<dyn Provider> = match params.provider_id.as_str() {
            "anthropic" => {
                let api_key = params.api_key.clone().ok_or(ProviderError::MissingApiKey)?;
                Arc::new(AnthropicProvider::new(api_key, model.clone(), endpoint.clone()))
            }
            "openai" => {
                let api_key = params.api_key.clone().ok_or(ProviderError::MissingApiKey)?;
                Arc::new(OpenAiProvider::new(api_key, model.clone(), endpoint.clone()))
            }
            "gemini" => {
                let api_key = params.api_key.clone().ok_or(ProviderError::MissingApiKey)?;
                Arc::new(GeminiProvider::new(api_key, model.clone(), endpoint.clone()))
            }
            "local" => Arc::new(LocalProvider::new(params.api_key.clone(), model.clone(), endpoint.clone())?),
            other => return Err(ProviderError::UnknownProvider(other.to_string())),
        };

        let key = ProviderKey {
            provider_id: params.provider_id.clone(),
            model: model.unwrap_or_else(|| provider.model().to_string()),
            endpoint,
        };
        Ok((key, provider))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_defaults() -> Config {
        let mut defaults = std::collections::HashMap::new();
        defaults.insert(
            "openai".to_string(),
            crate::config::ProviderDefaults { endpoint_url: None, model: Some("gpt-4o".to_string()) },
        );
        Config {
            database_url: "postgres://localhost/test".to_string(),
            bind_addr: "127.0.0.1:8080".parse().unwrap(),
            max_file_size_mb: 100,
            analysis_timeout_seconds: 1200,
            disassembler_step_timeout_seconds: 60,
            result_ttl_hours: 24,
            upload_ttl_seconds: 3600,
            worker_count: 2,
            translation_concurrency: 4,
            stale_lease_seconds: 60,
            heartbeat_interval_seconds: 10,
            retry_cap: 3,
            rate_limits: std::collections::HashMap::new(),
            global_rate_limit: crate::config::RateLimitTier { window_seconds: 60, max_requests: 10_000 },
            circuit_breaker: Default::default(),
            storage_root_dir: "./data".into(),
            api_key_salt: "salt".to_string(),
            provider_defaults: defaults,
            max_strings_standard: 200,
            max_strings_comprehensive: 1000,
            disassembler_bin: "r2".to_string(),
        }
    }

    #[test]
    fn unknown_provider_id_is_rejected() {
        let registry = Registry::new(&config_with_defaults());
        let params = ProviderParams { provider_id: "nope".to_string(), model: None, endpoint_url: None, api_key: Some("x".to_string()) };
        assert!(matches!(registry.build(&params), Err(ProviderError::UnknownProvider(_))));
    }

    #[test]
    fn missing_api_key_is_rejected_for_hosted_providers() {
        let registry = Registry::new(&config_with_defaults());
        let params = ProviderParams { provider_id: "openai".to_string(), model: None, endpoint_url: None, api_key: None };
        assert!(matches!(registry.build(&params), Err(ProviderError::MissingApiKey)));
    }

    #[test]
    fn request_model_overrides_configured_default() {
        let registry = Registry::new(&config_with_defaults());
        let params = ProviderParams {
            provider_id: "openai".to_string(),
            model: Some("gpt-4o-mini".to_string()),
            endpoint_url: None,
            api_key: Some("key".to_string()),
        };
        let (key, provider) = registry.build(&params).unwrap();
        assert_eq!(key.model, "gpt-4o-mini");
        assert_eq!(provider.model(), "gpt-4o-mini");
    }

    #[test]
    fn falls_back_to_configured_default_model() {
        let registry = Registry::new(&config_with_defaults());
        let params = ProviderParams { provider_id: "openai".to_string(), model: None, endpoint_url: None, api_key: Some("key".to_string()) };
        let (key, _provider) = registry.build(&params).unwrap();
        assert_eq!(key.model, "gpt-4o");
    }

    #[test]
    fn local_provider_requires_no_api_key() {
        let registry = Registry::new(&config_with_defaults());
        let params = ProviderParams {
            provider_id: "local".to_string(),
            model: None,
            endpoint_url: Some("http://localhost:8000/v1".to_string()),
            api_key: None,
        };
        assert!(registry.build(&params).is_ok());
    }
}
