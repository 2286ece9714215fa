//! C6 — translation orchestrator (spec.md §4.6).
//!
//! Fans function/import/string translation calls out under a bounded
//! semaphore, wraps every call with the circuit breaker for the chosen
//! provider key plus a per-call timeout, retries once on a schema parse
//! failure with an explicit JSON-schema reminder, and only runs the
//! overall summary after every other call has settled. Mirrors the
//! teacher's `agentic/feedback.rs` retry-once-with-reminder shape,
//! generalized from DSL validation errors to provider parse failures.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::Semaphore;

use crate::breaker::{CallOutcome, CircuitBreaker};
use crate::disasm::types::{Disassembly, ExtractedString, Function, Import};
use crate::providers::{
    Accounting, CallContext, FunctionTranslation, ImportTranslation, OverallSummary, Provider,
    ProviderError, ProviderKey, StringTranslation,
};
use crate::storage::models::TranslationDetail;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TranslatedResult {
    pub overall_summary: Option<OverallSummary>,
    pub function_translations: Vec<FunctionTranslation>,
    pub import_translations: Vec<ImportTranslation>,
    pub string_translations: Vec<StringTranslation>,
    pub totals: Accounting,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("translation cancelled")]
    Cancelled,
    /// Carries what was produced so the caller can still persist a partial
    /// result blob for diagnosis (spec.md §7 "below [the floor] the job is
    /// failed but the partial result blob is still written").
    #[error("fewer than 50% of function translations succeeded and the overall summary also failed")]
    BelowPartialFailureFloor(Box<TranslatedResult>),
}

pub struct OrchestratorConfig {
    pub concurrency: usize,
    pub per_call_timeout: Duration,
}

/// Produce a [`TranslatedResult`] for `disassembly` using `provider`,
/// respecting `config`'s concurrency cap and `breaker`'s admission
/// decisions for `provider_key`.
pub async fn translate(
    provider: Arc<dyn Provider>,
    provider_key: &ProviderKey,
    breaker: &CircuitBreaker,
    disassembly: &Disassembly,
    detail: TranslationDetail,
    config: &OrchestratorConfig,
    cancel: &crate::providers::tokio_util_cancel::CancelToken,
) -> Result<TranslatedResult, OrchestratorError> {
    let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));

    let function_futs = disassembly.functions.iter().filter(|f| !f.has_empty_listing()).map(|function| {
        let provider = provider.clone();
        let semaphore = semaphore.clone();
        let cancel = cancel.clone();
        let key = provider_key.clone();
        let timeout = config.per_call_timeout;
        async move {
            if cancel.is_cancelled() {
                return None;
            }
            let _permit = semaphore.acquire().await.ok()?;
            Some(translate_one_function(&provider, breaker, &key, function, detail, timeout, &cancel).await)
        }
    });
    let function_translations: Vec<FunctionTranslation> = join_all(function_futs).await.into_iter().flatten().collect();

    if disassembly.functions.iter().any(|f| f.has_empty_listing()) {
        tracing::warn!(
            skipped = disassembly.functions.iter().filter(|f| f.has_empty_listing()).count(),
            "skipped translation of functions with empty assembly listings"
        );
    }

    let mut seen_imports = HashSet::new();
    let unique_imports: Vec<&Import> = disassembly
        .imports
        .iter()
        .filter(|i| seen_imports.insert((i.library.clone(), i.name.clone())))
        .collect();

    let import_futs = unique_imports.into_iter().map(|import| {
        let provider = provider.clone();
        let semaphore = semaphore.clone();
        let cancel = cancel.clone();
        let key = provider_key.clone();
        let timeout = config.per_call_timeout;
        let referencing: Vec<String> = disassembly
            .functions
            .iter()
            .filter(|f| f.calls_to.contains(&import.name))
            .map(|f| f.name.clone())
            .collect();
        async move {
            if cancel.is_cancelled() {
                return None;
            }
            let _permit = semaphore.acquire().await.ok()?;
            Some(translate_one_import(&provider, breaker, &key, import, &referencing, detail, timeout, &cancel).await)
        }
    });
    let import_translations: Vec<ImportTranslation> = join_all(import_futs).await.into_iter().flatten().collect();

    let string_futs = disassembly.strings.iter().map(|string| {
        let provider = provider.clone();
        let semaphore = semaphore.clone();
        let cancel = cancel.clone();
        let key = provider_key.clone();
        let timeout = config.per_call_timeout;
        async move {
            if cancel.is_cancelled() {
                return None;
            }
            let _permit = semaphore.acquire().await.ok()?;
            Some(translate_one_string(&provider, breaker, &key, string, detail, timeout, &cancel).await)
        }
    });
    let string_translations: Vec<StringTranslation> = join_all(string_futs).await.into_iter().flatten().collect();

    if cancel.is_cancelled() {
        return Err(OrchestratorError::Cancelled);
    }

    let eligible_functions = disassembly.functions.iter().filter(|f| !f.has_empty_listing()).count();
    let succeeded_functions = function_translations.iter().filter(|t| t.error.is_none()).count();
    let success_ratio = if eligible_functions == 0 { 1.0 } else { succeeded_functions as f64 / eligible_functions as f64 };

    let first_summary = call_guarded(breaker, provider_key, config.per_call_timeout, cancel, |ctx| {
        let provider = provider.clone();
        let disassembly = disassembly.clone();
        let function_translations = function_translations.clone();
        async move { provider.translate_summary(&ctx, &disassembly, &function_translations, detail, false).await }
    })
    .await;

    let overall_summary = match first_summary {
        Ok(t) => Ok(t),
        Err(ProviderError::SchemaMismatch(_)) | Err(ProviderError::Json(_)) => {
            tracing::debug!("retrying overall summary translation after schema mismatch");
            call_guarded(breaker, provider_key, config.per_call_timeout, cancel, |ctx| {
                let provider = provider.clone();
                let disassembly = disassembly.clone();
                let function_translations = function_translations.clone();
                async move { provider.translate_summary(&ctx, &disassembly, &function_translations, detail, true).await }
            })
            .await
        }
        Err(e) => Err(e),
    };

    let overall_summary = match overall_summary {
        Ok(summary) => Some(summary),
        Err(e) => {
            tracing::warn!(error = %e, "overall summary translation failed");
            None
        }
    };

    let mut totals = Accounting::default();
    for item in function_translations.iter().map(|t| &t.accounting)
        .chain(import_translations.iter().map(|t| &t.accounting))
        .chain(string_translations.iter().map(|t| &t.accounting))
        .chain(overall_summary.iter().map(|t| &t.accounting))
    {
        totals.tokens_in += item.tokens_in;
        totals.tokens_out += item.tokens_out;
        totals.latency_ms += item.latency_ms;
    }

    let result = TranslatedResult { overall_summary, function_translations, import_translations, string_translations, totals };

    if success_ratio < 0.5 && result.overall_summary.is_none() {
        return Err(OrchestratorError::BelowPartialFailureFloor(Box::new(result)));
    }

    Ok(result)
}

async fn call_guarded<F, Fut, T>(
    breaker: &CircuitBreaker,
    key: &ProviderKey,
    timeout: Duration,
    cancel: &crate::providers::tokio_util_cancel::CancelToken,
    call: F,
) -> Result<T, ProviderError>
where
    F: FnOnce(CallContext) -> Fut,
    Fut: std::future::Future<Output = Result<T, ProviderError>>,
{
    if cancel.is_cancelled() {
        return Err(ProviderError::Cancelled);
    }
    if crate::breaker::Admission::Rejected == breaker.admit(key).await {
        return Err(ProviderError::Api { status: 503, body: "circuit breaker open".to_string() });
    }

    let ctx = CallContext { deadline: Instant::now() + timeout, cancel: cancel.clone() };
    let outcome = tokio::time::timeout(timeout, call(ctx)).await;
    match outcome {
        Ok(Ok(value)) => {
            breaker.record(key, CallOutcome::Success).await;
            Ok(value)
        }
        Ok(Err(e)) => {
            breaker.record(key, CallOutcome::Failure).await;
            Err(e)
        }
        Err(_) => {
            breaker.record(key, CallOutcome::Failure).await;
            Err(ProviderError::Timeout)
        }
    }
}

async fn translate_one_function(
    provider: &Arc<dyn Provider>,
    breaker: &CircuitBreaker,
    key: &ProviderKey,
    function: &Function,
    detail: TranslationDetail,
    timeout: Duration,
    cancel: &crate::providers::tokio_util_cancel::CancelToken,
) -> FunctionTranslation {
    let first = call_guarded(breaker, key, timeout, cancel, |ctx| {
        let provider = provider.clone();
        let function = function.clone();
        async move { provider.translate_function(&ctx, &function, detail, false).await }
    })
    .await;

    let result = match first {
        Ok(t) => Ok(t),
        Err(ProviderError::SchemaMismatch(_)) | Err(ProviderError::Json(_)) => {
            tracing::debug!(function = %function.name, "retrying function translation after schema mismatch");
            call_guarded(breaker, key, timeout, cancel, |ctx| {
                let provider = provider.clone();
                let function = function.clone();
                async move { provider.translate_function(&ctx, &function, detail, true).await }
            })
            .await
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(t) => t,
        Err(e) => FunctionTranslation {
            function_address: function.address,
            natural_language: String::new(),
            purpose: None,
            parameters: Vec::new(),
            security_notes: None,
            risk_score: None,
            accounting: Accounting::default(),
            error: Some(e.to_string()),
        },
    }
}

async fn translate_one_import(
    provider: &Arc<dyn Provider>,
    breaker: &CircuitBreaker,
    key: &ProviderKey,
    import: &Import,
    referencing_functions: &[String],
    detail: TranslationDetail,
    timeout: Duration,
    cancel: &crate::providers::tokio_util_cancel::CancelToken,
) -> ImportTranslation {
    let first = call_guarded(breaker, key, timeout, cancel, |ctx| {
        let provider = provider.clone();
        let import = import.clone();
        let referencing = referencing_functions.to_vec();
        async move { provider.translate_import(&ctx, &import, &referencing, detail, false).await }
    })
    .await;

    let result = match first {
        Ok(t) => Ok(t),
        Err(ProviderError::SchemaMismatch(_)) | Err(ProviderError::Json(_)) => {
            call_guarded(breaker, key, timeout, cancel, |ctx| {
                let provider = provider.clone();
                let import = import.clone();
                let referencing = referencing_functions.to_vec();
                async move { provider.translate_import(&ctx, &import, &referencing, detail, true).await }
            })
            .await
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(t) => t,
        Err(e) => ImportTranslation {
            library: import.library.clone(),
            name: import.name.clone(),
            natural_language: String::new(),
            accounting: Accounting::default(),
            error: Some(e.to_string()),
        },
    }
}

async fn translate_one_string(
    provider: &Arc<dyn Provider>,
    breaker: &CircuitBreaker,
    key: &ProviderKey,
    string: &ExtractedString,
    detail: TranslationDetail,
    timeout: Duration,
    cancel: &crate::providers::tokio_util_cancel::CancelToken,
) -> StringTranslation {
    let first = call_guarded(breaker, key, timeout, cancel, |ctx| {
        let provider = provider.clone();
        let string = string.clone();
        async move { provider.translate_string(&ctx, &string, detail, false).await }
    })
    .await;

    let result = match first {
        Ok(t) => Ok(t),
        Err(ProviderError::SchemaMismatch(_)) | Err(ProviderError::Json(_)) => {
            call_guarded(breaker, key, timeout, cancel, |ctx| {
                let provider = provider.clone();
                let string = string.clone();
                async move { provider.translate_string(&ctx, &string, detail, true).await }
            })
            .await
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(t) => t,
        Err(e) => StringTranslation {
            address: string.address,
            natural_language: String::new(),
            category: None,
            accounting: Accounting::default(),
            error: Some(e.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;
    use crate::disasm::types::{BinaryFormat, FileInfo, FunctionType, StringEncoding};
    use crate::providers::{HealthStatus, ProviderResult};

    #[test]
    fn success_ratio_below_floor_without_summary_is_rejected() {
        let eligible = 4usize;
        let succeeded = 1usize;
        let ratio = succeeded as f64 / eligible as f64;
        assert!(ratio < 0.5);
    }

    struct StubProvider;

    #[async_trait::async_trait]
    impl crate::providers::Provider for StubProvider {
        async fn translate_function(
            &self,
            _ctx: &CallContext,
            function: &Function,
            _detail: TranslationDetail,
            _retry: bool,
        ) -> ProviderResult<FunctionTranslation> {
            Ok(FunctionTranslation {
                function_address: function.address,
                natural_language: "does a thing".to_string(),
                purpose: None,
                parameters: Vec::new(),
                security_notes: None,
                risk_score: None,
                accounting: Accounting::default(),
                error: None,
            })
        }

        async fn translate_import(
            &self,
            _ctx: &CallContext,
            import: &Import,
            _referencing_functions: &[String],
            _detail: TranslationDetail,
            _retry: bool,
        ) -> ProviderResult<ImportTranslation> {
            Ok(ImportTranslation {
                library: import.library.clone(),
                name: import.name.clone(),
                natural_language: "calls into a library".to_string(),
                accounting: Accounting::default(),
                error: None,
            })
        }

        async fn translate_string(
            &self,
            _ctx: &CallContext,
            string: &ExtractedString,
            _detail: TranslationDetail,
            _retry: bool,
        ) -> ProviderResult<StringTranslation> {
            Ok(StringTranslation {
                address: string.address,
                natural_language: "a label".to_string(),
                category: None,
                accounting: Accounting::default(),
                error: None,
            })
        }

        async fn translate_summary(
            &self,
            _ctx: &CallContext,
            _disassembly: &Disassembly,
            _function_translations: &[FunctionTranslation],
            _detail: TranslationDetail,
            _retry: bool,
        ) -> ProviderResult<OverallSummary> {
            Ok(OverallSummary {
                text: "summary".to_string(),
                purpose: None,
                key_behaviors: Vec::new(),
                security_notes: None,
                accounting: Accounting::default(),
                error: None,
            })
        }

        async fn health_check(&self, _ctx: &CallContext) -> ProviderResult<HealthStatus> {
            Ok(HealthStatus { healthy: true, latency_ms: 1, error: None })
        }

        fn capabilities(&self) -> crate::providers::Capabilities {
            crate::providers::Capabilities { max_context_tokens: 8000, supports_streaming: false, cost_per_1k_tokens: None }
        }

        fn provider_id(&self) -> &str {
            "stub"
        }

        fn model(&self) -> &str {
            "stub-model"
        }
    }

    fn function(name: &str, assembly_len: usize) -> Function {
        Function {
            name: name.to_string(),
            address: 0x1000,
            size_bytes: 16,
            function_type: FunctionType::Function,
            assembly: (0..assembly_len)
                .map(|i| crate::disasm::types::AsmInstruction {
                    address: 0x1000 + i as u64,
                    bytes_hex: "90".to_string(),
                    mnemonic: "nop".to_string(),
                    operands: String::new(),
                    comment: None,
                    xrefs_to: Vec::new(),
                    xrefs_from: Vec::new(),
                })
                .collect(),
            calls_to: Vec::new(),
            calls_from: Vec::new(),
        }
    }

    fn empty_disassembly(functions: Vec<Function>) -> Disassembly {
        Disassembly {
            file_info: Some(FileInfo {
                format: BinaryFormat::Pe,
                architecture: "x86_64".to_string(),
                bits: 64,
                entry_point: 0x1000,
                size_bytes: 1024,
                md5: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
                sha256: "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855".to_string(),
            }),
            functions,
            imports: Vec::new(),
            exports: Vec::new(),
            strings: vec![ExtractedString { content: "hi".to_string(), address: 0x2000, length: 2, encoding: StringEncoding::Ascii, section: None }],
            sections: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Invariant 7 (spec.md §8): a function with an empty `assembly`
    /// listing is never given to the provider for translation.
    #[tokio::test]
    async fn functions_with_empty_assembly_are_never_translated() {
        let disassembly = empty_disassembly(vec![function("real_fn", 3), function("stub_fn", 0)]);
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
        let key = ProviderKey { provider_id: "stub".to_string(), model: "stub-model".to_string(), endpoint: None };
        let config = OrchestratorConfig { concurrency: 4, per_call_timeout: Duration::from_secs(5) };
        let cancel = crate::providers::tokio_util_cancel::CancelToken::new();

        let result = translate(
            Arc::new(StubProvider),
            &key,
            &breaker,
            &disassembly,
            TranslationDetail::Standard,
            &config,
            &cancel,
        )
        .await
        .expect("translation should succeed");

        assert_eq!(result.function_translations.len(), 1, "only the non-empty function should be translated");
        assert_eq!(result.function_translations[0].function_address, 0x1000);
    }

    /// Invariant 8 (spec.md §8): a translation cancelled mid-flight
    /// produces no `TranslatedResult` at all, so no result blob can be
    /// derived from it.
    #[tokio::test]
    async fn cancelling_before_translation_starts_yields_no_result() {
        let disassembly = empty_disassembly(vec![function("real_fn", 3)]);
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
        let key = ProviderKey { provider_id: "stub".to_string(), model: "stub-model".to_string(), endpoint: None };
        let config = OrchestratorConfig { concurrency: 4, per_call_timeout: Duration::from_secs(5) };
        let cancel = crate::providers::tokio_util_cancel::CancelToken::new();
        cancel.cancel();

        let result = translate(
            Arc::new(StubProvider),
            &key,
            &breaker,
            &disassembly,
            TranslationDetail::Standard,
            &config,
            &cancel,
        )
        .await;

        assert!(matches!(result, Err(OrchestratorError::Cancelled)));
    }
}
