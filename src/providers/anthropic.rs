//! Anthropic Claude wire client, grounded on
//! `agentic/anthropic_client.rs`'s `AnthropicClient`: same endpoint,
//! same `x-api-key`/`anthropic-version` headers, same "ask nicely for
//! JSON" fallback since Anthropic has no JSON response-format mode.

use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::disasm::types::{Disassembly, ExtractedString, Function, Import};
use crate::storage::models::TranslationDetail;

use super::{
    extract_json_object, render_assembly, render_summary_context, Accounting, CallContext,
    Capabilities, FunctionTranslation, HealthStatus, ImportTranslation, JSON_SCHEMA_REMINDER,
    OverallSummary, Provider, ProviderError, ProviderResult, StringTranslation,
};

const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    api_key: String,
    client: reqwest::Client,
    model: String,
    endpoint: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String, model: Option<String>, endpoint: Option<String>) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            endpoint: endpoint.unwrap_or_else(|| "https://api.anthropic.com/v1/messages".to_string()),
        }
    }

    async fn call(&self, ctx: &CallContext, system_prompt: &str, user_prompt: &str) -> ProviderResult<(String, Accounting)> {
        if ctx.cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        let started = Instant::now();
        let json_system = format!(
            "{system_prompt}\n\nIMPORTANT: Respond with valid JSON only. No markdown code blocks, no explanations."
        );

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&json!({
                "model": &self.model,
                "max_tokens": 4096,
                "system": json_system,
                "messages": [{"role": "user", "content": user_prompt}],
            }))
            .timeout(ctx.remaining())
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status, body });
        }

        #[derive(Deserialize)]
        struct ContentBlock {
            text: Option<String>,
        }
        #[derive(Deserialize)]
        struct Usage {
            #[serde(default)]
            input_tokens: u64,
            #[serde(default)]
            output_tokens: u64,
        }
        #[derive(Deserialize)]
        struct ApiResponse {
            content: Vec<ContentBlock>,
            #[serde(default)]
            usage: Option<Usage>,
        }

        let api_response: ApiResponse = response.json().await?;
        let text = api_response
            .content
            .first()
            .and_then(|c| c.text.clone())
            .ok_or_else(|| ProviderError::SchemaMismatch("empty content array from Anthropic".to_string()))?;

        let accounting = Accounting {
            tokens_in: api_response.usage.as_ref().map(|u| u.input_tokens).unwrap_or(0),
            tokens_out: api_response.usage.as_ref().map(|u| u.output_tokens).unwrap_or(0),
            latency_ms: started.elapsed().as_millis() as u64,
        };
        Ok((text, accounting))
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    async fn translate_function(
        &self,
        ctx: &CallContext,
        function: &Function,
        detail: TranslationDetail,
        retry: bool,
    ) -> ProviderResult<FunctionTranslation> {
        let system = "You are a reverse-engineering assistant. Explain disassembled functions precisely and concisely. Respond as a single JSON object with keys: natural_language, purpose, parameters (array of strings), security_notes, risk_score (0.0-1.0).";
        let system = if retry { format!("{system}{JSON_SCHEMA_REMINDER}") } else { system.to_string() };
        let user = format!(
            "Function `{}` at 0x{:x}, {} bytes, {:?} detail requested.\nAssembly:\n{}",
            function.name,
            function.address,
            function.size_bytes,
            detail,
            render_assembly(function),
        );
        let (raw, accounting) = self.call(ctx, &system, &user).await?;
        let value = extract_json_object(&raw)?;
        Ok(FunctionTranslation {
            function_address: function.address,
            natural_language: value["natural_language"].as_str().unwrap_or_default().to_string(),
            purpose: value["purpose"].as_str().map(str::to_string),
            parameters: value["parameters"]
                .as_array()
                .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default(),
            security_notes: value["security_notes"].as_str().map(str::to_string),
            risk_score: value["risk_score"].as_f64().map(|f| f as f32),
            accounting,
            error: None,
        })
    }

    async fn translate_import(
        &self,
        ctx: &CallContext,
        import: &Import,
        referencing_functions: &[String],
        _detail: TranslationDetail,
        retry: bool,
    ) -> ProviderResult<ImportTranslation> {
        let system = "You are a reverse-engineering assistant. Explain the role of an imported API call in one or two sentences. Respond as a single JSON object with key: natural_language.";
        let system = if retry { format!("{system}{JSON_SCHEMA_REMINDER}") } else { system.to_string() };
        let user = format!(
            "Import `{}!{}` referenced by functions: {}.",
            import.library,
            import.name,
            referencing_functions.join(", "),
        );
        let (raw, accounting) = self.call(ctx, &system, &user).await?;
        let value = extract_json_object(&raw)?;
        Ok(ImportTranslation {
            library: import.library.clone(),
            name: import.name.clone(),
            natural_language: value["natural_language"].as_str().unwrap_or_default().to_string(),
            accounting,
            error: None,
        })
    }

    async fn translate_string(
        &self,
        ctx: &CallContext,
        string: &ExtractedString,
        _detail: TranslationDetail,
        retry: bool,
    ) -> ProviderResult<StringTranslation> {
        let system = "You are a reverse-engineering assistant. Explain the likely purpose of a string literal found in a binary. Respond as a single JSON object with keys: natural_language, category.";
        let system = if retry { format!("{system}{JSON_SCHEMA_REMINDER}") } else { system.to_string() };
        let user = format!("String at 0x{:x}: {:?}", string.address, string.content);
        let (raw, accounting) = self.call(ctx, &system, &user).await?;
        let value = extract_json_object(&raw)?;
        Ok(StringTranslation {
            address: string.address,
            natural_language: value["natural_language"].as_str().unwrap_or_default().to_string(),
            category: value["category"].as_str().map(str::to_string),
            accounting,
            error: None,
        })
    }

    async fn translate_summary(
        &self,
        ctx: &CallContext,
        disassembly: &Disassembly,
        function_translations: &[FunctionTranslation],
        _detail: TranslationDetail,
        retry: bool,
    ) -> ProviderResult<OverallSummary> {
        let system = "You are a reverse-engineering assistant producing an executive summary of a binary from its translated functions. Respond as a single JSON object with keys: text, purpose, key_behaviors (array of strings), security_notes.";
        let system = if retry { format!("{system}{JSON_SCHEMA_REMINDER}") } else { system.to_string() };
        let user = render_summary_context(disassembly, function_translations);
        let (raw, accounting) = self.call(ctx, &system, &user).await?;
        let value = extract_json_object(&raw)?;
        Ok(OverallSummary {
            text: value["text"].as_str().unwrap_or_default().to_string(),
            purpose: value["purpose"].as_str().map(str::to_string),
            key_behaviors: value["key_behaviors"]
                .as_array()
                .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default(),
            security_notes: value["security_notes"].as_str().map(str::to_string),
            accounting,
            error: None,
        })
    }

    async fn health_check(&self, ctx: &CallContext) -> ProviderResult<HealthStatus> {
        let started = Instant::now();
        match self.call(ctx, "Respond with JSON {\"ok\": true}.", "ping").await {
            Ok(_) => Ok(HealthStatus { healthy: true, latency_ms: started.elapsed().as_millis() as u64, error: None }),
            Err(e) => Ok(HealthStatus { healthy: false, latency_ms: started.elapsed().as_millis() as u64, error: Some(e.to_string()) }),
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { max_context_tokens: 200_000, supports_streaming: true, cost_per_1k_tokens: None }
    }

    fn provider_id(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_known_model_and_endpoint() {
        let provider = AnthropicProvider::new("key".to_string(), None, None);
        assert_eq!(provider.model(), DEFAULT_MODEL);
        assert_eq!(provider.endpoint, "https://api.anthropic.com/v1/messages");
    }

    #[test]
    fn honors_model_override() {
        let provider = AnthropicProvider::new("key".to_string(), Some("claude-3-opus".to_string()), None);
        assert_eq!(provider.model(), "claude-3-opus");
    }
}
