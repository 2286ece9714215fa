//! Local / self-hosted provider: speaks the same OpenAI-compatible
//! chat-completions wire format as [`super::openai`] against an
//! operator-supplied `endpoint_url`, with no API key required. Most
//! self-hosted inference servers (vLLM, llama.cpp server, Ollama's
//! OpenAI-compat route) implement exactly this surface.

use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::disasm::types::{Disassembly, ExtractedString, Function, Import};
use crate::storage::models::TranslationDetail;

use super::{
    extract_json_object, render_assembly, render_summary_context, Accounting, CallContext,
    Capabilities, FunctionTranslation, HealthStatus, ImportTranslation, JSON_SCHEMA_REMINDER,
    OverallSummary, Provider, ProviderError, ProviderResult, StringTranslation,
};

const DEFAULT_MODEL: &str = "local-model";

pub struct LocalProvider {
    api_key: Option<String>,
    client: reqwest::Client,
    model: String,
    base_url: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl LocalProvider {
    pub fn new(api_key: Option<String>, model: Option<String>, endpoint: Option<String>) -> ProviderResult<Self> {
        let base_url = endpoint.ok_or_else(|| {
            ProviderError::SchemaMismatch("local provider requires endpoint_url".to_string())
        })?;
        Ok(Self {
            api_key,
            client: reqwest::Client::new(),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url,
        })
    }

    async fn call(&self, ctx: &CallContext, system_prompt: String, user_prompt: String) -> ProviderResult<(String, Accounting)> {
        if ctx.cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        let started = Instant::now();
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage { role: "system", content: system_prompt },
                ChatMessage { role: "user", content: user_prompt },
            ],
            max_tokens: 4096,
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&request)
            .timeout(ctx.remaining());
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }
        let response = builder.send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status, body });
        }

        let parsed: ChatResponse = response.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ProviderError::SchemaMismatch("no choices in local provider response".to_string()))?;

        let accounting = Accounting {
            tokens_in: parsed.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0),
            tokens_out: parsed.usage.as_ref().map(|u| u.completion_tokens).unwrap_or(0),
            latency_ms: started.elapsed().as_millis() as u64,
        };
        Ok((content, accounting))
    }
}

#[async_trait]
impl Provider for LocalProvider {
    async fn translate_function(
        &self,
        ctx: &CallContext,
        function: &Function,
        detail: TranslationDetail,
        retry: bool,
    ) -> ProviderResult<FunctionTranslation> {
        let mut system = "You are a reverse-engineering assistant. Explain disassembled functions precisely. Respond with only a JSON object with keys: natural_language, purpose, parameters, security_notes, risk_score.".to_string();
        if retry {
            system.push_str(JSON_SCHEMA_REMINDER);
        }
        let user = format!(
            "Function `{}` at 0x{:x}, {} bytes, {:?} detail.\nAssembly:\n{}",
            function.name,
            function.address,
            function.size_bytes,
            detail,
            render_assembly(function),
        );
        let (raw, accounting) = self.call(ctx, system, user).await?;
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
        let mut system = "You are a reverse-engineering assistant. Explain an imported API call's role briefly. Respond with only a JSON object with key: natural_language.".to_string();
        if retry {
            system.push_str(JSON_SCHEMA_REMINDER);
        }
        let user = format!("Import `{}!{}` referenced by: {}.", import.library, import.name, referencing_functions.join(", "));
        let (raw, accounting) = self.call(ctx, system, user).await?;
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
        let mut system = "You are a reverse-engineering assistant. Explain the likely purpose of a string literal. Respond with only a JSON object with keys: natural_language, category.".to_string();
        if retry {
            system.push_str(JSON_SCHEMA_REMINDER);
        }
        let user = format!("String at 0x{:x}: {:?}", string.address, string.content);
        let (raw, accounting) = self.call(ctx, system, user).await?;
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
        let mut system = "You are a reverse-engineering assistant producing an executive summary from translated functions. Respond with only a JSON object with keys: text, purpose, key_behaviors, security_notes.".to_string();
        if retry {
            system.push_str(JSON_SCHEMA_REMINDER);
        }
        let user = render_summary_context(disassembly, function_translations);
        let (raw, accounting) = self.call(ctx, system, user).await?;
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
        let result = self
            .call(ctx, "Respond with JSON.".to_string(), "Respond with {\"status\": \"OK\"}".to_string())
            .await;
        match result {
            Ok(_) => Ok(HealthStatus { healthy: true, latency_ms: started.elapsed().as_millis() as u64, error: None }),
            Err(e) => Ok(HealthStatus { healthy: false, latency_ms: started.elapsed().as_millis() as u64, error: Some(e.to_string()) }),
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { max_context_tokens: 32_000, supports_streaming: false, cost_per_1k_tokens: Some(0.0) }
    }

    fn provider_id(&self) -> &str {
        "local"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_endpoint_url() {
        let result = LocalProvider::new(None, None, None);
        assert!(result.is_err());
    }

    #[test]
    fn accepts_endpoint_without_api_key() {
        let provider = LocalProvider::new(None, None, Some("http://localhost:8000/v1".to_string())).unwrap();
        assert_eq!(provider.model(), DEFAULT_MODEL);
    }
}
