//! OpenAI chat-completions wire client, grounded on `ai/openai.rs`'s
//! `OpenAiClient`: same request/response structs, same
//! `response_format: {"type": "json_object"}` mode, same error-body
//! classification for rate limits and bad keys.

use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::disasm::types::{Disassembly, ExtractedString, Function, Import};
use crate::storage::models::TranslationDetail;

use super::{
    render_assembly, render_summary_context, Accounting, CallContext, Capabilities,
    FunctionTranslation, HealthStatus, ImportTranslation, JSON_SCHEMA_REMINDER, OverallSummary,
    Provider, ProviderError, ProviderResult, StringTranslation,
};

const DEFAULT_MODEL: &str = "gpt-4o-mini";

pub struct OpenAiProvider {
    api_key: String,
    client: reqwest::Client,
    model: String,
    base_url: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
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

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

impl OpenAiProvider {
    pub fn new(api_key: String, model: Option<String>, endpoint: Option<String>) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: endpoint.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
        }
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
            max_tokens: Some(4096),
            response_format: ResponseFormat { format_type: "json_object" },
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .timeout(ctx.remaining())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            if let Ok(error_response) = serde_json::from_str::<ErrorResponse>(&body) {
                if matches!(error_response.error.error_type.as_str(), "insufficient_quota" | "rate_limit_exceeded") {
                    return Err(ProviderError::Api { status: 429, body: error_response.error.message });
                }
            }
            return Err(ProviderError::Api { status: status.as_u16(), body });
        }

        let parsed: ChatResponse = serde_json::from_str(&body)?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ProviderError::SchemaMismatch("no choices in OpenAI response".to_string()))?;

        let accounting = Accounting {
            tokens_in: parsed.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0),
            tokens_out: parsed.usage.as_ref().map(|u| u.completion_tokens).unwrap_or(0),
            latency_ms: started.elapsed().as_millis() as u64,
        };
        Ok((content, accounting))
    }
}

fn parse_json(raw: &str) -> ProviderResult<serde_json::Value> {
    super::extract_json_object(raw)
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn translate_function(
        &self,
        ctx: &CallContext,
        function: &Function,
        detail: TranslationDetail,
        retry: bool,
    ) -> ProviderResult<FunctionTranslation> {
        let mut system = "You are a reverse-engineering assistant. Explain disassembled functions precisely. Respond with a JSON object with keys: natural_language, purpose, parameters, security_notes, risk_score.".to_string();
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
        let value = parse_json(&raw)?;
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
        let mut system = "You are a reverse-engineering assistant. Explain an imported API call's role in one or two sentences. Respond with a JSON object with key: natural_language.".to_string();
        if retry {
            system.push_str(JSON_SCHEMA_REMINDER);
        }
        let user = format!("Import `{}!{}` referenced by: {}.", import.library, import.name, referencing_functions.join(", "));
        let (raw, accounting) = self.call(ctx, system, user).await?;
        let value = parse_json(&raw)?;
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
        let mut system = "You are a reverse-engineering assistant. Explain the likely purpose of a string literal. Respond with a JSON object with keys: natural_language, category.".to_string();
        if retry {
            system.push_str(JSON_SCHEMA_REMINDER);
        }
        let user = format!("String at 0x{:x}: {:?}", string.address, string.content);
        let (raw, accounting) = self.call(ctx, system, user).await?;
        let value = parse_json(&raw)?;
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
        let mut system = "You are a reverse-engineering assistant producing an executive summary from translated functions. Respond with a JSON object with keys: text, purpose, key_behaviors, security_notes.".to_string();
        if retry {
            system.push_str(JSON_SCHEMA_REMINDER);
        }
        let user = render_summary_context(disassembly, function_translations);
        let (raw, accounting) = self.call(ctx, system, user).await?;
        let value = parse_json(&raw)?;
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
            .call(ctx, "Respond with JSON.".to_string(), "Hello, this is a health check. Respond with {\"status\": \"OK\"}".to_string())
            .await;
        match result {
            Ok(_) => Ok(HealthStatus { healthy: true, latency_ms: started.elapsed().as_millis() as u64, error: None }),
            Err(e) => Ok(HealthStatus { healthy: false, latency_ms: started.elapsed().as_millis() as u64, error: Some(e.to_string()) }),
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { max_context_tokens: 128_000, supports_streaming: true, cost_per_1k_tokens: None }
    }

    fn provider_id(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_known_model_and_base_url() {
        let provider = OpenAiProvider::new("key".to_string(), None, None);
        assert_eq!(provider.model(), DEFAULT_MODEL);
        assert_eq!(provider.base_url, "https://api.openai.com/v1");
    }
}
