//! Gemini `generateContent` wire client. Grounded on the same
//! request/response shape as `ai/openai.rs` but adapted to Google's
//! `contents`/`parts` envelope and query-string API key, matching the
//! pattern `ai::AiConfig::default` uses for reading `GEMINI_API_KEY`.

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

const DEFAULT_MODEL: &str = "gemini-1.5-flash";

pub struct GeminiProvider {
    api_key: String,
    client: reqwest::Client,
    model: String,
    base_url: String,
}

#[derive(Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Serialize)]
struct Part {
    text: String,
}

#[derive(Serialize)]
struct GenerationConfig {
    #[serde(rename = "responseMimeType")]
    response_mime_type: &'static str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata", default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
struct Candidate {
    content: ResponseContent,
}

#[derive(Deserialize)]
struct ResponseContent {
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    text: String,
}

#[derive(Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u64,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u64,
}

impl GeminiProvider {
    pub fn new(api_key: String, model: Option<String>, endpoint: Option<String>) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: endpoint.unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string()),
        }
    }

    async fn call(&self, ctx: &CallContext, system_prompt: &str, user_prompt: &str) -> ProviderResult<(String, Accounting)> {
        if ctx.cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        let started = Instant::now();
        let combined = format!("{system_prompt}\n\n{user_prompt}");
        let request = GenerateRequest {
            contents: vec![Content { role: "user", parts: vec![Part { text: combined }] }],
            generation_config: GenerationConfig { response_mime_type: "application/json" },
        };

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let response = self.client.post(&url).json(&request).timeout(ctx.remaining()).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status, body });
        }

        let parsed: GenerateResponse = response.json().await?;
        let text = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or_else(|| ProviderError::SchemaMismatch("no candidates in Gemini response".to_string()))?;

        let accounting = Accounting {
            tokens_in: parsed.usage_metadata.as_ref().map(|u| u.prompt_token_count).unwrap_or(0),
            tokens_out: parsed.usage_metadata.as_ref().map(|u| u.candidates_token_count).unwrap_or(0),
            latency_ms: started.elapsed().as_millis() as u64,
        };
        Ok((text, accounting))
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    async fn translate_function(
        &self,
        ctx: &CallContext,
        function: &Function,
        detail: TranslationDetail,
        retry: bool,
    ) -> ProviderResult<FunctionTranslation> {
        let system = "You are a reverse-engineering assistant. Explain disassembled functions precisely. Respond with a JSON object with keys: natural_language, purpose, parameters, security_notes, risk_score.";
        let system = if retry { format!("{system}{JSON_SCHEMA_REMINDER}") } else { system.to_string() };
        let user = format!(
            "Function `{}` at 0x{:x}, {} bytes, {:?} detail.\nAssembly:\n{}",
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
        let system = "You are a reverse-engineering assistant. Explain an imported API call's role in one or two sentences. Respond with a JSON object with key: natural_language.";
        let system = if retry { format!("{system}{JSON_SCHEMA_REMINDER}") } else { system.to_string() };
        let user = format!("Import `{}!{}` referenced by: {}.", import.library, import.name, referencing_functions.join(", "));
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
        let system = "You are a reverse-engineering assistant. Explain the likely purpose of a string literal. Respond with a JSON object with keys: natural_language, category.";
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
        let system = "You are a reverse-engineering assistant producing an executive summary from translated functions. Respond with a JSON object with keys: text, purpose, key_behaviors, security_notes.";
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
        match self.call(ctx, "Respond with JSON.", "Respond with {\"status\": \"OK\"}").await {
            Ok(_) => Ok(HealthStatus { healthy: true, latency_ms: started.elapsed().as_millis() as u64, error: None }),
            Err(e) => Ok(HealthStatus { healthy: false, latency_ms: started.elapsed().as_millis() as u64, error: Some(e.to_string()) }),
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { max_context_tokens: 1_000_000, supports_streaming: false, cost_per_1k_tokens: None }
    }

    fn provider_id(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_known_model() {
        let provider = GeminiProvider::new("key".to_string(), None, None);
        assert_eq!(provider.model(), DEFAULT_MODEL);
    }
}
