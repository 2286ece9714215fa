//! C3 — provider abstraction: a uniform interface over multiple
//! HTTP-backed LLMs, constructed on demand from request parameters
//! (spec.md §4.3). Generalizes the teacher's `LlmClient` trait
//! (`agentic/llm_client.rs`) from a fixed Anthropic/OpenAI pair into an
//! open set of translation operations and providers.

pub mod anthropic;
pub mod gemini;
pub mod local;
pub mod openai;
pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::disasm::types::{Disassembly, ExtractedString, Function, Import};
use crate::storage::models::TranslationDetail;

pub use registry::{ProviderKey, Registry};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("response json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("upstream api error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("response did not match the expected schema: {0}")]
    SchemaMismatch(String),
    #[error("missing api_key for provider")]
    MissingApiKey,
    #[error("unknown provider_id: {0}")]
    UnknownProvider(String),
    #[error("request timed out")]
    Timeout,
    #[error("cancelled")]
    Cancelled,
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Accounting + cancellation context threaded through every provider
/// call (spec.md §4.3 "ctx carries cancellation, deadline, and accounting
/// sinks").
#[derive(Clone)]
pub struct CallContext {
    pub deadline: std::time::Instant,
    pub cancel: tokio_util_cancel::CancelToken,
}

/// Minimal cooperative cancellation token (no external crate needed for
/// a single bool flag shared via Arc<AtomicBool>).
pub mod tokio_util_cancel {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    pub struct CancelToken(Arc<AtomicBool>);

    impl CancelToken {
        pub fn new() -> Self {
            Self(Arc::new(AtomicBool::new(false)))
        }
        pub fn cancel(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
        pub fn is_cancelled(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }
}

impl CallContext {
    pub fn new(deadline: std::time::Instant) -> Self {
        Self { deadline, cancel: tokio_util_cancel::CancelToken::new() }
    }

    pub fn remaining(&self) -> std::time::Duration {
        self.deadline.saturating_duration_since(std::time::Instant::now())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Accounting {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionTranslation {
    pub function_address: u64,
    pub natural_language: String,
    pub purpose: Option<String>,
    pub parameters: Vec<String>,
    pub security_notes: Option<String>,
    pub risk_score: Option<f32>,
    #[serde(flatten)]
    pub accounting: Accounting,
    /// Set when this item failed after the single retry (spec.md §4.6
    /// "record translation_error for that item and continue"); in that
    /// case the other fields above are empty/default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportTranslation {
    pub library: String,
    pub name: String,
    pub natural_language: String,
    #[serde(flatten)]
    pub accounting: Accounting,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StringTranslation {
    pub address: u64,
    pub natural_language: String,
    pub category: Option<String>,
    #[serde(flatten)]
    pub accounting: Accounting,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverallSummary {
    pub text: String,
    pub purpose: Option<String>,
    pub key_behaviors: Vec<String>,
    pub security_notes: Option<String>,
    #[serde(flatten)]
    pub accounting: Accounting,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    pub max_context_tokens: u32,
    pub supports_streaming: bool,
    pub cost_per_1k_tokens: Option<f64>,
}

/// Uniform provider interface (spec.md §4.3). Each wire-protocol family
/// (OpenAI-, Anthropic-, Gemini-style, and local OpenAI-compatible
/// endpoints) implements this trait.
///
/// Every `translate_*` call takes a `retry` flag: `false` on the first
/// attempt, `true` when the orchestrator is re-issuing the same call
/// after a JSON parse/schema failure (spec.md §4.6 "one retry with an
/// explicit 'return only JSON matching this schema' reminder"). A
/// provider honoring `retry` appends [`JSON_SCHEMA_REMINDER`] to its
/// prompt so the second attempt is a distinct request, not a repeat.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn translate_function(
        &self,
        ctx: &CallContext,
        function: &Function,
        detail: TranslationDetail,
        retry: bool,
    ) -> ProviderResult<FunctionTranslation>;

    async fn translate_import(
        &self,
        ctx: &CallContext,
        import: &Import,
        referencing_functions: &[String],
        detail: TranslationDetail,
        retry: bool,
    ) -> ProviderResult<ImportTranslation>;

    async fn translate_string(
        &self,
        ctx: &CallContext,
        string: &ExtractedString,
        detail: TranslationDetail,
        retry: bool,
    ) -> ProviderResult<StringTranslation>;

    async fn translate_summary(
        &self,
        ctx: &CallContext,
        disassembly: &Disassembly,
        function_translations: &[FunctionTranslation],
        detail: TranslationDetail,
        retry: bool,
    ) -> ProviderResult<OverallSummary>;

    async fn health_check(&self, ctx: &CallContext) -> ProviderResult<HealthStatus>;

    fn capabilities(&self) -> Capabilities;

    fn provider_id(&self) -> &str;

    fn model(&self) -> &str;
}

/// Appended to a provider's system prompt on the retried attempt of a
/// `translate_*` call (spec.md §4.6). Kept as one shared string so the
/// reminder wording is consistent across wire protocols.
pub const JSON_SCHEMA_REMINDER: &str = "\n\nIMPORTANT: your previous response did not parse as JSON matching the schema above. Return only a JSON object matching that schema - no markdown code fences, no commentary.";

/// Render a function's full assembly listing for the function prompt:
/// mnemonic + operands per instruction plus each instruction's
/// cross-references, followed by the function's own caller/callee
/// names (spec.md §1, §4.6 "full assembly listing ... with
/// cross-references ... caller/callee names").
pub fn render_assembly(function: &Function) -> String {
    let mut lines: Vec<String> = function
        .assembly
        .iter()
        .map(|insn| {
            let mut line = format!("0x{:x}: {} {}", insn.address, insn.mnemonic, insn.operands);
            if !insn.xrefs_to.is_empty() {
                line.push_str(&format!("  ; xrefs_to: {}", format_addrs(&insn.xrefs_to)));
            }
            if !insn.xrefs_from.is_empty() {
                line.push_str(&format!("  ; xrefs_from: {}", format_addrs(&insn.xrefs_from)));
            }
            line
        })
        .collect();

    if !function.calls_to.is_empty() {
        lines.push(format!("calls_to: {}", function.calls_to.join(", ")));
    }
    if !function.calls_from.is_empty() {
        lines.push(format!("calls_from: {}", function.calls_from.join(", ")));
    }

    lines.join("\n")
}

fn format_addrs(addrs: &[u64]) -> String {
    addrs.iter().map(|a| format!("0x{a:x}")).collect::<Vec<_>>().join(", ")
}

/// Render the full summary prompt context (spec.md §4.6 "Summary
/// prompt": header info, counts, top-10 functions by size, full list of
/// imports, selected strings) plus the per-function translations the
/// summary should tie together.
pub fn render_summary_context(disassembly: &Disassembly, function_translations: &[FunctionTranslation]) -> String {
    let mut out = String::new();

    if let Some(info) = &disassembly.file_info {
        out.push_str(&format!(
            "Header: format={:?} architecture={} bits={} entry_point=0x{:x} size_bytes={} sha256={}\n",
            info.format, info.architecture, info.bits, info.entry_point, info.size_bytes, info.sha256
        ));
    }
    out.push_str(&format!(
        "Counts: {} functions, {} imports, {} exports, {} strings, {} sections\n",
        disassembly.functions.len(),
        disassembly.imports.len(),
        disassembly.exports.len(),
        disassembly.strings.len(),
        disassembly.sections.len(),
    ));

    let mut by_size: Vec<&Function> = disassembly.functions.iter().collect();
    by_size.sort_by(|a, b| b.size_bytes.cmp(&a.size_bytes));
    out.push_str("Top functions by size:\n");
    for f in by_size.into_iter().take(10) {
        out.push_str(&format!("- {} at 0x{:x}, {} bytes\n", f.name, f.address, f.size_bytes));
    }

    out.push_str("Imports:\n");
    for import in &disassembly.imports {
        out.push_str(&format!("- {}!{}\n", import.library, import.name));
    }

    out.push_str("Strings:\n");
    for s in &disassembly.strings {
        out.push_str(&format!("- 0x{:x}: {:?}\n", s.address, s.content));
    }

    out.push_str("Function summaries:\n");
    for t in function_translations {
        out.push_str(&format!("- 0x{:x}: {}\n", t.function_address, t.natural_language));
    }

    out
}

/// Extract the first top-level JSON object from a raw LLM text response,
/// tolerating markdown code fences — generalized from the teacher's
/// `ai::utils::clean_dsl_response` / `parse_structured_response`.
pub fn extract_json_object(raw: &str) -> ProviderResult<serde_json::Value> {
    let cleaned = clean_response(raw);
    let start = cleaned.find('{');
    let end = cleaned.rfind('}');
    match (start, end) {
        (Some(s), Some(e)) if e >= s => {
            serde_json::from_str(&cleaned[s..=e]).map_err(ProviderError::Json)
        }
        _ => Err(ProviderError::SchemaMismatch(format!(
            "no JSON object found in response: {cleaned}"
        ))),
    }
}

fn clean_response(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        if let Some(end) = rest.rfind("```") {
            return rest[..end].trim().to_string();
        }
        return rest.trim().to_string();
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_object_strips_code_fence() {
        let raw = "```json\n{\"a\": 1}\n```";
        let value = extract_json_object(raw).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn extract_json_object_rejects_non_json() {
        assert!(extract_json_object("not json at all").is_err());
    }
}
