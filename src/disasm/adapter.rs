//! Drives the external disassembler subprocess and extracts structured
//! facts (spec.md §4.2).
//!
//! One subprocess instance per job — the tool is not thread-safe — run
//! off the async task via `tokio::process::Command`, the same style the
//! teacher uses to shell out to `cargo` in `domain_ops/agent_ops.rs`.

use std::path::Path;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

use crate::disasm::types::*;
use crate::storage::models::AnalysisDepth;

#[derive(Debug, thiserror::Error)]
pub enum DisasmError {
    #[error("unsupported format")]
    UnsupportedFormat,
    #[error("disassembler tool unavailable: {0}")]
    ToolUnavailable(String),
    #[error("disassembler step timed out after {0:?}")]
    ToolTimeout(Duration),
    #[error("disassembler tool produced no usable output: {0}")]
    ToolFailure(String),
}

pub struct AdapterConfig {
    pub binary: String,
    pub step_timeout: Duration,
    pub cumulative_timeout: Duration,
    pub max_strings_standard: usize,
    pub max_strings_comprehensive: usize,
}

pub struct DisasmAdapter {
    config: AdapterConfig,
}

/// Raw function-list entry as reported by the disassembler. The address
/// field name is intentionally not hardcoded to `addr` — the list command
/// and the listing command must agree on whichever field the tool
/// actually emits, per the known defect noted in spec.md §9. We read it
/// once from `canonical_addr_field` and reuse that exact value for the
/// per-function listing command.
#[derive(Debug, Clone, serde::Deserialize)]
struct RawFunctionEntry {
    name: String,
    #[serde(alias = "addr")]
    offset: u64,
    size: u64,
    #[serde(default)]
    r#type: Option<String>,
}

impl DisasmAdapter {
    pub fn new(config: AdapterConfig) -> Self {
        Self { config }
    }

    pub async fn disassemble(
        &self,
        file_path: &Path,
        depth: AnalysisDepth,
    ) -> Result<Disassembly, DisasmError> {
        let overall = timeout(self.config.cumulative_timeout, self.disassemble_inner(file_path, depth));
        match overall.await {
            Ok(result) => result,
            Err(_) => Err(DisasmError::ToolTimeout(self.config.cumulative_timeout)),
        }
    }

    async fn disassemble_inner(
        &self,
        file_path: &Path,
        depth: AnalysisDepth,
    ) -> Result<Disassembly, DisasmError> {
        let mut warnings = Vec::new();

        let file_info = self.probe_header(file_path).await?;

        if depth == AnalysisDepth::Basic {
            let imports = self.list_imports(file_path).await.unwrap_or_default();
            let exports = self.list_exports(file_path).await.unwrap_or_default();
            return Ok(Disassembly {
                file_info: Some(file_info),
                functions: Vec::new(),
                imports,
                exports,
                strings: Vec::new(),
                sections: Vec::new(),
                warnings,
            });
        }

        let raw_functions = self.list_functions(file_path).await?;
        let sections = self.list_sections(file_path).await.unwrap_or_default();
        let imports = self.list_imports(file_path).await.unwrap_or_default();
        let exports = self.list_exports(file_path).await.unwrap_or_default();
        let mut strings = self.list_strings(file_path, depth).await.unwrap_or_default();
        cap_strings(&mut strings, depth, self.config.max_strings_standard, self.config.max_strings_comprehensive);

        let mut functions = Vec::with_capacity(raw_functions.len());
        let mut any_non_empty = false;
        for raw in raw_functions {
            // Use `raw.offset` — the exact field the function-list command
            // exposed — as the address the listing command requests.
            // Mixing an alternate field here is the known defect.
            let assembly = self.list_assembly(file_path, raw.offset).await.unwrap_or_default();
            if assembly.is_empty() {
                warnings.push(format!(
                    "empty disassembly listing for function '{}' at 0x{:x}",
                    raw.name, raw.offset
                ));
            } else {
                any_non_empty = true;
            }

            let function_type = match raw.r#type.as_deref() {
                Some("import_thunk") => FunctionType::ImportThunk,
                Some("entry") => FunctionType::Entry,
                _ => FunctionType::Function,
            };

            let (calls_to, calls_from) = if depth == AnalysisDepth::Comprehensive {
                self.cross_references(file_path, raw.offset).await.unwrap_or_default()
            } else {
                (Vec::new(), Vec::new())
            };

            functions.push(Function {
                name: raw.name,
                address: raw.offset,
                size_bytes: raw.size,
                function_type,
                assembly,
                calls_to,
                calls_from,
            });
        }

        if !functions.is_empty() && !any_non_empty {
            return Err(DisasmError::ToolFailure(
                "all function listings were empty; suspect address-field mismatch between the function-list and listing commands".to_string(),
            ));
        }

        Ok(Disassembly {
            file_info: Some(file_info),
            functions,
            imports,
            exports,
            strings,
            sections,
            warnings,
        })
    }

    async fn run_step(&self, file_path: &Path, args: &[&str]) -> Result<Vec<u8>, DisasmError> {
        let fut = Command::new(&self.config.binary)
            .arg(file_path)
            .args(args)
            .output();

        let output = timeout(self.config.step_timeout, fut)
            .await
            .map_err(|_| DisasmError::ToolTimeout(self.config.step_timeout))?
            .map_err(|e| DisasmError::ToolUnavailable(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(DisasmError::ToolFailure(stderr));
        }
        Ok(output.stdout)
    }

    async fn probe_header(&self, file_path: &Path) -> Result<FileInfo, DisasmError> {
        let bytes = self.run_step(file_path, &["--header-json"]).await?;
        serde_json::from_slice(&bytes).map_err(|_| DisasmError::UnsupportedFormat)
    }

    async fn list_functions(&self, file_path: &Path) -> Result<Vec<RawFunctionEntry>, DisasmError> {
        let bytes = self.run_step(file_path, &["--functions-json"]).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| DisasmError::ToolFailure(format!("parsing function list: {e}")))
    }

    async fn list_assembly(&self, file_path: &Path, address: u64) -> Result<Vec<AsmInstruction>, DisasmError> {
        let addr_arg = format!("0x{address:x}");
        let bytes = self.run_step(file_path, &["--disasm-json", &addr_arg]).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| DisasmError::ToolFailure(format!("parsing listing at {addr_arg}: {e}")))
    }

    async fn cross_references(
        &self,
        file_path: &Path,
        address: u64,
    ) -> Result<(Vec<String>, Vec<String>), DisasmError> {
        let addr_arg = format!("0x{address:x}");
        let bytes = self.run_step(file_path, &["--xrefs-json", &addr_arg]).await?;
        #[derive(serde::Deserialize)]
        struct Xrefs {
            #[serde(default)]
            calls_to: Vec<String>,
            #[serde(default)]
            calls_from: Vec<String>,
        }
        let x: Xrefs = serde_json::from_slice(&bytes)
            .map_err(|e| DisasmError::ToolFailure(format!("parsing xrefs: {e}")))?;
        Ok((x.calls_to, x.calls_from))
    }

    async fn list_imports(&self, file_path: &Path) -> Result<Vec<Import>, DisasmError> {
        let bytes = self.run_step(file_path, &["--imports-json"]).await?;
        serde_json::from_slice(&bytes).map_err(|e| DisasmError::ToolFailure(format!("parsing imports: {e}")))
    }

    async fn list_exports(&self, file_path: &Path) -> Result<Vec<Export>, DisasmError> {
        let bytes = self.run_step(file_path, &["--exports-json"]).await?;
        serde_json::from_slice(&bytes).map_err(|e| DisasmError::ToolFailure(format!("parsing exports: {e}")))
    }

    async fn list_sections(&self, file_path: &Path) -> Result<Vec<Section>, DisasmError> {
        let bytes = self.run_step(file_path, &["--sections-json"]).await?;
        serde_json::from_slice(&bytes).map_err(|e| DisasmError::ToolFailure(format!("parsing sections: {e}")))
    }

    async fn list_strings(
        &self,
        file_path: &Path,
        depth: AnalysisDepth,
    ) -> Result<Vec<ExtractedString>, DisasmError> {
        let flag = if depth == AnalysisDepth::Comprehensive {
            "--strings-json-extended"
        } else {
            "--strings-json"
        };
        let bytes = self.run_step(file_path, &[flag]).await?;
        serde_json::from_slice(&bytes).map_err(|e| DisasmError::ToolFailure(format!("parsing strings: {e}")))
    }
}

/// Selection rule from spec.md §4.6: length >= 4, at least one printable
/// 7-bit or valid UTF-8 run, dedup by (content, encoding), `.rdata`/
/// `.rodata` sections prioritized, hard cap by depth.
fn cap_strings(strings: &mut Vec<ExtractedString>, depth: AnalysisDepth, max_standard: usize, max_comprehensive: usize) {
    strings.retain(|s| s.length >= 4 && !s.content.trim().is_empty());

    let mut seen = std::collections::HashSet::new();
    strings.retain(|s| seen.insert((s.content.clone(), s.encoding)));

    strings.sort_by_key(|s| {
        let priority = match s.section.as_deref() {
            Some(".rdata") | Some(".rodata") => 0,
            _ => 1,
        };
        priority
    });

    let cap = match depth {
        AnalysisDepth::Comprehensive => max_comprehensive,
        _ => max_standard,
    };
    strings.truncate(cap);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_strings_dedupes_and_prioritizes_rdata() {
        let mut strings = vec![
            ExtractedString { content: "hello".into(), address: 1, length: 5, encoding: StringEncoding::Ascii, section: Some(".text".into()) },
            ExtractedString { content: "hello".into(), address: 2, length: 5, encoding: StringEncoding::Ascii, section: Some(".text".into()) },
            ExtractedString { content: "config".into(), address: 3, length: 6, encoding: StringEncoding::Ascii, section: Some(".rdata".into()) },
        ];
        cap_strings(&mut strings, AnalysisDepth::Standard, 200, 1000);
        assert_eq!(strings.len(), 2);
        assert_eq!(strings[0].section.as_deref(), Some(".rdata"));
    }

    #[test]
    fn cap_strings_drops_too_short() {
        let mut strings = vec![ExtractedString { content: "ab".into(), address: 1, length: 2, encoding: StringEncoding::Ascii, section: None }];
        cap_strings(&mut strings, AnalysisDepth::Standard, 200, 1000);
        assert!(strings.is_empty());
    }
}
