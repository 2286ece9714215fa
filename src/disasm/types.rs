//! Disassembly extraction contract (spec.md §4.2).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryFormat {
    Pe,
    Elf,
    Macho,
    Raw,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub format: BinaryFormat,
    pub architecture: String,
    pub bits: u32,
    pub entry_point: u64,
    pub size_bytes: u64,
    pub md5: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionType {
    Function,
    ImportThunk,
    Entry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsmInstruction {
    pub address: u64,
    pub bytes_hex: String,
    pub mnemonic: String,
    pub operands: String,
    pub comment: Option<String>,
    #[serde(default)]
    pub xrefs_to: Vec<u64>,
    #[serde(default)]
    pub xrefs_from: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub address: u64,
    pub size_bytes: u64,
    #[serde(rename = "type")]
    pub function_type: FunctionType,
    pub assembly: Vec<AsmInstruction>,
    #[serde(default)]
    pub calls_to: Vec<String>,
    #[serde(default)]
    pub calls_from: Vec<String>,
}

impl Function {
    pub fn has_empty_listing(&self) -> bool {
        self.assembly.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Import {
    pub library: String,
    pub name: String,
    pub address: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Export {
    pub name: String,
    pub address: u64,
    pub ordinal: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StringEncoding {
    Ascii,
    Utf8,
    Utf16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedString {
    pub content: String,
    pub address: u64,
    pub length: u32,
    pub encoding: StringEncoding,
    pub section: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub name: String,
    pub vaddr: u64,
    pub size: u64,
    pub flags: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Disassembly {
    pub file_info: Option<FileInfo>,
    pub functions: Vec<Function>,
    pub imports: Vec<Import>,
    pub exports: Vec<Export>,
    pub strings: Vec<ExtractedString>,
    pub sections: Vec<Section>,
    pub warnings: Vec<String>,
}
