//! C2 — disassembler adapter: drives the external tool and produces
//! structured facts about an uploaded binary.

pub mod adapter;
pub mod types;

pub use adapter::{AdapterConfig, DisasmAdapter, DisasmError};
pub use types::Disassembly;
