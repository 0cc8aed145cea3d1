//! Disassembly report data model.
//!
//! The disassembler is an external tool: it hands us a JSON document
//! describing one binary (functions, basic blocks, instruction encodings,
//! plus annotations for operand fields that encode absolute addresses).
//! This module is that document's schema; nothing here invokes a
//! disassembler.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ReportError;

/// One operand field that encodes an absolute address.
///
/// `start` and `width` span the encoded bytes within the instruction;
/// `value` is the address the field refers to. The escaper wildcards the
/// span when `value` falls inside the image range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressOperand {
    pub start: usize,
    pub width: usize,
    pub value: u64,
}

/// A single decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisasmInstruction {
    /// Address of the instruction within the image.
    pub offset: u64,
    /// Hex text of the encoded bytes, two characters per byte.
    pub bytes: String,
    /// Operand fields that encode absolute addresses (immediates and
    /// memory displacements).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operands: Vec<AddressOperand>,
}

impl DisasmInstruction {
    /// Number of binary bytes represented by the hex text. An odd-length
    /// hex string is a disassembler defect and floors here.
    #[must_use]
    pub fn byte_len(&self) -> u32 {
        (self.bytes.len() / 2) as u32
    }
}

/// A basic block: a straight-line instruction sequence ending at a
/// control-flow boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisasmBlock {
    pub instructions: Vec<DisasmInstruction>,
}

impl DisasmBlock {
    /// Instruction count.
    #[must_use]
    pub fn length(&self) -> usize {
        self.instructions.len()
    }
}

/// A function with its entry address and basic blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisasmFunction {
    /// Entry address within the image.
    pub offset: u64,
    pub blocks: Vec<DisasmBlock>,
}

/// Full disassembly report for one binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisasmReport {
    pub family: String,
    #[serde(default)]
    pub version: String,
    pub bitness: u32,
    pub sha256: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub is_library: bool,
    pub base_addr: u64,
    pub binary_size: u64,
    pub functions: Vec<DisasmFunction>,
}

impl DisasmReport {
    /// Parse a disassembly report from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Load a disassembly report from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ReportError> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&content)?)
    }

    /// The half-open address range `[base_addr, base_addr + binary_size)`
    /// covered by the mapped image.
    #[must_use]
    pub fn image_range(&self) -> (u64, u64) {
        (self.base_addr, self.base_addr.saturating_add(self.binary_size))
    }
}
