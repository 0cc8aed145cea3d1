//! Blockhash report: the hasher's output and the matcher's input.
//!
//! On disk this is a JSON document; the integer-keyed `blockhashes` maps
//! serialize with decimal-string keys and are coerced back to integers on
//! load (a parse failure is surfaced, never papered over).

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ReportError;

/// Compact fingerprint of one sample.
///
/// `blockhashes` maps a 32-bit block hash to a map from block byte-size to
/// the sorted, duplicate-free ids of the functions containing such a
/// block. Reports are immutable once extracted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockhashReport {
    pub family: String,
    #[serde(default)]
    pub version: String,
    pub bitness: u32,
    pub sha256: String,
    pub filename: String,
    pub filesize: u64,
    #[serde(default)]
    pub is_library: bool,
    pub min_block_size: usize,
    pub num_hashes: usize,
    pub num_functions: usize,
    pub num_functions_hashed: usize,
    pub num_blocks: usize,
    pub num_all_blocks: usize,
    pub block_bytes: u64,
    pub blockhashes: BTreeMap<u32, BTreeMap<u32, Vec<u32>>>,
}

impl BlockhashReport {
    /// Parse a report from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Load a report from a `.blocks` file.
    pub fn from_file(path: &Path) -> Result<Self, ReportError> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&content)?)
    }

    /// Write the report to a `.blocks` file.
    pub fn write_file(&self, path: &Path) -> Result<(), ReportError> {
        let json = self.to_json()?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Number of distinct block hashes in the report.
    #[must_use]
    pub fn num_block_hashes(&self) -> usize {
        self.blockhashes.len()
    }
}
