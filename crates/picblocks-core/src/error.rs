//! Error types for hashing and report I/O.

use thiserror::Error;

/// Failures while extracting block hashes from a disassembly report.
#[derive(Debug, Error)]
pub enum HashError {
    /// The escaped form of an instruction contains a character that cannot
    /// map to a single byte. This indicates a defective disassembly
    /// document and fails the whole sample.
    #[error(
        "escaped instruction at {offset:#x} contains codepoint {codepoint:#x}, expected single-byte characters"
    )]
    HashInputInvalid { offset: u64, codepoint: u32 },
    /// The external disassembler rejected the sample.
    #[error("disassembly failed: {0}")]
    DisassemblyFailed(String),
}

/// Failures while reading or writing report documents.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed report: {0}")]
    Json(#[from] serde_json::Error),
}
