//! Position-independent code hashing for binary similarity attribution.
//!
//! This crate provides:
//! - [`DisasmReport`]: schema of the disassembly documents handed over by
//!   the external disassembler
//! - instruction escaping: wildcards operand bytes that encode absolute
//!   addresses inside the image, so rebasing does not change hashes
//! - [`BlockHasher`]: turns a disassembly report into a [`BlockhashReport`],
//!   the compact per-sample fingerprint the corpus index and matcher consume

#![forbid(unsafe_code)]

pub mod error;
pub mod escape;
pub mod hasher;
pub mod model;
pub mod report;

pub use error::{HashError, ReportError};
pub use hasher::{
    BlockHasher, DEFAULT_MIN_BLOCK_SIZE, Disassembler, FunctionBlockhash,
    parse_base_addr_from_filename, parse_bitness_from_filename,
};
pub use model::{AddressOperand, DisasmBlock, DisasmFunction, DisasmInstruction, DisasmReport};
pub use report::BlockhashReport;
