//! Block hashing: turns a disassembly report into a blockhash report.
//!
//! A block's hash is a SHA-256 digest (truncated to 32 or 64 bits,
//! little-endian) over the concatenated escaped instruction encodings.
//! Because escaping wildcards image-absolute operand bytes, blocks hash
//! identically regardless of the image's load address.

use std::collections::BTreeMap;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::HashError;
use crate::model::{DisasmBlock, DisasmFunction, DisasmInstruction, DisasmReport};
use crate::report::BlockhashReport;

/// Default minimum instruction count for a block to be hashed.
pub const DEFAULT_MIN_BLOCK_SIZE: usize = 4;

/// External disassembler boundary.
///
/// Implementations wrap an actual decoder; the hasher only ever calls
/// through this trait and treats failures as fatal for the sample.
pub trait Disassembler {
    /// Disassemble a mapped image at a known base address.
    fn disassemble_buffer(
        &self,
        buffer: &[u8],
        base_addr: u64,
        bitness: Option<u32>,
    ) -> Result<DisasmReport, HashError>;

    /// Disassemble a raw, unmapped file buffer (e.g. a PE on disk).
    fn disassemble_unmapped_buffer(&self, buffer: &[u8]) -> Result<DisasmReport, HashError>;
}

/// One aggregated hash within a single function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionBlockhash {
    pub hash: u32,
    pub size: u32,
    /// How many of the function's blocks share this hash.
    pub count: u32,
}

/// Extracts position-independent block hashes from disassembly reports.
#[derive(Debug, Clone, Copy)]
pub struct BlockHasher {
    min_block_size: usize,
}

impl Default for BlockHasher {
    fn default() -> Self {
        Self {
            min_block_size: DEFAULT_MIN_BLOCK_SIZE,
        }
    }
}

impl BlockHasher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_min_block_size(min_block_size: usize) -> Self {
        Self { min_block_size }
    }

    /// Hash an already-disassembled report. This is the preferred entry
    /// point; it never invokes the disassembler.
    pub fn process_disasm(&self, report: &DisasmReport) -> Result<BlockhashReport, HashError> {
        let (image_lower, image_upper) = report.image_range();
        let mut blockhashes: BTreeMap<u32, BTreeMap<u32, Vec<u32>>> = BTreeMap::new();
        let mut block_bytes = 0u64;
        let mut num_blocks = 0usize;
        let mut num_all_blocks = 0usize;
        let mut num_functions_hashed = 0usize;
        for (function_id, function) in report.functions.iter().enumerate() {
            let function_id = function_id as u32;
            let mut hashed_any = false;
            for block in &function.blocks {
                num_all_blocks += 1;
                if block.length() < self.min_block_size {
                    continue;
                }
                num_blocks += 1;
                hashed_any = true;
                let block_size = block_byte_size(block);
                let block_hash = self.block_hash(block, image_lower, image_upper)?;
                let fids = blockhashes
                    .entry(block_hash)
                    .or_default()
                    .entry(block_size)
                    .or_default();
                // Functions are visited in order, so a repeated hash from
                // the same function lands adjacent; the lists stay sorted
                // and duplicate-free, and block_bytes counts each
                // (hash, size, function) association exactly once.
                if fids.last() != Some(&function_id) {
                    fids.push(function_id);
                    block_bytes += u64::from(block_size);
                }
            }
            if hashed_any {
                num_functions_hashed += 1;
            }
        }
        let num_hashes = blockhashes.values().map(BTreeMap::len).sum();
        Ok(BlockhashReport {
            family: report.family.clone(),
            version: report.version.clone(),
            bitness: report.bitness,
            sha256: report.sha256.clone(),
            filename: report.filename.clone(),
            filesize: report.binary_size,
            is_library: report.is_library,
            min_block_size: self.min_block_size,
            num_hashes,
            num_functions: report.functions.len(),
            num_functions_hashed,
            num_blocks,
            num_all_blocks,
            block_bytes,
            blockhashes,
        })
    }

    /// Disassemble a buffer through the collaborator and hash the result.
    ///
    /// The mapped-image path is used when the filename carries a `_0x`
    /// base-address token or a base address is supplied; otherwise the
    /// buffer is treated as an unmapped file.
    pub fn process_bytes<D: Disassembler>(
        &self,
        disassembler: &D,
        buffer: &[u8],
        filename: &str,
        bitness: Option<u32>,
        base_address: Option<u64>,
    ) -> Result<BlockhashReport, HashError> {
        let mut report = if filename.contains("_0x") || base_address.is_some() {
            let base_addr = base_address
                .or_else(|| parse_base_addr_from_filename(filename))
                .unwrap_or(0);
            let bitness = bitness.or_else(|| parse_bitness_from_filename(filename));
            disassembler.disassemble_buffer(buffer, base_addr, bitness)?
        } else {
            disassembler.disassemble_unmapped_buffer(buffer)?
        };
        report.filename = basename(filename).to_string();
        self.process_disasm(&report)
    }

    /// 32-bit block hash: first four digest bytes as little-endian u32.
    pub fn block_hash(
        &self,
        block: &DisasmBlock,
        lower_addr: u64,
        upper_addr: u64,
    ) -> Result<u32, HashError> {
        let digest = block_digest(block, lower_addr, upper_addr)?;
        Ok(u32::from_le_bytes([
            digest[0], digest[1], digest[2], digest[3],
        ]))
    }

    /// 64-bit variant: first eight digest bytes as little-endian u64.
    /// The stored database format remains 32-bit.
    pub fn block_hash64(
        &self,
        block: &DisasmBlock,
        lower_addr: u64,
        upper_addr: u64,
    ) -> Result<u64, HashError> {
        let digest = block_digest(block, lower_addr, upper_addr)?;
        Ok(u64::from_le_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
        ]))
    }

    /// Hashes of a single function's qualifying blocks, with duplicate
    /// hashes within the function folded into a count.
    pub fn function_blockhashes(
        &self,
        report: &DisasmReport,
        function: &DisasmFunction,
    ) -> Result<Vec<FunctionBlockhash>, HashError> {
        let (image_lower, image_upper) = report.image_range();
        let mut by_hash: BTreeMap<u32, FunctionBlockhash> = BTreeMap::new();
        for block in &function.blocks {
            if block.length() < self.min_block_size {
                continue;
            }
            let hash = self.block_hash(block, image_lower, image_upper)?;
            let size = block_byte_size(block);
            by_hash
                .entry(hash)
                .or_insert(FunctionBlockhash {
                    hash,
                    size,
                    count: 0,
                })
                .count += 1;
        }
        Ok(by_hash.into_values().collect())
    }
}

/// Sum of encoded byte lengths across the block's instructions.
fn block_byte_size(block: &DisasmBlock) -> u32 {
    block
        .instructions
        .iter()
        .map(DisasmInstruction::byte_len)
        .sum()
}

fn block_digest(
    block: &DisasmBlock,
    lower_addr: u64,
    upper_addr: u64,
) -> Result<[u8; 32], HashError> {
    let mut input: Vec<u8> = Vec::new();
    for instruction in &block.instructions {
        let escaped = instruction.escaped_binary(lower_addr, upper_addr);
        for character in escaped.chars() {
            let codepoint = character as u32;
            if codepoint >= 256 {
                return Err(HashError::HashInputInvalid {
                    offset: instruction.offset,
                    codepoint,
                });
            }
            input.push(codepoint as u8);
        }
    }
    Ok(Sha256::digest(&input).into())
}

/// First `0x`-prefixed token of at least five hex digits anywhere in the
/// filename, read as a base address (at most 16 digits are consumed).
#[must_use]
pub fn parse_base_addr_from_filename(filename: &str) -> Option<u64> {
    let mut search = filename;
    while let Some(pos) = search.find("0x") {
        let rest = &search[pos + 2..];
        let run = rest.chars().take_while(char::is_ascii_hexdigit).count();
        if run >= 5 {
            let digits = &rest[..run.min(16)];
            return u64::from_str_radix(digits, 16).ok();
        }
        search = rest;
    }
    None
}

/// Bitness inferred from the filename: a trailing `0x` token of 8 to 16
/// hex digits marks a mapped-image dump (8 digits means a 32-bit address,
/// anything longer 64-bit); otherwise the leftmost `x32`/`x64` marker
/// decides.
#[must_use]
pub fn parse_bitness_from_filename(filename: &str) -> Option<u32> {
    let mut search = filename;
    while let Some(pos) = search.find("0x") {
        let rest = &search[pos + 2..];
        let run = rest.chars().take_while(char::is_ascii_hexdigit).count();
        if run == rest.len() && (8..=16).contains(&run) {
            return Some(if run == 8 { 32 } else { 64 });
        }
        search = rest;
    }
    match (filename.find("x32"), filename.find("x64")) {
        (Some(a), Some(b)) => Some(if a < b { 32 } else { 64 }),
        (Some(_), None) => Some(32),
        (None, Some(_)) => Some(64),
        (None, None) => None,
    }
}

fn basename(filename: &str) -> &str {
    Path::new(filename)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(filename)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AddressOperand, DisasmBlock, DisasmFunction, DisasmInstruction};

    fn ins(bytes: &str) -> DisasmInstruction {
        DisasmInstruction {
            offset: 0x401000,
            bytes: bytes.to_string(),
            operands: Vec::new(),
        }
    }

    fn ins_abs(bytes: &str, start: usize, width: usize, value: u64) -> DisasmInstruction {
        DisasmInstruction {
            offset: 0x401000,
            bytes: bytes.to_string(),
            operands: vec![AddressOperand { start, width, value }],
        }
    }

    fn block(instructions: Vec<DisasmInstruction>) -> DisasmBlock {
        DisasmBlock { instructions }
    }

    /// A four-instruction block (12 encoded bytes) referencing `target`
    /// through an absolute operand.
    fn block_with_target(target: u64) -> DisasmBlock {
        block(vec![
            ins("55"),
            ins("89e5"),
            ins_abs(
                &format!("a1{:08x}", (target as u32).swap_bytes()),
                1,
                4,
                target,
            ),
            ins("31c0"),
        ])
    }

    fn report(base_addr: u64, functions: Vec<DisasmFunction>) -> DisasmReport {
        DisasmReport {
            family: "acme".to_string(),
            version: String::new(),
            bitness: 32,
            sha256: "00".repeat(32),
            filename: "acme_sample".to_string(),
            is_library: false,
            base_addr,
            binary_size: 0x10000,
            functions,
        }
    }

    #[test]
    fn extraction_is_deterministic() {
        let report = report(
            0x400000,
            vec![DisasmFunction {
                offset: 0x401000,
                blocks: vec![block_with_target(0x401020)],
            }],
        );
        let hasher = BlockHasher::new();
        let first = hasher.process_disasm(&report).unwrap();
        let second = hasher.process_disasm(&report).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn blockhashes_are_position_independent() {
        let delta = 0x10000000u64 - 0x400000;
        let low = report(
            0x400000,
            vec![DisasmFunction {
                offset: 0x401000,
                blocks: vec![block_with_target(0x401020)],
            }],
        );
        let high = report(
            0x10000000,
            vec![DisasmFunction {
                offset: 0x401000 + delta,
                blocks: vec![block_with_target(0x401020 + delta)],
            }],
        );
        let hasher = BlockHasher::new();
        let low_report = hasher.process_disasm(&low).unwrap();
        let high_report = hasher.process_disasm(&high).unwrap();
        assert_eq!(low_report.blockhashes, high_report.blockhashes);
        assert_eq!(low_report.block_bytes, high_report.block_bytes);
    }

    #[test]
    fn out_of_image_operands_change_the_hash_when_rebased() {
        // A literal outside the image range is kept verbatim, so shifting
        // it produces a different hash.
        let hasher = BlockHasher::new();
        let first = hasher
            .block_hash(
                &block(vec![
                    ins("55"),
                    ins("89e5"),
                    ins_abs("a178563412", 1, 4, 0x7000_0000),
                    ins("31c0"),
                ]),
                0x400000,
                0x500000,
            )
            .unwrap();
        let second = hasher
            .block_hash(
                &block(vec![
                    ins("55"),
                    ins("89e5"),
                    ins_abs("a178563413", 1, 4, 0x7000_0001),
                    ins("31c0"),
                ]),
                0x400000,
                0x500000,
            )
            .unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn hash64_low_half_matches_hash32() {
        let hasher = BlockHasher::new();
        let b = block_with_target(0x401020);
        let h32 = hasher.block_hash(&b, 0x400000, 0x500000).unwrap();
        let h64 = hasher.block_hash64(&b, 0x400000, 0x500000).unwrap();
        assert_eq!(h64 as u32, h32);
    }

    #[test]
    fn short_blocks_are_not_hashed() {
        let report = report(
            0x400000,
            vec![DisasmFunction {
                offset: 0x401000,
                blocks: vec![
                    block(vec![ins("55"), ins("89e5"), ins("c3")]),
                    block_with_target(0x401020),
                ],
            }],
        );
        let extracted = BlockHasher::new().process_disasm(&report).unwrap();
        assert_eq!(extracted.num_all_blocks, 2);
        assert_eq!(extracted.num_blocks, 1);
        assert_eq!(extracted.num_hashes, 1);
    }

    #[test]
    fn function_with_only_short_blocks_counts_unhashed() {
        let report = report(
            0x400000,
            vec![
                DisasmFunction {
                    offset: 0x401000,
                    blocks: vec![block(vec![ins("c3")])],
                },
                DisasmFunction {
                    offset: 0x402000,
                    blocks: vec![block_with_target(0x401020)],
                },
            ],
        );
        let extracted = BlockHasher::new().process_disasm(&report).unwrap();
        assert_eq!(extracted.num_functions, 2);
        assert_eq!(extracted.num_functions_hashed, 1);
    }

    #[test]
    fn shared_blocks_collect_both_function_ids() {
        let report = report(
            0x400000,
            vec![
                DisasmFunction {
                    offset: 0x401000,
                    blocks: vec![block_with_target(0x401020)],
                },
                DisasmFunction {
                    offset: 0x402000,
                    blocks: vec![block_with_target(0x401020)],
                },
            ],
        );
        let extracted = BlockHasher::new().process_disasm(&report).unwrap();
        assert_eq!(extracted.blockhashes.len(), 1);
        let by_size = extracted.blockhashes.values().next().unwrap();
        let fids = by_size.values().next().unwrap();
        assert_eq!(fids, &vec![0, 1]);
        // 10 encoded bytes, once per function.
        assert_eq!(extracted.block_bytes, 20);
    }

    #[test]
    fn repeated_block_within_one_function_is_deduplicated() {
        let report = report(
            0x400000,
            vec![DisasmFunction {
                offset: 0x401000,
                blocks: vec![block_with_target(0x401020), block_with_target(0x401020)],
            }],
        );
        let extracted = BlockHasher::new().process_disasm(&report).unwrap();
        let by_size = extracted.blockhashes.values().next().unwrap();
        assert_eq!(by_size.values().next().unwrap(), &vec![0]);
        assert_eq!(extracted.num_blocks, 2);
        assert_eq!(extracted.block_bytes, 10);
    }

    #[test]
    fn block_bytes_sums_size_times_function_ids() {
        let report = report(
            0x400000,
            vec![
                DisasmFunction {
                    offset: 0x401000,
                    blocks: vec![
                        block_with_target(0x401020),
                        block(vec![ins("55"), ins("89e5"), ins("31c0"), ins("5dc3")]),
                    ],
                },
                DisasmFunction {
                    offset: 0x402000,
                    blocks: vec![block_with_target(0x401020)],
                },
            ],
        );
        let extracted = BlockHasher::new().process_disasm(&report).unwrap();
        let accounted: u64 = extracted
            .blockhashes
            .values()
            .flat_map(|by_size| {
                by_size
                    .iter()
                    .map(|(size, fids)| u64::from(*size) * fids.len() as u64)
            })
            .sum();
        assert_eq!(extracted.block_bytes, accounted);
    }

    #[test]
    fn min_block_size_is_configurable() {
        let report = report(
            0x400000,
            vec![DisasmFunction {
                offset: 0x401000,
                blocks: vec![block(vec![ins("55"), ins("89e5"), ins("c3")])],
            }],
        );
        let extracted = BlockHasher::with_min_block_size(2)
            .process_disasm(&report)
            .unwrap();
        assert_eq!(extracted.num_blocks, 1);
        assert_eq!(extracted.min_block_size, 2);
    }

    #[test]
    fn odd_length_hex_floors_the_byte_count() {
        assert_eq!(ins("b8123").byte_len(), 2);
    }

    #[test]
    fn non_latin1_escaped_text_fails_loudly() {
        let report = report(
            0x400000,
            vec![DisasmFunction {
                offset: 0x401000,
                blocks: vec![block(vec![ins("55"), ins("89e5"), ins("λλ"), ins("c3")])],
            }],
        );
        let err = BlockHasher::new().process_disasm(&report).unwrap_err();
        assert!(matches!(err, HashError::HashInputInvalid { .. }));
    }

    #[test]
    fn function_blockhashes_folds_duplicates() {
        let disasm = report(
            0x400000,
            vec![DisasmFunction {
                offset: 0x401000,
                blocks: vec![
                    block_with_target(0x401020),
                    block_with_target(0x401020),
                    block(vec![ins("c3")]),
                ],
            }],
        );
        let hasher = BlockHasher::new();
        let hashes = hasher
            .function_blockhashes(&disasm, &disasm.functions[0])
            .unwrap();
        assert_eq!(hashes.len(), 1);
        assert_eq!(hashes[0].count, 2);
        assert_eq!(hashes[0].size, 10);
    }

    #[test]
    fn base_addr_parses_from_filename() {
        assert_eq!(
            parse_base_addr_from_filename("dump_0x00400000"),
            Some(0x400000)
        );
        assert_eq!(
            parse_base_addr_from_filename("mal_0x10000000_x64_dump"),
            Some(0x10000000)
        );
        // Fewer than five hex digits is not a base-address token.
        assert_eq!(parse_base_addr_from_filename("crc_0x1234_sample"), None);
        assert_eq!(parse_base_addr_from_filename("plain_sample"), None);
    }

    #[test]
    fn base_addr_takes_the_first_qualifying_token() {
        assert_eq!(
            parse_base_addr_from_filename("a_0x123_b_0x00401000_c_0x00500000"),
            Some(0x401000)
        );
    }

    #[test]
    fn bitness_parses_from_trailing_token() {
        assert_eq!(parse_bitness_from_filename("dump_0x00400000"), Some(32));
        assert_eq!(
            parse_bitness_from_filename("dump_0x0000000140001000"),
            Some(64)
        );
        // Token not at the end does not decide bitness.
        assert_eq!(parse_bitness_from_filename("dump_0x00400000_v2"), None);
    }

    #[test]
    fn bitness_falls_back_to_architecture_marker() {
        assert_eq!(parse_bitness_from_filename("sample_x32_unpacked"), Some(32));
        assert_eq!(parse_bitness_from_filename("sample_x64_unpacked"), Some(64));
        assert_eq!(parse_bitness_from_filename("sample_x64_then_x32"), Some(64));
        assert_eq!(parse_bitness_from_filename("sample_unpacked"), None);
    }

    struct FixedDisassembler(DisasmReport);

    impl Disassembler for FixedDisassembler {
        fn disassemble_buffer(
            &self,
            _buffer: &[u8],
            base_addr: u64,
            _bitness: Option<u32>,
        ) -> Result<DisasmReport, HashError> {
            let mut report = self.0.clone();
            report.base_addr = base_addr;
            Ok(report)
        }

        fn disassemble_unmapped_buffer(&self, _buffer: &[u8]) -> Result<DisasmReport, HashError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn process_bytes_picks_the_mapped_path_for_dump_names() {
        let disasm = report(
            0,
            vec![DisasmFunction {
                offset: 0x401000,
                blocks: vec![block_with_target(0x401020)],
            }],
        );
        let hasher = BlockHasher::new();
        let hashed = hasher
            .process_bytes(
                &FixedDisassembler(disasm),
                b"\x00",
                "reports/dump_0x00400000",
                None,
                None,
            )
            .unwrap();
        assert_eq!(hashed.filename, "dump_0x00400000");
        assert_eq!(hashed.num_functions, 1);
    }

    #[test]
    fn disassembly_failures_propagate() {
        struct FailingDisassembler;
        impl Disassembler for FailingDisassembler {
            fn disassemble_buffer(
                &self,
                _buffer: &[u8],
                _base_addr: u64,
                _bitness: Option<u32>,
            ) -> Result<DisasmReport, HashError> {
                Err(HashError::DisassemblyFailed("unsupported format".into()))
            }
            fn disassemble_unmapped_buffer(
                &self,
                _buffer: &[u8],
            ) -> Result<DisasmReport, HashError> {
                Err(HashError::DisassemblyFailed("unsupported format".into()))
            }
        }
        let err = BlockHasher::new()
            .process_bytes(&FailingDisassembler, b"", "sample", None, None)
            .unwrap_err();
        assert!(matches!(err, HashError::DisassemblyFailed(_)));
    }
}
