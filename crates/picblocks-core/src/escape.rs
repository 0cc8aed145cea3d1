//! Position-independent instruction escaping.
//!
//! The escaped form of an instruction is its hex text with every operand
//! byte that encodes an absolute address inside `[lower_addr, upper_addr)`
//! replaced by `?` wildcards, one per nibble. Opcode bytes, prefixes,
//! register encodings, relative displacements, and literals outside the
//! image range pass through unchanged. Two images that differ only in
//! their load address therefore escape to identical text.

use crate::model::DisasmInstruction;

impl DisasmInstruction {
    /// The instruction's hex text with image-absolute operand bytes
    /// wildcarded.
    ///
    /// Operand spans reaching past the encoded bytes are clamped; the
    /// wildcard covers whatever part of the span exists.
    #[must_use]
    pub fn escaped_binary(&self, lower_addr: u64, upper_addr: u64) -> String {
        if self.operands.is_empty() {
            return self.bytes.clone();
        }
        let mut chars: Vec<char> = self.bytes.chars().collect();
        for operand in &self.operands {
            if operand.value < lower_addr || operand.value >= upper_addr {
                continue;
            }
            let first = operand.start.saturating_mul(2);
            let last = operand
                .start
                .saturating_add(operand.width)
                .saturating_mul(2)
                .min(chars.len());
            for slot in chars.iter_mut().take(last).skip(first) {
                *slot = '?';
            }
        }
        chars.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::model::{AddressOperand, DisasmInstruction};

    fn mov_with_imm(value: u64) -> DisasmInstruction {
        // b8 <imm32>: mov eax, imm32 with the operand field in bytes 1..5.
        DisasmInstruction {
            offset: 0x401000,
            bytes: format!("b8{:08x}", (value as u32).swap_bytes()),
            operands: vec![AddressOperand {
                start: 1,
                width: 4,
                value,
            }],
        }
    }

    #[test]
    fn operand_inside_image_range_is_wildcarded() {
        let ins = mov_with_imm(0x401234);
        let escaped = ins.escaped_binary(0x400000, 0x500000);
        assert_eq!(escaped, "b8????????");
    }

    #[test]
    fn operand_outside_image_range_passes_through() {
        let ins = mov_with_imm(0x7fff_0000);
        let escaped = ins.escaped_binary(0x400000, 0x500000);
        assert_eq!(escaped, ins.bytes);
    }

    #[test]
    fn upper_bound_is_exclusive() {
        let ins = mov_with_imm(0x500000);
        let escaped = ins.escaped_binary(0x400000, 0x500000);
        assert_eq!(escaped, ins.bytes);
    }

    #[test]
    fn rebased_operands_escape_identically() {
        let low = mov_with_imm(0x401234);
        let high = mov_with_imm(0x10001234);
        assert_eq!(
            low.escaped_binary(0x400000, 0x500000),
            high.escaped_binary(0x10000000, 0x10100000)
        );
    }

    #[test]
    fn span_past_encoded_bytes_is_clamped() {
        let ins = DisasmInstruction {
            offset: 0,
            bytes: "b812".to_string(),
            operands: vec![AddressOperand {
                start: 1,
                width: 4,
                value: 0x401234,
            }],
        };
        assert_eq!(ins.escaped_binary(0x400000, 0x500000), "b8??");
    }

    #[test]
    fn instruction_without_operands_is_untouched() {
        let ins = DisasmInstruction {
            offset: 0,
            bytes: "c3".to_string(),
            operands: Vec::new(),
        };
        assert_eq!(ins.escaped_binary(0, u64::MAX), "c3");
    }
}
