//! Arm64 instruction decoding
//!
//! Decodes words of a [`CodeImage`] into structured Arm64 instructions using the
//! `yaxpeax-arm` crate.

use std::fmt;

use cfg::{BasicInstruction, CfgInstruction};
use yaxpeax_arch::{Decoder, U8Reader};
use yaxpeax_arm::armv8::a64::{InstDecoder, Instruction, Opcode, Operand};

use crate::image::CodeImage;
use crate::semantics::SemanticsError;

/// A decoded instruction with its location information
#[derive(Debug, Clone)]
pub struct DecodedInstruction {
    /// Address of the instruction in the loaded image
    pub address: u64,
    /// The raw 32-bit instruction word
    pub raw: u32,
    /// The decoded instruction
    pub instruction: Instruction,
    /// Mnemonic string (for BasicInstruction)
    mnemonic: String,
}

impl DecodedInstruction {
    /// Returns the opcode of this instruction
    pub fn opcode(&self) -> Opcode {
        self.instruction.opcode
    }

    /// Returns the operands of this instruction
    pub fn operands(&self) -> &[Operand; 4] {
        &self.instruction.operands
    }
}

impl BasicInstruction for DecodedInstruction {
    fn mnemonic(&self) -> &str {
        &self.mnemonic
    }
}

impl CfgInstruction for DecodedInstruction {
    fn address(&self) -> u64 {
        self.address
    }

    fn size(&self) -> u64 {
        4
    }

    fn branch_target(&self) -> Option<u64> {
        // ADR, ADRP and literal loads carry PC offsets too
        if !self.is_branch() || self.is_indirect() {
            return None;
        }

        self.operands().iter().find_map(|op| match op {
            Operand::PCOffset(offset) => self.address.checked_add_signed(*offset),
            _ => None,
        })
    }
}

impl fmt::Display for DecodedInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.instruction)
    }
}

/// Decode the instruction at `address`.
pub fn decode_at(image: &CodeImage, address: u64) -> Result<DecodedInstruction, SemanticsError> {
    if address % 4 != 0 {
        return Err(SemanticsError::InvalidInstruction {
            address,
            message: "address is not aligned to 4 bytes".to_string(),
        });
    }
    let chunk = image
        .read(address, 4)
        .ok_or(SemanticsError::Unmapped { address })?;
    let raw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);

    let decoder = InstDecoder::default();
    let mut reader = U8Reader::new(chunk);
    let instruction =
        decoder
            .decode(&mut reader)
            .map_err(|e| SemanticsError::InvalidInstruction {
                address,
                message: format!("{:?}", e),
            })?;

    let mnemonic = instruction.opcode.to_string();
    Ok(DecodedInstruction {
        address,
        raw,
        instruction,
        mnemonic,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(word: [u8; 4], address: u64) -> DecodedInstruction {
        let image = CodeImage::from_bytes(address, word.to_vec());
        decode_at(&image, address).unwrap()
    }

    #[test]
    fn test_decode_nop() {
        let instr = decode([0x1f, 0x20, 0x03, 0xd5], 0x1000);
        assert_eq!(instr.opcode(), Opcode::HINT);
        assert_eq!(instr.address, 0x1000);
        assert_eq!(instr.raw, 0xd503201f);
        assert!(!instr.is_branch());
    }

    #[test]
    fn test_decode_branch() {
        // b #0x10
        let instr = decode([0x04, 0x00, 0x00, 0x14], 0x1000);
        assert!(instr.is_branch());
        assert!(!instr.is_conditional());
        assert!(!instr.is_indirect());
        assert_eq!(instr.branch_target(), Some(0x1010));
    }

    #[test]
    fn test_decode_backward_branch() {
        // b.lt #-8
        let instr = decode([0x4b, 0xff, 0xff, 0x54], 0x1008);
        assert!(instr.is_conditional());
        assert_eq!(instr.branch_target(), Some(0x1000));
    }

    #[test]
    fn test_decode_call() {
        // bl #8
        let instr = decode([0x02, 0x00, 0x00, 0x94], 0x1000);
        assert!(instr.is_call());
        assert_eq!(instr.branch_target(), Some(0x1008));
    }

    #[test]
    fn test_register_branches_have_no_static_target() {
        // ret
        let ret = decode([0xc0, 0x03, 0x5f, 0xd6], 0x1000);
        assert_eq!(ret.opcode(), Opcode::RET);
        assert!(ret.is_indirect());
        assert_eq!(ret.branch_target(), None);

        // blr x1
        let blr = decode([0x20, 0x00, 0x3f, 0xd6], 0x1000);
        assert_eq!(blr.opcode(), Opcode::BLR);
        assert!(blr.is_call());
        assert_eq!(blr.branch_target(), None);
    }

    #[test]
    fn test_unmapped_and_unaligned() {
        let image = CodeImage::from_bytes(0x1000, vec![0x1f, 0x20, 0x03, 0xd5]);
        assert_eq!(
            decode_at(&image, 0x2000).unwrap_err(),
            SemanticsError::Unmapped { address: 0x2000 }
        );
        assert!(matches!(
            decode_at(&image, 0x1002),
            Err(SemanticsError::InvalidInstruction { .. })
        ));
    }
}
