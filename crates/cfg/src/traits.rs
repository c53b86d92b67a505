//! Trait abstractions for linear-block analysis
//!
//! [`BasicInstruction`] classifies an instruction from its mnemonic alone, and
//! [`CfgInstruction`] adds the addressing information needed to find where a
//! linear block ends. Instruction-set plugins implement both for their decoded
//! instruction type.

use crate::arm64::ClassifiedOpcode;

/// Minimal interface for mnemonic-based classification.
///
/// # Default Implementations
///
/// Control flow methods (`is_branch`, `is_call`, etc.) default to a lookup of the
/// mnemonic in the Arm64 opcode table. Instruction sets with other mnemonics
/// override them.
pub trait BasicInstruction {
    /// Returns the mnemonic of this instruction.
    fn mnemonic(&self) -> &str;

    /// Check if this is a control transfer (jump, branch, call or return).
    #[inline]
    fn is_branch(&self) -> bool {
        ClassifiedOpcode::from_mnemonic(self.mnemonic()).is_some_and(|c| c.is_branch)
    }

    /// Check if this is a call instruction (BL, BLR, etc.).
    #[inline]
    fn is_call(&self) -> bool {
        ClassifiedOpcode::from_mnemonic(self.mnemonic()).is_some_and(|c| c.is_call)
    }

    /// Check if this is a return instruction (RET, RETAA, etc.).
    #[inline]
    fn is_return(&self) -> bool {
        ClassifiedOpcode::from_mnemonic(self.mnemonic()).is_some_and(|c| c.is_return)
    }

    /// Check if the destination comes from a register rather than the encoding.
    #[inline]
    fn is_indirect(&self) -> bool {
        ClassifiedOpcode::from_mnemonic(self.mnemonic()).is_some_and(|c| c.is_indirect)
    }

    /// Check if this is a conditional branch.
    #[inline]
    fn is_conditional(&self) -> bool {
        ClassifiedOpcode::from_mnemonic(self.mnemonic()).is_some_and(|c| c.is_conditional)
    }

    /// Check if this is an unconditional jump (not a call or return).
    #[inline]
    fn is_unconditional_jump(&self) -> bool {
        self.is_branch() && !self.is_conditional() && !self.is_call() && !self.is_return()
    }
}

/// Addressed instruction, as produced by a disassembler over a firmware image.
pub trait CfgInstruction: BasicInstruction {
    /// Address of the first byte of this instruction.
    fn address(&self) -> u64;

    /// Encoded size in bytes.
    fn size(&self) -> u64;

    /// Returns the destination if this is a direct branch or call.
    fn branch_target(&self) -> Option<u64>;

    /// Address of the instruction that follows in memory.
    #[inline]
    fn next_address(&self) -> u64 {
        self.address().wrapping_add(self.size())
    }

    /// A linear block always ends after a control transfer.
    #[inline]
    fn ends_block(&self) -> bool {
        self.is_branch()
    }
}


#[cfg(test)]
mod tests {
    use super::mock_instruction::MockInstruction;
    use super::{BasicInstruction, CfgInstruction};

    #[test]
    fn test_default_classification() {
        let add = MockInstruction::new("add", 0x1000);
        assert!(!add.is_branch());
        assert!(!add.ends_block());

        let bl = MockInstruction::with_target("bl", 0x1004, 0x2000);
        assert!(bl.is_branch());
        assert!(bl.is_call());
        assert!(!bl.is_unconditional_jump());

        let ret = MockInstruction::new("ret", 0x1008);
        assert!(ret.is_return());
        assert!(ret.is_indirect());
        assert!(!ret.is_unconditional_jump());

        let cond = MockInstruction::with_target("b.lt", 0x100c, 0x1000);
        assert!(cond.is_conditional());
        assert!(cond.ends_block());
    }

    #[test]
    fn test_next_address() {
        let nop = MockInstruction::new("nop", 0x1ffc);
        assert_eq!(nop.next_address(), 0x2000);
    }

    #[test]
    fn test_mnemonic_lookup_is_case_insensitive() {
        let b = MockInstruction::with_target("B", 0, 8);
        assert!(b.is_unconditional_jump());
    }
}
