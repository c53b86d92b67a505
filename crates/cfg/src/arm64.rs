//! Arm64 control-flow classification
//!
//! Single source of truth for which Arm64 opcodes end a linear block, and how
//! their successors are found. Opcodes absent from the table fall through to
//! the next instruction.

use std::collections::HashMap;

use lazy_static::lazy_static;
use yaxpeax_arm::armv8::a64::Opcode;

/// Control-flow classification of an Arm64 opcode
pub struct ClassifiedOpcode {
    /// The mnemonic string (e.g., "b", "b.eq")
    pub mnemonic: &'static str,
    /// Is this a control transfer?
    pub is_branch: bool,
    /// Is this a call? (BL, BLR, BLRAA, etc.)
    pub is_call: bool,
    /// Is this a return? (RET, RETAA, etc.)
    pub is_return: bool,
    /// Does this have an indirect (register) target?
    pub is_indirect: bool,
    /// Can this instruction fall through? (conditional branches)
    pub is_conditional: bool,
}

impl ClassifiedOpcode {
    const fn direct_branch(mnemonic: &'static str) -> Self {
        Self {
            mnemonic,
            is_branch: true,
            is_call: false,
            is_return: false,
            is_indirect: false,
            is_conditional: false,
        }
    }

    const fn direct_call(mnemonic: &'static str) -> Self {
        Self {
            is_call: true,
            ..Self::direct_branch(mnemonic)
        }
    }

    const fn conditional_branch(mnemonic: &'static str) -> Self {
        Self {
            is_conditional: true,
            ..Self::direct_branch(mnemonic)
        }
    }

    const fn indirect_branch(mnemonic: &'static str) -> Self {
        Self {
            is_indirect: true,
            ..Self::direct_branch(mnemonic)
        }
    }

    const fn indirect_call(mnemonic: &'static str) -> Self {
        Self {
            is_call: true,
            is_indirect: true,
            ..Self::direct_branch(mnemonic)
        }
    }

    const fn indirect_return(mnemonic: &'static str) -> Self {
        Self {
            is_return: true,
            is_indirect: true,
            ..Self::direct_branch(mnemonic)
        }
    }

    /// Classification of every opcode absent from the table
    pub const PLAIN: Self = Self {
        mnemonic: "plain",
        is_branch: false,
        is_call: false,
        is_return: false,
        is_indirect: false,
        is_conditional: false,
    };

    /// Classify a decoded opcode.
    ///
    /// Returns [`ClassifiedOpcode::PLAIN`] for opcodes that do not transfer control.
    pub fn from_opcode(op: Opcode) -> &'static Self {
        let mnemonic = op.to_string();
        BY_MNEMONIC
            .get(mnemonic.as_str())
            .copied()
            .unwrap_or(&Self::PLAIN)
    }

    /// Classify by mnemonic string.
    ///
    /// Returns None for mnemonics that do not transfer control.
    pub fn from_mnemonic(mnemonic: &str) -> Option<&'static Self> {
        BY_MNEMONIC
            .get(mnemonic.to_ascii_lowercase().as_str())
            .copied()
    }
}

const OPCODE_TABLE: &[ClassifiedOpcode] = &[
    ClassifiedOpcode::direct_branch("b"),
    ClassifiedOpcode::direct_call("bl"),
    // Conditional branches on flags
    ClassifiedOpcode::conditional_branch("b.eq"),
    ClassifiedOpcode::conditional_branch("b.ne"),
    ClassifiedOpcode::conditional_branch("b.hs"),
    ClassifiedOpcode::conditional_branch("b.lo"),
    ClassifiedOpcode::conditional_branch("b.mi"),
    ClassifiedOpcode::conditional_branch("b.pl"),
    ClassifiedOpcode::conditional_branch("b.vs"),
    ClassifiedOpcode::conditional_branch("b.vc"),
    ClassifiedOpcode::conditional_branch("b.hi"),
    ClassifiedOpcode::conditional_branch("b.ls"),
    ClassifiedOpcode::conditional_branch("b.ge"),
    ClassifiedOpcode::conditional_branch("b.lt"),
    ClassifiedOpcode::conditional_branch("b.gt"),
    ClassifiedOpcode::conditional_branch("b.le"),
    ClassifiedOpcode::conditional_branch("b.al"),
    ClassifiedOpcode::conditional_branch("b.nv"),
    // Compare/test and branch
    ClassifiedOpcode::conditional_branch("tbz"),
    ClassifiedOpcode::conditional_branch("tbnz"),
    ClassifiedOpcode::conditional_branch("cbz"),
    ClassifiedOpcode::conditional_branch("cbnz"),
    // Register targets
    ClassifiedOpcode::indirect_branch("br"),
    ClassifiedOpcode::indirect_call("blr"),
    ClassifiedOpcode::indirect_return("ret"),
    ClassifiedOpcode::indirect_branch("braa"),
    ClassifiedOpcode::indirect_branch("braaz"),
    ClassifiedOpcode::indirect_branch("brab"),
    ClassifiedOpcode::indirect_branch("brabz"),
    ClassifiedOpcode::indirect_call("blraa"),
    ClassifiedOpcode::indirect_call("blraaz"),
    ClassifiedOpcode::indirect_call("blrab"),
    ClassifiedOpcode::indirect_call("blrabz"),
    ClassifiedOpcode::indirect_return("retaa"),
    ClassifiedOpcode::indirect_return("retab"),
    // Exception return
    ClassifiedOpcode::indirect_return("eret"),
    ClassifiedOpcode::indirect_return("eretaa"),
    ClassifiedOpcode::indirect_return("eretab"),
];

lazy_static! {
    /// Map from mnemonic string to ClassifiedOpcode
    pub static ref BY_MNEMONIC: HashMap<&'static str, &'static ClassifiedOpcode> = {
        OPCODE_TABLE.iter().map(|c| (c.mnemonic, c)).collect()
    };
}
