//! Plugin interfaces
//!
//! The checker is generic over two independently chosen capabilities:
//!
//! - [`InstructionSemantics`]: decodes instructions from a [`CodeImage`], applies
//!   their abstract transfer function and resolves register targets.
//! - [`ValueDomain`]: the abstract value representation with its arithmetic,
//!   comparison, inclusion and join.
//!
//! Any instruction set pairs with any domain; the instruction set only talks to
//! values through the domain it is handed.

use std::fmt;

use cfg::CfgInstruction;
use thiserror::Error;

use crate::image::CodeImage;
use crate::state::AbstractState;

/// Errors raised by an instruction-semantics plugin
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SemanticsError {
    #[error("no code mapped at {address:#x}")]
    Unmapped { address: u64 },

    #[error("failed to decode instruction at {address:#x}: {message}")]
    InvalidInstruction { address: u64, message: String },

    #[error("indirect target of `{instruction}` at {address:#x} cannot be bounded")]
    UnboundedTarget { address: u64, instruction: String },
}

/// Binary operators over abstract values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::And => "&",
            BinaryOp::Or => "|",
            BinaryOp::Xor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
        })
    }
}

/// Comparison relations (unsigned)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relation {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Membership of the left value in the right range.
    In,
}

impl Relation {
    /// The relation obtained by swapping both sides, if any.
    pub fn flip(self) -> Option<Self> {
        match self {
            Relation::Eq => Some(Relation::Eq),
            Relation::Ne => Some(Relation::Ne),
            Relation::Lt => Some(Relation::Gt),
            Relation::Le => Some(Relation::Ge),
            Relation::Gt => Some(Relation::Lt),
            Relation::Ge => Some(Relation::Le),
            Relation::In => None,
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Relation::Eq => "==",
            Relation::Ne => "!=",
            Relation::Lt => "<",
            Relation::Le => "<=",
            Relation::Gt => ">",
            Relation::Ge => ">=",
            Relation::In => "in",
        })
    }
}

/// Three-valued outcome of an abstract comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truth {
    True,
    False,
    Unknown,
}

impl Truth {
    pub fn and(self, other: Truth) -> Truth {
        match (self, other) {
            (Truth::False, _) | (_, Truth::False) => Truth::False,
            (Truth::True, Truth::True) => Truth::True,
            _ => Truth::Unknown,
        }
    }
}

/// Abstract value representation and operations.
pub trait ValueDomain {
    type Value: Clone + fmt::Debug + fmt::Display + PartialEq;

    fn name(&self) -> &'static str;

    /// The value describing every concrete value.
    fn top(&self) -> Self::Value;

    fn constant(&self, value: u64) -> Self::Value;

    /// Every value in `[min, max]` (inclusive).
    fn range(&self, min: u64, max: u64) -> Self::Value;

    /// Wrapping 64-bit arithmetic lifted to abstract values.
    fn arithmetic(&self, op: BinaryOp, lhs: &Self::Value, rhs: &Self::Value) -> Self::Value;

    fn compare(&self, relation: Relation, lhs: &Self::Value, rhs: &Self::Value) -> Truth;

    /// Narrow `lhs` to the values that satisfy `lhs relation rhs` for some value
    /// of `rhs`. Returns `None` when no value does.
    fn refine(
        &self,
        relation: Relation,
        lhs: &Self::Value,
        rhs: &Self::Value,
    ) -> Option<Self::Value>;

    fn join(&self, lhs: &Self::Value, rhs: &Self::Value) -> Self::Value;

    /// True if every concretization of `inner` is a concretization of `outer`.
    fn includes(&self, outer: &Self::Value, inner: &Self::Value) -> bool;

    fn as_constant(&self, value: &Self::Value) -> Option<u64>;

    /// Concrete values of `value`, if there are at most `limit` of them.
    fn enumerate(&self, value: &Self::Value, limit: usize) -> Option<Vec<u64>>;
}

/// Names of the registers an instruction set exposes to contracts.
pub trait RegisterFile {
    /// Canonical register names; a register's index is its position here.
    fn registers(&self) -> &[&'static str];

    fn register_index(&self, name: &str) -> Option<usize> {
        self.registers()
            .iter()
            .position(|r| r.eq_ignore_ascii_case(name))
    }

    fn register_name(&self, index: usize) -> Option<&'static str> {
        self.registers().get(index).copied()
    }
}

/// Abstract semantics of an instruction set.
pub trait InstructionSemantics: RegisterFile {
    type Instruction: CfgInstruction + fmt::Display;

    fn name(&self) -> &'static str;

    /// Every instruction starts at a multiple of this many bytes.
    fn alignment(&self) -> u64;

    fn decode(&self, image: &CodeImage, address: u64) -> Result<Self::Instruction, SemanticsError>;

    /// Decode every segment of `image` front to back, skipping undecodable words.
    fn sweep(&self, image: &CodeImage) -> Vec<Self::Instruction> {
        let step = self.alignment().max(1);
        let mut instructions = Vec::new();
        for segment in image.segments() {
            let mut address = segment.address;
            while address < segment.end() {
                match self.decode(image, address) {
                    Ok(instruction) => {
                        address = instruction.next_address().max(address.saturating_add(step));
                        instructions.push(instruction);
                    }
                    Err(_) => address = address.saturating_add(step),
                }
            }
        }
        instructions
    }

    /// Apply the abstract transfer function of `instruction` to `state`.
    fn apply<D: ValueDomain>(
        &self,
        instruction: &Self::Instruction,
        state: &mut AbstractState<D::Value>,
        domain: &D,
    ) -> Result<(), SemanticsError>;

    /// Bounded set of destinations of an indirect control transfer, evaluated
    /// in the state reached just before `instruction` executes.
    fn resolve_targets<D: ValueDomain>(
        &self,
        instruction: &Self::Instruction,
        state: &AbstractState<D::Value>,
        domain: &D,
        bound: usize,
    ) -> Result<Vec<u64>, SemanticsError>;

    /// Refine `state` with what is known once `instruction` transferred control
    /// to `target`. The state is the one reached after `apply`.
    fn assume_target<D: ValueDomain>(
        &self,
        _instruction: &Self::Instruction,
        _target: u64,
        _state: &mut AbstractState<D::Value>,
        _domain: &D,
    ) {
    }
}
