//! Linear-block boundaries
//!
//! A linear block ends at a control transfer, or at a plain instruction whose
//! successor is a join point (the target of some other branch) or a checkpoint
//! the caller wants blocks to stop at.

use std::collections::BTreeSet;

use crate::CfgInstruction;

/// Collect every direct branch target in a linear sweep of instructions.
///
/// Calls count too: a callee entry is reached from outside the fall-through
/// path, so a block running into it must end there.
pub fn find_join_points<I: CfgInstruction>(instructions: &[I]) -> BTreeSet<u64> {
    instructions
        .iter()
        .filter(|i| i.is_branch())
        .filter_map(|i| i.branch_target())
        .collect()
}

/// Addresses before which a linear block must end.
#[derive(Debug, Clone, Default)]
pub struct StopSet {
    addresses: BTreeSet<u64>,
}

impl StopSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a stop set from the join points of a linear sweep.
    pub fn from_instructions<I: CfgInstruction>(instructions: &[I]) -> Self {
        Self {
            addresses: find_join_points(instructions),
        }
    }

    pub fn insert(&mut self, address: u64) {
        self.addresses.insert(address);
    }

    pub fn contains(&self, address: u64) -> bool {
        self.addresses.contains(&address)
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

impl FromIterator<u64> for StopSet {
    fn from_iter<T: IntoIterator<Item = u64>>(iter: T) -> Self {
        Self {
            addresses: iter.into_iter().collect(),
        }
    }
}

impl Extend<u64> for StopSet {
    fn extend<T: IntoIterator<Item = u64>>(&mut self, iter: T) {
        self.addresses.extend(iter);
    }
}

/// How the successors of an instruction are known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Successors {
    /// Execution continues with the next instruction in the same block.
    Continue(u64),
    /// The block ends; destinations are encoded in the instruction.
    Static(Vec<u64>),
    /// The block ends; the destination lives in a register and must be
    /// resolved against an abstract state.
    Indirect,
}

/// Classify the successors of `instruction` with respect to `stops`.
pub fn successors<I: CfgInstruction>(instruction: &I, stops: &StopSet) -> Successors {
    let next = instruction.next_address();
    if !instruction.ends_block() {
        return if stops.contains(next) {
            Successors::Static(vec![next])
        } else {
            Successors::Continue(next)
        };
    }

    if instruction.is_indirect() {
        return Successors::Indirect;
    }

    let mut targets = Vec::with_capacity(2);
    if let Some(target) = instruction.branch_target() {
        targets.push(target);
    }
    if instruction.is_conditional() && !targets.contains(&next) {
        targets.push(next);
    }
    Successors::Static(targets)
}
