//! Linear-block walking and target resolution
//!
//! [`TargetResolver::walk`] interprets one linear block from its first
//! instruction to the instruction that ends it, and reports where control goes
//! next. Both target resolution and block verification walk blocks this way;
//! the [`DecisionVector`] carries the destinations of every branch met, so a
//! verification walk can be pinned to one of them.

use cfg::{successors, BasicInstruction, StopSet, Successors};
use thiserror::Error;
use tracing::{debug, trace};

use crate::config::CheckerConfig;
use crate::contract::{ContractGraph, ContractIndex, Localization};
use crate::decision::DecisionVector;
use crate::image::CodeImage;
use crate::semantics::{InstructionSemantics, SemanticsError, ValueDomain};
use crate::state::AbstractState;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error(transparent)]
    Semantics(#[from] SemanticsError),

    #[error("linear block at {start:#x} exceeds {limit} instructions")]
    BlockTooLong { start: u64, limit: usize },
}

/// Where a linear block hands control over
#[derive(Debug, Clone)]
pub struct BlockExit<I> {
    /// The instruction that ended the block.
    pub last: I,
    /// Possible next addresses, after applying the decision vector.
    pub targets: Vec<u64>,
    /// Instructions interpreted, including `last` unless the block is split.
    pub instructions: usize,
}

/// Where a block leaving a contract begins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockStart {
    pub address: u64,
    /// The instruction at `address` already ran when the contract holds.
    pub executed: bool,
    /// A successor contract holds right after the instruction at `address`.
    /// The block then ends at `address` itself, and the instruction is left
    /// for the after-localized contract to run.
    pub split: bool,
}

impl BlockStart {
    pub fn of(graph: &ContractGraph, index: ContractIndex) -> Self {
        let contract = graph.contract(index);
        let executed = contract.localization == Localization::After;
        let split = !executed
            && graph.nexts(index).into_iter().any(|next| {
                let next = graph.contract(next);
                next.address == contract.address && next.localization == Localization::After
            });
        Self {
            address: contract.address,
            executed,
            split,
        }
    }

    /// The same start, walked through to the end of its linear block.
    pub fn unsplit(self) -> Self {
        Self {
            split: false,
            ..self
        }
    }
}

pub struct TargetResolver<'a, S, D> {
    semantics: &'a S,
    domain: &'a D,
    image: &'a CodeImage,
    stops: &'a StopSet,
    config: &'a CheckerConfig,
}

impl<'a, S: InstructionSemantics, D: ValueDomain> TargetResolver<'a, S, D> {
    pub fn new(
        semantics: &'a S,
        domain: &'a D,
        image: &'a CodeImage,
        stops: &'a StopSet,
        config: &'a CheckerConfig,
    ) -> Self {
        Self {
            semantics,
            domain,
            image,
            stops,
            config,
        }
    }

    pub fn semantics(&self) -> &'a S {
        self.semantics
    }

    pub fn domain(&self) -> &'a D {
        self.domain
    }

    pub fn image(&self) -> &'a CodeImage {
        self.image
    }

    /// Interpret the linear block at `start`, updating `state`.
    ///
    /// Branch destinations already in `decisions` restrict the exit targets;
    /// destinations seen for the first time are recorded there.
    pub fn walk(
        &self,
        start: BlockStart,
        state: &mut AbstractState<D::Value>,
        decisions: &mut DecisionVector,
    ) -> Result<BlockExit<S::Instruction>, ResolveError> {
        let limit = self.config.max_block_instructions;
        if start.split {
            let instruction = self.semantics.decode(self.image, start.address)?;
            trace!("{:#x}: {} (split)", start.address, instruction);
            return Ok(BlockExit {
                last: instruction,
                targets: vec![start.address],
                instructions: 0,
            });
        }
        let mut address = start.address;
        let mut skip = start.executed;
        let mut count = 0;

        loop {
            if count >= limit {
                return Err(ResolveError::BlockTooLong {
                    start: start.address,
                    limit,
                });
            }
            let instruction = self.semantics.decode(self.image, address)?;
            count += 1;
            trace!("{:#x}: {}", address, instruction);

            let next = successors(&instruction, self.stops);
            let targets = match next {
                Successors::Continue(next) => {
                    if !std::mem::take(&mut skip) {
                        self.semantics.apply(&instruction, state, self.domain)?;
                    }
                    address = next;
                    continue;
                }
                Successors::Static(mut targets) => {
                    if instruction.is_branch() {
                        match decisions.get(address) {
                            Some(chosen) => targets.retain(|t| chosen.contains(t)),
                            None if targets.len() > 1 => decisions.record(address, targets.clone()),
                            None => {}
                        }
                    }
                    targets
                }
                Successors::Indirect => match decisions.get(address) {
                    Some(chosen) => chosen.to_vec(),
                    None => {
                        let targets = self.semantics.resolve_targets(
                            &instruction,
                            state,
                            self.domain,
                            self.config.target_bound,
                        )?;
                        debug!(
                            "{:#x}: `{}` resolved to {} target(s)",
                            address,
                            instruction,
                            targets.len()
                        );
                        decisions.record(address, targets.clone());
                        targets
                    }
                },
            };

            if !skip {
                self.semantics.apply(&instruction, state, self.domain)?;
            }
            return Ok(BlockExit {
                last: instruction,
                targets,
                instructions: count,
            });
        }
    }

    /// Targets of the block leaving the contract at `index`, starting from the
    /// contract's pre-condition state.
    pub fn resolve(
        &self,
        graph: &ContractGraph,
        index: ContractIndex,
        decisions: &mut DecisionVector,
    ) -> Result<BlockExit<S::Instruction>, ResolveError> {
        let mut state = AbstractState::for_contract(
            graph,
            index,
            self.semantics.registers().len(),
            self.domain,
        );
        self.walk(BlockStart::of(graph, index), &mut state, decisions)
    }
}
