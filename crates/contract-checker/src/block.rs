//! Verification of one block between two contracts
//!
//! A block starts at an incoming contract, under the state its dominator chain
//! and its own properties describe, and runs to one of its targets. The state
//! reached there is the witness: every property the outgoing contract requires
//! must hold on it.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::contract::{
    Contract, ContractGraph, ContractIndex, Expression, Localization, Property, Spanned,
};
use crate::coverage::Coverage;
use crate::decision::DecisionVector;
use crate::diagnostics::{Diagnostics, Warning};
use crate::resolve::{BlockStart, TargetResolver};
use crate::semantics::{InstructionSemantics, Truth, ValueDomain};
use crate::state::AbstractState;

/// What must hold once a block reaches its target
#[derive(Debug, Clone)]
pub struct PostCondition<'c> {
    contract: &'c Contract,
    /// Contracts whose zone actions still have to run on the final state,
    /// root-first.
    zone_sources: Vec<&'c Contract>,
    /// Properties to check, each with the id of the contract declaring it.
    properties: Vec<(u64, &'c Spanned<Property>)>,
}

impl<'c> PostCondition<'c> {
    /// Post-condition of the block from `incoming` to `outgoing`.
    ///
    /// The outgoing contract inherits the properties of its dominators unless
    /// a nearer contract constrains the same location again. Zone actions of
    /// dominators the incoming contract shares already ran on the pre-state.
    pub fn for_edge(graph: &'c ContractGraph, incoming: ContractIndex, outgoing: ContractIndex) -> Self {
        let done: HashSet<_> = graph.dominator_chain(incoming).into_iter().collect();
        let chain: Vec<&Contract> = graph
            .dominator_chain(outgoing)
            .into_iter()
            .map(|link| graph.contract(link))
            .collect();
        let zone_sources = graph
            .dominator_chain(outgoing)
            .into_iter()
            .filter(|link| !done.contains(link))
            .map(|link| graph.contract(link))
            .collect();
        Self {
            contract: graph.contract(outgoing),
            zone_sources,
            properties: effective_properties(&chain),
        }
    }

    /// Post-condition of a contract standing alone.
    pub fn standalone(contract: &'c Contract) -> Self {
        Self {
            contract,
            zone_sources: vec![contract],
            properties: contract.properties.iter().map(|p| (contract.id, p)).collect(),
        }
    }

    pub fn contract(&self) -> &'c Contract {
        self.contract
    }

    pub fn properties(&self) -> impl Iterator<Item = &'c Property> + '_ {
        self.properties.iter().map(|(_, p)| &p.node)
    }
}

/// Properties of `chain` (root-first), nearest contract first, dropping those
/// whose constrained location a nearer contract constrains again. The rule is
/// the one [`AbstractState::assume_contract`] forgets locations by.
fn effective_properties<'c>(chain: &[&'c Contract]) -> Vec<(u64, &'c Spanned<Property>)> {
    let mut constrained: Vec<&Expression> = Vec::new();
    let mut kept = Vec::new();
    for contract in chain.iter().rev() {
        kept.extend(
            contract
                .properties
                .iter()
                .filter(|p| match p.constrained_location() {
                    Some(location) => !constrained.iter().any(|c| c.same_location(location)),
                    None => true,
                })
                .map(|p| (contract.id, p)),
        );
        constrained.extend(
            contract
                .properties
                .iter()
                .filter_map(|p| p.constrained_location()),
        );
    }
    kept
}

pub struct BlockVerifier<'a, S, D> {
    graph: &'a ContractGraph,
    resolver: TargetResolver<'a, S, D>,
}

impl<'a, S: InstructionSemantics, D: ValueDomain> BlockVerifier<'a, S, D> {
    pub fn new(graph: &'a ContractGraph, resolver: TargetResolver<'a, S, D>) -> Self {
        Self { graph, resolver }
    }

    pub fn resolver(&self) -> &TargetResolver<'a, S, D> {
        &self.resolver
    }

    /// State holding when the block leaving `incoming` starts.
    pub fn pre_state(&self, incoming: ContractIndex) -> AbstractState<D::Value> {
        AbstractState::for_contract(
            self.graph,
            incoming,
            self.resolver.semantics().registers().len(),
            self.resolver.domain(),
        )
    }

    /// Check the block from `incoming` to `target`, where `outgoing` sits.
    ///
    /// `decisions` pins the path: the last branch of the block must be
    /// narrowed to `target`. The edge is marked in `coverage` when proven.
    pub fn verify(
        &self,
        incoming: ContractIndex,
        target: u64,
        outgoing: ContractIndex,
        decisions: &DecisionVector,
        coverage: Option<&mut Coverage<'_>>,
        diagnostics: &mut Diagnostics,
    ) -> bool {
        let post = PostCondition::for_edge(self.graph, incoming, outgoing);
        let start = BlockStart::of(self.graph, incoming);
        let proven = self.verify_against(incoming, start, target, &post, decisions, diagnostics);
        if proven {
            if let Some(coverage) = coverage {
                coverage.mark(incoming, outgoing);
            }
        }
        proven
    }

    /// Check the block from `incoming`, entered at `start`, to `target`
    /// against `post`.
    pub fn verify_against(
        &self,
        incoming: ContractIndex,
        start: BlockStart,
        target: u64,
        post: &PostCondition<'_>,
        decisions: &DecisionVector,
        diagnostics: &mut Diagnostics,
    ) -> bool {
        let from = self.graph.contract(incoming);
        let mut state = self.pre_state(incoming);
        if state.is_bottom() {
            warn!("pre-condition of contract #{} is unsatisfiable", from.id);
            diagnostics.push(Warning::at(
                from.position.clone(),
                format!("pre-condition of contract #{} is unsatisfiable", from.id),
            ));
            return true;
        }

        let mut decisions = decisions.clone();
        let exit = match self
            .resolver
            .walk(start, &mut state, &mut decisions)
        {
            Ok(exit) => exit,
            Err(err) => {
                diagnostics.push(Warning::at(
                    from.position.clone(),
                    format!("block leaving contract #{}: {}", from.id, err),
                ));
                return false;
            }
        };
        if !exit.targets.contains(&target) {
            diagnostics.push(
                Warning::at(
                    from.position.clone(),
                    format!(
                        "block leaving contract #{} does not reach {:#x}",
                        from.id, target
                    ),
                )
                .with_address(from.address),
            );
            return false;
        }
        // A split block has not left its instruction yet
        if !start.split {
            self.resolver
                .semantics()
                .assume_target(&exit.last, target, &mut state, self.resolver.domain());
        }
        debug!(
            "block #{} -> {:#x}: {} instruction(s), final state {}",
            from.id, target, exit.instructions, state
        );
        self.check(&mut state, target, post, from.id, diagnostics)
    }

    /// Check `post` against the `state` reached at `target`.
    pub fn check(
        &self,
        state: &mut AbstractState<D::Value>,
        target: u64,
        post: &PostCondition<'_>,
        from: u64,
        diagnostics: &mut Diagnostics,
    ) -> bool {
        let semantics = self.resolver.semantics();
        let domain = self.resolver.domain();
        let contract = post.contract();

        if contract.localization == Localization::After && target == contract.address {
            let executed = semantics
                .decode(self.resolver.image(), target)
                .and_then(|instruction| semantics.apply(&instruction, state, domain));
            if let Err(err) = executed {
                diagnostics.push(Warning::at(contract.position.clone(), err.to_string()));
                return false;
            }
        }
        for source in &post.zone_sources {
            for action in &source.zone_actions {
                state.apply_zone_action(action, domain);
            }
        }

        let mut holds = true;
        for (owner, property) in &post.properties {
            let verdict = match state.evaluate(property, domain) {
                Truth::True => continue,
                Truth::False => "does not hold",
                Truth::Unknown => "may not hold",
            };
            holds = false;
            let message = format!(
                "property `{}` of contract #{} {} on the block from #{} to #{}: `{}` is {}",
                property.node,
                owner,
                verdict,
                from,
                contract.id,
                property.lhs,
                state.eval(&property.lhs, domain),
            );
            warn!("{}", message);
            diagnostics.push(Warning::at(property.position.clone(), message).with_address(target));
        }
        holds
    }
}
