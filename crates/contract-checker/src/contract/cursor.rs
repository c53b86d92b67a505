//! Traversal handle over a [`ContractGraph`]

use super::graph::{ContractGraph, ContractIndex};
use super::{Contract, Localization};

/// Position in a contract graph.
///
/// A fresh cursor sits before the first contract; [`advance_to_next`] walks
/// the graph in dominance order. Positioning by address either lands on a
/// contract or leaves the cursor unpositioned, since an address without a
/// contract carries no obligation.
///
/// [`advance_to_next`]: ContractCursor::advance_to_next
#[derive(Debug, Clone, Copy)]
pub struct ContractCursor<'g> {
    graph: &'g ContractGraph,
    /// Index into the traversal order. `None` before the first advance.
    position: Option<usize>,
}

impl<'g> ContractCursor<'g> {
    pub fn new(graph: &'g ContractGraph) -> Self {
        Self {
            graph,
            position: None,
        }
    }

    pub fn graph(&self) -> &'g ContractGraph {
        self.graph
    }

    /// Move to the next contract in traversal order. Returns false once every
    /// contract has been visited.
    pub fn advance_to_next(&mut self) -> bool {
        let next = self.position.map_or(0, |p| p.saturating_add(1));
        self.position = Some(next.min(self.graph.order().len()));
        self.index().is_some()
    }

    pub fn index(&self) -> Option<ContractIndex> {
        self.position
            .and_then(|p| self.graph.order().get(p))
            .copied()
    }

    pub fn contract(&self) -> Option<&'g Contract> {
        self.index().map(|index| self.graph.contract(index))
    }

    pub fn is_positioned(&self) -> bool {
        self.index().is_some()
    }

    pub fn is_initial(&self) -> bool {
        self.index().is_some_and(|index| self.graph.is_initial(index))
    }

    pub fn is_final(&self) -> bool {
        self.index().is_some_and(|index| self.graph.is_final(index))
    }

    /// Position on the contract that holds just before the instruction at
    /// `address` executes.
    pub fn set_before_address(&mut self, address: u64) -> bool {
        self.select(address, |localization| match localization {
            Localization::Before => 0,
            Localization::Between => 1,
            Localization::After => 2,
        })
    }

    /// Position on the contract that holds once the instruction at `address`
    /// has executed.
    pub fn set_after_address(&mut self, address: u64) -> bool {
        self.select(address, |localization| match localization {
            Localization::After => 0,
            Localization::Between => 1,
            Localization::Before => 2,
        })
    }

    /// Position on the contract attached to the greatest address not above
    /// `address`.
    pub fn set_to_enclosing(&mut self, address: u64) -> bool {
        match self.graph.enclosing_address(address) {
            Some(enclosing) => self.set_before_address(enclosing),
            None => self.unset(),
        }
    }

    fn select(&mut self, address: u64, rank: impl Fn(Localization) -> u8) -> bool {
        let graph = self.graph;
        let primary = graph
            .at_address(address)
            .iter()
            .map(|&index| (rank(graph[index].localization), index));
        let secondary = graph
            .at_secondary_address(address)
            .iter()
            .map(|&index| (rank(Localization::Between), index));

        let best = primary
            .chain(secondary)
            .min_by_key(|&(rank, index)| (rank, graph[index].id))
            .map(|(_, index)| index);

        match best.and_then(|index| graph.order().iter().position(|&n| n == index)) {
            Some(position) => {
                self.position = Some(position);
                true
            }
            None => self.unset(),
        }
    }

    fn unset(&mut self) -> bool {
        self.position = None;
        false
    }
}
