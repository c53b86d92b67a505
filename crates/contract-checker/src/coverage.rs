//! Proof coverage of the contract graph
//!
//! The checker marks an edge once the block it stands for is proven. Coverage
//! between two contracts is complete when every edge on the dominance DAG from
//! the first to the last is proven, along with the back edges among the
//! contracts on those paths. Marks only accumulate, so once complete a query
//! stays complete.

use std::collections::{HashSet, VecDeque};

use crate::contract::{ContractGraph, ContractIndex};

#[derive(Debug, Clone)]
pub struct Coverage<'g> {
    graph: &'g ContractGraph,
    proven: HashSet<(ContractIndex, ContractIndex)>,
}

impl<'g> Coverage<'g> {
    pub fn new(graph: &'g ContractGraph) -> Self {
        Self {
            graph,
            proven: HashSet::new(),
        }
    }

    /// Record that the block from `from` to `to` is proven.
    pub fn mark(&mut self, from: ContractIndex, to: ContractIndex) {
        self.proven.insert((from, to));
    }

    pub fn is_proven(&self, from: ContractIndex, to: ContractIndex) -> bool {
        self.proven.contains(&(from, to))
    }

    pub fn proven_count(&self) -> usize {
        self.proven.len()
    }

    /// Contracts reachable from `start` along the DAG, `start` included.
    fn forward(&self, start: ContractIndex) -> HashSet<ContractIndex> {
        self.closure(start, |n| self.graph.dag_successors(n))
    }

    /// Contracts from which `end` is reachable along the DAG, `end` included.
    fn backward(&self, end: ContractIndex) -> HashSet<ContractIndex> {
        self.closure(end, |n| {
            self.graph
                .previouses(n)
                .into_iter()
                .filter(|&p| !self.graph.is_back_edge(p, n))
                .collect()
        })
    }

    fn closure(
        &self,
        root: ContractIndex,
        step: impl Fn(ContractIndex) -> Vec<ContractIndex>,
    ) -> HashSet<ContractIndex> {
        let mut seen = HashSet::from([root]);
        let mut queue = VecDeque::from([root]);
        while let Some(node) = queue.pop_front() {
            for next in step(node) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }

    /// True if every path from `first` to `last` is covered by proven blocks.
    pub fn is_complete(&self, first: ContractIndex, last: ContractIndex) -> bool {
        if first == last {
            return true;
        }
        let reached = self.forward(first);
        if !reached.contains(&last) {
            return false;
        }
        let leading = self.backward(last);
        let relevant: HashSet<_> = reached.intersection(&leading).copied().collect();
        let relevant = &relevant;

        let forward_edges = relevant
            .iter()
            .filter(|&&n| n != last)
            .flat_map(move |&n| {
                self.graph
                    .dag_successors(n)
                    .into_iter()
                    .filter(move |s| relevant.contains(s))
                    .map(move |s| (n, s))
            });
        let back_edges = self
            .graph
            .back_edges()
            .filter(|(from, to)| *from != last && relevant.contains(from) && relevant.contains(to));

        forward_edges
            .chain(back_edges)
            .all(|(from, to)| self.is_proven(from, to))
    }

    /// Completeness from the initial contract to every final contract.
    pub fn is_fully_covered(&self) -> bool {
        let initial = self.graph.initial();
        self.graph
            .finals()
            .iter()
            .all(|&last| self.is_complete(initial, last))
    }
}
