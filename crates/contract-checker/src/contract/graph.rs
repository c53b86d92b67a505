//! The validated arena of contracts
//!
//! Contracts live in a [`DiGraph`] and refer to each other by [`ContractIndex`];
//! an edge `a -> b` means a linear block leads from `a` to `b`. Construction
//! checks the structural invariants and replays zone declarations once, so the
//! rest of the pipeline can treat the graph as read-only and well formed.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::ops::Index;

use petgraph::algo::dominators;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use tracing::debug;

use super::source::{parse_document, ParsedContract, ParsedDocument, SourceText};
use super::{Contract, ContractError};
use crate::diagnostics::Diagnostics;
use crate::semantics::RegisterFile;

pub type ContractIndex = NodeIndex;

/// Links of one contract, still as ids
struct Links {
    nexts: Vec<u64>,
    previouses: Vec<u64>,
    dominator: Option<u64>,
}

#[derive(Debug)]
pub struct ContractGraph {
    graph: DiGraph<Contract, ()>,
    initial: ContractIndex,
    finals: Vec<ContractIndex>,
    /// Breadth-first order from the initial contract.
    order: Vec<ContractIndex>,
    by_address: BTreeMap<u64, Vec<ContractIndex>>,
    by_secondary: BTreeMap<u64, Vec<ContractIndex>>,
    by_id: HashMap<u64, ContractIndex>,
    back_edges: HashSet<(ContractIndex, ContractIndex)>,
    /// Zones live once a contract's own actions ran, by node index.
    zones: Vec<BTreeSet<String>>,
    alloc_shift: Option<u64>,
}

impl ContractGraph {
    /// Parse and validate a contract document.
    ///
    /// Every problem found is returned, each positioned in `text`.
    pub fn from_source(
        text: &str,
        file: Option<&str>,
        registers: &dyn RegisterFile,
    ) -> Result<Self, Diagnostics> {
        let source = SourceText::new(text, file);
        let mut diagnostics = Diagnostics::new();
        let document = parse_document(&source, registers, &mut diagnostics);
        match document {
            Some(document) if diagnostics.is_empty() => Self::build(document, &source),
            _ => Err(diagnostics),
        }
    }

    fn build(document: ParsedDocument, source: &SourceText<'_>) -> Result<Self, Diagnostics> {
        let mut diagnostics = Diagnostics::new();
        let mut report = |contract: &Contract, error: ContractError| {
            diagnostics.push(source.warn(contract.position.clone(), error))
        };

        let mut graph = DiGraph::with_capacity(document.contracts.len(), document.contracts.len());
        let mut links = Vec::with_capacity(document.contracts.len());
        let mut by_id = HashMap::new();

        for ParsedContract {
            contract,
            nexts,
            previouses,
            dominator,
        } in document.contracts
        {
            if by_id.contains_key(&contract.id) {
                report(&contract, ContractError::DuplicateId { id: contract.id });
                continue;
            }
            let id = contract.id;
            let index = graph.add_node(contract);
            by_id.insert(id, index);
            links.push(Links {
                nexts,
                previouses,
                dominator,
            });
        }

        // Edges, and mutual consistency of nexts/previouses
        for (i, link) in links.iter().enumerate() {
            let from = NodeIndex::new(i);
            for &id in &link.nexts {
                match by_id.get(&id) {
                    Some(&to) => {
                        graph.update_edge(from, to, ());
                        if !links[to.index()].previouses.contains(&graph[from].id) {
                            report(
                                &graph[from],
                                ContractError::MissingPrevious {
                                    from: graph[from].id,
                                    to: id,
                                },
                            );
                        }
                    }
                    None => report(&graph[from], ContractError::UnknownId { id }),
                }
            }
            for &id in &link.previouses {
                match by_id.get(&id) {
                    Some(&previous) => {
                        if !links[previous.index()].nexts.contains(&graph[from].id) {
                            report(
                                &graph[from],
                                ContractError::MissingNext {
                                    from: id,
                                    to: graph[from].id,
                                },
                            );
                        }
                    }
                    None => report(&graph[from], ContractError::UnknownId { id }),
                }
            }
            if let Some(id) = link.dominator {
                if !by_id.contains_key(&id) {
                    report(&graph[from], ContractError::UnknownId { id });
                }
            }
        }

        if graph.node_count() == 0 {
            diagnostics.push(source.warn(source.start(), ContractError::NoInitial));
            return Err(diagnostics);
        }

        let initials: Vec<_> = graph
            .node_indices()
            .filter(|&n| graph.neighbors_directed(n, Direction::Incoming).next().is_none())
            .collect();
        let finals: Vec<_> = graph
            .node_indices()
            .filter(|&n| graph.neighbors_directed(n, Direction::Outgoing).next().is_none())
            .collect();

        let initial = match initials.as_slice() {
            [] => {
                diagnostics.push(source.warn(source.start(), ContractError::NoInitial));
                None
            }
            [initial] => Some(*initial),
            several => {
                let ids = several.iter().map(|&n| graph[n].id).collect();
                diagnostics.push(source.warn(
                    graph[several[1]].position.clone(),
                    ContractError::SeveralInitials { ids },
                ));
                None
            }
        };
        if finals.is_empty() {
            diagnostics.push(source.warn(source.start(), ContractError::NoFinal));
        }
        let Some(initial) = initial else {
            return Err(diagnostics);
        };
        if !diagnostics.is_empty() {
            return Err(diagnostics);
        }

        let order = breadth_first(&graph, initial);
        if order.len() < graph.node_count() {
            let reached: HashSet<_> = order.iter().copied().collect();
            for node in graph.node_indices().filter(|n| !reached.contains(n)) {
                diagnostics.push(source.warn(
                    graph[node].position.clone(),
                    ContractError::Unreachable { id: graph[node].id },
                ));
            }
            return Err(diagnostics);
        }

        let tree = dominators::simple_fast(&graph, initial);
        for node in graph.node_indices() {
            let Some(dominator_id) = links[node.index()].dominator else {
                continue;
            };
            let Some(&dominator) = by_id.get(&dominator_id) else {
                continue;
            };
            let id = graph[node].id;
            if dominator == node {
                diagnostics.push(source.warn(
                    graph[node].position.clone(),
                    ContractError::SelfDominator { id },
                ));
            } else if !tree
                .strict_dominators(node)
                .is_some_and(|mut chain| chain.any(|d| d == dominator))
            {
                diagnostics.push(source.warn(
                    graph[node].position.clone(),
                    ContractError::NotDominating {
                        id,
                        dominator: dominator_id,
                    },
                ));
            } else {
                graph[node].dominator = Some(dominator);
            }
        }
        if !diagnostics.is_empty() {
            return Err(diagnostics);
        }

        let back_edges: HashSet<_> = graph
            .edge_references()
            .filter(|edge| {
                tree.dominators(edge.source())
                    .is_some_and(|mut chain| chain.any(|d| d == edge.target()))
            })
            .map(|edge| (edge.source(), edge.target()))
            .collect();

        // Zones, replayed in dominance order
        let mut zones = vec![BTreeSet::new(); graph.node_count()];
        for &node in &order {
            let contract = &graph[node];
            let mut live = contract
                .dominator
                .map(|d| zones[d.index()].clone())
                .unwrap_or_default();
            for action in &contract.zone_actions {
                if let Err(e) = action.declare(&mut live) {
                    diagnostics.push(source.warn(action.position.clone(), e));
                }
            }
            for property in &contract.properties {
                for name in property.zones() {
                    if !live.contains(name) {
                        diagnostics.push(source.warn(
                            property.position.clone(),
                            ContractError::UndeclaredZone {
                                name: name.to_string(),
                            },
                        ));
                    }
                }
            }
            zones[node.index()] = live;
        }
        if !diagnostics.is_empty() {
            return Err(diagnostics);
        }

        let mut by_address: BTreeMap<u64, Vec<ContractIndex>> = BTreeMap::new();
        let mut by_secondary: BTreeMap<u64, Vec<ContractIndex>> = BTreeMap::new();
        for node in graph.node_indices() {
            by_address.entry(graph[node].address).or_default().push(node);
            if let Some(secondary) = graph[node].secondary_address {
                by_secondary.entry(secondary).or_default().push(node);
            }
        }

        debug!(
            contracts = graph.node_count(),
            finals = finals.len(),
            back_edges = back_edges.len(),
            "contract graph built"
        );

        Ok(Self {
            graph,
            initial,
            finals,
            order,
            by_address,
            by_secondary,
            by_id,
            back_edges,
            zones,
            alloc_shift: document.alloc_shift,
        })
    }

    pub fn contract(&self, index: ContractIndex) -> &Contract {
        &self.graph[index]
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contracts(&self) -> impl Iterator<Item = (ContractIndex, &Contract)> {
        self.graph
            .node_indices()
            .map(move |index| (index, &self.graph[index]))
    }

    pub fn initial(&self) -> ContractIndex {
        self.initial
    }

    pub fn finals(&self) -> &[ContractIndex] {
        &self.finals
    }

    pub fn is_initial(&self, index: ContractIndex) -> bool {
        index == self.initial
    }

    pub fn is_final(&self, index: ContractIndex) -> bool {
        self.finals.contains(&index)
    }

    /// Successors of a contract, ordered by (address, id).
    pub fn nexts(&self, index: ContractIndex) -> Vec<ContractIndex> {
        let mut nexts: Vec<_> = self.graph.neighbors(index).collect();
        nexts.sort_by_key(|&n| (self.graph[n].address, self.graph[n].id));
        nexts
    }

    pub fn previouses(&self, index: ContractIndex) -> Vec<ContractIndex> {
        self.graph
            .neighbors_directed(index, Direction::Incoming)
            .collect()
    }

    pub fn dominator(&self, index: ContractIndex) -> Option<ContractIndex> {
        self.graph[index].dominator
    }

    /// The declared dominators of `index` from the outermost one down to
    /// `index` itself.
    pub fn dominator_chain(&self, index: ContractIndex) -> Vec<ContractIndex> {
        let mut chain = vec![index];
        let mut current = index;
        while let Some(dominator) = self.graph[current].dominator {
            chain.push(dominator);
            current = dominator;
        }
        chain.reverse();
        chain
    }

    pub fn is_back_edge(&self, from: ContractIndex, to: ContractIndex) -> bool {
        self.back_edges.contains(&(from, to))
    }

    pub fn back_edges(&self) -> impl Iterator<Item = (ContractIndex, ContractIndex)> + '_ {
        self.back_edges.iter().copied()
    }

    /// Successors along the dominance DAG (back edges removed).
    pub fn dag_successors(&self, index: ContractIndex) -> Vec<ContractIndex> {
        self.nexts(index)
            .into_iter()
            .filter(|&next| !self.is_back_edge(index, next))
            .collect()
    }

    pub fn has_edge(&self, from: ContractIndex, to: ContractIndex) -> bool {
        self.graph.contains_edge(from, to)
    }

    /// Contracts in traversal order; a contract always follows its dominators.
    pub fn order(&self) -> &[ContractIndex] {
        &self.order
    }

    /// Contracts whose primary address is `address`.
    pub fn at_address(&self, address: u64) -> &[ContractIndex] {
        self.by_address.get(&address).map_or(&[], Vec::as_slice)
    }

    pub fn at_secondary_address(&self, address: u64) -> &[ContractIndex] {
        self.by_secondary.get(&address).map_or(&[], Vec::as_slice)
    }

    /// Greatest primary contract address not above `address`.
    pub fn enclosing_address(&self, address: u64) -> Option<u64> {
        self.by_address.range(..=address).next_back().map(|(&a, _)| a)
    }

    /// Every address a contract is attached to, primary or secondary.
    pub fn addresses(&self) -> impl Iterator<Item = u64> + '_ {
        self.by_address.keys().chain(self.by_secondary.keys()).copied()
    }

    pub fn by_id(&self, id: u64) -> Option<ContractIndex> {
        self.by_id.get(&id).copied()
    }

    /// Zones live at `index` once its own actions ran.
    pub fn zone_names(&self, index: ContractIndex) -> &BTreeSet<String> {
        &self.zones[index.index()]
    }

    pub fn alloc_shift(&self) -> Option<u64> {
        self.alloc_shift
    }
}

impl Index<ContractIndex> for ContractGraph {
    type Output = Contract;

    fn index(&self, index: ContractIndex) -> &Contract {
        &self.graph[index]
    }
}

fn breadth_first(graph: &DiGraph<Contract, ()>, initial: ContractIndex) -> Vec<ContractIndex> {
    let mut order = Vec::with_capacity(graph.node_count());
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([initial]);
    seen.insert(initial);

    while let Some(node) = queue.pop_front() {
        order.push(node);
        let mut nexts: Vec<_> = graph.neighbors(node).collect();
        nexts.sort_by_key(|&n| (graph[n].address, graph[n].id));
        for next in nexts {
            if seen.insert(next) {
                queue.push_back(next);
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::expression::tests::TestRegisters;

    fn build(text: &str) -> Result<ContractGraph, Diagnostics> {
        ContractGraph::from_source(text, Some("contracts.json"), &TestRegisters)
    }

    /// 1 -> {2, 3} -> 4 -> 5 -> 6, with a loop 5 -> 4.
    const DIAMOND: &str = r#"{"contracts": [
        {"id": 1, "address": "0x1000", "nexts": [3, 2],
         "zones": [{"create": {"name": "stack", "start": "sp", "length": "0x100"}}]},
        {"id": 2, "address": "0x1010", "previouses": [1], "nexts": [4], "dominator": 1},
        {"id": 3, "address": "0x1008", "previouses": [1], "nexts": [4], "dominator": 1,
         "zones": [{"rename": {"from": "stack", "to": "frame"}}]},
        {"id": 4, "address": "0x1020", "previouses": [2, 3, 5], "nexts": [5], "dominator": 1},
        {"id": 5, "address": "0x1030", "previouses": [4], "nexts": [4, 6], "dominator": 4,
         "constraints": ["[@stack] == 0"]},
        {"id": 6, "address": "0x1040", "previouses": [5], "dominator": 5}
    ]}"#;

    #[test]
    fn test_build_diamond() {
        let graph = build(DIAMOND).unwrap();
        assert_eq!(graph.len(), 6);

        let id = |index: ContractIndex| graph[index].id;
        assert_eq!(id(graph.initial()), 1);
        assert_eq!(graph.finals().iter().map(|&f| id(f)).collect::<Vec<_>>(), vec![6]);

        // Successors are ordered by address, so 3 comes before 2
        let order: Vec<_> = graph.order().iter().map(|&n| id(n)).collect();
        assert_eq!(order, vec![1, 3, 2, 4, 5, 6]);

        let four = graph.by_id(4).unwrap();
        let five = graph.by_id(5).unwrap();
        assert!(graph.is_back_edge(five, four));
        assert!(!graph.is_back_edge(four, five));
        assert_eq!(
            graph.dag_successors(five).into_iter().map(id).collect::<Vec<_>>(),
            vec![6]
        );

        let six = graph.by_id(6).unwrap();
        assert_eq!(
            graph.dominator_chain(six).into_iter().map(id).collect::<Vec<_>>(),
            vec![1, 4, 5, 6]
        );
    }

    #[test]
    fn test_zones_follow_dominators() {
        let graph = build(DIAMOND).unwrap();
        let three = graph.by_id(3).unwrap();
        let six = graph.by_id(6).unwrap();
        assert!(graph.zone_names(three).contains("frame"));
        // The rename in 3 does not flow to 6, whose dominator chain is 1, 4, 5
        assert!(graph.zone_names(six).contains("stack"));
        assert!(!graph.zone_names(six).contains("frame"));
    }

    #[test]
    fn test_address_lookup() {
        let graph = build(DIAMOND).unwrap();
        assert_eq!(graph.at_address(0x1008).len(), 1);
        assert!(graph.at_address(0x1004).is_empty());
        assert_eq!(graph.enclosing_address(0x100c), Some(0x1008));
        assert_eq!(graph.enclosing_address(0xfff), None);
        assert_eq!(graph.addresses().count(), 6);
    }

    #[test]
    fn test_duplicate_and_unknown_ids() {
        let err = build(
            r#"{"contracts": [
                {"id": 1, "address": 16, "nexts": [2, 9]},
                {"id": 2, "address": 32, "previouses": [1]},
                {"id": 2, "address": 48}
            ]}"#,
        )
        .unwrap_err();
        assert!(err.mentions("duplicate contract id #2"));
        assert!(err.mentions("unknown contract #9"));
        let warning = err.iter().find(|w| w.message.contains("duplicate")).unwrap();
        assert_eq!(warning.position.as_ref().unwrap().line, 4);
    }

    #[test]
    fn test_inconsistent_links() {
        let err = build(
            r#"{"contracts": [
                {"id": 1, "address": 16, "nexts": [2]},
                {"id": 2, "address": 32}
            ]}"#,
        )
        .unwrap_err();
        assert!(err.mentions("#1 lists #2 in `nexts` but #2 does not list #1"));
    }

    #[test]
    fn test_initial_and_final_are_required() {
        let err = build(
            r#"{"contracts": [
                {"id": 1, "address": 16, "nexts": [2], "previouses": [2]},
                {"id": 2, "address": 32, "nexts": [1], "previouses": [1]}
            ]}"#,
        )
        .unwrap_err();
        assert!(err.mentions("no initial contract"));
        assert!(err.mentions("no final contract"));

        let err = build(
            r#"{"contracts": [
                {"id": 1, "address": 16},
                {"id": 2, "address": 32}
            ]}"#,
        )
        .unwrap_err();
        assert!(err.mentions("several initial contracts"));
    }

    #[test]
    fn test_unreachable_contract() {
        let err = build(
            r#"{"contracts": [
                {"id": 1, "address": 16, "nexts": [2]},
                {"id": 2, "address": 32, "previouses": [1]},
                {"id": 3, "address": 48, "nexts": [4], "previouses": [4]},
                {"id": 4, "address": 64, "nexts": [3], "previouses": [3]}
            ]}"#,
        )
        .unwrap_err();
        assert!(err.mentions("#3 is unreachable"));
        assert!(err.mentions("#4 is unreachable"));
    }

    #[test]
    fn test_dominator_must_dominate() {
        let err = build(
            r#"{"contracts": [
                {"id": 1, "address": 16, "nexts": [2, 3]},
                {"id": 2, "address": 32, "previouses": [1], "nexts": [4]},
                {"id": 3, "address": 48, "previouses": [1], "nexts": [4]},
                {"id": 4, "address": 64, "previouses": [2, 3], "dominator": 2}
            ]}"#,
        )
        .unwrap_err();
        assert!(err.mentions("#2 does not dominate contract #4"));

        let err = build(
            r#"{"contracts": [
                {"id": 1, "address": 16, "nexts": [2]},
                {"id": 2, "address": 32, "previouses": [1], "dominator": 2}
            ]}"#,
        )
        .unwrap_err();
        assert!(err.mentions("cannot be its own dominator"));
    }

    #[test]
    fn test_undeclared_zone_is_positioned() {
        let err = build(
            "{\"contracts\": [\n  {\"id\": 1, \"address\": 16, \"nexts\": [2]},\n  {\"id\": 2, \"address\": 32, \"previouses\": [1],\n   \"constraints\": [\"[@heap] == 0\"]}\n]}",
        )
        .unwrap_err();
        let warning = err.iter().next().unwrap();
        assert!(warning.message.contains("undeclared memory zone `heap`"));
        let position = warning.position.as_ref().unwrap();
        assert_eq!((position.line, position.column), (4, 20));
        assert_eq!(
            warning.to_string(),
            "contracts.json:4:20: undeclared memory zone `heap`"
        );
    }
}
