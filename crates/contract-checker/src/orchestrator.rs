//! Verification of a whole contract graph
//!
//! [`Checker`] visits contracts in dominance order. For each contract that is
//! not final it resolves the targets of the block leaving it, then checks the
//! block once per target against the contract found there. Failures stay
//! local to their block: the run always goes through every contract.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use cfg::{CfgInstruction, StopSet};
use tracing::{debug, info, warn};

use crate::block::{BlockVerifier, PostCondition};
use crate::config::CheckerConfig;
use crate::contract::{
    parse_ad_hoc, Contract, ContractCursor, ContractError, ContractGraph, ContractIndex,
};
use crate::coverage::Coverage;
use crate::decision::DecisionVector;
use crate::diagnostics::{Diagnostics, Warning};
use crate::error::CheckError;
use crate::image::CodeImage;
use crate::resolve::{BlockStart, TargetResolver};
use crate::semantics::{InstructionSemantics, RegisterFile, ValueDomain};

fn read(path: &Path) -> Result<(String, String), CheckError> {
    let text = fs::read_to_string(path).map_err(|source| CheckError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok((text, path.display().to_string()))
}

/// Read and validate the contract document at `path`.
pub fn load_contracts(path: &Path, registers: &dyn RegisterFile) -> Result<ContractGraph, CheckError> {
    let (text, file) = read(path)?;
    let graph = ContractGraph::from_source(&text, Some(&file), registers).map_err(|diagnostics| {
        CheckError::Contracts {
            path: path.to_path_buf(),
            diagnostics,
        }
    })?;
    info!("loaded {} contracts from {}", graph.len(), file);
    Ok(graph)
}

/// Read the single-contract property document at `path`.
pub fn load_property(path: &Path, registers: &dyn RegisterFile) -> Result<Contract, CheckError> {
    let (text, file) = read(path)?;
    parse_ad_hoc(&text, Some(&file), registers).map_err(|diagnostics| CheckError::Contracts {
        path: path.to_path_buf(),
        diagnostics,
    })
}

/// Outcome of one block check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockReport {
    /// Id of the contract the block leaves.
    pub from: u64,
    /// Where the block goes; `None` when its targets could not be resolved.
    pub target: Option<u64>,
    /// Id of the contract found at `target`.
    pub to: Option<u64>,
    pub proven: bool,
    pub diagnostics: Diagnostics,
}

/// Outcome of a run over the whole graph
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub blocks: Vec<BlockReport>,
    /// Warnings that belong to no single block.
    pub warnings: Diagnostics,
    pub coverage_complete: bool,
}

impl RunReport {
    /// True if every block check succeeded.
    pub fn is_ok(&self) -> bool {
        self.blocks.iter().all(|block| block.proven)
    }

    pub fn failures(&self) -> impl Iterator<Item = &BlockReport> {
        self.blocks.iter().filter(|block| !block.proven)
    }

    /// Every warning of the run, block by block.
    pub fn diagnostics(&self) -> impl Iterator<Item = &Warning> {
        self.blocks
            .iter()
            .flat_map(|block| block.diagnostics.iter())
            .chain(self.warnings.iter())
    }
}

/// Outcome of an ad hoc property check
#[derive(Debug, Clone)]
pub struct PropertyReport {
    pub proved: bool,
    /// Id of the contract the property was checked from.
    pub enclosing: Option<u64>,
    pub diagnostics: Diagnostics,
}

pub struct Checker<'a, S, D> {
    graph: &'a ContractGraph,
    image: &'a CodeImage,
    semantics: &'a S,
    domain: &'a D,
    config: &'a CheckerConfig,
    stops: StopSet,
}

impl<'a, S: InstructionSemantics, D: ValueDomain> Checker<'a, S, D> {
    /// Blocks end before join points of the code and before every contract.
    pub fn new(
        graph: &'a ContractGraph,
        image: &'a CodeImage,
        semantics: &'a S,
        domain: &'a D,
        config: &'a CheckerConfig,
    ) -> Self {
        let mut stops = StopSet::from_instructions(&semantics.sweep(image));
        stops.extend(graph.addresses());
        debug!("{} block boundaries", stops.len());
        Self {
            graph,
            image,
            semantics,
            domain,
            config,
            stops,
        }
    }

    fn verifier<'s>(&'s self, stops: &'s StopSet) -> BlockVerifier<'s, S, D> {
        let resolver =
            TargetResolver::new(self.semantics, self.domain, self.image, stops, self.config);
        BlockVerifier::new(self.graph, resolver)
    }

    /// Check every block of the graph and the coverage they achieve.
    pub fn verify_all(&self) -> RunReport {
        info!(
            "verifying {} contracts with {} semantics and {} domain",
            self.graph.len(),
            self.semantics.name(),
            self.domain.name()
        );
        let verifier = self.verifier(&self.stops);
        let mut coverage = Coverage::new(self.graph);
        let mut report = RunReport::default();

        let mut cursor = ContractCursor::new(self.graph);
        while cursor.advance_to_next() {
            let Some(index) = cursor.index() else {
                break;
            };
            if cursor.is_final() {
                continue;
            }
            self.verify_contract(&verifier, index, &mut coverage, &mut report);
        }

        report.coverage_complete = coverage.is_fully_covered();
        info!(
            "{} block(s) checked, {} failed, {} edge(s) proven",
            report.blocks.len(),
            report.failures().count(),
            coverage.proven_count()
        );
        report
    }

    fn verify_contract(
        &self,
        verifier: &BlockVerifier<'_, S, D>,
        index: ContractIndex,
        coverage: &mut Coverage<'_>,
        report: &mut RunReport,
    ) {
        let contract = self.graph.contract(index);
        let mut decisions = DecisionVector::new();
        let exit = match verifier.resolver().resolve(self.graph, index, &mut decisions) {
            Ok(exit) => exit,
            Err(err) => {
                warn!("contract #{}: {}", contract.id, err);
                let warning = Warning::at(
                    contract.position.clone(),
                    format!("unable to resolve the targets of contract #{}: {}", contract.id, err),
                )
                .with_address(contract.address);
                report.blocks.push(BlockReport {
                    from: contract.id,
                    target: None,
                    to: None,
                    proven: false,
                    diagnostics: [warning].into_iter().collect(),
                });
                return;
            }
        };
        debug!(
            "contract #{} at {:#x}: targets {:x?}",
            contract.id, contract.address, exit.targets
        );

        let branch = exit.last.address();
        let branching = exit.targets.len() > 1 || decisions.contains(branch);
        let split = BlockStart::of(self.graph, index).split;
        for &target in &exit.targets {
            let mut post = ContractCursor::new(self.graph);
            let positioned = if split {
                post.set_after_address(target)
            } else {
                post.set_before_address(target)
            };
            if !positioned {
                warn!("unverified path from contract #{} to {:#x}", contract.id, target);
                report.warnings.push(
                    Warning::at(
                        contract.position.clone(),
                        format!(
                            "unverified path from contract #{} to {:#x}: no contract there",
                            contract.id, target
                        ),
                    )
                    .with_address(target),
                );
                continue;
            }
            let Some(outgoing) = post.index() else {
                continue;
            };
            let narrowed = if branching {
                decisions.narrowed(branch, target)
            } else {
                decisions.clone()
            };

            let mut diagnostics = Diagnostics::new();
            let proven = verifier.verify(
                index,
                target,
                outgoing,
                &narrowed,
                Some(&mut *coverage),
                &mut diagnostics,
            );
            let to = self.graph.contract(outgoing).id;
            if proven {
                debug!("block #{} -> #{} proven", contract.id, to);
            } else {
                warn!("block #{} -> #{} failed", contract.id, to);
            }
            report.blocks.push(BlockReport {
                from: contract.id,
                target: Some(target),
                to: Some(to),
                proven,
                diagnostics,
            });
        }
    }

    /// Check a standalone contract from the contract enclosing its address.
    ///
    /// The result does not affect coverage or the verdict of [`verify_all`].
    ///
    /// [`verify_all`]: Checker::verify_all
    pub fn check_property(&self, property: &Contract) -> PropertyReport {
        let mut diagnostics = Diagnostics::new();
        let mut cursor = ContractCursor::new(self.graph);
        cursor.set_to_enclosing(property.address);
        let Some(enclosing) = cursor.index() else {
            diagnostics.push(Warning::at(
                property.position.clone(),
                format!("no contract encloses address {:#x}", property.address),
            ));
            return PropertyReport {
                proved: false,
                enclosing: None,
                diagnostics,
            };
        };
        let from = self.graph.contract(enclosing);
        info!(
            "checking property at {:#x} from contract #{}",
            property.address, from.id
        );

        let proved = self.check_zones(property, enclosing, &mut diagnostics)
            && self.check_from(enclosing, property, &mut diagnostics);
        PropertyReport {
            proved,
            enclosing: Some(from.id),
            diagnostics,
        }
    }

    fn check_zones(
        &self,
        property: &Contract,
        enclosing: ContractIndex,
        diagnostics: &mut Diagnostics,
    ) -> bool {
        let mut zones: BTreeSet<String> = self.graph.zone_names(enclosing).clone();
        let mut valid = true;
        for action in &property.zone_actions {
            if let Err(err) = action.declare(&mut zones) {
                diagnostics.push(Warning::at(action.position.clone(), err.to_string()));
                valid = false;
            }
        }
        for constraint in &property.properties {
            for name in constraint.zones() {
                if !zones.contains(name) {
                    let err = ContractError::UndeclaredZone {
                        name: name.to_string(),
                    };
                    diagnostics.push(Warning::at(constraint.position.clone(), err.to_string()));
                    valid = false;
                }
            }
        }
        valid
    }

    fn check_from(
        &self,
        enclosing: ContractIndex,
        property: &Contract,
        diagnostics: &mut Diagnostics,
    ) -> bool {
        let post = PostCondition::standalone(property);
        let from = self.graph.contract(enclosing);

        if property.address == from.address {
            let verifier = self.verifier(&self.stops);
            let mut state = verifier.pre_state(enclosing);
            return verifier.check(&mut state, property.address, &post, from.id, diagnostics);
        }

        let mut stops = self.stops.clone();
        stops.insert(property.address);
        let verifier = self.verifier(&stops);
        // The property may sit past an after-localized contract sharing the
        // enclosing address
        let start = BlockStart::of(self.graph, enclosing).unsplit();
        let mut decisions = DecisionVector::new();
        let exit = match verifier.resolver().walk(
            start,
            &mut verifier.pre_state(enclosing),
            &mut decisions,
        ) {
            Ok(exit) => exit,
            Err(err) => {
                diagnostics.push(Warning::at(property.position.clone(), err.to_string()));
                return false;
            }
        };
        if !exit.targets.contains(&property.address) {
            diagnostics.push(Warning::at(
                property.position.clone(),
                format!(
                    "address {:#x} is not reached by the block leaving contract #{}",
                    property.address, from.id
                ),
            ));
            return false;
        }
        let narrowed = decisions.narrowed(exit.last.address(), property.address);
        verifier.verify_against(enclosing, start, property.address, &post, &narrowed, diagnostics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm64::Arm64Semantics;
    use crate::interval::IntervalDomain;

    const MOV_X0_0: [u8; 4] = [0x00, 0x00, 0x80, 0xd2];
    const MOV_X0_1: [u8; 4] = [0x20, 0x00, 0x80, 0xd2];
    const NOP: [u8; 4] = [0x1f, 0x20, 0x03, 0xd5];
    const RET: [u8; 4] = [0xc0, 0x03, 0x5f, 0xd6];

    const CONTRACTS: &str = r#"{"contracts": [
        {"id": 1, "address": "0x1000", "nexts": [2]},
        {"id": 2, "address": "0x1010", "previouses": [1], "constraints": ["r0 == 0"]}
    ]}"#;

    fn image(words: &[[u8; 4]]) -> CodeImage {
        CodeImage::from_bytes(0x1000, words.iter().flatten().copied().collect::<Vec<_>>())
    }

    fn run(text: &str, image: &CodeImage) -> RunReport {
        let graph = ContractGraph::from_source(text, None, &Arm64Semantics).unwrap();
        let config = CheckerConfig::default();
        Checker::new(&graph, image, &Arm64Semantics, &IntervalDomain, &config).verify_all()
    }

    #[test]
    fn test_all_blocks_proven() {
        let report = run(CONTRACTS, &image(&[MOV_X0_0, NOP, NOP, NOP, RET]));
        assert!(report.is_ok());
        assert!(report.coverage_complete);
        assert_eq!(report.blocks.len(), 1);
        assert_eq!(report.blocks[0].to, Some(2));
    }

    #[test]
    fn test_failed_block_is_reported() {
        let report = run(CONTRACTS, &image(&[MOV_X0_1, NOP, NOP, NOP, RET]));
        assert!(!report.is_ok());
        assert!(!report.coverage_complete);
        let failure = report.failures().next().unwrap();
        assert_eq!((failure.from, failure.to), (1, Some(2)));
        assert!(failure.diagnostics.mentions("`r0 == 0`"));
    }

    #[test]
    fn test_path_without_contract_is_a_warning() {
        let text = r#"{"contracts": [
            {"id": 1, "address": "0x1000", "nexts": [2]},
            {"id": 2, "address": "0x1008", "previouses": [1]}
        ]}"#;
        // b +0x10 leaves for 0x1010, where no contract lives
        let branch = [0x04, 0x00, 0x00, 0x14];
        let report = run(text, &image(&[branch, NOP, NOP, NOP, RET]));
        assert!(report.is_ok());
        assert!(report.blocks.is_empty());
        assert!(report.warnings.mentions("unverified path"));
        assert!(!report.coverage_complete);
    }

    fn check(property: &str, words: &[[u8; 4]]) -> PropertyReport {
        let graph = ContractGraph::from_source(CONTRACTS, None, &Arm64Semantics).unwrap();
        let image = image(words);
        let config = CheckerConfig::default();
        let checker = Checker::new(&graph, &image, &Arm64Semantics, &IntervalDomain, &config);
        let property = parse_ad_hoc(property, None, &Arm64Semantics).unwrap();
        checker.check_property(&property)
    }

    #[test]
    fn test_property_inside_block() {
        let text = r#"{"contracts": [{"id": 9, "address": "0x1008", "constraints": ["x0 == 0"]}]}"#;
        let report = check(text, &[MOV_X0_0, NOP, NOP, NOP, RET]);
        assert!(report.proved, "{}", report.diagnostics);
        assert_eq!(report.enclosing, Some(1));

        let report = check(text, &[MOV_X0_1, NOP, NOP, NOP, RET]);
        assert!(!report.proved);
        assert!(report.diagnostics.mentions("does not hold"));
    }

    #[test]
    fn test_property_at_contract_address() {
        let text = r#"{"contracts": [{"id": 9, "address": "0x1010", "constraints": ["x0 == 0"]}]}"#;
        let report = check(text, &[MOV_X0_1, NOP, NOP, NOP, RET]);
        assert_eq!(report.enclosing, Some(2));
        assert!(report.proved, "{}", report.diagnostics);
    }

    #[test]
    fn test_property_before_every_contract() {
        let graph = ContractGraph::from_source(CONTRACTS, None, &Arm64Semantics).unwrap();
        let image = image(&[NOP]);
        let config = CheckerConfig::default();
        let checker = Checker::new(&graph, &image, &Arm64Semantics, &IntervalDomain, &config);
        let property = Contract::new(9, 0x800);
        let report = checker.check_property(&property);
        assert!(!report.proved);
        assert_eq!(report.enclosing, None);
    }

    #[test]
    fn test_property_with_unknown_zone() {
        let text = r#"{"contracts": [{"id": 9, "address": "0x1008", "constraints": ["x0 == @heap"]}]}"#;
        let report = check(text, &[MOV_X0_0, NOP, NOP, NOP, RET]);
        assert!(!report.proved);
        assert!(report.diagnostics.mentions("undeclared memory zone `heap`"));
    }

    #[test]
    fn test_contracts_before_and_after_one_instruction() {
        let text = r#"{"contracts": [
            {"id": 1, "address": "0x1000", "nexts": [2]},
            {"id": 2, "address": "0x1004", "previouses": [1], "nexts": [3]},
            {"id": 3, "address": "0x1004", "localization": "after", "previouses": [2],
             "constraints": ["x0 == 1"]}
        ]}"#;
        let report = run(text, &image(&[NOP, MOV_X0_1, NOP, NOP, RET]));
        assert!(report.is_ok(), "{:?}", report.failures().collect::<Vec<_>>());
        assert!(report.coverage_complete);
        let edges: Vec<_> = report
            .blocks
            .iter()
            .map(|block| (block.from, block.target, block.to))
            .collect();
        assert_eq!(edges, vec![(1, Some(0x1004), Some(2)), (2, Some(0x1004), Some(3))]);

        let report = run(text, &image(&[NOP, MOV_X0_0, NOP, NOP, RET]));
        let failure = report.failures().next().unwrap();
        assert_eq!((failure.from, failure.to), (2, Some(3)));
        assert!(failure.diagnostics.mentions("`x0 == 1`"));
    }
}
