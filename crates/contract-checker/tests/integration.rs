//! Integration tests for contract-checker
//!
//! Each test assembles a small Arm64 firmware from raw instruction words
//! mapped at `0x1000`, pairs it with a contract document and runs the whole
//! pipeline: graph construction, target resolution, block verification and
//! coverage.

use std::fs;

use contract_checker::{
    load_contracts, load_property, Arm64Semantics, CheckError, Checker, CheckerConfig, CodeImage,
    ContractGraph, IntervalDomain, RunReport,
};
use tempfile::TempDir;

const MOV_X0_0: [u8; 4] = [0x00, 0x00, 0x80, 0xd2];
const MOV_X0_1: [u8; 4] = [0x20, 0x00, 0x80, 0xd2];
const NOP: [u8; 4] = [0x1f, 0x20, 0x03, 0xd5];
const RET: [u8; 4] = [0xc0, 0x03, 0x5f, 0xd6];
const BLR_X1: [u8; 4] = [0x20, 0x00, 0x3f, 0xd6];
/// cbz x0, +0x10
const CBZ_X0_16: [u8; 4] = [0x80, 0x00, 0x00, 0xb4];

const BASE: u64 = 0x1000;

const SINGLE_BLOCK: &str = r#"{
  "contracts": [
    {"id": 1, "address": "0x1000", "nexts": [2]},
    {"id": 2, "address": "0x1010", "previouses": [1], "constraints": ["r0 == 0"]}
  ]
}"#;

fn firmware(words: &[[u8; 4]]) -> Vec<u8> {
    words.iter().flatten().copied().collect()
}

fn verify(contracts: &str, words: &[[u8; 4]]) -> RunReport {
    let graph = ContractGraph::from_source(contracts, Some("contracts.json"), &Arm64Semantics)
        .unwrap_or_else(|diagnostics| panic!("invalid contracts:\n{}", diagnostics));
    let image = CodeImage::from_bytes(BASE, firmware(words));
    let config = CheckerConfig::default();
    Checker::new(&graph, &image, &Arm64Semantics, &IntervalDomain, &config).verify_all()
}

#[test]
fn test_block_establishing_final_contract() {
    let report = verify(SINGLE_BLOCK, &[MOV_X0_0, NOP, NOP, NOP, RET]);

    assert!(report.is_ok());
    assert!(report.coverage_complete);
    assert_eq!(report.blocks.len(), 1);
    assert_eq!(report.diagnostics().count(), 0);
}

#[test]
fn test_block_breaking_final_contract() {
    let report = verify(SINGLE_BLOCK, &[MOV_X0_1, NOP, NOP, NOP, RET]);

    assert!(!report.is_ok());
    assert!(!report.coverage_complete);
    let failure = report.failures().next().unwrap();
    assert_eq!((failure.from, failure.to), (1, Some(2)));
    assert!(failure.diagnostics.mentions("`r0 == 0`"));

    // The warning points at the property in the document
    let warning = failure.diagnostics.iter().next().unwrap();
    let position = warning.position.as_ref().unwrap();
    assert_eq!(position.line, 4);
    assert_eq!(position.file.as_deref(), Some("contracts.json"));
}

#[test]
fn test_undeclared_zone_is_positioned() {
    let contracts = r#"{
  "contracts": [
    {"id": 1, "address": "0x1000", "nexts": [2]},
    {"id": 2, "address": "0x1010", "previouses": [1],
     "constraints": ["[@stack] == 0"]}
  ]
}"#;
    let diagnostics =
        ContractGraph::from_source(contracts, Some("contracts.json"), &Arm64Semantics).unwrap_err();

    assert!(diagnostics.mentions("undeclared memory zone `stack`"));
    let position = diagnostics.iter().next().unwrap().position.clone().unwrap();
    assert_eq!(position.line, 5);
    assert!(position.column > 1);
}

#[test]
fn test_unbounded_call_fails_only_its_block() {
    let contracts = r#"{
  "contracts": [
    {"id": 1, "address": "0x1000", "nexts": [2, 3]},
    {"id": 2, "address": "0x1004", "previouses": [1], "nexts": [4]},
    {"id": 3, "address": "0x1010", "previouses": [1], "nexts": [4]},
    {"id": 4, "address": "0x1020", "previouses": [2, 3], "constraints": ["x0 == 0"]}
  ]
}"#;
    let words = [
        CBZ_X0_16, // 0x1000
        BLR_X1,    // 0x1004
        NOP,
        NOP,
        MOV_X0_0, // 0x1010
        NOP,
        NOP,
        NOP,
        RET, // 0x1020
    ];
    let report = verify(contracts, &words);

    assert!(!report.is_ok());
    assert!(!report.coverage_complete);

    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].from, 2);
    assert_eq!(failures[0].target, None);
    assert!(failures[0].diagnostics.mentions("cannot be bounded"));

    // The other blocks were still checked
    let mut proven: Vec<_> = report
        .blocks
        .iter()
        .filter(|block| block.proven)
        .map(|block| (block.from, block.to))
        .collect();
    proven.sort();
    assert_eq!(proven, vec![(1, Some(2)), (1, Some(3)), (3, Some(4))]);
}

#[test]
fn test_loop_keeps_invariant() {
    let contracts = r#"{
  "contracts": [
    {"id": 1, "address": "0x1000", "nexts": [2]},
    {"id": 2, "address": "0x1004", "previouses": [1, 2], "nexts": [2, 3], "dominator": 1,
     "constraints": ["x1 == 0x2000"]},
    {"id": 3, "address": "0x1008", "previouses": [2], "dominator": 2}
  ]
}"#;
    let movz_x1 = [0x01, 0x00, 0x84, 0xd2]; // movz x1, #0x2000
    let cbnz_x0_0 = [0x00, 0x00, 0x00, 0xb5]; // cbnz x0, .
    let words = [
        movz_x1,   // 0x1000
        cbnz_x0_0, // 0x1004, loops on itself
        RET,       // 0x1008
    ];
    let report = verify(contracts, &words);

    assert!(report.is_ok(), "{:?}", report.failures().collect::<Vec<_>>());
    assert!(report.coverage_complete);
    let mut edges: Vec<_> = report.blocks.iter().map(|b| (b.from, b.to)).collect();
    edges.sort();
    assert_eq!(edges, vec![(1, Some(2)), (2, Some(2)), (2, Some(3))]);
}

#[test]
fn test_atomic_swap_updates_memory() {
    let contracts = |constraints: &str| {
        format!(
            r#"{{"contracts": [
    {{"id": 1, "address": "0x1000", "nexts": [2]}},
    {{"id": 2, "address": "0x1010", "previouses": [1], "constraints": {}}}
]}}"#,
            constraints
        )
    };
    let words = [
        [0x01, 0x00, 0x84, 0xd2], // movz x1, #0x2000
        [0x3f, 0x00, 0x00, 0xf9], // str xzr, [x1]
        [0x22, 0x00, 0x80, 0xd2], // movz x2, #1
        [0x23, 0x80, 0x22, 0xf8], // swp x2, x3, [x1]
        RET,                      // 0x1010
    ];

    let report = verify(&contracts(r#"["[x1] == 0"]"#), &words);
    assert!(!report.is_ok());
    assert!(report.failures().next().unwrap().diagnostics.mentions("does not hold"));

    let report = verify(&contracts(r#"["[x1] == 1", "x3 == 0"]"#), &words);
    assert!(report.is_ok(), "{:?}", report.failures().collect::<Vec<_>>());
}

#[test]
fn test_contracts_around_one_instruction() {
    let contracts = r#"{
  "contracts": [
    {"id": 1, "address": "0x1000", "nexts": [2]},
    {"id": 2, "address": "0x1004", "previouses": [1], "nexts": [3]},
    {"id": 3, "address": "0x1004", "localization": "after", "previouses": [2],
     "constraints": ["x0 == 1"]}
  ]
}"#;
    let report = verify(contracts, &[NOP, MOV_X0_1, NOP, NOP, RET]);

    assert!(report.is_ok(), "{:?}", report.failures().collect::<Vec<_>>());
    assert!(report.coverage_complete);
    assert_eq!(report.blocks.len(), 2);
}

#[test]
fn test_files_on_disk() {
    let dir = TempDir::new().unwrap();
    let contracts = dir.path().join("contracts.json");
    let property = dir.path().join("property.json");
    let binary = dir.path().join("firmware.bin");

    let document = SINGLE_BLOCK.replacen("{", r#"{"alloc-shift": 4096,"#, 1);
    fs::write(&contracts, document).unwrap();
    fs::write(
        &property,
        r#"{"contracts": [{"id": 1, "address": "0x1008", "constraints": ["x0 == 0"]}]}"#,
    )
    .unwrap();
    fs::write(&binary, firmware(&[MOV_X0_0, NOP, NOP, NOP, RET])).unwrap();

    let graph = load_contracts(&contracts, &Arm64Semantics).unwrap();
    let config = CheckerConfig::default();
    let shift = config.effective_shift(graph.alloc_shift());
    assert_eq!(shift, BASE);

    // Raw images map at 0 before the shift
    let image = CodeImage::load(&binary).unwrap().shifted(shift);
    assert!(image.contains(BASE));
    assert!(!image.contains(0));

    let checker = Checker::new(&graph, &image, &Arm64Semantics, &IntervalDomain, &config);
    let report = checker.verify_all();
    assert!(report.is_ok());
    assert!(report.coverage_complete);

    let property = load_property(&property, &Arm64Semantics).unwrap();
    let outcome = checker.check_property(&property);
    assert!(outcome.proved, "{}", outcome.diagnostics);
    assert_eq!(outcome.enclosing, Some(1));
}

#[test]
fn test_broken_contract_file() {
    let dir = TempDir::new().unwrap();
    let contracts = dir.path().join("contracts.json");
    fs::write(&contracts, "{\"contracts\": [\n  {\"id\": 1,, }\n]}").unwrap();

    let err = load_contracts(&contracts, &Arm64Semantics).unwrap_err();
    assert!(err
        .to_string()
        .starts_with("unable to load contracts from file"));
    let diagnostics = match err {
        CheckError::Contracts { diagnostics, .. } => diagnostics,
        other => panic!("unexpected error: {}", other),
    };
    let position = diagnostics.iter().next().unwrap().position.clone().unwrap();
    assert_eq!(position.line, 2);
}

#[test]
fn test_missing_contract_file() {
    let dir = TempDir::new().unwrap();
    let err = load_contracts(&dir.path().join("absent.json"), &Arm64Semantics).unwrap_err();
    assert!(matches!(err, CheckError::Io { .. }));
}
