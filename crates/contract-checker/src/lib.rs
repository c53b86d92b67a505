//! Contract checker for firmware machine code
//!
//! Checks a firmware image against a graph of contracts: checkpoints attached
//! to code addresses that constrain registers and memory. Every block of code
//! leaving a contract must establish the contracts it can reach, and coverage
//! tells whether the proven blocks account for every path from the initial
//! contract to the final ones.
//!
//! # Pipeline
//!
//! | Stage | Role |
//! |-------|------|
//! | [`contract`] | Parse the JSON document into a validated dominance graph |
//! | [`resolve`] | Walk the linear block leaving a contract and bound its targets |
//! | [`block`] | Prove one block against the contract at its target |
//! | [`coverage`] | Decide whether proven blocks cover every path |
//! | [`orchestrator`] | Drive the above over the whole graph, or for one ad hoc property |
//!
//! # Plugins
//!
//! The analysis is generic over an [`InstructionSemantics`] and a
//! [`ValueDomain`]. This crate ships [`Arm64Semantics`] and [`IntervalDomain`].
//!
//! # Contract Document
//!
//! ```json
//! {
//!   "contracts": [
//!     {"id": 1, "address": "0x1000", "nexts": [2]},
//!     {"id": 2, "address": "0x1010", "previouses": [1], "constraints": ["x0 == 0"]}
//!   ]
//! }
//! ```

pub mod arm64;
pub mod block;
pub mod config;
pub mod contract;
pub mod coverage;
pub mod decision;
pub mod decode;
pub mod diagnostics;
pub mod error;
pub mod image;
pub mod interval;
pub mod orchestrator;
pub mod resolve;
pub mod semantics;
pub mod state;

pub use arm64::Arm64Semantics;
pub use block::{BlockVerifier, PostCondition};
pub use config::CheckerConfig;
pub use contract::{parse_ad_hoc, Contract, ContractCursor, ContractGraph, ContractIndex};
pub use coverage::Coverage;
pub use decision::DecisionVector;
pub use diagnostics::{Diagnostics, Position, Warning};
pub use error::CheckError;
pub use image::{CodeImage, ImageError};
pub use interval::{Interval, IntervalDomain};
pub use orchestrator::{
    load_contracts, load_property, BlockReport, Checker, PropertyReport, RunReport,
};
pub use resolve::{ResolveError, TargetResolver};
pub use semantics::{InstructionSemantics, RegisterFile, SemanticsError, Truth, ValueDomain};
pub use state::AbstractState;
