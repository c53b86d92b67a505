//! Control-flow classification and linear-block boundaries for firmware
//!
//! This crate provides:
//! - **Opcode classification** of Arm64 control transfers
//! - **Join point discovery** over a linear sweep of decoded instructions
//! - **Successor classification** deciding where a linear block ends
//!
//! # Architecture
//!
//! The crate provides two levels of abstraction via traits:
//!
//! - [`BasicInstruction`]: Minimal interface for mnemonic-based classification.
//!
//! - [`CfgInstruction`]: Adds addresses, sizes and direct targets, which is what
//!   block boundary analysis needs. Implemented by the decoded instruction type
//!   of each instruction-set plugin.
//!
//! # Modules
//!
//! - [`arm64`]: Opcode classification table
//! - [`traits`]: `BasicInstruction` and `CfgInstruction` traits
//! - [`boundaries`]: Join points, stop sets and successor classification

pub mod arm64;
pub mod boundaries;
pub mod traits;

pub use arm64::{ClassifiedOpcode, BY_MNEMONIC};
pub use boundaries::{find_join_points, successors, StopSet, Successors};
pub use traits::{BasicInstruction, CfgInstruction};
