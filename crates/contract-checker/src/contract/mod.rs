//! Contracts and the contract graph
//!
//! A contract is a checkpoint attaching constraints over registers and memory
//! to an address of the firmware. Contracts link to each other through `nexts`
//! and `previouses` (the blocks that connect them) and through `dominator`
//! (the contract whose state they inherit).
//!
//! # Modules
//!
//! - [`expression`]: property syntax (text and structured)
//! - [`zone`]: memory zone actions
//! - [`source`]: the JSON contract document
//! - [`graph`]: the validated arena of contracts
//! - [`cursor`]: dominance-ordered traversal and positioning by address

pub mod cursor;
pub mod expression;
pub mod graph;
pub mod source;
pub mod zone;

use std::ops::Deref;

use serde::Deserialize;
use thiserror::Error;

pub use cursor::ContractCursor;
pub use expression::{Expression, ExpressionError, Property};
pub use graph::{ContractGraph, ContractIndex};
pub use source::parse_ad_hoc;
pub use zone::ZoneAction;

use crate::diagnostics::Position;

/// Problems found while reading or validating contracts
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContractError {
    #[error("{message}")]
    Json { message: String },

    #[error("contract is not complete: missing `{field}`")]
    Incomplete { field: &'static str },

    #[error("contract id must be positive")]
    ZeroId,

    #[error("contract address must be nonzero")]
    ZeroAddress,

    #[error("invalid address `{text}`")]
    InvalidAddress { text: String },

    #[error("duplicate contract id #{id}")]
    DuplicateId { id: u64 },

    #[error("reference to unknown contract #{id}")]
    UnknownId { id: u64 },

    #[error("malformed expression: {0}")]
    Expression(#[from] ExpressionError),

    #[error("undeclared memory zone `{name}`")]
    UndeclaredZone { name: String },

    #[error("memory zone `{name}` is already declared")]
    DuplicateZone { name: String },

    #[error("memory zone `{name}` cannot be merged with itself")]
    SelfMerge { name: String },

    #[error("contract #{from} lists #{to} in `nexts` but #{to} does not list #{from} in `previouses`")]
    MissingPrevious { from: u64, to: u64 },

    #[error("contract #{to} lists #{from} in `previouses` but #{from} does not list #{to} in `nexts`")]
    MissingNext { from: u64, to: u64 },

    #[error("no initial contract found")]
    NoInitial,

    #[error("several initial contracts found: {ids:?}")]
    SeveralInitials { ids: Vec<u64> },

    #[error("no final contract found")]
    NoFinal,

    #[error("contract #{id} is unreachable from the initial contract")]
    Unreachable { id: u64 },

    #[error("contract #{id} cannot be its own dominator")]
    SelfDominator { id: u64 },

    #[error("contract #{dominator} does not dominate contract #{id}")]
    NotDominating { id: u64, dominator: u64 },

    #[error("a property document must contain exactly one contract, found {count}")]
    PropertyCount { count: usize },

    #[error("an ad hoc property cannot link to other contracts")]
    PropertyLinks,
}

/// Where a contract sits relative to the instruction at its address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Localization {
    #[default]
    #[serde(alias = "before-instruction")]
    Before,
    #[serde(alias = "after-instruction")]
    After,
    #[serde(alias = "between-instructions")]
    Between,
}

/// A value together with the place it was declared
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spanned<T> {
    pub node: T,
    pub position: Position,
}

impl<T> Deref for Spanned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.node
    }
}

/// A specification checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contract {
    pub id: u64,
    pub address: u64,
    pub secondary_address: Option<u64>,
    pub localization: Localization,
    pub zone_actions: Vec<Spanned<ZoneAction>>,
    pub properties: Vec<Spanned<Property>>,
    pub dominator: Option<ContractIndex>,
    pub position: Position,
}

impl Contract {
    /// Contract at `address` constraining nothing.
    pub fn new(id: u64, address: u64) -> Self {
        Self {
            id,
            address,
            secondary_address: None,
            localization: Localization::Before,
            zone_actions: Vec::new(),
            properties: Vec::new(),
            dominator: None,
            position: Position::default(),
        }
    }
}
