//! The JSON contract document
//!
//! ```json
//! {
//!   "alloc-shift": 0,
//!   "contracts": [
//!     { "id": 1, "address": "0x1000", "nexts": [2],
//!       "zones": [{"create": {"name": "stack", "start": "sp", "length": "0x100"}}] },
//!     { "id": 2, "address": "0x1010", "previouses": [1], "dominator": 1,
//!       "constraints": ["x0 == 0", "[@stack]:4 in [0, 16]"] }
//!   ]
//! }
//! ```
//!
//! Every contract, zone action and constraint is kept as a raw slice of the
//! input so that diagnostics point at the offending declaration.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::value::RawValue;

use super::expression::{parse_property, ExpressionError, ExpressionNode, Property};
use super::zone::{ZoneAction, ZoneActionDecl};
use super::{Contract, ContractError, Localization, Spanned};
use crate::diagnostics::{Diagnostics, Position, Warning};
use crate::semantics::RegisterFile;

/// Input text with line bookkeeping
pub(crate) struct SourceText<'a> {
    text: &'a str,
    file: Option<Arc<str>>,
    line_starts: Vec<usize>,
}

impl<'a> SourceText<'a> {
    pub(crate) fn new(text: &'a str, file: Option<&str>) -> Self {
        let line_starts = std::iter::once(0)
            .chain(text.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        Self {
            text,
            file: file.map(Arc::from),
            line_starts,
        }
    }

    pub(crate) fn text(&self) -> &'a str {
        self.text
    }

    pub(crate) fn start(&self) -> Position {
        Position::new(self.file.clone(), 1, 1)
    }

    pub(crate) fn position_at(&self, offset: usize) -> Position {
        let line = self.line_starts.partition_point(|&start| start <= offset);
        let line_start = self.line_starts[line.saturating_sub(1)];
        Position::new(self.file.clone(), line, offset - line_start + 1)
    }

    /// Offset of `slice` inside the text; `slice` must be borrowed from it.
    fn offset_of(&self, slice: &str) -> usize {
        let offset = (slice.as_ptr() as usize).wrapping_sub(self.text.as_ptr() as usize);
        offset.min(self.text.len())
    }

    pub(crate) fn position_of(&self, slice: &str) -> Position {
        self.position_at(self.offset_of(slice))
    }

    /// Position of a `serde_json` error raised while parsing `slice`.
    fn error_position(&self, slice: &str, error: &serde_json::Error) -> Position {
        let base = self.position_of(slice);
        if error.line() <= 1 {
            Position {
                column: base.column + error.column().saturating_sub(1),
                ..base
            }
        } else {
            Position {
                line: base.line + error.line() - 1,
                column: error.column(),
                ..base
            }
        }
    }

    pub(crate) fn warn(&self, position: Position, error: ContractError) -> Warning {
        Warning::at(position, error.to_string())
    }
}

#[derive(Deserialize)]
struct DocumentDecl<'a> {
    #[serde(rename = "alloc-shift", default)]
    alloc_shift: Option<u64>,
    #[serde(borrow)]
    contracts: Vec<&'a RawValue>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AddressDecl {
    Number(u64),
    Text(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ContractDecl<'a> {
    id: Option<u64>,
    address: Option<AddressDecl>,
    secondary_address: Option<AddressDecl>,
    #[serde(default)]
    localization: Localization,
    #[serde(default)]
    nexts: Vec<u64>,
    #[serde(default)]
    previouses: Vec<u64>,
    dominator: Option<u64>,
    #[serde(default, borrow)]
    zones: Vec<&'a RawValue>,
    #[serde(default, borrow)]
    constraints: Vec<&'a RawValue>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ConstraintDecl {
    Text(String),
    Tree(ExpressionNode),
}

/// A contract whose links are still expressed as ids
pub(crate) struct ParsedContract {
    pub contract: Contract,
    pub nexts: Vec<u64>,
    pub previouses: Vec<u64>,
    pub dominator: Option<u64>,
}

pub(crate) struct ParsedDocument {
    pub alloc_shift: Option<u64>,
    pub contracts: Vec<ParsedContract>,
}

fn parse_address(decl: AddressDecl) -> Result<u64, ContractError> {
    match decl {
        AddressDecl::Number(n) => Ok(n),
        AddressDecl::Text(text) => {
            let trimmed = text.trim();
            let parsed = match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
                Some(hex) => u64::from_str_radix(hex, 16),
                None => trimmed.parse(),
            };
            parsed.map_err(|_| ContractError::InvalidAddress { text })
        }
    }
}

/// Parse a contract document. Every problem is pushed to `diagnostics`; `None`
/// is returned if the document is unusable as a whole.
pub(crate) fn parse_document(
    source: &SourceText<'_>,
    registers: &dyn RegisterFile,
    diagnostics: &mut Diagnostics,
) -> Option<ParsedDocument> {
    let document: DocumentDecl<'_> = match serde_json::from_str(source.text()) {
        Ok(document) => document,
        Err(e) => {
            let position = source.error_position(source.text(), &e);
            diagnostics.push(source.warn(
                position,
                ContractError::Json {
                    message: e.to_string(),
                },
            ));
            return None;
        }
    };

    let contracts = document
        .contracts
        .iter()
        .filter_map(|raw| parse_contract(source, raw.get(), registers, diagnostics))
        .collect();

    Some(ParsedDocument {
        alloc_shift: document.alloc_shift,
        contracts,
    })
}

fn parse_contract(
    source: &SourceText<'_>,
    raw: &str,
    registers: &dyn RegisterFile,
    diagnostics: &mut Diagnostics,
) -> Option<ParsedContract> {
    let position = source.position_of(raw);
    let decl: ContractDecl<'_> = match serde_json::from_str(raw) {
        Ok(decl) => decl,
        Err(e) => {
            diagnostics.push(source.warn(
                source.error_position(raw, &e),
                ContractError::Json {
                    message: e.to_string(),
                },
            ));
            return None;
        }
    };
    let before = diagnostics.len();
    let mut report = |error: ContractError| diagnostics.push(source.warn(position.clone(), error));

    let id = match decl.id {
        None => {
            report(ContractError::Incomplete { field: "id" });
            0
        }
        Some(0) => {
            report(ContractError::ZeroId);
            0
        }
        Some(id) => id,
    };
    let address = match decl.address.map(parse_address) {
        None => {
            report(ContractError::Incomplete { field: "address" });
            0
        }
        Some(Err(e)) => {
            report(e);
            0
        }
        Some(Ok(0)) => {
            report(ContractError::ZeroAddress);
            0
        }
        Some(Ok(address)) => address,
    };
    let secondary_address = match decl.secondary_address.map(parse_address).transpose() {
        Ok(secondary) => secondary,
        Err(e) => {
            report(e);
            None
        }
    };

    let mut zone_actions = Vec::with_capacity(decl.zones.len());
    for raw_action in &decl.zones {
        let slice = raw_action.get();
        match parse_zone_action(slice, registers) {
            Ok(action) => zone_actions.push(Spanned {
                node: action,
                position: source.position_of(slice),
            }),
            Err(ZoneParseError::Json(e)) => diagnostics.push(source.warn(
                source.error_position(slice, &e),
                ContractError::Json {
                    message: e.to_string(),
                },
            )),
            Err(ZoneParseError::Expression(e)) => {
                diagnostics.push(source.warn(source.position_of(slice), e.into()))
            }
        }
    }

    let mut properties = Vec::with_capacity(decl.constraints.len());
    for raw_constraint in &decl.constraints {
        let slice = raw_constraint.get();
        match parse_constraint(slice, registers) {
            Ok(property) => properties.push(Spanned {
                node: property,
                position: source.position_of(slice),
            }),
            Err(ConstraintParseError::Json(e)) => diagnostics.push(source.warn(
                source.error_position(slice, &e),
                ContractError::Json {
                    message: e.to_string(),
                },
            )),
            Err(ConstraintParseError::Expression { error, text_offset }) => {
                let offset = source.offset_of(slice) + text_offset + error.offset();
                diagnostics.push(source.warn(source.position_at(offset), error.into()))
            }
        }
    }

    if diagnostics.len() > before {
        return None;
    }

    Some(ParsedContract {
        contract: Contract {
            id,
            address,
            secondary_address,
            localization: decl.localization,
            zone_actions,
            properties,
            dominator: None,
            position,
        },
        nexts: decl.nexts,
        previouses: decl.previouses,
        dominator: decl.dominator,
    })
}

enum ZoneParseError {
    Json(serde_json::Error),
    Expression(ExpressionError),
}

fn parse_zone_action(
    slice: &str,
    registers: &dyn RegisterFile,
) -> Result<ZoneAction, ZoneParseError> {
    let decl: ZoneActionDecl = serde_json::from_str(slice).map_err(ZoneParseError::Json)?;
    decl.into_action(registers)
        .map_err(ZoneParseError::Expression)
}

enum ConstraintParseError {
    Json(serde_json::Error),
    /// `text_offset` is where the expression text starts inside the raw slice.
    Expression {
        error: ExpressionError,
        text_offset: usize,
    },
}

fn parse_constraint(
    slice: &str,
    registers: &dyn RegisterFile,
) -> Result<Property, ConstraintParseError> {
    match serde_json::from_str(slice).map_err(ConstraintParseError::Json)? {
        // Skip the opening quote
        ConstraintDecl::Text(text) => {
            parse_property(&text, registers).map_err(|error| ConstraintParseError::Expression {
                error,
                text_offset: 1,
            })
        }
        ConstraintDecl::Tree(node) => {
            node.into_property(registers)
                .map_err(|error| ConstraintParseError::Expression {
                    error,
                    text_offset: 0,
                })
        }
    }
}

/// Parse an ad hoc property document: one contract, no links to others.
pub fn parse_ad_hoc(
    text: &str,
    file: Option<&str>,
    registers: &dyn RegisterFile,
) -> Result<Contract, Diagnostics> {
    let source = SourceText::new(text, file);
    let mut diagnostics = Diagnostics::new();
    let document = parse_document(&source, registers, &mut diagnostics);
    if !diagnostics.is_empty() {
        return Err(diagnostics);
    }

    let mut contracts = document.map(|d| d.contracts).unwrap_or_default();
    if contracts.len() != 1 {
        diagnostics.push(source.warn(
            source.start(),
            ContractError::PropertyCount {
                count: contracts.len(),
            },
        ));
        return Err(diagnostics);
    }

    let parsed = contracts.remove(0);
    if !parsed.nexts.is_empty() || !parsed.previouses.is_empty() || parsed.dominator.is_some() {
        diagnostics.push(source.warn(parsed.contract.position.clone(), ContractError::PropertyLinks));
        return Err(diagnostics);
    }
    Ok(parsed.contract)
}
