//! Memory zone actions
//!
//! Contracts name regions of memory and reshape them when control-flow paths
//! disagree on the partitioning. Zones are inherited along the dominator chain,
//! so validation replays the actions of every dominator before a contract's own.

use std::collections::BTreeSet;
use std::fmt;

use serde::Deserialize;

use super::expression::{parse_expression, Expression, ExpressionError};
use super::ContractError;
use crate::semantics::RegisterFile;

/// One step of zone bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneAction {
    Create {
        name: String,
        start: Expression,
        length: Expression,
    },
    Rename {
        from: String,
        to: String,
    },
    /// `zone` keeps `[start, at)`, `name` receives `[at, end)`.
    Split {
        zone: String,
        at: Expression,
        name: String,
    },
    /// `first` absorbs `second`.
    Merge {
        first: String,
        second: String,
    },
}

impl ZoneAction {
    /// Replay this action over the set of live zone names.
    pub fn declare(&self, zones: &mut BTreeSet<String>) -> Result<(), ContractError> {
        let require = |zones: &BTreeSet<String>, name: &str| {
            if zones.contains(name) {
                Ok(())
            } else {
                Err(ContractError::UndeclaredZone {
                    name: name.to_string(),
                })
            }
        };
        let fresh = |zones: &BTreeSet<String>, name: &str| {
            if zones.contains(name) {
                Err(ContractError::DuplicateZone {
                    name: name.to_string(),
                })
            } else {
                Ok(())
            }
        };
        let referenced = |zones: &BTreeSet<String>, expressions: &[&Expression]| {
            expressions
                .iter()
                .flat_map(|e| e.zones())
                .try_for_each(|name| require(zones, name))
        };

        match self {
            ZoneAction::Create {
                name,
                start,
                length,
            } => {
                referenced(zones, &[start, length])?;
                fresh(zones, name)?;
                zones.insert(name.clone());
            }
            ZoneAction::Rename { from, to } => {
                require(zones, from)?;
                fresh(zones, to)?;
                zones.remove(from);
                zones.insert(to.clone());
            }
            ZoneAction::Split { zone, at, name } => {
                require(zones, zone)?;
                referenced(zones, &[at])?;
                fresh(zones, name)?;
                zones.insert(name.clone());
            }
            ZoneAction::Merge { first, second } => {
                require(zones, first)?;
                require(zones, second)?;
                if first == second {
                    return Err(ContractError::SelfMerge {
                        name: first.clone(),
                    });
                }
                zones.remove(second);
            }
        }
        Ok(())
    }
}

impl fmt::Display for ZoneAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZoneAction::Create {
                name,
                start,
                length,
            } => write!(f, "create {} at {} length {}", name, start, length),
            ZoneAction::Rename { from, to } => write!(f, "rename {} to {}", from, to),
            ZoneAction::Split { zone, at, name } => write!(f, "split {} at {} into {}", zone, at, name),
            ZoneAction::Merge { first, second } => write!(f, "merge {} into {}", second, first),
        }
    }
}

/// Zone action as written in a contract document
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase", deny_unknown_fields)]
pub(crate) enum ZoneActionDecl {
    Create {
        name: String,
        start: String,
        length: String,
    },
    Rename {
        from: String,
        to: String,
    },
    Split {
        zone: String,
        at: String,
        name: String,
    },
    Merge {
        first: String,
        second: String,
    },
}

impl ZoneActionDecl {
    pub(crate) fn into_action(
        self,
        registers: &dyn RegisterFile,
    ) -> Result<ZoneAction, ExpressionError> {
        Ok(match self {
            ZoneActionDecl::Create {
                name,
                start,
                length,
            } => ZoneAction::Create {
                name,
                start: parse_expression(&start, registers)?,
                length: parse_expression(&length, registers)?,
            },
            ZoneActionDecl::Rename { from, to } => ZoneAction::Rename { from, to },
            ZoneActionDecl::Split { zone, at, name } => ZoneAction::Split {
                zone,
                at: parse_expression(&at, registers)?,
                name,
            },
            ZoneActionDecl::Merge { first, second } => ZoneAction::Merge { first, second },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::expression::tests::TestRegisters;

    fn action(json: &str) -> ZoneAction {
        let decl: ZoneActionDecl = serde_json::from_str(json).unwrap();
        decl.into_action(&TestRegisters).unwrap()
    }

    #[test]
    fn test_declare_sequence() {
        let mut zones = BTreeSet::new();
        action(r#"{"create": {"name": "stack", "start": "sp", "length": "0x100"}}"#)
            .declare(&mut zones)
            .unwrap();
        action(r#"{"split": {"zone": "stack", "at": "@stack + 0x10", "name": "locals"}}"#)
            .declare(&mut zones)
            .unwrap();
        action(r#"{"rename": {"from": "stack", "to": "frame"}}"#)
            .declare(&mut zones)
            .unwrap();
        assert_eq!(zones.iter().collect::<Vec<_>>(), vec!["frame", "locals"]);

        action(r#"{"merge": {"first": "frame", "second": "locals"}}"#)
            .declare(&mut zones)
            .unwrap();
        assert_eq!(zones.iter().collect::<Vec<_>>(), vec!["frame"]);
    }

    #[test]
    fn test_undeclared_zone() {
        let mut zones = BTreeSet::new();
        let err = action(r#"{"rename": {"from": "heap", "to": "arena"}}"#)
            .declare(&mut zones)
            .unwrap_err();
        assert!(matches!(err, ContractError::UndeclaredZone { name } if name == "heap"));

        // Expressions inside actions must reference live zones too
        let err = action(r#"{"create": {"name": "a", "start": "@b", "length": "4"}}"#)
            .declare(&mut zones)
            .unwrap_err();
        assert!(matches!(err, ContractError::UndeclaredZone { name } if name == "b"));
    }

    #[test]
    fn test_duplicate_and_self_merge() {
        let mut zones = BTreeSet::from(["stack".to_string()]);
        let err = action(r#"{"create": {"name": "stack", "start": "0", "length": "4"}}"#)
            .declare(&mut zones)
            .unwrap_err();
        assert!(matches!(err, ContractError::DuplicateZone { .. }));

        let err = action(r#"{"merge": {"first": "stack", "second": "stack"}}"#)
            .declare(&mut zones)
            .unwrap_err();
        assert!(matches!(err, ContractError::SelfMerge { .. }));
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let result: Result<ZoneActionDecl, _> =
            serde_json::from_str(r#"{"shrink": {"zone": "stack"}}"#);
        assert!(result.is_err());
    }
}
