//! Property expressions
//!
//! Properties are written either as text (`x0 == 0`, `[sp + 8]:4 in [0, 16]`,
//! `@stack + 0x10 > x1`) or as a structured JSON tree of `register`,
//! `indirect`, `zone`, `domain` and `operation` nodes. Both forms produce the
//! same [`Property`].

use std::fmt;

use serde::Deserialize;
use thiserror::Error;

use crate::semantics::{BinaryOp, RegisterFile, Relation};

/// Malformed expression syntax. Offsets are byte offsets into the text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("unexpected `{found}` at offset {offset}")]
    UnexpectedToken { offset: usize, found: String },

    #[error("unexpected end of expression")]
    UnexpectedEnd { offset: usize },

    #[error("invalid number `{text}`")]
    InvalidNumber { offset: usize, text: String },

    #[error("unknown register `{name}`")]
    UnknownRegister { offset: usize, name: String },

    #[error("invalid access size {size} (expected 1, 2, 4 or 8)")]
    InvalidSize { offset: usize, size: u64 },

    #[error("empty range [{min}, {max}]")]
    EmptyRange { offset: usize, min: u64, max: u64 },

    #[error("unknown operation `{code}`")]
    UnknownOperation { code: String },

    #[error("a property must compare two expressions")]
    NotAProperty,
}

impl ExpressionError {
    pub fn offset(&self) -> usize {
        match self {
            ExpressionError::UnexpectedToken { offset, .. }
            | ExpressionError::UnexpectedEnd { offset }
            | ExpressionError::InvalidNumber { offset, .. }
            | ExpressionError::UnknownRegister { offset, .. }
            | ExpressionError::InvalidSize { offset, .. }
            | ExpressionError::EmptyRange { offset, .. } => *offset,
            ExpressionError::UnknownOperation { .. } | ExpressionError::NotAProperty => 0,
        }
    }
}

/// Value expression over registers, memory and zone addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    Register { index: usize, name: String },
    /// Start address of a memory zone.
    Zone(String),
    Load { address: Box<Expression>, size: u8 },
    Constant(u64),
    Range { min: u64, max: u64 },
    Binary {
        op: BinaryOp,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
}

impl Expression {
    /// Names of every zone this expression refers to.
    pub fn zones(&self) -> Vec<&str> {
        let mut zones = Vec::new();
        self.collect_zones(&mut zones);
        zones
    }

    fn collect_zones<'a>(&'a self, zones: &mut Vec<&'a str>) {
        match self {
            Expression::Zone(name) => zones.push(name),
            Expression::Load { address, .. } => address.collect_zones(zones),
            Expression::Binary { lhs, rhs, .. } => {
                lhs.collect_zones(zones);
                rhs.collect_zones(zones);
            }
            _ => {}
        }
    }

    /// True for registers and memory loads, the places a property can constrain.
    pub fn is_location(&self) -> bool {
        matches!(self, Expression::Register { .. } | Expression::Load { .. })
    }

    /// True if both expressions name the same register or memory location.
    /// Registers compare by index, so aliases such as `w0` and `x0` match.
    pub fn same_location(&self, other: &Expression) -> bool {
        match (self, other) {
            (Expression::Register { index: a, .. }, Expression::Register { index: b, .. }) => a == b,
            _ => self.is_location() && self == other,
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn operand(f: &mut fmt::Formatter<'_>, e: &Expression) -> fmt::Result {
            match e {
                Expression::Binary { .. } => write!(f, "({})", e),
                _ => write!(f, "{}", e),
            }
        }

        match self {
            Expression::Register { name, .. } => f.write_str(name),
            Expression::Zone(name) => write!(f, "@{}", name),
            Expression::Load { address, size: 8 } => write!(f, "[{}]", address),
            Expression::Load { address, size } => write!(f, "[{}]:{}", address, size),
            Expression::Constant(value) if *value < 0x100 => write!(f, "{}", value),
            Expression::Constant(value) => write!(f, "{:#x}", value),
            Expression::Range { min, max } => write!(f, "[{}, {}]", min, max),
            Expression::Binary { op, lhs, rhs } => {
                operand(f, lhs)?;
                write!(f, " {} ", op)?;
                operand(f, rhs)
            }
        }
    }
}

/// A constraint `lhs relation rhs`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub relation: Relation,
    pub lhs: Expression,
    pub rhs: Expression,
}

impl Property {
    pub fn zones(&self) -> Vec<&str> {
        let mut zones = self.lhs.zones();
        zones.extend(self.rhs.zones());
        zones
    }

    /// The location this property constrains: its left side when that is a
    /// location, else its right side. In `x1 == x0` only `x1` is constrained.
    pub fn constrained_location(&self) -> Option<&Expression> {
        [&self.lhs, &self.rhs].into_iter().find(|side| side.is_location())
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.lhs, self.relation, self.rhs)
    }
}

/// Parse a text property such as `x0 == 0` or `x1 in [0, 16]`.
pub fn parse_property(text: &str, registers: &dyn RegisterFile) -> Result<Property, ExpressionError> {
    let mut parser = Parser::new(text, registers)?;
    let property = parser.property()?;
    parser.finish()?;
    Ok(property)
}

/// Parse a text value expression such as `sp + 0x10`.
pub fn parse_expression(
    text: &str,
    registers: &dyn RegisterFile,
) -> Result<Expression, ExpressionError> {
    let mut parser = Parser::new(text, registers)?;
    let expression = parser.sum()?;
    parser.finish()?;
    Ok(expression)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Number(u64),
    Ident(String),
    At,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Colon,
    Comma,
    Op(BinaryOp),
    Rel(Relation),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{}", n),
            Token::Ident(s) => f.write_str(s),
            Token::At => f.write_str("@"),
            Token::LBracket => f.write_str("["),
            Token::RBracket => f.write_str("]"),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::Colon => f.write_str(":"),
            Token::Comma => f.write_str(","),
            Token::Op(op) => write!(f, "{}", op),
            Token::Rel(rel) => write!(f, "{}", rel),
        }
    }
}

fn parse_number(text: &str, offset: usize) -> Result<u64, ExpressionError> {
    let cleaned = text.replace('_', "");
    let parsed = match cleaned.strip_prefix("0x").or_else(|| cleaned.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => cleaned.parse(),
    };
    parsed.map_err(|_| ExpressionError::InvalidNumber {
        offset,
        text: text.to_string(),
    })
}

fn tokenize(text: &str) -> Result<Vec<(usize, Token)>, ExpressionError> {
    let bytes = text.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;
        let two = bytes.get(i..i + 2).unwrap_or(&[]);

        let token = match c {
            b' ' | b'\t' | b'\n' | b'\r' => {
                i += 1;
                continue;
            }
            b'0'..=b'9' => {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                tokens.push((start, Token::Number(parse_number(&text[start..i], start)?)));
                continue;
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                tokens.push((start, Token::Ident(text[start..i].to_string())));
                continue;
            }
            _ if two == b"==" => Token::Rel(Relation::Eq),
            _ if two == b"!=" => Token::Rel(Relation::Ne),
            _ if two == b"<=" => Token::Rel(Relation::Le),
            _ if two == b">=" => Token::Rel(Relation::Ge),
            _ if two == b"<<" => Token::Op(BinaryOp::Shl),
            _ if two == b">>" => Token::Op(BinaryOp::Shr),
            b'<' => Token::Rel(Relation::Lt),
            b'>' => Token::Rel(Relation::Gt),
            b'+' => Token::Op(BinaryOp::Add),
            b'-' => Token::Op(BinaryOp::Sub),
            b'*' => Token::Op(BinaryOp::Mul),
            b'&' => Token::Op(BinaryOp::And),
            b'|' => Token::Op(BinaryOp::Or),
            b'^' => Token::Op(BinaryOp::Xor),
            b'@' => Token::At,
            b'[' => Token::LBracket,
            b']' => Token::RBracket,
            b'(' => Token::LParen,
            b')' => Token::RParen,
            b':' => Token::Colon,
            b',' => Token::Comma,
            _ => {
                let found = text[start..].chars().next().map(String::from).unwrap_or_default();
                return Err(ExpressionError::UnexpectedToken {
                    offset: start,
                    found,
                });
            }
        };

        i += match token {
            Token::Rel(Relation::Eq | Relation::Ne | Relation::Le | Relation::Ge)
            | Token::Op(BinaryOp::Shl | BinaryOp::Shr) => 2,
            _ => 1,
        };
        tokens.push((start, token));
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
    registers: &'a dyn RegisterFile,
}

impl<'a> Parser<'a> {
    fn new(text: &str, registers: &'a dyn RegisterFile) -> Result<Self, ExpressionError> {
        Ok(Self {
            tokens: tokenize(text)?,
            pos: 0,
            end: text.len(),
            registers,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |(o, _)| *o)
    }

    fn next(&mut self) -> Result<(usize, Token), ExpressionError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(ExpressionError::UnexpectedEnd { offset: self.end })?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExpressionError> {
        let (offset, token) = self.next()?;
        if token == expected {
            Ok(())
        } else {
            Err(ExpressionError::UnexpectedToken {
                offset,
                found: token.to_string(),
            })
        }
    }

    fn finish(&self) -> Result<(), ExpressionError> {
        match self.tokens.get(self.pos) {
            None => Ok(()),
            Some((offset, token)) => Err(ExpressionError::UnexpectedToken {
                offset: *offset,
                found: token.to_string(),
            }),
        }
    }

    fn property(&mut self) -> Result<Property, ExpressionError> {
        let lhs = self.sum()?;
        let (offset, token) = self.next()?;
        match token {
            Token::Rel(relation) => Ok(Property {
                relation,
                lhs,
                rhs: self.sum()?,
            }),
            Token::Ident(word) if word == "in" => Ok(Property {
                relation: Relation::In,
                lhs,
                rhs: self.range()?,
            }),
            other => Err(ExpressionError::UnexpectedToken {
                offset,
                found: other.to_string(),
            }),
        }
    }

    fn range(&mut self) -> Result<Expression, ExpressionError> {
        let offset = self.offset();
        self.expect(Token::LBracket)?;
        let min = self.number()?;
        self.expect(Token::Comma)?;
        let max = self.number()?;
        self.expect(Token::RBracket)?;
        if min > max {
            return Err(ExpressionError::EmptyRange { offset, min, max });
        }
        Ok(Expression::Range { min, max })
    }

    fn number(&mut self) -> Result<u64, ExpressionError> {
        match self.next()? {
            (_, Token::Number(n)) => Ok(n),
            (offset, other) => Err(ExpressionError::UnexpectedToken {
                offset,
                found: other.to_string(),
            }),
        }
    }

    fn sum(&mut self) -> Result<Expression, ExpressionError> {
        let mut lhs = self.product()?;
        while let Some(Token::Op(op @ (BinaryOp::Add | BinaryOp::Sub | BinaryOp::Or | BinaryOp::Xor))) =
            self.peek().cloned()
        {
            self.pos += 1;
            let rhs = self.product()?;
            lhs = Expression::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn product(&mut self) -> Result<Expression, ExpressionError> {
        let mut lhs = self.atom()?;
        while let Some(Token::Op(op @ (BinaryOp::Mul | BinaryOp::And | BinaryOp::Shl | BinaryOp::Shr))) =
            self.peek().cloned()
        {
            self.pos += 1;
            let rhs = self.atom()?;
            lhs = Expression::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn atom(&mut self) -> Result<Expression, ExpressionError> {
        let (offset, token) = self.next()?;
        match token {
            Token::Number(n) => Ok(Expression::Constant(n)),
            Token::Ident(name) => register(self.registers, name, offset),
            Token::At => match self.next()? {
                (_, Token::Ident(name)) => Ok(Expression::Zone(name)),
                (offset, other) => Err(ExpressionError::UnexpectedToken {
                    offset,
                    found: other.to_string(),
                }),
            },
            Token::LParen => {
                let inner = self.sum()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::LBracket => {
                let address = self.sum()?;
                self.expect(Token::RBracket)?;
                let size = if self.peek() == Some(&Token::Colon) {
                    self.pos += 1;
                    let size_offset = self.offset();
                    access_size(self.number()?, size_offset)?
                } else {
                    8
                };
                Ok(Expression::Load {
                    address: Box::new(address),
                    size,
                })
            }
            other => Err(ExpressionError::UnexpectedToken {
                offset,
                found: other.to_string(),
            }),
        }
    }
}

fn register(
    registers: &dyn RegisterFile,
    name: String,
    offset: usize,
) -> Result<Expression, ExpressionError> {
    match registers.register_index(&name) {
        Some(index) => Ok(Expression::Register { index, name }),
        None => Err(ExpressionError::UnknownRegister { offset, name }),
    }
}

fn access_size(size: u64, offset: usize) -> Result<u8, ExpressionError> {
    match size {
        1 | 2 | 4 | 8 => Ok(size as u8),
        _ => Err(ExpressionError::InvalidSize { offset, size }),
    }
}

fn default_size() -> u64 {
    8
}

/// Structured expression tree, as found in contract documents
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub(crate) enum ExpressionNode {
    Register {
        content: String,
    },
    Indirect {
        address: Box<ExpressionNode>,
        #[serde(default = "default_size")]
        size: u64,
    },
    Zone {
        content: String,
    },
    Domain {
        content: String,
    },
    Operation {
        code: String,
        first: Box<ExpressionNode>,
        second: Box<ExpressionNode>,
    },
}

enum Operation {
    Arithmetic(BinaryOp),
    Comparison(Relation),
}

fn operation(code: &str) -> Option<Operation> {
    use Operation::{Arithmetic, Comparison};

    Some(match code.to_ascii_lowercase().as_str() {
        "+" | "add" | "plus" => Arithmetic(BinaryOp::Add),
        "-" | "sub" | "minus" => Arithmetic(BinaryOp::Sub),
        "*" | "mul" | "times" => Arithmetic(BinaryOp::Mul),
        "&" | "and" => Arithmetic(BinaryOp::And),
        "|" | "or" => Arithmetic(BinaryOp::Or),
        "^" | "xor" => Arithmetic(BinaryOp::Xor),
        "<<" | "shl" => Arithmetic(BinaryOp::Shl),
        ">>" | "shr" => Arithmetic(BinaryOp::Shr),
        "==" | "eq" => Comparison(Relation::Eq),
        "!=" | "ne" => Comparison(Relation::Ne),
        "<" | "lt" => Comparison(Relation::Lt),
        "<=" | "le" => Comparison(Relation::Le),
        ">" | "gt" => Comparison(Relation::Gt),
        ">=" | "ge" => Comparison(Relation::Ge),
        "in" => Comparison(Relation::In),
        _ => return None,
    })
}

impl ExpressionNode {
    pub(crate) fn into_property(
        self,
        registers: &dyn RegisterFile,
    ) -> Result<Property, ExpressionError> {
        let ExpressionNode::Operation {
            code,
            first,
            second,
        } = self
        else {
            return Err(ExpressionError::NotAProperty);
        };
        match operation(&code) {
            Some(Operation::Comparison(relation)) => Ok(Property {
                relation,
                lhs: first.into_expression(registers)?,
                rhs: second.into_expression(registers)?,
            }),
            Some(Operation::Arithmetic(_)) => Err(ExpressionError::NotAProperty),
            None => Err(ExpressionError::UnknownOperation { code }),
        }
    }

    pub(crate) fn into_expression(
        self,
        registers: &dyn RegisterFile,
    ) -> Result<Expression, ExpressionError> {
        match self {
            ExpressionNode::Register { content } => register(registers, content, 0),
            ExpressionNode::Indirect { address, size } => Ok(Expression::Load {
                address: Box::new(address.into_expression(registers)?),
                size: access_size(size, 0)?,
            }),
            ExpressionNode::Zone { content } => Ok(Expression::Zone(content)),
            ExpressionNode::Domain { content } => parse_literal(&content),
            ExpressionNode::Operation {
                code,
                first,
                second,
            } => match operation(&code) {
                Some(Operation::Arithmetic(op)) => Ok(Expression::Binary {
                    op,
                    lhs: Box::new(first.into_expression(registers)?),
                    rhs: Box::new(second.into_expression(registers)?),
                }),
                Some(Operation::Comparison(_)) => Err(ExpressionError::UnexpectedToken {
                    offset: 0,
                    found: code,
                }),
                None => Err(ExpressionError::UnknownOperation { code }),
            },
        }
    }
}

/// Parse a domain literal: a number or an inclusive range `[min, max]`.
fn parse_literal(text: &str) -> Result<Expression, ExpressionError> {
    struct NoRegisters;
    impl RegisterFile for NoRegisters {
        fn registers(&self) -> &[&'static str] {
            &[]
        }
    }

    let mut parser = Parser::new(text, &NoRegisters)?;
    let literal = if parser.peek() == Some(&Token::LBracket) {
        parser.range()?
    } else {
        Expression::Constant(parser.number()?)
    };
    parser.finish()?;
    Ok(literal)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Register file `r0`..`r7` plus `sp`.
    pub(crate) struct TestRegisters;

    impl RegisterFile for TestRegisters {
        fn registers(&self) -> &[&'static str] {
            &["r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "sp"]
        }
    }

    #[test]
    fn test_parse_equality() {
        let property = parse_property("r0 == 0", &TestRegisters).unwrap();
        assert_eq!(property.relation, Relation::Eq);
        assert_eq!(
            property.lhs,
            Expression::Register {
                index: 0,
                name: "r0".into()
            }
        );
        assert_eq!(property.rhs, Expression::Constant(0));
        assert_eq!(property.to_string(), "r0 == 0");
    }

    #[test]
    fn test_parse_range_membership() {
        let property = parse_property("[sp + 8]:4 in [0, 0x10]", &TestRegisters).unwrap();
        assert_eq!(property.relation, Relation::In);
        assert_eq!(property.rhs, Expression::Range { min: 0, max: 16 });
        assert_eq!(property.to_string(), "[sp + 8]:4 in [0, 16]");
        assert!(property.lhs.is_location());
    }

    #[test]
    fn test_constrained_location() {
        let relational = parse_property("r1 == r0", &TestRegisters).unwrap();
        assert_eq!(relational.constrained_location(), Some(&relational.lhs));

        let reversed = parse_property("4 < [sp]:8", &TestRegisters).unwrap();
        assert_eq!(reversed.constrained_location(), Some(&reversed.rhs));

        let constant = parse_property("4 == 4", &TestRegisters).unwrap();
        assert_eq!(constant.constrained_location(), None);

        let r0 = parse_expression("r0", &TestRegisters).unwrap();
        assert!(r0.same_location(&relational.rhs));
        assert!(!r0.same_location(&relational.lhs));
        assert!(!Expression::Constant(0).same_location(&Expression::Constant(0)));
    }

    #[test]
    fn test_precedence() {
        let e = parse_expression("r1 + r2 * 4", &TestRegisters).unwrap();
        assert_eq!(e.to_string(), "r1 + (r2 * 4)");

        let e = parse_expression("(r1 + r2) << 2", &TestRegisters).unwrap();
        assert_eq!(e.to_string(), "(r1 + r2) << 2");
    }

    #[test]
    fn test_zone_references() {
        let property = parse_property("[@stack + 0x10] != @heap", &TestRegisters).unwrap();
        assert_eq!(property.zones(), vec!["stack", "heap"]);
    }

    #[test]
    fn test_unknown_register() {
        let err = parse_property("r9 == 0", &TestRegisters).unwrap_err();
        assert!(matches!(err, ExpressionError::UnknownRegister { offset: 0, .. }));
    }

    #[test]
    fn test_malformed_syntax() {
        let err = parse_property("r0 == ", &TestRegisters).unwrap_err();
        assert!(matches!(err, ExpressionError::UnexpectedEnd { offset: 6 }));

        let err = parse_property("r0 + 1", &TestRegisters).unwrap_err();
        assert!(matches!(err, ExpressionError::UnexpectedEnd { .. }));

        let err = parse_property("r0 == 1 1", &TestRegisters).unwrap_err();
        assert!(matches!(err, ExpressionError::UnexpectedToken { offset: 8, .. }));

        let err = parse_property("r0 == $", &TestRegisters).unwrap_err();
        assert!(matches!(err, ExpressionError::UnexpectedToken { offset: 6, .. }));

        let err = parse_property("[sp]:3 == 0", &TestRegisters).unwrap_err();
        assert!(matches!(err, ExpressionError::InvalidSize { size: 3, .. }));

        let err = parse_property("r0 in [4, 1]", &TestRegisters).unwrap_err();
        assert!(matches!(err, ExpressionError::EmptyRange { .. }));

        let err = parse_property("r0 == 0xzz", &TestRegisters).unwrap_err();
        assert!(matches!(err, ExpressionError::InvalidNumber { .. }));
    }

    #[test]
    fn test_structured_property() {
        let node: ExpressionNode = serde_json::from_str(
            r#"{
                "type": "operation", "code": "==",
                "first": {"type": "indirect", "address": {"type": "register", "content": "sp"}, "size": 4},
                "second": {"type": "domain", "content": "[1, 2]"}
            }"#,
        )
        .unwrap();
        let property = node.into_property(&TestRegisters).unwrap();
        assert_eq!(property.to_string(), "[sp]:4 == [1, 2]");
    }

    #[test]
    fn test_structured_property_requires_comparison() {
        let node: ExpressionNode = serde_json::from_str(
            r#"{"type": "operation", "code": "+",
                "first": {"type": "register", "content": "r0"},
                "second": {"type": "domain", "content": "1"}}"#,
        )
        .unwrap();
        assert_eq!(
            node.into_property(&TestRegisters),
            Err(ExpressionError::NotAProperty)
        );
    }
}
