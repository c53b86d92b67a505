//! Positioned warnings collected across the pipeline

use std::fmt;
use std::sync::Arc;

/// Location in a source document (1-based line and column).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Position {
    pub file: Option<Arc<str>>,
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub fn new(file: Option<Arc<str>>, line: usize, column: usize) -> Self {
        Self { file, line, column }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file {
            Some(file) => write!(f, "{}:{}:{}", file, self.line, self.column),
            None => write!(f, "{}:{}", self.line, self.column),
        }
    }
}

/// An immutable diagnostic.
///
/// Warnings raised while reading contracts carry a source position; warnings
/// raised while interpreting code usually carry the instruction address instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub position: Option<Position>,
    pub address: Option<u64>,
    pub message: String,
}

impl Warning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            position: None,
            address: None,
            message: message.into(),
        }
    }

    pub fn at(position: Position, message: impl Into<String>) -> Self {
        Self {
            position: Some(position),
            ..Self::new(message)
        }
    }

    pub fn with_address(mut self, address: u64) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(position) = &self.position {
            write!(f, "{}: ", position)?;
        }
        if let Some(address) = self.address {
            write!(f, "[{:#x}] ", address)?;
        }
        f.write_str(&self.message)
    }
}

/// Ordered, append-only sequence of warnings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    warnings: Vec<Warning>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, warning: Warning) {
        self.warnings.push(warning);
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.warnings.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Warning> {
        self.warnings.iter()
    }

    /// Move every warning out, leaving the sink empty.
    pub fn drain(&mut self) -> std::vec::Drain<'_, Warning> {
        self.warnings.drain(..)
    }

    pub fn append(&mut self, other: &mut Diagnostics) {
        self.warnings.append(&mut other.warnings);
    }

    /// True if any warning message contains `needle`.
    pub fn mentions(&self, needle: &str) -> bool {
        self.warnings.iter().any(|w| w.message.contains(needle))
    }
}

impl Extend<Warning> for Diagnostics {
    fn extend<T: IntoIterator<Item = Warning>>(&mut self, iter: T) {
        self.warnings.extend(iter);
    }
}

impl FromIterator<Warning> for Diagnostics {
    fn from_iter<T: IntoIterator<Item = Warning>>(iter: T) -> Self {
        Self {
            warnings: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Diagnostics {
    type Item = Warning;
    type IntoIter = std::vec::IntoIter<Warning>;

    fn into_iter(self) -> Self::IntoIter {
        self.warnings.into_iter()
    }
}

impl<'a> IntoIterator for &'a Diagnostics {
    type Item = &'a Warning;
    type IntoIter = std::slice::Iter<'a, Warning>;

    fn into_iter(self) -> Self::IntoIter {
        self.warnings.iter()
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for warning in &self.warnings {
            writeln!(f, "{}", warning)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_display() {
        let position = Position::new(Some("contracts.json".into()), 3, 7);
        let warning = Warning::at(position, "undeclared memory zone `heap`");
        assert_eq!(
            warning.to_string(),
            "contracts.json:3:7: undeclared memory zone `heap`"
        );

        let warning = Warning::new("indirect target cannot be bounded").with_address(0x1004);
        assert_eq!(
            warning.to_string(),
            "[0x1004] indirect target cannot be bounded"
        );
    }

    #[test]
    fn test_diagnostics_keep_order() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.push(Warning::new("first"));
        diagnostics.push(Warning::new("second"));
        diagnostics.push(Warning::new("first"));

        let messages: Vec<_> = diagnostics.iter().map(|w| w.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second", "first"]);
        assert!(diagnostics.mentions("sec"));
    }

    #[test]
    fn test_drain_and_append() {
        let mut block = Diagnostics::new();
        block.push(Warning::new("a"));
        let mut run = Diagnostics::new();
        run.append(&mut block);
        assert!(block.is_empty());
        assert_eq!(run.len(), 1);

        let drained: Vec<_> = run.drain().collect();
        assert_eq!(drained.len(), 1);
        assert!(run.is_empty());
    }
}
