//! Checker configuration

/// Limits applied while interpreting blocks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckerConfig {
    /// Longest linear block, in instructions, before resolution gives up.
    pub max_block_instructions: usize,
    /// Most destinations an indirect branch may resolve to.
    pub target_bound: usize,
    /// Offset added to every address of the firmware image. When unset, the
    /// contract document's `alloc-shift` applies.
    pub alloc_shift: Option<u64>,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            max_block_instructions: 4096,
            target_bound: 64,
            alloc_shift: None,
        }
    }
}

impl CheckerConfig {
    /// The load shift to apply, preferring this configuration over `document`.
    pub fn effective_shift(&self, document: Option<u64>) -> u64 {
        self.alloc_shift.or(document).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_shift() {
        let config = CheckerConfig::default();
        assert_eq!(config.effective_shift(None), 0);
        assert_eq!(config.effective_shift(Some(0x100)), 0x100);

        let config = CheckerConfig {
            alloc_shift: Some(0x40),
            ..CheckerConfig::default()
        };
        assert_eq!(config.effective_shift(Some(0x100)), 0x40);
    }
}
