//! Command line arguments

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use contract_checker::CheckerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum Architecture {
    Arm64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum Domain {
    Interval,
}

#[derive(Debug, Parser)]
#[command(name = "contract-checker")]
#[command(about = "Check firmware machine code against a graph of contracts")]
#[command(version)]
pub(crate) struct Cli {
    /// Firmware image: an object file, or raw bytes mapped at 0.
    pub(crate) binary: PathBuf,

    /// JSON contract document.
    pub(crate) contracts: PathBuf,

    /// Instruction set of the firmware
    #[arg(long, value_enum, default_value_t = Architecture::Arm64)]
    pub(crate) arch: Architecture,

    /// Abstract value domain
    #[arg(long, value_enum, default_value_t = Domain::Interval)]
    pub(crate) domain: Domain,

    /// Additionally check the single contract of this document.
    #[arg(long, value_name = "FILE")]
    pub(crate) property: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long)]
    pub(crate) verbose: bool,

    /// Longest linear block, in instructions
    #[arg(long, value_name = "N")]
    pub(crate) max_block: Option<usize>,

    /// Most destinations an indirect branch may resolve to
    #[arg(long, value_name = "N")]
    pub(crate) target_bound: Option<usize>,

    /// Offset added to the image addresses; overrides the document's `alloc-shift`
    #[arg(long, value_name = "N", value_parser = parse_number)]
    pub(crate) alloc_shift: Option<u64>,
}

impl Cli {
    pub(crate) fn config(&self) -> CheckerConfig {
        let defaults = CheckerConfig::default();
        CheckerConfig {
            max_block_instructions: self.max_block.unwrap_or(defaults.max_block_instructions),
            target_bound: self.target_bound.unwrap_or(defaults.target_bound),
            alloc_shift: self.alloc_shift,
        }
    }
}

/// Decimal or `0x` hexadecimal.
fn parse_number(text: &str) -> Result<u64, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid number `{}`: {}", text, e))
}
