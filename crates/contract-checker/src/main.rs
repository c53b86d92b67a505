//! CLI for contract-checker
//!
//! Loads a firmware image and a contract document, checks every block between
//! contracts and reports the verdict along with the coverage reached.
//!
//! # Usage
//!
//! ```bash
//! contract-checker firmware.elf contracts.json
//!
//! # Also check one property at an arbitrary address
//! contract-checker firmware.elf contracts.json --property property.json -v
//! ```

mod cli;

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use contract_checker::{
    load_contracts, load_property, Arm64Semantics, CheckError, Checker, CheckerConfig, CodeImage,
    ContractGraph, InstructionSemantics, IntervalDomain, ValueDomain,
};
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::cli::{Architecture, Cli, Domain};

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = cli.config();
    let outcome = match (cli.arch, cli.domain) {
        (Architecture::Arm64, Domain::Interval) => {
            run(&cli, &config, &Arm64Semantics, &IntervalDomain)
        }
    };

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            report_fatal(&cli, &e);
            ExitCode::FAILURE
        }
    }
}

fn report_fatal(cli: &Cli, e: &CheckError) {
    match e {
        CheckError::Contracts { path, diagnostics } => {
            println!("unable to load contracts from file {}", path.display());
            print!("{}", diagnostics);
        }
        CheckError::Io { path, .. } if path == &cli.contracts => {
            println!("unable to load contracts from file {}", path.display());
            error!("{}", e);
        }
        _ => error!("{}", e),
    }
}

/// Returns true when every check succeeded.
fn run<S: InstructionSemantics, D: ValueDomain>(
    cli: &Cli,
    config: &CheckerConfig,
    semantics: &S,
    domain: &D,
) -> Result<bool, CheckError> {
    let graph = load_contracts(&cli.contracts, semantics)?;
    let image = load_image(&cli.binary, config, &graph)?;
    let checker = Checker::new(&graph, &image, semantics, domain, config);

    let report = checker.verify_all();
    for warning in report.diagnostics() {
        println!("{}", warning);
    }
    if report.is_ok() {
        println!("all contracts have been verified!");
    } else {
        println!("some contracts have failed!");
    }
    if report.coverage_complete {
        println!("contract coverage fully verified");
    } else {
        println!("incomplete contract verification");
    }
    let mut success = report.is_ok();

    if let Some(path) = &cli.property {
        let property = load_property(path, semantics)?;
        let outcome = checker.check_property(&property);
        print!("{}", outcome.diagnostics);
        if outcome.proved {
            println!("property is proved");
        } else {
            println!("property is not proved");
            success = false;
        }
    }
    Ok(success)
}

fn load_image(path: &Path, config: &CheckerConfig, graph: &ContractGraph) -> Result<CodeImage, CheckError> {
    let shift = config.effective_shift(graph.alloc_shift());
    Ok(CodeImage::load(path)?.shifted(shift))
}
