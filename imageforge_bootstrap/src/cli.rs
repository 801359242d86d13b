// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Command-Line Interface
//!
//! Bootstrap-layer CLI handling: parse with clap, then validate into a
//! [`ValidatedCli`] the main crate can trust — sizes parsed, selectors
//! checked for obvious nonsense, the manifest source pinned down. The
//! hidden `host-service` subcommand is how the engine re-executes itself
//! as a helper process; it never appears in `--help`.
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │  1. Cli::parse()                    │  Parse CLI with clap
//! └─────────────────┬───────────────────┘
//!                   ↓
//! ┌─────────────────────────────────────┐
//! │  2. validate_cli()                  │  Ranges, sizes, selectors
//! └─────────────────┬───────────────────┘
//!                   ↓
//! ┌─────────────────────────────────────┐
//! │  3. ValidatedCli                    │  Safe, validated config
//! └─────────────────────────────────────┘
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use thiserror::Error;

/// CLI validation errors.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid value for {arg}: {reason}")]
    InvalidValue { arg: String, reason: String },
}

/// Raw CLI surface, straight from clap.
#[derive(Debug, Parser)]
#[command(
    name = "imageforge",
    about = "Build operating-system artifacts from a declarative manifest",
    version
)]
pub struct Cli {
    /// Manifest file; '-' or absent reads standard input
    pub manifest: Option<PathBuf>,

    /// Object store directory
    #[arg(long)]
    pub store: Option<PathBuf>,

    /// Directory exports are written into
    #[arg(long = "output-directory", short = 'o')]
    pub output_directory: Option<PathBuf>,

    /// Checkpoint a pipeline name, stage name, or stage id (repeatable)
    #[arg(long = "checkpoint")]
    pub checkpoints: Vec<String>,

    /// Export a pipeline by name (repeatable)
    #[arg(long = "export")]
    pub exports: Vec<String>,

    /// Source cache bound, e.g. 512M or 2G (default: unbounded)
    #[arg(long = "cache-max-size")]
    pub cache_max_size: Option<String>,

    /// Validate and print the resolved manifest with ids, then exit
    #[arg(long)]
    pub inspect: bool,

    /// Force the JSON-seq result stream even on a terminal
    #[arg(long)]
    pub json: bool,

    /// Additional module search directories (repeatable, searched first)
    #[arg(long = "module-path")]
    pub module_path: Vec<PathBuf>,

    /// Engine configuration file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Internal: run one helper process (fd 3 startup blob, fd 4 channel)
    #[command(name = "host-service", hide = true)]
    HostService { role: String },
}

/// Where the manifest bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource {
    Stdin,
    File(PathBuf),
}

/// Validated command variants.
#[derive(Debug, Clone)]
pub enum ValidatedCommand {
    Build {
        manifest: ManifestSource,
        store: Option<PathBuf>,
        output_directory: Option<PathBuf>,
        checkpoints: Vec<String>,
        exports: Vec<String>,
        cache_max_size: Option<u64>,
        module_path: Vec<PathBuf>,
        json: bool,
        config: Option<PathBuf>,
    },
    Inspect {
        manifest: ManifestSource,
        module_path: Vec<PathBuf>,
        config: Option<PathBuf>,
    },
    HostService {
        role: String,
    },
}

/// All CLI arguments after validation.
#[derive(Debug, Clone)]
pub struct ValidatedCli {
    pub command: ValidatedCommand,
    pub verbose: u8,
}

/// Parse and validate CLI arguments.
pub fn parse_and_validate() -> Result<ValidatedCli, ParseError> {
    validate_cli(Cli::parse())
}

/// Validation layer over the parsed CLI.
pub fn validate_cli(cli: Cli) -> Result<ValidatedCli, ParseError> {
    if let Some(Command::HostService { role }) = cli.command {
        return Ok(ValidatedCli {
            command: ValidatedCommand::HostService { role },
            verbose: cli.verbose,
        });
    }

    let manifest = match &cli.manifest {
        None => ManifestSource::Stdin,
        Some(path) if path.as_os_str() == "-" => ManifestSource::Stdin,
        Some(path) => ManifestSource::File(path.clone()),
    };

    for selector in cli.checkpoints.iter().chain(cli.exports.iter()) {
        if selector.is_empty() || selector.contains('/') {
            return Err(ParseError::InvalidValue {
                arg: "checkpoint/export".to_owned(),
                reason: format!("selector {selector:?} is not a valid name or id"),
            });
        }
    }

    let cache_max_size = cli
        .cache_max_size
        .as_deref()
        .map(parse_size)
        .transpose()?;

    let command = if cli.inspect {
        ValidatedCommand::Inspect {
            manifest,
            module_path: cli.module_path,
            config: cli.config,
        }
    } else {
        ValidatedCommand::Build {
            manifest,
            store: cli.store,
            output_directory: cli.output_directory,
            checkpoints: cli.checkpoints,
            exports: cli.exports,
            cache_max_size,
            module_path: cli.module_path,
            json: cli.json,
            config: cli.config,
        }
    };
    Ok(ValidatedCli {
        command,
        verbose: cli.verbose,
    })
}

/// Parses `512`, `512K`, `512M`, `2G`, `1T` into bytes.
pub fn parse_size(text: &str) -> Result<u64, ParseError> {
    let text = text.trim();
    let invalid = |reason: &str| ParseError::InvalidValue {
        arg: "cache-max-size".to_owned(),
        reason: format!("{text:?}: {reason}"),
    };
    if text.is_empty() {
        return Err(invalid("empty"));
    }
    let (digits, multiplier) = match text.chars().last().unwrap() {
        'k' | 'K' => (&text[..text.len() - 1], 1u64 << 10),
        'm' | 'M' => (&text[..text.len() - 1], 1u64 << 20),
        'g' | 'G' => (&text[..text.len() - 1], 1u64 << 30),
        't' | 'T' => (&text[..text.len() - 1], 1u64 << 40),
        '0'..='9' => (text, 1),
        _ => return Err(invalid("unknown unit")),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| invalid("not a number"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| invalid("overflows"))
}
