// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Interface Layer
//!
//! The terminal-facing glue between the CLI and the application layer:
//! tracing bring-up, result-channel selection (human log lines on a
//! terminal, JSON-seq on a pipe or with `--json`), and the exit-code
//! contract — `0` success, `2` manifest-class errors, `1` build errors —
//! so scripted callers can tell "fix the manifest" from "the build
//! broke" without parsing records.

use std::io::IsTerminal;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use imageforge_domain::{BuildError, Monitor, ResultRecord};

use crate::infrastructure::monitoring::{JsonSeqMonitor, LogMonitor};

/// Exit code for successful runs.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code for build failures.
pub const EXIT_BUILD_ERROR: i32 = 1;
/// Exit code for manifest/usage failures.
pub const EXIT_MANIFEST_ERROR: i32 = 2;

/// Installs the tracing subscriber. Verbosity stacks: warn by default on
/// the engine's own targets, `-v` info, `-vv` debug, `-vvv` trace;
/// `RUST_LOG` overrides everything.
pub fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn,module=info",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Picks the result channel: JSON-seq when forced or when stdout is not
/// a terminal, human log lines otherwise.
pub fn select_monitor(force_json: bool) -> Arc<dyn Monitor> {
    if force_json || !std::io::stdout().is_terminal() {
        Arc::new(JsonSeqMonitor::new(std::io::stdout()))
    } else {
        Arc::new(LogMonitor)
    }
}

/// Maps the terminal record onto the process exit code.
pub fn exit_code(record: &ResultRecord) -> i32 {
    if record.success {
        return EXIT_SUCCESS;
    }
    match &record.error {
        Some(error) if is_manifest_kind(&error.kind) => EXIT_MANIFEST_ERROR,
        _ => EXIT_BUILD_ERROR,
    }
}

/// Exit code for an error that never produced a record (e.g. inspect).
pub fn exit_code_for_error(error: &BuildError) -> i32 {
    if error.is_manifest_error() {
        EXIT_MANIFEST_ERROR
    } else {
        EXIT_BUILD_ERROR
    }
}

fn is_manifest_kind(kind: &str) -> bool {
    matches!(
        kind,
        "manifest-invalid" | "module-unknown" | "cycle-detected" | "source-unresolved"
    )
}
