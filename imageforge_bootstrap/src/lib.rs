// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Imageforge Bootstrap
//!
//! Entry-point concerns kept outside the application layers: CLI parsing
//! and validation, a minimal bootstrap logger for the phase before the
//! tracing subscriber exists, signal-driven shutdown coordination, and a
//! platform abstraction for the handful of OS facts the engine needs
//! (CPU count, page size, process start time, privilege).
//!
//! The bootstrap crate deliberately knows nothing about manifests,
//! stores, or sandboxes; it hands a validated configuration to the main
//! crate and gets out of the way.

pub mod cli;
pub mod logger;
pub mod platform;
pub mod shutdown;

pub use cli::{parse_and_validate, ManifestSource, ParseError, ValidatedCli, ValidatedCommand};
pub use logger::{BootstrapLogger, LogLevel, StderrLogger};
pub use platform::{create_platform, Platform, PlatformError};
pub use shutdown::{CancellationToken, ShutdownCoordinator};
