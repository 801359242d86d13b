// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Platform Abstraction
//!
//! The OS facts the engine needs, behind one trait: the CPU count that
//! sizes the source-fetch worker pools, the process start time the object
//! store uses as its reclaim cutoff, and whether the process is privileged
//! — which decides if the sandbox gets a user namespace with single-id
//! maps or runs with host identities.
//!
//! Compile-time selection via `#[cfg]`; the unix implementation reads
//! libc, and everything is trait-mocked in tests.

use std::time::SystemTime;
use thiserror::Error;

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub use unix::UnixPlatform;

/// Platform-specific errors.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Feature not supported on this platform
    #[error("not supported on this platform: {0}")]
    NotSupported(String),
}

/// OS facts and probes used during bring-up.
///
/// Stateless and thread-safe; one instance is created at startup and
/// shared by reference.
pub trait Platform: Send + Sync {
    /// Number of logical CPUs (at least 1). Sizes the per-kind
    /// source-fetch worker pools.
    fn cpu_count(&self) -> usize;

    /// When this process started. The object store treats `tmp/` entries
    /// older than this as orphans safe to reclaim.
    fn process_start_time(&self) -> SystemTime;

    /// Whether the process can take the privileged sandbox path. When
    /// false, module sandboxes add a user namespace with single-id maps.
    fn is_privileged(&self) -> bool;

    /// Human-readable platform name for logs.
    fn platform_name(&self) -> &'static str;
}

/// Creates the platform implementation for the current OS.
pub fn create_platform() -> Box<dyn Platform> {
    #[cfg(unix)]
    {
        Box::new(UnixPlatform::new())
    }
    #[cfg(not(unix))]
    {
        compile_error!("imageforge requires a unix platform");
    }
}
