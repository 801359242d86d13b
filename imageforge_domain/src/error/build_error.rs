// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Domain Error System
//!
//! A single hierarchical error enum covers every failure the engine can
//! surface to a caller. Each variant corresponds to one wire-visible error
//! kind: the terminal result record names the failing pipeline, stage, and
//! module together with the `kind()` string of the error that stopped the
//! run, so automation can branch on kinds without parsing messages.
//!
//! ## Error Categories
//!
//! - **Manifest errors** — `ManifestInvalid`, `ModuleUnknown`,
//!   `CycleDetected`, `SourceUnresolved`. Detected before execution; the
//!   engine aborts without touching the store.
//! - **Source errors** — `SourceFetch`, `SourceChecksum`, `SourceAuth`.
//!   `SourceFetch` is retried inside the owning helper up to a bounded
//!   count; everything else is immediately fatal.
//! - **Store errors** — `StoreBusy`, `StoreIo`, `StoreCorrupt`.
//! - **Execution errors** — `SandboxSetup`, `ModuleExit`, `ModuleTimeout`,
//!   `HostServiceProtocol`, `DeviceOpen`, `MountFailed`.
//! - **Control** — `Cancelled`, `Internal`.
//!
//! Nothing is retried at the stage or pipeline level; reproducibility takes
//! precedence over resilience.

use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type BuildResult<T> = Result<T, BuildError>;

/// Domain-specific errors for the build engine.
///
/// Each variant carries a human-readable message; the structured context
/// (pipeline, stage, module) is attached by the executor when it emits the
/// terminal result record, not duplicated in every error value.
#[derive(Error, Debug, Clone)]
pub enum BuildError {
    #[error("invalid manifest: {0}")]
    ManifestInvalid(String),

    #[error("unknown module: {0}")]
    ModuleUnknown(String),

    #[error("cycle detected: {0}")]
    CycleDetected(String),

    #[error("unresolved source reference: {0}")]
    SourceUnresolved(String),

    #[error("source fetch failed: {0}")]
    SourceFetch(String),

    #[error("source checksum mismatch: {0}")]
    SourceChecksum(String),

    #[error("source authentication failed: {0}")]
    SourceAuth(String),

    #[error("object store busy: {0}")]
    StoreBusy(String),

    #[error("object store I/O error: {0}")]
    StoreIo(String),

    #[error("object store corrupt: {0}")]
    StoreCorrupt(String),

    #[error("sandbox setup failed: {0}")]
    SandboxSetup(String),

    #[error("module {module} exited with status {code}: {message}")]
    ModuleExit {
        module: String,
        code: i32,
        message: String,
    },

    #[error("module timed out: {0}")]
    ModuleTimeout(String),

    #[error("host service protocol violation: {0}")]
    HostServiceProtocol(String),

    #[error("device open failed: {0}")]
    DeviceOpen(String),

    #[error("mount failed: {0}")]
    MountFailed(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BuildError {
    /// Creates a new manifest validation error
    pub fn manifest_invalid(msg: impl Into<String>) -> Self {
        Self::ManifestInvalid(msg.into())
    }

    /// Creates a new unknown-module error
    pub fn module_unknown(msg: impl Into<String>) -> Self {
        Self::ModuleUnknown(msg.into())
    }

    /// Creates a new cycle-detected error
    pub fn cycle_detected(msg: impl Into<String>) -> Self {
        Self::CycleDetected(msg.into())
    }

    /// Creates a new unresolved-source error
    pub fn source_unresolved(msg: impl Into<String>) -> Self {
        Self::SourceUnresolved(msg.into())
    }

    /// Creates a new source-fetch error
    pub fn source_fetch(msg: impl Into<String>) -> Self {
        Self::SourceFetch(msg.into())
    }

    /// Creates a new source-checksum error
    pub fn source_checksum(msg: impl Into<String>) -> Self {
        Self::SourceChecksum(msg.into())
    }

    /// Creates a new store I/O error
    pub fn store_io(msg: impl Into<String>) -> Self {
        Self::StoreIo(msg.into())
    }

    /// Creates a new sandbox setup error
    pub fn sandbox_setup(msg: impl Into<String>) -> Self {
        Self::SandboxSetup(msg.into())
    }

    /// Creates a new host-service protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::HostServiceProtocol(msg.into())
    }

    /// Creates a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// The stable wire name of this error kind.
    ///
    /// These strings appear in the terminal result record and never change
    /// across releases; callers branch on them.
    pub fn kind(&self) -> &'static str {
        match self {
            BuildError::ManifestInvalid(_) => "manifest-invalid",
            BuildError::ModuleUnknown(_) => "module-unknown",
            BuildError::CycleDetected(_) => "cycle-detected",
            BuildError::SourceUnresolved(_) => "source-unresolved",
            BuildError::SourceFetch(_) => "source-fetch",
            BuildError::SourceChecksum(_) => "source-checksum",
            BuildError::SourceAuth(_) => "source-auth",
            BuildError::StoreBusy(_) => "store-busy",
            BuildError::StoreIo(_) => "store-io",
            BuildError::StoreCorrupt(_) => "store-corrupt",
            BuildError::SandboxSetup(_) => "sandbox-setup",
            BuildError::ModuleExit { .. } => "module-exit",
            BuildError::ModuleTimeout(_) => "module-timeout",
            BuildError::HostServiceProtocol(_) => "host-service-protocol",
            BuildError::DeviceOpen(_) => "device-open",
            BuildError::MountFailed(_) => "mount-failed",
            BuildError::Cancelled(_) => "cancelled",
            BuildError::Internal(_) => "internal",
        }
    }

    /// Whether this error names a condition the manifest author caused.
    ///
    /// Manifest-class failures abort before execution and map to a distinct
    /// process exit code so scripted callers can tell "fix the manifest"
    /// apart from "the build broke".
    pub fn is_manifest_error(&self) -> bool {
        matches!(
            self,
            BuildError::ManifestInvalid(_)
                | BuildError::ModuleUnknown(_)
                | BuildError::CycleDetected(_)
                | BuildError::SourceUnresolved(_)
        )
    }

    /// Whether the owning helper may retry the operation that produced this.
    ///
    /// Only transient fetch failures qualify; exhausted retries surface as
    /// the same kind and are then fatal.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BuildError::SourceFetch(_))
    }
}

impl From<std::io::Error> for BuildError {
    fn from(err: std::io::Error) -> Self {
        BuildError::StoreIo(err.to_string())
    }
}

impl From<serde_json::Error> for BuildError {
    fn from(err: serde_json::Error) -> Self {
        BuildError::ManifestInvalid(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings_are_stable() {
        assert_eq!(BuildError::manifest_invalid("x").kind(), "manifest-invalid");
        assert_eq!(BuildError::module_unknown("x").kind(), "module-unknown");
        assert_eq!(BuildError::cycle_detected("x").kind(), "cycle-detected");
        assert_eq!(BuildError::source_fetch("x").kind(), "source-fetch");
        assert_eq!(BuildError::source_checksum("x").kind(), "source-checksum");
        assert_eq!(BuildError::StoreBusy("x".into()).kind(), "store-busy");
        assert_eq!(BuildError::StoreCorrupt("x".into()).kind(), "store-corrupt");
        assert_eq!(
            BuildError::ModuleExit {
                module: "org.imageforge.noop".into(),
                code: 1,
                message: "boom".into()
            }
            .kind(),
            "module-exit"
        );
        assert_eq!(BuildError::Cancelled("x".into()).kind(), "cancelled");
    }

    #[test]
    fn test_manifest_error_classification() {
        assert!(BuildError::manifest_invalid("bad version").is_manifest_error());
        assert!(BuildError::module_unknown("org.x.y").is_manifest_error());
        assert!(BuildError::cycle_detected("a -> b -> a").is_manifest_error());
        assert!(BuildError::source_unresolved("sha256:ab").is_manifest_error());
        assert!(!BuildError::source_fetch("timeout").is_manifest_error());
        assert!(!BuildError::store_io("disk full").is_manifest_error());
    }

    #[test]
    fn test_only_fetch_failures_are_recoverable() {
        assert!(BuildError::source_fetch("connection reset").is_recoverable());
        assert!(!BuildError::source_checksum("mismatch").is_recoverable());
        assert!(!BuildError::SourceAuth("no token".into()).is_recoverable());
        assert!(!BuildError::ModuleTimeout("300s".into()).is_recoverable());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: BuildError = io.into();
        assert_eq!(err.kind(), "store-io");
    }

    #[test]
    fn test_module_exit_display_names_module_and_code() {
        let err = BuildError::ModuleExit {
            module: "org.imageforge.grub2".into(),
            code: 2,
            message: "no such device".into(),
        };
        let text = err.to_string();
        assert!(text.contains("org.imageforge.grub2"));
        assert!(text.contains('2'));
    }
}
