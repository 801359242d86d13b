// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Bootstrap Logger
//!
//! Diagnostics for the window before the tracing subscriber exists: CLI
//! validation, configuration loading, platform probing, and helper-process
//! failures. [`StderrLogger`] writes straight to standard error — there is
//! no subscriber to route through yet, and a failure in this window must
//! never be swallowed. Verbosity follows the same `-v` stacking the
//! subscriber uses once it takes over.

/// Severity of a bring-up message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

/// Bootstrap logging abstraction.
///
/// Trait-based so bring-up logic stays testable with a capturing
/// implementation; the production implementation is [`StderrLogger`].
pub trait BootstrapLogger: Send + Sync {
    /// Fatal errors during bring-up that will terminate the process.
    fn error(&self, message: &str);

    /// Non-fatal issues (missing optional config, degraded defaults).
    fn warn(&self, message: &str);

    /// Normal bring-up progress messages.
    fn info(&self, message: &str);

    /// Detailed diagnostics (platform facts, resolved paths).
    fn debug(&self, message: &str);
}

/// Writes bring-up diagnostics to standard error.
///
/// Errors and warnings always print; info needs `-v`, debug `-vv`, the
/// same thresholds `init_tracing` applies afterwards, so turning up
/// verbosity affects both phases consistently.
pub struct StderrLogger {
    verbosity: u8,
}

impl StderrLogger {
    pub fn new(verbosity: u8) -> Self {
        Self { verbosity }
    }

    fn enabled(&self, level: LogLevel) -> bool {
        match level {
            LogLevel::Error | LogLevel::Warn => true,
            LogLevel::Info => self.verbosity >= 1,
            LogLevel::Debug => self.verbosity >= 2,
        }
    }

    fn emit(&self, level: LogLevel, message: &str) {
        if !self.enabled(level) {
            return;
        }
        let tag = match level {
            LogLevel::Error => "error: ",
            LogLevel::Warn => "warning: ",
            LogLevel::Info => "",
            LogLevel::Debug => "debug: ",
        };
        eprintln!("imageforge: {tag}{message}");
    }
}

impl BootstrapLogger for StderrLogger {
    fn error(&self, message: &str) {
        self.emit(LogLevel::Error, message);
    }

    fn warn(&self, message: &str) {
        self.emit(LogLevel::Warn, message);
    }

    fn info(&self, message: &str) {
        self.emit(LogLevel::Info, message);
    }

    fn debug(&self, message: &str) {
        self.emit(LogLevel::Debug, message);
    }
}

/// Captures messages in memory for assertions.
#[cfg(test)]
pub struct CapturingLogger {
    captured: std::sync::Mutex<Vec<(LogLevel, String)>>,
}

#[cfg(test)]
impl CapturingLogger {
    pub fn new() -> Self {
        Self {
            captured: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn captured(&self) -> Vec<(LogLevel, String)> {
        self.captured.lock().unwrap().clone()
    }

    fn push(&self, level: LogLevel, message: &str) {
        self.captured.lock().unwrap().push((level, message.to_owned()));
    }
}

#[cfg(test)]
impl BootstrapLogger for CapturingLogger {
    fn error(&self, message: &str) {
        self.push(LogLevel::Error, message);
    }

    fn warn(&self, message: &str) {
        self.push(LogLevel::Warn, message);
    }

    fn info(&self, message: &str) {
        self.push(LogLevel::Info, message);
    }

    fn debug(&self, message: &str) {
        self.push(LogLevel::Debug, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_and_warnings_always_enabled() {
        let quiet = StderrLogger::new(0);
        assert!(quiet.enabled(LogLevel::Error));
        assert!(quiet.enabled(LogLevel::Warn));
        assert!(!quiet.enabled(LogLevel::Info));
        assert!(!quiet.enabled(LogLevel::Debug));
    }

    #[test]
    fn test_verbosity_thresholds_match_the_subscriber() {
        let verbose = StderrLogger::new(1);
        assert!(verbose.enabled(LogLevel::Info));
        assert!(!verbose.enabled(LogLevel::Debug));

        let very_verbose = StderrLogger::new(2);
        assert!(very_verbose.enabled(LogLevel::Debug));
    }

    #[test]
    fn test_trait_object_dispatch_records_in_order() {
        let capturing = CapturingLogger::new();
        let logger: &dyn BootstrapLogger = &capturing;
        logger.error("store unreadable");
        logger.debug("store root /tmp/store");

        let captured = capturing.captured();
        assert_eq!(captured.len(), 2);
        assert_eq!(captured[0], (LogLevel::Error, "store unreadable".to_owned()));
        assert_eq!(captured[1].0, LogLevel::Debug);
    }
}
