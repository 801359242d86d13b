// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Monitoring Sinks
//!
//! Implementations of the domain [`Monitor`] port: a JSON-seq stream for
//! machine consumers ([`jsonseq`]) and tracing-backed human output
//! ([`log`]). Progress-bar style rendering is deliberately out of scope;
//! terminals get structured log lines.
//!
//! [`Monitor`]: imageforge_domain::Monitor

pub mod jsonseq;
pub mod log;

pub use jsonseq::JsonSeqMonitor;
pub use log::LogMonitor;
