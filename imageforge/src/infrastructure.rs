// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Infrastructure Layer
//!
//! Concrete implementations behind the domain ports: the filesystem object
//! store, the source cache, the framed host-service protocol and the
//! services speaking it, the sandbox and module runner, the monitoring
//! sinks, and engine configuration.

pub mod config;
pub mod ipc;
pub mod monitoring;
pub mod runtime;
pub mod services;
pub mod stores;
