// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Stage Runtime
//!
//! Everything that happens between "this stage must run" and "its tree is
//! committed": building the ephemeral container ([`sandbox`]) and
//! orchestrating inputs, devices, mounts, the module invocation, and the
//! reversed teardown ([`module_runner`]).

pub mod module_runner;
pub mod sandbox;

pub use module_runner::DefaultStageRunner;
pub use sandbox::{BuildRoot, KernelSandboxBackend, SandboxBackend, SandboxSpec};
