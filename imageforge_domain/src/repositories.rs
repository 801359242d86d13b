// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Infrastructure Ports
//!
//! Async traits the application layer depends on and the infrastructure
//! layer implements: the object store, the source store, and the per-stage
//! runner. Keeping the contracts here lets the pipeline executor be tested
//! against stubs, with the filesystem- and namespace-heavy implementations
//! living in the main crate.

pub mod object_store;
pub mod source_store;
pub mod stage_runner;

pub use object_store::{ObjectStore, Workspace};
pub use source_store::SourceStore;
pub use stage_runner::{StageRun, StageRunner};
