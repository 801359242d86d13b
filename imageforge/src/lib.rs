// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

// Production code safety enforced via CI and `make lint-strict`
// (lib/bins checked separately from tests - tests may use unwrap/expect)

//! # Imageforge
//!
//! A pipeline-based builder for operating-system artifacts: disk images,
//! OSTree commits, container archives, installer ISOs. Imageforge consumes
//! a declarative JSON manifest describing a DAG of pipelines, executes each
//! pipeline's stages inside isolated build roots, stores every produced
//! tree in a content-addressed object store, and exports named pipelines
//! into user-supplied output directories.
//!
//! ## Architecture Overview
//!
//! The workspace follows Clean Architecture and Domain-Driven Design
//! principles, split across three crates:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              imageforge_bootstrap                           │
//! │  (CLI parsing, logging bring-up, signals, platform)         │
//! └─────────────────────────────────────────────────────────────┘
//!                                │
//! ┌─────────────────────────────────────────────────────────────┐
//! │              imageforge  (this crate)                       │
//! │  application: pipeline executor, build/inspect use cases    │
//! │  infrastructure: object store, source cache, host services, │
//! │                  sandbox, module runner, monitoring sinks   │
//! └─────────────────────────────────────────────────────────────┘
//!                                │
//! ┌─────────────────────────────────────────────────────────────┐
//! │              imageforge_domain                              │
//! │  (manifest model, fingerprints, resolver, events, errors)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Concepts
//!
//! ### Pipelines and stages
//! A pipeline is an ordered list of stages producing one filesystem tree.
//! Each stage invokes one external module inside a sandbox; the module
//! mutates the stage's tree and nothing else. Stage identity is a
//! fingerprint over everything that can influence the result, so equal ids
//! mean equal trees and the object store doubles as a build cache.
//!
//! ### Host services
//! Resources a stage borrows from the host — loop devices, activated LVM
//! volumes, opened LUKS containers, staged mounts, prepared inputs — are
//! each owned by a dedicated helper process. Helpers speak a
//! length-prefixed JSON protocol over a socket pair, are started in
//! dependency order, and are always stopped in exact reverse order, on
//! success and on failure alike.
//!
//! ### Result channel
//! Progress, captured module output, module metadata, and the terminal
//! result flow to the caller as structured records: JSON-seq on pipes,
//! human log lines on terminals.
//!
//! ## Deployment note
//!
//! Writing security labels the host policy does not know requires the
//! label-administration capability inside the sandbox. Running the engine
//! itself inside a container requires launching that outer container with
//! a domain retaining the capability; see README for the supported
//! configurations.

pub mod application;
pub mod infrastructure;
pub mod presentation;

// Tests are organized as:
// - Unit tests: #[cfg(test)] modules within each source file
// - Integration tests: separate files in tests/ directory

// Re-export domain types for convenient access
pub use imageforge_domain::{
    BuildError, BuildResult, Checksum, Fingerprint, Manifest, ModuleRegistry, ObjectId,
    ResolvedManifest, Resolver,
};
