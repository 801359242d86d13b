// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

// Production code safety enforced via CI and `make lint-strict`
// (lib/bins checked separately from tests - tests may use unwrap/expect)

//! # Imageforge Domain
//!
//! Pure domain layer for the imageforge build engine: the manifest model, the
//! fingerprint function that assigns every pipeline and stage its
//! content-derived identity, manifest resolution and topological ordering,
//! the build-event records that flow over the result channel, and the error
//! taxonomy shared by every layer.
//!
//! ## Architecture Overview
//!
//! The domain layer has no I/O and no runtime dependency. Resolution and
//! fingerprinting are fully deterministic: given the same manifest bytes,
//! they produce the same ordered plan and the same ids, on every host, every
//! time. The engine's caching and reproducibility guarantees rest on that
//! property.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Manifest (JSON, v2)                     │
//! └───────────────────────────────┬─────────────────────────────┘
//!                                 │  parse + validate
//! ┌───────────────────────────────┴─────────────────────────────┐
//! │   Resolver: reference resolution, cycle rejection,          │
//! │   topological ordering, bottom-up fingerprinting            │
//! └───────────────────────────────┬─────────────────────────────┘
//!                                 │
//! ┌───────────────────────────────┴─────────────────────────────┐
//! │   ResolvedManifest: ordered pipelines, each stage carrying  │
//! │   its ObjectId, resolved inputs, devices, and mounts        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Concepts
//!
//! ### Fingerprints
//! Every pipeline and stage is identified by a SHA-256 hash over a canonical
//! serialization of its semantic content: module name, options, input ids,
//! build-environment id, and declared devices and mounts. Two structurally
//! equal stages always share an id; any semantic change produces a new one.
//!
//! ### Origins
//! Stage inputs name their provenance explicitly: either a set of
//! content-addressed source blobs, or another pipeline's committed tree.
//! The engine dispatches on the origin kind; module-specific options stay
//! opaque JSON and are passed through verbatim.
//!
//! ### Build events
//! Progress, log, metadata, and terminal result records are plain serde
//! types here; infrastructure decides how they are rendered (JSON-seq
//! stream or human log lines).

pub mod entities;
pub mod error;
pub mod events;
pub mod repositories;
pub mod services;
pub mod value_objects;

// Re-export the types the rest of the workspace reaches for constantly.
pub use entities::manifest::{
    DeviceKind, DeviceSpec, Manifest, MountKind, MountSpec, Origin, Pipeline, PipelineRef,
    SourceDescriptor, Stage,
};
pub use entities::resolved::{ResolvedManifest, ResolvedPipeline, ResolvedStage, StageInput};
pub use error::build_error::{BuildError, BuildResult};
pub use events::build_event::{
    BuildEvent, EventOrigin, Monitor, ProgressCounter, ResultRecord, StageOutcome,
};
pub use services::fingerprint::Fingerprint;
pub use services::resolver::{ModuleRegistry, Resolver};
pub use value_objects::checksum::{Checksum, ChecksumAlgorithm};
pub use value_objects::object_id::ObjectId;
