// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Domain Entities
//!
//! The manifest as written by the user ([`manifest`]) and the manifest as
//! executed by the engine ([`resolved`]). Resolution is the only path from
//! one to the other; nothing downstream of the resolver ever sees an
//! unvalidated manifest.

pub mod manifest;
pub mod resolved;

pub use manifest::{
    DeviceKind, DeviceSpec, InputSpec, Manifest, MountKind, MountSpec, Origin, Pipeline,
    PipelineRef, SourceDescriptor, Stage,
};
pub use resolved::{
    ResolvedManifest, ResolvedOrigin, ResolvedPipeline, ResolvedStage, StageInput,
};
