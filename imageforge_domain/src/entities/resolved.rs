// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Resolved Manifest
//!
//! Output of the resolver: pipelines in topological order, every reference
//! turned into an [`ObjectId`], every stage carrying its fingerprint. This
//! is the execution plan — the executor walks it front to back and never
//! consults the raw manifest again.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::entities::manifest::{DeviceSpec, MountSpec};
use crate::value_objects::checksum::Checksum;
use crate::value_objects::object_id::ObjectId;

/// Fully resolved, topologically ordered execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedManifest {
    /// Pipelines ordered so every dependency precedes its dependents.
    pub pipelines: Vec<ResolvedPipeline>,

    /// Source kind → checksums referenced anywhere in the plan, with their
    /// descriptors re-serialized for the owning helpers.
    pub sources: BTreeMap<String, BTreeMap<Checksum, Value>>,
}

impl ResolvedManifest {
    /// Looks up a resolved pipeline by its output id.
    pub fn pipeline_by_id(&self, id: &ObjectId) -> Option<&ResolvedPipeline> {
        self.pipelines.iter().find(|p| &p.id == id)
    }

    /// Looks up a resolved pipeline by non-empty name.
    pub fn pipeline_by_name(&self, name: &str) -> Option<&ResolvedPipeline> {
        if name.is_empty() {
            return None;
        }
        self.pipelines.iter().find(|p| p.name == name)
    }
}

/// One pipeline with all references resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedPipeline {
    /// Author-given name; may be empty.
    pub name: String,

    /// Output identity: the final stage's id, or the pipeline's own
    /// fingerprint when it has no stages.
    pub id: ObjectId,

    /// Build-environment tree id; `None` means the host view.
    pub build: Option<ObjectId>,

    /// OS identity of the build root.
    pub runner: Option<String>,

    /// Stages in execution order, each with its fingerprint.
    pub stages: Vec<ResolvedStage>,
}

/// One stage with computed id and resolved inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedStage {
    /// Fingerprint identity; also the object-store key for this stage's
    /// committed tree.
    pub id: ObjectId,

    /// Module name (`type` in the manifest).
    pub module: String,

    /// Opaque module options, canonicalized into the fingerprint but passed
    /// to the module exactly as written.
    pub options: Value,

    /// Resolved inputs in name order.
    pub inputs: Vec<StageInput>,

    /// Devices in parent-before-child order.
    pub devices: Vec<(String, DeviceSpec)>,

    /// Mounts in declaration order.
    pub mounts: Vec<MountSpec>,
}

/// One resolved input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageInput {
    /// Input name; appears under the sandbox inputs root.
    pub name: String,

    /// Semantic content type (`org.imageforge.files`, `org.imageforge.tree`).
    pub content_type: String,

    /// Resolved provenance.
    pub origin: ResolvedOrigin,
}

/// Provenance with every reference resolved to concrete identities.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "origin")]
pub enum ResolvedOrigin {
    #[serde(rename = "org.imageforge.source")]
    Source {
        kind: String,
        references: Vec<Checksum>,
    },
    #[serde(rename = "org.imageforge.pipeline")]
    Pipeline {
        id: ObjectId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subpath: Option<String>,
    },
}
