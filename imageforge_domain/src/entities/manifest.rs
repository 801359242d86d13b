// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Manifest Model (version 2)
//!
//! Serde model of the declarative JSON manifest. The manifest is a tuple of
//! `sources` (source kind → content checksum → descriptor) and an ordered
//! list of `pipelines`, each an ordered list of `stages`.
//!
//! ## Typing discipline
//!
//! The engine dispatches on three kind fields — input origin, device kind,
//! mount kind — so those are closed sum types here and an unknown kind is a
//! parse error. Module-specific `options` stay opaque [`serde_json::Value`]
//! and travel to the module verbatim; the engine never interprets them
//! beyond canonicalizing for the fingerprint.
//!
//! ## Example
//!
//! ```json
//! {
//!   "version": "2",
//!   "sources": {
//!     "org.imageforge.download": {
//!       "sha256:8d37…": { "url": "https://mirror.example/vmlinuz" }
//!     }
//!   },
//!   "pipelines": [
//!     { "name": "build", "runner": "org.imageforge.linux", "stages": [ … ] },
//!     {
//!       "name": "image",
//!       "build": "name:build",
//!       "stages": [
//!         {
//!           "type": "org.imageforge.kernel-install",
//!           "options": { "release": "6.9" },
//!           "inputs": {
//!             "kernel": {
//!               "type": "org.imageforge.files",
//!               "origin": "org.imageforge.source",
//!               "kind": "org.imageforge.download",
//!               "references": ["sha256:8d37…"]
//!             }
//!           }
//!         }
//!       ]
//!     }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::build_error::BuildError;
use crate::value_objects::checksum::Checksum;
use crate::value_objects::object_id::ObjectId;

/// The manifest schema version this engine understands.
pub const MANIFEST_VERSION: &str = "2";

/// Top-level manifest document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Schema version; must be `"2"`.
    pub version: String,

    /// Source kind → content checksum → descriptor.
    #[serde(default)]
    pub sources: BTreeMap<String, BTreeMap<Checksum, SourceDescriptor>>,

    /// Ordered pipeline list; order is the author's, execution order is the
    /// resolver's topological order.
    #[serde(default)]
    pub pipelines: Vec<Pipeline>,
}

impl Manifest {
    /// Parses a manifest from JSON text and checks the schema version.
    ///
    /// Structural validation beyond the serde model (reference resolution,
    /// cycles, module registration) happens in the resolver.
    ///
    /// # Errors
    ///
    /// `BuildError::ManifestInvalid` on malformed JSON or an unsupported
    /// version.
    pub fn from_json(text: &str) -> Result<Self, BuildError> {
        let manifest: Manifest = serde_json::from_str(text)
            .map_err(|e| BuildError::manifest_invalid(format!("manifest parse error: {e}")))?;
        manifest.check_version()?;
        Ok(manifest)
    }

    /// Parses a manifest from an already-deserialized JSON value.
    pub fn from_value(value: Value) -> Result<Self, BuildError> {
        let manifest: Manifest = serde_json::from_value(value)
            .map_err(|e| BuildError::manifest_invalid(format!("manifest parse error: {e}")))?;
        manifest.check_version()?;
        Ok(manifest)
    }

    fn check_version(&self) -> Result<(), BuildError> {
        if self.version != MANIFEST_VERSION {
            return Err(BuildError::manifest_invalid(format!(
                "unsupported manifest version {:?} (expected {:?})",
                self.version, MANIFEST_VERSION
            )));
        }
        Ok(())
    }

    /// Looks up a pipeline by name; empty names never match.
    pub fn pipeline_by_name(&self, name: &str) -> Option<&Pipeline> {
        if name.is_empty() {
            return None;
        }
        self.pipelines.iter().find(|p| p.name == name)
    }
}

/// Descriptor of one fetchable source blob.
///
/// `url` and `secrets` are the fields the engine's own source services
/// understand; everything else is preserved for the owning helper.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SourceDescriptor {
    /// Primary location; URL-kind helpers may derive mirrors from it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Named credential set resolved from the helper's startup environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<SecretsSpec>,

    /// Kind-specific fields passed through to the helper untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Reference to a credential set by well-known name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretsSpec {
    pub name: String,
}

/// One pipeline: an ordered list of stages producing a single tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Optional human name; empty means anonymous. Non-empty names must be
    /// unique within a manifest (the resolver enforces this).
    #[serde(default)]
    pub name: String,

    /// The pipeline whose output is this pipeline's build environment.
    /// Absent means stages run against a controlled view of the host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<PipelineRef>,

    /// OS identity of the build root, e.g. `org.imageforge.linux`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner: Option<String>,

    /// Ordered stages; may be empty (the pipeline then produces an empty
    /// tree with a stable id).
    #[serde(default)]
    pub stages: Vec<Stage>,
}

/// Reference to another pipeline, by name (`name:<pipeline-name>`) or by
/// fingerprint id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PipelineRef {
    Name(String),
    Id(ObjectId),
}

impl PipelineRef {
    pub fn from_string(s: &str) -> Result<Self, BuildError> {
        if let Some(name) = s.strip_prefix("name:") {
            if name.is_empty() {
                return Err(BuildError::manifest_invalid(
                    "pipeline reference has an empty name",
                ));
            }
            return Ok(PipelineRef::Name(name.to_owned()));
        }
        let id = ObjectId::from_string(s).map_err(|_| {
            BuildError::manifest_invalid(format!(
                "pipeline reference must be `name:<name>` or an object id, got {:?}",
                s
            ))
        })?;
        Ok(PipelineRef::Id(id))
    }
}

impl fmt::Display for PipelineRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineRef::Name(name) => write!(f, "name:{name}"),
            PipelineRef::Id(id) => write!(f, "{id}"),
        }
    }
}

impl TryFrom<String> for PipelineRef {
    type Error = BuildError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_string(&s)
    }
}

impl From<PipelineRef> for String {
    fn from(r: PipelineRef) -> Self {
        r.to_string()
    }
}

/// One module invocation mutating the pipeline's tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Module name, e.g. `org.imageforge.rpm`. Resolved against the module
    /// search path; unregistered modules are rejected before execution.
    #[serde(rename = "type")]
    pub module: String,

    /// Module-specific options, opaque to the engine.
    #[serde(default)]
    pub options: Value,

    /// Input name → origin descriptor.
    #[serde(default)]
    pub inputs: BTreeMap<String, InputSpec>,

    /// Device name → device spec. Parents must name other keys of this map.
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceSpec>,

    /// Ordered mount list; later entries may nest inside earlier ones and
    /// unwind in reverse.
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
}

/// Input origin descriptor: where the input's content comes from plus the
/// semantic type the preparing service materializes it as.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    /// Semantic content type, e.g. `org.imageforge.files` or
    /// `org.imageforge.tree`. The input service picks the preparation
    /// strategy from this.
    #[serde(rename = "type")]
    pub content_type: String,

    /// The provenance variant.
    #[serde(flatten)]
    pub origin: Origin,
}

/// Provenance of an input: content-addressed source blobs, or another
/// pipeline's committed tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "origin")]
pub enum Origin {
    /// A set of blobs from one source kind.
    #[serde(rename = "org.imageforge.source")]
    Source {
        /// Source kind; must exist in the manifest's `sources` map.
        kind: String,
        /// Content checksums; each must be declared under the kind.
        references: Vec<Checksum>,
    },

    /// Another pipeline's output tree.
    #[serde(rename = "org.imageforge.pipeline")]
    Pipeline {
        /// The referenced pipeline.
        reference: PipelineRef,
        /// Optional path inside the referenced tree.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subpath: Option<String>,
    },
}

/// Block-device kinds the engine can open via host services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// File-backed loop device.
    #[serde(rename = "org.imageforge.loopback")]
    Loopback,
    /// LVM2 logical volume activation.
    #[serde(rename = "org.imageforge.lvm2.lv")]
    Lvm2LogicalVolume,
    /// LUKS2 encrypted volume.
    #[serde(rename = "org.imageforge.luks2")]
    Luks2,
}

impl DeviceKind {
    /// Canonical kind string as written in manifests.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Loopback => "org.imageforge.loopback",
            DeviceKind::Lvm2LogicalVolume => "org.imageforge.lvm2.lv",
            DeviceKind::Luks2 => "org.imageforge.luks2",
        }
    }
}

/// One device a stage declares.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSpec {
    #[serde(rename = "type")]
    pub kind: DeviceKind,

    /// Name of the parent device within the same stage, if any. The runner
    /// opens parents first and closes them last.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    /// Kind-specific options passed to the device service verbatim.
    #[serde(default)]
    pub options: Value,
}

/// Mount kinds the engine can stage inside the build root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MountKind {
    #[serde(rename = "org.imageforge.ext4")]
    Ext4,
    #[serde(rename = "org.imageforge.xfs")]
    Xfs,
    #[serde(rename = "org.imageforge.btrfs")]
    Btrfs,
    #[serde(rename = "org.imageforge.fat")]
    Fat,
    /// First-class bind mount; `source` is a path, not a device.
    #[serde(rename = "org.imageforge.bind")]
    Bind,
}

impl MountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MountKind::Ext4 => "org.imageforge.ext4",
            MountKind::Xfs => "org.imageforge.xfs",
            MountKind::Btrfs => "org.imageforge.btrfs",
            MountKind::Fat => "org.imageforge.fat",
            MountKind::Bind => "org.imageforge.bind",
        }
    }

    /// The filesystem type handed to mount(8), when one applies.
    pub fn fstype(&self) -> Option<&'static str> {
        match self {
            MountKind::Ext4 => Some("ext4"),
            MountKind::Xfs => Some("xfs"),
            MountKind::Btrfs => Some("btrfs"),
            MountKind::Fat => Some("vfat"),
            MountKind::Bind => None,
        }
    }
}

/// One mount a stage declares.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountSpec {
    /// Mount name; appears under the sandbox's mounts root.
    pub name: String,

    #[serde(rename = "type")]
    pub kind: MountKind,

    /// The device (by stage-local name) carrying the filesystem; for bind
    /// mounts, the source path instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Target path relative to the stage tree.
    pub target: String,

    /// Kind-specific options passed to the mount service verbatim.
    #[serde(default)]
    pub options: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_manifest() -> &'static str {
        r#"{
            "version": "2",
            "pipelines": [
                { "name": "p", "stages": [] }
            ]
        }"#
    }

    #[test]
    fn test_parses_minimal_manifest() {
        let manifest = Manifest::from_json(minimal_manifest()).unwrap();
        assert_eq!(manifest.pipelines.len(), 1);
        assert_eq!(manifest.pipelines[0].name, "p");
        assert!(manifest.pipelines[0].stages.is_empty());
        assert!(manifest.sources.is_empty());
    }

    #[test]
    fn test_rejects_unknown_version() {
        let text = r#"{ "version": "1", "pipelines": [] }"#;
        let err = Manifest::from_json(text).unwrap_err();
        assert_eq!(err.kind(), "manifest-invalid");
    }

    #[test]
    fn test_parses_sources_and_stage_with_input() {
        let text = r#"{
            "version": "2",
            "sources": {
                "org.imageforge.download": {
                    "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa":
                        { "url": "https://mirror.example/blob" }
                }
            },
            "pipelines": [
                {
                    "name": "image",
                    "runner": "org.imageforge.linux",
                    "stages": [
                        {
                            "type": "org.imageforge.copy",
                            "options": { "paths": ["/a"] },
                            "inputs": {
                                "files": {
                                    "type": "org.imageforge.files",
                                    "origin": "org.imageforge.source",
                                    "kind": "org.imageforge.download",
                                    "references": ["sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"]
                                }
                            }
                        }
                    ]
                }
            ]
        }"#;
        let manifest = Manifest::from_json(text).unwrap();
        let stage = &manifest.pipelines[0].stages[0];
        assert_eq!(stage.module, "org.imageforge.copy");
        let input = stage.inputs.get("files").unwrap();
        assert_eq!(input.content_type, "org.imageforge.files");
        match &input.origin {
            Origin::Source { kind, references } => {
                assert_eq!(kind, "org.imageforge.download");
                assert_eq!(references.len(), 1);
            }
            other => panic!("expected source origin, got {other:?}"),
        }
    }

    #[test]
    fn test_parses_pipeline_origin_with_subpath() {
        let text = r#"{
            "type": "org.imageforge.tree",
            "origin": "org.imageforge.pipeline",
            "reference": "name:build",
            "subpath": "boot"
        }"#;
        let input: InputSpec = serde_json::from_str(text).unwrap();
        match input.origin {
            Origin::Pipeline { reference, subpath } => {
                assert_eq!(reference, PipelineRef::Name("build".into()));
                assert_eq!(subpath.as_deref(), Some("boot"));
            }
            other => panic!("expected pipeline origin, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_unknown_origin_kind() {
        let text = r#"{
            "type": "org.imageforge.files",
            "origin": "org.example.teleport",
            "references": []
        }"#;
        assert!(serde_json::from_str::<InputSpec>(text).is_err());
    }

    #[test]
    fn test_rejects_unknown_device_kind() {
        let text = r#"{ "type": "org.example.ramdisk", "options": {} }"#;
        assert!(serde_json::from_str::<DeviceSpec>(text).is_err());
    }

    #[test]
    fn test_device_and_mount_specs() {
        let text = r#"{
            "type": "org.imageforge.noop",
            "devices": {
                "disk": { "type": "org.imageforge.loopback", "options": { "size": 1024 } },
                "root": { "type": "org.imageforge.luks2", "parent": "disk", "options": {} }
            },
            "mounts": [
                { "name": "root", "type": "org.imageforge.ext4", "source": "root", "target": "/" },
                { "name": "boot", "type": "org.imageforge.bind", "source": "/srv/boot", "target": "/boot" }
            ]
        }"#;
        let stage: Stage = serde_json::from_str(text).unwrap();
        assert_eq!(stage.devices["root"].parent.as_deref(), Some("disk"));
        assert_eq!(stage.mounts[0].kind, MountKind::Ext4);
        assert_eq!(stage.mounts[0].kind.fstype(), Some("ext4"));
        assert_eq!(stage.mounts[1].kind, MountKind::Bind);
        assert_eq!(stage.mounts[1].kind.fstype(), None);
    }

    #[test]
    fn test_pipeline_ref_forms() {
        assert_eq!(
            PipelineRef::from_string("name:build").unwrap(),
            PipelineRef::Name("build".into())
        );
        let hex = "ab".repeat(32);
        assert!(matches!(
            PipelineRef::from_string(&hex).unwrap(),
            PipelineRef::Id(_)
        ));
        assert!(PipelineRef::from_string("name:").is_err());
        assert!(PipelineRef::from_string("build").is_err());
    }

    #[test]
    fn test_pipeline_by_name_ignores_empty() {
        let manifest = Manifest::from_json(minimal_manifest()).unwrap();
        assert!(manifest.pipeline_by_name("p").is_some());
        assert!(manifest.pipeline_by_name("").is_none());
        assert!(manifest.pipeline_by_name("q").is_none());
    }
}
