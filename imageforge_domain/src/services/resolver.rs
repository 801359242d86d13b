// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Manifest Resolver
//!
//! Turns a parsed [`Manifest`] into a [`ResolvedManifest`]: validates every
//! reference, rejects cycles, orders pipelines topologically, and computes
//! every fingerprint bottom-up. Resolution is pure — no I/O, no clock, no
//! randomness — so the same manifest resolves to the same plan on every
//! host.
//!
//! ## Validation performed here
//!
//! - Non-empty pipeline names are unique.
//! - Every stage module and every source kind is registered.
//! - Every source reference names a checksum declared in `sources`.
//! - Every pipeline reference (build environment or input origin) resolves.
//! - The pipeline graph and each stage's device-parent graph are acyclic.
//! - Mounts name devices that exist (bind mounts excepted).
//!
//! Failures map onto the engine's error kinds: `manifest-invalid`,
//! `module-unknown`, `cycle-detected`, `source-unresolved`. All are fatal
//! before execution.

use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::entities::manifest::{
    Manifest, MountKind, Origin, Pipeline, PipelineRef, Stage,
};
use crate::entities::resolved::{
    ResolvedManifest, ResolvedOrigin, ResolvedPipeline, ResolvedStage, StageInput,
};
use crate::error::build_error::{BuildError, BuildResult};
use crate::services::fingerprint::Fingerprint;
use crate::value_objects::checksum::Checksum;
use crate::value_objects::object_id::ObjectId;

/// The modules the engine may invoke: stage modules resolved from the
/// module search path and source kinds with a registered helper.
///
/// The infrastructure layer populates this by scanning the search path at
/// startup; tests construct it directly.
#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    stages: BTreeSet<String>,
    sources: BTreeSet<String>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a stage module by name.
    pub fn register_stage(&mut self, name: impl Into<String>) {
        self.stages.insert(name.into());
    }

    /// Registers a source kind with an available helper.
    pub fn register_source(&mut self, kind: impl Into<String>) {
        self.sources.insert(kind.into());
    }

    /// Builder-style stage registration, mostly for tests.
    pub fn with_stage(mut self, name: impl Into<String>) -> Self {
        self.register_stage(name);
        self
    }

    /// Builder-style source-kind registration, mostly for tests.
    pub fn with_source(mut self, kind: impl Into<String>) -> Self {
        self.register_source(kind);
        self
    }

    pub fn contains_stage(&self, name: &str) -> bool {
        self.stages.contains(name)
    }

    pub fn contains_source(&self, kind: &str) -> bool {
        self.sources.contains(kind)
    }

    /// Registered stage modules, sorted.
    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(String::as_str)
    }
}

/// Stateless resolver service.
pub struct Resolver;

impl Resolver {
    /// Resolves a manifest against a module registry.
    ///
    /// # Errors
    ///
    /// - `manifest-invalid` — duplicate names, mounts naming missing
    ///   devices, malformed structure.
    /// - `module-unknown` — a stage module or source kind without a
    ///   registered implementation.
    /// - `cycle-detected` — a cycle in the pipeline graph or in a stage's
    ///   device parents.
    /// - `source-unresolved` — a checksum or pipeline reference that
    ///   resolves to nothing.
    pub fn resolve(
        manifest: &Manifest,
        registry: &ModuleRegistry,
    ) -> BuildResult<ResolvedManifest> {
        Self::check_unique_names(&manifest.pipelines)?;
        let order = Self::topological_order(&manifest.pipelines)?;

        // Ids computed bottom-up; both lookup maps grow as we walk the order.
        let mut ids_by_name: HashMap<String, ObjectId> = HashMap::new();
        let mut known_ids: BTreeSet<ObjectId> = BTreeSet::new();
        let mut resolved: Vec<ResolvedPipeline> = Vec::with_capacity(manifest.pipelines.len());
        let mut used_sources: BTreeMap<String, BTreeSet<Checksum>> = BTreeMap::new();

        for index in order {
            let pipeline = &manifest.pipelines[index];
            let build = match &pipeline.build {
                None => None,
                Some(reference) => Some(Self::resolve_pipeline_ref(
                    reference,
                    &ids_by_name,
                    &known_ids,
                )?),
            };

            let mut stages = Vec::with_capacity(pipeline.stages.len());
            let mut prev_id: Option<ObjectId> = None;
            for stage in &pipeline.stages {
                let resolved_stage = Self::resolve_stage(
                    stage,
                    pipeline,
                    build.as_ref(),
                    prev_id.as_ref(),
                    manifest,
                    registry,
                    &ids_by_name,
                    &known_ids,
                    &mut used_sources,
                )?;
                prev_id = Some(resolved_stage.id.clone());
                stages.push(resolved_stage);
            }

            let id = match prev_id {
                Some(id) => id,
                None => Fingerprint::digest(&json!({
                    "build": build.as_ref().map(ObjectId::to_string),
                    "runner": pipeline.runner,
                    "stages": [],
                })),
            };

            if !pipeline.name.is_empty() {
                ids_by_name.insert(pipeline.name.clone(), id.clone());
            }
            known_ids.insert(id.clone());
            resolved.push(ResolvedPipeline {
                name: pipeline.name.clone(),
                id,
                build,
                runner: pipeline.runner.clone(),
                stages,
            });
        }

        let sources = Self::collect_sources(manifest, &used_sources)?;
        Ok(ResolvedManifest {
            pipelines: resolved,
            sources,
        })
    }

    fn check_unique_names(pipelines: &[Pipeline]) -> BuildResult<()> {
        let mut seen = BTreeSet::new();
        for pipeline in pipelines {
            if pipeline.name.is_empty() {
                continue;
            }
            if !seen.insert(pipeline.name.as_str()) {
                return Err(BuildError::manifest_invalid(format!(
                    "duplicate pipeline name {:?}",
                    pipeline.name
                )));
            }
        }
        Ok(())
    }

    /// Orders pipelines so every name-referenced dependency precedes its
    /// dependents, preserving manifest order among independent pipelines.
    fn topological_order(pipelines: &[Pipeline]) -> BuildResult<Vec<usize>> {
        let index_by_name: HashMap<&str, usize> = pipelines
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.name.is_empty())
            .map(|(i, p)| (p.name.as_str(), i))
            .collect();

        // deps[i] = pipelines that must run before i.
        let mut deps: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); pipelines.len()];
        for (i, pipeline) in pipelines.iter().enumerate() {
            let mut add_ref = |reference: &PipelineRef| {
                if let PipelineRef::Name(name) = reference {
                    if let Some(&j) = index_by_name.get(name.as_str()) {
                        deps[i].insert(j);
                    }
                    // Unknown names surface as source-unresolved during the
                    // id pass, with the reference in the message.
                }
            };
            if let Some(reference) = &pipeline.build {
                add_ref(reference);
            }
            for stage in &pipeline.stages {
                for input in stage.inputs.values() {
                    if let Origin::Pipeline { reference, .. } = &input.origin {
                        add_ref(reference);
                    }
                }
            }
        }

        let mut order = Vec::with_capacity(pipelines.len());
        let mut placed = vec![false; pipelines.len()];
        while order.len() < pipelines.len() {
            let next = (0..pipelines.len())
                .find(|&i| !placed[i] && deps[i].iter().all(|&j| placed[j]));
            match next {
                Some(i) => {
                    placed[i] = true;
                    order.push(i);
                }
                None => {
                    let stuck: Vec<&str> = (0..pipelines.len())
                        .filter(|&i| !placed[i])
                        .map(|i| {
                            if pipelines[i].name.is_empty() {
                                "<anonymous>"
                            } else {
                                pipelines[i].name.as_str()
                            }
                        })
                        .collect();
                    return Err(BuildError::cycle_detected(format!(
                        "pipeline dependency cycle involving: {}",
                        stuck.join(", ")
                    )));
                }
            }
        }
        Ok(order)
    }

    fn resolve_pipeline_ref(
        reference: &PipelineRef,
        ids_by_name: &HashMap<String, ObjectId>,
        known_ids: &BTreeSet<ObjectId>,
    ) -> BuildResult<ObjectId> {
        match reference {
            PipelineRef::Name(name) => ids_by_name.get(name).cloned().ok_or_else(|| {
                BuildError::source_unresolved(format!("pipeline reference name:{name}"))
            }),
            PipelineRef::Id(id) => {
                if known_ids.contains(id) {
                    Ok(id.clone())
                } else {
                    Err(BuildError::source_unresolved(format!(
                        "pipeline reference {id}"
                    )))
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_stage(
        stage: &Stage,
        pipeline: &Pipeline,
        build: Option<&ObjectId>,
        prev_id: Option<&ObjectId>,
        manifest: &Manifest,
        registry: &ModuleRegistry,
        ids_by_name: &HashMap<String, ObjectId>,
        known_ids: &BTreeSet<ObjectId>,
        used_sources: &mut BTreeMap<String, BTreeSet<Checksum>>,
    ) -> BuildResult<ResolvedStage> {
        if !registry.contains_stage(&stage.module) {
            return Err(BuildError::module_unknown(stage.module.clone()));
        }

        let mut inputs = Vec::with_capacity(stage.inputs.len());
        for (name, spec) in &stage.inputs {
            let origin = match &spec.origin {
                Origin::Source { kind, references } => {
                    if !registry.contains_source(kind) {
                        return Err(BuildError::module_unknown(format!("source kind {kind}")));
                    }
                    let declared = manifest.sources.get(kind).ok_or_else(|| {
                        BuildError::source_unresolved(format!(
                            "source kind {kind} not declared in manifest"
                        ))
                    })?;
                    for checksum in references {
                        if !declared.contains_key(checksum) {
                            return Err(BuildError::source_unresolved(format!(
                                "{checksum} not declared under source kind {kind}"
                            )));
                        }
                        used_sources
                            .entry(kind.clone())
                            .or_default()
                            .insert(checksum.clone());
                    }
                    ResolvedOrigin::Source {
                        kind: kind.clone(),
                        references: references.clone(),
                    }
                }
                Origin::Pipeline { reference, subpath } => {
                    let id = Self::resolve_pipeline_ref(reference, ids_by_name, known_ids)?;
                    ResolvedOrigin::Pipeline {
                        id,
                        subpath: subpath.clone(),
                    }
                }
            };
            inputs.push(StageInput {
                name: name.clone(),
                content_type: spec.content_type.clone(),
                origin,
            });
        }

        let devices = Self::order_devices(stage)?;
        Self::check_mounts(stage)?;

        let id = Self::stage_id(stage, pipeline, build, prev_id, &inputs, &devices);
        Ok(ResolvedStage {
            id,
            module: stage.module.clone(),
            options: stage.options.clone(),
            inputs,
            devices,
            mounts: stage.mounts.clone(),
        })
    }

    /// Orders a stage's devices parent-before-child, rejecting unknown
    /// parents and parent cycles.
    fn order_devices(
        stage: &Stage,
    ) -> BuildResult<Vec<(String, crate::entities::manifest::DeviceSpec)>> {
        for (name, spec) in &stage.devices {
            if let Some(parent) = &spec.parent {
                if !stage.devices.contains_key(parent) {
                    return Err(BuildError::manifest_invalid(format!(
                        "device {name:?} names unknown parent {parent:?}"
                    )));
                }
            }
        }

        let mut ordered = Vec::with_capacity(stage.devices.len());
        let mut placed: BTreeSet<&str> = BTreeSet::new();
        while ordered.len() < stage.devices.len() {
            let mut progressed = false;
            for (name, spec) in &stage.devices {
                if placed.contains(name.as_str()) {
                    continue;
                }
                let ready = match &spec.parent {
                    None => true,
                    Some(parent) => placed.contains(parent.as_str()),
                };
                if ready {
                    placed.insert(name);
                    ordered.push((name.clone(), spec.clone()));
                    progressed = true;
                }
            }
            if !progressed {
                let stuck: Vec<&str> = stage
                    .devices
                    .keys()
                    .map(String::as_str)
                    .filter(|n| !placed.contains(n))
                    .collect();
                return Err(BuildError::cycle_detected(format!(
                    "device parent cycle involving: {}",
                    stuck.join(", ")
                )));
            }
        }
        Ok(ordered)
    }

    fn check_mounts(stage: &Stage) -> BuildResult<()> {
        for mount in &stage.mounts {
            if mount.kind == MountKind::Bind {
                continue;
            }
            match &mount.source {
                Some(device) if stage.devices.contains_key(device) => {}
                Some(device) => {
                    return Err(BuildError::manifest_invalid(format!(
                        "mount {:?} names unknown device {:?}",
                        mount.name, device
                    )));
                }
                None => {
                    return Err(BuildError::manifest_invalid(format!(
                        "mount {:?} has no source device",
                        mount.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Builds the fingerprint document for one stage.
    ///
    /// The preceding stage's id is folded in as `base`, so equal ids really
    /// do imply equal trees: anything that changed upstream re-identifies
    /// every stage after it.
    fn stage_id(
        stage: &Stage,
        pipeline: &Pipeline,
        build: Option<&ObjectId>,
        prev_id: Option<&ObjectId>,
        inputs: &[StageInput],
        devices: &[(String, crate::entities::manifest::DeviceSpec)],
    ) -> ObjectId {
        let input_docs: BTreeMap<&str, Value> = inputs
            .iter()
            .map(|input| {
                let origin = match &input.origin {
                    ResolvedOrigin::Source { kind, references } => json!({
                        "kind": kind,
                        "references": references,
                    }),
                    ResolvedOrigin::Pipeline { id, subpath } => json!({
                        "id": id.to_string(),
                        "subpath": subpath,
                    }),
                };
                (
                    input.name.as_str(),
                    json!({ "type": input.content_type, "origin": origin }),
                )
            })
            .collect();

        let device_docs: Vec<Value> = devices
            .iter()
            .map(|(name, spec)| {
                json!({
                    "name": name,
                    "type": spec.kind.as_str(),
                    "parent": spec.parent,
                    "options": spec.options,
                })
            })
            .collect();

        let mount_docs: Vec<Value> = stage
            .mounts
            .iter()
            .map(|mount| {
                json!({
                    "name": mount.name,
                    "type": mount.kind.as_str(),
                    "source": mount.source,
                    "target": mount.target,
                    "options": mount.options,
                })
            })
            .collect();

        Fingerprint::digest(&json!({
            "module": stage.module,
            "options": stage.options,
            "base": prev_id.map(ObjectId::to_string),
            "build": build.map(ObjectId::to_string),
            "runner": pipeline.runner,
            "inputs": input_docs,
            "devices": device_docs,
            "mounts": mount_docs,
        }))
    }

    /// Gathers descriptors for every source reference the plan actually
    /// uses, keyed the way the owning helpers expect them.
    fn collect_sources(
        manifest: &Manifest,
        used: &BTreeMap<String, BTreeSet<Checksum>>,
    ) -> BuildResult<BTreeMap<String, BTreeMap<Checksum, Value>>> {
        let mut out = BTreeMap::new();
        for (kind, checksums) in used {
            let declared = manifest.sources.get(kind).ok_or_else(|| {
                BuildError::source_unresolved(format!("source kind {kind} not declared"))
            })?;
            let mut entries = BTreeMap::new();
            for checksum in checksums {
                let descriptor = declared.get(checksum).ok_or_else(|| {
                    BuildError::source_unresolved(format!("{checksum} under {kind}"))
                })?;
                let value = serde_json::to_value(descriptor).map_err(|e| {
                    BuildError::internal(format!("descriptor serialization: {e}"))
                })?;
                entries.insert(checksum.clone(), value);
            }
            out.insert(kind.clone(), entries);
        }
        Ok(out)
    }
}
