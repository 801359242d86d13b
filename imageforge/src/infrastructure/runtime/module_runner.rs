// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Module Runner
//!
//! Production implementation of the stage-runner port. For one stage, in
//! order: start input helpers, open devices parent-first, stage mounts,
//! open the workspace (seeded from the previous stage's committed tree),
//! assemble the sandbox, invoke the module, collect its metadata, and
//! commit. Teardown — mounts, then devices child-first, then inputs — runs
//! in exact reverse registration order whether the module succeeded or
//! not; the runner returns only after every helper has exited.
//!
//! Cache decisions and source prefetching belong to the executor; by the
//! time `run` is called the stage is known to need execution and every
//! referenced source is in the cache.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

use imageforge_domain::entities::manifest::{DeviceSpec, MountKind, MountSpec};
use imageforge_domain::entities::resolved::ResolvedOrigin;
use imageforge_domain::repositories::object_store::ObjectStore;
use imageforge_domain::repositories::source_store::SourceStore;
use imageforge_domain::repositories::stage_runner::{StageRun, StageRunner};
use imageforge_domain::{BuildError, BuildResult, Monitor, ObjectId};

use crate::infrastructure::config::EngineConfig;
use crate::infrastructure::services::{role, spawn_helper, ServiceManager};
use crate::infrastructure::stores::{fs_util, FsObjectStore};

use super::sandbox::{self, BuildRoot, SandboxBackend, SandboxSpec};
use crate::infrastructure::services::registry::resolve_module;

/// Production stage runner: host services + sandbox + object store.
pub struct DefaultStageRunner {
    config: EngineConfig,
    store: Arc<FsObjectStore>,
    sources: Arc<dyn SourceStore>,
    monitor: Arc<dyn Monitor>,
    backend: Arc<dyn SandboxBackend>,
    /// Platform privilege probe result; selects the sandbox's privileged
    /// or user-namespace path.
    privileged: bool,
}

impl DefaultStageRunner {
    pub fn new(
        config: EngineConfig,
        store: Arc<FsObjectStore>,
        sources: Arc<dyn SourceStore>,
        monitor: Arc<dyn Monitor>,
        backend: Arc<dyn SandboxBackend>,
        privileged: bool,
    ) -> Self {
        Self {
            config,
            store,
            sources,
            monitor,
            backend,
            privileged,
        }
    }

    fn scratch_dir(&self, id: &ObjectId) -> PathBuf {
        self.store
            .root()
            .join("tmp")
            .join(format!("scratch-{}", id.short()))
    }

    /// Starts one input helper and asks it to map the input.
    async fn prepare_input(
        &self,
        services: &mut ServiceManager,
        dest_root: &PathBuf,
        name: &str,
        content_type: &str,
        origin: &ResolvedOrigin,
    ) -> BuildResult<PathBuf> {
        let origin_args = match origin {
            ResolvedOrigin::Source { kind, references } => {
                let files: Vec<Value> = references
                    .iter()
                    .map(|checksum| {
                        json!({
                            "checksum": checksum.to_string(),
                            "path": self.sources.path_of(kind, checksum),
                        })
                    })
                    .collect();
                json!({ "files": files })
            }
            ResolvedOrigin::Pipeline { id, subpath } => {
                let tree = self.store.lookup(id).await?.ok_or_else(|| {
                    BuildError::internal(format!("input tree {} not committed", id.short()))
                })?;
                json!({ "tree": { "path": tree, "subpath": subpath } })
            }
        };

        let client = spawn_helper(
            role::INPUT,
            &json!({ "dest_root": dest_root }),
            self.monitor.clone(),
        )
        .await?;
        let index = services.register(client);
        let reply = services
            .get_mut(index)?
            .call(
                "map",
                json!({ "name": name, "type": content_type, "origin": origin_args }),
            )
            .await?;
        let path = reply
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| BuildError::protocol("input map reply without path".to_owned()))?;
        Ok(PathBuf::from(path))
    }

    /// Opens one device through its kind's helper.
    async fn open_device(
        &self,
        services: &mut ServiceManager,
        name: &str,
        spec: &DeviceSpec,
        parent_path: Option<&str>,
    ) -> BuildResult<Value> {
        let service_role = match spec.kind {
            imageforge_domain::DeviceKind::Loopback => role::DEVICE_LOOPBACK,
            imageforge_domain::DeviceKind::Lvm2LogicalVolume => role::DEVICE_LVM2,
            imageforge_domain::DeviceKind::Luks2 => role::DEVICE_LUKS2,
        };
        let client = spawn_helper(service_role, &json!({}), self.monitor.clone()).await?;
        let index = services.register(client);
        let reply = services
            .get_mut(index)?
            .call(
                "open",
                json!({ "parent": parent_path, "options": spec.options }),
            )
            .await
            .map_err(|e| match e {
                e @ BuildError::DeviceOpen(_) => e,
                other => BuildError::DeviceOpen(format!("{name}: {other}")),
            })?;
        Ok(reply)
    }

    /// Stages one mount through a mount helper.
    async fn stage_mount(
        &self,
        services: &mut ServiceManager,
        mounts_root: &PathBuf,
        mount: &MountSpec,
        device_path: Option<&str>,
    ) -> BuildResult<PathBuf> {
        let target = mounts_root.join(&mount.name);
        let bind = mount.kind == MountKind::Bind;
        let source = if bind {
            mount.source.clone().ok_or_else(|| {
                BuildError::MountFailed(format!("bind mount {:?} has no source", mount.name))
            })?
        } else {
            device_path
                .ok_or_else(|| {
                    BuildError::MountFailed(format!("mount {:?} has no device", mount.name))
                })?
                .to_owned()
        };

        let client = spawn_helper(role::MOUNT, &json!({}), self.monitor.clone()).await?;
        let index = services.register(client);
        services
            .get_mut(index)?
            .call(
                "mount",
                json!({
                    "source": source,
                    "target": target,
                    "fstype": mount.kind.fstype(),
                    "bind": bind,
                    "read_only": mount.options.get("read_only").and_then(Value::as_bool)
                        .unwrap_or(false),
                    "options": mount.options.get("options").cloned()
                        .unwrap_or_else(|| json!([])),
                }),
            )
            .await
            .map_err(|e| match e {
                e @ BuildError::MountFailed(_) => e,
                other => BuildError::MountFailed(format!("{}: {other}", mount.name)),
            })?;
        Ok(target)
    }

    async fn run_inner(
        &self,
        request: &StageRun<'_>,
        services: &mut ServiceManager,
        scratch: &PathBuf,
    ) -> BuildResult<Value> {
        let stage = request.stage;

        // Inputs first.
        let inputs_root = scratch.join("inputs");
        let mut inputs = Vec::with_capacity(stage.inputs.len());
        for input in &stage.inputs {
            let path = self
                .prepare_input(
                    services,
                    &inputs_root,
                    &input.name,
                    &input.content_type,
                    &input.origin,
                )
                .await?;
            inputs.push((input.name.clone(), path));
        }

        // Devices, parent before child (the resolver ordered them).
        let mut devices: Vec<(String, Value)> = Vec::with_capacity(stage.devices.len());
        for (name, spec) in &stage.devices {
            let parent_path = match &spec.parent {
                Some(parent) => Some(
                    devices
                        .iter()
                        .find(|(opened, _)| opened == parent)
                        .and_then(|(_, node)| node.get("path").and_then(Value::as_str))
                        .ok_or_else(|| {
                            BuildError::DeviceOpen(format!(
                                "{name}: parent {parent:?} not opened"
                            ))
                        })?
                        .to_owned(),
                ),
                None => None,
            };
            let node = self
                .open_device(services, name, spec, parent_path.as_deref())
                .await?;
            devices.push((name.clone(), node));
        }

        // Mounts, in declaration order.
        let mounts_root = scratch.join("mounts");
        let mut mounts = Vec::with_capacity(stage.mounts.len());
        for mount in &stage.mounts {
            let device_path = mount.source.as_deref().and_then(|source| {
                devices
                    .iter()
                    .find(|(name, _)| name == source)
                    .and_then(|(_, node)| node.get("path").and_then(Value::as_str))
            });
            let target = self
                .stage_mount(services, &mounts_root, mount, device_path)
                .await?;
            mounts.push((mount.name.clone(), target));
        }

        // The workspace, seeded from the previous stage's committed tree.
        let workspace = self.store.new_workspace(&stage.id).await?;
        let module_result = async {
            if let Some(base) = request.base {
                let base_tree = self.store.lookup(base).await?.ok_or_else(|| {
                    BuildError::internal(format!("base object {} missing", base.short()))
                })?;
                let dest = workspace.tree();
                tokio::task::spawn_blocking(move || fs_util::copy_tree(&base_tree, &dest))
                    .await
                    .map_err(|e| BuildError::internal(format!("seed task: {e}")))?
                    .map_err(|e| BuildError::store_io(format!("seeding workspace: {e}")))?;
            }

            // Build environment, committed earlier in the walk.
            let build_tree = match &request.pipeline.build {
                Some(id) => Some(self.store.lookup(id).await?.ok_or_else(|| {
                    BuildError::internal(format!("build environment {} missing", id.short()))
                })?),
                None => None,
            };

            let module_exe = resolve_module(&self.config.module_path, &stage.module)
                .ok_or_else(|| BuildError::module_unknown(stage.module.clone()))?;

            let spec = SandboxSpec {
                build_tree,
                tree: workspace.tree(),
                inputs: inputs.clone(),
                devices: devices.clone(),
                mounts: mounts.clone(),
                module_exe,
                module_name: stage.module.clone(),
                stage_id: stage.id.clone(),
                options: stage.options.clone(),
                source_epoch: self.config.source_epoch,
                timeout: self.config.module_timeout,
                privileged: self.privileged,
            };

            let buildroot =
                BuildRoot::assemble(scratch.join("buildroot"), &spec, self.backend.clone())?;
            let outcome = sandbox::run_module(&buildroot, &spec, self.monitor.clone()).await;
            buildroot.teardown();
            outcome
        }
        .await;

        match module_result {
            Ok(metadata) => {
                // Capture per-stage metadata beside the object.
                let stage_dir = self.store.stage_dir(&stage.id);
                if std::fs::create_dir_all(&stage_dir).is_ok() {
                    std::fs::write(
                        stage_dir.join("meta.json"),
                        serde_json::to_vec_pretty(&metadata).unwrap_or_default(),
                    )
                    .ok();
                }
                self.store
                    .commit(
                        workspace,
                        json!({ "module": stage.module, "metadata": metadata }),
                    )
                    .await?;
                Ok(metadata)
            }
            Err(e) => {
                self.store.discard(workspace).await.ok();
                Err(e)
            }
        }
    }
}

#[async_trait]
impl StageRunner for DefaultStageRunner {
    async fn run(&self, request: StageRun<'_>) -> BuildResult<Value> {
        let scratch = self.scratch_dir(&request.stage.id);
        std::fs::create_dir_all(&scratch)
            .map_err(|e| BuildError::store_io(format!("creating scratch: {e}")))?;

        let mut services = ServiceManager::new(self.config.service_grace);
        let result = self.run_inner(&request, &mut services, &scratch).await;

        // Reverse teardown runs on success and failure alike: mounts
        // unwind first, then devices child-before-parent, then inputs.
        let teardown = services.stop_all().await;
        std::fs::remove_dir_all(&scratch).ok();

        match (result, teardown) {
            (Ok(metadata), Ok(())) => Ok(metadata),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), _) => Err(e),
        }
    }
}
