// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Mount Service
//!
//! One helper per staged mount. `mount(source, target, …)` attaches the
//! filesystem (or bind-mounts a path — bind mounts are first class);
//! `umount()` or close detaches it. The runner stacks one service per
//! mount in declaration order and closes them in reverse, so nested
//! mounts — a filesystem on an encrypted volume on a partition on a
//! loopback — unwind inside-out.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;

use imageforge_domain::{BuildError, BuildResult};

use crate::infrastructure::ipc::{EventSender, HostService};

use super::devices::run_host_tool;

/// Mounts one filesystem and owns its detachment.
pub struct MountService {
    mounted: Option<PathBuf>,
}

impl MountService {
    pub fn new() -> Self {
        Self { mounted: None }
    }

    async fn mount(&mut self, args: &Value) -> BuildResult<Value> {
        if self.mounted.is_some() {
            return Err(BuildError::MountFailed("already mounted".into()));
        }
        let source = args
            .get("source")
            .and_then(Value::as_str)
            .ok_or_else(|| BuildError::MountFailed("mount needs a source".into()))?;
        let target = args
            .get("target")
            .and_then(Value::as_str)
            .ok_or_else(|| BuildError::MountFailed("mount needs a target".into()))?;
        let bind = args.get("bind").and_then(Value::as_bool).unwrap_or(false);
        let read_only = args
            .get("read_only")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        std::fs::create_dir_all(target)
            .map_err(|e| BuildError::MountFailed(format!("creating {target}: {e}")))?;

        let mut mount_args: Vec<String> = Vec::new();
        if bind {
            mount_args.push("--rbind".into());
        } else if let Some(fstype) = args.get("fstype").and_then(Value::as_str) {
            mount_args.push("--types".into());
            mount_args.push(fstype.to_owned());
        }
        let mut option_list: Vec<String> = args
            .get("options")
            .and_then(Value::as_array)
            .map(|opts| {
                opts.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        if read_only {
            option_list.push("ro".into());
        }
        if !option_list.is_empty() {
            mount_args.push("--options".into());
            mount_args.push(option_list.join(","));
        }
        mount_args.push(source.to_owned());
        mount_args.push(target.to_owned());

        let arg_refs: Vec<&str> = mount_args.iter().map(String::as_str).collect();
        run_host_tool("mount", &arg_refs)
            .await
            .map_err(|e| BuildError::MountFailed(format!("{source} on {target}: {e}")))?;
        self.mounted = Some(PathBuf::from(target));
        Ok(json!({ "path": target }))
    }

    async fn umount(&mut self) -> BuildResult<()> {
        if let Some(target) = self.mounted.take() {
            let target_str = target.to_string_lossy().into_owned();
            run_host_tool("umount", &["--recursive", &target_str])
                .await
                .map_err(|e| BuildError::MountFailed(format!("unmounting {target_str}: {e}")))?;
        }
        Ok(())
    }
}

impl Default for MountService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostService for MountService {
    async fn dispatch(
        &mut self,
        method: &str,
        args: Value,
        _events: &EventSender,
    ) -> BuildResult<Value> {
        match method {
            "mount" => self.mount(&args).await,
            "umount" => {
                self.umount().await?;
                Ok(Value::Null)
            }
            other => Err(BuildError::protocol(format!("unknown method {other:?}"))),
        }
    }

    async fn shutdown(&mut self) -> BuildResult<()> {
        self.umount().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn events() -> EventSender {
        let (tx, _rx) = mpsc::unbounded_channel();
        EventSender::for_tests(tx)
    }

    #[tokio::test]
    async fn test_mount_requires_source_and_target() {
        let mut service = MountService::new();
        let err = service
            .dispatch("mount", json!({ "target": "/tmp/x" }), &events())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "mount-failed");

        let err = service
            .dispatch("mount", json!({ "source": "/dev/loop0" }), &events())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "mount-failed");
    }

    #[tokio::test]
    async fn test_umount_without_mount_is_clean() {
        let mut service = MountService::new();
        let reply = service.dispatch("umount", Value::Null, &events()).await.unwrap();
        assert_eq!(reply, Value::Null);
        assert!(service.shutdown().await.is_ok());
    }
}
