// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Device Services
//!
//! One helper per opened block device. Each exposes
//! `open(parent, options)` → `{path, major, minor, …}` and releases the
//! device on close, in child-before-parent order enforced by the runner:
//!
//! - [`LoopbackService`] — binds a backing file to a free loop device.
//! - [`Lvm2Service`] — activates a logical volume, suppressing the host's
//!   udev auto-activation rules for the service's lifetime so the host
//!   does not race the engine for the volume.
//! - [`Luks2Service`] — opens a LUKS2 container through device-mapper;
//!   closing decrements the dm reference so the parent can detach.
//!
//! All three drive the host's own tooling (`losetup`, `lvm`, `cryptsetup`)
//! as subprocesses; the helper owns exactly one resource and its close is
//! the single place that resource is released.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use imageforge_domain::{BuildError, BuildResult};

use crate::infrastructure::ipc::{EventSender, HostService};

/// Transient udev rules file inhibiting auto-activation while a device
/// service holds a volume.
const UDEV_INHIBIT_RULES: &str = "/run/udev/rules.d/90-imageforge-inhibit.rules";

/// Runs a host tool, capturing stdout; non-zero exit becomes an error
/// carrying stderr.
pub(crate) async fn run_host_tool(program: &str, args: &[&str]) -> BuildResult<String> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| BuildError::internal(format!("spawning {program}: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BuildError::internal(format!(
            "{program} {}: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}

/// Feeds `input` to a host tool's stdin.
async fn run_host_tool_with_stdin(
    program: &str,
    args: &[&str],
    input: &[u8],
) -> BuildResult<String> {
    use tokio::io::AsyncWriteExt;

    let mut child = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| BuildError::internal(format!("spawning {program}: {e}")))?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input)
            .await
            .map_err(|e| BuildError::internal(format!("{program}: writing stdin: {e}")))?;
    }
    let output = child
        .wait_with_output()
        .await
        .map_err(|e| BuildError::internal(format!("{program}: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BuildError::internal(format!(
            "{program} {}: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}

/// Major/minor of a block device node, decoded from `st_rdev` the way
/// glibc's `makedev` packs them.
fn device_numbers(path: &Path) -> BuildResult<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::metadata(path)
        .map_err(|e| BuildError::DeviceOpen(format!("{}: {e}", path.display())))?;
    let rdev = meta.rdev();
    let major = ((rdev >> 32) & 0xffff_f000) | ((rdev >> 8) & 0xfff);
    let minor = ((rdev >> 12) & 0xffff_ff00) | (rdev & 0xff);
    Ok((major, minor))
}

fn open_reply(path: &Path, extra: Value) -> BuildResult<Value> {
    let (major, minor) = device_numbers(path)?;
    let mut reply = json!({
        "path": path,
        "major": major,
        "minor": minor,
    });
    if let (Some(map), Some(extra_map)) = (reply.as_object_mut(), extra.as_object()) {
        for (key, value) in extra_map {
            map.insert(key.clone(), value.clone());
        }
    }
    Ok(reply)
}

/// File-backed loop device.
pub struct LoopbackService {
    attached: Option<String>,
}

impl LoopbackService {
    pub fn new() -> Self {
        Self { attached: None }
    }

    async fn open(&mut self, args: &Value) -> BuildResult<Value> {
        if self.attached.is_some() {
            return Err(BuildError::DeviceOpen("loopback already attached".into()));
        }
        let options = args.get("options").cloned().unwrap_or(Value::Null);
        let filename = options
            .get("filename")
            .and_then(Value::as_str)
            .ok_or_else(|| BuildError::DeviceOpen("loopback needs options.filename".into()))?;

        let mut losetup_args: Vec<String> = vec!["--find".into(), "--show".into()];
        if let Some(offset) = options.get("offset").and_then(Value::as_u64) {
            losetup_args.push("--offset".into());
            losetup_args.push(offset.to_string());
        }
        if let Some(size) = options.get("size").and_then(Value::as_u64) {
            losetup_args.push("--sizelimit".into());
            losetup_args.push(size.to_string());
        }
        if options.get("read_only").and_then(Value::as_bool) == Some(true) {
            losetup_args.push("--read-only".into());
        }
        losetup_args.push(filename.to_owned());

        let arg_refs: Vec<&str> = losetup_args.iter().map(String::as_str).collect();
        let path = run_host_tool("losetup", &arg_refs)
            .await
            .map_err(|e| BuildError::DeviceOpen(e.to_string()))?;
        self.attached = Some(path.clone());
        open_reply(Path::new(&path), json!({ "backing": filename }))
    }
}

impl Default for LoopbackService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostService for LoopbackService {
    async fn dispatch(
        &mut self,
        method: &str,
        args: Value,
        events: &EventSender,
    ) -> BuildResult<Value> {
        match method {
            "open" => {
                let reply = self.open(&args).await?;
                events.message(format!(
                    "attached {}",
                    reply["path"].as_str().unwrap_or("?")
                ));
                Ok(reply)
            }
            other => Err(BuildError::protocol(format!("unknown method {other:?}"))),
        }
    }

    async fn shutdown(&mut self) -> BuildResult<()> {
        if let Some(path) = self.attached.take() {
            run_host_tool("losetup", &["--detach", &path])
                .await
                .map_err(|e| BuildError::DeviceOpen(format!("detach {path}: {e}")))?;
        }
        Ok(())
    }
}

/// LVM2 logical-volume activation.
pub struct Lvm2Service {
    activated: Option<String>,
    inhibited: bool,
}

impl Lvm2Service {
    pub fn new() -> Self {
        Self {
            activated: None,
            inhibited: false,
        }
    }

    /// Writes a transient rules file disabling udev's LVM auto-activation
    /// while this service holds the volume, then asks udev to reload.
    async fn inhibit_udev(&mut self) {
        let rule = "SUBSYSTEM==\"block\", ENV{DM_UDEV_DISABLE_OTHER_RULES_FLAG}=\"1\"\n";
        if std::fs::create_dir_all("/run/udev/rules.d").is_ok()
            && std::fs::write(UDEV_INHIBIT_RULES, rule).is_ok()
        {
            self.inhibited = true;
            run_host_tool("udevadm", &["control", "--reload"]).await.ok();
        }
    }

    async fn release_udev(&mut self) {
        if self.inhibited {
            std::fs::remove_file(UDEV_INHIBIT_RULES).ok();
            run_host_tool("udevadm", &["control", "--reload"]).await.ok();
            self.inhibited = false;
        }
    }

    async fn open(&mut self, args: &Value) -> BuildResult<Value> {
        if self.activated.is_some() {
            return Err(BuildError::DeviceOpen("volume already activated".into()));
        }
        let options = args.get("options").cloned().unwrap_or(Value::Null);
        let vg = options
            .get("volume_group")
            .and_then(Value::as_str)
            .ok_or_else(|| BuildError::DeviceOpen("lvm2 needs options.volume_group".into()))?;
        let lv = options
            .get("logical_volume")
            .and_then(Value::as_str)
            .ok_or_else(|| BuildError::DeviceOpen("lvm2 needs options.logical_volume".into()))?;
        let qualified = format!("{vg}/{lv}");

        self.inhibit_udev().await;
        run_host_tool(
            "lvchange",
            &["--activate", "y", "--ignoreactivationskip", "--yes", &qualified],
        )
        .await
        .map_err(|e| BuildError::DeviceOpen(format!("activating {qualified}: {e}")))?;
        let path = run_host_tool(
            "lvs",
            &["--noheadings", "--options", "lv_path", &qualified],
        )
        .await
        .map_err(|e| BuildError::DeviceOpen(format!("resolving {qualified}: {e}")))?;
        self.activated = Some(qualified.clone());
        open_reply(Path::new(&path), json!({ "volume": qualified }))
    }
}

impl Default for Lvm2Service {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostService for Lvm2Service {
    async fn dispatch(
        &mut self,
        method: &str,
        args: Value,
        _events: &EventSender,
    ) -> BuildResult<Value> {
        match method {
            "open" => self.open(&args).await,
            other => Err(BuildError::protocol(format!("unknown method {other:?}"))),
        }
    }

    async fn shutdown(&mut self) -> BuildResult<()> {
        if let Some(qualified) = self.activated.take() {
            let result = run_host_tool("lvchange", &["--activate", "n", &qualified])
                .await
                .map(|_| ())
                .map_err(|e| BuildError::DeviceOpen(format!("deactivating {qualified}: {e}")));
            self.release_udev().await;
            return result;
        }
        self.release_udev().await;
        Ok(())
    }
}

/// LUKS2 encrypted-volume opener.
pub struct Luks2Service {
    opened: Option<String>,
}

impl Luks2Service {
    pub fn new() -> Self {
        Self { opened: None }
    }

    async fn open(&mut self, args: &Value) -> BuildResult<Value> {
        if self.opened.is_some() {
            return Err(BuildError::DeviceOpen("volume already open".into()));
        }
        let parent = args
            .get("parent")
            .and_then(Value::as_str)
            .ok_or_else(|| BuildError::DeviceOpen("luks2 needs a parent device".into()))?;
        let options = args.get("options").cloned().unwrap_or(Value::Null);
        let passphrase = options
            .get("passphrase")
            .and_then(Value::as_str)
            .ok_or_else(|| BuildError::DeviceOpen("luks2 needs options.passphrase".into()))?;
        let name = options
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| format!("imageforge-luks-{}", std::process::id()));

        run_host_tool_with_stdin(
            "cryptsetup",
            &["open", "--type", "luks2", "--key-file", "-", parent, &name],
            passphrase.as_bytes(),
        )
        .await
        .map_err(|e| BuildError::DeviceOpen(format!("opening {parent}: {e}")))?;
        self.opened = Some(name.clone());
        let path = PathBuf::from("/dev/mapper").join(&name);
        open_reply(&path, json!({ "name": name }))
    }
}

impl Default for Luks2Service {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostService for Luks2Service {
    async fn dispatch(
        &mut self,
        method: &str,
        args: Value,
        _events: &EventSender,
    ) -> BuildResult<Value> {
        match method {
            "open" => self.open(&args).await,
            other => Err(BuildError::protocol(format!("unknown method {other:?}"))),
        }
    }

    async fn shutdown(&mut self) -> BuildResult<()> {
        if let Some(name) = self.opened.take() {
            // Closing drops the device-mapper reference on the parent.
            run_host_tool("cryptsetup", &["close", &name])
                .await
                .map_err(|e| BuildError::DeviceOpen(format!("closing {name}: {e}")))?;
        }
        Ok(())
    }
}
