// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Sandbox / Build Root
//!
//! Constructs the ephemeral container one module runs in and invokes the
//! module inside it:
//!
//! 1. The build environment's committed tree (or a host allowlist view)
//!    becomes the read-only root filesystem.
//! 2. A writable scratch layer for module artifacts, separate from the
//!    stage tree, which is mounted at `/run/imageforge/tree`.
//! 3. A restricted `/dev` node set, `/proc`, read-only `/sys`, and a fresh
//!    tmpfs `/run`.
//! 4. Declared devices under their canonical `/dev` paths, mounts under
//!    `/run/imageforge/mounts/<name>`, inputs read-only under
//!    `/run/imageforge/inputs/<name>`.
//! 5. Fresh mount, PID, network, UTS, and IPC namespaces — plus a user
//!    namespace with single-id maps when the engine is unprivileged. The
//!    network namespace is isolated; fetching happens host-side, never in
//!    the sandbox. On the privileged path the label-administration
//!    capability is retained so security-label-aware modules can write
//!    labels the host policy does not know.
//!
//! The module is spawned with no arguments: its JSON argument blob is at
//! `/run/imageforge/args.json` and also open on fd 3; the structured
//! result is written to fd 4; stdout/stderr are captured and forwarded as
//! log events.
//!
//! Privileged operations go through [`SandboxBackend`], so assembly and
//! teardown ordering are testable without privileges; the production
//! backend drives `mount(2)`, `umount2(2)`, and `mknod(2)` directly.

use serde_json::{json, Map, Value};
use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use imageforge_domain::events::build_event::{EventOrigin, MessageRecord};
use imageforge_domain::{BuildError, BuildEvent, BuildResult, Monitor, ObjectId};

/// Host paths exposed read-only when a pipeline has no build environment.
pub const HOST_ALLOWLIST: [&str; 6] = ["/usr", "/bin", "/sbin", "/lib", "/lib64", "/etc/alternatives"];

/// Well-known paths inside the sandbox.
pub const SANDBOX_RUN: &str = "run/imageforge";
/// Restricted device node set every sandbox carries.
const DEV_NODES: [(&str, u64, u64); 6] = [
    ("null", 1, 3),
    ("zero", 1, 5),
    ("full", 1, 7),
    ("random", 1, 8),
    ("urandom", 1, 9),
    ("tty", 5, 0),
];

/// Args blob fd inside the module.
const ARGS_FD: i32 = 3;
/// Result fd inside the module.
const RESULT_FD: i32 = 4;

/// Device node kinds the sandbox creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Char,
    Block,
}

/// Privileged sandbox primitives, separated so assembly and unwind order
/// are testable.
pub trait SandboxBackend: Send + Sync {
    fn bind(&self, source: &Path, target: &Path, read_only: bool) -> BuildResult<()>;
    fn tmpfs(&self, target: &Path) -> BuildResult<()>;
    fn proc(&self, target: &Path) -> BuildResult<()>;
    fn unmount(&self, target: &Path) -> BuildResult<()>;
    fn device_node(&self, path: &Path, kind: NodeKind, major: u64, minor: u64) -> BuildResult<()>;
}

/// Production backend driving the kernel directly.
pub struct KernelSandboxBackend;

#[cfg(target_os = "linux")]
impl SandboxBackend for KernelSandboxBackend {
    fn bind(&self, source: &Path, target: &Path, read_only: bool) -> BuildResult<()> {
        linux::mount_bind(source, target)?;
        if read_only {
            linux::remount_readonly(target)?;
        }
        Ok(())
    }

    fn tmpfs(&self, target: &Path) -> BuildResult<()> {
        linux::mount_fs("tmpfs", "tmpfs", target, 0)
    }

    fn proc(&self, target: &Path) -> BuildResult<()> {
        linux::mount_fs("proc", "proc", target, 0)
    }

    fn unmount(&self, target: &Path) -> BuildResult<()> {
        linux::unmount(target)
    }

    fn device_node(&self, path: &Path, kind: NodeKind, major: u64, minor: u64) -> BuildResult<()> {
        linux::make_node(path, kind, major, minor)
    }
}

#[cfg(not(target_os = "linux"))]
impl SandboxBackend for KernelSandboxBackend {
    fn bind(&self, _: &Path, _: &Path, _: bool) -> BuildResult<()> {
        Err(BuildError::sandbox_setup("sandbox requires linux"))
    }
    fn tmpfs(&self, _: &Path) -> BuildResult<()> {
        Err(BuildError::sandbox_setup("sandbox requires linux"))
    }
    fn proc(&self, _: &Path) -> BuildResult<()> {
        Err(BuildError::sandbox_setup("sandbox requires linux"))
    }
    fn unmount(&self, _: &Path) -> BuildResult<()> {
        Ok(())
    }
    fn device_node(&self, _: &Path, _: NodeKind, _: u64, _: u64) -> BuildResult<()> {
        Err(BuildError::sandbox_setup("sandbox requires linux"))
    }
}

/// What the runner asks the sandbox to execute.
#[derive(Debug)]
pub struct SandboxSpec {
    /// Committed build-environment tree, or `None` for the host view.
    pub build_tree: Option<PathBuf>,
    /// The stage's mutable tree (the workspace).
    pub tree: PathBuf,
    /// Input name → prepared read-only path.
    pub inputs: Vec<(String, PathBuf)>,
    /// Device name → `{path, major, minor, …}` reply from its service.
    pub devices: Vec<(String, Value)>,
    /// Mount name → staged mountpoint on the host.
    pub mounts: Vec<(String, PathBuf)>,
    /// Resolved module executable.
    pub module_exe: PathBuf,
    /// Module name, for diagnostics.
    pub module_name: String,
    /// Stage id, passed in `meta`.
    pub stage_id: ObjectId,
    /// Opaque module options.
    pub options: Value,
    /// Source-epoch timestamp for reproducible file times.
    pub source_epoch: i64,
    /// Optional wall-clock limit for the module.
    pub timeout: Option<Duration>,
    /// Whether the engine is privileged. Unprivileged runs add a user
    /// namespace with single-id maps so the sandbox still gets mount and
    /// chroot rights inside it.
    pub privileged: bool,
}

/// One assembled build root, unwound on `teardown`.
pub struct BuildRoot {
    scratch: PathBuf,
    backend: Arc<dyn SandboxBackend>,
    /// Mounted targets, in mount order; unwound in reverse.
    mounted: Vec<PathBuf>,
}

impl BuildRoot {
    /// Assembles the container filesystem under `scratch/root`.
    pub fn assemble(
        scratch: impl Into<PathBuf>,
        spec: &SandboxSpec,
        backend: Arc<dyn SandboxBackend>,
    ) -> BuildResult<Self> {
        let scratch = scratch.into();
        let mut root = Self {
            scratch,
            backend,
            mounted: Vec::new(),
        };
        if let Err(e) = root.build(spec) {
            // Partial setup must not leak mounts.
            root.unwind();
            return Err(e);
        }
        Ok(root)
    }

    fn root_dir(&self) -> PathBuf {
        self.scratch.join("root")
    }

    /// The args file on the host side.
    pub fn args_path(&self) -> PathBuf {
        self.root_dir().join(SANDBOX_RUN).join("args.json")
    }

    fn mount(&mut self, target: PathBuf, op: impl FnOnce(&dyn SandboxBackend) -> BuildResult<()>) -> BuildResult<()> {
        op(self.backend.as_ref())?;
        self.mounted.push(target);
        Ok(())
    }

    fn build(&mut self, spec: &SandboxSpec) -> BuildResult<()> {
        let root = self.root_dir();
        let mkdir = |path: &Path| {
            std::fs::create_dir_all(path)
                .map_err(|e| BuildError::sandbox_setup(format!("{}: {e}", path.display())))
        };
        mkdir(&root)?;

        // 1. Root filesystem: the build environment, read-only.
        match &spec.build_tree {
            Some(tree) => {
                let backend = self.backend.clone();
                self.mount(root.clone(), |_| backend.bind(tree, &root, true))?;
            }
            None => {
                // Host view: the explicit allowlist only.
                for host_path in HOST_ALLOWLIST {
                    let source = Path::new(host_path);
                    if !source.exists() {
                        continue;
                    }
                    let target = root.join(host_path.trim_start_matches('/'));
                    mkdir(&target)?;
                    let backend = self.backend.clone();
                    self.mount(target.clone(), |_| backend.bind(source, &target, true))?;
                }
            }
        }

        // 2. /dev, /proc, /sys, and a fresh /run.
        let dev = root.join("dev");
        mkdir(&dev)?;
        let backend = self.backend.clone();
        self.mount(dev.clone(), |_| backend.tmpfs(&dev))?;
        for (name, major, minor) in DEV_NODES {
            self.backend
                .device_node(&dev.join(name), NodeKind::Char, major, minor)?;
        }
        std::fs::create_dir_all(dev.join("pts")).ok();

        let proc_dir = root.join("proc");
        mkdir(&proc_dir)?;
        let backend = self.backend.clone();
        self.mount(proc_dir.clone(), |_| backend.proc(&proc_dir))?;

        let sys = root.join("sys");
        mkdir(&sys)?;
        let backend = self.backend.clone();
        self.mount(sys.clone(), |_| backend.bind(Path::new("/sys"), &sys, true))?;

        let run = root.join("run");
        mkdir(&run)?;
        let backend = self.backend.clone();
        self.mount(run.clone(), |_| backend.tmpfs(&run))?;

        let api_root = root.join(SANDBOX_RUN);
        mkdir(&api_root)?;

        // 3. The stage tree, writable, at its dedicated path.
        let tree_target = api_root.join("tree");
        mkdir(&tree_target)?;
        let backend = self.backend.clone();
        self.mount(tree_target.clone(), |_| {
            backend.bind(&spec.tree, &tree_target, false)
        })?;

        // 4. Inputs, read-only.
        for (name, source) in &spec.inputs {
            let target = api_root.join("inputs").join(name);
            mkdir(&target)?;
            let backend = self.backend.clone();
            self.mount(target.clone(), |_| backend.bind(source, &target, true))?;
        }

        // 5. Declared devices under their canonical /dev names.
        for (name, node) in &spec.devices {
            let major = node.get("major").and_then(Value::as_u64).unwrap_or(0);
            let minor = node.get("minor").and_then(Value::as_u64).unwrap_or(0);
            self.backend
                .device_node(&dev.join(name), NodeKind::Block, major, minor)?;
        }

        // 6. Staged mounts.
        for (name, source) in &spec.mounts {
            let target = api_root.join("mounts").join(name);
            mkdir(&target)?;
            let backend = self.backend.clone();
            self.mount(target.clone(), |_| backend.bind(source, &target, false))?;
        }

        Ok(())
    }

    /// Unmounts everything in reverse mount order; errors are logged, not
    /// propagated — teardown always finishes.
    fn unwind(&mut self) {
        while let Some(target) = self.mounted.pop() {
            if let Err(e) = self.backend.unmount(&target) {
                tracing::warn!(target = %target.display(), error = %e, "unmount failed");
            }
        }
    }

    /// Tears the build root down and removes the scratch directory.
    pub fn teardown(mut self) {
        self.unwind();
        std::fs::remove_dir_all(&self.scratch).ok();
    }

    /// Targets currently mounted, in mount order. For diagnostics/tests.
    pub fn mounted(&self) -> &[PathBuf] {
        &self.mounted
    }
}

/// Builds the argument blob the module reads from fd 3.
pub fn build_args_blob(spec: &SandboxSpec) -> Value {
    let inputs: Map<String, Value> = spec
        .inputs
        .iter()
        .map(|(name, _)| {
            (
                name.clone(),
                json!({ "path": format!("/{SANDBOX_RUN}/inputs/{name}") }),
            )
        })
        .collect();
    let devices: Map<String, Value> = spec
        .devices
        .iter()
        .map(|(name, node)| {
            let mut entry = node.clone();
            if let Some(map) = entry.as_object_mut() {
                map.insert("path".into(), json!(format!("/dev/{name}")));
            }
            (name.clone(), entry)
        })
        .collect();
    let mounts: Vec<Value> = spec
        .mounts
        .iter()
        .map(|(name, _)| json!({ "name": name, "path": format!("/{SANDBOX_RUN}/mounts/{name}") }))
        .collect();

    json!({
        "tree": format!("/{SANDBOX_RUN}/tree"),
        "inputs": inputs,
        "devices": devices,
        "mounts": mounts,
        "options": spec.options,
        "paths": {
            "mounts": format!("/{SANDBOX_RUN}/mounts"),
            "devices": "/dev",
        },
        "meta": {
            "id": spec.stage_id.as_str(),
            "source-epoch": spec.source_epoch,
        },
    })
}

/// Runs the module inside the assembled build root.
///
/// Returns the module's structured result value. Stdout and stderr are
/// forwarded line by line to the monitor as module messages.
pub async fn run_module(
    root: &BuildRoot,
    spec: &SandboxSpec,
    monitor: Arc<dyn Monitor>,
) -> BuildResult<Value> {
    use tokio::io::{AsyncBufReadExt, BufReader};

    // Argument blob: written to the well-known path, handed over on fd 3.
    let args_blob = build_args_blob(spec);
    let args_path = root.args_path();
    std::fs::write(
        &args_path,
        serde_json::to_vec_pretty(&args_blob).expect("args serialization"),
    )
    .map_err(|e| BuildError::sandbox_setup(format!("writing args: {e}")))?;
    let args_file = std::fs::File::open(&args_path)
        .map_err(|e| BuildError::sandbox_setup(format!("opening args: {e}")))?;

    // Result channel: the module writes one JSON object to fd 4.
    let (result_read, result_write) = std::os::unix::net::UnixStream::pair()
        .map_err(|e| BuildError::sandbox_setup(format!("result pipe: {e}")))?;

    let chroot_dir = root.root_dir();
    let args_fd = args_file.as_raw_fd();
    let result_fd = result_write.as_raw_fd();
    let privileged = spec.privileged;
    // SAFETY: geteuid/getegid are always safe to call.
    #[cfg(target_os = "linux")]
    let (host_uid, host_gid) = unsafe { (libc::geteuid(), libc::getegid()) };

    let mut command = tokio::process::Command::new(&spec.module_exe);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env_clear()
        .env("PATH", "/usr/sbin:/usr/bin:/sbin:/bin")
        .env("TERM", "dumb")
        .env("SOURCE_DATE_EPOCH", spec.source_epoch.to_string());

    // SAFETY: only async-signal-safe calls; every captured fd stays open
    // in the parent until spawn returns.
    #[cfg(target_os = "linux")]
    unsafe {
        command.pre_exec(move || {
            // Fresh namespaces. The module's children land in the new PID
            // namespace, so everything it spawns dies with it. The network
            // namespace has no interfaces: fetching is host-side only.
            let mut namespaces = libc::CLONE_NEWNS
                | libc::CLONE_NEWPID
                | libc::CLONE_NEWNET
                | libc::CLONE_NEWIPC
                | libc::CLONE_NEWUTS;
            if !privileged {
                namespaces |= libc::CLONE_NEWUSER;
            }
            if libc::unshare(namespaces) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if !privileged {
                // Single-id maps: root inside is the invoking user
                // outside, which grants mount/chroot rights within the
                // namespace. setgroups must be denied before gid_map.
                std::fs::write("/proc/self/setgroups", "deny")?;
                std::fs::write("/proc/self/uid_map", format!("0 {host_uid} 1"))?;
                std::fs::write("/proc/self/gid_map", format!("0 {host_gid} 1"))?;
            }
            // Keep our mount changes out of the host namespace.
            let root_c = std::ffi::CString::new("/").unwrap();
            if libc::mount(
                std::ptr::null(),
                root_c.as_ptr(),
                std::ptr::null(),
                libc::MS_REC | libc::MS_PRIVATE,
                std::ptr::null(),
            ) != 0
            {
                return Err(std::io::Error::last_os_error());
            }
            let chroot_c = std::ffi::CString::new(
                chroot_dir.as_os_str().as_encoded_bytes().to_vec(),
            )
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
            if libc::chroot(chroot_c.as_ptr()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::chdir(root_c.as_ptr()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            // CAP_MAC_ADMIN stays in the permitted set so label-aware
            // modules can write labels the host policy does not know.
            if libc::dup2(args_fd, ARGS_FD) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::dup2(result_fd, RESULT_FD) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    #[cfg(not(target_os = "linux"))]
    let _ = (&chroot_dir, args_fd, result_fd, privileged);

    let mut child = command
        .spawn()
        .map_err(|e| BuildError::sandbox_setup(format!("spawning {}: {e}", spec.module_name)))?;
    drop(result_write);
    drop(args_file);

    // Forward captured output as log events.
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stderr_tail = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));
    let mut io_tasks = Vec::new();
    if let Some(stdout) = stdout {
        let monitor = monitor.clone();
        io_tasks.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                monitor.record(BuildEvent::Message(MessageRecord {
                    origin: EventOrigin::Module,
                    text: line,
                }));
            }
        }));
    }
    if let Some(stderr) = stderr {
        let monitor = monitor.clone();
        let tail = stderr_tail.clone();
        io_tasks.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut tail = tail.lock();
                if tail.len() >= 32 {
                    tail.remove(0);
                }
                tail.push(line.clone());
                drop(tail);
                monitor.record(BuildEvent::Message(MessageRecord {
                    origin: EventOrigin::Module,
                    text: line,
                }));
            }
        }));
    }

    let status = match spec.timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => status,
            Err(_elapsed) => {
                child.kill().await.ok();
                child.wait().await.ok();
                return Err(BuildError::ModuleTimeout(format!(
                    "{} exceeded {}s",
                    spec.module_name,
                    limit.as_secs()
                )));
            }
        },
        None => child.wait().await,
    }
    .map_err(|e| BuildError::sandbox_setup(format!("waiting for {}: {e}", spec.module_name)))?;

    for task in io_tasks {
        task.await.ok();
    }

    if !status.success() {
        let code = status.code().unwrap_or(-1);
        let message = stderr_tail.lock().join("\n");
        return Err(BuildError::ModuleExit {
            module: spec.module_name.clone(),
            code,
            message,
        });
    }

    // The module closed fd 4 on exit; read its result document.
    let metadata = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
        let mut bytes = Vec::new();
        let mut stream = result_read;
        stream.read_to_end(&mut bytes)?;
        Ok(bytes)
    })
    .await
    .map_err(|e| BuildError::internal(format!("result reader: {e}")))?
    .map_err(|e| BuildError::protocol(format!("reading module result: {e}")))?;

    if metadata.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&metadata).map_err(|e| {
        BuildError::protocol(format!("{}: malformed result: {e}", spec.module_name))
    })
}

/// Linux mount plumbing.
#[cfg(target_os = "linux")]
mod linux {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    use imageforge_domain::{BuildError, BuildResult};

    use super::NodeKind;

    fn cstring(path: &Path) -> BuildResult<CString> {
        CString::new(path.as_os_str().as_bytes())
            .map_err(|_| BuildError::sandbox_setup(format!("bad path {}", path.display())))
    }

    pub fn make_node(path: &Path, kind: NodeKind, major: u64, minor: u64) -> BuildResult<()> {
        let cpath = cstring(path)?;
        let mode = match kind {
            NodeKind::Char => libc::S_IFCHR,
            NodeKind::Block => libc::S_IFBLK,
        };
        let dev = libc::makedev(major as libc::c_uint, minor as libc::c_uint);
        // SAFETY: cpath outlives the call; mknod has no other preconditions.
        let rc = unsafe { libc::mknod(cpath.as_ptr(), mode | 0o666, dev) };
        if rc != 0 {
            return Err(BuildError::sandbox_setup(format!(
                "mknod {}: {}",
                path.display(),
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    pub fn mount_bind(source: &Path, target: &Path) -> BuildResult<()> {
        let source_c = cstring(source)?;
        let target_c = cstring(target)?;
        // SAFETY: both strings outlive the call.
        let rc = unsafe {
            libc::mount(
                source_c.as_ptr(),
                target_c.as_ptr(),
                std::ptr::null(),
                libc::MS_BIND | libc::MS_REC,
                std::ptr::null(),
            )
        };
        if rc != 0 {
            return Err(BuildError::sandbox_setup(format!(
                "bind {} -> {}: {}",
                source.display(),
                target.display(),
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    pub fn remount_readonly(target: &Path) -> BuildResult<()> {
        let target_c = cstring(target)?;
        // SAFETY: string outlives the call.
        let rc = unsafe {
            libc::mount(
                std::ptr::null(),
                target_c.as_ptr(),
                std::ptr::null(),
                libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY,
                std::ptr::null(),
            )
        };
        if rc != 0 {
            return Err(BuildError::sandbox_setup(format!(
                "remount ro {}: {}",
                target.display(),
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    pub fn mount_fs(fstype: &str, source: &str, target: &Path, flags: libc::c_ulong) -> BuildResult<()> {
        let source_c = CString::new(source).expect("static source");
        let fstype_c = CString::new(fstype).expect("static fstype");
        let target_c = cstring(target)?;
        // SAFETY: all strings outlive the call.
        let rc = unsafe {
            libc::mount(
                source_c.as_ptr(),
                target_c.as_ptr(),
                fstype_c.as_ptr(),
                flags,
                std::ptr::null(),
            )
        };
        if rc != 0 {
            return Err(BuildError::sandbox_setup(format!(
                "mount {fstype} on {}: {}",
                target.display(),
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    pub fn unmount(target: &Path) -> BuildResult<()> {
        let target_c = cstring(target)?;
        // SAFETY: string outlives the call.
        let rc = unsafe { libc::umount2(target_c.as_ptr(), libc::MNT_DETACH) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            // Already gone is fine.
            if err.raw_os_error() == Some(libc::EINVAL) || err.raw_os_error() == Some(libc::ENOENT)
            {
                return Ok(());
            }
            return Err(BuildError::MountFailed(format!(
                "umount {}: {err}",
                target.display()
            )));
        }
        Ok(())
    }
}
