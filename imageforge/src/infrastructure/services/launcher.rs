// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Helper Launch & Entry
//!
//! Engine side: [`spawn_helper`] re-executes the current binary with the
//! hidden `host-service <role>` subcommand, handing it the startup blob on
//! fd 3 and the framed message channel on fd 4.
//!
//! Helper side: [`helper_main`] reads the blob, builds the service for its
//! role, and runs the serve loop until the close request.

use serde_json::Value;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::process::Stdio;
use std::sync::Arc;

use imageforge_domain::events::build_event::{EventOrigin, MessageRecord};
use imageforge_domain::{BuildError, BuildEvent, BuildResult, Monitor};

use crate::infrastructure::ipc::{
    serve_loop, EventPayload, HostService, MessageChannel, ServiceClient,
};

use super::{devices, inputs, mounts, role, sources};

/// Startup blob fd in the helper.
const STARTUP_FD: i32 = 3;
/// Message channel fd in the helper.
const CHANNEL_FD: i32 = 4;

/// Spawns one helper process for `service_role`, wiring its fds and
/// returning the connected client. Events the helper emits are forwarded
/// to `monitor` as host-service messages.
pub async fn spawn_helper(
    service_role: &str,
    startup: &Value,
    monitor: Arc<dyn Monitor>,
) -> BuildResult<ServiceClient> {
    let exe = std::env::current_exe()
        .map_err(|e| BuildError::internal(format!("resolving engine binary: {e}")))?;

    let (engine_sock, helper_sock) = std::os::unix::net::UnixStream::pair()
        .map_err(|e| BuildError::internal(format!("socketpair: {e}")))?;
    let (blob_read, mut blob_write) = std::os::unix::net::UnixStream::pair()
        .map_err(|e| BuildError::internal(format!("blob pipe: {e}")))?;

    let helper_fd = helper_sock.as_raw_fd();
    let blob_fd = blob_read.as_raw_fd();

    let mut command = tokio::process::Command::new(exe);
    command
        .arg("host-service")
        .arg(service_role)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit());
    // SAFETY: dup2 is async-signal-safe; the source fds stay open in the
    // parent until after spawn returns.
    unsafe {
        command.pre_exec(move || {
            if libc::dup2(blob_fd, STARTUP_FD) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::dup2(helper_fd, CHANNEL_FD) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command
        .spawn()
        .map_err(|e| BuildError::internal(format!("spawning {service_role}: {e}")))?;
    drop(helper_sock);
    drop(blob_read);

    // The blob is small; the socket buffer absorbs it without blocking.
    let bytes = serde_json::to_vec(startup)
        .map_err(|e| BuildError::internal(format!("startup blob: {e}")))?;
    blob_write
        .write_all(&bytes)
        .map_err(|e| BuildError::protocol(format!("{service_role}: writing startup blob: {e}")))?;
    drop(blob_write);

    engine_sock
        .set_nonblocking(true)
        .map_err(|e| BuildError::internal(format!("socket setup: {e}")))?;
    let stream = tokio::net::UnixStream::from_std(engine_sock)
        .map_err(|e| BuildError::internal(format!("socket setup: {e}")))?;

    Ok(ServiceClient::new(service_role, MessageChannel::new(stream))
        .with_child(child)
        .with_event_handler(move |name, payload| match payload {
            EventPayload::Message { text } => {
                monitor.record(BuildEvent::Message(MessageRecord {
                    origin: EventOrigin::HostService,
                    text: format!("{name}: {text}"),
                }));
            }
            EventPayload::Progress { done, total } => {
                tracing::debug!(service = %name, done, total, "transfer progress");
            }
        }))
}

/// Entry point of the hidden `host-service` subcommand.
pub async fn helper_main(service_role: &str) -> BuildResult<()> {
    // SAFETY: fds 3 and 4 are established by the launcher before exec and
    // owned by nobody else in this process.
    let mut blob_file = unsafe { std::fs::File::from_raw_fd(STARTUP_FD) };
    let mut blob = Vec::new();
    blob_file
        .read_to_end(&mut blob)
        .map_err(|e| BuildError::protocol(format!("reading startup blob: {e}")))?;
    drop(blob_file);
    let startup: Value = serde_json::from_slice(&blob)
        .map_err(|e| BuildError::protocol(format!("malformed startup blob: {e}")))?;

    let std_sock = unsafe { std::os::unix::net::UnixStream::from_raw_fd(CHANNEL_FD) };
    std_sock
        .set_nonblocking(true)
        .map_err(|e| BuildError::protocol(format!("channel setup: {e}")))?;
    let stream = tokio::net::UnixStream::from_std(std_sock)
        .map_err(|e| BuildError::protocol(format!("channel setup: {e}")))?;
    let channel = MessageChannel::new(stream);

    let mut service = build_service(service_role, &startup)?;
    serve_loop(channel, service.as_mut()).await
}

fn build_service(service_role: &str, startup: &Value) -> BuildResult<Box<dyn HostService>> {
    match service_role {
        role::SOURCE_DOWNLOAD => Ok(Box::new(sources::DownloadService::from_startup(startup)?)),
        role::SOURCE_INLINE => Ok(Box::new(sources::InlineService::from_startup(startup)?)),
        role::SOURCE_LOCAL => Ok(Box::new(sources::LocalService::from_startup(startup)?)),
        role::DEVICE_LOOPBACK => Ok(Box::new(devices::LoopbackService::new())),
        role::DEVICE_LVM2 => Ok(Box::new(devices::Lvm2Service::new())),
        role::DEVICE_LUKS2 => Ok(Box::new(devices::Luks2Service::new())),
        role::MOUNT => Ok(Box::new(mounts::MountService::new())),
        role::INPUT => Ok(Box::new(inputs::InputService::from_startup(startup)?)),
        other => Err(BuildError::protocol(format!(
            "unknown host-service role {other:?}"
        ))),
    }
}
