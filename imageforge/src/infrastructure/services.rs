// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Host Services
//!
//! Helper processes owning one ephemeral resource each on behalf of a
//! stage: fetched sources, opened block devices, staged mounts, prepared
//! inputs. Every helper is this same binary re-executed with the hidden
//! `host-service` subcommand, speaking the framed protocol over fd 4 after
//! reading its startup blob from fd 3.
//!
//! The [`ServiceManager`] tracks helpers in registration order and stops
//! them strictly in reverse — mounts before the devices under them, child
//! devices before their parents, inputs last — on success and failure
//! alike. A helper that ignores its close request past the grace period is
//! killed; the manager always waits for exit, so a stage never leaks a
//! helper.

pub mod devices;
pub mod inputs;
pub mod launcher;
pub mod mounts;
pub mod registry;
pub mod sources;

use std::time::Duration;

use imageforge_domain::{BuildError, BuildResult};

use super::ipc::ServiceClient;

pub use launcher::{helper_main, spawn_helper};
pub use registry::scan_module_registry;

/// Helper roles, as passed to the hidden subcommand.
pub mod role {
    pub const SOURCE_DOWNLOAD: &str = "source.download";
    pub const SOURCE_INLINE: &str = "source.inline";
    pub const SOURCE_LOCAL: &str = "source.local";
    pub const DEVICE_LOOPBACK: &str = "device.loopback";
    pub const DEVICE_LVM2: &str = "device.lvm2.lv";
    pub const DEVICE_LUKS2: &str = "device.luks2";
    pub const MOUNT: &str = "mount";
    pub const INPUT: &str = "input";
}

/// Registration-ordered collection of live helpers for one stage.
pub struct ServiceManager {
    services: Vec<ServiceClient>,
    grace: Duration,
}

impl ServiceManager {
    pub fn new(grace: Duration) -> Self {
        Self {
            services: Vec::new(),
            grace,
        }
    }

    /// Registers a started helper; position defines teardown order.
    pub fn register(&mut self, client: ServiceClient) -> usize {
        self.services.push(client);
        self.services.len() - 1
    }

    /// Mutable access for issuing calls to a registered helper.
    pub fn get_mut(&mut self, index: usize) -> BuildResult<&mut ServiceClient> {
        self.services
            .get_mut(index)
            .ok_or_else(|| BuildError::internal(format!("no service at index {index}")))
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Stops every helper in reverse registration order, waiting for each
    /// to exit. The first error is reported; teardown still continues
    /// through the rest.
    pub async fn stop_all(&mut self) -> BuildResult<()> {
        let mut first_error = None;
        while let Some(client) = self.services.pop() {
            let name = client.name().to_owned();
            if let Err(e) = client.close(self.grace).await {
                tracing::warn!(service = %name, error = %e, "service close failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}
