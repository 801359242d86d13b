// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Inspect Use Case
//!
//! Validates a manifest and prints the fully resolved plan — every
//! pipeline and stage with its computed id — without building anything.
//! Inspection is deterministic: the same manifest always prints the same
//! ids, so the output is a fixed point suitable for diffing and for
//! pinning expected ids in CI.

use serde_json::Value;

use imageforge_domain::{BuildResult, Manifest, ModuleRegistry, Resolver};

/// Resolves and renders a manifest without executing it.
pub struct InspectUseCase {
    registry: ModuleRegistry,
}

impl InspectUseCase {
    pub fn new(registry: ModuleRegistry) -> Self {
        Self { registry }
    }

    /// Returns the resolved plan as a JSON document.
    pub fn execute(&self, manifest_text: &str) -> BuildResult<Value> {
        let manifest = Manifest::from_json(manifest_text)?;
        let plan = Resolver::resolve(&manifest, &self.registry)?;
        serde_json::to_value(&plan)
            .map_err(|e| imageforge_domain::BuildError::internal(format!("rendering plan: {e}")))
    }
}
