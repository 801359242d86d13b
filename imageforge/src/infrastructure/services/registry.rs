// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Module Registry Scan
//!
//! Builds the resolver's [`ModuleRegistry`] from the module search path:
//! every executable file whose name looks like a module name becomes a
//! registered stage module. Source kinds are registered for the helpers
//! this engine ships (download, inline, local). Earlier search-path
//! entries shadow later ones, matching resolution order at spawn time.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use imageforge_domain::ModuleRegistry;

/// Source kinds with built-in helpers.
pub const BUILTIN_SOURCE_KINDS: [&str; 3] = [
    "org.imageforge.download",
    "org.imageforge.inline",
    "org.imageforge.local",
];

/// Scans `module_path` and registers everything executable, plus the
/// built-in source kinds.
pub fn scan_module_registry(module_path: &[PathBuf]) -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    for kind in BUILTIN_SOURCE_KINDS {
        registry.register_source(kind);
    }
    for dir in module_path {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if is_executable_file(&path) {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    registry.register_stage(name);
                }
            }
        }
    }
    registry
}

/// Resolves a module name against the search path, first hit wins.
pub fn resolve_module(module_path: &[PathBuf], name: &str) -> Option<PathBuf> {
    // Module names never carry directory components.
    if name.contains('/') {
        return None;
    }
    module_path
        .iter()
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable_file(candidate))
}

fn is_executable_file(path: &Path) -> bool {
    match path.metadata() {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}
