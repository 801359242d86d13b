// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Common Test Helpers
//!
//! Shared utilities for integration tests: a stage runner that commits
//! stamp trees instead of invoking modules, a shared-buffer writer for
//! capturing the JSON-seq stream, and manifest shorthands.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::io::Write;
use std::sync::Arc;
use std::time::SystemTime;

use imageforge::infrastructure::stores::FsObjectStore;
use imageforge::{BuildResult, Manifest, ModuleRegistry, ResolvedManifest, Resolver};
use imageforge_domain::repositories::stage_runner::{StageRun, StageRunner};
use imageforge_domain::BuildError;

/// Registry covering the module names the test manifests use.
pub fn test_registry() -> ModuleRegistry {
    ModuleRegistry::new()
        .with_stage("org.imageforge.noop")
        .with_stage("org.imageforge.copy")
        .with_stage("org.imageforge.fail")
        .with_source("org.imageforge.inline")
        .with_source("org.imageforge.download")
}

/// Parses and resolves a manifest against the test registry.
pub fn resolve(text: &str) -> ResolvedManifest {
    let manifest = Manifest::from_json(text).expect("manifest parses");
    Resolver::resolve(&manifest, &test_registry()).expect("manifest resolves")
}

/// Opens a store rooted in a temp directory.
pub fn open_store(dir: &std::path::Path) -> Arc<FsObjectStore> {
    Arc::new(FsObjectStore::open(dir, SystemTime::now()).expect("store opens"))
}

/// A stage runner that writes a stamp file and commits, recording every
/// invocation; `org.imageforge.fail` stages fail with `module-exit`.
pub struct StampRunner {
    pub store: Arc<FsObjectStore>,
    pub calls: Mutex<Vec<String>>,
}

impl StampRunner {
    pub fn new(store: Arc<FsObjectStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl StageRunner for StampRunner {
    async fn run(&self, request: StageRun<'_>) -> BuildResult<Value> {
        use imageforge_domain::repositories::object_store::ObjectStore;

        self.calls.lock().push(request.stage.module.clone());
        if request.stage.module == "org.imageforge.fail" {
            return Err(BuildError::ModuleExit {
                module: request.stage.module.clone(),
                code: 1,
                message: "synthetic failure".into(),
            });
        }
        let workspace = self.store.new_workspace(&request.stage.id).await?;
        std::fs::write(workspace.tree().join("stamp"), request.stage.id.as_str())
            .map_err(|e| BuildError::store_io(e.to_string()))?;
        self.store
            .commit(workspace, json!({ "module": request.stage.module }))
            .await?;
        Ok(json!({ "module": request.stage.module }))
    }
}

/// `Write` into a shared buffer, for capturing the JSON-seq stream.
#[derive(Clone, Default)]
pub struct SharedBuf(pub Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    /// Parses the RS-delimited records back into JSON values.
    pub fn records(&self) -> Vec<Value> {
        self.contents()
            .split(|&b| b == 0x1E)
            .filter(|chunk| !chunk.is_empty())
            .map(|chunk| serde_json::from_slice(chunk).expect("record parses"))
            .collect()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
