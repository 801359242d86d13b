// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Object Store Port
//!
//! Contract for the content-addressed object store (§ persisted state).
//! Committed objects are immutable trees keyed by fingerprint id; mutable
//! workspaces exist only between `new_workspace` and `commit`/`discard`.
//!
//! ## Lifecycle
//!
//! ```text
//! new_workspace(id) ──▶ populate ──▶ commit(ws, id, meta) ──▶ objects/<id>  (frozen)
//!                          │
//!                          └──────▶ discard(ws)             (tree removed)
//! ```
//!
//! Commit is idempotent: when `objects/<id>` already exists the workspace
//! is discarded and the existing object wins — equal ids mean equal trees.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::error::build_error::BuildResult;
use crate::value_objects::object_id::ObjectId;

/// A mutable tree under the store's `tmp/` directory, exclusively owned by
/// its creator until committed or discarded.
#[derive(Debug)]
pub struct Workspace {
    id: ObjectId,
    path: PathBuf,
}

impl Workspace {
    pub fn new(id: ObjectId, path: PathBuf) -> Self {
        Self { id, path }
    }

    /// The id this workspace will commit under.
    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    /// Root of the mutable tree.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The tree subdirectory modules mutate; metadata lives beside it.
    pub fn tree(&self) -> PathBuf {
        self.path.join("tree")
    }
}

/// Content-addressed storage of built trees.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Whether `objects/<id>` exists.
    async fn contains(&self, id: &ObjectId) -> bool;

    /// Opens a fresh mutable workspace for `id`.
    ///
    /// # Errors
    ///
    /// `store-busy` when a live workspace for the same id exists;
    /// `store-io` on filesystem failure.
    async fn new_workspace(&self, id: &ObjectId) -> BuildResult<Workspace>;

    /// Commits a workspace: fsync, atomic rename into `objects/<id>`,
    /// freeze read-only, persist `meta`. Returns the committed tree path.
    /// Idempotent when the object already exists.
    async fn commit(&self, workspace: Workspace, meta: Value) -> BuildResult<PathBuf>;

    /// Removes an uncommitted workspace.
    async fn discard(&self, workspace: Workspace) -> BuildResult<()>;

    /// Read-only snapshot path of a committed object's tree, or `None`.
    ///
    /// # Errors
    ///
    /// `store-corrupt` when the object's recorded id disagrees with its
    /// directory name.
    async fn lookup(&self, id: &ObjectId) -> BuildResult<Option<PathBuf>>;

    /// Metadata stored at commit time, or `None` when the object is absent.
    async fn read_meta(&self, id: &ObjectId) -> BuildResult<Option<Value>>;

    /// Adds a symbolic reference under `refs/<name>`, pinning the object.
    async fn checkpoint(&self, id: &ObjectId, name: &str) -> BuildResult<()>;

    /// Copies the committed tree of `id` into `dest`, creating it.
    async fn export(&self, id: &ObjectId, dest: &Path) -> BuildResult<PathBuf>;

    /// Deletes `tmp/` entries older than the engine's start; returns how
    /// many were removed. Never touches `objects/`.
    async fn reclaim(&self) -> BuildResult<usize>;
}
