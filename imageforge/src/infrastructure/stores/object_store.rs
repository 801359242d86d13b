// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Filesystem Object Store
//!
//! Content-addressed storage of committed trees under a configurable root:
//!
//! ```text
//! <root>/
//!   objects/<id>/          committed objects, frozen after commit
//!     tree/                the object's filesystem tree
//!     meta.json            { id, meta } written at commit
//!   refs/<name>            symbolic references (checkpoints, exports)
//!   tmp/<id>/              in-progress workspaces
//!   sources/<kind>/        per-kind source caches (see source_cache)
//!   stage/<id>/            captured per-stage metadata and logs
//! ```
//!
//! ## Guarantees
//!
//! - **Atomic commit** — a workspace becomes an object by a single
//!   `rename(2)`; readers either see the whole frozen object or nothing.
//! - **Idempotence** — committing an id that already exists discards the
//!   workspace and reuses the object; equal ids mean equal trees.
//! - **Immutability** — committed trees are frozen (write bits dropped,
//!   immutable attribute where permitted) and are never rolled back.
//! - **Exclusivity** — at most one live workspace per id, enforced both
//!   in-process and by the `tmp/<id>` directory itself.
//! - **Safe reclaim** — only `tmp/` entries older than the engine's start
//!   are removed; `objects/` is never touched.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use imageforge_domain::repositories::object_store::{ObjectStore, Workspace};
use imageforge_domain::{BuildError, BuildResult, ObjectId};

use super::fs_util;

/// Filesystem-backed implementation of the [`ObjectStore`] port.
pub struct FsObjectStore {
    root: PathBuf,
    /// Reclaim cutoff: `tmp/` entries modified before this are orphans.
    started_at: SystemTime,
    /// Ids with a live workspace in this process.
    live: Mutex<HashSet<ObjectId>>,
}

impl FsObjectStore {
    /// Opens (creating if necessary) a store rooted at `root`.
    ///
    /// `started_at` is the engine's process start time; `reclaim` uses it
    /// as the orphan cutoff so concurrent engines never steal each other's
    /// live workspaces.
    pub fn open(root: impl Into<PathBuf>, started_at: SystemTime) -> BuildResult<Self> {
        let root = root.into();
        for sub in ["objects", "refs", "tmp", "sources", "stage"] {
            std::fs::create_dir_all(root.join(sub))
                .map_err(|e| BuildError::store_io(format!("creating {sub}: {e}")))?;
        }
        Ok(Self {
            root,
            started_at,
            live: Mutex::new(HashSet::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_dir(&self, id: &ObjectId) -> PathBuf {
        self.root.join("objects").join(id.as_str())
    }

    fn tmp_dir(&self, id: &ObjectId) -> PathBuf {
        self.root.join("tmp").join(id.as_str())
    }

    fn ref_path(&self, name: &str) -> PathBuf {
        self.root.join("refs").join(name)
    }

    /// Per-stage metadata directory (module output, captured logs).
    pub fn stage_dir(&self, id: &ObjectId) -> PathBuf {
        self.root.join("stage").join(id.as_str())
    }

    /// Resolves a symbolic reference back to an object id.
    pub fn read_ref(&self, name: &str) -> BuildResult<Option<ObjectId>> {
        let path = self.ref_path(name);
        match std::fs::read_link(&path) {
            Ok(target) => {
                let file = target
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| BuildError::StoreCorrupt(format!("ref {name} malformed")))?;
                let id = ObjectId::from_string(file)
                    .map_err(|_| BuildError::StoreCorrupt(format!("ref {name} malformed")))?;
                Ok(Some(id))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BuildError::store_io(format!("reading ref {name}: {e}"))),
        }
    }

    fn validate_ref_name(name: &str) -> BuildResult<()> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(BuildError::manifest_invalid(format!(
                "invalid reference name {name:?}"
            )));
        }
        Ok(())
    }

    async fn blocking<T, F>(task: F) -> BuildResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> std::io::Result<T> + Send + 'static,
    {
        tokio::task::spawn_blocking(task)
            .await
            .map_err(|e| BuildError::internal(format!("store task: {e}")))?
            .map_err(|e| BuildError::store_io(e.to_string()))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn contains(&self, id: &ObjectId) -> bool {
        self.object_dir(id).is_dir()
    }

    async fn new_workspace(&self, id: &ObjectId) -> BuildResult<Workspace> {
        {
            let mut live = self.live.lock();
            if !live.insert(id.clone()) {
                return Err(BuildError::StoreBusy(format!(
                    "workspace for {} already open in this engine",
                    id.short()
                )));
            }
        }
        let dir = self.tmp_dir(id);
        if dir.exists() {
            self.live.lock().remove(id);
            return Err(BuildError::StoreBusy(format!(
                "workspace {} already exists (another engine, or reclaim pending)",
                id.short()
            )));
        }
        let tree = dir.join("tree");
        if let Err(e) = std::fs::create_dir_all(&tree) {
            self.live.lock().remove(id);
            return Err(BuildError::store_io(format!(
                "creating workspace {}: {e}",
                id.short()
            )));
        }
        Ok(Workspace::new(id.clone(), dir))
    }

    async fn commit(&self, workspace: Workspace, meta: Value) -> BuildResult<PathBuf> {
        let id = workspace.id().clone();
        let src = workspace.path().to_path_buf();
        let dst = self.object_dir(&id);

        let result = Self::blocking({
            let id = id.clone();
            let dst = dst.clone();
            move || {
                if dst.exists() {
                    // Equal ids mean equal trees; keep the existing object.
                    fs_util::remove_tree(&src)?;
                    return Ok(dst);
                }
                let meta_doc = json!({
                    "id": id.as_str(),
                    "created": chrono::Utc::now().to_rfc3339(),
                    "meta": meta,
                });
                std::fs::write(
                    src.join("meta.json"),
                    serde_json::to_vec_pretty(&meta_doc).expect("meta serialization"),
                )?;
                fs_util::freeze_tree(&src)?;
                match std::fs::rename(&src, &dst) {
                    Ok(()) => {}
                    Err(_) if dst.exists() => {
                        // Lost a race with another engine; theirs wins.
                        fs_util::remove_tree(&src)?;
                    }
                    Err(e) => return Err(e),
                }
                Ok(dst)
            }
        })
        .await;

        self.live.lock().remove(&id);
        result.map(|dir| dir.join("tree"))
    }

    async fn discard(&self, workspace: Workspace) -> BuildResult<()> {
        let id = workspace.id().clone();
        let path = workspace.path().to_path_buf();
        let result = Self::blocking(move || fs_util::remove_tree(&path)).await;
        self.live.lock().remove(&id);
        result
    }

    async fn lookup(&self, id: &ObjectId) -> BuildResult<Option<PathBuf>> {
        let dir = self.object_dir(id);
        if !dir.is_dir() {
            return Ok(None);
        }
        let meta_path = dir.join("meta.json");
        let text = std::fs::read_to_string(&meta_path)
            .map_err(|e| BuildError::StoreCorrupt(format!("{}: missing meta: {e}", id.short())))?;
        let doc: Value = serde_json::from_str(&text)
            .map_err(|e| BuildError::StoreCorrupt(format!("{}: bad meta: {e}", id.short())))?;
        match doc.get("id").and_then(Value::as_str) {
            Some(recorded) if recorded == id.as_str() => Ok(Some(dir.join("tree"))),
            Some(recorded) => Err(BuildError::StoreCorrupt(format!(
                "object {} records id {}",
                id.short(),
                &recorded[..recorded.len().min(8)]
            ))),
            None => Err(BuildError::StoreCorrupt(format!(
                "object {} has no recorded id",
                id.short()
            ))),
        }
    }

    async fn read_meta(&self, id: &ObjectId) -> BuildResult<Option<Value>> {
        let dir = self.object_dir(id);
        if !dir.is_dir() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(dir.join("meta.json"))
            .map_err(|e| BuildError::StoreCorrupt(format!("{}: missing meta: {e}", id.short())))?;
        let mut doc: Value = serde_json::from_str(&text)
            .map_err(|e| BuildError::StoreCorrupt(format!("{}: bad meta: {e}", id.short())))?;
        Ok(Some(doc.get_mut("meta").map(Value::take).unwrap_or(Value::Null)))
    }

    async fn checkpoint(&self, id: &ObjectId, name: &str) -> BuildResult<()> {
        Self::validate_ref_name(name)?;
        if !self.contains(id).await {
            return Err(BuildError::store_io(format!(
                "cannot checkpoint {}: object not committed",
                id.short()
            )));
        }
        let link = self.ref_path(name);
        let target = Path::new("../objects").join(id.as_str());
        if link.symlink_metadata().is_ok() {
            std::fs::remove_file(&link)
                .map_err(|e| BuildError::store_io(format!("replacing ref {name}: {e}")))?;
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(&target, &link)
            .map_err(|e| BuildError::store_io(format!("writing ref {name}: {e}")))?;
        Ok(())
    }

    async fn export(&self, id: &ObjectId, dest: &Path) -> BuildResult<PathBuf> {
        let tree = self.lookup(id).await?.ok_or_else(|| {
            BuildError::store_io(format!("cannot export {}: object not committed", id.short()))
        })?;
        let dest = dest.to_path_buf();
        Self::blocking({
            let dest = dest.clone();
            move || {
                // Re-exports replace the destination wholesale; the copied
                // trees carry read-only modes from the freeze.
                fs_util::remove_tree(&dest)?;
                std::fs::create_dir_all(&dest)?;
                fs_util::copy_tree(&tree, &dest)?;
                Ok(dest)
            }
        })
        .await
    }

    async fn reclaim(&self) -> BuildResult<usize> {
        let tmp = self.root.join("tmp");
        let cutoff = self.started_at;
        let live: HashSet<ObjectId> = self.live.lock().clone();
        Self::blocking(move || {
            let mut removed = 0;
            for entry in std::fs::read_dir(&tmp)? {
                let entry = entry?;
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(id) = ObjectId::from_string(name) {
                        if live.contains(&id) {
                            continue;
                        }
                    }
                }
                let modified = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                if modified < cutoff {
                    fs_util::remove_tree(&entry.path())?;
                    removed += 1;
                }
            }
            Ok(removed)
        })
        .await
    }
}
