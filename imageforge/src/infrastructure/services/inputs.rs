// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Input Service
//!
//! One helper per declared input, turning a resolved origin into a
//! ready-to-mount read-only path:
//!
//! - **`org.imageforge.files`** — a directory of cached source blobs, one
//!   entry per checksum (hardlinked where possible, copied otherwise),
//!   plus a `data.json` manifest the module can enumerate.
//! - **`org.imageforge.tree`** — the committed tree of another pipeline,
//!   optionally narrowed to a subpath. The tree is served in place; the
//!   runner bind-mounts it read-only into the sandbox.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::path::{Component, Path, PathBuf};

use imageforge_domain::{BuildError, BuildResult};

use crate::infrastructure::ipc::{EventSender, HostService};

/// Prepares declared inputs under one destination root.
pub struct InputService {
    dest_root: PathBuf,
}

impl InputService {
    pub fn from_startup(startup: &Value) -> BuildResult<Self> {
        let dest_root = startup
            .get("dest_root")
            .and_then(Value::as_str)
            .ok_or_else(|| BuildError::protocol("input service needs dest_root".to_owned()))?;
        Ok(Self {
            dest_root: PathBuf::from(dest_root),
        })
    }

    fn map_files(&self, name: &str, files: &[Value]) -> BuildResult<Value> {
        let dir = self.dest_root.join(name);
        std::fs::create_dir_all(&dir)
            .map_err(|e| BuildError::store_io(format!("creating {}: {e}", dir.display())))?;

        let mut manifest = Map::new();
        for file in files {
            let checksum = file
                .get("checksum")
                .and_then(Value::as_str)
                .ok_or_else(|| BuildError::protocol("file entry without checksum".to_owned()))?;
            let source = file
                .get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| BuildError::protocol("file entry without path".to_owned()))?;
            let dest = dir.join(checksum);
            if !dest.exists() {
                // Hardlink when cache and inputs share a filesystem.
                if std::fs::hard_link(source, &dest).is_err() {
                    std::fs::copy(source, &dest).map_err(|e| {
                        BuildError::store_io(format!("copying {source}: {e}"))
                    })?;
                }
            }
            manifest.insert(checksum.to_owned(), json!({}));
        }

        let data = json!({ "files": Value::Object(manifest) });
        std::fs::write(
            dir.join("data.json"),
            serde_json::to_vec_pretty(&data).expect("manifest serialization"),
        )
        .map_err(|e| BuildError::store_io(format!("writing input manifest: {e}")))?;
        Ok(json!({ "path": dir }))
    }

    fn map_tree(&self, tree: &Value) -> BuildResult<Value> {
        let base = tree
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| BuildError::protocol("tree entry without path".to_owned()))?;
        let mut path = PathBuf::from(base);
        if let Some(subpath) = tree.get("subpath").and_then(Value::as_str) {
            let relative = sanitize_subpath(subpath)?;
            path = path.join(relative);
        }
        if !path.exists() {
            return Err(BuildError::store_io(format!(
                "input tree {} does not exist",
                path.display()
            )));
        }
        Ok(json!({ "path": path }))
    }
}

/// Rejects absolute and parent-escaping subpaths.
fn sanitize_subpath(subpath: &str) -> BuildResult<PathBuf> {
    let path = Path::new(subpath);
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => {
                return Err(BuildError::manifest_invalid(format!(
                    "invalid input subpath {subpath:?}"
                )));
            }
        }
    }
    Ok(clean)
}

#[async_trait]
impl HostService for InputService {
    async fn dispatch(
        &mut self,
        method: &str,
        args: Value,
        _events: &EventSender,
    ) -> BuildResult<Value> {
        match method {
            "map" => {
                let name = args
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| BuildError::protocol("map needs a name".to_owned()))?;
                let origin = args.get("origin").cloned().unwrap_or(Value::Null);
                if let Some(files) = origin.get("files").and_then(Value::as_array) {
                    self.map_files(name, files)
                } else if let Some(tree) = origin.get("tree") {
                    self.map_tree(tree)
                } else {
                    Err(BuildError::protocol("map origin must be files or tree".to_owned()))
                }
            }
            other => Err(BuildError::protocol(format!("unknown method {other:?}"))),
        }
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
    async fn test_map_files_builds_directory_and_manifest() {
        let cache = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let blob = cache.path().join("sha256:aa");
        std::fs::write(&blob, b"content").unwrap();

        let mut service = InputService {
            dest_root: dest.path().to_path_buf(),
        };
        let reply = service
            .dispatch(
                "map",
                json!({
                    "name": "packages",
                    "origin": { "files": [ { "checksum": "sha256:aa", "path": blob } ] },
                }),
                &events(),
            )
            .await
            .unwrap();

        let mapped = PathBuf::from(reply["path"].as_str().unwrap());
        assert_eq!(std::fs::read(mapped.join("sha256:aa")).unwrap(), b"content");
        let data: Value =
            serde_json::from_slice(&std::fs::read(mapped.join("data.json")).unwrap()).unwrap();
        assert!(data["files"].get("sha256:aa").is_some());
    }

    #[tokio::test]
    async fn test_map_tree_applies_subpath() {
        let object = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(object.path().join("boot")).unwrap();

        let mut service = InputService {
            dest_root: PathBuf::from("/unused"),
        };
        let reply = service
            .dispatch(
                "map",
                json!({
                    "name": "rootfs",
                    "origin": { "tree": { "path": object.path(), "subpath": "boot" } },
                }),
                &events(),
            )
            .await
            .unwrap();
        assert_eq!(
            reply["path"].as_str().unwrap(),
            object.path().join("boot").to_str().unwrap()
        );
    }

    #[tokio::test]
    async fn test_map_tree_rejects_escaping_subpath() {
        let object = tempfile::tempdir().unwrap();
        let mut service = InputService {
            dest_root: PathBuf::from("/unused"),
        };
        let err = service
            .dispatch(
                "map",
                json!({
                    "name": "rootfs",
                    "origin": { "tree": { "path": object.path(), "subpath": "../escape" } },
                }),
                &events(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "manifest-invalid");
    }
}
