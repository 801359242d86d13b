// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Source Cache
//!
//! Content-addressed cache of externally fetched blobs, one directory per
//! source kind under `<store>/sources/`. Every cached file is named by its
//! algorithm-prefixed checksum; partial downloads live in the kind's
//! `tmp/` subdirectory on the same filesystem and are renamed into place
//! only after verification, so the core invariant — a file's contents hash
//! to its name — holds at every instant.
//!
//! The coordinator fans fetches out through a [`SourceConnector`] with a
//! bounded worker pool per `ensure` call. Concurrent fetches of one
//! checksum coalesce on the rename: whoever finishes second finds the file
//! already present and succeeds without replacing it.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;

use imageforge_domain::repositories::source_store::SourceStore;
use imageforge_domain::{BuildError, BuildResult, Checksum};

/// Fetches one missing blob of one kind into the kind's cache directory.
///
/// The production connector routes through the kind's helper process; unit
/// tests substitute in-process fetchers. Postcondition on `Ok`: the blob
/// is present, verified, at its final path.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn fetch(
        &self,
        kind: &str,
        checksum: &Checksum,
        descriptor: &Value,
        cache_dir: &Path,
    ) -> BuildResult<()>;
}

/// Filesystem-backed implementation of the [`SourceStore`] port.
pub struct FsSourceCache {
    root: PathBuf,
    workers: usize,
    connector: Arc<dyn SourceConnector>,
}

impl FsSourceCache {
    /// `root` is the store's `sources/` directory; `workers` bounds the
    /// per-call fetch parallelism.
    pub fn new(root: impl Into<PathBuf>, workers: usize, connector: Arc<dyn SourceConnector>) -> Self {
        Self {
            root: root.into(),
            workers: workers.max(1),
            connector,
        }
    }

    fn kind_dir(&self, kind: &str) -> PathBuf {
        self.root.join(kind)
    }

    /// Evicts cached blobs, oldest first, until the cache fits
    /// `max_bytes`. Called opportunistically between stages; never touches
    /// `tmp/` entries (they belong to in-flight fetches).
    pub fn enforce_limit(&self, max_bytes: u64) -> BuildResult<u64> {
        let mut entries: Vec<(std::time::SystemTime, u64, PathBuf)> = Vec::new();
        let mut total = 0u64;
        let kinds = match std::fs::read_dir(&self.root) {
            Ok(kinds) => kinds,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(BuildError::store_io(format!("reading source cache: {e}"))),
        };
        for kind in kinds {
            let kind = kind.map_err(|e| BuildError::store_io(e.to_string()))?;
            if !kind.path().is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(kind.path())
                .map_err(|e| BuildError::store_io(e.to_string()))?
            {
                let entry = entry.map_err(|e| BuildError::store_io(e.to_string()))?;
                let meta = match entry.metadata() {
                    Ok(meta) if meta.is_file() => meta,
                    _ => continue,
                };
                let stamp = meta.modified().or_else(|_| meta.accessed()).unwrap_or(
                    std::time::SystemTime::UNIX_EPOCH,
                );
                total += meta.len();
                entries.push((stamp, meta.len(), entry.path()));
            }
        }
        if total <= max_bytes {
            return Ok(0);
        }
        entries.sort_by_key(|(stamp, _, _)| *stamp);
        let mut evicted = 0u64;
        for (_, len, path) in entries {
            if total <= max_bytes {
                break;
            }
            if std::fs::remove_file(&path).is_ok() {
                total -= len;
                evicted += len;
            }
        }
        Ok(evicted)
    }
}

#[async_trait]
impl SourceStore for FsSourceCache {
    async fn ensure(&self, kind: &str, entries: &BTreeMap<Checksum, Value>) -> BuildResult<()> {
        let dir = self.kind_dir(kind);
        std::fs::create_dir_all(dir.join("tmp"))
            .map_err(|e| BuildError::store_io(format!("creating cache for {kind}: {e}")))?;

        let missing: Vec<(&Checksum, &Value)> = entries
            .iter()
            .filter(|(checksum, _)| !dir.join(checksum.to_filename()).is_file())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut fetches = FuturesUnordered::new();
        for (checksum, descriptor) in missing {
            let semaphore = semaphore.clone();
            let connector = self.connector.clone();
            let dir = dir.clone();
            let kind = kind.to_owned();
            let checksum = checksum.clone();
            let descriptor = descriptor.clone();
            fetches.push(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| BuildError::internal(format!("fetch pool: {e}")))?;
                // A concurrent stage may have fetched it meanwhile.
                if dir.join(checksum.to_filename()).is_file() {
                    return Ok(());
                }
                connector.fetch(&kind, &checksum, &descriptor, &dir).await
            });
        }

        while let Some(outcome) = fetches.next().await {
            // First failure wins; remaining fetches are dropped with the
            // stream.
            outcome?;
        }
        Ok(())
    }

    async fn contains(&self, kind: &str, checksum: &Checksum) -> BuildResult<bool> {
        Ok(self.path_of(kind, checksum).is_file())
    }

    fn path_of(&self, kind: &str, checksum: &Checksum) -> PathBuf {
        self.kind_dir(kind).join(checksum.to_filename())
    }
}

/// Verifies `bytes` against `checksum` and places them in `cache_dir`
/// atomically. The shared placement path of every source service.
///
/// # Errors
///
/// `source-checksum` when the bytes do not hash to the declared checksum;
/// `store-io` on filesystem failure.
pub fn place_blob(cache_dir: &Path, checksum: &Checksum, bytes: &[u8]) -> BuildResult<PathBuf> {
    let final_path = cache_dir.join(checksum.to_filename());
    if final_path.is_file() {
        return Ok(final_path);
    }
    if !checksum.verify(bytes) {
        return Err(BuildError::source_checksum(format!(
            "downloaded bytes do not hash to {checksum}"
        )));
    }
    let tmp_dir = cache_dir.join("tmp");
    std::fs::create_dir_all(&tmp_dir)
        .map_err(|e| BuildError::store_io(format!("creating {}: {e}", tmp_dir.display())))?;
    let partial = tmp_dir.join(format!("{}.partial-{}", checksum.to_filename(), std::process::id()));
    std::fs::write(&partial, bytes)
        .map_err(|e| BuildError::store_io(format!("writing {}: {e}", partial.display())))?;
    // Same filesystem by construction, so this is atomic; a concurrent
    // fetch of the same checksum coalesces here.
    match std::fs::rename(&partial, &final_path) {
        Ok(()) => Ok(final_path),
        Err(_) if final_path.is_file() => {
            std::fs::remove_file(&partial).ok();
            Ok(final_path)
        }
        Err(e) => Err(BuildError::store_io(format!(
            "placing {}: {e}",
            final_path.display()
        ))),
    }
}

/// Moves an already-verified partial file into its final cache location,
/// coalescing with a concurrent fetch that got there first.
pub fn promote_file(cache_dir: &Path, checksum: &Checksum, partial: &Path) -> BuildResult<PathBuf> {
    let final_path = cache_dir.join(checksum.to_filename());
    match std::fs::rename(partial, &final_path) {
        Ok(()) => Ok(final_path),
        Err(_) if final_path.is_file() => {
            std::fs::remove_file(partial).ok();
            Ok(final_path)
        }
        Err(e) => Err(BuildError::store_io(format!(
            "placing {}: {e}",
            final_path.display()
        ))),
    }
}
