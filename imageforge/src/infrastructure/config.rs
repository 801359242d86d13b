// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Engine Configuration
//!
//! One typed configuration struct carried by value into the executor and
//! runner. Nothing here is process-global: host services receive their
//! slice of the configuration in their startup argument blob, and tests
//! construct throwaway configs pointing at temp directories.
//!
//! Precedence, lowest to highest: built-in defaults, worker sizing from
//! the platform's CPU count, an optional TOML file (`--config`),
//! environment overrides (`IMAGEFORGE_*`), CLI flags.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use imageforge_domain::{BuildError, BuildResult};

/// Default number of parallel fetch workers per source kind, used when no
/// CPU count is available to size from.
pub const DEFAULT_FETCH_WORKERS: usize = 4;

/// Upper bound when sizing fetch workers from the CPU count.
pub const MAX_FETCH_WORKERS: usize = 8;

/// Default grace period before a non-responsive host service is killed.
pub const DEFAULT_SERVICE_GRACE: Duration = Duration::from_secs(5);

/// Default bounded retry count for URL fetches.
pub const DEFAULT_FETCH_RETRIES: usize = 3;

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Object store root (`objects/`, `refs/`, `tmp/`, `sources/`,
    /// `stage/` live underneath).
    pub store_root: PathBuf,

    /// Directories searched for stage modules, in order.
    pub module_path: Vec<PathBuf>,

    /// Upper bound on the source cache, in bytes; `None` means unbounded.
    pub cache_max_size: Option<u64>,

    /// Parallel fetch workers per source kind.
    pub fetch_workers: usize,

    /// Bounded retries for URL fetches, with mirror re-selection each
    /// attempt.
    pub fetch_retries: usize,

    /// Grace period between a close request and a kill.
    pub service_grace: Duration,

    /// Optional per-stage module timeout.
    pub module_timeout: Option<Duration>,

    /// Timestamp handed to modules as `meta.source-epoch` so they can
    /// clamp file times for reproducibility.
    pub source_epoch: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_root: default_store_root(),
            module_path: vec![PathBuf::from("/usr/lib/imageforge/modules")],
            cache_max_size: None,
            fetch_workers: DEFAULT_FETCH_WORKERS,
            fetch_retries: DEFAULT_FETCH_RETRIES,
            service_grace: DEFAULT_SERVICE_GRACE,
            module_timeout: None,
            source_epoch: 0,
        }
    }
}

/// The well-known user-scoped store location.
pub fn default_store_root() -> PathBuf {
    if let Ok(cache) = std::env::var("XDG_CACHE_HOME") {
        if !cache.is_empty() {
            return PathBuf::from(cache).join("imageforge/store");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() {
            return PathBuf::from(home).join(".cache/imageforge/store");
        }
    }
    PathBuf::from("/var/cache/imageforge/store")
}

/// On-disk layout of a config file; every field optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    pub store: Option<PathBuf>,
    pub module_path: Option<Vec<PathBuf>>,
    pub cache_max_size: Option<u64>,
    pub fetch_workers: Option<usize>,
    pub fetch_retries: Option<usize>,
    pub service_grace_secs: Option<u64>,
    pub module_timeout_secs: Option<u64>,
    pub source_epoch: Option<i64>,
}

impl ConfigFile {
    /// Reads and parses a TOML config file.
    pub fn load(path: &Path) -> BuildResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            BuildError::manifest_invalid(format!("cannot read config {}: {e}", path.display()))
        })?;
        toml::from_str(&text).map_err(|e| {
            BuildError::manifest_invalid(format!("invalid config {}: {e}", path.display()))
        })
    }
}

impl EngineConfig {
    /// Sizes the fetch pools from the machine's CPU count, capped so a
    /// large host does not hammer one mirror. Config file, environment,
    /// and CLI overrides all take precedence; call this first.
    pub fn size_fetch_workers(&mut self, cpu_count: usize) {
        self.fetch_workers = cpu_count.clamp(1, MAX_FETCH_WORKERS);
    }

    /// Layers a parsed config file over this configuration.
    pub fn apply(&mut self, file: ConfigFile) {
        if let Some(store) = file.store {
            self.store_root = store;
        }
        if let Some(module_path) = file.module_path {
            self.module_path = module_path;
        }
        if let Some(max) = file.cache_max_size {
            self.cache_max_size = Some(max);
        }
        if let Some(workers) = file.fetch_workers {
            self.fetch_workers = workers.max(1);
        }
        if let Some(retries) = file.fetch_retries {
            self.fetch_retries = retries;
        }
        if let Some(secs) = file.service_grace_secs {
            self.service_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = file.module_timeout_secs {
            self.module_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(epoch) = file.source_epoch {
            self.source_epoch = epoch;
        }
    }

    /// Applies `IMAGEFORGE_*` environment overrides. Sits between the
    /// config file and CLI flags in precedence.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    /// Same as [`apply_env`](Self::apply_env), with an injectable lookup
    /// for tests.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(store) = lookup("IMAGEFORGE_STORE") {
            if !store.is_empty() {
                self.store_root = PathBuf::from(store);
            }
        }
        if let Some(paths) = lookup("IMAGEFORGE_MODULE_PATH") {
            let parsed: Vec<PathBuf> = std::env::split_paths(&paths).collect();
            if !parsed.is_empty() {
                self.module_path = parsed;
            }
        }
        if let Some(workers) = lookup("IMAGEFORGE_FETCH_WORKERS") {
            if let Ok(n) = workers.parse::<usize>() {
                self.fetch_workers = n.max(1);
            }
        }
        if let Some(epoch) = lookup("SOURCE_DATE_EPOCH") {
            if let Ok(n) = epoch.parse::<i64>() {
                self.source_epoch = n;
            }
        }
    }

    /// Source cache root under the store.
    pub fn sources_root(&self) -> PathBuf {
        self.store_root.join("sources")
    }
}
