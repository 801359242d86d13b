// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Build Use Case
//!
//! The full build path: usage validation, manifest resolution, store
//! bring-up (with orphan reclaim), source prefetch, DAG execution,
//! exports. Each phase that can fail produces the terminal result record
//! itself, so callers always get exactly one result — and a manifest
//! problem never creates a workspace, never spawns a helper, never
//! invokes a module.
//!
//! Ordering guarantee honored here: every source referenced anywhere in
//! the plan is fetched and verified before the first stage starts, so a
//! checksum mismatch aborts the run with no partial side effects.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use imageforge_domain::events::build_event::ErrorRecord;
use imageforge_domain::repositories::object_store::ObjectStore;
use imageforge_domain::repositories::source_store::SourceStore;
use imageforge_domain::{
    BuildError, BuildEvent, Manifest, Monitor, ResolvedManifest, Resolver, ResultRecord,
};

use crate::application::services::pipeline_executor::{ExecutionOptions, PipelineExecutor};
use crate::infrastructure::config::EngineConfig;
use crate::infrastructure::runtime::{DefaultStageRunner, KernelSandboxBackend};
use crate::infrastructure::services::registry::scan_module_registry;
use crate::infrastructure::services::sources::HelperSourceConnector;
use crate::infrastructure::stores::{FsObjectStore, FsSourceCache};

/// One build invocation.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub manifest_text: String,
    pub checkpoints: Vec<String>,
    pub exports: Vec<String>,
    pub output_dir: Option<PathBuf>,
    /// Engine process start time; the reclaim cutoff.
    pub started_at: SystemTime,
    /// Platform privilege probe; selects the sandbox's privileged or
    /// user-namespace path.
    pub privileged: bool,
}

/// Drives a complete build and emits the terminal record.
pub struct BuildUseCase {
    config: EngineConfig,
    monitor: Arc<dyn Monitor>,
    cancel: Option<imageforge_bootstrap::CancellationToken>,
}

impl BuildUseCase {
    pub fn new(config: EngineConfig, monitor: Arc<dyn Monitor>) -> Self {
        Self {
            config,
            monitor,
            cancel: None,
        }
    }

    /// Wires engine cancellation (SIGINT/SIGTERM) into the executor.
    pub fn with_cancellation(mut self, token: imageforge_bootstrap::CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Runs the build; the returned record decides the exit code.
    pub async fn execute(&self, request: BuildRequest) -> ResultRecord {
        match self.execute_inner(request).await {
            Ok(record) => record,
            Err(error) => {
                // Pre-execution failures still produce the one terminal
                // record on the channel.
                let record =
                    ResultRecord::failure(ErrorRecord::from_error(&error, None, None, None), Vec::new());
                self.monitor.record(BuildEvent::Result(record.clone()));
                record
            }
        }
    }

    async fn execute_inner(&self, request: BuildRequest) -> Result<ResultRecord, BuildError> {
        Self::validate_usage(&request)?;

        // Resolve first; manifest errors must precede any side effect.
        let manifest = Manifest::from_json(&request.manifest_text)?;
        let registry = scan_module_registry(&self.config.module_path);
        let plan = Resolver::resolve(&manifest, &registry)?;
        if plan.pipelines.is_empty() {
            return Err(BuildError::manifest_invalid(
                "manifest has no pipelines; refusing no-op build",
            ));
        }

        let store = Arc::new(FsObjectStore::open(
            &self.config.store_root,
            request.started_at,
        )?);
        match store.reclaim().await {
            Ok(0) => {}
            Ok(n) => tracing::info!(count = n, "reclaimed orphaned workspaces"),
            Err(e) => tracing::warn!(error = %e, "reclaim failed"),
        }

        // Prefetch and verify every referenced source before any stage.
        let connector = Arc::new(HelperSourceConnector::new(
            self.monitor.clone(),
            self.config.fetch_retries,
            self.config.fetch_workers,
            self.config.service_grace,
        ));
        let sources = Arc::new(FsSourceCache::new(
            self.config.sources_root(),
            self.config.fetch_workers,
            connector.clone(),
        ));
        let prefetch = self.prefetch_sources(&plan, sources.as_ref()).await;
        if let Err(e) = prefetch {
            connector.shutdown().await;
            return Err(e);
        }

        let runner = Arc::new(DefaultStageRunner::new(
            self.config.clone(),
            store.clone(),
            sources.clone(),
            self.monitor.clone(),
            Arc::new(KernelSandboxBackend),
            request.privileged,
        ));
        let mut executor = PipelineExecutor::new(store, runner, self.monitor.clone());
        if let Some(token) = &self.cancel {
            executor = executor.with_cancellation(token.clone());
        }
        let options = ExecutionOptions {
            checkpoints: request.checkpoints,
            exports: request.exports,
            output_dir: request.output_dir,
        };
        let record = executor.execute(&plan, &options).await;

        connector.shutdown().await;
        if let Some(max) = self.config.cache_max_size {
            if let Err(e) = sources.enforce_limit(max) {
                tracing::warn!(error = %e, "cache limit enforcement failed");
            }
        }
        Ok(record)
    }

    fn validate_usage(request: &BuildRequest) -> Result<(), BuildError> {
        if request.exports.is_empty() && request.checkpoints.is_empty() {
            return Err(BuildError::manifest_invalid(
                "neither exports nor checkpoints requested; refusing no-op build",
            ));
        }
        if !request.exports.is_empty() && request.output_dir.is_none() {
            return Err(BuildError::manifest_invalid(
                "exports requested but no output directory given",
            ));
        }
        Ok(())
    }

    async fn prefetch_sources(
        &self,
        plan: &ResolvedManifest,
        sources: &FsSourceCache,
    ) -> Result<(), BuildError> {
        for (kind, entries) in &plan.sources {
            sources.ensure(kind, entries).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imageforge_domain::events::build_event::NullMonitor;

    fn request(exports: &[&str], checkpoints: &[&str], output: Option<&str>) -> BuildRequest {
        BuildRequest {
            manifest_text: r#"{ "version": "2", "pipelines": [ { "name": "p", "stages": [] } ] }"#
                .to_owned(),
            checkpoints: checkpoints.iter().map(|s| s.to_string()).collect(),
            exports: exports.iter().map(|s| s.to_string()).collect(),
            output_dir: output.map(PathBuf::from),
            started_at: SystemTime::now(),
            privileged: false,
        }
    }

    fn use_case(store_root: &std::path::Path) -> BuildUseCase {
        let config = EngineConfig {
            store_root: store_root.to_path_buf(),
            module_path: vec![],
            ..Default::default()
        };
        BuildUseCase::new(config, Arc::new(NullMonitor))
    }

    #[tokio::test]
    async fn test_export_without_output_dir_is_rejected_before_building() {
        let dir = tempfile::tempdir().unwrap();
        let record = use_case(dir.path())
            .execute(request(&["p"], &[], None))
            .await;
        assert!(!record.success);
        assert_eq!(record.error.unwrap().kind, "manifest-invalid");
        // No store was even created.
        assert!(!dir.path().join("objects").exists());
    }

    #[tokio::test]
    async fn test_no_op_build_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let record = use_case(dir.path()).execute(request(&[], &[], None)).await;
        assert!(!record.success);
        assert_eq!(record.error.unwrap().kind, "manifest-invalid");
    }

    #[tokio::test]
    async fn test_empty_pipeline_checkpoint_builds_and_reruns_cached() {
        let dir = tempfile::tempdir().unwrap();
        let record = use_case(dir.path())
            .execute(request(&[], &["p"], None))
            .await;
        assert!(record.success, "error: {:?}", record.error);

        // One committed object, referenced by the checkpoint.
        let objects: Vec<_> = std::fs::read_dir(dir.path().join("objects"))
            .unwrap()
            .collect();
        assert_eq!(objects.len(), 1);
        assert!(dir.path().join("refs/p").symlink_metadata().is_ok());

        // Second run: same id, still exactly one object.
        let record = use_case(dir.path())
            .execute(request(&[], &["p"], None))
            .await;
        assert!(record.success);
        let objects: Vec<_> = std::fs::read_dir(dir.path().join("objects"))
            .unwrap()
            .collect();
        assert_eq!(objects.len(), 1);
    }

    #[tokio::test]
    async fn test_manifest_with_no_pipelines_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request(&[], &["p"], None);
        req.manifest_text = r#"{ "version": "2", "pipelines": [] }"#.to_owned();
        let record = use_case(dir.path()).execute(req).await;
        assert!(!record.success);
        assert_eq!(record.error.unwrap().kind, "manifest-invalid");
    }
}
