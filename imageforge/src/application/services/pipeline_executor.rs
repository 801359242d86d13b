// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Pipeline Executor
//!
//! Walks resolved pipelines in the topological order the resolver
//! produced, one stage at a time. For each stage the executor decides
//! cache hit (the stage id is already committed) versus re-run, delegates
//! execution to the stage-runner port, applies requested checkpoints,
//! copies exports into the output directory, and emits the result stream.
//!
//! Because every stage id chains its predecessor's id, a change anywhere
//! upstream changes every downstream id — so a plain `contains` check is
//! the whole cache policy, and "first miss forces the rest to run" falls
//! out of fingerprinting rather than bookkeeping.
//!
//! Failure policy: a failed stage fails its pipeline and aborts the run.
//! Teardown for the failing stage happens inside the runner; committed
//! objects always survive; the terminal record names the failing
//! pipeline, stage, module, and error kind.

use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use imageforge_domain::events::build_event::{
    ContextRecord, ErrorRecord, MetadataRecord, ProgressCounter, ProgressRecord,
};
use imageforge_domain::repositories::object_store::ObjectStore;
use imageforge_domain::repositories::stage_runner::{StageRun, StageRunner};
use imageforge_domain::{
    BuildError, BuildEvent, BuildResult, Monitor, ObjectId, ResolvedManifest, ResolvedPipeline,
    ResultRecord, StageOutcome,
};

/// What the caller asked for beyond the manifest itself.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Checkpoint selectors: pipeline name, stage (module) name, or
    /// stage id.
    pub checkpoints: Vec<String>,
    /// Export selectors: pipeline names.
    pub exports: Vec<String>,
    /// Destination for exports; required when `exports` is non-empty.
    pub output_dir: Option<PathBuf>,
}

/// Walks the plan and produces the terminal result record.
pub struct PipelineExecutor {
    store: Arc<dyn ObjectStore>,
    runner: Arc<dyn StageRunner>,
    monitor: Arc<dyn Monitor>,
    cancel: Option<imageforge_bootstrap::CancellationToken>,
}

impl PipelineExecutor {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        runner: Arc<dyn StageRunner>,
        monitor: Arc<dyn Monitor>,
    ) -> Self {
        Self {
            store,
            runner,
            monitor,
            cancel: None,
        }
    }

    /// Installs a cancellation token, checked between stages: the stage
    /// in flight finishes (or fails) with full teardown, then the run
    /// stops with `cancelled`.
    pub fn with_cancellation(mut self, token: imageforge_bootstrap::CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Executes the plan. The terminal record is emitted on the monitor
    /// exactly once and also returned for exit-code decisions.
    pub async fn execute(
        &self,
        plan: &ResolvedManifest,
        options: &ExecutionOptions,
    ) -> ResultRecord {
        let record = match self.execute_inner(plan, options).await {
            Ok(record) => record,
            Err(failure) => failure.into_record(),
        };
        self.monitor.record(BuildEvent::Result(record.clone()));
        record
    }

    async fn execute_inner(
        &self,
        plan: &ResolvedManifest,
        options: &ExecutionOptions,
    ) -> Result<ResultRecord, Failure> {
        // Resolve selectors up front; a typo should fail before any work.
        let checkpoints = resolve_checkpoints(plan, &options.checkpoints)
            .map_err(|e| Failure::bare(e, Vec::new()))?;
        for export in &options.exports {
            if plan.pipeline_by_name(export).is_none() {
                return Err(Failure::bare(
                    BuildError::manifest_invalid(format!(
                        "export {export:?} does not name a pipeline"
                    )),
                    Vec::new(),
                ));
            }
        }

        let mut outcomes: Vec<StageOutcome> = Vec::new();
        let total_pipelines = plan.pipelines.len();

        for (pipeline_index, pipeline) in plan.pipelines.iter().enumerate() {
            self.monitor.record(BuildEvent::Context(ContextRecord {
                pipeline: pipeline.name.clone(),
                pipeline_id: pipeline.id.clone(),
                stage: None,
                module: None,
            }));
            self.monitor.record(BuildEvent::Progress(ProgressRecord {
                pipelines: ProgressCounter {
                    done: pipeline_index,
                    total: total_pipelines,
                },
                stages: Some(ProgressCounter {
                    done: 0,
                    total: pipeline.stages.len(),
                }),
            }));

            let pipelines_progress = ProgressCounter {
                done: pipeline_index,
                total: total_pipelines,
            };
            self.run_pipeline(pipeline, pipelines_progress, &mut outcomes)
                .await
                .map_err(|e| {
                    let (stage, module) = match e.stage_context() {
                        Some((stage, module)) => (Some(stage), Some(module)),
                        None => (None, None),
                    };
                    Failure {
                        error: e.error,
                        pipeline: Some(pipeline.name.clone()),
                        stage,
                        module,
                        outcomes: std::mem::take(&mut outcomes),
                    }
                })?;
        }

        // Checkpoints pin committed objects under symbolic names.
        for (name, id) in &checkpoints {
            self.store
                .checkpoint(id, name)
                .await
                .map_err(|e| Failure::bare(e, outcomes.clone()))?;
        }

        // Exports are the only user-facing materialization.
        let mut exports = BTreeMap::new();
        for export in &options.exports {
            let pipeline = plan.pipeline_by_name(export).ok_or_else(|| {
                Failure::bare(
                    BuildError::internal(format!("export {export:?} vanished from plan")),
                    outcomes.clone(),
                )
            })?;
            let dest = options
                .output_dir
                .as_ref()
                .ok_or_else(|| {
                    Failure::bare(
                        BuildError::manifest_invalid("exports requested without output directory"),
                        outcomes.clone(),
                    )
                })?
                .join(export);
            let path = self
                .store
                .export(&pipeline.id, &dest)
                .await
                .map_err(|e| Failure::bare(e, outcomes.clone()))?;
            exports.insert(export.clone(), path.display().to_string());
        }

        self.monitor.record(BuildEvent::Progress(ProgressRecord {
            pipelines: ProgressCounter {
                done: total_pipelines,
                total: total_pipelines,
            },
            stages: None,
        }));
        Ok(ResultRecord::success(exports, outcomes))
    }

    async fn run_pipeline(
        &self,
        pipeline: &ResolvedPipeline,
        pipelines_progress: ProgressCounter,
        outcomes: &mut Vec<StageOutcome>,
    ) -> Result<(), StageFailure> {
        // A pipeline with no stages still produces a (stable, empty)
        // object so checkpoints and dependents have something to bind to.
        if pipeline.stages.is_empty() {
            if !self.store.contains(&pipeline.id).await {
                let workspace = self
                    .store
                    .new_workspace(&pipeline.id)
                    .await
                    .map_err(StageFailure::engine)?;
                self.store
                    .commit(workspace, json!({ "module": null }))
                    .await
                    .map_err(StageFailure::engine)?;
            }
            return Ok(());
        }

        let mut base: Option<ObjectId> = None;
        for (stage_index, stage) in pipeline.stages.iter().enumerate() {
            if let Some(cancel) = &self.cancel {
                if cancel.is_cancelled() {
                    return Err(StageFailure::engine(BuildError::Cancelled(
                        "engine signalled before stage start".into(),
                    )));
                }
            }
            self.monitor.record(BuildEvent::Context(ContextRecord {
                pipeline: pipeline.name.clone(),
                pipeline_id: pipeline.id.clone(),
                stage: Some(stage.id.clone()),
                module: Some(stage.module.clone()),
            }));

            let cached = self.store.contains(&stage.id).await;
            if cached {
                tracing::debug!(stage = %stage.id.short(), module = %stage.module, "cache hit");
            } else {
                let request = StageRun {
                    pipeline,
                    stage,
                    base: base.as_ref(),
                };
                let metadata = self.runner.run(request).await.map_err(|error| StageFailure {
                    error,
                    stage: Some((stage.id.clone(), stage.module.clone())),
                })?;
                if !metadata.is_null() {
                    self.monitor.record(BuildEvent::Metadata(MetadataRecord {
                        stage: stage.id.clone(),
                        data: metadata,
                    }));
                }
            }

            outcomes.push(StageOutcome {
                pipeline: pipeline.name.clone(),
                id: stage.id.clone(),
                module: stage.module.clone(),
                cached,
            });
            self.monitor.record(BuildEvent::Progress(ProgressRecord {
                pipelines: pipelines_progress,
                stages: Some(ProgressCounter {
                    done: stage_index + 1,
                    total: pipeline.stages.len(),
                }),
            }));
            base = Some(stage.id.clone());
        }
        Ok(())
    }
}

/// Resolves checkpoint selectors to `(ref-name, id)` pairs.
///
/// A selector may be a pipeline name (the pipeline's output), a stage id,
/// or a stage (module) name, which selects every matching stage.
fn resolve_checkpoints(
    plan: &ResolvedManifest,
    selectors: &[String],
) -> BuildResult<Vec<(String, ObjectId)>> {
    let mut resolved = Vec::new();
    for selector in selectors {
        if let Some(pipeline) = plan.pipeline_by_name(selector) {
            resolved.push((selector.clone(), pipeline.id.clone()));
            continue;
        }
        if let Ok(id) = ObjectId::from_string(selector) {
            let known = plan
                .pipelines
                .iter()
                .flat_map(|p| p.stages.iter())
                .any(|s| s.id == id)
                || plan.pipelines.iter().any(|p| p.id == id);
            if known {
                resolved.push((selector.clone(), id));
                continue;
            }
        }
        let mut matched = false;
        for pipeline in &plan.pipelines {
            for stage in &pipeline.stages {
                if stage.module == *selector {
                    resolved.push((stage.id.to_string(), stage.id.clone()));
                    matched = true;
                }
            }
        }
        if !matched {
            return Err(BuildError::manifest_invalid(format!(
                "checkpoint {selector:?} matches no pipeline, stage name, or id"
            )));
        }
    }
    Ok(resolved)
}

/// A failure inside one pipeline, with whatever stage context exists.
struct StageFailure {
    error: BuildError,
    stage: Option<(ObjectId, String)>,
}

impl StageFailure {
    fn engine(error: BuildError) -> Self {
        Self { error, stage: None }
    }

    fn stage_context(&self) -> Option<(ObjectId, String)> {
        self.stage.clone()
    }
}

/// A run-level failure carrying everything the terminal record needs.
struct Failure {
    error: BuildError,
    pipeline: Option<String>,
    stage: Option<ObjectId>,
    module: Option<String>,
    outcomes: Vec<StageOutcome>,
}

impl Failure {
    fn bare(error: BuildError, outcomes: Vec<StageOutcome>) -> Self {
        Self {
            error,
            pipeline: None,
            stage: None,
            module: None,
            outcomes,
        }
    }

    fn into_record(self) -> ResultRecord {
        ResultRecord::failure(
            ErrorRecord::from_error(&self.error, self.pipeline, self.stage, self.module),
            self.outcomes,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::time::SystemTime;

    use imageforge_domain::{Manifest, ModuleRegistry, Resolver};

    use crate::infrastructure::stores::FsObjectStore;

    /// Commits an empty tree for every stage it runs, recording calls.
    struct StubRunner {
        store: Arc<FsObjectStore>,
        calls: Mutex<Vec<String>>,
        fail_module: Option<String>,
    }

    #[async_trait]
    impl StageRunner for StubRunner {
        async fn run(&self, request: StageRun<'_>) -> BuildResult<Value> {
            self.calls.lock().push(request.stage.module.clone());
            if self.fail_module.as_deref() == Some(request.stage.module.as_str()) {
                return Err(BuildError::ModuleExit {
                    module: request.stage.module.clone(),
                    code: 1,
                    message: "stub failure".into(),
                });
            }
            let workspace = self.store.new_workspace(&request.stage.id).await?;
            std::fs::write(
                workspace.tree().join("stamp"),
                request.stage.id.as_str(),
            )
            .map_err(|e| BuildError::store_io(e.to_string()))?;
            self.store
                .commit(workspace, json!({ "module": request.stage.module }))
                .await?;
            Ok(json!({ "ran": request.stage.module }))
        }
    }

    struct CollectingMonitor {
        events: Mutex<Vec<BuildEvent>>,
    }

    impl Monitor for CollectingMonitor {
        fn record(&self, event: BuildEvent) {
            self.events.lock().push(event);
        }
    }

    fn registry() -> ModuleRegistry {
        ModuleRegistry::new()
            .with_stage("org.imageforge.noop")
            .with_stage("org.imageforge.fail")
    }

    fn plan(text: &str) -> ResolvedManifest {
        let manifest = Manifest::from_json(text).unwrap();
        Resolver::resolve(&manifest, &registry()).unwrap()
    }

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<FsObjectStore>,
        runner: Arc<StubRunner>,
        monitor: Arc<CollectingMonitor>,
        executor: PipelineExecutor,
    }

    fn harness(fail_module: Option<&str>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsObjectStore::open(dir.path(), SystemTime::now()).unwrap());
        let runner = Arc::new(StubRunner {
            store: store.clone(),
            calls: Mutex::new(Vec::new()),
            fail_module: fail_module.map(str::to_owned),
        });
        let monitor = Arc::new(CollectingMonitor {
            events: Mutex::new(Vec::new()),
        });
        let executor = PipelineExecutor::new(store.clone(), runner.clone(), monitor.clone());
        Harness {
            _dir: dir,
            store,
            runner,
            monitor,
            executor,
        }
    }

    const TWO_STAGE: &str = r#"{
        "version": "2",
        "pipelines": [
            {
                "name": "image",
                "stages": [
                    { "type": "org.imageforge.noop", "options": { "step": 1 } },
                    { "type": "org.imageforge.noop", "options": { "step": 2 } }
                ]
            }
        ]
    }"#;

    #[tokio::test]
    async fn test_second_run_is_fully_cached() {
        let h = harness(None);
        let plan = plan(TWO_STAGE);

        let first = h.executor.execute(&plan, &ExecutionOptions::default()).await;
        assert!(first.success);
        assert_eq!(h.runner.calls.lock().len(), 2);
        assert!(first.stages.iter().all(|s| !s.cached));

        let second = h.executor.execute(&plan, &ExecutionOptions::default()).await;
        assert!(second.success);
        assert_eq!(
            h.runner.calls.lock().len(),
            2,
            "second run must invoke zero modules"
        );
        assert!(second.stages.iter().all(|s| s.cached));
    }

    #[tokio::test]
    async fn test_failure_aborts_and_names_the_stage() {
        let h = harness(Some("org.imageforge.fail"));
        let plan = plan(
            r#"{
                "version": "2",
                "pipelines": [
                    { "name": "a", "stages": [ { "type": "org.imageforge.noop" } ] },
                    { "name": "b", "build": "name:a",
                      "stages": [
                        { "type": "org.imageforge.fail" },
                        { "type": "org.imageforge.noop" }
                      ] }
                ]
            }"#,
        );

        let record = h.executor.execute(&plan, &ExecutionOptions::default()).await;
        assert!(!record.success);
        let error = record.error.as_ref().unwrap();
        assert_eq!(error.kind, "module-exit");
        assert_eq!(error.pipeline.as_deref(), Some("b"));
        assert_eq!(error.module.as_deref(), Some("org.imageforge.fail"));

        // The failing stage committed nothing; the stage after it never ran.
        let failing_id = &plan.pipelines[1].stages[0].id;
        assert!(!h.store.contains(failing_id).await);
        let calls = h.runner.calls.lock().clone();
        assert_eq!(calls, ["org.imageforge.noop", "org.imageforge.fail"]);

        // Pipeline "a" committed and survives the failed run.
        assert!(h.store.contains(&plan.pipelines[0].id).await);
    }

    #[tokio::test]
    async fn test_exactly_one_terminal_record() {
        let h = harness(None);
        let plan = plan(TWO_STAGE);
        h.executor.execute(&plan, &ExecutionOptions::default()).await;

        let events = h.monitor.events.lock();
        let results: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, BuildEvent::Result(_)))
            .collect();
        assert_eq!(results.len(), 1);
        assert!(
            matches!(events.last().unwrap(), BuildEvent::Result(_)),
            "terminal record comes last"
        );
    }

    #[tokio::test]
    async fn test_empty_pipeline_with_checkpoint_commits_one_object() {
        let h = harness(None);
        let plan = plan(r#"{ "version": "2", "pipelines": [ { "name": "p", "stages": [] } ] }"#);
        let options = ExecutionOptions {
            checkpoints: vec!["p".into()],
            ..Default::default()
        };

        let record = h.executor.execute(&plan, &options).await;
        assert!(record.success);
        assert!(h.store.contains(&plan.pipelines[0].id).await);
        assert_eq!(h.store.read_ref("p").unwrap(), Some(plan.pipelines[0].id.clone()));
        assert_eq!(h.runner.calls.lock().len(), 0);

        // Rerunning is a no-op with the same id.
        let again = h.executor.execute(&plan, &options).await;
        assert!(again.success);
        assert_eq!(h.runner.calls.lock().len(), 0);
    }

    #[tokio::test]
    async fn test_export_copies_the_final_tree() {
        let h = harness(None);
        let out = tempfile::tempdir().unwrap();
        let plan = plan(TWO_STAGE);
        let options = ExecutionOptions {
            exports: vec!["image".into()],
            output_dir: Some(out.path().to_path_buf()),
            ..Default::default()
        };

        let record = h.executor.execute(&plan, &options).await;
        assert!(record.success);
        let dest = PathBuf::from(record.exports.get("image").unwrap());
        assert_eq!(dest, out.path().join("image"));
        assert_eq!(
            std::fs::read(dest.join("stamp")).unwrap(),
            plan.pipelines[0].stages[1].id.as_str().as_bytes(),
            "the exported tree is the final stage's tree"
        );
    }

    #[tokio::test]
    async fn test_unknown_selectors_fail_before_any_work() {
        let h = harness(None);
        let plan = plan(TWO_STAGE);

        let record = h
            .executor
            .execute(
                &plan,
                &ExecutionOptions {
                    checkpoints: vec!["ghost".into()],
                    ..Default::default()
                },
            )
            .await;
        assert!(!record.success);
        assert_eq!(record.error.unwrap().kind, "manifest-invalid");
        assert_eq!(h.runner.calls.lock().len(), 0);

        let record = h
            .executor
            .execute(
                &plan,
                &ExecutionOptions {
                    exports: vec!["ghost".into()],
                    output_dir: Some(PathBuf::from("/tmp")),
                    ..Default::default()
                },
            )
            .await;
        assert!(!record.success);
        assert_eq!(record.error.unwrap().kind, "manifest-invalid");
    }

    #[tokio::test]
    async fn test_checkpoint_by_stage_name_selects_matching_stages() {
        let h = harness(None);
        let plan = plan(TWO_STAGE);
        let options = ExecutionOptions {
            checkpoints: vec!["org.imageforge.noop".into()],
            ..Default::default()
        };
        let record = h.executor.execute(&plan, &options).await;
        assert!(record.success);
        // Both stages match the module name; each gets an id-named ref.
        for stage in &plan.pipelines[0].stages {
            assert_eq!(
                h.store.read_ref(stage.id.as_str()).unwrap(),
                Some(stage.id.clone())
            );
        }
    }
}
