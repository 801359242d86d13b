// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Executor + object store integration: cache reuse across runs,
//! checkpoint-driven retention, and failure behavior against the real
//! filesystem store.

use std::sync::Arc;

use imageforge::application::services::pipeline_executor::{ExecutionOptions, PipelineExecutor};
use imageforge_domain::events::build_event::NullMonitor;
use imageforge_domain::repositories::object_store::ObjectStore;

use crate::common::{open_store, resolve, StampRunner};

const BASE_AND_IMAGE: &str = r#"{
    "version": "2",
    "pipelines": [
        { "name": "base", "stages": [ { "type": "org.imageforge.noop", "options": { "layer": "base" } } ] },
        { "name": "image", "build": "name:base", "stages": [
            { "type": "org.imageforge.copy", "options": { "layer": "a" } },
            { "type": "org.imageforge.copy", "options": { "layer": "b" } }
        ] }
    ]
}"#;

#[tokio::test]
async fn test_checkpoint_reuse_across_runs_with_changed_downstream() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    // First run: everything builds, checkpoint the base pipeline.
    let plan = resolve(BASE_AND_IMAGE);
    let runner = StampRunner::new(store.clone());
    let executor = PipelineExecutor::new(store.clone(), runner.clone(), Arc::new(NullMonitor));
    let options = ExecutionOptions {
        checkpoints: vec!["base".into()],
        ..Default::default()
    };
    let record = executor.execute(&plan, &options).await;
    assert!(record.success);
    assert_eq!(runner.call_count(), 3);

    // Second run with only a downstream option changed: the base stage is
    // reused from the store with no module invocation, downstream re-runs
    // under new ids.
    let changed = BASE_AND_IMAGE.replace("\"layer\": \"b\"", "\"layer\": \"b2\"");
    let plan2 = resolve(&changed);
    assert_eq!(plan.pipelines[0].id, plan2.pipelines[0].id, "base id unchanged");
    assert_ne!(plan.pipelines[1].id, plan2.pipelines[1].id, "image id changed");

    let runner2 = StampRunner::new(store.clone());
    let executor2 = PipelineExecutor::new(store.clone(), runner2.clone(), Arc::new(NullMonitor));
    let record = executor2.execute(&plan2, &options).await;
    assert!(record.success);
    let calls = runner2.calls.lock().clone();
    assert_eq!(
        calls,
        ["org.imageforge.copy", "org.imageforge.copy"],
        "only the changed pipeline's stages run"
    );
    let base_outcome = record
        .stages
        .iter()
        .find(|s| s.pipeline == "base")
        .unwrap();
    assert!(base_outcome.cached);
}

#[tokio::test]
async fn test_identical_rerun_invokes_no_modules() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    let plan = resolve(BASE_AND_IMAGE);
    let options = ExecutionOptions {
        checkpoints: vec!["image".into()],
        ..Default::default()
    };

    let runner = StampRunner::new(store.clone());
    PipelineExecutor::new(store.clone(), runner.clone(), Arc::new(NullMonitor))
        .execute(&plan, &options)
        .await;
    assert_eq!(runner.call_count(), 3);

    let runner2 = StampRunner::new(store.clone());
    let record = PipelineExecutor::new(store.clone(), runner2.clone(), Arc::new(NullMonitor))
        .execute(&plan, &options)
        .await;
    assert!(record.success);
    assert_eq!(runner2.call_count(), 0, "full cache reuse");
    assert!(record.stages.iter().all(|s| s.cached));
}

#[tokio::test]
async fn test_failed_stage_commits_nothing_and_aborts_downstream() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    let plan = resolve(
        r#"{
            "version": "2",
            "pipelines": [
                { "name": "a", "stages": [ { "type": "org.imageforge.fail" } ] },
                { "name": "b", "build": "name:a", "stages": [ { "type": "org.imageforge.noop" } ] }
            ]
        }"#,
    );

    let runner = StampRunner::new(store.clone());
    let record = PipelineExecutor::new(store.clone(), runner.clone(), Arc::new(NullMonitor))
        .execute(&plan, &ExecutionOptions::default())
        .await;

    assert!(!record.success);
    let error = record.error.unwrap();
    assert_eq!(error.kind, "module-exit");
    assert_eq!(error.pipeline.as_deref(), Some("a"));

    assert!(!store.contains(&plan.pipelines[0].id).await);
    assert!(!store.contains(&plan.pipelines[1].id).await);
    assert_eq!(runner.call_count(), 1, "pipeline b never starts");

    // No workspace debris under tmp/ (the runner discards on failure; the
    // stub never opened one for the failing stage).
    let tmp_entries: Vec<_> = std::fs::read_dir(dir.path().join("tmp")).unwrap().collect();
    assert!(tmp_entries.is_empty());
}

#[tokio::test]
async fn test_exports_are_byte_identical_across_repeats() {
    let dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    let plan = resolve(BASE_AND_IMAGE);
    let options = ExecutionOptions {
        exports: vec!["image".into()],
        output_dir: Some(out.path().to_path_buf()),
        ..Default::default()
    };

    let runner = StampRunner::new(store.clone());
    let executor = PipelineExecutor::new(store.clone(), runner, Arc::new(NullMonitor));
    let first = executor.execute(&plan, &options).await;
    assert!(first.success);
    let stamp = std::fs::read(out.path().join("image/stamp")).unwrap();

    let second = executor.execute(&plan, &options).await;
    assert!(second.success);
    assert_eq!(std::fs::read(out.path().join("image/stamp")).unwrap(), stamp);
}
