// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Build use case end to end, without privileged paths: usage
//! validation, no-op rejection, and the empty-pipeline checkpoint flow
//! against a real store.

use std::sync::Arc;
use std::time::SystemTime;

use imageforge::application::use_cases::build::{BuildRequest, BuildUseCase};
use imageforge::infrastructure::config::EngineConfig;
use imageforge_domain::events::build_event::NullMonitor;

fn config(store: &std::path::Path) -> EngineConfig {
    EngineConfig {
        store_root: store.to_path_buf(),
        module_path: vec![],
        ..Default::default()
    }
}

fn request(manifest: &str) -> BuildRequest {
    BuildRequest {
        manifest_text: manifest.to_owned(),
        checkpoints: vec![],
        exports: vec![],
        output_dir: None,
        started_at: SystemTime::now(),
        privileged: false,
    }
}

const EMPTY_PIPELINE: &str = r#"{ "version": "2", "pipelines": [ { "name": "p", "stages": [] } ] }"#;

#[tokio::test]
async fn test_empty_pipeline_checkpoint_is_stable_across_runs() {
    let dir = tempfile::tempdir().unwrap();

    let mut req = request(EMPTY_PIPELINE);
    req.checkpoints = vec!["p".into()];
    let record = BuildUseCase::new(config(dir.path()), Arc::new(NullMonitor))
        .execute(req.clone())
        .await;
    assert!(record.success, "error: {:?}", record.error);

    let list_objects = || {
        let mut names: Vec<String> = std::fs::read_dir(dir.path().join("objects"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    };
    let first = list_objects();
    assert_eq!(first.len(), 1, "one empty object committed");

    // Rerun: same id, nothing new.
    let record = BuildUseCase::new(config(dir.path()), Arc::new(NullMonitor))
        .execute(req)
        .await;
    assert!(record.success);
    assert_eq!(list_objects(), first);
}

#[tokio::test]
async fn test_usage_errors_reject_before_building() {
    let dir = tempfile::tempdir().unwrap();

    // Export without an output directory and without checkpoints.
    let mut req = request(EMPTY_PIPELINE);
    req.exports = vec!["p".into()];
    let record = BuildUseCase::new(config(dir.path()), Arc::new(NullMonitor))
        .execute(req)
        .await;
    assert!(!record.success);
    assert_eq!(record.error.unwrap().kind, "manifest-invalid");

    // Nothing at all requested.
    let record = BuildUseCase::new(config(dir.path()), Arc::new(NullMonitor))
        .execute(request(EMPTY_PIPELINE))
        .await;
    assert!(!record.success);
    assert_eq!(record.error.unwrap().kind, "manifest-invalid");

    // Neither run created a store.
    assert!(!dir.path().join("objects").exists());
}

#[tokio::test]
async fn test_manifest_errors_abort_before_execution() {
    let dir = tempfile::tempdir().unwrap();

    // Unknown module (empty module path registers nothing).
    let mut req = request(
        r#"{
            "version": "2",
            "pipelines": [ { "name": "p", "stages": [ { "type": "org.imageforge.noop" } ] } ]
        }"#,
    );
    req.checkpoints = vec!["p".into()];
    let record = BuildUseCase::new(config(dir.path()), Arc::new(NullMonitor))
        .execute(req)
        .await;
    assert!(!record.success);
    assert_eq!(record.error.unwrap().kind, "module-unknown");
    assert!(!dir.path().join("objects").exists());

    // Unsupported version.
    let mut req = request(r#"{ "version": "9", "pipelines": [] }"#);
    req.checkpoints = vec!["p".into()];
    let record = BuildUseCase::new(config(dir.path()), Arc::new(NullMonitor))
        .execute(req)
        .await;
    assert!(!record.success);
    assert_eq!(record.error.unwrap().kind, "manifest-invalid");
}

#[tokio::test]
async fn test_export_of_empty_pipeline_materializes_tree() {
    let dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();

    let mut req = request(EMPTY_PIPELINE);
    req.exports = vec!["p".into()];
    req.output_dir = Some(out.path().to_path_buf());
    let record = BuildUseCase::new(config(dir.path()), Arc::new(NullMonitor))
        .execute(req)
        .await;
    assert!(record.success, "error: {:?}", record.error);
    assert_eq!(
        record.exports.get("p").map(String::as_str),
        Some(out.path().join("p").to_str().unwrap())
    );
    assert!(out.path().join("p").is_dir());
}
