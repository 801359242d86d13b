// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Result-channel shape over a full run: RS-delimited JSON records,
//! context/progress interleaving, and exactly one terminal record that
//! comes last and names outcomes.

use std::sync::Arc;

use imageforge::application::services::pipeline_executor::{ExecutionOptions, PipelineExecutor};
use imageforge::infrastructure::monitoring::JsonSeqMonitor;

use crate::common::{open_store, resolve, SharedBuf, StampRunner};

const MANIFEST: &str = r#"{
    "version": "2",
    "pipelines": [
        { "name": "image", "stages": [
            { "type": "org.imageforge.noop", "options": { "n": 1 } },
            { "type": "org.imageforge.noop", "options": { "n": 2 } }
        ] }
    ]
}"#;

#[tokio::test]
async fn test_stream_shape_on_success() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    let buf = SharedBuf::new();
    let monitor = Arc::new(JsonSeqMonitor::new(buf.clone()));
    let plan = resolve(MANIFEST);

    let runner = StampRunner::new(store.clone());
    let record = PipelineExecutor::new(store, runner, monitor)
        .execute(&plan, &ExecutionOptions::default())
        .await;
    assert!(record.success);

    let records = buf.records();
    assert!(records.len() >= 4, "context, progress, metadata, result");

    // Context records announce the pipeline and each stage.
    let contexts: Vec<_> = records.iter().filter(|r| r.get("context").is_some()).collect();
    assert_eq!(contexts.len(), 3, "one pipeline context plus two stages");
    assert_eq!(contexts[0]["context"]["pipeline"], "image");
    assert!(contexts[1]["context"]["stage"].is_string());

    // Exactly one terminal record, last, listing both stage outcomes.
    let results: Vec<_> = records.iter().filter(|r| r.get("result").is_some()).collect();
    assert_eq!(results.len(), 1);
    assert!(records.last().unwrap().get("result").is_some());
    let result = &results[0]["result"];
    assert_eq!(result["success"], true);
    assert_eq!(result["stages"].as_array().unwrap().len(), 2);
    assert_eq!(result["stages"][0]["cached"], false);
}

#[tokio::test]
async fn test_stream_names_failure_context() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    let buf = SharedBuf::new();
    let monitor = Arc::new(JsonSeqMonitor::new(buf.clone()));
    let plan = resolve(
        r#"{
            "version": "2",
            "pipelines": [
                { "name": "broken", "stages": [ { "type": "org.imageforge.fail" } ] }
            ]
        }"#,
    );

    let runner = StampRunner::new(store.clone());
    let record = PipelineExecutor::new(store, runner, monitor)
        .execute(&plan, &ExecutionOptions::default())
        .await;
    assert!(!record.success);

    let records = buf.records();
    let terminal = records.last().unwrap();
    assert_eq!(terminal["result"]["success"], false);
    let error = &terminal["result"]["error"];
    assert_eq!(error["kind"], "module-exit");
    assert_eq!(error["pipeline"], "broken");
    assert_eq!(error["module"], "org.imageforge.fail");
    assert!(error["message"].as_str().unwrap().contains("synthetic failure"));
}
