// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Inspect-mode properties: deterministic ids, fixed-point output, and
//! the documented id chaining between dependent stages and pipelines.

use imageforge::application::use_cases::inspect::InspectUseCase;

use crate::common::test_registry;

const MANIFEST: &str = r#"{
    "version": "2",
    "pipelines": [
        { "name": "build", "stages": [ { "type": "org.imageforge.noop", "options": { "packages": ["gcc"] } } ] },
        { "name": "image", "build": "name:build", "stages": [
            { "type": "org.imageforge.copy", "options": {} },
            { "type": "org.imageforge.noop", "options": {} }
        ] }
    ]
}"#;

#[test]
fn test_inspect_output_is_a_fixed_point() {
    let use_case = InspectUseCase::new(test_registry());
    let first = use_case.execute(MANIFEST).unwrap();
    let second = use_case.execute(MANIFEST).unwrap();
    assert_eq!(first, second, "same manifest, same ids, same output");
}

#[test]
fn test_all_ids_are_distinct_and_chained() {
    let plan = InspectUseCase::new(test_registry()).execute(MANIFEST).unwrap();

    let build_id = plan["pipelines"][0]["id"].as_str().unwrap();
    let image = &plan["pipelines"][1];
    let stage_a = image["stages"][0]["id"].as_str().unwrap();
    let stage_b = image["stages"][1]["id"].as_str().unwrap();

    assert_ne!(build_id, stage_a);
    assert_ne!(stage_a, stage_b);
    // A pipeline's output id is its final stage's id.
    assert_eq!(image["id"].as_str().unwrap(), stage_b);
    // The resolved build reference carries the upstream pipeline's id.
    assert_eq!(image["build"].as_str().unwrap(), build_id);
}

#[test]
fn test_upstream_change_ripples_into_downstream_ids() {
    let use_case = InspectUseCase::new(test_registry());
    let original = use_case.execute(MANIFEST).unwrap();
    let changed_manifest = MANIFEST.replace("\"gcc\"", "\"clang\"");
    let changed = use_case.execute(&changed_manifest).unwrap();

    assert_ne!(
        original["pipelines"][0]["id"], changed["pipelines"][0]["id"],
        "changed options change the build pipeline id"
    );
    assert_ne!(
        original["pipelines"][1]["id"], changed["pipelines"][1]["id"],
        "the dependent pipeline re-identifies through its build reference"
    );
}
