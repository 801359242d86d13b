// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Stage Runner Port
//!
//! Contract for executing one stage. The pipeline executor decides *which*
//! stages run and in what order; the runner owns *how*: input preparation,
//! device and mount services, the sandbox, the module invocation, and the
//! strictly reversed teardown. The production implementation lives in the
//! infrastructure layer; executor tests substitute a recording stub.

use async_trait::async_trait;
use serde_json::Value;

use crate::entities::resolved::{ResolvedPipeline, ResolvedStage};
use crate::error::build_error::BuildResult;
use crate::value_objects::object_id::ObjectId;

/// Everything the runner needs for one stage execution.
#[derive(Debug)]
pub struct StageRun<'a> {
    /// The owning pipeline (runner identity, build environment).
    pub pipeline: &'a ResolvedPipeline,
    /// The stage to execute.
    pub stage: &'a ResolvedStage,
    /// Committed tree of the preceding stage, seeding the workspace.
    pub base: Option<&'a ObjectId>,
}

/// Executes one module invocation inside its sandbox.
#[async_trait]
pub trait StageRunner: Send + Sync {
    /// Runs the stage to completion and commits its tree under the stage
    /// id. Returns the module's structured metadata.
    ///
    /// Teardown of mounts, devices, and inputs happens in reverse start
    /// order whether or not the module succeeded; on failure the workspace
    /// is discarded and no object is committed.
    async fn run(&self, request: StageRun<'_>) -> BuildResult<Value>;
}
