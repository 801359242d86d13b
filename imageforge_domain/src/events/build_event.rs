// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Build Event Records
//!
//! The structured records the engine emits while building: which stage is
//! active, how far along the run is, what modules and host services print,
//! what metadata a module produced, and the single terminal result. These
//! are plain serde types; infrastructure renders them either as a JSON-seq
//! stream (one record per RS-delimited JSON value) or as human log lines.
//!
//! The terminal [`ResultRecord`] is the machine-readable contract: it names
//! every exported pipeline with its output path, the outcome of every stage
//! (ran or reused from cache), and — on failure — the failing pipeline,
//! stage, module, error kind, and message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::build_error::BuildError;
use crate::value_objects::object_id::ObjectId;

/// Sink for build events. Implementations must tolerate being called from
/// multiple tasks; ordering is per-caller.
pub trait Monitor: Send + Sync {
    fn record(&self, event: BuildEvent);
}

/// No-op monitor for tests and quiet paths.
pub struct NullMonitor;

impl Monitor for NullMonitor {
    fn record(&self, _event: BuildEvent) {}
}

/// One record on the result channel.
///
/// Externally tagged: serializes as `{"context": {…}}`, `{"progress": {…}}`
/// and so on, one key per record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildEvent {
    Context(ContextRecord),
    Progress(ProgressRecord),
    Message(MessageRecord),
    Metadata(MetadataRecord),
    Result(ResultRecord),
}

/// Where a log message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventOrigin {
    Engine,
    Module,
    HostService,
}

/// Announces the pipeline/stage subsequent records refer to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextRecord {
    /// Pipeline name; empty for anonymous pipelines.
    pub pipeline: String,
    /// Pipeline output id.
    pub pipeline_id: ObjectId,
    /// Active stage id, absent between stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<ObjectId>,
    /// Active module name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
}

/// Done/total counters, nested one level: the run over pipelines, each
/// pipeline over its stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCounter {
    pub done: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Pipelines completed / total.
    pub pipelines: ProgressCounter,
    /// Stages completed / total within the active pipeline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stages: Option<ProgressCounter>,
}

/// Human-readable log text captured from a module, a host service, or the
/// engine itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub origin: EventOrigin,
    pub text: String,
}

/// Structured data a module emitted on success; stored alongside the
/// object and forwarded verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub stage: ObjectId,
    pub data: Value,
}

/// Outcome of one stage in the terminal record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutcome {
    pub pipeline: String,
    pub id: ObjectId,
    pub module: String,
    /// True when the stage was reused from the object store without a
    /// module invocation.
    pub cached: bool,
}

/// Structured error in the terminal record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Stable kind string, e.g. `module-exit`.
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<ObjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
}

impl ErrorRecord {
    /// Builds the record from an error plus whatever context is known.
    pub fn from_error(
        error: &BuildError,
        pipeline: Option<String>,
        stage: Option<ObjectId>,
        module: Option<String>,
    ) -> Self {
        Self {
            kind: error.kind().to_owned(),
            message: error.to_string(),
            pipeline,
            stage,
            module,
        }
    }
}

/// The single terminal record of a run. Emitted exactly once, last.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub success: bool,
    /// When the run finished, engine clock.
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    /// Exported pipeline name → output path.
    #[serde(default)]
    pub exports: BTreeMap<String, String>,
    /// Every stage that ran or was reused, in execution order.
    #[serde(default)]
    pub stages: Vec<StageOutcome>,
}

impl ResultRecord {
    pub fn success(exports: BTreeMap<String, String>, stages: Vec<StageOutcome>) -> Self {
        Self {
            success: true,
            finished_at: Utc::now(),
            error: None,
            exports,
            stages,
        }
    }

    pub fn failure(error: ErrorRecord, stages: Vec<StageOutcome>) -> Self {
        Self {
            success: false,
            finished_at: Utc::now(),
            error: Some(error),
            exports: BTreeMap::new(),
            stages,
        }
    }
}
