// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Application Layer
//!
//! Orchestration above the infrastructure ports: the pipeline executor
//! walking the resolved DAG, and the use cases the binary dispatches to
//! (build, inspect).

pub mod services;
pub mod use_cases;

pub use services::pipeline_executor::{ExecutionOptions, PipelineExecutor};
pub use use_cases::build::BuildUseCase;
pub use use_cases::inspect::InspectUseCase;
