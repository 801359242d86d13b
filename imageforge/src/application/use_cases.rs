// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Use cases the binary dispatches to, one file per operation.

pub mod build;
pub mod inspect;

pub use build::{BuildRequest, BuildUseCase};
pub use inspect::InspectUseCase;
