// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Persistent Stores
//!
//! The two content-addressed stores under the engine's store root:
//! committed object trees ([`object_store`]) and fetched source blobs
//! ([`source_cache`]), plus the shared filesystem helpers ([`fs_util`])
//! both rely on for atomic placement, freezing, and recursive removal.

pub mod fs_util;
pub mod object_store;
pub mod source_cache;

pub use object_store::FsObjectStore;
pub use source_cache::{FsSourceCache, SourceConnector};
