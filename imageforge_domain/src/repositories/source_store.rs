// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Source Store Port
//!
//! Contract for the content-addressed source cache. The executor calls
//! `ensure` with everything a stage references before launching the stage;
//! the implementation fans out to per-kind helpers with bounded
//! parallelism and only returns once every blob is present and verified.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::build_error::BuildResult;
use crate::value_objects::checksum::Checksum;

/// Content-addressed cache of externally fetched blobs, one directory per
/// source kind.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Ensures every referenced checksum of `kind` is present and verified.
    ///
    /// # Errors
    ///
    /// `source-fetch` after exhausted retries, `source-checksum` when the
    /// fetched bytes do not hash to the declared checksum, `source-auth`
    /// when credentials are missing or rejected.
    async fn ensure(&self, kind: &str, entries: &BTreeMap<Checksum, Value>) -> BuildResult<()>;

    /// Whether the blob is already cached.
    async fn contains(&self, kind: &str, checksum: &Checksum) -> BuildResult<bool>;

    /// Path of a cached blob; the file's name is the checksum's canonical
    /// string form.
    fn path_of(&self, kind: &str, checksum: &Checksum) -> PathBuf;
}
