// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Object Identifier Value Object
//!
//! `ObjectId` is the content-derived identity used everywhere the engine
//! needs to name a pipeline, a stage, or a committed tree: the fingerprint
//! function produces one, the object store keys its directories by one, and
//! the manifest's pipeline references resolve to one.
//!
//! ## Invariants
//!
//! - Exactly 64 lowercase hexadecimal characters (a SHA-256 digest).
//! - Immutable once constructed; equality and ordering are byte-wise on the
//!   hex form.
//! - The directory name of every committed object equals the id recomputed
//!   from its fingerprint input — the store verifies this on read.
//!
//! ## Why a dedicated type
//!
//! Ids travel through manifests, wire messages, directory names, and log
//! lines. A validated newtype means a malformed id is rejected once, at the
//! boundary, instead of surfacing later as a store lookup for a directory
//! that cannot exist.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::error::build_error::BuildError;

/// Length of the hex form: SHA-256 → 32 bytes → 64 hex characters.
const HEX_LEN: usize = 64;

/// Content-derived identifier for pipelines, stages, and committed objects.
///
/// Constructed either by the fingerprint service (from canonical content)
/// or by parsing a trusted hex string (manifest references, store directory
/// names). Serializes as a plain JSON string.
///
/// # Examples
///
/// ```
/// use imageforge_domain::ObjectId;
///
/// let id: ObjectId = "d8022f2060ad6efd297ab73dcce5598c723c9e5a8a8fe77e5a5b3dcd2f9b0a55"
///     .parse()
///     .unwrap();
/// assert_eq!(id.short(), "d8022f20");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectId(String);

impl ObjectId {
    /// Creates an id from a raw SHA-256 digest.
    pub fn from_digest(digest: &[u8; 32]) -> Self {
        Self(hex::encode(digest))
    }

    /// Parses and validates a hex string.
    ///
    /// # Errors
    ///
    /// Returns `BuildError::ManifestInvalid` when the string is not exactly
    /// 64 lowercase hex characters.
    pub fn from_string(s: &str) -> Result<Self, BuildError> {
        if s.len() != HEX_LEN {
            return Err(BuildError::manifest_invalid(format!(
                "object id must be {} hex characters, got {} ({:?})",
                HEX_LEN,
                s.len(),
                s
            )));
        }
        if !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(BuildError::manifest_invalid(format!(
                "object id contains non-hex characters: {:?}",
                s
            )));
        }
        Ok(Self(s.to_owned()))
    }

    /// The full 64-character hex form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// An eight-character prefix for log lines and progress output.
    ///
    /// Collisions in the short form are cosmetic only; every durable use
    /// (store keys, manifest references) carries the full id.
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ObjectId {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_string(s)
    }
}

impl TryFrom<String> for ObjectId {
    type Error = BuildError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_string(&s)
    }
}

impl From<ObjectId> for String {
    fn from(id: ObjectId) -> Self {
        id.0
    }
}

impl AsRef<str> for ObjectId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
