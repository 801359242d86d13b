// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Checksum Value Object
//!
//! Algorithm-prefixed content hash naming an externally fetched blob. The
//! canonical string form — `sha256:<64 hex>` — is also the file name the
//! blob lives under in its per-kind cache directory, which gives the source
//! cache its core invariant for free: a file's verified checksum equals its
//! name, or the file does not exist.
//!
//! ## Supported algorithms
//!
//! SHA-256 is the default and the only algorithm the engine computes itself.
//! SHA-384 and SHA-512 are accepted in manifests for sources whose upstream
//! metadata publishes them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::fmt::{self, Display};

use crate::error::build_error::BuildError;

/// Hash algorithms accepted in source declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChecksumAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl ChecksumAlgorithm {
    /// The lowercase prefix used in the canonical string form.
    pub fn prefix(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Sha384 => "sha384",
            ChecksumAlgorithm::Sha512 => "sha512",
        }
    }

    /// Digest length in hex characters.
    pub fn hex_len(&self) -> usize {
        match self {
            ChecksumAlgorithm::Sha256 => 64,
            ChecksumAlgorithm::Sha384 => 96,
            ChecksumAlgorithm::Sha512 => 128,
        }
    }

    fn parse(prefix: &str) -> Result<Self, BuildError> {
        match prefix {
            "sha256" => Ok(ChecksumAlgorithm::Sha256),
            "sha384" => Ok(ChecksumAlgorithm::Sha384),
            "sha512" => Ok(ChecksumAlgorithm::Sha512),
            other => Err(BuildError::manifest_invalid(format!(
                "unsupported checksum algorithm: {:?}",
                other
            ))),
        }
    }
}

/// Algorithm-prefixed content hash (`sha256:<hex>`).
///
/// The canonical string form is stable and filesystem-safe; the source
/// cache uses it verbatim as the cached file's name.
///
/// # Examples
///
/// ```
/// use imageforge_domain::{Checksum, ChecksumAlgorithm};
///
/// let sum = Checksum::of_bytes(b"hello world");
/// assert_eq!(sum.algorithm(), ChecksumAlgorithm::Sha256);
/// assert!(sum.verify(b"hello world"));
/// assert!(!sum.verify(b"hello worlds"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum {
    algorithm: ChecksumAlgorithm,
    hex: String,
}

impl Checksum {
    /// Computes the SHA-256 checksum of a byte slice.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self {
            algorithm: ChecksumAlgorithm::Sha256,
            hex: hex::encode(digest),
        }
    }

    /// Parses the canonical `algorithm:hex` form.
    ///
    /// # Errors
    ///
    /// Returns `BuildError::ManifestInvalid` for an unknown algorithm
    /// prefix, a missing separator, or a digest of the wrong length.
    pub fn from_string(s: &str) -> Result<Self, BuildError> {
        let (prefix, hex_part) = s.split_once(':').ok_or_else(|| {
            BuildError::manifest_invalid(format!("checksum missing algorithm prefix: {:?}", s))
        })?;
        let algorithm = ChecksumAlgorithm::parse(prefix)?;
        if hex_part.len() != algorithm.hex_len() {
            return Err(BuildError::manifest_invalid(format!(
                "{} checksum must be {} hex characters, got {}",
                prefix,
                algorithm.hex_len(),
                hex_part.len()
            )));
        }
        if !hex_part.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(BuildError::manifest_invalid(format!(
                "checksum contains non-hex characters: {:?}",
                s
            )));
        }
        Ok(Self {
            algorithm,
            hex: hex_part.to_owned(),
        })
    }

    /// The declared algorithm.
    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// The digest in lowercase hex, without the prefix.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Verifies a byte slice against this checksum.
    pub fn verify(&self, bytes: &[u8]) -> bool {
        let actual = match self.algorithm {
            ChecksumAlgorithm::Sha256 => hex::encode(Sha256::digest(bytes)),
            ChecksumAlgorithm::Sha384 => hex::encode(Sha384::digest(bytes)),
            ChecksumAlgorithm::Sha512 => hex::encode(Sha512::digest(bytes)),
        };
        actual == self.hex
    }

    /// The canonical string form, also used as the cache file name.
    pub fn to_filename(&self) -> String {
        self.to_string()
    }
}

impl Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.prefix(), self.hex)
    }
}

impl std::str::FromStr for Checksum {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_string(s)
    }
}

impl TryFrom<String> for Checksum {
    type Error = BuildError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_string(&s)
    }
}

impl From<Checksum> for String {
    fn from(c: Checksum) -> Self {
        c.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_of_bytes_verifies_itself() {
        let sum = Checksum::of_bytes(b"imageforge");
        assert!(sum.verify(b"imageforge"));
        assert!(!sum.verify(b"imageforgE"));
    }

    #[test]
    fn test_round_trip_through_string() {
        let sum = Checksum::of_bytes(b"data");
        let parsed = Checksum::from_string(&sum.to_string()).unwrap();
        assert_eq!(sum, parsed);
    }

    #[test]
    fn test_filename_equals_display() {
        let sum = Checksum::of_bytes(b"data");
        assert_eq!(sum.to_filename(), sum.to_string());
        assert!(sum.to_filename().starts_with("sha256:"));
    }

    #[test]
    fn test_rejects_missing_prefix() {
        assert!(Checksum::from_string(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_rejects_unknown_algorithm() {
        let err = Checksum::from_string(&format!("md5:{}", "a".repeat(32)));
        assert!(err.is_err());
    }

    #[test]
    fn test_rejects_wrong_digest_length() {
        assert!(Checksum::from_string("sha256:abcd").is_err());
        assert!(Checksum::from_string(&format!("sha512:{}", "a".repeat(64))).is_err());
    }

    #[test]
    fn test_accepts_sha512() {
        let sum = Checksum::from_string(&format!("sha512:{}", "0".repeat(128))).unwrap();
        assert_eq!(sum.algorithm(), ChecksumAlgorithm::Sha512);
    }

    proptest! {
        #[test]
        fn prop_of_bytes_round_trips(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            let sum = Checksum::of_bytes(&data);
            let parsed = Checksum::from_string(&sum.to_string()).unwrap();
            prop_assert_eq!(&sum, &parsed);
            prop_assert!(parsed.verify(&data));
        }

        #[test]
        fn prop_distinct_bytes_rarely_collide(a in proptest::collection::vec(any::<u8>(), 1..64),
                                              b in proptest::collection::vec(any::<u8>(), 1..64)) {
            prop_assume!(a != b);
            prop_assert_ne!(Checksum::of_bytes(&a), Checksum::of_bytes(&b));
        }
    }
}
