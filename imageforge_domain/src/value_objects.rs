// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Value Objects
//!
//! Immutable, validated identifier types used across the engine. Both types
//! here are defined entirely by their attributes: two `ObjectId`s with the
//! same hex digits are the same identity, wherever they came from.
//!
//! - [`ObjectId`] — the fingerprint identity of a pipeline, stage, or
//!   committed object.
//! - [`Checksum`] — an algorithm-prefixed content hash naming a cached
//!   source blob; its string form doubles as the cache filename.

pub mod checksum;
pub mod object_id;

pub use checksum::{Checksum, ChecksumAlgorithm};
pub use object_id::ObjectId;
