// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Fingerprint Service
//!
//! Deterministic content hashing for pipelines and stages. The fingerprint
//! of a stage is a SHA-256 over a canonical serialization of everything that
//! can change what the stage produces: module name, options, input
//! identities in a fixed order, the build-environment id, declared devices
//! and mounts, and the id of the preceding stage (so a change anywhere
//! upstream re-identifies everything downstream).
//!
//! ## Canonical form
//!
//! - Object keys sorted lexicographically by their UTF-8 bytes.
//! - Arrays keep their order.
//! - Numbers render in `serde_json` display form; strings in JSON escaping.
//! - No insignificant whitespace.
//!
//! Two independent serializations of structurally equal values agree byte
//! for byte, so equal stages hash equal everywhere. Collisions imply
//! identity: the engine treats equal ids as proof of byte-identical output
//! trees.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::value_objects::object_id::ObjectId;

/// Canonical-JSON hashing entry points.
///
/// A zero-sized service: all functions are pure and associated, following
/// the domain-service convention of keeping hashing policy in one place.
pub struct Fingerprint;

impl Fingerprint {
    /// Renders a JSON value in canonical form.
    pub fn canonicalize(value: &Value) -> String {
        let mut out = String::new();
        Self::write_canonical(value, &mut out);
        out
    }

    /// Hashes a JSON value's canonical form into an [`ObjectId`].
    pub fn digest(value: &Value) -> ObjectId {
        let canonical = Self::canonicalize(value);
        let digest = Sha256::digest(canonical.as_bytes());
        ObjectId::from_digest(&digest.into())
    }

    fn write_canonical(value: &Value, out: &mut String) {
        match value {
            Value::Null => out.push_str("null"),
            Value::Bool(true) => out.push_str("true"),
            Value::Bool(false) => out.push_str("false"),
            Value::Number(n) => out.push_str(&n.to_string()),
            // serde_json's string serialization is deterministic and
            // infallible for &str.
            Value::String(s) => {
                out.push_str(&serde_json::to_string(s).expect("string serialization"))
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    Self::write_canonical(item, out);
                }
                out.push(']');
            }
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort_unstable();
                out.push('{');
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(key).expect("string serialization"));
                    out.push(':');
                    Self::write_canonical(&map[key.as_str()], out);
                }
                out.push('}');
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_canonical_form_sorts_keys() {
        let value = json!({ "b": 1, "a": { "z": true, "y": null } });
        assert_eq!(
            Fingerprint::canonicalize(&value),
            r#"{"a":{"y":null,"z":true},"b":1}"#
        );
    }

    #[test]
    fn test_canonical_form_preserves_array_order() {
        let value = json!([3, 1, 2]);
        assert_eq!(Fingerprint::canonicalize(&value), "[3,1,2]");
    }

    #[test]
    fn test_digest_is_key_order_independent() {
        let a: Value = serde_json::from_str(r#"{"x": 1, "y": 2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y": 2, "x": 1}"#).unwrap();
        assert_eq!(Fingerprint::digest(&a), Fingerprint::digest(&b));
    }

    #[test]
    fn test_digest_is_value_sensitive() {
        let a = json!({ "options": { "level": 1 } });
        let b = json!({ "options": { "level": 2 } });
        assert_ne!(Fingerprint::digest(&a), Fingerprint::digest(&b));
    }

    #[test]
    fn test_digest_distinguishes_types() {
        assert_ne!(
            Fingerprint::digest(&json!("1")),
            Fingerprint::digest(&json!(1))
        );
        assert_ne!(
            Fingerprint::digest(&json!(null)),
            Fingerprint::digest(&json!(false))
        );
    }

    #[test]
    fn test_string_escaping_is_canonical() {
        let value = json!({ "msg": "a\"b\\c\n" });
        let canonical = Fingerprint::canonicalize(&value);
        let reparsed: Value = serde_json::from_str(&canonical).unwrap();
        assert_eq!(reparsed, value);
    }

    fn arb_json(depth: u32) -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-z0-9 ]{0,16}".prop_map(Value::String),
        ];
        leaf.prop_recursive(depth, 64, 8, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                proptest::collection::btree_map("[a-z]{1,8}", inner, 0..6)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_canonical_form_is_a_fixed_point(value in arb_json(3)) {
            let once = Fingerprint::canonicalize(&value);
            let reparsed: Value = serde_json::from_str(&once).unwrap();
            let twice = Fingerprint::canonicalize(&reparsed);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_digest_is_deterministic(value in arb_json(3)) {
            prop_assert_eq!(Fingerprint::digest(&value), Fingerprint::digest(&value));
        }
    }
}
