// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Protocol Envelope
//!
//! One frame carries one envelope: a request (`{method, args}` with a
//! per-channel monotonically increasing id), a reply (result or error for
//! one request id), or an unsolicited event (progress or log line). The
//! close request uses the reserved method name [`METHOD_CLOSE`]; a helper
//! acknowledges it and exits its serve loop.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use imageforge_domain::BuildError;

/// Reserved method name asking a helper to release its resource and exit.
pub const METHOD_CLOSE: &str = "close";

/// One message on the channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Envelope {
    Request {
        id: u64,
        method: String,
        #[serde(default)]
        args: Value,
    },
    Reply {
        id: u64,
        #[serde(flatten)]
        body: ReplyBody,
    },
    Event {
        payload: EventPayload,
    },
}

/// Success or failure of one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyBody {
    Result(Value),
    Error(String),
}

/// Unsolicited notification from a helper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPayload {
    /// A captured log line.
    Message { text: String },
    /// Transfer or preparation progress.
    Progress { done: u64, total: u64 },
}

impl Envelope {
    pub fn request(id: u64, method: impl Into<String>, args: Value) -> Self {
        Envelope::Request {
            id,
            method: method.into(),
            args,
        }
    }

    pub fn reply_ok(id: u64, result: Value) -> Self {
        Envelope::Reply {
            id,
            body: ReplyBody::Result(result),
        }
    }

    pub fn reply_err(id: u64, error: impl Into<String>) -> Self {
        Envelope::Reply {
            id,
            body: ReplyBody::Error(error.into()),
        }
    }
}

/// Serializes an error for a reply frame, preserving its kind.
pub fn encode_wire_error(error: &BuildError) -> String {
    format!("{}\u{1f}{}", error.kind(), error)
}

/// Reconstructs an error from its wire form. Unknown kinds degrade to
/// `internal`, keeping the message.
pub fn decode_wire_error(text: &str) -> BuildError {
    let (kind, message) = match text.split_once('\u{1f}') {
        Some((kind, message)) => (kind, message.to_owned()),
        None => return BuildError::internal(text.to_owned()),
    };
    match kind {
        "manifest-invalid" => BuildError::ManifestInvalid(message),
        "module-unknown" => BuildError::ModuleUnknown(message),
        "cycle-detected" => BuildError::CycleDetected(message),
        "source-unresolved" => BuildError::SourceUnresolved(message),
        "source-fetch" => BuildError::SourceFetch(message),
        "source-checksum" => BuildError::SourceChecksum(message),
        "source-auth" => BuildError::SourceAuth(message),
        "store-busy" => BuildError::StoreBusy(message),
        "store-io" => BuildError::StoreIo(message),
        "store-corrupt" => BuildError::StoreCorrupt(message),
        "sandbox-setup" => BuildError::SandboxSetup(message),
        "module-timeout" => BuildError::ModuleTimeout(message),
        "host-service-protocol" => BuildError::HostServiceProtocol(message),
        "device-open" => BuildError::DeviceOpen(message),
        "mount-failed" => BuildError::MountFailed(message),
        "cancelled" => BuildError::Cancelled(message),
        _ => BuildError::Internal(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_round_trip() {
        let env = Envelope::request(7, "open", json!({ "parent": null }));
        let text = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&text).unwrap();
        match back {
            Envelope::Request { id, method, args } => {
                assert_eq!(id, 7);
                assert_eq!(method, "open");
                assert_eq!(args["parent"], Value::Null);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_reply_bodies_are_mutually_exclusive_on_the_wire() {
        let ok = serde_json::to_value(Envelope::reply_ok(1, json!({ "path": "/dev/loop0" }))).unwrap();
        assert!(ok["reply"].get("result").is_some());
        assert!(ok["reply"].get("error").is_none());

        let err = serde_json::to_value(Envelope::reply_err(1, "no free loop device")).unwrap();
        assert!(err["reply"].get("error").is_some());
        assert!(err["reply"].get("result").is_none());
    }

    #[test]
    fn test_event_round_trip() {
        let env = Envelope::Event {
            payload: EventPayload::Progress { done: 3, total: 10 },
        };
        let text = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&text).unwrap();
        match back {
            Envelope::Event {
                payload: EventPayload::Progress { done, total },
            } => {
                assert_eq!((done, total), (3, 10));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        assert!(serde_json::from_str::<Envelope>("{\"nope\":1}").is_err());
        assert!(serde_json::from_str::<Envelope>("not json").is_err());
    }

    #[test]
    fn test_wire_errors_round_trip_their_kind() {
        let original = BuildError::DeviceOpen("loop0 busy".into());
        let decoded = decode_wire_error(&encode_wire_error(&original));
        assert_eq!(decoded.kind(), "device-open");
        assert!(decoded.to_string().contains("loop0 busy"));
    }

    #[test]
    fn test_unknown_wire_kind_degrades_to_internal() {
        let decoded = decode_wire_error("flux-capacitor\u{1f}out of plutonium");
        assert_eq!(decoded.kind(), "internal");
        let bare = decode_wire_error("just text");
        assert_eq!(bare.kind(), "internal");
    }
}
