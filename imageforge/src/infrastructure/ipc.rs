// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Host-Service Protocol
//!
//! Length-prefixed UTF-8 JSON messages between the engine and its helper
//! processes. [`message`] defines the envelope; [`channel`] the framed
//! transport, the client used by the runner, and the serve loop run inside
//! helpers.

pub mod channel;
pub mod message;

pub use channel::{
    serve_loop, EventSender, HostService, MessageChannel, MessageSink, MessageStream,
    ServiceClient,
};
pub use message::{
    decode_wire_error, encode_wire_error, Envelope, EventPayload, ReplyBody, METHOD_CLOSE,
};
