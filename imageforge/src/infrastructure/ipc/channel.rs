// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Framed Message Channel
//!
//! Transport for the host-service protocol: length-prefixed frames over a
//! `UnixStream`, each frame one JSON [`Envelope`]. The engine side uses
//! [`ServiceClient`] (strict call/reply with event forwarding); the helper
//! side runs [`serve_loop`] over a [`HostService`] implementation.
//!
//! Framing is `LengthDelimitedCodec` — a u32 big-endian length prefix —
//! so a malformed or truncated frame surfaces as a protocol error rather
//! than a desynchronized stream.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use imageforge_domain::{BuildError, BuildResult};

use super::message::{decode_wire_error, encode_wire_error, Envelope, EventPayload, ReplyBody, METHOD_CLOSE};

type Transport = Framed<UnixStream, LengthDelimitedCodec>;

/// Sending half of a split channel.
pub struct MessageSink(SplitSink<Transport, Bytes>);

impl MessageSink {
    pub async fn send(&mut self, envelope: &Envelope) -> BuildResult<()> {
        let bytes = serde_json::to_vec(envelope)
            .map_err(|e| BuildError::protocol(format!("encode: {e}")))?;
        self.0
            .send(Bytes::from(bytes))
            .await
            .map_err(|e| BuildError::protocol(format!("send: {e}")))
    }
}

/// Receiving half of a split channel.
pub struct MessageStream(SplitStream<Transport>);

impl MessageStream {
    /// Reads the next envelope; `None` on clean EOF.
    pub async fn recv(&mut self) -> BuildResult<Option<Envelope>> {
        match self.0.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(BuildError::protocol(format!("recv: {e}"))),
            Some(Ok(frame)) => {
                let envelope = serde_json::from_slice(&frame)
                    .map_err(|e| BuildError::protocol(format!("malformed frame: {e}")))?;
                Ok(Some(envelope))
            }
        }
    }
}

/// Bidirectional framed channel over one `UnixStream`.
pub struct MessageChannel {
    sink: MessageSink,
    stream: MessageStream,
}

impl MessageChannel {
    pub fn new(stream: UnixStream) -> Self {
        let framed = Framed::new(stream, LengthDelimitedCodec::new());
        let (sink, stream) = framed.split();
        Self {
            sink: MessageSink(sink),
            stream: MessageStream(stream),
        }
    }

    pub async fn send(&mut self, envelope: &Envelope) -> BuildResult<()> {
        self.sink.send(envelope).await
    }

    pub async fn recv(&mut self) -> BuildResult<Option<Envelope>> {
        self.stream.recv().await
    }

    /// Splits into independently owned halves, for select loops.
    pub fn into_split(self) -> (MessageSink, MessageStream) {
        (self.sink, self.stream)
    }
}

/// Clonable handle a service uses to emit events while handling a request.
#[derive(Clone)]
pub struct EventSender(mpsc::UnboundedSender<EventPayload>);

impl EventSender {
    pub fn message(&self, text: impl Into<String>) {
        let _ = self.0.send(EventPayload::Message { text: text.into() });
    }

    pub fn progress(&self, done: u64, total: u64) {
        let _ = self.0.send(EventPayload::Progress { done, total });
    }

    #[cfg(test)]
    pub(crate) fn for_tests(tx: mpsc::UnboundedSender<EventPayload>) -> Self {
        Self(tx)
    }
}

/// The helper-side contract: one service owns one resource and answers
/// methods until it receives the close request.
#[async_trait]
pub trait HostService: Send {
    /// Handles one request; the returned value becomes the reply.
    async fn dispatch(&mut self, method: &str, args: Value, events: &EventSender)
        -> BuildResult<Value>;

    /// Releases the owned resource. Invoked exactly once, on close.
    async fn shutdown(&mut self) -> BuildResult<()> {
        Ok(())
    }
}

/// Runs a service's request loop until close or EOF.
///
/// Events emitted during dispatch are interleaved with replies on the same
/// channel; the engine forwards them to its monitor.
pub async fn serve_loop(channel: MessageChannel, service: &mut dyn HostService) -> BuildResult<()> {
    let (mut sink, mut stream) = channel.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let events = EventSender(tx);

    loop {
        tokio::select! {
            maybe_event = rx.recv() => {
                if let Some(payload) = maybe_event {
                    sink.send(&Envelope::Event { payload }).await?;
                }
            }
            frame = stream.recv() => {
                match frame? {
                    // Engine went away; release the resource and stop.
                    None => {
                        service.shutdown().await.ok();
                        break;
                    }
                    Some(Envelope::Request { id, method, args }) => {
                        if method == METHOD_CLOSE {
                            let outcome = service.shutdown().await;
                            let reply = match outcome {
                                Ok(()) => Envelope::reply_ok(id, Value::Null),
                                Err(e) => Envelope::reply_err(id, encode_wire_error(&e)),
                            };
                            sink.send(&reply).await?;
                            break;
                        }
                        // Drain events raised during dispatch before the reply
                        // so the engine observes them in causal order.
                        let outcome = service.dispatch(&method, args, &events).await;
                        while let Ok(payload) = rx.try_recv() {
                            sink.send(&Envelope::Event { payload }).await?;
                        }
                        let reply = match outcome {
                            Ok(result) => Envelope::reply_ok(id, result),
                            Err(e) => Envelope::reply_err(id, encode_wire_error(&e)),
                        };
                        sink.send(&reply).await?;
                    }
                    Some(other) => {
                        return Err(BuildError::protocol(format!(
                            "unexpected envelope from engine: {other:?}"
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}

/// Engine-side handle to one running helper process.
///
/// Calls are strictly sequential: one outstanding request per channel,
/// matching the monotonically increasing id. Events arriving between a
/// request and its reply are forwarded to the supplied callback.
pub struct ServiceClient {
    name: String,
    channel: MessageChannel,
    next_id: u64,
    child: Option<tokio::process::Child>,
    on_event: Option<Box<dyn Fn(&str, &EventPayload) + Send + Sync>>,
}

impl ServiceClient {
    /// Wraps an established channel; `child` is the helper process handle
    /// when the service runs out of process.
    pub fn new(name: impl Into<String>, channel: MessageChannel) -> Self {
        Self {
            name: name.into(),
            channel,
            next_id: 0,
            child: None,
            on_event: None,
        }
    }

    pub fn with_child(mut self, child: tokio::process::Child) -> Self {
        self.child = Some(child);
        self
    }

    /// Installs the event forwarder (service name, payload).
    pub fn with_event_handler(
        mut self,
        handler: impl Fn(&str, &EventPayload) + Send + Sync + 'static,
    ) -> Self {
        self.on_event = Some(Box::new(handler));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Issues one request and awaits its reply, forwarding interleaved
    /// events.
    pub async fn call(&mut self, method: &str, args: Value) -> BuildResult<Value> {
        let id = self.next_id;
        self.next_id += 1;
        self.channel
            .send(&Envelope::request(id, method, args))
            .await?;
        loop {
            match self.channel.recv().await? {
                None => {
                    return Err(BuildError::protocol(format!(
                        "{}: channel closed awaiting reply to {method}",
                        self.name
                    )));
                }
                Some(Envelope::Event { payload }) => {
                    if let Some(handler) = &self.on_event {
                        handler(&self.name, &payload);
                    }
                }
                Some(Envelope::Reply { id: reply_id, body }) => {
                    if reply_id != id {
                        return Err(BuildError::protocol(format!(
                            "{}: reply id {reply_id} does not match request id {id}",
                            self.name
                        )));
                    }
                    return match body {
                        ReplyBody::Result(value) => Ok(value),
                        ReplyBody::Error(text) => Err(decode_wire_error(&text)),
                    };
                }
                Some(Envelope::Request { .. }) => {
                    return Err(BuildError::protocol(format!(
                        "{}: unexpected request from service",
                        self.name
                    )));
                }
            }
        }
    }

    /// Sends the close request, waits out the grace period, and kills the
    /// helper if it has not exited. Always waits for process exit before
    /// returning (no leaked helpers).
    pub async fn close(mut self, grace: Duration) -> BuildResult<()> {
        let close_outcome =
            tokio::time::timeout(grace, self.call(METHOD_CLOSE, Value::Null)).await;
        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(_status)) => {}
                Ok(Err(e)) => {
                    return Err(BuildError::protocol(format!(
                        "{}: wait failed: {e}",
                        self.name
                    )));
                }
                Err(_elapsed) => {
                    tracing::warn!(service = %self.name, "helper unresponsive, killing");
                    child.kill().await.ok();
                    child.wait().await.ok();
                }
            }
        }
        match close_outcome {
            Ok(Ok(_)) | Err(_) => Ok(()),
            Ok(Err(e)) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoService {
        closed: bool,
    }

    #[async_trait]
    impl HostService for EchoService {
        async fn dispatch(
            &mut self,
            method: &str,
            args: Value,
            events: &EventSender,
        ) -> BuildResult<Value> {
            match method {
                "echo" => {
                    events.message("echoing");
                    Ok(args)
                }
                "fail" => Err(BuildError::DeviceOpen("no free loop device".into())),
                other => Err(BuildError::protocol(format!("unknown method {other}"))),
            }
        }

        async fn shutdown(&mut self) -> BuildResult<()> {
            self.closed = true;
            Ok(())
        }
    }

    async fn pair() -> (MessageChannel, MessageChannel) {
        let (a, b) = UnixStream::pair().unwrap();
        (MessageChannel::new(a), MessageChannel::new(b))
    }

    #[tokio::test]
    async fn test_call_reply_round_trip() {
        let (engine_side, service_side) = pair().await;
        let server = tokio::spawn(async move {
            let mut service = EchoService { closed: false };
            serve_loop(service_side, &mut service).await.unwrap();
            service.closed
        });

        let mut client = ServiceClient::new("echo", engine_side);
        let reply = client.call("echo", json!({ "n": 1 })).await.unwrap();
        assert_eq!(reply, json!({ "n": 1 }));

        client.close(Duration::from_secs(1)).await.unwrap();
        assert!(server.await.unwrap(), "shutdown must run on close");
    }

    #[tokio::test]
    async fn test_events_are_forwarded_before_reply() {
        let (engine_side, service_side) = pair().await;
        tokio::spawn(async move {
            let mut service = EchoService { closed: false };
            serve_loop(service_side, &mut service).await.ok();
        });

        let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let mut client =
            ServiceClient::new("echo", engine_side).with_event_handler(move |name, payload| {
                if let EventPayload::Message { text } = payload {
                    seen_clone.lock().push(format!("{name}: {text}"));
                }
            });
        client.call("echo", json!(null)).await.unwrap();
        assert_eq!(seen.lock().as_slice(), ["echo: echoing"]);
    }

    #[tokio::test]
    async fn test_service_errors_keep_their_kind() {
        let (engine_side, service_side) = pair().await;
        tokio::spawn(async move {
            let mut service = EchoService { closed: false };
            serve_loop(service_side, &mut service).await.ok();
        });

        let mut client = ServiceClient::new("loop", engine_side);
        let err = client.call("fail", Value::Null).await.unwrap_err();
        assert_eq!(err.kind(), "device-open");
    }

    #[tokio::test]
    async fn test_eof_mid_call_is_a_protocol_error() {
        let (engine_side, service_side) = pair().await;
        drop(service_side);
        let mut client = ServiceClient::new("gone", engine_side);
        let err = client.call("echo", Value::Null).await.unwrap_err();
        assert_eq!(err.kind(), "host-service-protocol");
    }
}
