// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # JSON-seq Monitor
//!
//! Emits each build event as one JSON text sequence record (RFC 7464): an
//! RS byte (`0x1E`), the JSON value, a newline. Records are flushed
//! individually so a consumer reading the pipe sees every record as soon
//! as it happens, and a truncated run still yields a parseable prefix.

use parking_lot::Mutex;
use std::io::Write;

use imageforge_domain::{BuildEvent, Monitor};

/// RFC 7464 record separator.
const RECORD_SEPARATOR: u8 = 0x1E;

/// Writes build events as a JSON text sequence.
pub struct JsonSeqMonitor<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonSeqMonitor<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Consumes the monitor, returning the writer. Mainly for tests.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> Monitor for JsonSeqMonitor<W> {
    fn record(&self, event: BuildEvent) {
        let mut writer = self.writer.lock();
        // A broken pipe here means the consumer went away; nothing useful
        // to do but carry on and let process exit handle it.
        let _ = writer.write_all(&[RECORD_SEPARATOR]);
        let _ = serde_json::to_writer(&mut *writer, &event);
        let _ = writer.write_all(b"\n");
        let _ = writer.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imageforge_domain::events::build_event::{
        EventOrigin, MessageRecord, ProgressCounter, ProgressRecord, ResultRecord,
    };
    use std::collections::BTreeMap;

    fn records(bytes: &[u8]) -> Vec<serde_json::Value> {
        bytes
            .split(|&b| b == RECORD_SEPARATOR)
            .filter(|chunk| !chunk.is_empty())
            .map(|chunk| serde_json::from_slice(chunk).unwrap())
            .collect()
    }

    #[test]
    fn test_records_are_rs_delimited_and_parseable() {
        let monitor = JsonSeqMonitor::new(Vec::new());
        monitor.record(BuildEvent::Message(MessageRecord {
            origin: EventOrigin::Engine,
            text: "starting".into(),
        }));
        monitor.record(BuildEvent::Progress(ProgressRecord {
            pipelines: ProgressCounter { done: 0, total: 2 },
            stages: None,
        }));

        let bytes = monitor.into_inner();
        assert_eq!(bytes[0], RECORD_SEPARATOR);
        let parsed = records(&bytes);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0]["message"]["text"], "starting");
        assert_eq!(parsed[1]["progress"]["pipelines"]["total"], 2);
    }

    #[test]
    fn test_terminal_record_appears_last() {
        let monitor = JsonSeqMonitor::new(Vec::new());
        monitor.record(BuildEvent::Message(MessageRecord {
            origin: EventOrigin::Module,
            text: "working".into(),
        }));
        monitor.record(BuildEvent::Result(ResultRecord::success(
            BTreeMap::new(),
            Vec::new(),
        )));

        let parsed = records(&monitor.into_inner());
        assert!(parsed.last().unwrap().get("result").is_some());
        assert_eq!(parsed.last().unwrap()["result"]["success"], true);
    }
}
