// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Build events flowing over the result channel.

pub mod build_event;

pub use build_event::{
    BuildEvent, ContextRecord, ErrorRecord, EventOrigin, MessageRecord, MetadataRecord, Monitor,
    NullMonitor, ProgressCounter, ProgressRecord, ResultRecord, StageOutcome,
};
