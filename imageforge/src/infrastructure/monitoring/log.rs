// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Log Monitor
//!
//! Human-facing rendering of build events through `tracing`. Used when the
//! result channel is a terminal; pipes get the JSON-seq monitor instead.

use imageforge_domain::events::build_event::EventOrigin;
use imageforge_domain::{BuildEvent, Monitor};

/// Renders build events as structured log lines.
pub struct LogMonitor;

impl Monitor for LogMonitor {
    fn record(&self, event: BuildEvent) {
        match event {
            BuildEvent::Context(ctx) => match (&ctx.module, &ctx.stage) {
                (Some(module), Some(stage)) => {
                    tracing::info!(
                        pipeline = %ctx.pipeline,
                        stage = %stage.short(),
                        module = %module,
                        "stage starting"
                    );
                }
                _ => {
                    tracing::info!(
                        pipeline = %ctx.pipeline,
                        id = %ctx.pipeline_id.short(),
                        "pipeline starting"
                    );
                }
            },
            BuildEvent::Progress(progress) => {
                tracing::debug!(
                    pipelines_done = progress.pipelines.done,
                    pipelines_total = progress.pipelines.total,
                    "progress"
                );
            }
            BuildEvent::Message(message) => match message.origin {
                EventOrigin::Module => tracing::info!(target: "module", "{}", message.text),
                EventOrigin::HostService => {
                    tracing::debug!(target: "host-service", "{}", message.text)
                }
                EventOrigin::Engine => tracing::info!("{}", message.text),
            },
            BuildEvent::Metadata(metadata) => {
                tracing::debug!(stage = %metadata.stage.short(), "module metadata collected");
            }
            BuildEvent::Result(result) => {
                if result.success {
                    for (pipeline, path) in &result.exports {
                        tracing::info!(pipeline = %pipeline, path = %path, "exported");
                    }
                    tracing::info!(stages = result.stages.len(), "build succeeded");
                } else if let Some(error) = &result.error {
                    tracing::error!(
                        kind = %error.kind,
                        pipeline = error.pipeline.as_deref().unwrap_or(""),
                        module = error.module.as_deref().unwrap_or(""),
                        "build failed: {}",
                        error.message
                    );
                }
            }
        }
    }
}
