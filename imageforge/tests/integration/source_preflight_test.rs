// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Source preflight semantics: a checksum mismatch aborts the run before
//! any stage starts, leaving no workspace and no cached file behind.

use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use imageforge::infrastructure::stores::{FsSourceCache, SourceConnector};
use imageforge::Checksum;
use imageforge_domain::repositories::source_store::SourceStore;
use imageforge_domain::BuildResult;

use crate::common::resolve;

/// Materializes descriptor-embedded bytes, optionally corrupting them.
struct EmbeddedConnector {
    corrupt: bool,
}

#[async_trait]
impl SourceConnector for EmbeddedConnector {
    async fn fetch(
        &self,
        _kind: &str,
        checksum: &Checksum,
        descriptor: &Value,
        cache_dir: &Path,
    ) -> BuildResult<()> {
        let mut bytes = descriptor["data"].as_str().unwrap_or_default().as_bytes().to_vec();
        if self.corrupt {
            bytes.extend_from_slice(b"-tampered");
        }
        imageforge::infrastructure::stores::source_cache::place_blob(cache_dir, checksum, &bytes)?;
        Ok(())
    }
}

fn manifest_with_source(data: &str) -> String {
    let checksum = Checksum::of_bytes(data.as_bytes());
    format!(
        r#"{{
            "version": "2",
            "sources": {{
                "org.imageforge.inline": {{ "{checksum}": {{ "data": "{data}" }} }}
            }},
            "pipelines": [
                {{
                    "name": "p",
                    "stages": [
                        {{
                            "type": "org.imageforge.copy",
                            "inputs": {{
                                "files": {{
                                    "type": "org.imageforge.files",
                                    "origin": "org.imageforge.source",
                                    "kind": "org.imageforge.inline",
                                    "references": ["{checksum}"]
                                }}
                            }}
                        }}
                    ]
                }}
            ]
        }}"#
    )
}

#[tokio::test]
async fn test_checksum_mismatch_aborts_with_no_side_effects() {
    let store_dir = tempfile::tempdir().unwrap();
    let plan = resolve(&manifest_with_source("payload"));
    let cache = FsSourceCache::new(
        store_dir.path().join("sources"),
        2,
        Arc::new(EmbeddedConnector { corrupt: true }),
    );

    // The preflight the executor performs before any stage.
    let mut failure = None;
    for (kind, entries) in &plan.sources {
        if let Err(e) = cache.ensure(kind, entries).await {
            failure = Some(e);
            break;
        }
    }
    let error = failure.expect("preflight must fail");
    assert_eq!(error.kind(), "source-checksum");

    // Nothing cached under the final name.
    let checksum = Checksum::of_bytes(b"payload");
    assert!(!cache.contains("org.imageforge.inline", &checksum).await.unwrap());
    // No workspaces exist: the store root was never populated.
    assert!(!store_dir.path().join("tmp").exists());
}

#[tokio::test]
async fn test_successful_preflight_caches_under_checksum_name() {
    let store_dir = tempfile::tempdir().unwrap();
    let plan = resolve(&manifest_with_source("payload"));
    let cache = FsSourceCache::new(
        store_dir.path().join("sources"),
        2,
        Arc::new(EmbeddedConnector { corrupt: false }),
    );

    for (kind, entries) in &plan.sources {
        cache.ensure(kind, entries).await.unwrap();
    }

    let checksum = Checksum::of_bytes(b"payload");
    let path = cache.path_of("org.imageforge.inline", &checksum);
    assert_eq!(std::fs::read(&path).unwrap(), b"payload");
    assert_eq!(
        path.file_name().unwrap().to_str().unwrap(),
        checksum.to_filename()
    );
}
