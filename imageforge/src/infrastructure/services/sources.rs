// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Source Services
//!
//! One long-lived helper per source kind, each exposing `exists(checksum)`
//! and `fetch(checksum, descriptor)` on the message channel:
//!
//! - [`DownloadService`] — streams URL-addressed blobs with bounded
//!   retries, re-selecting among mirrors on every attempt. Credentials are
//!   resolved once from the helper's environment at startup and reused.
//! - [`InlineService`] — materializes content embedded in the manifest
//!   itself (base64 or plain text).
//! - [`LocalService`] — copies repository content from a host path.
//!
//! All three verify against the declared checksum before the atomic
//! rename into the cache; a mismatch is fatal (`source-checksum`), never
//! retried — retries are for transport failures only.

use async_trait::async_trait;
use base64::Engine as _;
use futures::StreamExt;
use serde_json::{json, Value};
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use imageforge_domain::{BuildError, BuildResult, Checksum, ChecksumAlgorithm};

use crate::infrastructure::ipc::{EventSender, HostService};
use crate::infrastructure::stores::source_cache::{place_blob, promote_file};

/// Environment prefix for bearer tokens referenced by `secrets.name`.
const TOKEN_ENV_PREFIX: &str = "IMAGEFORGE_TOKEN_";

fn required_str<'a>(value: &'a Value, key: &str) -> BuildResult<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| BuildError::protocol(format!("missing field {key:?} in request")))
}

fn parse_checksum(args: &Value) -> BuildResult<Checksum> {
    Checksum::from_string(required_str(args, "checksum")?)
}

/// Incremental file hash for the declared algorithm.
fn hash_file(algorithm: ChecksumAlgorithm, path: &Path) -> BuildResult<String> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| BuildError::store_io(format!("opening {}: {e}", path.display())))?;
    let mut buf = [0u8; 64 * 1024];

    macro_rules! digest_with {
        ($hasher:ty) => {{
            let mut hasher = <$hasher>::new();
            loop {
                let n = file
                    .read(&mut buf)
                    .map_err(|e| BuildError::store_io(format!("reading {}: {e}", path.display())))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            hex::encode(hasher.finalize())
        }};
    }

    Ok(match algorithm {
        ChecksumAlgorithm::Sha256 => digest_with!(Sha256),
        ChecksumAlgorithm::Sha384 => digest_with!(Sha384),
        ChecksumAlgorithm::Sha512 => digest_with!(Sha512),
    })
}

/// URL downloader with retries and mirror rotation.
pub struct DownloadService {
    cache_dir: PathBuf,
    retries: usize,
    client: reqwest::Client,
    /// Secret name → bearer token, resolved once at startup.
    tokens: BTreeMap<String, String>,
}

impl DownloadService {
    pub fn from_startup(startup: &Value) -> BuildResult<Self> {
        let cache_dir = PathBuf::from(required_str(startup, "cache_dir")?);
        let retries = startup
            .get("retries")
            .and_then(Value::as_u64)
            .unwrap_or(3)
            .max(1) as usize;
        let mut tokens = BTreeMap::new();
        for (key, value) in std::env::vars() {
            if let Some(name) = key.strip_prefix(TOKEN_ENV_PREFIX) {
                tokens.insert(name.to_ascii_lowercase(), value);
            }
        }
        let client = reqwest::Client::builder()
            .user_agent(concat!("imageforge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BuildError::internal(format!("http client: {e}")))?;
        Ok(Self {
            cache_dir,
            retries,
            client,
            tokens,
        })
    }

    fn candidate_urls(descriptor: &Value) -> BuildResult<Vec<String>> {
        let mut urls = Vec::new();
        if let Some(url) = descriptor.get("url").and_then(Value::as_str) {
            urls.push(url.to_owned());
        }
        if let Some(mirrors) = descriptor.get("mirrors").and_then(Value::as_array) {
            urls.extend(
                mirrors
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned),
            );
        }
        if urls.is_empty() {
            return Err(BuildError::source_fetch("descriptor has no url"));
        }
        Ok(urls)
    }

    fn bearer_token(&self, descriptor: &Value) -> BuildResult<Option<String>> {
        let Some(name) = descriptor
            .get("secrets")
            .and_then(|s| s.get("name"))
            .and_then(Value::as_str)
        else {
            return Ok(None);
        };
        match self.tokens.get(&name.to_ascii_lowercase()) {
            Some(token) => Ok(Some(token.clone())),
            None => Err(BuildError::SourceAuth(format!(
                "no credentials for secret {name:?} (set {TOKEN_ENV_PREFIX}{})",
                name.to_ascii_uppercase()
            ))),
        }
    }

    /// Streams one URL into a partial file, hashing as it goes.
    async fn download_attempt(
        &self,
        url: &str,
        token: Option<&str>,
        checksum: &Checksum,
        partial: &Path,
        events: &EventSender,
    ) -> BuildResult<()> {
        let mut request = self.client.get(url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| BuildError::source_fetch(format!("{url}: {e}")))?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::FORBIDDEN
        {
            return Err(BuildError::SourceAuth(format!(
                "{url}: {}",
                response.status()
            )));
        }
        if !response.status().is_success() {
            return Err(BuildError::source_fetch(format!(
                "{url}: {}",
                response.status()
            )));
        }
        let total = response.content_length().unwrap_or(0);

        let mut file = std::fs::File::create(partial)
            .map_err(|e| BuildError::store_io(format!("creating {}: {e}", partial.display())))?;
        let mut stream = response.bytes_stream();
        let mut done = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| BuildError::source_fetch(format!("{url}: {e}")))?;
            file.write_all(&chunk)
                .map_err(|e| BuildError::store_io(format!("writing {}: {e}", partial.display())))?;
            done += chunk.len() as u64;
            if total > 0 {
                events.progress(done, total);
            }
        }
        file.sync_all()
            .map_err(|e| BuildError::store_io(format!("syncing {}: {e}", partial.display())))?;
        drop(file);

        let actual = hash_file(checksum.algorithm(), partial)?;
        if actual != checksum.hex() {
            std::fs::remove_file(partial).ok();
            return Err(BuildError::source_checksum(format!(
                "{url}: got {}:{actual}, expected {checksum}",
                checksum.algorithm().prefix()
            )));
        }
        Ok(())
    }

    async fn fetch(
        &self,
        checksum: &Checksum,
        descriptor: &Value,
        events: &EventSender,
    ) -> BuildResult<()> {
        let final_path = self.cache_dir.join(checksum.to_filename());
        if final_path.is_file() {
            return Ok(());
        }
        let urls = Self::candidate_urls(descriptor)?;
        let token = self.bearer_token(descriptor)?;

        let tmp_dir = self.cache_dir.join("tmp");
        std::fs::create_dir_all(&tmp_dir)
            .map_err(|e| BuildError::store_io(format!("creating {}: {e}", tmp_dir.display())))?;
        let partial = tmp_dir.join(format!(
            "{}.partial-{}",
            checksum.to_filename(),
            std::process::id()
        ));

        let mut last_error = None;
        for attempt in 0..self.retries {
            // Mirror re-selection: rotate through the candidate list.
            let url = &urls[attempt % urls.len()];
            events.message(format!("fetching {url} (attempt {})", attempt + 1));
            match self
                .download_attempt(url, token.as_deref(), checksum, &partial, events)
                .await
            {
                Ok(()) => {
                    promote_file(&self.cache_dir, checksum, &partial)?;
                    return Ok(());
                }
                Err(e) if e.is_recoverable() => last_error = Some(e),
                // Checksum, auth, and I/O failures are not retried.
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| BuildError::source_fetch("no attempts made")))
    }
}

#[async_trait]
impl HostService for DownloadService {
    async fn dispatch(
        &mut self,
        method: &str,
        args: Value,
        events: &EventSender,
    ) -> BuildResult<Value> {
        match method {
            "exists" => {
                let checksum = parse_checksum(&args)?;
                Ok(json!(self.cache_dir.join(checksum.to_filename()).is_file()))
            }
            "fetch" => {
                let checksum = parse_checksum(&args)?;
                let descriptor = args.get("descriptor").cloned().unwrap_or(Value::Null);
                self.fetch(&checksum, &descriptor, events).await?;
                Ok(Value::Null)
            }
            other => Err(BuildError::protocol(format!("unknown method {other:?}"))),
        }
    }
}

/// Materializes content embedded in the manifest.
pub struct InlineService {
    cache_dir: PathBuf,
}

impl InlineService {
    pub fn from_startup(startup: &Value) -> BuildResult<Self> {
        Ok(Self {
            cache_dir: PathBuf::from(required_str(startup, "cache_dir")?),
        })
    }

    fn decode(descriptor: &Value) -> BuildResult<Vec<u8>> {
        let data = required_str(descriptor, "data")?;
        match descriptor.get("encoding").and_then(Value::as_str) {
            None | Some("base64") => base64::engine::general_purpose::STANDARD
                .decode(data)
                .map_err(|e| BuildError::source_fetch(format!("invalid base64: {e}"))),
            Some("plain") => Ok(data.as_bytes().to_vec()),
            Some(other) => Err(BuildError::source_fetch(format!(
                "unknown inline encoding {other:?}"
            ))),
        }
    }
}

#[async_trait]
impl HostService for InlineService {
    async fn dispatch(
        &mut self,
        method: &str,
        args: Value,
        _events: &EventSender,
    ) -> BuildResult<Value> {
        match method {
            "exists" => {
                let checksum = parse_checksum(&args)?;
                Ok(json!(self.cache_dir.join(checksum.to_filename()).is_file()))
            }
            "fetch" => {
                let checksum = parse_checksum(&args)?;
                let descriptor = args.get("descriptor").cloned().unwrap_or(Value::Null);
                let bytes = Self::decode(&descriptor)?;
                place_blob(&self.cache_dir, &checksum, &bytes)?;
                Ok(Value::Null)
            }
            other => Err(BuildError::protocol(format!("unknown method {other:?}"))),
        }
    }
}

/// Copies repository content from a host path into the cache.
pub struct LocalService {
    cache_dir: PathBuf,
}

impl LocalService {
    pub fn from_startup(startup: &Value) -> BuildResult<Self> {
        Ok(Self {
            cache_dir: PathBuf::from(required_str(startup, "cache_dir")?),
        })
    }
}

#[async_trait]
impl HostService for LocalService {
    async fn dispatch(
        &mut self,
        method: &str,
        args: Value,
        _events: &EventSender,
    ) -> BuildResult<Value> {
        match method {
            "exists" => {
                let checksum = parse_checksum(&args)?;
                Ok(json!(self.cache_dir.join(checksum.to_filename()).is_file()))
            }
            "fetch" => {
                let checksum = parse_checksum(&args)?;
                let descriptor = args.get("descriptor").cloned().unwrap_or(Value::Null);
                let path = required_str(&descriptor, "path")?;
                let bytes = std::fs::read(path)
                    .map_err(|e| BuildError::source_fetch(format!("reading {path}: {e}")))?;
                place_blob(&self.cache_dir, &checksum, &bytes)?;
                Ok(Value::Null)
            }
            other => Err(BuildError::protocol(format!("unknown method {other:?}"))),
        }
    }
}

/// Engine-side connector routing cache fetches through one pool of helper
/// processes per source kind.
///
/// Helpers are spawned lazily on the first fetch of a kind and reused for
/// the rest of the run; `shutdown` closes every helper and waits for it.
/// The per-kind pool gives bounded in-kind parallelism: each client
/// carries one outstanding request, so `pool_size` concurrent fetches can
/// be in flight per kind.
pub struct HelperSourceConnector {
    monitor: std::sync::Arc<dyn imageforge_domain::Monitor>,
    retries: usize,
    pool_size: usize,
    grace: std::time::Duration,
    pools: tokio::sync::Mutex<BTreeMap<String, Pool>>,
}

struct Pool {
    clients: Vec<std::sync::Arc<tokio::sync::Mutex<crate::infrastructure::ipc::ServiceClient>>>,
    next: usize,
}

fn role_for_kind(kind: &str) -> BuildResult<&'static str> {
    use super::role;
    match kind {
        "org.imageforge.download" => Ok(role::SOURCE_DOWNLOAD),
        "org.imageforge.inline" => Ok(role::SOURCE_INLINE),
        "org.imageforge.local" => Ok(role::SOURCE_LOCAL),
        other => Err(BuildError::source_unresolved(format!(
            "no helper for source kind {other}"
        ))),
    }
}

impl HelperSourceConnector {
    pub fn new(
        monitor: std::sync::Arc<dyn imageforge_domain::Monitor>,
        retries: usize,
        pool_size: usize,
        grace: std::time::Duration,
    ) -> Self {
        Self {
            monitor,
            retries,
            pool_size: pool_size.max(1),
            grace,
            pools: tokio::sync::Mutex::new(BTreeMap::new()),
        }
    }

    /// Closes every helper, waiting out the grace period for each.
    pub async fn shutdown(&self) {
        let mut pools = self.pools.lock().await;
        for (_, pool) in std::mem::take(&mut *pools) {
            for client in pool.clients {
                if let Ok(client) = std::sync::Arc::try_unwrap(client) {
                    client.into_inner().close(self.grace).await.ok();
                }
            }
        }
    }
}

#[async_trait]
impl crate::infrastructure::stores::SourceConnector for HelperSourceConnector {
    async fn fetch(
        &self,
        kind: &str,
        checksum: &Checksum,
        descriptor: &Value,
        cache_dir: &Path,
    ) -> BuildResult<()> {
        let client = {
            let mut pools = self.pools.lock().await;
            if !pools.contains_key(kind) {
                let service_role = role_for_kind(kind)?;
                let startup = json!({
                    "cache_dir": cache_dir,
                    "retries": self.retries,
                });
                let mut clients = Vec::with_capacity(self.pool_size);
                for _ in 0..self.pool_size {
                    let client = super::launcher::spawn_helper(
                        service_role,
                        &startup,
                        self.monitor.clone(),
                    )
                    .await?;
                    clients.push(std::sync::Arc::new(tokio::sync::Mutex::new(client)));
                }
                pools.insert(kind.to_owned(), Pool { clients, next: 0 });
            }
            let pool = pools.get_mut(kind).expect("pool just ensured");
            let client = pool.clients[pool.next % pool.clients.len()].clone();
            pool.next = pool.next.wrapping_add(1);
            client
        };

        let mut client = client.lock().await;
        client
            .call(
                "fetch",
                json!({ "checksum": checksum.to_string(), "descriptor": descriptor }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn events() -> EventSender {
        // A sender whose receiver is dropped; sends become no-ops.
        let (tx, _rx) = mpsc::unbounded_channel();
        EventSender::for_tests(tx)
    }

    #[tokio::test]
    async fn test_inline_fetch_places_verified_blob() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = InlineService {
            cache_dir: dir.path().to_path_buf(),
        };
        let payload = b"#!/bin/sh\necho hello\n";
        let checksum = Checksum::of_bytes(payload);
        let encoded = base64::engine::general_purpose::STANDARD.encode(payload);

        let reply = service
            .dispatch(
                "fetch",
                json!({
                    "checksum": checksum.to_string(),
                    "descriptor": { "data": encoded },
                }),
                &events(),
            )
            .await
            .unwrap();
        assert_eq!(reply, Value::Null);
        let cached = dir.path().join(checksum.to_filename());
        assert_eq!(std::fs::read(cached).unwrap(), payload);

        let exists = service
            .dispatch("exists", json!({ "checksum": checksum.to_string() }), &events())
            .await
            .unwrap();
        assert_eq!(exists, json!(true));
    }

    #[tokio::test]
    async fn test_inline_fetch_rejects_mismatched_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = InlineService {
            cache_dir: dir.path().to_path_buf(),
        };
        let wrong = Checksum::of_bytes(b"something else");
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"actual bytes");

        let err = service
            .dispatch(
                "fetch",
                json!({
                    "checksum": wrong.to_string(),
                    "descriptor": { "data": encoded },
                }),
                &events(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "source-checksum");
        assert!(!dir.path().join(wrong.to_filename()).exists());
    }

    #[tokio::test]
    async fn test_local_fetch_copies_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let payload = b"rpm bytes";
        let source_path = src.path().join("pkg.rpm");
        std::fs::write(&source_path, payload).unwrap();

        let mut service = LocalService {
            cache_dir: dir.path().to_path_buf(),
        };
        let checksum = Checksum::of_bytes(payload);
        service
            .dispatch(
                "fetch",
                json!({
                    "checksum": checksum.to_string(),
                    "descriptor": { "path": source_path },
                }),
                &events(),
            )
            .await
            .unwrap();
        assert!(dir.path().join(checksum.to_filename()).is_file());
    }

    #[test]
    fn test_candidate_urls_rotate_through_mirrors() {
        let descriptor = json!({
            "url": "https://primary/x",
            "mirrors": ["https://m1/x", "https://m2/x"],
        });
        let urls = DownloadService::candidate_urls(&descriptor).unwrap();
        assert_eq!(urls.len(), 3);
        assert_eq!(urls[0], "https://primary/x");

        let none = DownloadService::candidate_urls(&json!({})).unwrap_err();
        assert_eq!(none.kind(), "source-fetch");
    }

    #[test]
    fn test_hash_file_matches_checksum_of_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"streamed content").unwrap();
        let checksum = Checksum::of_bytes(b"streamed content");
        let actual = hash_file(ChecksumAlgorithm::Sha256, &path).unwrap();
        assert_eq!(actual, checksum.hex());
    }
}
