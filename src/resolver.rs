//! Request path
//!
//! Turns "who can serve digest X" into a local archive, a peer locator, or
//! a miss. Local production is serialized per digest through the
//! distributed lock so only one replica (and one request) materializes a
//! layer at a time. Every resolution is journaled.

use crate::cache::{normalize_digest, prefer_host, CacheStore, LayerKind, LayerLocator};
use crate::error::{LayerCacheError, LayerCacheResult};
use crate::journal::{EventJournal, JournalEvent};
use crate::lock::DistributedLock;
use crate::runtime::RuntimeScanner;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Kinds a registry pull can be served from directly
const SERVABLE_KINDS: &[LayerKind] = &[LayerKind::Dockerd, LayerKind::Containerd, LayerKind::Static];

/// One layer pull
#[derive(Debug, Clone)]
pub struct LayerRequest {
    pub request_id: String,
    pub registry: String,
    pub repo: String,
    pub digest: String,
}

impl LayerRequest {
    pub fn new(registry: &str, repo: &str, digest: &str) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            registry: registry.to_string(),
            repo: repo.to_string(),
            digest: digest.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Archive ready in this host's serving directory
    Local(PathBuf),
    /// Another replica holds the layer
    Peer(LayerLocator),
    /// Nobody has it; fetch from upstream
    Miss,
}

pub struct LayerResolver {
    cache: Arc<CacheStore>,
    lock: DistributedLock,
    scanner: Arc<RuntimeScanner>,
    journal: Arc<EventJournal>,
    owner_id: String,
}

impl LayerResolver {
    pub fn new(
        cache: Arc<CacheStore>,
        lock: DistributedLock,
        scanner: Arc<RuntimeScanner>,
        journal: Arc<EventJournal>,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            lock,
            scanner,
            journal,
            owner_id: owner_id.into(),
        }
    }

    /// Resolve a pull and journal the outcome
    pub async fn resolve(&self, request: &LayerRequest) -> LayerCacheResult<Resolution> {
        let result = self.lookup(request).await;

        let event = match &result {
            Ok(Resolution::Local(path)) => {
                let size = tokio::fs::metadata(path)
                    .await
                    .map(|m| m.len() as i64)
                    .unwrap_or(0);
                JournalEvent::layer(
                    &request.request_id,
                    &request.registry,
                    &request.repo,
                    &request.digest,
                    size,
                )
            }
            Ok(Resolution::Peer(locator)) => JournalEvent {
                message: format!("served by peer {}", locator.host),
                ..JournalEvent::layer(
                    &request.request_id,
                    &request.registry,
                    &request.repo,
                    &request.digest,
                    0,
                )
            },
            Ok(Resolution::Miss) => JournalEvent {
                message: "cache miss".to_string(),
                ..JournalEvent::layer(
                    &request.request_id,
                    &request.registry,
                    &request.repo,
                    &request.digest,
                    0,
                )
            },
            Err(e) => JournalEvent::warning(&request.request_id, &request.digest, e.to_string()),
        };

        if let Err(e) = self.journal.record(event).await {
            warn!(digest = %request.digest, "Failed to journal resolution: {}", e);
        }
        result
    }

    async fn lookup(&self, request: &LayerRequest) -> LayerCacheResult<Resolution> {
        let digest = normalize_digest(&request.digest)?;
        let serving = self.scanner.serving_path(&digest);

        let locators = prefer_host(
            self.cache.query(SERVABLE_KINDS, &digest).await?,
            self.cache.host(),
        );

        let host = self.cache.host();
        let has_local = locators.first().is_some_and(|l| l.is_local(host));
        if has_local && file_exists(&serving).await {
            debug!(digest = %digest, "Serving local archive");
            return Ok(Resolution::Local(serving));
        }

        // A same-host locator without its archive is stale; peers still count
        if let Some(peer) = locators.into_iter().find(|l| !l.is_local(host)) {
            debug!(digest = %digest, host = %peer.host, "Layer held by peer");
            return Ok(Resolution::Peer(peer));
        }

        let Some((kind, _)) = self.scanner.locate(&digest).await else {
            debug!(digest = %digest, "Layer not cached anywhere");
            return Ok(Resolution::Miss);
        };

        self.produce(kind, &digest).await.map(Resolution::Local)
    }

    /// Materialize under the digest's lock and publish the archive
    async fn produce(&self, kind: LayerKind, digest: &str) -> LayerCacheResult<PathBuf> {
        let owner = format!("{}/{}", self.owner_id, Uuid::new_v4());
        let guard = self.lock.acquire(digest, &owner).await?;

        // Another request may have finished while we waited
        let serving = self.scanner.serving_path(digest);
        if file_exists(&serving).await {
            guard.release().await?;
            return Ok(serving);
        }

        let path = match self.scanner.materialize_locked(kind, digest, &guard).await {
            Ok(path) => path,
            Err(e @ LayerCacheError::LockLost { .. }) => {
                // The next holder owns the serving path now
                warn!(digest = %digest, "Lease lost during materialization");
                return Err(e);
            }
            Err(e) => {
                guard.release().await?;
                return Err(e);
            }
        };

        if let Err(e) = self
            .cache
            .put(LayerKind::Static, digest, &path.to_string_lossy())
            .await
        {
            warn!(digest = %digest, "Failed to publish archive locator: {}", e);
        }
        guard.release().await?;

        info!(digest = %digest, kind = %kind, "Produced layer archive");
        Ok(path)
    }

    /// Publish an explicit locator, e.g. torrent metadata after a download
    pub async fn save(
        &self,
        kind: LayerKind,
        digest: &str,
        payload: &str,
    ) -> LayerCacheResult<LayerLocator> {
        self.cache.put(kind, digest, payload).await
    }
}

async fn file_exists(path: &std::path::Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}
