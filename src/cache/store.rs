//! Cluster-wide locator index

use crate::cache::locator::{
    cache_key, digest_prefix, normalize_digest, parse_cache_key, prefer_host, LayerKind,
    LayerLocator,
};
use crate::error::{LayerCacheError, LayerCacheResult};
use crate::store::{scan_all, Backoff, KeyValueStore, DEFAULT_SCAN_PAGE};
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Concurrent writes per batch when publishing a rescan
const PUBLISH_CHUNK: usize = 64;

/// Default lifetime of a published locator
pub const DEFAULT_LOCATOR_TTL: Duration = Duration::from_secs(180);

/// Locator index shared by every proxy replica
///
/// Each write carries a TTL; replicas re-publish faster than the TTL so a
/// live layer never drops out of the index.
pub struct CacheStore {
    store: Arc<dyn KeyValueStore>,
    host: String,
    ttl: Duration,
    retry: QueryRetry,
}

/// How long a locator query keeps retrying an unavailable store
#[derive(Debug, Clone)]
pub struct QueryRetry {
    pub deadline: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for QueryRetry {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl CacheStore {
    /// Create an index writer publishing under `host`
    pub fn new(store: Arc<dyn KeyValueStore>, host: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            host: host.into(),
            ttl,
            retry: QueryRetry::default(),
        }
    }

    /// Replace the retry policy of `query` and `find`
    pub fn with_query_retry(mut self, retry: QueryRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Address this replica publishes under
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Publish (or overwrite) this host's locator for a digest
    pub async fn put(
        &self,
        kind: LayerKind,
        digest: &str,
        payload: &str,
    ) -> LayerCacheResult<LayerLocator> {
        let locator = LayerLocator {
            digest: normalize_digest(digest)?,
            kind,
            host: self.host.clone(),
            payload: payload.to_string(),
        };

        self.store
            .set(&locator.key(), &locator.payload, Some(self.ttl))
            .await?;
        debug!(digest = %locator.digest, kind = %kind, host = %self.host, "Published locator");
        Ok(locator)
    }

    /// Publish many `(digest, payload)` locators of one kind
    ///
    /// Writes are independent and issued concurrently, a chunk at a time.
    /// Returns how many were published. Fails only when every write failed.
    pub async fn put_many(
        &self,
        kind: LayerKind,
        entries: &[(String, String)],
    ) -> LayerCacheResult<usize> {
        let mut published = 0;
        let mut last_error = None;

        for chunk in entries.chunks(PUBLISH_CHUNK) {
            let writes = chunk
                .iter()
                .map(|(digest, payload)| self.put(kind, digest, payload));

            for ((digest, _), result) in chunk.iter().zip(join_all(writes).await) {
                match result {
                    Ok(_) => published += 1,
                    Err(e) => {
                        warn!(digest = %digest, kind = %kind, "Failed to publish locator: {}", e);
                        last_error = Some(e);
                    }
                }
            }
        }

        match last_error {
            Some(e) if published == 0 => Err(e),
            _ => Ok(published),
        }
    }

    /// Every live locator for a digest whose kind is in `kinds`, across all hosts
    ///
    /// An unavailable store is retried with backoff until the query deadline
    /// passes; only then is the last error returned.
    pub async fn query(
        &self,
        kinds: &[LayerKind],
        digest: &str,
    ) -> LayerCacheResult<Vec<LayerLocator>> {
        let digest = normalize_digest(digest)?;
        let prefix = digest_prefix(&digest);
        let started = Instant::now();
        let deadline = started
            .checked_add(self.retry.deadline)
            .unwrap_or_else(|| started + Duration::from_secs(86_400));
        let mut backoff = Backoff::new(self.retry.initial_backoff, self.retry.max_backoff);

        let entries = loop {
            match scan_all(self.store.as_ref(), &prefix, DEFAULT_SCAN_PAGE).await {
                Ok(entries) => break entries,
                Err(e) if e.is_retryable() => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(e);
                    }
                    debug!(digest = %digest, "Locator query failed, retrying: {}", e);
                    tokio::time::sleep(backoff.next_delay().min(deadline - now)).await;
                }
                Err(e) => return Err(e),
            }
        };

        Ok(entries
            .iter()
            .filter_map(|kv| LayerLocator::from_entry(&kv.key, &kv.value))
            .filter(|l| l.digest == digest && kinds.contains(&l.kind))
            .collect())
    }

    /// Best locator for a digest, this host first
    ///
    /// Fails with `NoLocator` when nothing is published, so callers can fall
    /// back to a fresh download.
    pub async fn find(&self, kinds: &[LayerKind], digest: &str) -> LayerCacheResult<LayerLocator> {
        let locators = prefer_host(self.query(kinds, digest).await?, &self.host);
        locators
            .into_iter()
            .next()
            .ok_or_else(|| LayerCacheError::NoLocator(digest.to_string()))
    }

    /// Remove one locator of this host
    pub async fn delete(&self, kind: LayerKind, digest: &str) -> LayerCacheResult<bool> {
        let digest = normalize_digest(digest)?;
        self.store.delete(&cache_key(&digest, &self.host, kind)).await
    }

    /// Remove every locator published by `host`
    ///
    /// Used when a replica shuts down or is evicted so its locators do not
    /// outlive the process. Other hosts' entries are untouched.
    pub async fn delete_host_entries(&self, host: &str) -> LayerCacheResult<usize> {
        let entries = scan_all(self.store.as_ref(), "", DEFAULT_SCAN_PAGE).await?;
        let mut deleted = 0;

        for kv in entries {
            let Some((_, entry_host, _)) = parse_cache_key(&kv.key) else {
                continue;
            };
            if entry_host != host {
                continue;
            }
            if self.store.delete(&kv.key).await? {
                deleted += 1;
            }
        }

        info!(host = %host, deleted, "Deleted host locators");
        Ok(deleted)
    }
}
