//! Shared key/value store abstraction
//!
//! The locator index and the lock leases live in a store shared by every
//! proxy replica. All cross-process coordination (TTL expiry, exclusive
//! lease creation) is delegated to the store's own atomicity:
//! - `MemoryStore`: in-process, for a single replica and for tests
//! - `EtcdStore`: etcd v3 through its JSON gateway

mod etcd;
mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

use crate::config::schema::{StoreBackend, StoreConfig};
use crate::error::LayerCacheResult;
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Page size used when a caller wants every match of a prefix
pub const DEFAULT_SCAN_PAGE: usize = 256;

/// One key/value pair returned by a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// A single page request of a prefix scan
#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    /// Only keys starting with this prefix are returned
    pub prefix: String,
    /// Resume after this key (the `next_cursor` of the previous page)
    pub cursor: Option<String>,
    /// Maximum entries in this page
    pub limit: usize,
}

/// One page of scan results
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    /// Entries in lexical key order
    pub entries: Vec<KeyValue>,
    /// Cursor for the next page, `None` once the scan is complete
    pub next_cursor: Option<String>,
}

/// Shared key/value store interface
///
/// Every operation is independent per key; no multi-key transaction is
/// assumed by callers.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a live value
    async fn get(&self, key: &str) -> LayerCacheResult<Option<String>>;

    /// Unconditionally write a value, expiring after `ttl` when given
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> LayerCacheResult<()>;

    /// Write `new_value` only if the current value equals `expected`
    /// (`None` means the key must be absent). Returns whether the write happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new_value: &str,
    ) -> LayerCacheResult<bool>;

    /// Delete a key, returning whether it existed
    async fn delete(&self, key: &str) -> LayerCacheResult<bool>;

    /// Fetch one page of keys matching a prefix
    async fn scan(&self, request: ScanRequest) -> LayerCacheResult<ScanPage>;

    /// Human-readable backend name for logs and status output
    fn backend_name(&self) -> &'static str;
}

#[async_trait]
impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    async fn get(&self, key: &str) -> LayerCacheResult<Option<String>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> LayerCacheResult<()> {
        (**self).set(key, value, ttl).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new_value: &str,
    ) -> LayerCacheResult<bool> {
        (**self).compare_and_swap(key, expected, new_value).await
    }

    async fn delete(&self, key: &str) -> LayerCacheResult<bool> {
        (**self).delete(key).await
    }

    async fn scan(&self, request: ScanRequest) -> LayerCacheResult<ScanPage> {
        (**self).scan(request).await
    }

    fn backend_name(&self) -> &'static str {
        (**self).backend_name()
    }
}

/// Follow scan cursors until the store reports completion
///
/// Large key spaces take several round trips; a single page is never
/// assumed to be the whole answer.
pub async fn scan_all(
    store: &dyn KeyValueStore,
    prefix: &str,
    page_size: usize,
) -> LayerCacheResult<Vec<KeyValue>> {
    let mut entries = Vec::new();
    let mut cursor = None;

    loop {
        let page = store
            .scan(ScanRequest {
                prefix: prefix.to_string(),
                cursor: cursor.take(),
                limit: page_size.max(1),
            })
            .await?;

        entries.extend(page.entries);

        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    Ok(entries)
}

/// Jittered exponential backoff between attempts against the store
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            next: initial,
            max: max.max(initial),
        }
    }

    /// Delay before the next attempt; the base doubles up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = jitter(self.next);
        self.next = (self.next * 2).min(self.max);
        delay
    }
}

/// Random delay in `[backoff / 2, backoff]`
fn jitter(backoff: Duration) -> Duration {
    let max = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX).max(1);
    let ms = rand::rng().random_range(max / 2..=max);
    Duration::from_millis(ms)
}

/// Build the store selected by configuration
pub fn connect(config: &StoreConfig) -> LayerCacheResult<Arc<dyn KeyValueStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Etcd => Ok(Arc::new(EtcdStore::new(config)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scan_all_follows_cursors() {
        let store = MemoryStore::new();
        for i in 0..25 {
            store
                .set(&format!("abc/host-{i:02}/DOCKERD"), "v", None)
                .await
                .unwrap();
        }
        store.set("abd/other/DOCKERD", "v", None).await.unwrap();

        let entries = scan_all(&store, "abc/", 4).await.unwrap();

        assert_eq!(entries.len(), 25);
        assert!(entries.iter().all(|kv| kv.key.starts_with("abc/")));
        assert!(entries.windows(2).all(|w| w[0].key < w[1].key));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..100 {
            let d = jitter(Duration::from_millis(100));
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(100));
        }
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(40));
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay()).collect();

        assert!(delays[0] <= Duration::from_millis(10));
        assert!(delays[2] >= Duration::from_millis(20));
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(40)));
    }

    #[test]
    fn connect_memory_backend() {
        let store = connect(&StoreConfig::default()).unwrap();
        assert_eq!(store.backend_name(), "memory");
    }
}
