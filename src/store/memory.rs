//! In-process key/value store with TTL expiry

use crate::error::LayerCacheResult;
use crate::store::{KeyValue, KeyValueStore, ScanPage, ScanRequest};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Writes between sweeps of expired entries
const REAP_EVERY: u64 = 256;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// Key/value store held in process memory
///
/// Expired entries are invisible to every operation and removed lazily.
/// Expiry uses tokio's clock, so paused-time tests can advance past a TTL.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<String, Entry>>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.data
            .read()
            .await
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn maybe_reap(&self, data: &mut BTreeMap<String, Entry>, now: Instant) {
        if self.writes.fetch_add(1, Ordering::Relaxed) % REAP_EVERY == 0 {
            data.retain(|_, e| e.is_live(now));
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> LayerCacheResult<Option<String>> {
        let now = Instant::now();
        let data = self.data.read().await;
        Ok(data
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> LayerCacheResult<()> {
        let now = Instant::now();
        let mut data = self.data.write().await;
        self.maybe_reap(&mut data, now);
        data.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new_value: &str,
    ) -> LayerCacheResult<bool> {
        let now = Instant::now();
        let mut data = self.data.write().await;

        let current = data
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.as_str());
        if current != expected {
            return Ok(false);
        }

        self.maybe_reap(&mut data, now);
        data.insert(
            key.to_string(),
            Entry {
                value: new_value.to_string(),
                expires_at: None,
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> LayerCacheResult<bool> {
        let now = Instant::now();
        let mut data = self.data.write().await;
        Ok(data.remove(key).is_some_and(|e| e.is_live(now)))
    }

    async fn scan(&self, request: ScanRequest) -> LayerCacheResult<ScanPage> {
        let now = Instant::now();
        let limit = request.limit.max(1);
        let data = self.data.read().await;

        let start = match request.cursor {
            Some(cursor) => Bound::Excluded(cursor),
            None => Bound::Included(request.prefix.clone()),
        };

        let mut entries: Vec<KeyValue> = data
            .range((start, Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(&request.prefix))
            .filter(|(_, e)| e.is_live(now))
            .take(limit + 1)
            .map(|(k, e)| KeyValue {
                key: k.clone(),
                value: e.value.clone(),
            })
            .collect();

        let next_cursor = if entries.len() > limit {
            entries.truncate(limit);
            entries.last().map(|kv| kv.key.clone())
        } else {
            None
        };

        Ok(ScanPage {
            entries,
            next_cursor,
        })
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get() {
        let store = MemoryStore::new();
        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let store = MemoryStore::new();
        store
            .set("k", "v", Some(Duration::from_secs(180)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(179)).await;
        assert!(store.get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn cas_creates_only_when_absent() {
        let store = MemoryStore::new();
        assert!(store.compare_and_swap("k", None, "a").await.unwrap());
        assert!(!store.compare_and_swap("k", None, "b").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("a".to_string()));
    }

    #[tokio::test]
    async fn cas_swaps_on_matching_value() {
        let store = MemoryStore::new();
        store.set("k", "a", None).await.unwrap();

        assert!(!store.compare_and_swap("k", Some("x"), "b").await.unwrap());
        assert!(store.compare_and_swap("k", Some("a"), "b").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("b".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_key_counts_as_absent_for_cas() {
        let store = MemoryStore::new();
        store
            .set("k", "old", Some(Duration::from_secs(1)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        assert!(store.compare_and_swap("k", None, "new").await.unwrap());
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let store = MemoryStore::new();
        store.set("k", "v", None).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn scan_pages_resume_from_cursor() {
        let store = MemoryStore::new();
        for key in ["a/1", "a/2", "a/3", "b/1"] {
            store.set(key, "v", None).await.unwrap();
        }

        let first = store
            .scan(ScanRequest {
                prefix: "a/".to_string(),
                cursor: None,
                limit: 2,
            })
            .await
            .unwrap();
        assert_eq!(first.entries.len(), 2);
        assert_eq!(first.next_cursor.as_deref(), Some("a/2"));

        let second = store
            .scan(ScanRequest {
                prefix: "a/".to_string(),
                cursor: first.next_cursor,
                limit: 2,
            })
            .await
            .unwrap();
        assert_eq!(second.entries.len(), 1);
        assert_eq!(second.entries[0].key, "a/3");
        assert!(second.next_cursor.is_none());
    }
}
