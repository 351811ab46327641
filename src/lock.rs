//! Lease-based distributed lock
//!
//! Serializes production of one layer across replicas. A lock is a small
//! JSON lease record at `lock:{digest}` in the shared store:
//! - Creation and takeover are compare-and-swap; the store is the authority
//! - A lease is preemptable once `renew_time + expire_duration` has passed
//! - Release clears the owner instead of deleting the key, so every later
//!   transition is still a plain CAS against the previous value
//!
//! Holders keep the lease alive with a renewal task owned by `LockGuard`.
//! A failed renewal marks the guard lost; work protected by it must abort.

use crate::config::schema::LockConfig;
use crate::error::{LayerCacheError, LayerCacheResult};
use crate::store::{Backoff, KeyValueStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Key prefix of lock records
pub const LOCK_PREFIX: &str = "lock:";

/// Cap on how far ahead an acquisition deadline is placed
const MAX_WAIT: Duration = Duration::from_secs(365 * 86_400);

/// Store key of the lock protecting a digest
pub fn lock_key(digest: &str) -> String {
    format!("{}{}", LOCK_PREFIX, digest)
}

/// Persisted lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Session token of the holder, empty once released
    pub owner_id: String,
    pub expire_duration_ms: u64,
    pub acquire_time: DateTime<Utc>,
    pub renew_time: DateTime<Utc>,
}

impl LockRecord {
    fn new(owner_id: &str, lease: Duration, now: DateTime<Utc>) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            expire_duration_ms: u64::try_from(lease.as_millis()).unwrap_or(u64::MAX),
            acquire_time: now,
            renew_time: now,
        }
    }

    /// Whether the record was released
    pub fn is_free(&self) -> bool {
        self.owner_id.is_empty()
    }

    /// When the lease lapses unless renewed
    ///
    /// A lease too long to represent never lapses.
    pub fn expires_at(&self) -> DateTime<Utc> {
        i64::try_from(self.expire_duration_ms)
            .ok()
            .and_then(chrono::Duration::try_milliseconds)
            .and_then(|lease| self.renew_time.checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() <= now
    }

    /// Whether someone holds a live lease
    pub fn is_held(&self, now: DateTime<Utc>) -> bool {
        !self.is_free() && !self.is_expired(now)
    }
}

/// Timing parameters of the lock
#[derive(Debug, Clone)]
pub struct LockSettings {
    pub lease: Duration,
    pub renew_interval: Duration,
    pub acquire_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl From<&LockConfig> for LockSettings {
    fn from(config: &LockConfig) -> Self {
        Self {
            lease: Duration::from_secs(config.lease_secs),
            renew_interval: Duration::from_secs(config.renew_interval_secs),
            acquire_timeout: Duration::from_secs(config.acquire_timeout_secs),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self::from(&LockConfig::default())
    }
}

/// Per-digest mutual exclusion over the shared store
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn KeyValueStore>,
    settings: LockSettings,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn KeyValueStore>, settings: LockSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    /// Read the current record, if any
    pub async fn record(&self, digest: &str) -> LayerCacheResult<Option<LockRecord>> {
        let key = lock_key(digest);
        match self.store.get(&key).await? {
            Some(raw) => serde_json::from_str(&raw).map(Some).map_err(|e| {
                LayerCacheError::CorruptedRecord {
                    key,
                    reason: e.to_string(),
                }
            }),
            None => Ok(None),
        }
    }

    /// Current live holder of a digest's lock
    pub async fn holder(&self, digest: &str) -> LayerCacheResult<Option<String>> {
        let now = Utc::now();
        Ok(self
            .record(digest)
            .await?
            .filter(|r| r.is_held(now))
            .map(|r| r.owner_id))
    }

    /// Single acquisition attempt
    ///
    /// Succeeds when the record is absent, released, or expired and our CAS
    /// wins. A live lease held by anyone (including `owner_id`) is `false`.
    pub async fn try_acquire(
        &self,
        digest: &str,
        owner_id: &str,
        lease: Duration,
    ) -> LayerCacheResult<bool> {
        let key = lock_key(digest);
        let now = Utc::now();
        let current = self.store.get(&key).await?;

        if let Some(raw) = &current {
            match serde_json::from_str::<LockRecord>(raw) {
                Ok(record) if record.is_held(now) => {
                    debug!(key = %key, holder = %record.owner_id, "Lock held");
                    return Ok(false);
                }
                Ok(record) if !record.is_free() => {
                    debug!(key = %key, stale_owner = %record.owner_id, "Lease expired, attempting takeover");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(key = %key, "Overwriting unreadable lock record: {}", e);
                }
            }
        }

        let record = serde_json::to_string(&LockRecord::new(owner_id, lease, now))?;
        let acquired = self
            .store
            .compare_and_swap(&key, current.as_deref(), &record)
            .await?;

        if acquired {
            debug!(key = %key, owner = %owner_id, "Lock acquired");
        }
        Ok(acquired)
    }

    /// Acquire with the configured timeout and start lease renewal
    pub async fn acquire(&self, digest: &str, owner_id: &str) -> LayerCacheResult<LockGuard> {
        self.acquire_within(digest, owner_id, self.settings.acquire_timeout)
            .await
    }

    /// Retry `try_acquire` with jittered exponential backoff until `timeout`
    ///
    /// Waiters are not served in FIFO order. Transient store failures are
    /// retried inside the deadline; a timeout is reported as `LockTimeout`.
    pub async fn acquire_within(
        &self,
        digest: &str,
        owner_id: &str,
        timeout: Duration,
    ) -> LayerCacheResult<LockGuard> {
        let started = Instant::now();
        let deadline = started
            .checked_add(timeout)
            .unwrap_or_else(|| started + MAX_WAIT);
        let mut backoff = Backoff::new(self.settings.initial_backoff, self.settings.max_backoff);

        loop {
            match self.try_acquire(digest, owner_id, self.settings.lease).await {
                Ok(true) => return Ok(LockGuard::start(self.clone(), digest, owner_id)),
                Ok(false) => {}
                Err(e) if e.is_retryable() => {
                    debug!(digest = %digest, "Lock attempt failed, retrying: {}", e);
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LayerCacheError::LockTimeout {
                    key: lock_key(digest),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }

            tokio::time::sleep(backoff.next_delay().min(deadline - now)).await;
        }
    }

    /// Extend our lease; fails with `LockLost` if someone else holds it now
    pub async fn renew(&self, digest: &str, owner_id: &str) -> LayerCacheResult<()> {
        let key = lock_key(digest);
        let lost = || LayerCacheError::LockLost {
            key: key.clone(),
            owner_id: owner_id.to_string(),
        };

        let raw = self.store.get(&key).await?.ok_or_else(lost)?;
        let mut record: LockRecord = serde_json::from_str(&raw).map_err(|_| lost())?;
        if record.owner_id != owner_id {
            return Err(lost());
        }

        record.renew_time = Utc::now();
        let renewed = serde_json::to_string(&record)?;
        if !self.store.compare_and_swap(&key, Some(&raw), &renewed).await? {
            return Err(lost());
        }
        Ok(())
    }

    /// Clear ownership if `owner_id` still holds the record
    ///
    /// Releasing a lock someone else took over is a no-op, and so is a
    /// release whose read of the record fails.
    pub async fn release(&self, digest: &str, owner_id: &str) -> LayerCacheResult<()> {
        let key = lock_key(digest);

        let raw = match self.store.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(key = %key, "Could not read lock record, skipping release: {}", e);
                return Ok(());
            }
        };

        let mut record: LockRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(_) => return Ok(()),
        };
        if record.owner_id != owner_id {
            debug!(key = %key, holder = %record.owner_id, "Release by non-owner ignored");
            return Ok(());
        }

        record.owner_id.clear();
        record.renew_time = Utc::now();
        let cleared = serde_json::to_string(&record)?;
        if self.store.compare_and_swap(&key, Some(&raw), &cleared).await? {
            debug!(key = %key, owner = %owner_id, "Lock released");
        }
        Ok(())
    }
}

/// A held lock with its renewal task
///
/// Dropping the guard stops renewal without releasing; the lease then
/// expires on its own. Call `release` for a prompt hand-off.
pub struct LockGuard {
    lock: DistributedLock,
    digest: String,
    owner_id: String,
    lost_rx: watch::Receiver<bool>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl LockGuard {
    fn start(lock: DistributedLock, digest: &str, owner_id: &str) -> Self {
        let (lost_tx, lost_rx) = watch::channel(false);
        let (stop_tx, stop_rx) = oneshot::channel();

        let task = tokio::spawn(renew_loop(
            lock.clone(),
            digest.to_string(),
            owner_id.to_string(),
            lost_tx,
            stop_rx,
        ));

        Self {
            lock,
            digest: digest.to_string(),
            owner_id: owner_id.to_string(),
            lost_rx,
            stop_tx: Some(stop_tx),
            task: Some(task),
        }
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Error reported by work abandoned because the lease was lost
    pub fn lost_error(&self) -> LayerCacheError {
        LayerCacheError::LockLost {
            key: lock_key(&self.digest),
            owner_id: self.owner_id.clone(),
        }
    }

    /// Whether the lease can no longer be trusted
    pub fn is_lost(&self) -> bool {
        *self.lost_rx.borrow()
    }

    /// Resolves once the lease is lost
    pub async fn lost(&self) {
        let mut rx = self.lost_rx.clone();
        // A closed channel means renewal stopped; treat it as lost too
        let _ = rx.wait_for(|lost| *lost).await;
    }

    /// Stop renewal and clear the record
    pub async fn release(mut self) -> LayerCacheResult<()> {
        self.stop_renewal().await;
        self.lock.release(&self.digest, &self.owner_id).await
    }

    async fn stop_renewal(&mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
    }
}

async fn renew_loop(
    lock: DistributedLock,
    digest: String,
    owner_id: String,
    lost_tx: watch::Sender<bool>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(lock.settings.renew_interval);
    // First tick fires immediately; the lease was just written
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = &mut stop_rx => return,
            _ = ticker.tick() => {}
        }

        match lock.renew(&digest, &owner_id).await {
            Ok(()) => debug!(digest = %digest, owner = %owner_id, "Lease renewed"),
            Err(e) => {
                info!(digest = %digest, owner = %owner_id, "Lease renewal failed, lock dropped: {}", e);
                let _ = lost_tx.send(true);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, ScanPage, ScanRequest};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn settings(lease_ms: u64, renew_ms: u64) -> LockSettings {
        LockSettings {
            lease: Duration::from_millis(lease_ms),
            renew_interval: Duration::from_millis(renew_ms),
            acquire_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        }
    }

    fn lock_with(store: Arc<dyn KeyValueStore>, lease_ms: u64, renew_ms: u64) -> DistributedLock {
        DistributedLock::new(store, settings(lease_ms, renew_ms))
    }

    /// Store that can be switched into an outage
    struct FlakyStore {
        inner: MemoryStore,
        down: AtomicBool,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                down: AtomicBool::new(false),
            }
        }

        fn check(&self) -> LayerCacheResult<()> {
            if self.down.load(Ordering::SeqCst) {
                Err(LayerCacheError::unavailable("test", "store down"))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl KeyValueStore for FlakyStore {
        async fn get(&self, key: &str) -> LayerCacheResult<Option<String>> {
            self.check()?;
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> LayerCacheResult<()> {
            self.check()?;
            self.inner.set(key, value, ttl).await
        }

        async fn compare_and_swap(
            &self,
            key: &str,
            expected: Option<&str>,
            new_value: &str,
        ) -> LayerCacheResult<bool> {
            self.check()?;
            self.inner.compare_and_swap(key, expected, new_value).await
        }

        async fn delete(&self, key: &str) -> LayerCacheResult<bool> {
            self.check()?;
            self.inner.delete(key).await
        }

        async fn scan(&self, request: ScanRequest) -> LayerCacheResult<ScanPage> {
            self.check()?;
            self.inner.scan(request).await
        }

        fn backend_name(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn concurrent_try_acquire_has_one_winner() {
        let lock = lock_with(Arc::new(MemoryStore::new()), 5_000, 1_000);

        let mut tasks = Vec::new();
        for i in 0..8 {
            let lock = lock.clone();
            tasks.push(tokio::spawn(async move {
                lock.try_acquire("digest-x", &format!("owner-{i}"), Duration::from_secs(5))
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn same_owner_cannot_reenter() {
        let lock = lock_with(Arc::new(MemoryStore::new()), 5_000, 1_000);
        assert!(lock.try_acquire("d", "a", Duration::from_secs(5)).await.unwrap());
        assert!(!lock.try_acquire("d", "a", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let lock = lock_with(Arc::new(MemoryStore::new()), 200, 50);
        let lease = Duration::from_millis(200);

        assert!(lock.try_acquire("d", "crashed", lease).await.unwrap());
        assert!(!lock.try_acquire("d", "other", lease).await.unwrap());

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(lock.try_acquire("d", "other", lease).await.unwrap());
        assert_eq!(lock.holder("d").await.unwrap().as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn dropped_guard_stops_renewal_and_lease_expires() {
        let lock = lock_with(Arc::new(MemoryStore::new()), 300, 100);

        let guard = lock.acquire_within("d", "a", Duration::from_secs(1)).await.unwrap();
        drop(guard);

        assert!(!lock.try_acquire("d", "b", Duration::from_millis(300)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert!(lock.try_acquire("d", "b", Duration::from_millis(300)).await.unwrap());
    }

    #[tokio::test]
    async fn renewal_keeps_lease_alive() {
        let lock = lock_with(Arc::new(MemoryStore::new()), 300, 80);

        let guard = lock.acquire_within("d", "a", Duration::from_secs(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;

        assert!(!guard.is_lost());
        assert!(!lock.try_acquire("d", "b", Duration::from_millis(300)).await.unwrap());
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn contended_acquire_times_out_then_succeeds_after_release() {
        let lock = lock_with(Arc::new(MemoryStore::new()), 5_000, 1_000);

        let first = lock.acquire_within("digest-x", "a", Duration::from_secs(1)).await.unwrap();

        let err = lock
            .acquire_within("digest-x", "b", Duration::from_millis(150))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LayerCacheError::LockTimeout { .. }));

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move {
                lock.acquire_within("digest-x", "b", Duration::from_secs(2)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        first.release().await.unwrap();

        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.owner_id(), "b");
        second.release().await.unwrap();
    }

    #[tokio::test]
    async fn release_by_other_owner_is_noop() {
        let lock = lock_with(Arc::new(MemoryStore::new()), 5_000, 1_000);
        assert!(lock.try_acquire("d", "a", Duration::from_secs(5)).await.unwrap());

        lock.release("d", "b").await.unwrap();
        assert_eq!(lock.holder("d").await.unwrap().as_deref(), Some("a"));

        lock.release("d", "a").await.unwrap();
        assert_eq!(lock.holder("d").await.unwrap(), None);

        // Key stays behind as a cleared record
        let record = lock.record("d").await.unwrap().unwrap();
        assert!(record.is_free());
    }

    #[tokio::test]
    async fn release_ignores_read_failure() {
        let store = Arc::new(FlakyStore::new());
        let lock = lock_with(store.clone(), 5_000, 1_000);
        assert!(lock.try_acquire("d", "a", Duration::from_secs(5)).await.unwrap());

        store.down.store(true, Ordering::SeqCst);
        lock.release("d", "a").await.unwrap();
    }

    #[tokio::test]
    async fn failed_renewal_marks_guard_lost() {
        let store = Arc::new(FlakyStore::new());
        let lock = lock_with(store.clone(), 400, 50);

        let guard = lock.acquire_within("d", "a", Duration::from_secs(1)).await.unwrap();
        store.down.store(true, Ordering::SeqCst);

        tokio::time::timeout(Duration::from_secs(2), guard.lost())
            .await
            .expect("guard should report loss");
        assert!(guard.is_lost());
    }

    #[tokio::test]
    async fn renew_after_takeover_reports_lost() {
        let lock = lock_with(Arc::new(MemoryStore::new()), 100, 30);
        assert!(lock.try_acquire("d", "a", Duration::from_millis(100)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(lock.try_acquire("d", "b", Duration::from_millis(100)).await.unwrap());

        let err = lock.renew("d", "a").await.unwrap_err();
        assert!(matches!(err, LayerCacheError::LockLost { .. }));
    }

    #[test]
    fn record_expiry() {
        let now = Utc::now();
        let record = LockRecord::new("a", Duration::from_secs(30), now);
        assert!(record.is_held(now));
        assert!(record.is_expired(now + chrono::Duration::seconds(31)));
        assert_eq!(lock_key("abc"), "lock:abc");
    }

    #[test]
    fn oversized_lease_never_expires() {
        let now = Utc::now();
        let record = LockRecord::new("a", Duration::from_secs(10_u64.pow(13)), now);
        assert_eq!(record.expires_at(), DateTime::<Utc>::MAX_UTC);
        assert!(record.is_held(now + chrono::Duration::days(365)));

        let stored = LockRecord {
            expire_duration_ms: u64::MAX,
            ..record
        };
        assert!(stored.is_held(now));
    }

    #[tokio::test]
    async fn oversized_lease_blocks_other_owners() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let lock = lock_with(store, 1000, 100);
        let huge = Duration::from_secs(10_u64.pow(13));

        assert!(lock.try_acquire("d", "a", huge).await.unwrap());
        assert!(!lock.try_acquire("d", "b", huge).await.unwrap());
        assert_eq!(lock.holder("d").await.unwrap().as_deref(), Some("a"));
    }
}
