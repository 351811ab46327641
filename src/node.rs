//! Cache node
//!
//! Builds every caching component from a `Config`, owns their background
//! tasks, and tears them down in order.

use crate::cache::{CacheStore, QueryRetry};
use crate::config::{Config, ConfigManager};
use crate::error::LayerCacheResult;
use crate::journal::EventJournal;
use crate::lock::{DistributedLock, LockSettings};
use crate::resolver::LayerResolver;
use crate::retention::{CollectorHandle, RetentionCollector, RetentionSettings};
use crate::runtime::{create_backends, RuntimeBackend, RuntimeScanner, ScannerHandle, ScannerPaths};
use crate::store::{self, KeyValueStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

pub struct CacheNode {
    config: Config,
    owner_id: String,
    cache: Arc<CacheStore>,
    lock: DistributedLock,
    scanner: Arc<RuntimeScanner>,
    journal: Arc<EventJournal>,
    resolver: Arc<LayerResolver>,
    collector: Arc<RetentionCollector>,
    scanner_task: Option<ScannerHandle>,
    collector_task: Option<CollectorHandle>,
}

impl CacheNode {
    /// Start a node with the configured store and runtime backends
    pub async fn start(config: Config) -> LayerCacheResult<Self> {
        let store = store::connect(&config.store)?;
        let backends = create_backends(&config.runtime);
        Self::start_with(config, store, backends).await
    }

    /// Start a node on an explicit store and backend set
    pub async fn start_with(
        config: Config,
        store: Arc<dyn KeyValueStore>,
        backends: Vec<Arc<dyn RuntimeBackend>>,
    ) -> LayerCacheResult<Self> {
        config.validate()?;
        ConfigManager::ensure_storage_dirs(&config).await?;

        // Without a journal retention cannot work; refuse to start
        let journal = Arc::new(
            EventJournal::open(&config.journal.path, config.journal.queue_capacity).await?,
        );

        let owner_id = config
            .node
            .owner_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let cache = Arc::new(
            CacheStore::new(
                store.clone(),
                config.node.host.clone(),
                config.store.locator_ttl(),
            )
            .with_query_retry(QueryRetry {
                deadline: config.store.query_timeout(),
                ..QueryRetry::default()
            }),
        );
        let lock = DistributedLock::new(store.clone(), LockSettings::from(&config.lock));

        let scanner = Arc::new(RuntimeScanner::new(
            backends,
            cache.clone(),
            ScannerPaths {
                serving_dir: config.storage.download_dir.clone(),
                staging_dir: config.storage.staging_dir(),
                staged_roots: vec![
                    config.storage.transfer_dir.clone(),
                    config.storage.torrent_dir.clone(),
                ],
            },
        ));
        let runtimes = scanner.init().await;
        let published = scanner.rescan_once().await?;

        let resolver = Arc::new(LayerResolver::new(
            cache.clone(),
            lock.clone(),
            scanner.clone(),
            journal.clone(),
            owner_id.clone(),
        ));
        let collector = Arc::new(RetentionCollector::new(RetentionSettings::from(&config)));

        let scanner_task = Some(scanner.spawn(config.runtime.rescan_interval()));
        let collector_task = if config.retention.retain_days == 0 {
            info!("Retention disabled (retain_days = 0)");
            None
        } else {
            Some(collector.spawn(Duration::from_secs(config.retention.interval_secs)))
        };

        info!(
            host = %config.node.host,
            owner = %owner_id,
            store = store.backend_name(),
            runtimes = ?runtimes,
            published,
            "Cache node started"
        );

        Ok(Self {
            config,
            owner_id,
            cache,
            lock,
            scanner,
            journal,
            resolver,
            collector,
            scanner_task,
            collector_task,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Lock owner token of this process
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn lock(&self) -> &DistributedLock {
        &self.lock
    }

    pub fn scanner(&self) -> &Arc<RuntimeScanner> {
        &self.scanner
    }

    pub fn journal(&self) -> &Arc<EventJournal> {
        &self.journal
    }

    pub fn resolver(&self) -> &Arc<LayerResolver> {
        &self.resolver
    }

    pub fn collector(&self) -> &Arc<RetentionCollector> {
        &self.collector
    }

    /// Stop background tasks, withdraw this host's locators and drain the journal
    pub async fn shutdown(mut self) -> LayerCacheResult<()> {
        if let Some(task) = self.scanner_task.take() {
            task.stop().await;
        }
        if let Some(task) = self.collector_task.take() {
            task.stop().await;
        }

        let host = self.config.node.host.clone();
        match self.cache.delete_host_entries(&host).await {
            Ok(deleted) => info!(host = %host, deleted, "Withdrew locators"),
            Err(e) => warn!(host = %host, "Failed to withdraw locators: {}", e),
        }

        self.journal.shutdown().await;
        info!(host = %host, "Cache node stopped");
        Ok(())
    }
}
