//! Configuration schema for layercache
//!
//! Configuration is stored at `~/.config/layercache/config.toml`

use crate::config::ConfigManager;
use crate::error::{LayerCacheError, LayerCacheResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Longest accepted lock lease (one day)
pub const MAX_LEASE_SECS: u64 = 86_400;

/// Longest accepted retention window (one hundred years)
pub const MAX_RETAIN_DAYS: u32 = 36_500;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Identity of this proxy replica
    pub node: NodeConfig,

    /// Shared key/value store settings
    pub store: StoreConfig,

    /// Distributed lock settings
    pub lock: LockConfig,

    /// Managed storage roots
    pub storage: StorageConfig,

    /// Container runtime backends
    pub runtime: RuntimeConfig,

    /// Access journal settings
    pub journal: JournalConfig,

    /// Retention collector settings
    pub retention: RetentionConfig,
}

impl Config {
    /// Check cross-field constraints that serde defaults cannot express
    pub fn validate(&self) -> LayerCacheResult<()> {
        if self.lock.lease_secs == 0 {
            return Err(invalid("lock.lease_secs must be greater than zero"));
        }
        if self.lock.lease_secs > MAX_LEASE_SECS {
            return Err(invalid(format!(
                "lock.lease_secs ({}) exceeds the maximum of {}",
                self.lock.lease_secs, MAX_LEASE_SECS
            )));
        }
        // Renewal must land at least twice per lease
        if self.lock.renew_interval_secs == 0
            || self.lock.renew_interval_secs.saturating_mul(2) >= self.lock.lease_secs
        {
            return Err(invalid(format!(
                "lock.renew_interval_secs ({}) must be below half of lock.lease_secs ({})",
                self.lock.renew_interval_secs, self.lock.lease_secs
            )));
        }
        if self.lock.initial_backoff_ms > self.lock.max_backoff_ms {
            return Err(invalid("lock.initial_backoff_ms exceeds lock.max_backoff_ms"));
        }
        if self.store.locator_ttl_secs == 0 {
            return Err(invalid("store.locator_ttl_secs must be greater than zero"));
        }
        if self.store.backend == StoreBackend::Etcd && self.store.endpoints.is_empty() {
            return Err(invalid("store.backend = \"etcd\" requires at least one endpoint"));
        }
        if self.runtime.rescan_interval_secs == 0 || self.retention.interval_secs == 0 {
            return Err(invalid("rescan and retention intervals must be greater than zero"));
        }
        if self.runtime.rescan_interval_secs >= self.store.locator_ttl_secs {
            return Err(invalid(format!(
                "runtime.rescan_interval_secs ({}) must be shorter than store.locator_ttl_secs ({})",
                self.runtime.rescan_interval_secs, self.store.locator_ttl_secs
            )));
        }
        if self.journal.queue_capacity == 0 {
            return Err(invalid("journal.queue_capacity must be greater than zero"));
        }
        if self.retention.retain_days > MAX_RETAIN_DAYS {
            return Err(invalid(format!(
                "retention.retain_days ({}) exceeds the maximum of {}",
                self.retention.retain_days, MAX_RETAIN_DAYS
            )));
        }
        if self.retention.batch_lines == 0 {
            return Err(invalid("retention.batch_lines must be greater than zero"));
        }
        if self.node.host.is_empty() || self.node.host.contains('/') {
            return Err(invalid(format!("node.host {:?} is not a valid address", self.node.host)));
        }
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> LayerCacheError {
    LayerCacheError::ConfigValidation(reason.into())
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Enable verbose logging
    pub verbose: bool,

    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            log_format: "text".to_string(),
        }
    }
}

/// Identity of this replica in the cluster-wide index
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Network-reachable address peers use to fetch layers from us
    pub host: String,

    /// Lock owner token (a fresh UUID per process when unset)
    pub owner_id: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1:5000".to_string(),
            owner_id: None,
        }
    }
}

/// Which shared store implementation to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store, only shared between components of one replica
    #[default]
    Memory,
    /// etcd v3 through its JSON gateway
    Etcd,
}

/// Shared key/value store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store implementation
    pub backend: StoreBackend,

    /// Store endpoints (e.g. "http://10.0.0.5:2379")
    pub endpoints: Vec<String>,

    /// Username for store authentication
    pub username: Option<String>,

    /// Password for store authentication
    pub password: Option<String>,

    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,

    /// Lifetime of a published locator in seconds
    pub locator_ttl_secs: u64,

    /// How long a locator query retries an unavailable store, in seconds
    pub query_timeout_secs: u64,
}

impl StoreConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn locator_ttl(&self) -> Duration {
        Duration::from_secs(self.locator_ttl_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            endpoints: vec![],
            username: None,
            password: None,
            request_timeout_secs: 5,
            locator_ttl_secs: 180,
            query_timeout_secs: 10,
        }
    }
}

/// Distributed lock settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lease duration in seconds
    pub lease_secs: u64,

    /// Lease renewal interval in seconds (must be below lease_secs / 2)
    pub renew_interval_secs: u64,

    /// How long a caller waits for a contended lock
    pub acquire_timeout_secs: u64,

    /// First retry delay in milliseconds
    pub initial_backoff_ms: u64,

    /// Retry delay ceiling in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_secs: 30,
            renew_interval_secs: 10,
            acquire_timeout_secs: 60,
            initial_backoff_ms: 50,
            max_backoff_ms: 2000,
        }
    }
}

/// Managed storage roots
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Downloaded layers, also the serving directory for materialized archives
    pub download_dir: PathBuf,

    /// Torrent cache
    pub torrent_dir: PathBuf,

    /// Transfer staging area
    pub transfer_dir: PathBuf,

    /// Small-file cache
    pub small_file_dir: PathBuf,

    /// OCI export directory
    pub oci_dir: PathBuf,
}

impl StorageConfig {
    /// All roots the retention collector measures and prunes
    pub fn roots(&self) -> Vec<PathBuf> {
        vec![
            self.download_dir.clone(),
            self.torrent_dir.clone(),
            self.transfer_dir.clone(),
            self.small_file_dir.clone(),
            self.oci_dir.clone(),
        ]
    }

    /// Directory materializations are written to before being renamed into place
    pub fn staging_dir(&self) -> PathBuf {
        self.transfer_dir.join(".staging")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let root = ConfigManager::state_dir().join("storage");
        Self {
            download_dir: root.join("download"),
            torrent_dir: root.join("torrent"),
            transfer_dir: root.join("transfer"),
            small_file_dir: root.join("small"),
            oci_dir: root.join("oci"),
        }
    }
}

/// Container runtime backends
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Seconds between runtime rescans
    pub rescan_interval_secs: u64,

    /// Docker (overlay2) backend
    pub docker: DockerConfig,

    /// Containerd content-store backend
    pub containerd: ContainerdConfig,
}

impl RuntimeConfig {
    pub fn rescan_interval(&self) -> Duration {
        Duration::from_secs(self.rescan_interval_secs)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            rescan_interval_secs: 60,
            docker: DockerConfig::default(),
            containerd: ContainerdConfig::default(),
        }
    }
}

/// Docker backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub enabled: bool,

    /// Docker data root
    pub root: PathBuf,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: PathBuf::from("/var/lib/docker"),
        }
    }
}

/// Containerd backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerdConfig {
    pub enabled: bool,

    /// Containerd data root
    pub root: PathBuf,

    /// Re-hash blobs before serving them
    pub verify_digests: bool,
}

impl Default for ContainerdConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: PathBuf::from("/var/lib/containerd"),
            verify_digests: false,
        }
    }
}

/// Access journal settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Journal file (JSON lines, append-only)
    pub path: PathBuf,

    /// In-memory queue depth before producers block
    pub queue_capacity: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            path: ConfigManager::journal_path(),
            queue_capacity: 1024,
        }
    }
}

/// Retention collector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Days a journal reference keeps a layer alive (0 = collection disabled)
    pub retain_days: u32,

    /// Total storage size that triggers collection, in GB
    pub threshold_gb: u32,

    /// Journal lines examined per batch while looking for the retention boundary
    pub batch_lines: usize,

    /// Seconds between scheduled collection passes
    pub interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retain_days: 7,
            threshold_gb: 100,
            batch_lines: 10_000,
            interval_secs: 3600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [node]
            host = "10.0.0.1:5000"

            [retention]
            retain_days = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.node.host, "10.0.0.1:5000");
        assert_eq!(config.retention.retain_days, 3);
        assert_eq!(config.retention.batch_lines, 10_000);
        assert_eq!(config.store.locator_ttl_secs, 180);
        assert_eq!(config.store.backend, StoreBackend::Memory);
    }

    #[test]
    fn renew_interval_must_be_below_half_lease() {
        let mut config = Config::default();
        config.lock.lease_secs = 20;
        config.lock.renew_interval_secs = 10;
        assert!(config.validate().is_err());

        config.lock.renew_interval_secs = 9;
        config.validate().unwrap();
    }

    #[test]
    fn oversized_durations_rejected() {
        let mut config = Config::default();
        config.lock.lease_secs = 10_u64.pow(13);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retention.retain_days = 100_000_000;
        assert!(config.validate().is_err());

        config.retention.retain_days = MAX_RETAIN_DAYS;
        config.validate().unwrap();
    }

    #[test]
    fn etcd_requires_endpoints() {
        let mut config = Config::default();
        config.store.backend = StoreBackend::Etcd;
        assert!(config.validate().is_err());

        config.store.endpoints = vec!["http://127.0.0.1:2379".to_string()];
        config.validate().unwrap();
    }

    #[test]
    fn rescan_must_outpace_ttl() {
        let mut config = Config::default();
        config.runtime.rescan_interval_secs = 180;
        assert!(config.validate().is_err());
    }

    #[test]
    fn host_with_slash_rejected() {
        let mut config = Config::default();
        config.node.host = "10.0.0.1/24".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn storage_roots_cover_every_directory() {
        let storage = StorageConfig::default();
        assert_eq!(storage.roots().len(), 5);
        assert!(storage.staging_dir().starts_with(&storage.transfer_dir));
    }
}
