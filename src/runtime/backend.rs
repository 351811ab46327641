//! Runtime backend abstraction
//!
//! Both container runtimes sit behind one small contract so the scanner
//! never cares which storage layout it is reading.

use crate::cache::LayerKind;
use crate::error::LayerCacheResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Local layer storage of one container runtime
#[async_trait]
pub trait RuntimeBackend: Send + Sync {
    /// Locator kind this backend publishes under
    fn kind(&self) -> LayerKind;

    /// Check if the backend is enabled and its storage readable
    async fn probe(&self) -> bool;

    /// Every digest the runtime holds, mapped to its local path
    ///
    /// Broken per-layer metadata is skipped, never fatal.
    async fn list_digests(&self) -> LayerCacheResult<HashMap<String, PathBuf>>;

    /// Write a servable archive of the layer at `source` to `dest`
    ///
    /// Returns the archive size in bytes.
    async fn materialize(&self, source: &Path, dest: &Path) -> LayerCacheResult<u64>;

    /// Get the human-readable runtime name for display
    fn runtime_name(&self) -> &'static str {
        match self.kind() {
            LayerKind::Dockerd => "Docker",
            LayerKind::Containerd => "containerd",
            LayerKind::Torrent => "torrent",
            LayerKind::Static => "static",
        }
    }
}
