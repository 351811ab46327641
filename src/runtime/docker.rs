//! Docker overlay2 layer store
//!
//! Docker keeps layers by chain ID. Each chain directory names the layer's
//! uncompressed diff ID and the overlay2 cache ID holding its files; the
//! distribution metadata maps a diff ID back to the compressed digests it
//! was pulled as. Those digests are what registry clients ask for.
//!
//! ```text
//! {root}/image/overlay2/layerdb/sha256/{chain-id}/diff       "sha256:{diff-id}"
//! {root}/image/overlay2/layerdb/sha256/{chain-id}/cache-id   "{cache-id}"
//! {root}/image/overlay2/distribution/v2metadata-by-diffid/sha256/{diff-id}
//! {root}/overlay2/{cache-id}/diff/                           layer files
//! ```

use crate::cache::{normalize_digest, LayerKind};
use crate::error::{LayerCacheError, LayerCacheResult};
use crate::runtime::archive;
use crate::runtime::backend::RuntimeBackend;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One entry of `v2metadata-by-diffid`
#[derive(Debug, Deserialize)]
struct V2Metadata {
    #[serde(rename = "Digest")]
    digest: String,
    #[serde(rename = "SourceRepository", default)]
    source_repository: String,
}

/// Layer backend reading Docker's overlay2 storage
pub struct DockerBackend {
    enabled: bool,
    root: PathBuf,
}

impl DockerBackend {
    pub fn new(enabled: bool, root: impl Into<PathBuf>) -> Self {
        Self {
            enabled,
            root: root.into(),
        }
    }

    fn layerdb_dir(&self) -> PathBuf {
        self.root.join("image/overlay2/layerdb/sha256")
    }

    fn diffid_metadata_dir(&self) -> PathBuf {
        self.root
            .join("image/overlay2/distribution/v2metadata-by-diffid/sha256")
    }

    fn overlay_dir(&self) -> PathBuf {
        self.root.join("overlay2")
    }

    /// Build the digest map; blocking
    fn scan(&self) -> LayerCacheResult<HashMap<String, PathBuf>> {
        let layerdb = self.layerdb_dir();
        let mut layers = HashMap::new();

        let entries = match fs::read_dir(&layerdb) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(layers),
            Err(e) => {
                return Err(LayerCacheError::io(
                    format!("reading {}", layerdb.display()),
                    e,
                ))
            }
        };

        for entry in entries.flatten() {
            let chain_dir = entry.path();
            match self.read_chain(&chain_dir) {
                Ok(found) => {
                    for (digest, path) in found {
                        layers.insert(digest, path);
                    }
                }
                Err(reason) => {
                    warn!(chain = %chain_dir.display(), "Skipping docker layer: {}", reason);
                }
            }
        }

        debug!(count = layers.len(), "Scanned docker layers");
        Ok(layers)
    }

    /// Resolve one chain directory to the digests it serves
    fn read_chain(&self, chain_dir: &Path) -> Result<Vec<(String, PathBuf)>, String> {
        let diff_id = read_trimmed(&chain_dir.join("diff"))?;
        let diff_id = normalize_digest(&diff_id).map_err(|e| e.to_string())?;
        let cache_id = read_trimmed(&chain_dir.join("cache-id"))?;
        if cache_id.is_empty() || cache_id.contains('/') {
            return Err(format!("bad cache-id {cache_id:?}"));
        }

        let layer_path = self.overlay_dir().join(&cache_id).join("diff");
        if !layer_path.is_dir() {
            return Err(format!("missing layer directory {}", layer_path.display()));
        }

        let metadata_path = self.diffid_metadata_dir().join(&diff_id);
        let raw = fs::read_to_string(&metadata_path)
            .map_err(|e| format!("reading {}: {}", metadata_path.display(), e))?;
        let metadata: Vec<V2Metadata> = serde_json::from_str(&raw)
            .map_err(|e| format!("parsing {}: {}", metadata_path.display(), e))?;

        let mut found = Vec::new();
        for entry in metadata {
            match normalize_digest(&entry.digest) {
                Ok(digest) => {
                    debug!(digest = %digest, repo = %entry.source_repository, "Docker layer");
                    found.push((digest, layer_path.clone()));
                }
                Err(e) => warn!(diff_id = %diff_id, "Ignoring metadata entry: {}", e),
            }
        }

        if found.is_empty() {
            return Err(format!("no distribution digest for diff {diff_id}"));
        }
        Ok(found)
    }
}

fn read_trimmed(path: &Path) -> Result<String, String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| format!("reading {}: {}", path.display(), e))
}

#[async_trait]
impl RuntimeBackend for DockerBackend {
    fn kind(&self) -> LayerKind {
        LayerKind::Dockerd
    }

    async fn probe(&self) -> bool {
        if !self.enabled {
            return false;
        }
        tokio::fs::metadata(self.layerdb_dir())
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    async fn list_digests(&self) -> LayerCacheResult<HashMap<String, PathBuf>> {
        let backend = Self::new(self.enabled, self.root.clone());
        tokio::task::spawn_blocking(move || backend.scan())
            .await
            .map_err(|e| LayerCacheError::Internal(format!("docker scan task: {e}")))?
    }

    async fn materialize(&self, source: &Path, dest: &Path) -> LayerCacheResult<u64> {
        let (source, dest) = (source.to_path_buf(), dest.to_path_buf());
        let label = source.display().to_string();

        tokio::task::spawn_blocking(move || archive::tar_gzip_dir(&source, &dest))
            .await
            .map_err(|e| LayerCacheError::Internal(format!("docker archive task: {e}")))?
            .map_err(|e| LayerCacheError::materialize(label, e))
    }
}
