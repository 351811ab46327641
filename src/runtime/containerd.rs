//! containerd content store
//!
//! Blobs are stored by digest under `io.containerd.content.v1.content`, so a
//! layer blob is already the compressed archive clients expect.

use crate::cache::{is_hex_digest, LayerKind};
use crate::error::{LayerCacheError, LayerCacheResult};
use crate::runtime::archive;
use crate::runtime::backend::RuntimeBackend;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub struct ContainerdBackend {
    enabled: bool,
    root: PathBuf,
    verify_digests: bool,
}

impl ContainerdBackend {
    pub fn new(enabled: bool, root: impl Into<PathBuf>, verify_digests: bool) -> Self {
        Self {
            enabled,
            root: root.into(),
            verify_digests,
        }
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root.join("io.containerd.content.v1.content/blobs/sha256")
    }
}

#[async_trait]
impl RuntimeBackend for ContainerdBackend {
    fn kind(&self) -> LayerKind {
        LayerKind::Containerd
    }

    async fn probe(&self) -> bool {
        self.enabled
            && tokio::fs::metadata(self.blobs_dir())
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false)
    }

    async fn list_digests(&self) -> LayerCacheResult<HashMap<String, PathBuf>> {
        let blobs = self.blobs_dir();
        let mut layers = HashMap::new();

        let mut entries = match tokio::fs::read_dir(&blobs).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(layers),
            Err(e) => {
                return Err(LayerCacheError::io(
                    format!("reading {}", blobs.display()),
                    e,
                ))
            }
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| LayerCacheError::io(format!("reading {}", blobs.display()), e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);

            if !is_file || !is_hex_digest(&name) {
                warn!(entry = %name, "Skipping unexpected containerd blob entry");
                continue;
            }
            layers.insert(name, entry.path());
        }

        debug!(count = layers.len(), "Scanned containerd blobs");
        Ok(layers)
    }

    async fn materialize(&self, source: &Path, dest: &Path) -> LayerCacheResult<u64> {
        let digest = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let verify = self.verify_digests;
        let (source, dest) = (source.to_path_buf(), dest.to_path_buf());

        let task_digest = digest.clone();
        let result = tokio::task::spawn_blocking(move || -> LayerCacheResult<u64> {
            let size = archive::copy_file(&source, &dest)
                .map_err(|e| LayerCacheError::materialize(&task_digest, e))?;

            if verify {
                let actual = archive::sha256_file(&dest)
                    .map_err(|e| LayerCacheError::materialize(&task_digest, e))?;
                if actual != task_digest {
                    let _ = std::fs::remove_file(&dest);
                    return Err(LayerCacheError::DigestMismatch {
                        digest: task_digest,
                        actual,
                    });
                }
            }
            Ok(size)
        })
        .await
        .map_err(|e| LayerCacheError::Internal(format!("containerd copy task: {e}")))?;

        if result.is_ok() {
            debug!(digest = %digest, verified = verify, "Copied containerd blob");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    fn blobs(root: &Path) -> PathBuf {
        let dir = root.join("io.containerd.content.v1.content/blobs/sha256");
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn lists_hex_named_blobs() {
        let root = TempDir::new().unwrap();
        let dir = blobs(root.path());
        fs::write(dir.join(ABC_SHA256), b"abc").unwrap();
        fs::write(dir.join("ingest-tmp"), b"partial").unwrap();
        fs::create_dir(dir.join("ffff")).unwrap();

        let backend = ContainerdBackend::new(true, root.path(), false);
        assert!(backend.probe().await);

        let layers = backend.list_digests().await.unwrap();
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[ABC_SHA256], dir.join(ABC_SHA256));
    }

    #[tokio::test]
    async fn verified_copy_matches() {
        let root = TempDir::new().unwrap();
        let dir = blobs(root.path());
        fs::write(dir.join(ABC_SHA256), b"abc").unwrap();
        let dest = root.path().join("out");

        let size = ContainerdBackend::new(true, root.path(), true)
            .materialize(&dir.join(ABC_SHA256), &dest)
            .await
            .unwrap();
        assert_eq!(size, 3);
        assert_eq!(fs::read(&dest).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn corrupted_blob_is_rejected() {
        let root = TempDir::new().unwrap();
        let dir = blobs(root.path());
        fs::write(dir.join(ABC_SHA256), b"not abc").unwrap();
        let dest = root.path().join("out");

        let err = ContainerdBackend::new(true, root.path(), true)
            .materialize(&dir.join(ABC_SHA256), &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, LayerCacheError::DigestMismatch { .. }));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn disabled_backend_does_not_probe() {
        let root = TempDir::new().unwrap();
        blobs(root.path());
        assert!(!ContainerdBackend::new(false, root.path(), false).probe().await);
        assert!(!ContainerdBackend::new(true, root.path().join("missing"), false)
            .probe()
            .await);
    }
}
