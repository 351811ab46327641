//! Runtime scanner
//!
//! Keeps one digest -> path map per available backend, republishes those
//! maps into the locator index, and turns a known digest into a servable
//! archive on request.

use crate::cache::{normalize_digest, CacheStore, LayerKind};
use crate::error::{LayerCacheError, LayerCacheResult};
use crate::lock::LockGuard;
use crate::runtime::archive::{archive_name, copy_file, ARCHIVE_SUFFIX};
use crate::runtime::backend::RuntimeBackend;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

type DigestMap = Arc<HashMap<String, PathBuf>>;

/// Filesystem layout the scanner writes into
#[derive(Debug, Clone)]
pub struct ScannerPaths {
    /// Where finished archives are served from
    pub serving_dir: PathBuf,
    /// Where archives are built before the rename into `serving_dir`
    pub staging_dir: PathBuf,
    /// Roots whose files are already staged bytes and can simply be moved
    pub staged_roots: Vec<PathBuf>,
}

pub struct RuntimeScanner {
    backends: Vec<Arc<dyn RuntimeBackend>>,
    available: RwLock<Vec<Arc<dyn RuntimeBackend>>>,
    maps: RwLock<HashMap<LayerKind, DigestMap>>,
    cache: Arc<CacheStore>,
    paths: ScannerPaths,
}

impl RuntimeScanner {
    pub fn new(
        backends: Vec<Arc<dyn RuntimeBackend>>,
        cache: Arc<CacheStore>,
        paths: ScannerPaths,
    ) -> Self {
        Self {
            backends,
            available: RwLock::new(Vec::new()),
            maps: RwLock::new(HashMap::new()),
            cache,
            paths,
        }
    }

    /// Probe every backend concurrently
    ///
    /// Absent backends are skipped for the rest of the process. Returns the
    /// kinds that came up.
    pub async fn init(&self) -> Vec<LayerKind> {
        let probes = join_all(self.backends.iter().map(|b| async move { b.probe().await })).await;

        let mut available = Vec::new();
        for (backend, up) in self.backends.iter().zip(probes) {
            if up {
                info!(runtime = backend.runtime_name(), "Runtime backend available");
                available.push(backend.clone());
            } else {
                warn!(runtime = backend.runtime_name(), "Runtime backend unavailable, skipping");
            }
        }

        let kinds = available.iter().map(|b| b.kind()).collect();
        *self.available.write().await = available;
        kinds
    }

    /// Kinds of the backends found by `init`
    pub async fn available_kinds(&self) -> Vec<LayerKind> {
        self.available.read().await.iter().map(|b| b.kind()).collect()
    }

    /// Rebuild every backend's map and publish it
    ///
    /// A backend whose listing fails keeps its previous map. Returns the
    /// number of locators published.
    pub async fn rescan_once(&self) -> LayerCacheResult<usize> {
        let backends = self.available.read().await.clone();
        let mut published = 0;

        for backend in backends {
            let kind = backend.kind();
            let listed = match backend.list_digests().await {
                Ok(listed) => Arc::new(listed),
                Err(e) => {
                    warn!(kind = %kind, "Rescan failed, keeping previous map: {}", e);
                    continue;
                }
            };

            self.maps.write().await.insert(kind, listed.clone());

            let entries: Vec<(String, String)> = listed
                .iter()
                .map(|(digest, path)| (digest.clone(), path.to_string_lossy().into_owned()))
                .collect();
            if entries.is_empty() {
                continue;
            }

            match self.cache.put_many(kind, &entries).await {
                Ok(count) => {
                    debug!(kind = %kind, count, "Published runtime layers");
                    published += count;
                }
                Err(e) => warn!(kind = %kind, "Publishing rescan failed: {}", e),
            }
        }

        Ok(published)
    }

    /// Local path of a digest in one backend
    pub async fn lookup(&self, kind: LayerKind, digest: &str) -> Option<PathBuf> {
        let digest = normalize_digest(digest).ok()?;
        self.maps.read().await.get(&kind)?.get(&digest).cloned()
    }

    /// First runtime backend holding a digest
    pub async fn locate(&self, digest: &str) -> Option<(LayerKind, PathBuf)> {
        for kind in LayerKind::runtimes() {
            if let Some(path) = self.lookup(*kind, digest).await {
                return Some((*kind, path));
            }
        }
        None
    }

    /// Number of digests currently known per backend
    pub async fn counts(&self) -> HashMap<LayerKind, usize> {
        self.maps
            .read()
            .await
            .iter()
            .map(|(kind, map)| (*kind, map.len()))
            .collect()
    }

    /// Where the served archive for a digest lives
    pub fn serving_path(&self, digest: &str) -> PathBuf {
        self.paths.serving_dir.join(archive_name(digest))
    }

    async fn backend(&self, kind: LayerKind) -> LayerCacheResult<Arc<dyn RuntimeBackend>> {
        self.available
            .read()
            .await
            .iter()
            .find(|b| b.kind() == kind)
            .cloned()
            .ok_or(LayerCacheError::BackendUnavailable(kind))
    }

    fn partial_path(&self, kind: LayerKind, digest: &str) -> PathBuf {
        self.paths.staging_dir.join(format!(
            "{}.{}.{}.partial",
            digest,
            ARCHIVE_SUFFIX,
            kind.as_str().to_ascii_lowercase()
        ))
    }

    /// Build a `.partial` archive in staging and return its path
    async fn stage(
        &self,
        backend: &dyn RuntimeBackend,
        digest: &str,
        source: &Path,
    ) -> LayerCacheResult<PathBuf> {
        tokio::fs::create_dir_all(&self.paths.staging_dir)
            .await
            .map_err(|e| {
                LayerCacheError::io(
                    format!("creating {}", self.paths.staging_dir.display()),
                    e,
                )
            })?;

        let partial = self.partial_path(backend.kind(), digest);
        if let Err(e) = backend.materialize(source, &partial).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
        Ok(partial)
    }

    /// Produce the archive for a locally known digest
    ///
    /// The archive is built in staging and renamed into the serving
    /// directory, so readers never see a half-written file.
    pub async fn materialize(&self, kind: LayerKind, digest: &str) -> LayerCacheResult<PathBuf> {
        self.materialize_inner(kind, digest, None).await
    }

    /// `materialize` on behalf of a lock holder
    ///
    /// Staging is abandoned as soon as the lease is lost, and a producer
    /// without a lease never renames into the serving directory.
    pub async fn materialize_locked(
        &self,
        kind: LayerKind,
        digest: &str,
        guard: &LockGuard,
    ) -> LayerCacheResult<PathBuf> {
        self.materialize_inner(kind, digest, Some(guard)).await
    }

    async fn materialize_inner(
        &self,
        kind: LayerKind,
        digest: &str,
        guard: Option<&LockGuard>,
    ) -> LayerCacheResult<PathBuf> {
        let digest = normalize_digest(digest)?;
        let backend = self.backend(kind).await?;
        let source = self
            .lookup(kind, &digest)
            .await
            .ok_or_else(|| LayerCacheError::UnknownDigest {
                kind,
                digest: digest.clone(),
            })?;

        tokio::fs::create_dir_all(&self.paths.serving_dir)
            .await
            .map_err(|e| {
                LayerCacheError::io(format!("creating {}", self.paths.serving_dir.display()), e)
            })?;

        let partial = match guard {
            None => self.stage(backend.as_ref(), &digest, &source).await?,
            Some(guard) => {
                let staged = tokio::select! {
                    biased;
                    _ = guard.lost() => None,
                    staged = self.stage(backend.as_ref(), &digest, &source) => Some(staged?),
                };
                match staged {
                    Some(partial) if !guard.is_lost() => partial,
                    _ => {
                        warn!(digest = %digest, kind = %kind, "Lease lost while staging, abandoning archive");
                        let _ = tokio::fs::remove_file(self.partial_path(kind, &digest)).await;
                        return Err(guard.lost_error());
                    }
                }
            }
        };

        let dest = self.serving_path(&digest);
        publish_file(&partial, &dest).await?;

        info!(digest = %digest, kind = %kind, path = %dest.display(), "Materialized layer");
        Ok(dest)
    }

    /// Move or build a layer's bytes at `dest`
    ///
    /// Bytes already inside a staged root are moved as-is. Anything else is
    /// treated as runtime storage and archived through the backend first.
    pub async fn copy_to_destination(
        &self,
        kind: LayerKind,
        source: &Path,
        dest: &Path,
    ) -> LayerCacheResult<u64> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| LayerCacheError::io(format!("creating {}", parent.display()), e))?;
        }

        if self.is_staged(source) {
            move_file(source, dest).await?;
            debug!(source = %source.display(), dest = %dest.display(), "Moved staged layer");
        } else {
            let backend = self.backend(kind).await?;
            let digest = source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "layer".to_string());
            let partial = self.stage(backend.as_ref(), &digest, source).await?;
            if let Err(e) = move_file(&partial, dest).await {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            }
            debug!(source = %source.display(), dest = %dest.display(), "Archived layer to destination");
        }

        tokio::fs::metadata(dest)
            .await
            .map(|m| m.len())
            .map_err(|e| LayerCacheError::io(format!("reading {}", dest.display()), e))
    }

    fn is_staged(&self, source: &Path) -> bool {
        source.starts_with(&self.paths.staging_dir)
            || self.paths.staged_roots.iter().any(|r| source.starts_with(r))
    }

    /// Rescan on a fixed interval until stopped
    ///
    /// The first pass runs one interval from now; callers run
    /// `rescan_once` themselves at start-up.
    pub fn spawn(self: &Arc<Self>, interval: Duration) -> ScannerHandle {
        let scanner = Arc::clone(self);
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        if let Err(e) = scanner.rescan_once().await {
                            warn!("Rescan failed: {}", e);
                        }
                    }
                }
            }
            debug!("Rescan ticker stopped");
        });

        ScannerHandle {
            stop_tx: Some(stop_tx),
            task,
        }
    }
}

/// Rename `from` into place at `to`, removing `from` if the rename fails
async fn publish_file(from: &Path, to: &Path) -> LayerCacheResult<()> {
    if let Err(e) = tokio::fs::rename(from, to).await {
        let _ = tokio::fs::remove_file(from).await;
        return Err(LayerCacheError::io(
            format!("renaming {} to {}", from.display(), to.display()),
            e,
        ));
    }
    Ok(())
}

/// Rename, falling back to copy and delete across filesystems
async fn move_file(from: &Path, to: &Path) -> LayerCacheResult<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }

    let (src, dst) = (from.to_path_buf(), to.to_path_buf());
    tokio::task::spawn_blocking(move || copy_file(&src, &dst))
        .await
        .map_err(|e| LayerCacheError::Internal(format!("copy task: {e}")))?
        .map_err(|e| LayerCacheError::io(format!("copying {}", from.display()), e))?;

    tokio::fs::remove_file(from)
        .await
        .map_err(|e| LayerCacheError::io(format!("removing {}", from.display()), e))
}

/// Running rescan ticker
pub struct ScannerHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ScannerHandle {
    /// Stop the ticker and wait for the current pass to finish
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        let _ = self.task.await;
    }
}
