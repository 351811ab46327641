//! Retention collector
//!
//! A pass measures the managed storage roots and, only when they are over
//! the byte threshold, replays the access journal to find the digests
//! still inside the retention window and deletes every other layer file.
//!
//! ```text
//! Idle -> Measuring -> below threshold -> Idle
//!                   -> over threshold  -> Collecting -> Idle
//! ```
//!
//! Passes are single-flight within a process. Each replica only prunes its
//! own disk, so no cross-host coordination is needed.

pub mod usage;

pub use usage::{format_bytes, gb_to_bytes, measure, StorageUsage, UsageStatus};

use crate::cache::{is_hex_digest, normalize_digest};
use crate::config::Config;
use crate::error::{LayerCacheError, LayerCacheResult};
use crate::journal::JournalEvent;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Inputs of a collection pass
#[derive(Debug, Clone)]
pub struct RetentionSettings {
    /// Days a journal reference keeps a layer; 0 disables collection
    pub retain_days: u32,
    pub threshold_bytes: u64,
    pub batch_lines: usize,
    pub roots: Vec<PathBuf>,
    pub journal_path: PathBuf,
}

impl From<&Config> for RetentionSettings {
    fn from(config: &Config) -> Self {
        Self {
            retain_days: config.retention.retain_days,
            threshold_bytes: gb_to_bytes(config.retention.threshold_gb),
            batch_lines: config.retention.batch_lines,
            roots: config.storage.roots(),
            journal_path: config.journal.path.clone(),
        }
    }
}

/// How a completed pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionState {
    /// `retain_days` is 0
    Disabled,
    /// Usage at or under the threshold, nothing examined
    BelowThreshold,
    /// Unreferenced layers removed, usage back under the threshold
    Collected,
    /// Still over the threshold after removing unreferenced layers
    StillOverThreshold,
}

#[derive(Debug, Clone)]
pub struct CollectionReport {
    pub state: CollectionState,
    pub before: StorageUsage,
    pub after: StorageUsage,
    /// Files removed, or that would be removed on a dry run
    pub deleted: Vec<PathBuf>,
    pub freed_bytes: u64,
    /// Size of the retained digest set
    pub retained: usize,
    pub dry_run: bool,
}

impl CollectionReport {
    fn skipped(state: CollectionState, usage: StorageUsage, dry_run: bool) -> Self {
        Self {
            state,
            before: usage.clone(),
            after: usage,
            deleted: Vec::new(),
            freed_bytes: 0,
            retained: 0,
            dry_run,
        }
    }
}

#[derive(Debug, Clone)]
pub enum CollectionOutcome {
    Completed(CollectionReport),
    /// Another pass was in progress; nothing was done
    AlreadyRunning,
}

pub struct RetentionCollector {
    settings: RetentionSettings,
    running: AtomicBool,
}

/// Clears the running flag when a pass ends, however it ends
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RetentionCollector {
    pub fn new(settings: RetentionSettings) -> Self {
        Self {
            settings,
            running: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &RetentionSettings {
        &self.settings
    }

    /// Run one pass unless another is already running
    pub async fn run_pass(&self, dry_run: bool) -> LayerCacheResult<CollectionOutcome> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Collection pass already running");
            return Ok(CollectionOutcome::AlreadyRunning);
        }
        let _guard = PassGuard(&self.running);

        self.collect(dry_run).await.map(CollectionOutcome::Completed)
    }

    async fn collect(&self, dry_run: bool) -> LayerCacheResult<CollectionReport> {
        let settings = &self.settings;
        if settings.retain_days == 0 {
            debug!("Retention disabled (retain_days = 0)");
            return Ok(CollectionReport::skipped(
                CollectionState::Disabled,
                StorageUsage::default(),
                dry_run,
            ));
        }

        let before = measure(&settings.roots).await?;
        if before.total <= settings.threshold_bytes {
            debug!(
                total = %format_bytes(before.total),
                threshold = %format_bytes(settings.threshold_bytes),
                "Storage under threshold"
            );
            return Ok(CollectionReport::skipped(
                CollectionState::BelowThreshold,
                before,
                dry_run,
            ));
        }

        info!(
            total = %format_bytes(before.total),
            threshold = %format_bytes(settings.threshold_bytes),
            "Storage over threshold, collecting"
        );

        let window_start = window_start(Utc::now(), settings.retain_days);
        let retained =
            retained_digests(&settings.journal_path, window_start, settings.batch_lines).await?;

        let mut deleted = Vec::new();
        let mut freed_bytes = 0;
        for root in &settings.roots {
            for (path, size) in eviction_candidates(root, &retained).await? {
                if !dry_run {
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        warn!(path = %path.display(), "Failed to delete layer: {}", e);
                        continue;
                    }
                }
                debug!(path = %path.display(), dry_run, "Evicted layer");
                freed_bytes += size;
                deleted.push(path);
            }
        }

        let after = if dry_run {
            before.clone()
        } else {
            measure(&settings.roots).await?
        };

        let state = if after.total > settings.threshold_bytes && !dry_run {
            warn!(
                total = %format_bytes(after.total),
                threshold = %format_bytes(settings.threshold_bytes),
                "Still over threshold after collection; deep clean is not implemented"
            );
            CollectionState::StillOverThreshold
        } else {
            CollectionState::Collected
        };

        info!(
            deleted = deleted.len(),
            freed = %format_bytes(freed_bytes),
            retained = retained.len(),
            dry_run,
            "Collection pass finished"
        );

        Ok(CollectionReport {
            state,
            before,
            after,
            deleted,
            freed_bytes,
            retained: retained.len(),
            dry_run,
        })
    }

    /// Run passes on a fixed schedule until stopped
    ///
    /// Stopping never interrupts a pass in progress; it only prevents the
    /// next one.
    pub fn spawn(self: &Arc<Self>, interval: Duration) -> CollectorHandle {
        let collector = Arc::clone(self);
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick is immediate; start counting from now instead
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        if let Err(e) = collector.run_pass(false).await {
                            error!("Collection pass aborted: {}", e);
                        }
                    }
                }
            }
            debug!("Collection schedule stopped");
        });

        CollectorHandle {
            stop_tx: Some(stop_tx),
            task,
        }
    }
}

/// Running collection schedule
pub struct CollectorHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl CollectorHandle {
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        let _ = self.task.await;
    }
}

/// Start of the retention window ending at `now`
///
/// A window reaching past the earliest representable time retains everything.
pub fn window_start(now: DateTime<Utc>, retain_days: u32) -> DateTime<Utc> {
    chrono::Duration::try_days(i64::from(retain_days))
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Digests referenced at or after `window_start`
///
/// The journal is read forward in batches of `batch_lines`. The first event
/// inside the window marks the boundary; every digest from there to the end
/// of the file is retained.
pub async fn retained_digests(
    journal: &Path,
    window_start: DateTime<Utc>,
    batch_lines: usize,
) -> LayerCacheResult<HashSet<String>> {
    let file = match tokio::fs::File::open(journal).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(LayerCacheError::JournalMissing(journal.to_path_buf()))
        }
        Err(e) => return Err(LayerCacheError::io(format!("opening {}", journal.display()), e)),
    };

    let read_err = |e| LayerCacheError::io(format!("reading {}", journal.display()), e);
    let mut lines = BufReader::new(file).lines();
    let mut batch = Vec::with_capacity(batch_lines.max(1));
    let mut retained = HashSet::new();
    let mut boundary: Option<usize> = None;
    let mut line_no = 0;

    loop {
        batch.clear();
        while batch.len() < batch_lines.max(1) {
            match lines.next_line().await.map_err(read_err)? {
                Some(line) => batch.push(line),
                None => break,
            }
        }
        if batch.is_empty() {
            break;
        }

        for line in &batch {
            line_no += 1;
            let Ok(event) = serde_json::from_str::<JournalEvent>(line) else {
                continue;
            };
            if boundary.is_none() && event.created_at >= window_start {
                boundary = Some(line_no);
            }
            if boundary.is_some() {
                if let Ok(digest) = normalize_digest(&event.digest) {
                    retained.insert(digest);
                }
            }
        }
        debug!(lines = line_no, boundary = ?boundary, "Scanned journal batch");
    }

    Ok(retained)
}

/// Layer files directly under `root` whose digest is not retained
async fn eviction_candidates(
    root: &Path,
    retained: &HashSet<String>,
) -> LayerCacheResult<Vec<(PathBuf, u64)>> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(LayerCacheError::StorageRead {
                path: root.to_path_buf(),
                reason: e.to_string(),
            })
        }
    };

    let mut candidates = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| LayerCacheError::StorageRead {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?
    {
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }

        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(digest) = layer_digest(&name) else {
            continue;
        };
        if !retained.contains(&digest) {
            candidates.push((entry.path(), metadata.len()));
        }
    }
    Ok(candidates)
}

/// Digest named by a layer file, `{digest}.tar.gzip` and the like
fn layer_digest(file_name: &str) -> Option<String> {
    let stem = file_name.split('.').next()?;
    is_hex_digest(stem).then(|| stem.to_ascii_lowercase())
}
