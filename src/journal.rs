//! Layer access journal
//!
//! Appends one JSON line per served request to a local file. A single
//! writer task owns the file and drains a bounded queue, so lines land in
//! the order they were recorded. A full queue blocks producers; events are
//! never dropped because the retention collector decides what to keep from
//! this file.

use crate::error::{LayerCacheError, LayerCacheResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    #[default]
    Normal,
    Warning,
}

/// One journal line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEvent {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub registry: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub event_type: EventType,
    #[serde(default)]
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl JournalEvent {
    fn new(request_id: &str, digest: &str, event_type: EventType, message: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            registry: String::new(),
            repo: String::new(),
            tag: String::new(),
            digest: digest.to_string(),
            size: 0,
            event_type,
            message: message.to_string(),
            created_at: Utc::now(),
        }
    }

    /// A served layer blob
    pub fn layer(request_id: &str, registry: &str, repo: &str, digest: &str, size: i64) -> Self {
        Self {
            registry: registry.to_string(),
            repo: repo.to_string(),
            size,
            ..Self::new(request_id, digest, EventType::Normal, "layer served")
        }
    }

    /// A served manifest
    pub fn manifest(request_id: &str, registry: &str, repo: &str, tag: &str, digest: &str) -> Self {
        Self {
            registry: registry.to_string(),
            repo: repo.to_string(),
            tag: tag.to_string(),
            ..Self::new(request_id, digest, EventType::Normal, "manifest served")
        }
    }

    /// A request that failed or degraded
    pub fn warning(request_id: &str, digest: &str, message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self::new(request_id, digest, EventType::Warning, &message)
    }

    /// Override the timestamp, e.g. when replaying history
    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// Append-only event journal with a single writer task
pub struct EventJournal {
    path: PathBuf,
    tx: Mutex<Option<mpsc::Sender<JournalEvent>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl EventJournal {
    /// Open (create or append to) the journal and start its writer
    ///
    /// Failing to open the file is the one start-up error that disables
    /// the cache as a whole.
    pub async fn open(path: impl Into<PathBuf>, capacity: usize) -> LayerCacheResult<Self> {
        let path = path.into();
        let open_err = |source| LayerCacheError::JournalOpen {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(open_err)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(open_err)?;

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let writer = tokio::spawn(write_loop(file, path.clone(), rx));

        info!(path = %path.display(), capacity, "Journal opened");
        Ok(Self {
            path,
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue an event, waiting for room if the queue is full
    pub async fn record(&self, event: JournalEvent) -> LayerCacheResult<()> {
        let tx = self
            .tx
            .lock()
            .await
            .clone()
            .ok_or(LayerCacheError::JournalClosed)?;

        tx.send(event)
            .await
            .map_err(|_| LayerCacheError::JournalClosed)
    }

    /// Close the queue, write everything pending and stop the writer
    pub async fn shutdown(&self) {
        drop(self.tx.lock().await.take());

        let writer = self.writer.lock().await.take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
    }
}

async fn write_loop(mut file: File, path: PathBuf, mut rx: mpsc::Receiver<JournalEvent>) {
    let mut written: u64 = 0;

    while let Some(event) = rx.recv().await {
        let mut line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                error!(digest = %event.digest, "Failed to serialize journal event: {}", e);
                continue;
            }
        };
        line.push('\n');

        let result = async {
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = result {
            error!(path = %path.display(), "Journal write failed, stopping writer: {}", e);
            return;
        }
        written += 1;
    }

    debug!(path = %path.display(), written, "Journal writer drained");
}

/// Read every well-formed event from a journal file
///
/// Malformed lines are skipped.
pub async fn read_events(path: &Path) -> LayerCacheResult<Vec<JournalEvent>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(LayerCacheError::JournalMissing(path.to_path_buf()))
        }
        Err(e) => return Err(LayerCacheError::io(format!("reading {}", path.display()), e)),
    };

    Ok(content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(event) => Some(event),
            Err(e) => {
                debug!("Skipping malformed journal line: {}", e);
                None
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn writes_json_lines_in_order() {
        let dir = TempDir::new().unwrap();
        let journal = EventJournal::open(dir.path().join("journal.log"), 8)
            .await
            .unwrap();

        journal
            .record(JournalEvent::layer("r1", "docker.io", "library/alpine", "aa11", 42))
            .await
            .unwrap();
        journal
            .record(JournalEvent::warning("r2", "bb22", "materialize failed"))
            .await
            .unwrap();
        journal.shutdown().await;

        let content = tokio::fs::read_to_string(journal.path()).await.unwrap();
        let lines: Vec<&str> = content.trim().lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["request_id"], "r1");
        assert_eq!(first["digest"], "aa11");
        assert_eq!(first["size"], 42);
        assert_eq!(first["event_type"], "normal");
        assert!(first["created_at"].is_string());

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["event_type"], "warning");
    }

    #[tokio::test]
    async fn reopen_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.log");

        for request in ["r1", "r2"] {
            let journal = EventJournal::open(&path, 4).await.unwrap();
            journal
                .record(JournalEvent::manifest(request, "ghcr.io", "org/app", "v1", "cc33"))
                .await
                .unwrap();
            journal.shutdown().await;
        }

        let events = read_events(&path).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].request_id, "r1");
        assert_eq!(events[1].tag, "v1");
    }

    #[tokio::test]
    async fn full_queue_blocks_without_dropping() {
        let dir = TempDir::new().unwrap();
        let journal = Arc::new(
            EventJournal::open(dir.path().join("journal.log"), 1)
                .await
                .unwrap(),
        );

        let producers: Vec<_> = (0..20)
            .map(|i| {
                let journal = journal.clone();
                tokio::spawn(async move {
                    journal
                        .record(JournalEvent::layer(&format!("r{i}"), "", "", "aa", i))
                        .await
                })
            })
            .collect();
        for producer in producers {
            producer.await.unwrap().unwrap();
        }
        journal.shutdown().await;

        assert_eq!(read_events(journal.path()).await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn record_after_shutdown_fails() {
        let dir = TempDir::new().unwrap();
        let journal = EventJournal::open(dir.path().join("journal.log"), 4)
            .await
            .unwrap();
        journal.shutdown().await;

        let err = journal
            .record(JournalEvent::warning("r", "aa", "late"))
            .await
            .unwrap_err();
        assert!(matches!(err, LayerCacheError::JournalClosed));
    }

    #[tokio::test]
    async fn open_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();

        let err = EventJournal::open(blocker.join("journal.log"), 4)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LayerCacheError::JournalOpen { .. }));
        assert!(err.hint().is_some());
    }

    #[tokio::test]
    async fn reader_skips_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.log");
        let good = serde_json::to_string(&JournalEvent::warning("r", "aa", "x")).unwrap();
        std::fs::write(&path, format!("{good}\nnot json\n\n{good}\n")).unwrap();

        assert_eq!(read_events(&path).await.unwrap().len(), 2);
        assert!(matches!(
            read_events(&dir.path().join("missing")).await.unwrap_err(),
            LayerCacheError::JournalMissing(_)
        ));
    }
}
