//! Storage measurement

use crate::error::{LayerCacheError, LayerCacheResult};
use crate::runtime::archive::dir_size;
use std::path::{Path, PathBuf};

/// Format bytes as human-readable size (e.g., "1.5 GB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    match bytes {
        b if b >= GB => format!("{:.1} GB", b as f64 / GB as f64),
        b if b >= MB => format!("{:.1} MB", b as f64 / MB as f64),
        b if b >= KB => format!("{:.1} KB", b as f64 / KB as f64),
        b => format!("{} B", b),
    }
}

/// Convert GB to bytes
pub fn gb_to_bytes(gb: u32) -> u64 {
    u64::from(gb) * 1024 * 1024 * 1024
}

/// Storage usage relative to the collection threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageStatus {
    /// Under 80% of the threshold
    Ok,
    /// Between 80% and 100%
    Warning,
    /// Over the threshold; the next pass collects
    Exceeded,
}

impl UsageStatus {
    pub fn from_usage(current_bytes: u64, threshold_bytes: u64) -> Self {
        if current_bytes > threshold_bytes {
            Self::Exceeded
        } else if Self::percentage(current_bytes, threshold_bytes) >= 80.0 {
            Self::Warning
        } else {
            Self::Ok
        }
    }

    /// Get percentage of the threshold used
    pub fn percentage(current_bytes: u64, threshold_bytes: u64) -> f64 {
        if threshold_bytes == 0 {
            return 0.0;
        }
        (current_bytes as f64 / threshold_bytes as f64) * 100.0
    }
}

/// Size of every managed root at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageUsage {
    pub per_root: Vec<(PathBuf, u64)>,
    pub total: u64,
}

/// Measure every root; a missing root counts as empty
///
/// Any other read failure is fatal for the caller's pass.
pub async fn measure(roots: &[PathBuf]) -> LayerCacheResult<StorageUsage> {
    let roots = roots.to_vec();
    tokio::task::spawn_blocking(move || {
        let mut usage = StorageUsage::default();
        for root in roots {
            let size = root_size(&root)?;
            usage.total += size;
            usage.per_root.push((root, size));
        }
        Ok(usage)
    })
    .await
    .map_err(|e| LayerCacheError::Internal(format!("measure task: {e}")))?
}

fn root_size(root: &Path) -> LayerCacheResult<u64> {
    match std::fs::symlink_metadata(root) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(LayerCacheError::StorageRead {
                path: root.to_path_buf(),
                reason: e.to_string(),
            })
        }
        Ok(_) => {}
    }

    dir_size(root).map_err(|e| LayerCacheError::StorageRead {
        path: root.to_path_buf(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(gb_to_bytes(2)), "2.0 GB");
    }

    #[test]
    fn status_thresholds() {
        assert_eq!(UsageStatus::from_usage(10, 100), UsageStatus::Ok);
        assert_eq!(UsageStatus::from_usage(85, 100), UsageStatus::Warning);
        assert_eq!(UsageStatus::from_usage(100, 100), UsageStatus::Warning);
        assert_eq!(UsageStatus::from_usage(101, 100), UsageStatus::Exceeded);
        assert_eq!(UsageStatus::percentage(50, 0), 0.0);
    }

    #[tokio::test]
    async fn measure_sums_roots_and_ignores_missing() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        std::fs::create_dir(&a).unwrap();
        std::fs::write(a.join("x.tar.gzip"), vec![0u8; 100]).unwrap();
        std::fs::create_dir(a.join(".staging")).unwrap();
        std::fs::write(a.join(".staging/y.partial"), vec![0u8; 20]).unwrap();

        let usage = measure(&[a.clone(), dir.path().join("missing")]).await.unwrap();
        assert_eq!(usage.total, 120);
        assert_eq!(usage.per_root[0], (a, 120));
        assert_eq!(usage.per_root[1].1, 0);
    }
}
