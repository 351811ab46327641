//! Error types for layercache
//!
//! All modules use `LayerCacheResult<T>` as their return type.

use crate::cache::LayerKind;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for layercache operations
pub type LayerCacheResult<T> = Result<T, LayerCacheError>;

/// All errors that can occur in layercache
#[derive(Error, Debug)]
pub enum LayerCacheError {
    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Invalid configuration: {0}")]
    ConfigValidation(String),

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // External store errors
    #[error("Store unavailable during {operation}: {reason}")]
    StoreUnavailable { operation: String, reason: String },

    #[error("Store rejected {operation}: {reason}")]
    StoreResponse { operation: String, reason: String },

    #[error("Corrupted record at key {key}: {reason}")]
    CorruptedRecord { key: String, reason: String },

    // Lock errors
    #[error("Timed out after {waited_ms}ms waiting for lock {key}")]
    LockTimeout { key: String, waited_ms: u64 },

    #[error("Lease on {key} lost by {owner_id}")]
    LockLost { key: String, owner_id: String },

    // Cache errors
    #[error("Invalid digest: {0:?}")]
    InvalidDigest(String),

    #[error("No live locator for digest {0}")]
    NoLocator(String),

    // Runtime backend errors
    #[error("Digest {digest} unknown to {kind} backend")]
    UnknownDigest { kind: LayerKind, digest: String },

    #[error("{0} backend is not available on this host")]
    BackendUnavailable(LayerKind),

    #[error("Failed to materialize {digest}: {reason}")]
    Materialize { digest: String, reason: String },

    #[error("Content of {digest} does not match, got sha256:{actual}")]
    DigestMismatch { digest: String, actual: String },

    // Journal errors
    #[error("Failed to open journal {path}: {source}")]
    JournalOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Journal writer has stopped")]
    JournalClosed,

    #[error("Journal not found: {0}")]
    JournalMissing(PathBuf),

    // Retention errors
    #[error("Failed to read storage root {path}: {reason}")]
    StorageRead { path: PathBuf, reason: String },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LayerCacheError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a store-unavailable error
    pub fn unavailable(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::StoreUnavailable {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a materialization error
    pub fn materialize(digest: impl Into<String>, reason: impl ToString) -> Self {
        Self::Materialize {
            digest: digest.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. } | Self::LockTimeout { .. })
    }

    /// Check if error means "nothing here" rather than an infrastructure failure
    ///
    /// Callers fall back (other backend, peer host, fresh download) on these.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::UnknownDigest { .. } | Self::NoLocator(_))
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::StoreUnavailable { .. } => Some("Check [store] endpoints and that the store is reachable"),
            Self::JournalOpen { .. } => Some("Check [journal] path and directory permissions"),
            Self::ConfigInvalid { .. } | Self::ConfigValidation(_) => {
                Some("Run: layercache config show")
            }
            Self::BackendUnavailable(_) => Some("Enable the backend under [runtime] or fix its root path"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = LayerCacheError::UnknownDigest {
            kind: LayerKind::Dockerd,
            digest: "abc123".to_string(),
        };
        assert_eq!(err.to_string(), "Digest abc123 unknown to DOCKERD backend");
    }

    #[test]
    fn error_hint() {
        let err = LayerCacheError::unavailable("scan", "connection refused");
        assert!(err.hint().is_some());
        assert_eq!(LayerCacheError::JournalClosed.hint(), None);
    }

    #[test]
    fn error_retryable() {
        assert!(LayerCacheError::unavailable("get", "timeout").is_retryable());
        assert!(!LayerCacheError::NoLocator("abc".to_string()).is_retryable());
    }

    #[test]
    fn error_not_found() {
        assert!(LayerCacheError::NoLocator("abc".to_string()).is_not_found());
        assert!(!LayerCacheError::JournalClosed.is_not_found());
    }
}
