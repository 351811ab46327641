//! Layer locators and the cache key format
//!
//! Keys are `{digest}/{host}/{kind}`, so one digest can be served by many
//! hosts and many kinds at once, and a digest prefix scan finds them all.

use crate::error::{LayerCacheError, LayerCacheResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which backend produced (and serves) a locator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LayerKind {
    /// Docker overlay2 layer store
    Dockerd,
    /// Containerd content store
    Containerd,
    /// Torrent metadata, payload is an opaque encoded descriptor
    Torrent,
    /// Archive already sitting in a serving directory
    Static,
}

impl LayerKind {
    /// Wire name used in cache keys
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dockerd => "DOCKERD",
            Self::Containerd => "CONTAINERD",
            Self::Torrent => "TORRENT",
            Self::Static => "STATIC",
        }
    }

    /// Kinds backed by a local container runtime
    pub fn runtimes() -> &'static [Self] {
        &[Self::Dockerd, Self::Containerd]
    }

    pub fn all() -> &'static [Self] {
        &[Self::Dockerd, Self::Containerd, Self::Torrent, Self::Static]
    }

    /// Whether the payload is a filesystem path on the owning host
    pub fn payload_is_path(&self) -> bool {
        !matches!(self, Self::Torrent)
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LayerKind {
    type Err = LayerCacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DOCKERD" => Ok(Self::Dockerd),
            "CONTAINERD" => Ok(Self::Containerd),
            "TORRENT" => Ok(Self::Torrent),
            "STATIC" => Ok(Self::Static),
            other => Err(LayerCacheError::Internal(format!("unknown layer kind {other:?}"))),
        }
    }
}

/// Where one host keeps one digest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerLocator {
    /// Normalized digest (hex, no algorithm prefix)
    pub digest: String,
    pub kind: LayerKind,
    /// Address of the replica owning this locator
    pub host: String,
    /// Local path for runtime/static kinds, opaque blob for torrents
    pub payload: String,
}

impl LayerLocator {
    /// Store key for this locator
    pub fn key(&self) -> String {
        cache_key(&self.digest, &self.host, self.kind)
    }

    /// Whether this locator lives on the given host
    pub fn is_local(&self, host: &str) -> bool {
        self.host == host
    }

    /// Rebuild a locator from a stored key and its value
    pub fn from_entry(key: &str, payload: &str) -> Option<Self> {
        let (digest, host, kind) = parse_cache_key(key)?;
        Some(Self {
            digest: digest.to_string(),
            kind,
            host: host.to_string(),
            payload: payload.to_string(),
        })
    }
}

/// Strip any `algo:` prefix and lower-case a digest
///
/// `sha256:ABC123` and `abc123` name the same layer.
pub fn normalize_digest(digest: &str) -> LayerCacheResult<String> {
    let hex = digest
        .rsplit_once(':')
        .map_or(digest, |(_, hex)| hex)
        .trim()
        .to_ascii_lowercase();

    if hex.is_empty() || hex.contains('/') || hex.contains(char::is_whitespace) {
        return Err(LayerCacheError::InvalidDigest(digest.to_string()));
    }
    Ok(hex)
}

/// Whether a string looks like a normalized hex digest
pub fn is_hex_digest(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Cache key for a locator
pub fn cache_key(digest: &str, host: &str, kind: LayerKind) -> String {
    format!("{}/{}/{}", digest, host, kind)
}

/// Prefix matching every locator of a digest
pub fn digest_prefix(digest: &str) -> String {
    format!("{}/", digest)
}

/// Split a cache key into digest, host and kind
///
/// Keys that are not locators (e.g. lock records) yield `None`.
pub fn parse_cache_key(key: &str) -> Option<(&str, &str, LayerKind)> {
    let (digest, rest) = key.split_once('/')?;
    let (host, kind) = rest.rsplit_once('/')?;
    if digest.is_empty() || host.is_empty() {
        return None;
    }
    Some((digest, host, kind.parse().ok()?))
}

/// Order locators so the given host comes first, keeping the rest stable
pub fn prefer_host(mut locators: Vec<LayerLocator>, host: &str) -> Vec<LayerLocator> {
    locators.sort_by_key(|l| !l.is_local(host));
    locators
}
