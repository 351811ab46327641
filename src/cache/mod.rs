//! Distributed layer locator cache
//!
//! Maps a content digest, the host holding it and the backend kind to a
//! locator payload. Entries live in the shared store with a TTL.
//!
//! # Key Layout
//!
//! | Key | Value | TTL |
//! |-----|-------|-----|
//! | `{digest}/{host}/{kind}` | local path or opaque blob | 180s |
//! | `lock:{digest}` | lease record (see `lock`) | none |

pub mod locator;
pub mod store;

pub use locator::{
    cache_key, is_hex_digest, normalize_digest, parse_cache_key, prefer_host, LayerKind,
    LayerLocator,
};
pub use store::{CacheStore, QueryRetry, DEFAULT_LOCATOR_TTL};
