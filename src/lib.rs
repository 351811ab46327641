//! layercache - distributed container image layer cache
//!
//! Indexes the layers local container runtimes already hold, shares their
//! locations across proxy replicas through a TTL'd key/value store,
//! serializes layer production with lease locks, journals every access and
//! prunes layer files nobody has asked for recently.

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod journal;
pub mod lock;
pub mod node;
pub mod resolver;
pub mod retention;
pub mod runtime;
pub mod store;

pub use error::{LayerCacheError, LayerCacheResult};
