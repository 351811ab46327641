//! Container runtime layer storage
//!
//! Backends read what the local runtimes already hold; the scanner keeps
//! their digest maps fresh and materializes archives on demand.

pub mod archive;
pub mod backend;
pub mod containerd;
pub mod docker;
pub mod scanner;

pub use backend::RuntimeBackend;
pub use containerd::ContainerdBackend;
pub use docker::DockerBackend;
pub use scanner::{RuntimeScanner, ScannerHandle, ScannerPaths};

use crate::config::schema::RuntimeConfig;
use std::sync::Arc;

/// Create every runtime backend named in the config
///
/// Disabled backends are still returned; they report themselves as
/// unavailable when probed.
pub fn create_backends(config: &RuntimeConfig) -> Vec<Arc<dyn RuntimeBackend>> {
    let docker: Arc<dyn RuntimeBackend> = Arc::new(DockerBackend::new(
        config.docker.enabled,
        config.docker.root.clone(),
    ));
    let containerd: Arc<dyn RuntimeBackend> = Arc::new(ContainerdBackend::new(
        config.containerd.enabled,
        config.containerd.root.clone(),
        config.containerd.verify_digests,
    ));
    vec![docker, containerd]
}
