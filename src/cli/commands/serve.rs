//! Serve command - run a cache node until interrupted

use crate::config::Config;
use crate::error::{LayerCacheError, LayerCacheResult};
use crate::node::CacheNode;
use console::style;

/// Execute the serve command
pub async fn execute(config: &Config) -> LayerCacheResult<()> {
    let node = CacheNode::start(config.clone()).await?;

    let runtimes = node.scanner().available_kinds().await;
    println!(
        "{} Cache node {} serving ({} runtime backend(s))",
        style("✓").green(),
        style(&config.node.host).cyan(),
        runtimes.len()
    );
    println!("  Press Ctrl-C to stop");

    let signal = tokio::signal::ctrl_c().await;
    let shutdown = node.shutdown().await;

    signal.map_err(|e| LayerCacheError::io("waiting for Ctrl-C", e))?;
    shutdown?;
    println!("{} Stopped", style("✓").green());
    Ok(())
}
