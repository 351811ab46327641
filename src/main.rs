//! layercache - distributed container image layer cache
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use layercache::cli::{commands, Cli, Commands};
use layercache::config::ConfigManager;
use layercache::error::LayerCacheResult;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> LayerCacheResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;

    // 0 = warn, 1 = info, 2+ = debug; the config can raise the floor to info
    let level = cli.verbose.max(u8::from(config.general.verbose));
    let filter = match level {
        0 => EnvFilter::new("layercache=warn"),
        1 => EnvFilter::new("layercache=info"),
        _ => EnvFilter::new("layercache=debug"),
    };

    if config.general.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .without_time()
            .init();
    }

    match cli.command {
        Commands::Serve => commands::serve(&config).await,
        Commands::Gc(args) => commands::gc(args, &config).await,
        Commands::Status(args) => commands::status(args, &config).await,
        Commands::Config(args) => commands::config(args, &config_manager, &config).await,
    }
}
