//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// layercache - distributed image layer cache
///
/// Indexes the layers local container runtimes already hold, shares them
/// across proxy replicas, and prunes unreferenced layer files.
#[derive(Parser, Debug)]
#[command(name = "layercache")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "LAYERCACHE_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a cache node until interrupted
    Serve,

    /// Run one retention pass over the storage roots
    Gc(GcArgs),

    /// Show runtime backends, storage usage and journal state
    Status(StatusArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),
}

/// Arguments for the gc command
#[derive(Parser, Debug)]
pub struct GcArgs {
    /// Retention window in days (default: from config)
    #[arg(long)]
    pub days: Option<u32>,

    /// Dry run - show what would be removed
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for the status command
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Output format
    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Write the default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Output format for status
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON output
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_serve() {
        let cli = Cli::parse_from(["layercache", "serve"]);
        assert!(matches!(cli.command, Commands::Serve));
    }

    #[test]
    fn cli_parses_gc_flags() {
        let cli = Cli::parse_from(["layercache", "gc", "--dry-run", "--days", "3"]);
        match cli.command {
            Commands::Gc(args) => {
                assert!(args.dry_run);
                assert_eq!(args.days, Some(3));
            }
            _ => panic!("expected Gc command"),
        }
    }

    #[test]
    fn cli_parses_status_format() {
        let cli = Cli::parse_from(["layercache", "status", "--format", "json"]);
        match cli.command {
            Commands::Status(args) => assert_eq!(args.format, OutputFormat::Json),
            _ => panic!("expected Status command"),
        }
    }

    #[test]
    fn cli_parses_config_path() {
        let cli = Cli::parse_from(["layercache", "config", "path"]);
        match cli.command {
            Commands::Config(args) => assert!(matches!(args.action, Some(ConfigAction::Path))),
            _ => panic!("expected Config command"),
        }
    }

    #[test]
    fn cli_global_flags() {
        let cli = Cli::parse_from(["layercache", "-vv", "--config", "/tmp/c.toml", "status"]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
    }
}
