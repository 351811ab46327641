//! Status command - runtime backends, storage usage and journal state

use crate::cli::args::{OutputFormat, StatusArgs};
use crate::config::Config;
use crate::error::LayerCacheResult;
use crate::retention::{format_bytes, gb_to_bytes, measure, StorageUsage, UsageStatus};
use crate::runtime::create_backends;
use console::{style, Emoji};
use futures_util::future::join_all;

static CHECK: Emoji<'_, '_> = Emoji("✓ ", "[OK] ");
static CROSS: Emoji<'_, '_> = Emoji("✗ ", "[FAIL] ");
static WARN: Emoji<'_, '_> = Emoji("⚠ ", "[WARN] ");

/// Execute the status command
pub async fn execute(args: StatusArgs, config: &Config) -> LayerCacheResult<()> {
    let backends = create_backends(&config.runtime);
    let probes = join_all(backends.iter().map(|b| b.probe())).await;
    let runtimes: Vec<(&'static str, bool)> = backends
        .iter()
        .map(|b| b.runtime_name())
        .zip(probes)
        .collect();

    let usage = measure(&config.storage.roots()).await;
    let threshold = gb_to_bytes(config.retention.threshold_gb);
    let journal_size = tokio::fs::metadata(&config.journal.path)
        .await
        .ok()
        .map(|m| m.len());

    match args.format {
        OutputFormat::Json => {
            let status = serde_json::json!({
                "host": config.node.host,
                "store": config.store.backend,
                "runtimes": runtimes
                    .iter()
                    .map(|(name, up)| serde_json::json!({"name": name, "available": up}))
                    .collect::<Vec<_>>(),
                "storage": usage.as_ref().ok().map(|u| serde_json::json!({
                    "total_bytes": u.total,
                    "threshold_bytes": threshold,
                    "roots": u.per_root.iter().map(|(path, size)| serde_json::json!({
                        "path": path,
                        "bytes": size,
                    })).collect::<Vec<_>>(),
                })),
                "journal": {
                    "path": config.journal.path,
                    "bytes": journal_size,
                },
                "retain_days": config.retention.retain_days,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        OutputFormat::Text => {
            print_text(config, &runtimes, usage.as_ref().ok(), threshold, journal_size);
            if let Err(e) = &usage {
                println!("  {} {}", CROSS, e);
            }
        }
    }

    Ok(())
}

fn print_text(
    config: &Config,
    runtimes: &[(&'static str, bool)],
    usage: Option<&StorageUsage>,
    threshold: u64,
    journal_size: Option<u64>,
) {
    println!("{}", style("layercache status").bold().cyan());
    println!();
    println!("{}", style("Node:").bold());
    println!("  Host:  {}", config.node.host);
    println!("  Store: {:?}", config.store.backend);

    println!();
    println!("{}", style("Runtime backends:").bold());
    for (name, up) in runtimes {
        if *up {
            println!("  {}{}", CHECK, name);
        } else {
            println!("  {}{} {}", CROSS, name, style("(unavailable)").dim());
        }
    }

    println!();
    println!("{}", style("Storage:").bold());
    if let Some(usage) = usage {
        for (path, size) in &usage.per_root {
            println!("  {:>10}  {}", format_bytes(*size), path.display());
        }
        let percent = UsageStatus::percentage(usage.total, threshold);
        let line = format!(
            "{} of {} ({:.0}%)",
            format_bytes(usage.total),
            format_bytes(threshold),
            percent
        );
        match UsageStatus::from_usage(usage.total, threshold) {
            UsageStatus::Ok => println!("  {}{}", CHECK, line),
            UsageStatus::Warning => println!("  {}{}", WARN, style(line).yellow()),
            UsageStatus::Exceeded => println!("  {}{}", CROSS, style(line).red()),
        }
    }

    println!();
    println!("{}", style("Journal:").bold());
    match journal_size {
        Some(size) => println!(
            "  {}{} ({})",
            CHECK,
            config.journal.path.display(),
            format_bytes(size)
        ),
        None => println!(
            "  {}{} {}",
            WARN,
            config.journal.path.display(),
            style("(not created yet)").dim()
        ),
    }

    if config.retention.retain_days == 0 {
        println!("  Retention disabled (retain_days = 0)");
    } else {
        println!("  Retention window: {} days", config.retention.retain_days);
    }
}
