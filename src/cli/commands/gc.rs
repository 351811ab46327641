//! Gc command - run one retention pass

use crate::cli::args::GcArgs;
use crate::config::Config;
use crate::error::LayerCacheResult;
use crate::retention::{
    format_bytes, CollectionOutcome, CollectionReport, CollectionState, RetentionCollector,
    RetentionSettings,
};
use console::style;

/// Execute the gc command
pub async fn execute(args: GcArgs, config: &Config) -> LayerCacheResult<()> {
    let mut settings = RetentionSettings::from(config);
    if let Some(days) = args.days {
        settings.retain_days = days;
    }

    if settings.retain_days == 0 {
        println!("Retention is disabled (retain_days = 0)");
        return Ok(());
    }

    let collector = RetentionCollector::new(settings);
    match collector.run_pass(args.dry_run).await? {
        CollectionOutcome::AlreadyRunning => println!("A collection pass is already running."),
        CollectionOutcome::Completed(report) => print_report(&report, collector.settings().threshold_bytes),
    }

    Ok(())
}

fn print_report(report: &CollectionReport, threshold: u64) {
    match report.state {
        CollectionState::Disabled => {
            println!("Retention is disabled (retain_days = 0)");
            return;
        }
        CollectionState::BelowThreshold => {
            println!(
                "Storage at {} of {} threshold, nothing to collect.",
                format_bytes(report.before.total),
                format_bytes(threshold)
            );
            return;
        }
        CollectionState::Collected | CollectionState::StillOverThreshold => {}
    }

    if report.deleted.is_empty() {
        println!("No unreferenced layers found ({} digests retained).", report.retained);
    } else {
        let verb = if report.dry_run { "Would remove" } else { "Removed" };
        println!("{} {} layer file(s):", verb, report.deleted.len());
        for path in &report.deleted {
            println!("  {} {}", style("•").red(), path.display());
        }
    }

    println!();
    println!(
        "Freed {} ({} -> {})",
        format_bytes(report.freed_bytes),
        format_bytes(report.before.total),
        format_bytes(report.after.total)
    );

    if report.dry_run {
        println!("Dry run - no files removed.");
    } else if report.state == CollectionState::StillOverThreshold {
        println!(
            "{} Still over the {} threshold; deep clean is not implemented",
            style("!").yellow(),
            format_bytes(threshold)
        );
    }
}
