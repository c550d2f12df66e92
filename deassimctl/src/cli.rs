use anyhow::Result;
use console::style;
use deassim::utils::{format_bytes, format_elapsed, format_rate};
use deassim::{spawn_status_reporter, status_channel, DeassimResult, ReplicationConfig, TreeWalker};
use deassim_protocol::{OutputFormat, RunSummary, VerificationReport};
use tracing::{debug, warn};

/// Run one replication, rendering the live status stream on stderr and
/// cancelling cleanly on Ctrl-C.
pub async fn replicate(config: &ReplicationConfig, show_status: bool) -> DeassimResult<RunSummary> {
    let mut walker = TreeWalker::new(config.clone());

    let reporter = if show_status {
        let (tx, rx) = status_channel(config.status_channel_capacity);
        walker = walker.with_status_events(tx);
        Some(spawn_status_reporter(rx, tokio::io::stderr()))
    } else {
        None
    };

    let handle = walker.handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
    });

    let result = walker.run().await;
    interrupt.abort();

    if let Some(reporter) = reporter {
        match reporter.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Status stream write failed: {}", e),
            Err(e) => debug!("Status reporter task ended abnormally: {}", e),
        }
    }

    result
}

pub fn print_summary(summary: &RunSummary, format: OutputFormat, totals: bool) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", summary.to_json()?);
        return Ok(());
    }

    let marker = if summary.interrupted {
        style("!").yellow()
    } else if summary.is_clean() {
        style("✓").green()
    } else {
        style("✗").red()
    };
    println!(
        "{} Replicated {} -> {} in {}{}",
        marker,
        style(summary.source_root.display()).cyan(),
        style(summary.target_root.display()).cyan(),
        format_elapsed(summary.elapsed_secs),
        if summary.interrupted { " (interrupted)" } else { "" }
    );

    let counters = &summary.counters;
    if counters.errors > 0 {
        println!("  {} {} entries failed, see the log for details", style("!").red(), counters.errors);
    }

    if totals {
        println!("  Run ID:            {}", summary.run_id);
        println!("  Workers:           {} (peak outstanding {})", summary.workers, summary.peak_outstanding);
        println!("  Directories:       {}", counters.directories);
        println!("  Files copied:      {}", counters.files_copied);
        println!(
            "  Bytes copied:      {} ({})",
            format_bytes(counters.bytes_copied),
            format_rate(counters.bytes_copied, summary.elapsed_secs)
        );
        println!("  Symlinks:          {}", counters.symlinks_created);
        println!("  Hardlinks:         {}", counters.hardlinks_created);
        println!("  Skipped:           {}", counters.skipped);
        println!("  Errors:            {}", counters.errors);
        println!("  Metadata failures: {}", counters.metadata_failures);
        println!(
            "  Jobs:              {} enqueued, {} deferred, {} completed",
            counters.enqueued, counters.saturated, counters.completed
        );
    }

    if !summary.directories.is_empty() {
        println!();
        println!("{}", style("Per-directory statistics").bold());
        for report in &summary.directories {
            let extensions = report
                .extension_counts
                .iter()
                .map(|(ext, count)| {
                    let ext = if ext.is_empty() { "(none)" } else { ext.as_str() };
                    format!("{}={}", ext, count)
                })
                .collect::<Vec<_>>()
                .join(" ");
            println!(
                "  {}  {} files, {}  {}",
                report.directory.display(),
                report.total_files,
                format_bytes(report.total_size_bytes),
                style(extensions).dim()
            );
        }
    }

    Ok(())
}

pub fn print_verification(report: &VerificationReport, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    if report.is_match() {
        println!("{} Verification passed ({} entries)", style("✓").green(), report.checked);
        return Ok(());
    }

    println!(
        "{} Verification found {} mismatches in {} entries",
        style("✗").red(),
        report.mismatches.len(),
        report.checked
    );
    for mismatch in &report.mismatches {
        println!("  {}  {}", mismatch.path.display(), style(&mismatch.kind).yellow());
    }
    Ok(())
}
