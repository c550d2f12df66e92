use anyhow::{Context, Result};
use clap::Parser;
use console::style;
use deassim::{error_context, DeassimError, ReplicationConfig};
use deassim_protocol::OutputFormat;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "deassimctl")]
struct Cli {
    /// Mounted share to replicate from (overrides the config file)
    source: Option<PathBuf>,

    /// Mounted volume to replicate onto (overrides the config file)
    target: Option<PathBuf>,

    /// Configuration file (defaults to $DEASSIM_CONFIG_PATH or /etc/deassim/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Maximum number of directory jobs queued or in flight
    #[arg(short = 'j', long, visible_alias = "numjobs")]
    workers: Option<usize>,

    /// Process everything with one worker, for diagnosis
    #[arg(long)]
    single_worker: bool,

    /// Collect and print per-directory statistics
    #[arg(long)]
    statistics: bool,

    /// Print run totals at the end
    #[arg(long)]
    totals: bool,

    /// Compare sizes of both trees after the replication
    #[arg(long)]
    verify: bool,

    /// Copy block size in bytes
    #[arg(long)]
    block_size: Option<usize>,

    /// Do not print the live status stream
    #[arg(short, long)]
    quiet: bool,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,

    /// Log filter, e.g. "info" or "deassim=debug" (RUST_LOG takes precedence)
    #[arg(long, default_value = "warn")]
    log: String,
}

impl Cli {
    fn apply(&self, config: &mut ReplicationConfig) {
        if let Some(source) = &self.source {
            config.source_root = source.clone();
        }
        if let Some(target) = &self.target {
            config.target_root = target.clone();
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(block_size) = self.block_size {
            config.block_size = block_size;
        }
        config.single_worker |= self.single_worker;
        config.statistics |= self.statistics;
        config.totals |= self.totals;
        config.verify |= self.verify;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing; stdout is reserved for the summary.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", style("error:").red().bold(), e);
            match e.downcast_ref::<DeassimError>() {
                Some(err) => {
                    eprintln!("{} {}", style("hint:").yellow(), err.suggested_action());
                    err.exit_code().max(1)
                }
                None => 1,
            }
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<i32> {
    let mut config = ReplicationConfig::load(cli.config.as_deref())
        .await
        .context("Failed to load configuration")?;
    cli.apply(&mut config);

    let source_root = config.source_root.clone();
    let summary = match cli::replicate(&config, !cli.quiet).await {
        Ok(summary) => summary,
        Err(e) => return Err(error_context!("replicate", path = source_root).build(e)),
    };
    cli::print_summary(&summary, cli.format, config.totals)?;

    if config.verify && !summary.interrupted {
        let report = deassim::VerificationComparator::compare(&config.source_root, &config.target_root)
            .await
            .map_err(|e| {
                error_context!("verify", run_id = summary.run_id.to_string())
                    .with_path(&config.target_root)
                    .build(e)
            })?;
        cli::print_verification(&report, cli.format)?;
        if !report.is_match() {
            return Ok(2);
        }
    }

    Ok(if summary.interrupted { 130 } else { 0 })
}
