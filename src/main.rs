use std::{path::PathBuf, process::ExitCode};

use anyhow::Context;
use clap::Parser;
use review_load::{
    Config, LoadTest, Reporter,
    report::{JsonReporter, TextReporter},
    runner,
};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Exit code of a run whose thresholds did not hold.
const THRESHOLDS_FAILED: u8 = 99;

/// Staged load test and SLA check of the team / pull request reviewer service.
#[derive(Debug, Parser)]
#[command(name = "review-load", version, about)]
struct Cli {
    /// YAML load profile; built-in defaults apply when omitted
    #[arg(short, long, env = "REVIEW_LOAD_CONFIG")]
    config: Option<PathBuf>,

    /// Service base URL, takes precedence over BASE_URL and the config file
    #[arg(long)]
    base_url: Option<String>,

    /// Print the report as JSON on stdout
    #[arg(long)]
    json: bool,

    /// Seed for reproducible random choices
    #[arg(long)]
    seed: Option<u64>,

    /// Debug logging (RUST_LOG still wins when set)
    #[arg(short, long)]
    verbose: bool,

    /// Validate the configuration and print it without generating load
    #[arg(long)]
    check_config: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(url) = cli.base_url {
        config.base_url = url;
    }
    if cli.seed.is_some() {
        config.seed = cli.seed;
    }
    config.validate().context("validating configuration")?;

    if cli.check_config {
        let thresholds = runner::check_thresholds(&config)?;
        tracing::info!(thresholds, "configuration is valid");
        print!("{}", config.to_yaml()?);
        return Ok(ExitCode::SUCCESS);
    }

    tracing::info!(base_url = %config.base_url, "starting load test");
    let (interrupt_tx, interrupt_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::warn!("interrupted");
                interrupt_tx.send_replace(true);
            }
            Err(e) => tracing::warn!("cannot listen for interrupts: {e}"),
        }
    });
    let test = LoadTest::new(config)?.with_abort(interrupt_rx);
    let report = test.run().await?;

    if cli.json {
        JsonReporter.report(&report).await?;
    } else {
        TextReporter.report(&report).await?;
    }

    if report.verdict.passed {
        Ok(ExitCode::SUCCESS)
    } else {
        tracing::warn!("thresholds crossed");
        Ok(ExitCode::from(THRESHOLDS_FAILED))
    }
}
