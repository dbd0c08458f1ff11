//! # Stream Stress - Main Entry Point
//!
//! Parses the command line, installs logging, and hands the validated
//! configuration to [`StressRunner`]. The process exits with code 1 when any
//! client session failed, and with code 2 when the hang watchdog fires.

use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;
use stream_stress::{cli::Args, defaults, logging, StressConfig, StressRunner, VERSION};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    logging::init(args.verbose);

    info!("Starting Stream Stress v{}", VERSION);
    let config = StressConfig::from_args(&args)?;
    info!("Configuration: {}", serde_json::to_string(&config)?);
    info!("Run seed: {} (pass -s {} to reproduce)", config.seed, config.seed);

    let summary = StressRunner::new(config).run().await?;

    if summary.failures > 0 {
        warn!(
            "{} of {} sessions failed",
            summary.failures, summary.total_sessions
        );
        return Ok(ExitCode::from(defaults::EXIT_FAILURES));
    }
    info!("Stream Stress completed: {} sessions", summary.total_sessions);
    Ok(ExitCode::SUCCESS)
}
