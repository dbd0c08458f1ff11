//! # Run Orchestration
//!
//! [`StressRunner`] starts the echo server and/or the stress client according
//! to the configured [`RunMode`](crate::cli::RunMode), prints progress at the
//! display interval, and on shutdown joins everything, prints the final
//! report and optionally writes a JSON summary.
//!
//! All long-running tasks share one [`CancellationToken`]; shutdown is a
//! single `cancel()` followed by joining the task handles.

use crate::cli::StressConfig;
use crate::client::StressClient;
use crate::results::{ByteCounts, ErrorType, ResultAggregator};
use crate::segment::BufferPool;
use crate::server::{ServerSettings, StressServer};
use crate::transport::{dial_address, parse_endpoint};
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use colored::Colorize;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Final summary of a run, written as JSON when an output file is set
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub version: String,
    pub config: StressConfig,
    pub started_at: DateTime<Local>,
    pub elapsed: Duration,
    pub total_sessions: u64,
    pub successes: u64,
    pub cancellations: u64,
    pub failures: u64,
    pub bytes: ByteCounts,
    pub failure_types: Vec<ErrorType>,
}

/// Runs one stress test from start to final report
pub struct StressRunner {
    config: Arc<StressConfig>,
}

impl StressRunner {
    pub fn new(config: StressConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &StressConfig {
        &self.config
    }

    /// Run until Ctrl-C or the configured max execution time
    pub async fn run(&self) -> Result<RunSummary> {
        let max_execution_time = self.config.max_execution_time;
        let shutdown = async move {
            let deadline = async {
                match max_execution_time {
                    Some(limit) => sleep(limit).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                res = tokio::signal::ctrl_c() => match res {
                    Ok(()) => info!("Received Ctrl-C, shutting down"),
                    Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
                },
                _ = deadline => info!("Max execution time reached, shutting down"),
            }
        };
        self.run_until(shutdown).await
    }

    /// Run until `shutdown` resolves
    pub async fn run_until<F>(&self, shutdown: F) -> Result<RunSummary>
    where
        F: Future<Output = ()>,
    {
        let config = &self.config;
        let started_at = Local::now();
        let started = Instant::now();
        let token = CancellationToken::new();

        let endpoint = parse_endpoint(&config.server_endpoint)
            .with_context(|| format!("Invalid server endpoint '{}'", config.server_endpoint))?;

        let server_workers = if config.mode.runs_server() {
            2 * config.num_connections
        } else {
            0
        };
        let client_workers = if config.mode.runs_client() {
            config.num_connections
        } else {
            0
        };
        let pool = BufferPool::for_workers(server_workers + client_workers, config.max_buffer_length);
        let aggregator = Arc::new(ResultAggregator::new(client_workers));
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        let mut dial = dial_address(endpoint);
        if config.mode.runs_server() {
            let settings = ServerSettings {
                limits: config.session_limits(),
                max_buffer_length: config.max_buffer_length,
                log_errors: config.log_server,
            };
            let server = StressServer::bind(endpoint, Arc::clone(&pool), settings, server_workers)
                .await
                .with_context(|| format!("Failed to start server on {}", endpoint))?;
            dial = dial_address(server.local_addr()?);
            tasks.push(tokio::spawn(server.run(token.clone())));
        }

        if config.mode.runs_client() {
            let client = StressClient::new(
                Arc::clone(config),
                dial,
                Arc::clone(&aggregator),
                Arc::clone(&pool),
            );
            tasks.push(tokio::spawn(client.run(token.clone())));
            tasks.push(tokio::spawn(print_stats(
                Arc::clone(&aggregator),
                started,
                config.display_interval,
                token.clone(),
            )));
        }

        shutdown.await;
        token.cancel();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Task failed during shutdown: {}", e);
            }
        }
        let elapsed = started.elapsed();
        debug!("All tasks joined after {:?}", elapsed);

        if config.mode.runs_client() {
            println!("{}\n", "Stress Run Final Report".magenta());
            aggregator.print_current_results(elapsed, true);
            aggregator.print_failure_types();
        }

        let snapshot = aggregator.snapshot();
        let summary = RunSummary {
            version: crate::VERSION.to_string(),
            config: (**config).clone(),
            started_at,
            elapsed,
            total_sessions: aggregator.total_sessions(),
            successes: snapshot.successes(),
            cancellations: snapshot.cancellations(),
            failures: snapshot.failures(),
            bytes: snapshot.total(),
            failure_types: aggregator.errors().error_types(),
        };

        if let Some(path) = &config.output_file {
            let json = serde_json::to_string_pretty(&summary)?;
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write summary to {:?}", path))?;
            info!("Summary written to {:?}", path);
        }

        Ok(summary)
    }
}

async fn print_stats(
    aggregator: Arc<ResultAggregator>,
    started: Instant,
    interval: Duration,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = sleep(interval) => aggregator.print_current_results(started.elapsed(), false),
        }
    }
}
