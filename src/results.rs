//! Result aggregation and reporting.
//!
//! [`ResultAggregator`] holds per-worker session outcomes and byte counters.
//! Outcome counters are bumped with atomics on the hot path. The
//! per-worker byte totals sit behind one lock that is taken only when a
//! finished session's counters are folded in, or when a snapshot is copied,
//! so reports always see a coherent cross-worker view.
//!
//! Failures are also classified by [`ErrorAggregator`] for the final report.

use crate::error::StressError;
use crate::utils::{format_bytes, format_elapsed};
use chrono::{DateTime, Local};
use colored::Colorize;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Live byte counters for the session a worker is currently running
#[derive(Debug, Default)]
pub struct StreamCounter {
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
}

impl StreamCounter {
    pub fn add_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn load(&self) -> ByteCounts {
        ByteCounts {
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
        }
    }

    /// Read and reset both counters
    fn take(&self) -> ByteCounts {
        ByteCounts {
            bytes_written: self.bytes_written.swap(0, Ordering::Relaxed),
            bytes_read: self.bytes_read.swap(0, Ordering::Relaxed),
        }
    }
}

/// Plain byte counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ByteCounts {
    pub bytes_written: u64,
    pub bytes_read: u64,
}

impl ByteCounts {
    pub fn plus(self, other: ByteCounts) -> ByteCounts {
        ByteCounts {
            bytes_written: self.bytes_written + other.bytes_written,
            bytes_read: self.bytes_read + other.bytes_read,
        }
    }
}

#[derive(Debug, Default)]
struct OutcomeCounters {
    successes: AtomicU64,
    cancellations: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time view of one worker
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerSnapshot {
    pub successes: u64,
    pub cancellations: u64,
    pub failures: u64,
    /// Bytes of the session in progress
    pub current: ByteCounts,
    /// All bytes, in-progress session included
    pub total: ByteCounts,
}

/// Point-in-time view of all workers
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResultSnapshot {
    pub workers: Vec<WorkerSnapshot>,
}

impl ResultSnapshot {
    pub fn successes(&self) -> u64 {
        self.workers.iter().map(|w| w.successes).sum()
    }

    pub fn cancellations(&self) -> u64 {
        self.workers.iter().map(|w| w.cancellations).sum()
    }

    pub fn failures(&self) -> u64 {
        self.workers.iter().map(|w| w.failures).sum()
    }

    pub fn current(&self) -> ByteCounts {
        self.workers
            .iter()
            .fold(ByteCounts::default(), |acc, w| acc.plus(w.current))
    }

    pub fn total(&self) -> ByteCounts {
        self.workers
            .iter()
            .fold(ByteCounts::default(), |acc, w| acc.plus(w.total))
    }
}

/// Thread-safe accumulation of session outcomes for a fixed worker pool
pub struct ResultAggregator {
    outcomes: Vec<OutcomeCounters>,
    current: Vec<Arc<StreamCounter>>,
    totals: Mutex<Vec<ByteCounts>>,
    total_sessions: AtomicU64,
    errors: ErrorAggregator,
}

impl ResultAggregator {
    pub fn new(workers: usize) -> Self {
        Self {
            outcomes: (0..workers).map(|_| OutcomeCounters::default()).collect(),
            current: (0..workers).map(|_| Arc::new(StreamCounter::default())).collect(),
            totals: Mutex::new(vec![ByteCounts::default(); workers]),
            total_sessions: AtomicU64::new(0),
            errors: ErrorAggregator::default(),
        }
    }

    pub fn workers(&self) -> usize {
        self.outcomes.len()
    }

    /// Live byte counter a worker binds its transport to
    pub fn counter(&self, worker_id: usize) -> Arc<StreamCounter> {
        Arc::clone(&self.current[worker_id])
    }

    pub fn record_success(&self, worker_id: usize) {
        self.outcomes[worker_id].successes.fetch_add(1, Ordering::Relaxed);
        self.finish_session(worker_id);
    }

    pub fn record_cancellation(&self, worker_id: usize) {
        self.outcomes[worker_id]
            .cancellations
            .fetch_add(1, Ordering::Relaxed);
        self.finish_session(worker_id);
    }

    pub fn record_failure(&self, worker_id: usize, error: &anyhow::Error, metadata: Option<String>) {
        self.outcomes[worker_id].failures.fetch_add(1, Ordering::Relaxed);
        self.errors.record(error, metadata, None);
        self.finish_session(worker_id);
        println!(
            "{}\n",
            format!("Worker #{}: unhandled exception: {:#}", worker_id, error).red()
        );
    }

    pub fn total_sessions(&self) -> u64 {
        self.total_sessions.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> &ErrorAggregator {
        &self.errors
    }

    fn finish_session(&self, worker_id: usize) {
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
        // Folding under the lock keeps snapshots from missing these bytes.
        let mut totals = self.totals.lock();
        let finished = self.current[worker_id].take();
        totals[worker_id] = totals[worker_id].plus(finished);
    }

    /// Coherent view of all counters
    pub fn snapshot(&self) -> ResultSnapshot {
        let totals = self.totals.lock();
        let workers = totals
            .iter()
            .enumerate()
            .map(|(i, total)| {
                let current = self.current[i].load();
                let outcomes = &self.outcomes[i];
                WorkerSnapshot {
                    successes: outcomes.successes.load(Ordering::Relaxed),
                    cancellations: outcomes.cancellations.load(Ordering::Relaxed),
                    failures: outcomes.failures.load(Ordering::Relaxed),
                    current,
                    total: total.plus(current),
                }
            })
            .collect();
        ResultSnapshot { workers }
    }

    pub fn print_current_results(&self, elapsed: Duration, aggregates_only: bool) {
        print!("{}", render_results(&self.snapshot(), elapsed, aggregates_only));
    }

    pub fn print_failure_types(&self) {
        print!("{}", self.errors.render());
    }
}

/// Render the periodic per-worker report
pub fn render_results(snapshot: &ResultSnapshot, elapsed: Duration, aggregates_only: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} Elapsed: {}",
        format!("[{}]", Local::now().format("%Y-%m-%d %H:%M:%S")).cyan(),
        format_elapsed(elapsed)
    );

    for (i, worker) in snapshot.workers.iter().enumerate() {
        let label = format!("\tWorker #{}:", i);
        render_row(
            &mut out,
            &label,
            (worker.successes, worker.cancellations, worker.failures),
            worker.current,
            worker.total,
            aggregates_only,
        );
    }
    render_row(
        &mut out,
        "\tTOTAL :   ",
        (
            snapshot.successes(),
            snapshot.cancellations(),
            snapshot.failures(),
        ),
        snapshot.current(),
        snapshot.total(),
        aggregates_only,
    );
    out.push('\n');
    out
}

fn render_row(
    out: &mut String,
    label: &str,
    (pass, cancel, fail): (u64, u64, u64),
    current: ByteCounts,
    total: ByteCounts,
    aggregates_only: bool,
) {
    let _ = write!(
        out,
        "{}\t{}{}\t{}{}\t{}{}",
        label.cyan(),
        "Pass: ".green(),
        pass,
        "Cancel: ".yellow(),
        cancel,
        "Fail: ".red(),
        fail
    );
    if !aggregates_only {
        let _ = write!(
            out,
            "\t{}{}\t{}{}",
            "Curr. Tx: ".blue(),
            format_bytes(current.bytes_written),
            "Curr. Rx: ".magenta(),
            format_bytes(current.bytes_read)
        );
    }
    let _ = writeln!(
        out,
        "\t{}{}\t{}{}",
        "Total Tx: ".blue(),
        format_bytes(total.bytes_written),
        "Total Rx: ".magenta(),
        format_bytes(total.bytes_read)
    );
}

/// One link of an error chain, as used for classification
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ErrorFrame {
    pub kind: String,
    pub message: String,
}

/// A single recorded failure
#[derive(Debug, Clone, Serialize)]
pub struct Occurrence {
    pub timestamp: DateTime<Local>,
    pub metadata: Option<String>,
}

/// All occurrences of one distinct failure
#[derive(Debug, Clone, Serialize)]
pub struct ErrorType {
    pub description: String,
    pub key: Vec<ErrorFrame>,
    pub occurrences: Vec<Occurrence>,
}

/// Groups failures by the kind and message of every link in their chain
#[derive(Debug, Default)]
pub struct ErrorAggregator {
    types: Mutex<HashMap<Vec<ErrorFrame>, ErrorType>>,
}

impl ErrorAggregator {
    pub fn record(
        &self,
        error: &anyhow::Error,
        metadata: Option<String>,
        timestamp: Option<DateTime<Local>>,
    ) {
        let key = classify(error);
        let occurrence = Occurrence {
            timestamp: timestamp.unwrap_or_else(Local::now),
            metadata,
        };
        let mut types = self.types.lock();
        types
            .entry(key.clone())
            .or_insert_with(|| {
                debug!("new failure type: {:#}", error);
                ErrorType {
                    description: format!("{:?}", error),
                    key,
                    occurrences: Vec::new(),
                }
            })
            .occurrences
            .push(occurrence);
    }

    pub fn total_error_types(&self) -> usize {
        self.types.lock().len()
    }

    pub fn total_error_count(&self) -> usize {
        self.types.lock().values().map(|t| t.occurrences.len()).sum()
    }

    /// Distinct failure types, most frequent first
    pub fn error_types(&self) -> Vec<ErrorType> {
        let mut types: Vec<ErrorType> = self.types.lock().values().cloned().collect();
        types.sort_by(|a, b| b.occurrences.len().cmp(&a.occurrences.len()));
        types
    }

    /// Render the grouped failure report; empty when nothing failed
    pub fn render(&self) -> String {
        let types = self.error_types();
        if types.is_empty() {
            return String::new();
        }

        let total: usize = types.iter().map(|t| t.occurrences.len()).sum();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{}\n",
            format!(
                "There were a total of {} failures classified into {} different types:",
                total,
                types.len()
            )
            .red()
        );

        for (i, failure) in types.iter().enumerate() {
            let _ = writeln!(
                out,
                "{}",
                format!("Failure Type {}/{}:", i + 1, types.len()).yellow()
            );
            let _ = writeln!(out, "{}\n", failure.description);

            let mut groups: Vec<(&str, Vec<&Occurrence>)> = Vec::new();
            for occurrence in &failure.occurrences {
                let key = occurrence.metadata.as_deref().unwrap_or("");
                match groups.iter_mut().find(|(k, _)| *k == key) {
                    Some((_, list)) => list.push(occurrence),
                    None => groups.push((key, vec![occurrence])),
                }
            }
            for (metadata, occurrences) in &groups {
                let timestamps: Vec<String> = occurrences
                    .iter()
                    .map(|o| o.timestamp.format("%H:%M:%S").to_string())
                    .collect();
                let _ = writeln!(
                    out,
                    "\t{}{}{}\tTimestamps: {}",
                    format!("{:<30}", metadata).cyan(),
                    "Fail: ".red(),
                    occurrences.len(),
                    timestamps.join(", ")
                );
            }
            let _ = writeln!(
                out,
                "{}{}{}\n",
                format!("{:<31}", "\t    TOTAL").cyan(),
                "Fail: ".red(),
                failure.occurrences.len()
            );
        }
        out
    }
}

/// Structural key of an error: kind and message of every link in its chain
pub fn classify(error: &anyhow::Error) -> Vec<ErrorFrame> {
    error
        .chain()
        .map(|cause| {
            let kind = if let Some(e) = cause.downcast_ref::<StressError>() {
                e.kind().to_string()
            } else if let Some(e) = cause.downcast_ref::<std::io::Error>() {
                format!("io::{:?}", e.kind())
            } else {
                "Error".to_string()
            };
            ErrorFrame {
                kind,
                message: cause.to_string(),
            }
        })
        .collect()
}
