//! # Stream Stress Library
//!
//! A stress harness for duplex, message-framed byte streams. Clients open
//! TCP connections to an echo server and push randomly sized, checksummed
//! segments at it for a random lifetime, while tracking how many messages
//! are in flight, throttling on a high/low water mark pair, validating every
//! echo, and failing any connection that stops making progress.
//!
//! ## Wire Format
//!
//! Every message is one line of the form `{length},{checksum},{payload}\n`.
//! The payload never contains the `\n` delimiter. A zero-length message
//! (`0,0,\n`) is the end-of-stream sentinel that closes a session.
//!
//! ## Architecture Overview
//!
//! - `checksum`: CRC-32 checksum of payload bytes
//! - `segment`: pooled payload buffers (`DataSegment`, `BufferPool`)
//! - `serializer`: wire encoding and validating decoding, with optional
//!   randomized chunked writes
//! - `framing`: delimiter-based frame reassembly over any `AsyncRead`
//! - `session`: sender, receiver and stall monitor of one connection
//! - `server` / `client`: the echo server and the stress client workers
//! - `results`: outcome counters, byte counters and failure classification
//! - `runner`: ties a full run together and produces the final report
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use stream_stress::{RunMode, StressConfig, StressRunner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = StressConfig {
//!         mode: RunMode::Both,
//!         num_connections: 4,
//!         seed: 42,
//!         ..StressConfig::default()
//!     };
//!
//!     let summary = StressRunner::new(config)
//!         .run_until(tokio::time::sleep(std::time::Duration::from_secs(30)))
//!         .await?;
//!
//!     println!("{} sessions, {} failures", summary.total_sessions, summary.failures);
//!     Ok(())
//! }
//! ```

pub mod checksum;

/// Command-line arguments and run configuration
pub mod cli;

/// Stress client workers
///
/// Runs sessions back to back on every worker, each with a random lifetime
/// and cancellation deadline, and records every outcome.
pub mod client;

pub mod error;

/// Frame reassembly
pub mod framing;

pub mod logging;

/// Outcome aggregation and console reports
pub mod results;

/// Orchestration of a full run
pub mod runner;

pub mod segment;

/// Wire encoding and decoding of data segments
pub mod serializer;

/// Echo server
pub mod server;

/// Per-connection sender, receiver and monitor loops
pub mod session;

/// TCP setup and byte counting
pub mod transport;

pub mod utils;

pub use cli::{Args, RunMode, StressConfig};
pub use error::StressError;
pub use results::{ResultAggregator, StreamCounter};
pub use runner::{RunSummary, StressRunner};
pub use segment::{BufferPool, DataSegment};
pub use serializer::DataSegmentSerializer;
pub use session::{SessionLimits, SessionOutcome};

/// The current version of the stress harness
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Default server endpoint
    pub const ENDPOINT: &str = "127.0.0.1:5002";

    /// Probability that a client session is cut short by cancellation
    pub const CANCELLATION_PROBABILITY: f64 = 0.1;

    /// Largest payload a client sends in one message
    pub const MAX_BUFFER_LENGTH: usize = 8192;

    /// Interval between progress reports
    pub const DISPLAY_INTERVAL: Duration = Duration::from_secs(5);

    pub const MIN_CONNECTION_LIFETIME: Duration = Duration::from_secs(5);
    pub const MAX_CONNECTION_LIFETIME: Duration = Duration::from_secs(15);

    /// In-flight message count above which a sender pauses
    pub const HIGH_WATER_MARK: i64 = 5000;

    /// In-flight message count below which a paused sender resumes
    pub const LOW_WATER_MARK: i64 = 2000;

    /// Idle time after which a connection counts as stalled
    pub const STALL_THRESHOLD: Duration = Duration::from_secs(10);

    pub const MONITOR_INTERVAL: Duration = Duration::from_millis(500);

    /// Time a session may outlive its cancellation deadline before the
    /// process is terminated
    pub const WATCHDOG_GRACE: Duration = Duration::from_secs(10);

    /// Process exit code after a detected hang
    pub const EXIT_HANG: i32 = 2;

    /// Process exit code when any session failed
    pub const EXIT_FAILURES: u8 = 1;
}
