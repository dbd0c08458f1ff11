use crate::error::StressError;
use crate::session::SessionLimits;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Stream Stress - duplex framing, backpressure and validation stress test
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Which side(s) of the test to run in this process
    #[clap(short = 'm', long, value_enum, default_value_t = RunMode::Both, help_heading = "Core Options")]
    pub mode: RunMode,

    /// Server endpoint: ip:port, host:port, or *:port for all interfaces
    #[clap(short = 'e', long, default_value = crate::defaults::ENDPOINT, help_heading = "Core Options")]
    pub server_endpoint: String,

    /// Number of concurrent client connections (defaults to the CPU count)
    #[clap(short = 'n', long, help_heading = "Core Options")]
    pub num_connections: Option<usize>,

    /// Probability that a session is cancelled before its lifetime expires
    #[clap(short = 'p', long, default_value_t = crate::defaults::CANCELLATION_PROBABILITY)]
    pub cancellation_probability: f64,

    /// Maximum payload length of a single message
    #[clap(short = 'b', long, default_value_t = crate::defaults::MAX_BUFFER_LENGTH)]
    pub max_buffer_length: usize,

    /// Stop after this many minutes (runs until Ctrl-C when absent)
    #[clap(short = 't', long)]
    pub max_execution_time: Option<f64>,

    /// Interval between progress reports
    #[clap(short = 'i', long, value_parser = parse_duration, default_value = "5s")]
    pub display_interval: Duration,

    /// Seed for all random number generators (random when absent)
    #[clap(short = 's', long)]
    pub seed: Option<u64>,

    /// Shortest client session lifetime
    #[clap(long, value_parser = parse_duration, default_value = "5s")]
    pub min_connection_lifetime: Duration,

    /// Longest client session lifetime
    #[clap(long, value_parser = parse_duration, default_value = "15s")]
    pub max_connection_lifetime: Duration,

    /// In-flight message count above which a sender pauses
    #[clap(long, default_value_t = crate::defaults::HIGH_WATER_MARK, help_heading = "Flow Control")]
    pub high_water_mark: i64,

    /// In-flight message count below which a paused sender resumes
    #[clap(long, default_value_t = crate::defaults::LOW_WATER_MARK, help_heading = "Flow Control")]
    pub low_water_mark: i64,

    /// Idle time after which a connection counts as stalled
    #[clap(long, value_parser = parse_duration, default_value = "10s", help_heading = "Flow Control")]
    pub stall_threshold: Duration,

    /// Period of the per-connection stall check
    #[clap(long, value_parser = parse_duration, default_value = "500ms", help_heading = "Flow Control")]
    pub monitor_interval: Duration,

    /// Extra time a session gets past its deadline before the process is killed
    #[clap(long, value_parser = parse_duration, default_value = "10s", help_heading = "Flow Control")]
    pub watchdog_grace: Duration,

    /// Write client payloads in randomly sized and delayed chunks
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub fault_injection: bool,

    /// Log server-side exceptions
    #[clap(long, default_value_t = false)]
    pub log_server: bool,

    /// JSON file for the final run summary
    #[clap(short = 'o', long)]
    pub output_file: Option<PathBuf>,

    /// Verbose output
    #[clap(short = 'v', long, default_value_t = false)]
    pub verbose: bool,
}

/// Which side(s) of the test to run
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum RunMode {
    /// Echo server only
    #[clap(name = "server")]
    Server,

    /// Stress client only
    #[clap(name = "client")]
    Client,

    /// Server and client in one process
    #[clap(name = "both")]
    Both,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Server => write!(f, "server"),
            RunMode::Client => write!(f, "client"),
            RunMode::Both => write!(f, "both"),
        }
    }
}

impl RunMode {
    pub fn runs_server(self) -> bool {
        matches!(self, RunMode::Server | RunMode::Both)
    }

    pub fn runs_client(self) -> bool {
        matches!(self, RunMode::Client | RunMode::Both)
    }
}

/// Validated configuration of one stress run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StressConfig {
    pub mode: RunMode,
    pub server_endpoint: String,
    pub num_connections: usize,
    pub cancellation_probability: f64,
    pub max_buffer_length: usize,
    pub max_execution_time: Option<Duration>,
    pub display_interval: Duration,
    pub seed: u64,
    pub min_connection_lifetime: Duration,
    pub max_connection_lifetime: Duration,
    pub high_water_mark: i64,
    pub low_water_mark: i64,
    pub stall_threshold: Duration,
    pub monitor_interval: Duration,
    pub watchdog_grace: Duration,
    pub fault_injection: bool,
    pub log_server: bool,
    pub output_file: Option<PathBuf>,
}

impl Default for StressConfig {
    fn default() -> Self {
        use crate::defaults;
        Self {
            mode: RunMode::Both,
            server_endpoint: defaults::ENDPOINT.to_string(),
            num_connections: num_cpus::get(),
            cancellation_probability: defaults::CANCELLATION_PROBABILITY,
            max_buffer_length: defaults::MAX_BUFFER_LENGTH,
            max_execution_time: None,
            display_interval: defaults::DISPLAY_INTERVAL,
            seed: 0,
            min_connection_lifetime: defaults::MIN_CONNECTION_LIFETIME,
            max_connection_lifetime: defaults::MAX_CONNECTION_LIFETIME,
            high_water_mark: defaults::HIGH_WATER_MARK,
            low_water_mark: defaults::LOW_WATER_MARK,
            stall_threshold: defaults::STALL_THRESHOLD,
            monitor_interval: defaults::MONITOR_INTERVAL,
            watchdog_grace: defaults::WATCHDOG_GRACE,
            fault_injection: true,
            log_server: false,
            output_file: None,
        }
    }
}

impl StressConfig {
    /// Convert parsed arguments, filling defaults and validating limits
    pub fn from_args(args: &Args) -> Result<Self, StressError> {
        let max_execution_time = match args.max_execution_time {
            Some(minutes) if !(minutes > 0.0 && minutes.is_finite()) => {
                return Err(StressError::InvalidConfig(format!(
                    "max execution time must be a positive number of minutes, got {}",
                    minutes
                )))
            }
            Some(minutes) => Some(Duration::try_from_secs_f64(minutes * 60.0).map_err(|e| {
                StressError::InvalidConfig(format!(
                    "max execution time of {} minutes is out of range: {}",
                    minutes, e
                ))
            })?),
            None => None,
        };

        if args.cancellation_probability.is_nan() {
            return Err(StressError::InvalidConfig(
                "cancellation probability must be a number".into(),
            ));
        }

        let config = Self {
            mode: args.mode,
            server_endpoint: args.server_endpoint.clone(),
            num_connections: args.num_connections.unwrap_or_else(num_cpus::get),
            cancellation_probability: args.cancellation_probability.clamp(0.0, 1.0),
            max_buffer_length: args.max_buffer_length,
            max_execution_time,
            display_interval: args.display_interval,
            seed: args.seed.unwrap_or_else(crate::utils::random_seed),
            min_connection_lifetime: args.min_connection_lifetime,
            max_connection_lifetime: args.max_connection_lifetime,
            high_water_mark: args.high_water_mark,
            low_water_mark: args.low_water_mark,
            stall_threshold: args.stall_threshold,
            monitor_interval: args.monitor_interval,
            watchdog_grace: args.watchdog_grace,
            fault_injection: args.fault_injection,
            log_server: args.log_server,
            output_file: args.output_file.clone(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), StressError> {
        let invalid = |message: String| Err(StressError::InvalidConfig(message));

        if !(0.0..=1.0).contains(&self.cancellation_probability) {
            return invalid(format!(
                "cancellation probability must be within [0, 1], got {}",
                self.cancellation_probability
            ));
        }
        if self.num_connections == 0 {
            return invalid("number of connections must be greater than zero".into());
        }
        if self.max_buffer_length == 0 {
            return invalid("max buffer length must be greater than zero".into());
        }
        if self.low_water_mark <= 0 {
            return invalid(format!(
                "low water mark must be positive, got {}",
                self.low_water_mark
            ));
        }
        if self.high_water_mark <= self.low_water_mark {
            return invalid(format!(
                "high water mark ({}) must exceed low water mark ({})",
                self.high_water_mark, self.low_water_mark
            ));
        }
        if self.monitor_interval.is_zero() || self.stall_threshold <= self.monitor_interval {
            return invalid(format!(
                "stall threshold ({:?}) must exceed a non-zero monitor interval ({:?})",
                self.stall_threshold, self.monitor_interval
            ));
        }
        if self.min_connection_lifetime > self.max_connection_lifetime {
            return invalid(format!(
                "min connection lifetime ({:?}) exceeds max connection lifetime ({:?})",
                self.min_connection_lifetime, self.max_connection_lifetime
            ));
        }
        if self.display_interval.is_zero() {
            return invalid("display interval must be greater than zero".into());
        }
        Ok(())
    }

    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            high_water_mark: self.high_water_mark,
            low_water_mark: self.low_water_mark,
            stall_threshold: self.stall_threshold,
            monitor_interval: self.monitor_interval,
            ..SessionLimits::default()
        }
    }
}

/// Parse duration from string (e.g., "10s", "5m", "1h", "250ms")
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s")
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be a non-negative number: {}", s));
    }

    let seconds = match unit {
        "ms" => num / 1000.0,
        "s" => num,
        "m" => num * 60.0,
        "h" => num * 3600.0,
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Duration::try_from_secs_f64(seconds).map_err(|e| format!("Duration out of range: {}: {}", s, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::parse_from(std::iter::once("stream-stress").chain(args.iter().copied()))
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("invalid").is_err());
        assert!(parse_duration("-1s").is_err());
        assert!(parse_duration("NaN").is_err());
        assert!(parse_duration("1e300s").is_err());
        assert!(parse_duration("1e300h").is_err());
    }

    #[test]
    fn test_run_mode() {
        assert!(RunMode::Both.runs_server() && RunMode::Both.runs_client());
        assert!(RunMode::Server.runs_server() && !RunMode::Server.runs_client());
        assert!(!RunMode::Client.runs_server() && RunMode::Client.runs_client());
        assert_eq!(RunMode::Client.to_string(), "client");
    }

    #[test]
    fn test_defaults_from_args() {
        let config = StressConfig::from_args(&parse(&["-s", "7"])).unwrap();
        assert_eq!(config.mode, RunMode::Both);
        assert_eq!(config.server_endpoint, "127.0.0.1:5002");
        assert_eq!(config.num_connections, num_cpus::get());
        assert_eq!(config.seed, 7);
        assert_eq!(config.max_buffer_length, 8192);
        assert_eq!(config.display_interval, Duration::from_secs(5));
        assert_eq!(config.min_connection_lifetime, Duration::from_secs(5));
        assert_eq!(config.max_connection_lifetime, Duration::from_secs(15));
        assert_eq!(config.max_execution_time, None);
        assert!(config.fault_injection);
        assert!(!config.log_server);
    }

    #[test]
    fn test_explicit_args() {
        let config = StressConfig::from_args(&parse(&[
            "-m",
            "client",
            "-e",
            "*:6000",
            "-n",
            "3",
            "-p",
            "1.7",
            "-t",
            "0.5",
            "--fault-injection",
            "false",
            "--high-water-mark",
            "100",
            "--low-water-mark",
            "10",
        ]))
        .unwrap();
        assert_eq!(config.mode, RunMode::Client);
        assert_eq!(config.server_endpoint, "*:6000");
        assert_eq!(config.num_connections, 3);
        assert_eq!(config.cancellation_probability, 1.0);
        assert_eq!(config.max_execution_time, Some(Duration::from_secs(30)));
        assert!(!config.fault_injection);

        let limits = config.session_limits();
        assert_eq!(limits.high_water_mark, 100);
        assert_eq!(limits.low_water_mark, 10);
    }

    #[test]
    fn test_validation_rejects_bad_limits() {
        let rejected = [
            vec!["--high-water-mark", "10", "--low-water-mark", "10"],
            vec!["--low-water-mark", "0"],
            vec!["--stall-threshold", "1s", "--monitor-interval", "1s"],
            vec!["--min-connection-lifetime", "20s"],
            vec!["-b", "0"],
            vec!["-n", "0"],
            vec!["-t", "0"],
            vec!["-t", "1e300"],
            vec!["-t", "NaN"],
            vec!["-p", "NaN"],
        ];
        for args in rejected {
            let err = StressConfig::from_args(&parse(&args)).unwrap_err();
            assert_eq!(err.kind(), "InvalidConfig", "{:?}", args);
        }

        let config = StressConfig {
            cancellation_probability: f64::NAN,
            ..StressConfig::default()
        };
        assert_eq!(config.validate().unwrap_err().kind(), "InvalidConfig");
        let config = StressConfig {
            cancellation_probability: 1.5,
            ..StressConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_huge_stall_threshold_is_a_parse_error() {
        let err = Args::try_parse_from(["stream-stress", "--stall-threshold", "1e300s"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }
}
