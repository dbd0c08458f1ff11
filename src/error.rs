//! Error taxonomy for the framing engine and the connection workers.
//!
//! Cancellation is not an error; a cancelled session is reported through
//! [`SessionOutcome`](crate::session::SessionOutcome).

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Direction of a stalled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallDirection {
    /// No frame was received within the stall threshold
    Read,
    /// No frame was written within the stall threshold
    Write,
}

impl fmt::Display for StallDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StallDirection::Read => write!(f, "read"),
            StallDirection::Write => write!(f, "write"),
        }
    }
}

/// Errors raised while framing, validating or transporting data segments
#[derive(Debug, Error)]
pub enum StressError {
    /// A frame failed structural or checksum validation
    #[error("data mismatch: {0}")]
    DataMismatch(String),

    /// The liveness monitor saw no activity in one direction
    #[error("connection stalled: no {direction} activity for {idle:?}")]
    Stall {
        direction: StallDirection,
        idle: Duration,
    },

    /// The underlying transport failed
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration values violate an ordering constraint
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl StressError {
    pub(crate) fn mismatch(message: impl Into<String>) -> Self {
        StressError::DataMismatch(message.into())
    }

    /// Stable name of the error variant, used to classify failures
    pub fn kind(&self) -> &'static str {
        match self {
            StressError::DataMismatch(_) => "DataMismatch",
            StressError::Stall { .. } => "Stall",
            StressError::Io(_) => "Io",
            StressError::InvalidConfig(_) => "InvalidConfig",
        }
    }

    /// Whether this error is a frame validation failure
    pub fn is_data_mismatch(&self) -> bool {
        matches!(self, StressError::DataMismatch(_))
    }
}
