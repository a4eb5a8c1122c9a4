//! Custom error types for the photometer core.
//!
//! This module defines the primary error type, `DaqError`, shared by the link,
//! protocol, calibration and transform layers. Using the `thiserror` crate it
//! gives every failure a typed variant with enough context (channel, command,
//! elapsed time, attempt count) for a front end to render a useful message.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: the link cannot be opened or is used while closed.
//! - **`Timeout`**: no complete reply arrived within the budget after all retries.
//! - **`ProtocolFormat`**: a reply arrived but has the wrong length, is not
//!   hexadecimal or answers a different opcode or channel. Never retried; the
//!   raw bytes are carried for diagnosis.
//! - **`CalibrationNotConverged`**: the bisection cycle budget ran out. This is a
//!   warning in practice; the calibration run keeps going with the other channels.
//! - **`Domain`**: the amplitude transform was asked to take the logarithm of a
//!   non-positive ratio.
//! - **`Aborted`**: the run stopped on purpose (policy `stop`, cancellation, or
//!   a precondition the operator has not met).
//!
//! By using `#[from]`, `DaqError` can be created from the underlying library
//! errors, so the `?` operator works across the crate.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Connection error on '{port}': {reason}")]
    Connection { port: String, reason: String },

    #[error("Timeout waiting for reply to '{command}' after {attempts} attempt(s) ({elapsed:?})")]
    Timeout {
        command: String,
        attempts: u32,
        elapsed: Duration,
        /// Bytes received before the final attempt gave up, if any.
        partial: Vec<u8>,
    },

    #[error("Malformed reply to '{command}': {reason} (raw: {})", String::from_utf8_lossy(.raw).escape_debug())]
    ProtocolFormat {
        command: String,
        raw: Vec<u8>,
        reason: String,
    },

    #[error("Channel {channel} did not converge after {cycles} cycles (last reading {last_reading}, target {target})")]
    CalibrationNotConverged {
        channel: usize,
        cycles: u32,
        last_reading: u16,
        target: u16,
    },

    #[error("Domain error: {0}")]
    Domain(String),

    #[error("Operation aborted: {0}")]
    Aborted(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "storage_csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl DaqError {
    /// Build a `Connection` error for the given port.
    pub fn connection(port: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Connection {
            port: port.into(),
            reason: reason.into(),
        }
    }

    /// Build a `ProtocolFormat` error from the offending reply.
    pub fn format(command: impl Into<String>, raw: &[u8], reason: impl Into<String>) -> Self {
        Self::ProtocolFormat {
            command: command.into(),
            raw: raw.to_vec(),
            reason: reason.into(),
        }
    }

    /// Whether the protocol engine may retry after this error.
    ///
    /// Malformed replies and deliberate aborts are final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. } | Self::Io(_))
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::connection("/dev/ttyUSB0", "device busy");
        assert_eq!(
            err.to_string(),
            "Connection error on '/dev/ttyUSB0': device busy"
        );
    }

    #[test]
    fn test_format_error_carries_raw_bytes() {
        let err = DaqError::format(":0250", b":03\r", "expected 14 bytes, got 4");
        let text = err.to_string();
        assert!(text.contains(":0250"));
        assert!(text.contains("\\r"));
        match err {
            DaqError::ProtocolFormat { raw, .. } => assert_eq!(raw, b":03\r".to_vec()),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(DaqError::connection("COM4", "gone").is_retryable());
        assert!(!DaqError::format(":00", b"", "empty").is_retryable());
        assert!(!DaqError::Aborted("stop".into()).is_retryable());
        assert!(!DaqError::Domain("Is <= 0".into()).is_retryable());
    }
}
