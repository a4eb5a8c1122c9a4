//! Tracing setup
//!
//! The protocol and calibration engines emit structured `tracing` events
//! (command text, attempt, elapsed time, channel). This module installs a
//! `tracing-subscriber` formatter for applications that embed the core and do
//! not bring their own subscriber.
//!
//! # Example
//! ```no_run
//! use photometer_daq::{config::Settings, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load_from("config/photometer.toml")?;
//! logging::init_from_settings(&settings)?;
//! tracing::info!("photometer core ready");
//! # Ok(())
//! # }
//! ```

use crate::config::Settings;
use crate::error::{AppResult, DaqError};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Output format for tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Pretty-printed format with colors (for development)
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for structured logging
    Json,
}

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Default level when `RUST_LOG` is not set
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Whether to include file and line numbers
    pub with_file_and_line: bool,
    /// Whether to enable ANSI colors
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_file_and_line: false,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialize tracing using `application.log_level` from the settings.
pub fn init_from_settings(settings: &Settings) -> AppResult<()> {
    let level = parse_log_level(&settings.application.log_level)?;
    init(TracingConfig::new(level))
}

/// Initialize tracing with custom configuration.
///
/// Idempotent: if a global subscriber is already installed this returns `Ok(())`,
/// which keeps it safe to call from tests and from host applications.
pub fn init(config: TracingConfig) -> AppResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let layer = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_ansi(config.with_ansi)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_ansi(config.with_ansi)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_filter(env_filter)
            .boxed(),
    };

    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => Ok(()),
        // Another subscriber got there first (tests, host application).
        Err(e) if e.to_string().contains("already been set") => Ok(()),
        Err(e) => Err(DaqError::Configuration(format!(
            "Failed to initialize tracing: {e}"
        ))),
    }
}

/// Parse a textual log level.
pub fn parse_log_level(level: &str) -> AppResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(DaqError::Configuration(format!(
            "Invalid log level '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("DEBUG").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("warn").unwrap(), Level::WARN);
        assert!(parse_log_level("chatty").is_err());
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = TracingConfig::new(Level::DEBUG).with_ansi(false);
        assert!(init(config.clone()).is_ok());
        assert!(init(config).is_ok());
    }
}
