//! Configuration system using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `PHOTOMETER_`, nested with `__`
//!
//! Every field has a default, so an empty file yields a working configuration
//! for the standard instrument (115200 baud, DAC search bounds 20..=3520).
//!
//! ```text
//! PHOTOMETER_SERIAL__PORT=/dev/ttyUSB1
//! PHOTOMETER_SERIAL__ON_NO_RESPONSE_ACTION=stop
//! PHOTOMETER_CALIBRATION__TOLERANCE=2
//! ```
//!
//! # Example
//!
//! ```no_run
//! use photometer_daq::config::Settings;
//!
//! let settings = Settings::load_from("config/photometer.toml")?;
//! println!("Port: {}", settings.serial.port);
//! # Ok::<(), photometer_daq::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationSettings,
    /// Link and protocol engine settings
    #[serde(default)]
    pub serial: SerialSettings,
    /// DAC search settings
    #[serde(default)]
    pub calibration: CalibrationSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// What the protocol engine does once every attempt for a command has failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoResponseAction {
    /// Return the timeout error to the caller.
    #[default]
    Retry,
    /// Hand back whatever was received, tagged incomplete, and carry on.
    Continue,
    /// Abort the whole run.
    Stop,
}

impl fmt::Display for NoResponseAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retry => write!(f, "retry"),
            Self::Continue => write!(f, "continue"),
            Self::Stop => write!(f, "stop"),
        }
    }
}

/// Serial link and protocol engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Serial port (e.g., "/dev/ttyUSB0", "COM4")
    #[serde(default = "default_port")]
    pub port: String,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Base reply timeout for the first attempt, in milliseconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
    /// Total attempts per command, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Pause between closing and reopening the link, in milliseconds
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
    /// Reply timeout for the connection handshake, in milliseconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    /// Consecutive empty polls that complete an unterminated reply
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold: u32,
    /// Sleep between polls, in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Minimum spacing of "still waiting" log lines, in milliseconds
    #[serde(default = "default_log_interval")]
    pub log_interval_ms: u64,
    /// Pause after each completed command, in milliseconds
    #[serde(default)]
    pub command_delay_ms: u64,
    /// Line terminator appended to commands and expected on replies
    #[serde(default = "default_terminator")]
    pub terminator: String,
    /// Policy once all attempts are exhausted
    #[serde(default)]
    pub on_no_response_action: NoResponseAction,
    /// Number of communication entries kept for diagnostics
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
            command_timeout_ms: default_command_timeout(),
            max_attempts: default_max_attempts(),
            reconnect_delay_ms: default_reconnect_delay(),
            handshake_timeout_ms: default_handshake_timeout(),
            idle_threshold: default_idle_threshold(),
            poll_interval_ms: default_poll_interval(),
            log_interval_ms: default_log_interval(),
            command_delay_ms: 0,
            terminator: default_terminator(),
            on_no_response_action: NoResponseAction::default(),
            history_capacity: default_history_capacity(),
        }
    }
}

impl SerialSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn log_interval(&self) -> Duration {
        Duration::from_millis(self.log_interval_ms)
    }

    pub fn command_delay(&self) -> Duration {
        Duration::from_millis(self.command_delay_ms)
    }
}

/// DAC search configuration for target calibration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSettings {
    /// Lower DAC bound of the bisection search
    #[serde(default = "default_dac_min")]
    pub dac_min: u32,
    /// Upper DAC bound of the bisection search
    #[serde(default = "default_dac_max")]
    pub dac_max: u32,
    /// Accepted distance between reading and target, in ADC counts
    #[serde(default = "default_tolerance")]
    pub tolerance: u16,
    /// Bisection stops once a step changes the DAC by no more than this
    #[serde(default)]
    pub min_step: u32,
    /// Bisection cycle budget per channel
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,
    /// Half width of the linear refine window, in DAC units
    #[serde(default = "default_refine_window")]
    pub refine_window: u32,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            dac_min: default_dac_min(),
            dac_max: default_dac_max(),
            tolerance: default_tolerance(),
            min_step: 0,
            max_cycles: default_max_cycles(),
            refine_window: default_refine_window(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> String {
    "COM4".to_string()
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_command_timeout() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_reconnect_delay() -> u64 {
    1_000
}

fn default_handshake_timeout() -> u64 {
    500
}

fn default_idle_threshold() -> u32 {
    3
}

fn default_poll_interval() -> u64 {
    10
}

fn default_log_interval() -> u64 {
    1_000
}

fn default_terminator() -> String {
    "\r".to_string()
}

fn default_history_capacity() -> usize {
    256
}

fn default_dac_min() -> u32 {
    20
}

fn default_dac_max() -> u32 {
    3520
}

fn default_tolerance() -> u16 {
    4
}

fn default_max_cycles() -> u32 {
    50
}

fn default_refine_window() -> u32 {
    5
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from a TOML file plus `PHOTOMETER_` environment overrides.
    ///
    /// A missing file is not an error; defaults fill every field.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Self::figment(path.as_ref()).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("PHOTOMETER_").split("__"))
    }

    /// Validate configuration after loading
    ///
    /// # Errors
    ///
    /// Returns `DaqError::Configuration` with a descriptive message for any
    /// value the engines cannot work with.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let serial = &self.serial;
        if serial.port.trim().is_empty() {
            return Err(DaqError::Configuration("Serial port must not be empty".into()));
        }
        if serial.baud_rate == 0 {
            return Err(DaqError::Configuration("Baud rate must be positive".into()));
        }
        if serial.max_attempts == 0 {
            return Err(DaqError::Configuration(
                "max_attempts must be at least 1".into(),
            ));
        }
        if serial.idle_threshold == 0 {
            return Err(DaqError::Configuration(
                "idle_threshold must be at least 1".into(),
            ));
        }
        if serial.poll_interval_ms == 0 {
            return Err(DaqError::Configuration(
                "poll_interval_ms must be at least 1".into(),
            ));
        }
        if serial.terminator.is_empty() {
            return Err(DaqError::Configuration("Terminator must not be empty".into()));
        }

        let cal = &self.calibration;
        if cal.dac_min >= cal.dac_max {
            return Err(DaqError::Configuration(format!(
                "Invalid DAC bounds [{}, {}]: dac_min must be below dac_max",
                cal.dac_min, cal.dac_max
            )));
        }
        if cal.max_cycles == 0 {
            return Err(DaqError::Configuration("max_cycles must be at least 1".into()));
        }

        Ok(())
    }
}
