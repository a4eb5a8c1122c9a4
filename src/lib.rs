//! Core library for the photometer DAQ.
//!
//! Talks to a 16-channel LED photometer over a line-oriented serial
//! protocol, calibrates the LED drive levels, and turns raw detector counts
//! into absorbance values with 66-digit decimal arithmetic.
//!
//! The layers, bottom-up:
//!
//! - [`adapters`]: byte-stream links (serial port, simulator)
//! - [`protocol`]: command framing, reply parsing, the retrying engine
//! - [`channel`]: the per-channel register and EEPROM table access
//! - [`calibration`] and [`measurement`]: the instrument procedures
//! - [`amplitude`]: the absorbance transform
//! - [`instrument`]: the session that ties them together

pub mod adapters;
pub mod amplitude;
pub mod calibration;
pub mod channel;
pub mod config;
pub mod data;
pub mod error;
pub mod error_recovery;
pub mod instrument;
pub mod logging;
pub mod measurement;
pub mod metadata;
pub mod protocol;

pub use error::{AppResult, DaqError};
pub use instrument::Photometer;
