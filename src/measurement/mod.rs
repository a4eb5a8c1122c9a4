//! Measurement records and measurement cycles.
//!
//! A cycle measures every enabled channel once, in ascending `order`, and
//! yields one [`MeasurementRecord`] with a raw triple per channel (zeros for
//! channels that were not measured). The record's type label says what kind
//! of cycle produced it:
//!
//! | Label                  | Produced by                      |
//! |------------------------|----------------------------------|
//! | `REF_00000_<n>`        | level calibration run `n`        |
//! | `REF_<target>_<n>`     | target calibration run `n`       |
//! | `MEAS_<tag>_<n>`       | measurement `n`                  |
//!
//! Labels starting with `REF` make the amplitude transform adopt the record's
//! intensities as the new references.

use crate::adapters::Link;
use crate::calibration::CancelFlag;
use crate::channel::{AdcReading, ChannelRegister, CHANNEL_COUNT, WAVELENGTHS};
use crate::config::NoResponseAction;
use crate::error::{AppResult, DaqError};
use crate::metadata::Metadata;
use crate::protocol::ProtocolEngine;
use dashu::float::DBig;
use serde::Serialize;
use tracing::{info, warn};

/// Prefix shared by every reference (calibration) label.
pub const REFERENCE_PREFIX: &str = "REF";
/// Prefix shared by every measurement label.
pub const MEASUREMENT_PREFIX: &str = "MEAS";
/// Tag used when a label has no target or fixed reference value.
pub const NO_VALUE_TAG: &str = "00000";
/// Upper bound on the repeat count of an averaged measurement.
pub const MAX_AVERAGED_CYCLES: u32 = 10;

pub fn level_calibration_label(run: u32) -> String {
    format!("{REFERENCE_PREFIX}_{NO_VALUE_TAG}_{run}")
}

pub fn target_calibration_label(target: u16, run: u32) -> String {
    format!("{REFERENCE_PREFIX}_{target:05}_{run}")
}

pub fn measurement_label(tag: &str, count: u32) -> String {
    format!("{MEASUREMENT_PREFIX}_{tag}_{count}")
}

/// Raw counts of one calibration or measurement cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MeasurementRecord {
    pub user_id: String,
    pub sample: String,
    pub label: String,
    pub readings: [AdcReading; CHANNEL_COUNT],
    /// Pulse-1 level the readings are compared against when measuring
    /// without calibration. Display only; absorbance never uses it.
    pub ratio_reference: Option<u32>,
}

impl MeasurementRecord {
    pub fn new(metadata: &Metadata, sample: &str, label: String) -> Self {
        Self {
            user_id: metadata.user_id.clone(),
            sample: sample.to_string(),
            label,
            readings: [AdcReading::default(); CHANNEL_COUNT],
            ratio_reference: None,
        }
    }

    pub fn is_reference(&self) -> bool {
        self.label.starts_with(REFERENCE_PREFIX)
    }

    /// `pulse1, pulse2, background` per channel, 48 values in channel order.
    pub fn raw_values(&self) -> Vec<u16> {
        self.readings
            .iter()
            .flat_map(|r| [r.pulse1, r.pulse2, r.background])
            .collect()
    }
}

/// Absorbance per channel derived from a [`MeasurementRecord`].
///
/// `None` marks a channel with no reading in the source record.
#[derive(Debug, Clone, PartialEq)]
pub struct AbsorbanceRecord {
    pub user_id: String,
    pub sample: String,
    pub label: String,
    pub values: Vec<Option<DBig>>,
}

/// How references are established for a measurement cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementMode {
    /// Use the references of the last calibration run.
    Calibrated,
    /// Measure before any calibration, comparing pulse 1 against a fixed
    /// level on every channel. Refused once a calibration run exists.
    FixedReference(u32),
}

/// Readings collected by one pass over a channel list.
#[derive(Debug)]
pub(crate) struct Sweep {
    pub readings: [AdcReading; CHANNEL_COUNT],
    pub answered: Vec<usize>,
    pub warnings: Vec<DaqError>,
}

/// Turn a per-channel failure into a warning when the policy says to carry on.
pub(crate) fn tolerate<L: Link>(engine: &ProtocolEngine<L>, err: DaqError) -> AppResult<DaqError> {
    if err.is_retryable() && engine.policy().on_exhausted == NoResponseAction::Continue {
        Ok(err)
    } else {
        Err(err)
    }
}

/// Measure `channels` in the given order.
pub(crate) async fn sweep<L: Link>(
    engine: &mut ProtocolEngine<L>,
    register: &mut ChannelRegister,
    channels: &[usize],
    cancel: &CancelFlag,
) -> AppResult<Sweep> {
    let mut sweep = Sweep {
        readings: [AdcReading::default(); CHANNEL_COUNT],
        answered: Vec::with_capacity(channels.len()),
        warnings: Vec::new(),
    };
    for &channel in channels {
        cancel.check(channel)?;
        match engine.measure(channel).await {
            Ok(reading) => {
                register.record_reading(channel, reading)?;
                sweep.readings[channel] = reading;
                sweep.answered.push(channel);
            }
            Err(e) => {
                let warning = tolerate(engine, e)?;
                warn!("Channel {} ({} nm) skipped: {}", channel, WAVELENGTHS[channel], warning);
                sweep.warnings.push(warning);
            }
        }
    }
    Ok(sweep)
}

/// Runs measurement cycles and counts the records produced.
#[derive(Debug, Default)]
pub struct MeasurementRunner {
    measurements: u32,
    cancel: CancelFlag,
}

impl MeasurementRunner {
    pub fn new(cancel: CancelFlag) -> Self {
        Self {
            measurements: 0,
            cancel,
        }
    }

    /// Number of measurement records produced so far.
    pub fn count(&self) -> u32 {
        self.measurements
    }

    pub fn reset(&mut self) {
        self.measurements = 0;
    }

    /// One cycle over the enabled channels.
    ///
    /// `calibrations` is the number of calibration runs completed. Without
    /// one only [`MeasurementMode::FixedReference`] is accepted; with one only
    /// [`MeasurementMode::Calibrated`]. The fixed value is carried on the
    /// record and never replaces the absorbance references.
    pub async fn measure_cycle<L: Link>(
        &mut self,
        engine: &mut ProtocolEngine<L>,
        register: &mut ChannelRegister,
        metadata: &Metadata,
        mode: MeasurementMode,
        calibrations: u32,
    ) -> AppResult<MeasurementRecord> {
        metadata.validate_for_measurement()?;
        let (tag, ratio_reference) = match mode {
            MeasurementMode::Calibrated if calibrations == 0 => {
                return Err(DaqError::Aborted(
                    "calibrate before measuring or supply a fixed reference value".to_string(),
                ));
            }
            MeasurementMode::Calibrated => (NO_VALUE_TAG.to_string(), None),
            MeasurementMode::FixedReference(_) if calibrations > 0 => {
                return Err(DaqError::Aborted(format!(
                    "{calibrations} calibration run(s) active; measure against the calibrated references"
                )));
            }
            MeasurementMode::FixedReference(0) => {
                return Err(DaqError::InvalidArgument(
                    "fixed reference value must be positive".to_string(),
                ));
            }
            MeasurementMode::FixedReference(value) => (value.to_string(), Some(value)),
        };

        let label = measurement_label(&tag, self.measurements);
        let channels = register.enabled_in_order();
        let sweep = sweep(engine, register, &channels, &self.cancel).await?;

        self.measurements += 1;
        info!(
            "Measurement {} done: {} of {} channel(s) answered",
            label,
            sweep.answered.len(),
            channels.len()
        );
        let mut record = MeasurementRecord::new(metadata, &metadata.sample, label);
        record.readings = sweep.readings;
        record.ratio_reference = ratio_reference;
        Ok(record)
    }

    /// `cycles` back-to-back cycles (clamped to `1..=10`), one record each.
    ///
    /// Requires a prior calibration.
    pub async fn averaged_measurement<L: Link>(
        &mut self,
        engine: &mut ProtocolEngine<L>,
        register: &mut ChannelRegister,
        metadata: &Metadata,
        cycles: u32,
        calibrations: u32,
    ) -> AppResult<Vec<MeasurementRecord>> {
        metadata.validate()?;
        if calibrations == 0 {
            return Err(DaqError::Aborted("calibrate before measuring".to_string()));
        }
        let cycles = cycles.clamp(1, MAX_AVERAGED_CYCLES);
        info!("Starting {}-fold averaged measurement", cycles);

        let channels = register.enabled_in_order();
        let mut records = Vec::with_capacity(cycles as usize);
        for _ in 0..cycles {
            let sweep = sweep(engine, register, &channels, &self.cancel).await?;
            let label = measurement_label("AVG", self.measurements);
            self.measurements += 1;
            let mut record = MeasurementRecord::new(metadata, "", label);
            record.readings = sweep.readings;
            records.push(record);
        }
        Ok(records)
    }
}
