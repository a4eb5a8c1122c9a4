//! Photometer session
//!
//! [`Photometer`] owns everything a running session needs: the protocol
//! engine (and through it the link), the channel register, the calibration
//! and measurement counters, the operator metadata and a recorder. A front
//! end drives the instrument only through it:
//!
//! ```no_run
//! use photometer_daq::adapters::SimulatedInstrument;
//! use photometer_daq::calibration::CalibrationMode;
//! use photometer_daq::config::Settings;
//! use photometer_daq::data::MemoryRecorder;
//! use photometer_daq::instrument::Photometer;
//! use photometer_daq::measurement::MeasurementMode;
//! use photometer_daq::metadata::MetadataBuilder;
//!
//! # async fn run() -> photometer_daq::error::AppResult<()> {
//! let settings = Settings::default();
//! let mut photometer = Photometer::new(SimulatedInstrument::new(), MemoryRecorder::new(), &settings);
//! photometer.connect().await?;
//! photometer
//!     .set_metadata(MetadataBuilder::new().user_id("op1").sample("water").build())
//!     .await?;
//! photometer.calibrate(CalibrationMode::Target(10000)).await?;
//! let outcome = photometer.measure(MeasurementMode::Calibrated).await?;
//! println!("{:?}", outcome.derived.absorbance);
//! # Ok(())
//! # }
//! ```

use crate::adapters::Link;
use crate::amplitude;
use crate::calibration::{CalibrationEngine, CalibrationMode, CalibrationReport, CancelFlag};
use crate::channel::{ChannelRegister, CHANNEL_COUNT};
use crate::config::Settings;
use crate::data::Recorder;
use crate::error::{AppResult, DaqError};
use crate::measurement::{AbsorbanceRecord, MeasurementMode, MeasurementRecord, MeasurementRunner};
use crate::metadata::Metadata;
use crate::protocol::ProtocolEngine;
use tracing::{info, warn};

/// What became of a raw record after it was handed to the transform.
#[derive(Debug, Default)]
pub struct Derived {
    pub absorbance: Option<AbsorbanceRecord>,
    /// Set when the transform rejected the record; the session carries on.
    pub transform_error: Option<DaqError>,
}

#[derive(Debug)]
pub struct CalibrationOutcome {
    pub report: CalibrationReport,
    pub derived: Derived,
}

#[derive(Debug)]
pub struct MeasurementOutcome {
    pub record: MeasurementRecord,
    pub derived: Derived,
}

pub struct Photometer<L: Link, R: Recorder> {
    engine: ProtocolEngine<L>,
    register: ChannelRegister,
    calibration: CalibrationEngine,
    measurement: MeasurementRunner,
    recorder: R,
    metadata: Metadata,
    cancel: CancelFlag,
}

impl<L: Link, R: Recorder> Photometer<L, R> {
    pub fn new(link: L, recorder: R, settings: &Settings) -> Self {
        let cancel = CancelFlag::default();
        Self {
            engine: ProtocolEngine::new(link, &settings.serial),
            register: ChannelRegister::new(),
            calibration: CalibrationEngine::new(settings.calibration.clone(), cancel.clone()),
            measurement: MeasurementRunner::new(cancel.clone()),
            recorder,
            metadata: Metadata::default(),
            cancel,
        }
    }

    /// Open the link and validate it with the handshake.
    pub async fn connect(&mut self) -> AppResult<()> {
        self.engine.connect().await
    }

    pub async fn disconnect(&mut self) {
        self.engine.disconnect().await;
    }

    pub fn is_connected(&self) -> bool {
        self.engine.is_connected()
    }

    /// Start a new data session: hand the metadata to the recorder and reset
    /// the calibration and measurement counters.
    pub async fn set_metadata(&mut self, metadata: Metadata) -> AppResult<()> {
        metadata.validate()?;
        self.recorder.set_metadata(&metadata).await?;
        self.calibration.reset_runs();
        self.measurement.reset();
        info!("Session for user '{}' started", metadata.user_id);
        self.metadata = metadata;
        Ok(())
    }

    /// Change the sample label without starting a new session.
    pub fn set_sample(&mut self, sample: &str) {
        self.metadata.sample = sample.to_string();
    }

    pub async fn calibrate(&mut self, mode: CalibrationMode) -> AppResult<CalibrationOutcome> {
        self.ensure_connected()?;
        let report = self
            .calibration
            .run(&mut self.engine, &mut self.register, &self.metadata, mode)
            .await?;
        let derived = self.publish(&report.record).await?;
        Ok(CalibrationOutcome { report, derived })
    }

    pub async fn measure(&mut self, mode: MeasurementMode) -> AppResult<MeasurementOutcome> {
        self.ensure_connected()?;
        let record = self
            .measurement
            .measure_cycle(
                &mut self.engine,
                &mut self.register,
                &self.metadata,
                mode,
                self.calibration.runs(),
            )
            .await?;
        let derived = self.publish(&record).await?;
        Ok(MeasurementOutcome { record, derived })
    }

    /// Repeated measurement, `cycles` clamped to `1..=10`.
    pub async fn averaged_measurement(&mut self, cycles: u32) -> AppResult<Vec<MeasurementOutcome>> {
        self.ensure_connected()?;
        let records = self
            .measurement
            .averaged_measurement(
                &mut self.engine,
                &mut self.register,
                &self.metadata,
                cycles,
                self.calibration.runs(),
            )
            .await?;
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            let derived = self.publish(&record).await?;
            outcomes.push(MeasurementOutcome { record, derived });
        }
        Ok(outcomes)
    }

    pub async fn read_table(&mut self) -> AppResult<()> {
        self.ensure_connected()?;
        self.register.read_table(&mut self.engine).await
    }

    /// Overwrite the device's EEPROM table; `false` if any value was refused.
    pub async fn write_table(&mut self) -> AppResult<bool> {
        self.ensure_connected()?;
        self.register.write_table(&mut self.engine).await
    }

    pub async fn toggle_led(&mut self, channel: usize, on: bool) -> AppResult<bool> {
        self.ensure_connected()?;
        self.engine.toggle_led(channel, on).await
    }

    /// Switch every LED on or off.
    pub async fn toggle_all_leds(&mut self, on: bool) -> AppResult<bool> {
        self.ensure_connected()?;
        let mut accepted = true;
        for channel in 0..CHANNEL_COUNT {
            accepted &= self.engine.toggle_led(channel, on).await?;
        }
        Ok(accepted)
    }

    /// Request that the running calibration or measurement stop before its next channel.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn calibrations(&self) -> u32 {
        self.calibration.runs()
    }

    pub fn measurements(&self) -> u32 {
        self.measurement.count()
    }

    pub fn register(&self) -> &ChannelRegister {
        &self.register
    }

    pub fn register_mut(&mut self) -> &mut ChannelRegister {
        &mut self.register
    }

    pub fn engine(&self) -> &ProtocolEngine<L> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut ProtocolEngine<L> {
        &mut self.engine
    }

    pub fn recorder(&self) -> &R {
        &self.recorder
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Close the link and flush the recorder.
    pub async fn shutdown(&mut self) -> AppResult<()> {
        self.engine.disconnect().await;
        self.recorder.shutdown().await
    }

    fn ensure_connected(&self) -> AppResult<()> {
        if self.engine.is_connected() {
            Ok(())
        } else {
            Err(DaqError::connection(
                &self.engine.settings().port,
                "device not connected",
            ))
        }
    }

    /// Record the raw values, then the absorbance if the transform accepts them.
    async fn publish(&mut self, record: &MeasurementRecord) -> AppResult<Derived> {
        self.recorder.record_raw(record).await?;
        match amplitude::apply_record(&mut self.register, record) {
            Ok(absorbance) => {
                self.recorder.record_absorbance(&absorbance).await?;
                Ok(Derived {
                    absorbance: Some(absorbance),
                    transform_error: None,
                })
            }
            Err(e @ DaqError::Domain(_)) => {
                warn!("Record {} not transformed: {}", record.label, e);
                Ok(Derived {
                    absorbance: None,
                    transform_error: Some(e),
                })
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::SimulatedInstrument;
    use crate::data::MemoryRecorder;
    use crate::metadata::MetadataBuilder;
    use tracing_test::traced_test;

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.serial.port = "SIM".into();
        settings.serial.command_timeout_ms = 50;
        settings.serial.reconnect_delay_ms = 5;
        settings
    }

    #[tokio::test(start_paused = true)]
    async fn test_operations_need_connection() {
        let mut photometer = Photometer::new(SimulatedInstrument::new(), MemoryRecorder::new(), &settings());
        assert!(matches!(
            photometer.calibrate(CalibrationMode::Level).await,
            Err(DaqError::Connection { .. })
        ));
        assert!(matches!(
            photometer.toggle_led(0, true).await,
            Err(DaqError::Connection { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_metadata_resets_counters() {
        let sim = SimulatedInstrument::new();
        for channel in 0..CHANNEL_COUNT {
            sim.set_signal(channel, 0, 1000);
        }
        let mut photometer = Photometer::new(sim, MemoryRecorder::new(), &settings());
        photometer.connect().await.unwrap();
        photometer
            .set_metadata(MetadataBuilder::new().user_id("op1").sample("water").build())
            .await
            .unwrap();

        photometer.calibrate(CalibrationMode::Level).await.unwrap();
        photometer.measure(MeasurementMode::Calibrated).await.unwrap();
        assert_eq!((photometer.calibrations(), photometer.measurements()), (1, 1));

        photometer
            .set_metadata(MetadataBuilder::new().user_id("op2").sample("milk").build())
            .await
            .unwrap();
        assert_eq!((photometer.calibrations(), photometer.measurements()), (0, 0));
        assert_eq!(photometer.recorder().metadata.as_ref().unwrap().user_id, "op2");
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_domain_error_skips_only_that_record() {
        // pulses below the background give a negative intensity
        let sim = SimulatedInstrument::with_curve(Box::new(|_: usize, _dac: u32| (100, 100, 200)));
        let mut photometer = Photometer::new(sim, MemoryRecorder::new(), &settings());
        photometer.connect().await.unwrap();
        photometer
            .set_metadata(MetadataBuilder::new().user_id("op1").sample("water").build())
            .await
            .unwrap();

        let outcome = photometer.calibrate(CalibrationMode::Level).await.unwrap();

        assert!(outcome.derived.absorbance.is_none());
        assert!(matches!(outcome.derived.transform_error, Some(DaqError::Domain(_))));
        assert_eq!(photometer.recorder().raw.len(), 1);
        assert!(photometer.recorder().absorbance.is_empty());
        assert_eq!(photometer.calibrations(), 1);
        assert!(logs_contain("REF_00000_0 not transformed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_all_leds() {
        let sim = SimulatedInstrument::new();
        let mut photometer = Photometer::new(sim.clone(), MemoryRecorder::new(), &settings());
        photometer.connect().await.unwrap();
        assert!(photometer.toggle_all_leds(true).await.unwrap());
        assert!((0..CHANNEL_COUNT).all(|c| sim.led(c)));
    }
}
