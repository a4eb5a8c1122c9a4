//! Channel calibration
//!
//! Two modes establish the absorbance references:
//!
//! - **Level**: measure each selected channel as it is and keep pulse 1 as
//!   the reference. The DAC is never written.
//! - **Target**: search the DAC setting that brings pulse 1 within
//!   `tolerance` of a requested ADC value. A bisection over
//!   `[dac_min, dac_max]` does the coarse work; if that stalls outside the
//!   tolerance, a short linear scan of up to `refine_window` steps towards
//!   the target picks the closest setting, which is then written back.
//!
//! Channels run in ascending `order`; disabled channels are skipped and show
//! up as zero triples in the run's record. Cancellation is checked before
//! each channel, never in the middle of one.

use crate::adapters::Link;
use crate::channel::{decimal, AdcReading, ChannelRegister, WAVELENGTHS};
use crate::config::CalibrationSettings;
use crate::error::{AppResult, DaqError};
use crate::measurement::{
    level_calibration_label, sweep, target_calibration_label, tolerate, MeasurementRecord,
};
use crate::metadata::Metadata;
use crate::protocol::{ProtocolEngine, SignalKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationMode {
    Level,
    /// Target pulse 1 reading, in ADC counts.
    Target(u16),
}

/// How a channel's calibration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Target mode reached the best setting the search could find.
    Converged,
    /// Target mode finished outside tolerance, either out of bisection
    /// cycles or stalled at the DAC resolution with the refine scan unable
    /// to close the gap.
    Exhausted,
    LevelCaptured,
    /// The instrument did not answer and the policy is `continue`.
    Unanswered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelCalibration {
    pub channel: usize,
    pub state: ChannelState,
    /// Final DAC setting; unchanged in level mode.
    pub dac: u32,
    pub reading: AdcReading,
    /// Bisection cycles spent (0 in level mode).
    pub cycles: u32,
}

/// One calibration invocation: what to do and to which channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationRun {
    pub mode: CalibrationMode,
    pub channels: Vec<usize>,
    pub sequence: u32,
}

impl CalibrationRun {
    pub fn label(&self) -> String {
        match self.mode {
            CalibrationMode::Level => level_calibration_label(self.sequence),
            CalibrationMode::Target(target) => target_calibration_label(target, self.sequence),
        }
    }
}

#[derive(Debug)]
pub struct CalibrationReport {
    pub run: CalibrationRun,
    pub channels: Vec<ChannelCalibration>,
    /// Non-fatal problems: unconverged channels, skipped channels.
    pub warnings: Vec<DaqError>,
    /// Reference-labelled record of the final readings.
    pub record: MeasurementRecord,
}

impl CalibrationReport {
    pub fn state_of(&self, channel: usize) -> Option<ChannelState> {
        self.channels
            .iter()
            .find(|c| c.channel == channel)
            .map(|c| c.state)
    }
}

/// Cooperative cancellation shared between a controller and the running engine.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// `Aborted` if cancellation was requested; the flag is cleared so the
    /// next run starts fresh.
    pub(crate) fn check(&self, next_channel: usize) -> AppResult<()> {
        if self.0.swap(false, Ordering::SeqCst) {
            info!("Run cancelled before channel {}", next_channel);
            return Err(DaqError::Aborted(format!(
                "cancelled before channel {next_channel}"
            )));
        }
        Ok(())
    }
}

pub struct CalibrationEngine {
    settings: CalibrationSettings,
    runs: u32,
    cancel: CancelFlag,
}

impl CalibrationEngine {
    pub fn new(settings: CalibrationSettings, cancel: CancelFlag) -> Self {
        Self {
            settings,
            runs: 0,
            cancel,
        }
    }

    /// Completed calibration runs.
    pub fn runs(&self) -> u32 {
        self.runs
    }

    pub fn reset_runs(&mut self) {
        self.runs = 0;
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn settings(&self) -> &CalibrationSettings {
        &self.settings
    }

    pub fn plan(&self, register: &ChannelRegister, mode: CalibrationMode) -> CalibrationRun {
        CalibrationRun {
            mode,
            channels: register.enabled_in_order(),
            sequence: self.runs,
        }
    }

    /// Calibrate every enabled channel and return the run's report.
    ///
    /// The run counter only advances when all channels were processed.
    pub async fn run<L: Link>(
        &mut self,
        engine: &mut ProtocolEngine<L>,
        register: &mut ChannelRegister,
        metadata: &Metadata,
        mode: CalibrationMode,
    ) -> AppResult<CalibrationReport> {
        metadata.validate()?;
        let run = self.plan(register, mode);
        info!(
            "Calibration {} ({:?}) over channels {:?}",
            run.label(),
            mode,
            run.channels
        );

        let mut record = MeasurementRecord::new(metadata, "", run.label());
        let (channels, warnings) = match mode {
            CalibrationMode::Level => self.level(engine, register, &run.channels).await?,
            CalibrationMode::Target(target) => {
                self.target(engine, register, &run.channels, target).await?
            }
        };
        for result in &channels {
            record.readings[result.channel] = result.reading;
        }

        self.runs += 1;
        info!(
            "Calibration {} finished with {} warning(s)",
            run.label(),
            warnings.len()
        );
        Ok(CalibrationReport {
            run,
            channels,
            warnings,
            record,
        })
    }

    async fn level<L: Link>(
        &self,
        engine: &mut ProtocolEngine<L>,
        register: &mut ChannelRegister,
        channels: &[usize],
    ) -> AppResult<(Vec<ChannelCalibration>, Vec<DaqError>)> {
        let sweep = sweep(engine, register, channels, &self.cancel).await?;
        let mut warnings = sweep.warnings;
        let mut results = Vec::with_capacity(channels.len());

        for &channel in channels {
            let reading = sweep.readings[channel];
            let dac = register.get(channel).map_or(0, |c| c.dac);
            let state = if sweep.answered.contains(&channel) {
                self.adopt_reference(register, channel, reading, &mut warnings);
                ChannelState::LevelCaptured
            } else {
                ChannelState::Unanswered
            };
            results.push(ChannelCalibration {
                channel,
                state,
                dac,
                reading,
                cycles: 0,
            });
        }
        Ok((results, warnings))
    }

    async fn target<L: Link>(
        &self,
        engine: &mut ProtocolEngine<L>,
        register: &mut ChannelRegister,
        channels: &[usize],
        target: u16,
    ) -> AppResult<(Vec<ChannelCalibration>, Vec<DaqError>)> {
        let mut warnings = Vec::new();
        let mut results = Vec::with_capacity(channels.len());

        for &channel in channels {
            self.cancel.check(channel)?;
            let result = match self.search(engine, channel, target).await {
                Ok(result) => result,
                Err(e) => {
                    let warning = tolerate(engine, e)?;
                    warn!("Channel {} skipped: {}", channel, warning);
                    warnings.push(warning);
                    results.push(ChannelCalibration {
                        channel,
                        state: ChannelState::Unanswered,
                        dac: register.get(channel).map_or(0, |c| c.dac),
                        reading: AdcReading::default(),
                        cycles: 0,
                    });
                    continue;
                }
            };

            if result.state == ChannelState::Exhausted {
                let warning = DaqError::CalibrationNotConverged {
                    channel,
                    cycles: result.cycles,
                    last_reading: result.reading.pulse1,
                    target,
                };
                warn!("{}", warning);
                warnings.push(warning);
            }
            if let Some(record) = register.get_mut(channel) {
                record.dac = result.dac;
            }
            register.record_reading(channel, result.reading)?;
            self.adopt_reference(register, channel, result.reading, &mut warnings);
            results.push(result);
        }
        Ok((results, warnings))
    }

    /// Bisection followed by the linear refine scan for one channel.
    async fn search<L: Link>(
        &self,
        engine: &mut ProtocolEngine<L>,
        channel: usize,
        target: u16,
    ) -> AppResult<ChannelCalibration> {
        let s = &self.settings;
        let target_counts = i32::from(target);
        let tolerance = i32::from(s.tolerance);
        let distance = |reading: &AdcReading| (i32::from(reading.pulse1) - target_counts).abs();

        let mut dac = engine.read_signal(channel, SignalKind::Dac).await?;
        let mut reading = engine.measure(channel).await?;
        let (mut lo, mut hi) = (s.dac_min, s.dac_max);
        let mut cycles = 0;

        while distance(&reading) > tolerance && cycles < s.max_cycles {
            if i32::from(reading.pulse1) < target_counts {
                lo = lo.max(dac.min(hi));
            } else {
                hi = hi.min(dac.max(lo));
            }
            let next = lo + (hi - lo) / 2;
            if next.abs_diff(dac) <= s.min_step {
                debug!("Channel {}: bisection stalled at DAC {}", channel, dac);
                break;
            }
            dac = next;
            engine.write_signal(channel, SignalKind::Dac, dac).await?;
            reading = engine.measure(channel).await?;
            cycles += 1;
            debug!(
                "Channel {}: cycle {} DAC {} -> ADC {}",
                channel, cycles, dac, reading.pulse1
            );
        }

        if distance(&reading) > tolerance && cycles < s.max_cycles {
            (dac, reading) = self.refine(engine, channel, target, dac, reading).await?;
        }

        let state = if distance(&reading) > tolerance {
            ChannelState::Exhausted
        } else {
            ChannelState::Converged
        };
        info!(
            "Channel {} ({} nm): DAC {} ADC {} target {} ({:?})",
            channel, WAVELENGTHS[channel], dac, reading.pulse1, target, state
        );
        Ok(ChannelCalibration {
            channel,
            state,
            dac,
            reading,
            cycles,
        })
    }

    /// Step one DAC unit at a time towards the target, keep the closest reading,
    /// and stop once a reading past the target is worse than the best so far.
    async fn refine<L: Link>(
        &self,
        engine: &mut ProtocolEngine<L>,
        channel: usize,
        target: u16,
        start_dac: u32,
        start: AdcReading,
    ) -> AppResult<(u32, AdcReading)> {
        let s = &self.settings;
        let target_counts = i32::from(target);
        let distance = |reading: &AdcReading| (i32::from(reading.pulse1) - target_counts).abs();
        let below = i32::from(start.pulse1) < target_counts;

        let candidates: Vec<u32> = if below {
            (start_dac + 1..=start_dac.saturating_add(s.refine_window).min(s.dac_max)).collect()
        } else {
            (start_dac.saturating_sub(s.refine_window).max(s.dac_min)..start_dac)
                .rev()
                .collect()
        };

        let mut best = (distance(&start), start_dac, start);
        let mut written = false;
        for dac in candidates {
            engine.write_signal(channel, SignalKind::Dac, dac).await?;
            written = true;
            let reading = engine.measure(channel).await?;
            let d = distance(&reading);
            let past_target = if below {
                i32::from(reading.pulse1) > target_counts
            } else {
                i32::from(reading.pulse1) < target_counts
            };
            if d < best.0 {
                best = (d, dac, reading);
            } else if past_target {
                break;
            }
        }

        let (_, dac, mut reading) = best;
        if written {
            engine.write_signal(channel, SignalKind::Dac, dac).await?;
            reading = engine.measure(channel).await?;
        }
        debug!("Channel {}: refined to DAC {} ADC {}", channel, dac, reading.pulse1);
        Ok((dac, reading))
    }

    /// Pulse 1 becomes the reference; a zero reading keeps the old one.
    fn adopt_reference(
        &self,
        register: &mut ChannelRegister,
        channel: usize,
        reading: AdcReading,
        warnings: &mut Vec<DaqError>,
    ) {
        if let Err(e) = register.set_reference(channel, decimal(reading.pulse1)) {
            warn!("Channel {} keeps its previous reference: {}", channel, e);
            warnings.push(e);
        }
    }
}
