//! Channel register
//!
//! The instrument has 16 optical channels, one per LED wavelength. The
//! register is the single owned table of their settings, last raw readings
//! and absorbance references. Calibration and the amplitude transform borrow
//! it explicitly; nothing else holds channel state.
//!
//! The per-channel settings (DAC, pulse timing, sample count, DAC position)
//! live in the instrument's EEPROM and are moved to and from the register with
//! [`ChannelRegister::read_table`] and [`ChannelRegister::write_table`].

use crate::adapters::Link;
use crate::error::{AppResult, DaqError};
use crate::protocol::{ProtocolEngine, SignalKind};
use dashu::float::DBig;
use dashu::integer::IBig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Number of optical channels on the board.
pub const CHANNEL_COUNT: usize = 16;

/// LED wavelength of each channel, in nm.
pub const WAVELENGTHS: [u16; CHANNEL_COUNT] = [
    660, 680, 700, 720, 735, 750, 770, 780, 810, 830, 850, 870, 890, 910, 940, 970,
];

/// Significant decimal digits carried by references and absorbance values.
pub const PRECISION: usize = 66;

/// Integer converted to a decimal at working precision.
pub fn decimal(value: impl Into<IBig>) -> DBig {
    DBig::from_parts(value.into(), 0)
        .with_precision(PRECISION)
        .value()
}

/// Raw detector counts of one measurement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdcReading {
    pub pulse1: u16,
    pub pulse2: u16,
    pub background: u16,
}

impl AdcReading {
    pub fn is_zero(&self) -> bool {
        self.pulse1 == 0 && self.pulse2 == 0 && self.background == 0
    }
}

/// Persistable subset of a channel's configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSettings {
    pub enabled: bool,
    pub order: u32,
    pub dac: u32,
    pub dac_position: u32,
    pub ton: u32,
    pub toff: u32,
    pub samples: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRecord {
    pub index: usize,
    pub wavelength: u16,
    pub enabled: bool,
    /// Processing order; lower runs first.
    pub order: u32,
    pub dac: u32,
    pub dac_position: u32,
    /// Pulse on time, µs
    pub ton: u32,
    /// Pulse off time, µs
    pub toff: u32,
    pub samples: u32,
    pub last_reading: AdcReading,
    reference: DBig,
}

impl ChannelRecord {
    fn new(index: usize) -> Self {
        Self {
            index,
            wavelength: WAVELENGTHS[index],
            enabled: true,
            order: index as u32 + 1,
            dac: 0,
            dac_position: 0,
            ton: 0,
            toff: 0,
            samples: 0,
            last_reading: AdcReading::default(),
            reference: decimal(1),
        }
    }

    /// Absorbance reference. Always strictly positive.
    pub fn reference(&self) -> &DBig {
        &self.reference
    }

    pub fn settings(&self) -> ChannelSettings {
        ChannelSettings {
            enabled: self.enabled,
            order: self.order,
            dac: self.dac,
            dac_position: self.dac_position,
            ton: self.ton,
            toff: self.toff,
            samples: self.samples,
        }
    }

    pub fn apply_settings(&mut self, settings: &ChannelSettings) {
        self.enabled = settings.enabled;
        self.order = settings.order;
        self.dac = settings.dac;
        self.dac_position = settings.dac_position;
        self.ton = settings.ton;
        self.toff = settings.toff;
        self.samples = settings.samples;
    }

    fn signal(&self, kind: SignalKind) -> u32 {
        match kind {
            SignalKind::Dac => self.dac,
            SignalKind::Ton => self.ton,
            SignalKind::Toff => self.toff,
            SignalKind::Samples => self.samples,
            SignalKind::DacPosition => self.dac_position,
        }
    }

    fn set_signal(&mut self, kind: SignalKind, value: u32) {
        match kind {
            SignalKind::Dac => self.dac = value,
            SignalKind::Ton => self.ton = value,
            SignalKind::Toff => self.toff = value,
            SignalKind::Samples => self.samples = value,
            SignalKind::DacPosition => self.dac_position = value,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRegister {
    channels: Vec<ChannelRecord>,
}

impl Default for ChannelRegister {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegister {
    /// All channels enabled, ordered by index, reference 1.
    pub fn new() -> Self {
        Self {
            channels: (0..CHANNEL_COUNT).map(ChannelRecord::new).collect(),
        }
    }

    pub fn get(&self, channel: usize) -> Option<&ChannelRecord> {
        self.channels.get(channel)
    }

    pub fn get_mut(&mut self, channel: usize) -> Option<&mut ChannelRecord> {
        self.channels.get_mut(channel)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelRecord> {
        self.channels.iter()
    }

    /// Enabled channel indices by ascending `order`, ties broken by index.
    pub fn enabled_in_order(&self) -> Vec<usize> {
        let mut enabled: Vec<&ChannelRecord> = self.channels.iter().filter(|c| c.enabled).collect();
        enabled.sort_by_key(|c| (c.order, c.index));
        enabled.into_iter().map(|c| c.index).collect()
    }

    /// Replace a channel's reference; zero and negative values are rejected.
    pub fn set_reference(&mut self, channel: usize, reference: DBig) -> AppResult<()> {
        if reference <= DBig::ZERO {
            return Err(DaqError::Domain(format!(
                "reference for channel {channel} must be positive, got {reference}"
            )));
        }
        let record = self.record_mut(channel)?;
        record.reference = reference.with_precision(PRECISION).value();
        Ok(())
    }

    pub fn references(&self) -> Vec<DBig> {
        self.channels.iter().map(|c| c.reference.clone()).collect()
    }

    pub fn record_reading(&mut self, channel: usize, reading: AdcReading) -> AppResult<()> {
        self.record_mut(channel)?.last_reading = reading;
        Ok(())
    }

    pub fn settings_table(&self) -> Vec<ChannelSettings> {
        self.channels.iter().map(ChannelRecord::settings).collect()
    }

    /// Apply a stored settings table; extra rows are ignored.
    pub fn apply_settings_table(&mut self, table: &[ChannelSettings]) {
        for (record, settings) in self.channels.iter_mut().zip(table) {
            record.apply_settings(settings);
        }
    }

    /// Load DAC, Ton, Toff, Samples and DAC position of one channel from the device.
    pub async fn read_channel_settings<L: Link>(
        &mut self,
        engine: &mut ProtocolEngine<L>,
        channel: usize,
    ) -> AppResult<()> {
        self.record_mut(channel)?;
        for kind in SignalKind::ALL {
            let value = engine.read_signal(channel, kind).await?;
            self.record_mut(channel)?.set_signal(kind, value);
        }
        debug!("Read settings of channel {}", channel);
        Ok(())
    }

    /// Store one channel's settings on the device. `false` if any write was refused.
    pub async fn write_channel_settings<L: Link>(
        &self,
        engine: &mut ProtocolEngine<L>,
        channel: usize,
    ) -> AppResult<bool> {
        let record = self.record(channel)?;
        let mut accepted = true;
        for kind in SignalKind::ALL {
            if !engine.write_signal(channel, kind, record.signal(kind)).await? {
                warn!("Device refused {:?} = {} on channel {}", kind, record.signal(kind), channel);
                accepted = false;
            }
        }
        Ok(accepted)
    }

    pub async fn read_table<L: Link>(&mut self, engine: &mut ProtocolEngine<L>) -> AppResult<()> {
        info!("Reading channel table from device");
        for channel in 0..CHANNEL_COUNT {
            self.read_channel_settings(engine, channel).await?;
        }
        Ok(())
    }

    /// Overwrite the device's EEPROM table with the register's settings.
    pub async fn write_table<L: Link>(&self, engine: &mut ProtocolEngine<L>) -> AppResult<bool> {
        info!("Writing channel table to device");
        let mut accepted = true;
        for channel in 0..CHANNEL_COUNT {
            accepted &= self.write_channel_settings(engine, channel).await?;
        }
        Ok(accepted)
    }

    fn record(&self, channel: usize) -> AppResult<&ChannelRecord> {
        self.channels
            .get(channel)
            .ok_or_else(|| DaqError::InvalidArgument(format!("no channel {channel}")))
    }

    fn record_mut(&mut self, channel: usize) -> AppResult<&mut ChannelRecord> {
        self.channels
            .get_mut(channel)
            .ok_or_else(|| DaqError::InvalidArgument(format!("no channel {channel}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::SimulatedInstrument;
    use crate::config::SerialSettings;

    #[test]
    fn test_new_register_defaults() {
        let register = ChannelRegister::new();
        assert_eq!(register.iter().count(), CHANNEL_COUNT);
        assert_eq!(register.get(4).unwrap().wavelength, 735);
        assert_eq!(register.get(15).unwrap().wavelength, 970);
        assert!(register.get(16).is_none());
        assert!(register.references().iter().all(|r| *r == decimal(1)));
    }

    #[test]
    fn test_enabled_in_order() {
        let mut register = ChannelRegister::new();
        for record in 0..CHANNEL_COUNT {
            register.get_mut(record).unwrap().enabled = false;
        }
        let picks = [(9, 1), (2, 3), (5, 1), (0, 2)];
        for (channel, order) in picks {
            let record = register.get_mut(channel).unwrap();
            record.enabled = true;
            record.order = order;
        }
        assert_eq!(register.enabled_in_order(), vec![5, 9, 0, 2]);
    }

    #[test]
    fn test_reference_must_be_positive() {
        let mut register = ChannelRegister::new();
        assert!(matches!(
            register.set_reference(0, DBig::ZERO),
            Err(DaqError::Domain(_))
        ));
        assert!(register.set_reference(0, -decimal(5)).is_err());
        register.set_reference(0, decimal(12000)).unwrap();
        assert_eq!(*register.get(0).unwrap().reference(), decimal(12000));
        assert!(register.set_reference(16, decimal(1)).is_err());
    }

    #[test]
    fn test_settings_table_round_trip_through_json() {
        let mut register = ChannelRegister::new();
        register.get_mut(3).unwrap().dac = 1500;
        register.get_mut(3).unwrap().enabled = false;
        let json = serde_json::to_string(&register.settings_table()).unwrap();

        let table: Vec<ChannelSettings> = serde_json::from_str(&json).unwrap();
        let mut restored = ChannelRegister::new();
        restored.apply_settings_table(&table);
        assert_eq!(restored.get(3).unwrap().dac, 1500);
        assert!(!restored.get(3).unwrap().enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_table_write_then_read() {
        let settings = SerialSettings {
            port: "SIM".into(),
            ..SerialSettings::default()
        };
        let sim = SimulatedInstrument::new();
        let mut engine = ProtocolEngine::new(sim.clone(), &settings);
        engine.connect().await.unwrap();

        let mut register = ChannelRegister::new();
        {
            let record = register.get_mut(6).unwrap();
            record.dac = 2048;
            record.ton = 100;
            record.toff = 900;
            record.samples = 64;
            record.dac_position = 3;
        }
        assert!(register.write_table(&mut engine).await.unwrap());
        assert_eq!(sim.signal(6, 0), 2048);
        assert_eq!(sim.signal(6, 3), 64);

        let mut fresh = ChannelRegister::new();
        fresh.read_table(&mut engine).await.unwrap();
        assert_eq!(fresh.get(6).unwrap().settings(), register.get(6).unwrap().settings());
    }
}
