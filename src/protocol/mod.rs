//! Photometer wire protocol
//!
//! Commands are ASCII frames: `:` + two hex digits of opcode + channel/signal
//! nibbles + an optional 8-hex-digit payload, terminated by a carriage return.
//!
//! | Operation    | Request            | Reply                          |
//! |--------------|--------------------|--------------------------------|
//! | handshake    | `:00`              | `:55555555\r` (10 bytes)       |
//! | read signal  | `:02CS`            | `:03CS<8 hex>\r` (14 bytes)    |
//! | write signal | `:04CS<8 hex>`     | `:00\r` on success (4 bytes)   |
//! | measure      | `:07CC`            | `:08CC<4h><4h><4h>\r` (18 bytes) |
//! | toggle LED   | `:08CC<8 hex>`     | `:00\r` on success (4 bytes)   |
//!
//! `C` is the channel nibble, `S` the signal kind, `CC` the channel as two
//! hex digits.

pub mod engine;
pub mod frames;
pub mod history;

pub use engine::{EngineState, ProtocolEngine, Response};
pub use history::{CommunicationEntry, ExchangeOutcome, History};

use crate::channel::CHANNEL_COUNT;
use crate::error::{AppResult, DaqError};
use std::fmt;

/// Command start byte.
pub const SENTINEL: u8 = b':';

/// Number of per-channel signals the firmware stores.
pub const SIGNAL_KINDS: usize = 5;

/// Command opcodes understood by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Handshake = 0x00,
    ReadSignal = 0x02,
    WriteSignal = 0x04,
    Measure = 0x07,
    ToggleLed = 0x08,
}

/// Per-channel signal stored in the instrument's settings table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// LED drive level
    Dac = 0,
    /// Pulse on time (µs)
    Ton = 1,
    /// Pulse off time (µs)
    Toff = 2,
    /// Samples per measurement
    Samples = 3,
    /// DAC position
    DacPosition = 4,
}

impl SignalKind {
    pub const ALL: [SignalKind; SIGNAL_KINDS] = [
        SignalKind::Dac,
        SignalKind::Ton,
        SignalKind::Toff,
        SignalKind::Samples,
        SignalKind::DacPosition,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for SignalKind {
    type Error = DaqError;

    fn try_from(code: u8) -> AppResult<Self> {
        Self::ALL
            .get(usize::from(code))
            .copied()
            .ok_or_else(|| DaqError::InvalidArgument(format!("unknown signal kind {code}")))
    }
}

/// An immutable instrument command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    opcode: Opcode,
    channel: Option<u8>,
    kind: Option<SignalKind>,
    payload: Option<u32>,
}

impl Command {
    pub fn handshake() -> Self {
        Self {
            opcode: Opcode::Handshake,
            channel: None,
            kind: None,
            payload: None,
        }
    }

    pub fn read_signal(channel: usize, kind: SignalKind) -> AppResult<Self> {
        Ok(Self {
            opcode: Opcode::ReadSignal,
            channel: Some(check_channel(channel)?),
            kind: Some(kind),
            payload: None,
        })
    }

    pub fn write_signal(channel: usize, kind: SignalKind, value: u32) -> AppResult<Self> {
        Ok(Self {
            opcode: Opcode::WriteSignal,
            channel: Some(check_channel(channel)?),
            kind: Some(kind),
            payload: Some(value),
        })
    }

    pub fn measure(channel: usize) -> AppResult<Self> {
        Ok(Self {
            opcode: Opcode::Measure,
            channel: Some(check_channel(channel)?),
            kind: None,
            payload: None,
        })
    }

    pub fn toggle_led(channel: usize, on: bool) -> AppResult<Self> {
        Ok(Self {
            opcode: Opcode::ToggleLed,
            channel: Some(check_channel(channel)?),
            kind: None,
            payload: Some(u32::from(on)),
        })
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn channel(&self) -> Option<usize> {
        self.channel.map(usize::from)
    }

    /// Render the frame without its terminator.
    pub fn render(&self) -> String {
        let mut frame = format!(":{:02X}", self.opcode as u8);
        match (self.channel, self.kind) {
            (Some(channel), Some(kind)) => {
                frame.push_str(&format!("{:1X}{:1X}", channel, kind.code()));
            }
            (Some(channel), None) => frame.push_str(&format!("{channel:02X}")),
            (None, _) => {}
        }
        if let Some(payload) = self.payload {
            frame.push_str(&format!("{payload:08X}"));
        }
        frame
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

fn check_channel(channel: usize) -> AppResult<u8> {
    if channel < CHANNEL_COUNT {
        Ok(channel as u8)
    } else {
        Err(DaqError::InvalidArgument(format!(
            "channel {channel} out of range 0..{CHANNEL_COUNT}"
        )))
    }
}
