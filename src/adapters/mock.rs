//! In-process simulation of the photometer firmware.
//!
//! `SimulatedInstrument` implements [`Link`] and answers the same command set
//! as the real board, so the protocol and calibration engines can be exercised
//! without hardware. Its state is shared between clones: keep one clone as a
//! handle to inspect or script the device after handing the other to an engine.

use super::Link;
use crate::channel::CHANNEL_COUNT;
use crate::protocol::SIGNAL_KINDS;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Maps a channel's DAC setting to its `(pulse1, pulse2, background)` reading.
pub type ResponseCurve = Box<dyn Fn(usize, u32) -> (u16, u16, u16) + Send>;

struct DeviceState {
    open: bool,
    port: String,
    baud_rate: u32,
    fail_open: bool,
    open_count: u32,
    input: Vec<u8>,
    output: VecDeque<u8>,
    /// Bytes of `output` the reader can currently see.
    released: usize,
    trickle: Option<u32>,
    trickle_polls: u32,
    signals: [[u32; SIGNAL_KINDS]; CHANNEL_COUNT],
    leds: [bool; CHANNEL_COUNT],
    curve: ResponseCurve,
    scripted: VecDeque<Vec<u8>>,
    drop_replies: u32,
    strip_terminator: bool,
    truncate_next: Option<usize>,
    close_on_write: bool,
    received: Vec<String>,
    polls: u64,
}

/// Simulated 16-channel photometer behind a [`Link`].
#[derive(Clone)]
pub struct SimulatedInstrument {
    state: Arc<Mutex<DeviceState>>,
}

impl Default for SimulatedInstrument {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedInstrument {
    /// A closed simulator whose readings follow `adc = 3 * dac`.
    pub fn new() -> Self {
        Self::with_curve(Box::new(|_: usize, dac: u32| {
            let adc = (dac.saturating_mul(3)).min(u32::from(u16::MAX)) as u16;
            (adc, adc, 0)
        }))
    }

    pub fn with_curve(curve: ResponseCurve) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                open: false,
                port: String::new(),
                baud_rate: 0,
                fail_open: false,
                open_count: 0,
                input: Vec::new(),
                output: VecDeque::new(),
                released: 0,
                trickle: None,
                trickle_polls: 0,
                signals: [[0; SIGNAL_KINDS]; CHANNEL_COUNT],
                leds: [false; CHANNEL_COUNT],
                curve,
                scripted: VecDeque::new(),
                drop_replies: 0,
                strip_terminator: false,
                truncate_next: None,
                close_on_write: false,
                received: Vec::new(),
                polls: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the DAC to reading response curve.
    pub fn set_curve(&self, curve: ResponseCurve) {
        self.lock().curve = curve;
    }

    /// Set a stored signal value directly (DAC, Ton, Toff, Samples, DAC position).
    pub fn set_signal(&self, channel: usize, kind: usize, value: u32) {
        self.lock().signals[channel][kind] = value;
    }

    pub fn signal(&self, channel: usize, kind: usize) -> u32 {
        self.lock().signals[channel][kind]
    }

    pub fn led(&self, channel: usize) -> bool {
        self.lock().leds[channel]
    }

    /// Answer the next command with these exact bytes instead of the computed reply.
    pub fn script_reply(&self, reply: impl Into<Vec<u8>>) {
        self.lock().scripted.push_back(reply.into());
    }

    /// Swallow the next `count` commands without answering.
    pub fn drop_next_replies(&self, count: u32) {
        self.lock().drop_replies = count;
    }

    /// Send replies without their trailing carriage return.
    pub fn strip_terminator(&self, strip: bool) {
        self.lock().strip_terminator = strip;
    }

    /// Cut the next reply down to `len` bytes.
    pub fn truncate_next_reply(&self, len: usize) {
        self.lock().truncate_next = Some(len);
    }

    /// Release reply bytes one at a time, one byte every `polls_per_byte`
    /// availability polls. `0` turns trickling off.
    pub fn trickle_replies(&self, polls_per_byte: u32) {
        let mut state = self.lock();
        state.trickle = (polls_per_byte > 0).then_some(polls_per_byte);
        state.trickle_polls = 0;
    }

    /// Make every subsequent `open` fail.
    pub fn fail_open(&self, fail: bool) {
        self.lock().fail_open = fail;
    }

    /// Drop the connection as soon as the next command is written.
    pub fn close_on_next_write(&self) {
        self.lock().close_on_write = true;
    }

    pub fn open_count(&self) -> u32 {
        self.lock().open_count
    }

    /// Number of availability polls seen so far.
    pub fn poll_count(&self) -> u64 {
        self.lock().polls
    }

    /// Commands received, without terminators.
    pub fn received_commands(&self) -> Vec<String> {
        self.lock().received.clone()
    }
}

impl DeviceState {
    fn ensure_open(&self) -> AppResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(DaqError::connection(&self.port, "simulated link is closed"))
        }
    }

    fn process_input(&mut self) {
        while let Some(pos) = self.input.iter().position(|&b| b == b'\r' || b == b'\n') {
            let line: Vec<u8> = self.input.drain(..=pos).collect();
            let command = String::from_utf8_lossy(&line).trim().to_string();
            if command.is_empty() {
                continue;
            }
            self.received.push(command.clone());

            if self.drop_replies > 0 {
                self.drop_replies -= 1;
                continue;
            }

            let mut reply = match self.scripted.pop_front() {
                Some(reply) => reply,
                None => self.respond(&command).into_bytes(),
            };
            if self.strip_terminator && reply.last() == Some(&b'\r') {
                reply.pop();
            }
            if let Some(len) = self.truncate_next.take() {
                reply.truncate(len);
            }
            self.output.extend(reply);
        }
    }

    fn respond(&mut self, command: &str) -> String {
        let hex = |s: Option<&str>| s.and_then(|s| u32::from_str_radix(s, 16).ok());

        if command == ":00" {
            return ":55555555\r".to_string();
        }
        if let Some(rest) = command.strip_prefix(":02") {
            if let (Some(ch), Some(kind)) = (hex(rest.get(0..1)), hex(rest.get(1..2))) {
                let (ch, kind) = (ch as usize, kind as usize);
                if ch < CHANNEL_COUNT && kind < SIGNAL_KINDS {
                    return format!(":03{ch:1X}{kind:1X}{:08X}\r", self.signals[ch][kind]);
                }
            }
        } else if let Some(rest) = command.strip_prefix(":04") {
            if let (Some(ch), Some(kind), Some(value)) =
                (hex(rest.get(0..1)), hex(rest.get(1..2)), hex(rest.get(2..10)))
            {
                let (ch, kind) = (ch as usize, kind as usize);
                if ch < CHANNEL_COUNT && kind < SIGNAL_KINDS {
                    self.signals[ch][kind] = value;
                    return ":00\r".to_string();
                }
            }
        } else if let Some(rest) = command.strip_prefix(":07") {
            if let Some(ch) = hex(rest.get(0..2)).map(|c| c as usize) {
                if ch < CHANNEL_COUNT {
                    let (p1, p2, bg) = (self.curve)(ch, self.signals[ch][0]);
                    return format!(":08{ch:02X}{p1:04X}{p2:04X}{bg:04X}\r");
                }
            }
        } else if let Some(rest) = command.strip_prefix(":080") {
            if let (Some(ch), Some(state)) = (hex(rest.get(0..1)), hex(rest.get(1..9))) {
                self.leds[ch as usize] = state != 0;
                return ":00\r".to_string();
            }
        }
        ":FF\r".to_string()
    }
}

#[async_trait]
impl Link for SimulatedInstrument {
    async fn open(&mut self, port: &str, baud_rate: u32) -> AppResult<()> {
        let mut state = self.lock();
        if state.fail_open {
            state.open = false;
            return Err(DaqError::connection(port, "simulated device unavailable"));
        }
        state.open = true;
        state.port = port.to_string();
        state.baud_rate = baud_rate;
        state.open_count += 1;
        state.input.clear();
        state.output.clear();
        state.released = 0;
        state.trickle_polls = 0;
        Ok(())
    }

    async fn close(&mut self) {
        self.lock().open = false;
    }

    fn is_open(&self) -> bool {
        self.lock().open
    }

    fn port_name(&self) -> &str {
        // The port lives behind the shared lock; a fixed label is enough for logs.
        "SIMULATED"
    }

    fn baud_rate(&self) -> u32 {
        self.lock().baud_rate
    }

    async fn write(&mut self, bytes: &[u8]) -> AppResult<()> {
        let mut state = self.lock();
        state.ensure_open()?;
        if state.close_on_write {
            state.close_on_write = false;
            state.open = false;
            return Ok(());
        }
        state.input.extend_from_slice(bytes);
        state.process_input();
        Ok(())
    }

    async fn bytes_available(&mut self) -> AppResult<usize> {
        let mut state = self.lock();
        state.ensure_open()?;
        state.polls += 1;
        match state.trickle {
            Some(every) => {
                state.trickle_polls += 1;
                if state.trickle_polls >= every {
                    state.trickle_polls = 0;
                    state.released = (state.released + 1).min(state.output.len());
                }
            }
            None => state.released = state.output.len(),
        }
        Ok(state.released)
    }

    async fn read(&mut self, max: usize) -> AppResult<Vec<u8>> {
        let mut state = self.lock();
        state.ensure_open()?;
        let n = max.min(state.released);
        state.released -= n;
        Ok(state.output.drain(..n).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exchange(sim: &mut SimulatedInstrument, command: &str) -> Vec<u8> {
        sim.write(command.as_bytes()).await.unwrap();
        let n = sim.bytes_available().await.unwrap();
        sim.read(n).await.unwrap()
    }

    #[tokio::test]
    async fn test_handshake_reply() {
        let mut sim = SimulatedInstrument::new();
        sim.open("SIM", 115_200).await.unwrap();
        assert_eq!(exchange(&mut sim, ":00\r").await, b":55555555\r".to_vec());
    }

    #[tokio::test]
    async fn test_signal_write_then_read() {
        let mut sim = SimulatedInstrument::new();
        sim.open("SIM", 115_200).await.unwrap();
        assert_eq!(exchange(&mut sim, ":04A0000004D2\r").await, b":00\r".to_vec());
        assert_eq!(sim.signal(10, 0), 1234);
        assert_eq!(
            exchange(&mut sim, ":02A0\r").await,
            b":03A0000004D2\r".to_vec()
        );
    }

    #[tokio::test]
    async fn test_measure_follows_curve() {
        let mut sim = SimulatedInstrument::new();
        sim.open("SIM", 115_200).await.unwrap();
        sim.set_signal(3, 0, 1000);
        // 3 * 1000 = 3000 = 0x0BB8
        assert_eq!(
            exchange(&mut sim, ":0703\r").await,
            b":08030BB80BB80000\r".to_vec()
        );
    }

    #[tokio::test]
    async fn test_led_toggle() {
        let mut sim = SimulatedInstrument::new();
        sim.open("SIM", 115_200).await.unwrap();
        assert_eq!(exchange(&mut sim, ":080700000001\r").await, b":00\r".to_vec());
        assert!(sim.led(7));
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let mut sim = SimulatedInstrument::new();
        sim.open("SIM", 115_200).await.unwrap();
        assert_eq!(exchange(&mut sim, ":99\r").await, b":FF\r".to_vec());
    }

    #[tokio::test]
    async fn test_trickled_reply_arrives_byte_by_byte() {
        let mut sim = SimulatedInstrument::new();
        sim.open("SIM", 115_200).await.unwrap();
        sim.trickle_replies(2);
        sim.write(b":00\r").await.unwrap();

        assert_eq!(sim.bytes_available().await.unwrap(), 0);
        assert_eq!(sim.bytes_available().await.unwrap(), 1);
        assert_eq!(sim.read(8).await.unwrap(), b":".to_vec());
        assert_eq!(sim.bytes_available().await.unwrap(), 0);
        assert_eq!(sim.bytes_available().await.unwrap(), 1);
        assert_eq!(sim.read(8).await.unwrap(), b"5".to_vec());
    }

    #[tokio::test]
    async fn test_truncated_reply() {
        let mut sim = SimulatedInstrument::new();
        sim.open("SIM", 115_200).await.unwrap();
        sim.truncate_next_reply(5);
        assert_eq!(exchange(&mut sim, ":0703\r").await, b":0803".to_vec());
        assert_eq!(exchange(&mut sim, ":0703\r").await, b":0803000000000000\r".to_vec());
    }

    #[tokio::test]
    async fn test_closed_link_rejects_io() {
        let mut sim = SimulatedInstrument::new();
        assert!(sim.write(b":00\r").await.is_err());
        sim.fail_open(true);
        assert!(sim.open("SIM", 115_200).await.is_err());
        assert!(!sim.is_open());
    }
}
