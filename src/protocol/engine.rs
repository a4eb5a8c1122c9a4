//! Command/response engine on top of a [`Link`].
//!
//! The engine writes one framed command, then polls the link until the reply
//! is complete. Replies carry no length prefix, so completion is inferred:
//! either the accumulated bytes end with the terminator, or data has started
//! arriving and then nothing new shows up for `idle_threshold` consecutive
//! polls. Whichever fires first wins.
//!
//! A failed attempt (timeout, partial reply, dead link) is retried with a
//! budget four times larger than the previous one, after closing and reopening
//! the link. What happens once the attempts run out is decided by the
//! configured [`NoResponseAction`].

use super::frames;
use super::history::{ExchangeOutcome, History};
use super::{Command, SignalKind, SENTINEL};
use crate::adapters::Link;
use crate::channel::AdcReading;
use crate::config::{NoResponseAction, SerialSettings};
use crate::error::{AppResult, DaqError};
use crate::error_recovery::{RetryDecision, RetryPolicy};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, trace, warn};

/// A reply as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub raw: Vec<u8>,
    /// `false` when the bytes are whatever arrived before the last attempt ran out.
    pub complete: bool,
    pub elapsed: Duration,
    pub attempts: u32,
}

impl Response {
    /// The reply bytes, or a `Timeout` error if the reply never completed.
    pub fn into_complete(self, command: &str) -> AppResult<Vec<u8>> {
        if self.complete {
            Ok(self.raw)
        } else {
            Err(DaqError::Timeout {
                command: command.to_string(),
                attempts: self.attempts,
                elapsed: self.elapsed,
                partial: self.raw,
            })
        }
    }
}

/// Where the engine is in the lifecycle of the current command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Sending { attempt: u32 },
    WaitingForResponse { attempt: u32, budget: Duration },
    Complete,
    Retrying { next_attempt: u32 },
    Reconnecting,
    Failed,
}

/// Result of a single attempt's polling loop.
#[derive(Debug)]
enum AttemptOutcome {
    Complete(Vec<u8>),
    Partial(Vec<u8>),
    NoResponse,
}

pub struct ProtocolEngine<L: Link> {
    link: L,
    settings: SerialSettings,
    policy: RetryPolicy,
    terminator: Vec<u8>,
    last_good_port: Option<String>,
    state: EngineState,
    history: History,
}

impl<L: Link> ProtocolEngine<L> {
    pub fn new(link: L, settings: &SerialSettings) -> Self {
        Self {
            link,
            policy: RetryPolicy::from_settings(settings),
            terminator: settings.terminator.as_bytes().to_vec(),
            last_good_port: None,
            state: EngineState::Idle,
            history: History::new(settings.history_capacity),
            settings: settings.clone(),
        }
    }

    /// Open the configured port and confirm the board answers the handshake.
    ///
    /// On a failed handshake the link is closed again and a `Connection`
    /// error is returned.
    pub async fn connect(&mut self) -> AppResult<()> {
        let port = self.settings.port.clone();
        self.link.open(&port, self.settings.baud_rate).await?;
        info!("Opened {} at {} baud", port, self.settings.baud_rate);

        let reason = match self.handshake().await {
            Ok(true) => {
                info!("Handshake with {} succeeded", port);
                self.last_good_port = Some(port);
                self.state = EngineState::Idle;
                return Ok(());
            }
            Ok(false) => "handshake reply did not match".to_string(),
            Err(e) => format!("handshake failed: {e}"),
        };
        self.link.close().await;
        self.state = EngineState::Failed;
        warn!("Handshake with {} failed: {}", port, reason);
        Err(DaqError::connection(port, reason))
    }

    pub async fn disconnect(&mut self) {
        self.link.close().await;
        self.state = EngineState::Idle;
        info!("Disconnected from {}", self.settings.port);
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_open()
    }

    /// Send `command` and wait for its reply, retrying per the policy.
    ///
    /// `base_timeout` is the budget of the first attempt; attempt *k* gets
    /// `base_timeout * 4^(k-1)`.
    pub async fn execute(&mut self, command: &str, base_timeout: Duration) -> AppResult<Response> {
        if command.as_bytes().first() != Some(&SENTINEL) {
            return Err(DaqError::format(
                command,
                command.as_bytes(),
                "command must start with ':'",
            ));
        }
        let frame = self.frame(command);
        let started = Instant::now();
        let mut attempt = 1;

        loop {
            let budget = self.policy.timeout_for_attempt(base_timeout, attempt);
            let mut last_bytes = Vec::new();
            let mut last_error = None;

            match self.run_attempt(command, &frame, budget, attempt).await {
                Ok(AttemptOutcome::Complete(raw)) => {
                    self.state = EngineState::Complete;
                    let delay = self.settings.command_delay();
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    return Ok(Response {
                        raw,
                        complete: true,
                        elapsed: started.elapsed(),
                        attempts: attempt,
                    });
                }
                Ok(AttemptOutcome::Partial(raw)) => {
                    warn!(
                        "Partial reply to {} on attempt {} after {:?}: {:?}",
                        command,
                        attempt,
                        budget,
                        String::from_utf8_lossy(&raw)
                    );
                    last_bytes = raw;
                }
                Ok(AttemptOutcome::NoResponse) => {
                    warn!("No reply to {} on attempt {} within {:?}", command, attempt, budget);
                }
                Err(e) if e.is_retryable() => {
                    warn!("Attempt {} of {} failed: {}", attempt, command, e);
                    last_error = Some(e);
                }
                Err(e) => {
                    self.state = EngineState::Failed;
                    return Err(e);
                }
            }

            match self.policy.after_failure(attempt) {
                RetryDecision::Retry { next_attempt } => {
                    self.state = EngineState::Retrying { next_attempt };
                    if let Err(e) = self.reconnect().await {
                        warn!("Reconnect failed, retrying anyway: {}", e);
                    }
                    attempt = next_attempt;
                }
                RetryDecision::GiveUp => {
                    self.state = EngineState::Failed;
                    return self.exhausted(command, attempt, started.elapsed(), last_bytes, last_error);
                }
            }
        }
    }

    /// Execute with the configured base timeout.
    pub async fn execute_command(&mut self, command: &Command) -> AppResult<Response> {
        let timeout = self.settings.command_timeout();
        self.execute(&command.render(), timeout).await
    }

    /// Single attempt within the handshake timeout; the retry policy does not apply.
    pub async fn handshake(&mut self) -> AppResult<bool> {
        let command = Command::handshake().render();
        let frame = self.frame(&command);
        let budget = self.settings.handshake_timeout();
        match self.run_attempt(&command, &frame, budget, 1).await? {
            AttemptOutcome::Complete(raw) => Ok(frames::is_handshake_reply(&raw)),
            AttemptOutcome::Partial(_) | AttemptOutcome::NoResponse => Ok(false),
        }
    }

    pub async fn read_signal(&mut self, channel: usize, kind: SignalKind) -> AppResult<u32> {
        let command = Command::read_signal(channel, kind)?;
        let text = command.render();
        let raw = self.execute_command(&command).await?.into_complete(&text)?;
        frames::parse_signal(&text, &raw, channel, kind)
    }

    pub async fn write_signal(
        &mut self,
        channel: usize,
        kind: SignalKind,
        value: u32,
    ) -> AppResult<bool> {
        let command = Command::write_signal(channel, kind, value)?;
        let text = command.render();
        let raw = self.execute_command(&command).await?.into_complete(&text)?;
        frames::parse_ack(&text, &raw)
    }

    pub async fn measure(&mut self, channel: usize) -> AppResult<AdcReading> {
        let command = Command::measure(channel)?;
        let text = command.render();
        let raw = self.execute_command(&command).await?.into_complete(&text)?;
        frames::parse_measurement(&text, &raw, channel)
    }

    pub async fn toggle_led(&mut self, channel: usize, on: bool) -> AppResult<bool> {
        let command = Command::toggle_led(channel, on)?;
        let text = command.render();
        let raw = self.execute_command(&command).await?.into_complete(&text)?;
        frames::parse_ack(&text, &raw)
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    pub fn set_no_response_action(&mut self, action: NoResponseAction) {
        self.settings.on_no_response_action = action;
        self.policy.on_exhausted = action;
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    fn frame(&self, command: &str) -> Vec<u8> {
        let mut frame = command.as_bytes().to_vec();
        if !frame.ends_with(&self.terminator) {
            frame.extend_from_slice(&self.terminator);
        }
        frame
    }

    async fn reconnect(&mut self) -> AppResult<()> {
        self.state = EngineState::Reconnecting;
        let port = self
            .last_good_port
            .clone()
            .unwrap_or_else(|| self.settings.port.clone());
        self.link.close().await;
        sleep(self.policy.reconnect_delay).await;
        self.link.open(&port, self.settings.baud_rate).await?;
        info!("Reconnected to {}", port);
        Ok(())
    }

    fn exhausted(
        &self,
        command: &str,
        attempts: u32,
        elapsed: Duration,
        last_bytes: Vec<u8>,
        last_error: Option<DaqError>,
    ) -> AppResult<Response> {
        let incomplete = Response {
            raw: last_bytes,
            complete: false,
            elapsed,
            attempts,
        };
        match self.policy.on_exhausted {
            NoResponseAction::Stop => Err(DaqError::Aborted(format!(
                "no complete reply to '{command}' after {attempts} attempt(s)"
            ))),
            NoResponseAction::Continue => {
                warn!("Giving up on {} after {} attempt(s), continuing", command, attempts);
                Ok(incomplete)
            }
            NoResponseAction::Retry if !incomplete.raw.is_empty() => Ok(incomplete),
            NoResponseAction::Retry => Err(last_error.unwrap_or(DaqError::Timeout {
                command: command.to_string(),
                attempts,
                elapsed,
                partial: Vec::new(),
            })),
        }
    }

    /// One attempt, recorded in the history.
    async fn run_attempt(
        &mut self,
        command: &str,
        frame: &[u8],
        budget: Duration,
        attempt: u32,
    ) -> AppResult<AttemptOutcome> {
        let result = self.poll_attempt(frame, budget, attempt).await;
        let (bytes, outcome) = match &result {
            Ok(AttemptOutcome::Complete(raw)) => (raw.as_slice(), ExchangeOutcome::Complete),
            Ok(AttemptOutcome::Partial(raw)) => (raw.as_slice(), ExchangeOutcome::Partial),
            Ok(AttemptOutcome::NoResponse) => (&[][..], ExchangeOutcome::NoResponse),
            Err(_) => (&[][..], ExchangeOutcome::Error),
        };
        self.history.record(command, bytes, outcome, attempt);
        result
    }

    async fn poll_attempt(
        &mut self,
        frame: &[u8],
        budget: Duration,
        attempt: u32,
    ) -> AppResult<AttemptOutcome> {
        self.state = EngineState::Sending { attempt };
        self.link.write(frame).await?;
        trace!("Sent {:?}", String::from_utf8_lossy(frame));

        self.state = EngineState::WaitingForResponse { attempt, budget };
        let started = Instant::now();
        let deadline = started + budget;
        let poll_interval = self.settings.poll_interval();
        let idle_threshold = self.settings.idle_threshold.max(1);
        let mut log_step = self.settings.log_interval();
        let mut next_log = log_step;
        let mut buffer = Vec::new();
        let mut empty_polls = 0u32;

        loop {
            if !self.link.is_open() {
                return Err(DaqError::connection(
                    self.link.port_name(),
                    "link closed while waiting for reply",
                ));
            }

            let available = self.link.bytes_available().await?;
            let chunk = if available > 0 {
                self.link.read(available).await?
            } else {
                Vec::new()
            };

            if !chunk.is_empty() {
                buffer.extend_from_slice(&chunk);
                empty_polls = 0;
                if buffer.ends_with(&self.terminator) {
                    debug!("Reply complete (terminator): {:?}", String::from_utf8_lossy(&buffer));
                    return Ok(AttemptOutcome::Complete(buffer));
                }
            } else if !buffer.is_empty() {
                empty_polls += 1;
                if empty_polls >= idle_threshold {
                    debug!(
                        "Reply complete (idle after {} polls): {:?}",
                        empty_polls,
                        String::from_utf8_lossy(&buffer)
                    );
                    return Ok(AttemptOutcome::Complete(buffer));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(if buffer.is_empty() {
                    AttemptOutcome::NoResponse
                } else {
                    AttemptOutcome::Partial(buffer)
                });
            }

            let waited = now - started;
            if waited >= next_log {
                info!(
                    "Still waiting for reply ({:?} of {:?}, {} byte(s) so far)",
                    waited,
                    budget,
                    buffer.len()
                );
                log_step = log_step.saturating_mul(2);
                next_log = waited + log_step;
            }

            sleep(poll_interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::SimulatedInstrument;

    fn settings() -> SerialSettings {
        SerialSettings {
            port: "SIM".into(),
            command_timeout_ms: 100,
            reconnect_delay_ms: 10,
            handshake_timeout_ms: 50,
            ..SerialSettings::default()
        }
    }

    async fn connected(settings: &SerialSettings) -> (ProtocolEngine<SimulatedInstrument>, SimulatedInstrument) {
        let sim = SimulatedInstrument::new();
        let mut engine = ProtocolEngine::new(sim.clone(), settings);
        engine.connect().await.unwrap();
        (engine, sim)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_runs_handshake() {
        let (engine, sim) = connected(&settings()).await;
        assert!(engine.is_connected());
        assert_eq!(sim.received_commands(), vec![":00".to_string()]);
        assert_eq!(engine.history().last().unwrap().outcome, ExchangeOutcome::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_fails_on_wrong_handshake() {
        let sim = SimulatedInstrument::new();
        sim.script_reply(b":55555554\r".to_vec());
        let mut engine = ProtocolEngine::new(sim.clone(), &settings());
        let err = engine.connect().await.unwrap_err();
        assert!(matches!(err, DaqError::Connection { .. }));
        assert!(!sim.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_command_without_sentinel() {
        let (mut engine, sim) = connected(&settings()).await;
        let before = sim.received_commands().len();
        let err = engine.execute("0250", Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, DaqError::ProtocolFormat { .. }));
        assert_eq!(sim.received_commands().len(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_signal_scenario() {
        let (mut engine, sim) = connected(&settings()).await;
        sim.script_reply(b":030500001A2B\r".to_vec());
        assert_eq!(engine.read_signal(5, SignalKind::Dac).await.unwrap(), 6699);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminator_completion_returns_early() {
        let (mut engine, _sim) = connected(&settings()).await;
        let response = engine.execute(":0703", Duration::from_secs(10)).await.unwrap();
        assert!(response.complete);
        assert_eq!(response.attempts, 1);
        assert!(response.elapsed < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_completion_after_threshold_polls() {
        for threshold in 1..=4u32 {
            let settings = SerialSettings {
                idle_threshold: threshold,
                ..settings()
            };
            let (mut engine, sim) = connected(&settings).await;
            sim.strip_terminator(true);
            let polls_before = sim.poll_count();

            let response = engine.execute(":0703", Duration::from_secs(1)).await.unwrap();

            assert!(response.complete);
            assert_eq!(response.raw, b":0803000000000000".to_vec());
            // one poll that finds the bytes, then `threshold` empty polls
            assert_eq!(sim.poll_count() - polls_before, u64::from(threshold) + 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_bytes_never_completes_early() {
        let settings = SerialSettings {
            max_attempts: 1,
            ..settings()
        };
        let (mut engine, sim) = connected(&settings).await;
        sim.drop_next_replies(1);
        let err = engine.execute(":0703", Duration::from_millis(100)).await.unwrap_err();
        match err {
            DaqError::Timeout { attempts, partial, .. } => {
                assert_eq!(attempts, 1);
                assert!(partial.is_empty());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_reconnects_and_quadruples_budget() {
        let (mut engine, sim) = connected(&settings()).await;
        let opens_before = sim.open_count();
        sim.drop_next_replies(2);

        let started = Instant::now();
        let response = engine.execute(":0703", Duration::from_millis(100)).await.unwrap();
        let elapsed = started.elapsed();

        assert!(response.complete);
        assert_eq!(response.attempts, 3);
        assert_eq!(sim.open_count() - opens_before, 2);
        // 100 ms + 400 ms of waiting plus two 10 ms reconnect pauses
        assert!(elapsed >= Duration::from_millis(520));
        assert!(elapsed < Duration::from_millis(560));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_is_bounded() {
        let settings = settings();
        let (mut engine, sim) = connected(&settings).await;
        sim.drop_next_replies(3);
        let base = Duration::from_millis(100);

        let started = Instant::now();
        let result = engine.execute(":0703", base).await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(DaqError::Timeout { attempts: 3, .. })));
        let bound = engine.policy().worst_case_wait(base) + Duration::from_millis(50);
        assert!(elapsed <= bound, "{elapsed:?} > {bound:?}");
        assert_eq!(engine.state(), EngineState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_failure_still_retries() {
        let (mut engine, sim) = connected(&settings()).await;
        sim.close_on_next_write();
        sim.fail_open(true);

        let err = engine.execute(":0703", Duration::from_millis(100)).await.unwrap_err();

        assert!(matches!(err, DaqError::Connection { .. }));
        let attempts: Vec<u32> = engine.history().entries().map(|e| e.attempt).collect();
        assert_eq!(&attempts[attempts.len() - 3..], &[1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_recovers_after_reconnect() {
        let (mut engine, sim) = connected(&settings()).await;
        sim.close_on_next_write();
        let reading = engine.measure(3).await.unwrap();
        assert_eq!(reading, AdcReading::default());
        assert!(engine.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_policy_aborts() {
        let settings = SerialSettings {
            max_attempts: 2,
            on_no_response_action: NoResponseAction::Stop,
            ..settings()
        };
        let (mut engine, sim) = connected(&settings).await;
        sim.drop_next_replies(2);
        let err = engine.measure(0).await.unwrap_err();
        assert!(matches!(err, DaqError::Aborted(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_continue_policy_returns_incomplete() {
        let settings = SerialSettings {
            max_attempts: 1,
            on_no_response_action: NoResponseAction::Continue,
            ..settings()
        };
        let (mut engine, sim) = connected(&settings).await;
        sim.drop_next_replies(1);
        let response = engine.execute(":0703", Duration::from_millis(100)).await.unwrap();
        assert!(!response.complete);
        assert!(response.raw.is_empty());

        // the typed wrapper turns it back into a timeout for the caller
        sim.drop_next_replies(1);
        assert!(matches!(
            engine.measure(3).await,
            Err(DaqError::Timeout { .. })
        ));
    }

    /// Engine with two attempts against a board that sends one byte every
    /// three polls, so a reply never finishes inside 100 ms + 400 ms.
    async fn trickling(action: NoResponseAction) -> (ProtocolEngine<SimulatedInstrument>, SimulatedInstrument) {
        let settings = SerialSettings {
            max_attempts: 2,
            on_no_response_action: action,
            ..settings()
        };
        let (engine, sim) = connected(&settings).await;
        sim.trickle_replies(3);
        (engine, sim)
    }

    fn assert_partial(engine: &ProtocolEngine<SimulatedInstrument>, response: &Response) {
        let full = b":0803000000000000\r";
        assert!(!response.complete);
        assert_eq!(response.attempts, 2);
        assert!(!response.raw.is_empty());
        assert!(response.raw.len() < full.len());
        assert!(full.starts_with(&response.raw), "{:?}", response.raw);

        let entries: Vec<_> = engine.history().entries().collect();
        let (first, second) = (entries[entries.len() - 2], entries[entries.len() - 1]);
        assert_eq!(first.outcome, ExchangeOutcome::Partial);
        assert_eq!(first.attempt, 1);
        assert!(!first.received.is_empty());
        assert_eq!(second.outcome, ExchangeOutcome::Partial);
        assert_eq!(second.attempt, 2);
        assert_eq!(second.received, response.raw);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_reply_under_retry_policy() {
        let (mut engine, sim) = trickling(NoResponseAction::Retry).await;
        let opens_before = sim.open_count();

        let response = engine.execute(":0703", Duration::from_millis(100)).await.unwrap();

        assert_partial(&engine, &response);
        assert_eq!(sim.open_count() - opens_before, 1);
        assert_eq!(engine.state(), EngineState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_reply_under_continue_policy() {
        let (mut engine, _sim) = trickling(NoResponseAction::Continue).await;

        let response = engine.execute(":0703", Duration::from_millis(100)).await.unwrap();

        assert_partial(&engine, &response);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_reply_surfaces_as_timeout_with_bytes() {
        let (mut engine, _sim) = trickling(NoResponseAction::Retry).await;

        match engine.measure(3).await.unwrap_err() {
            DaqError::Timeout { attempts, partial, .. } => {
                assert_eq!(attempts, 2);
                assert!(partial.starts_with(b":08"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_truncated_reply_is_malformed_not_retried() {
        let (mut engine, sim) = connected(&settings()).await;
        let sent_before = sim.received_commands().len();
        sim.truncate_next_reply(10);

        let err = engine.measure(3).await.unwrap_err();

        match err {
            DaqError::ProtocolFormat { raw, reason, .. } => {
                assert_eq!(raw, b":080300000".to_vec());
                assert!(reason.contains("expected 18 bytes"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(sim.received_commands().len(), sent_before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_reply_is_not_retried() {
        let (mut engine, sim) = connected(&settings()).await;
        let sent_before = sim.received_commands().len();
        sim.script_reply(b":0305001A2B\r".to_vec());

        let err = engine.read_signal(5, SignalKind::Dac).await.unwrap_err();

        assert!(matches!(err, DaqError::ProtocolFormat { .. }));
        assert_eq!(sim.received_commands().len(), sent_before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_for_other_channel_is_rejected() {
        let (mut engine, sim) = connected(&settings()).await;
        let sent_before = sim.received_commands().len();
        sim.script_reply(b":08042EE01F400064\r".to_vec());

        let err = engine.measure(3).await.unwrap_err();

        match err {
            DaqError::ProtocolFormat { command, raw, .. } => {
                assert_eq!(command, ":0703");
                assert_eq!(raw, b":08042EE01F400064\r".to_vec());
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(sim.received_commands().len(), sent_before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_then_read_round_trip() {
        let (mut engine, _sim) = connected(&settings()).await;
        for channel in [0usize, 7, 15] {
            for kind in SignalKind::ALL {
                let value = 1000 + channel as u32 * 10 + u32::from(kind.code());
                assert!(engine.write_signal(channel, kind, value).await.unwrap());
                assert_eq!(engine.read_signal(channel, kind).await.unwrap(), value);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_led() {
        let (mut engine, sim) = connected(&settings()).await;
        assert!(engine.toggle_led(4, true).await.unwrap());
        assert!(sim.led(4));
        assert!(engine.toggle_led(4, false).await.unwrap());
        assert!(!sim.led(4));
    }
}
