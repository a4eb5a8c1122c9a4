//! Bounded log of recent command/reply exchanges.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt::Write as _;

/// How a single attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExchangeOutcome {
    Complete,
    /// Some bytes arrived but the reply never completed.
    Partial,
    NoResponse,
    /// The link failed while sending or polling.
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommunicationEntry {
    pub timestamp: DateTime<Local>,
    pub sent: String,
    pub received: Vec<u8>,
    pub outcome: ExchangeOutcome,
    pub attempt: u32,
}

impl CommunicationEntry {
    pub fn received_text(&self) -> String {
        String::from_utf8_lossy(&self.received)
            .escape_debug()
            .to_string()
    }
}

/// Ring of the last `capacity` entries; older entries fall off the front.
#[derive(Debug, Clone)]
pub struct History {
    entries: VecDeque<CommunicationEntry>,
    capacity: usize,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn record(&mut self, sent: &str, received: &[u8], outcome: ExchangeOutcome, attempt: u32) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(CommunicationEntry {
            timestamp: Local::now(),
            sent: sent.to_string(),
            received: received.to_vec(),
            outcome,
            attempt,
        });
    }

    pub fn entries(&self) -> impl Iterator<Item = &CommunicationEntry> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&CommunicationEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Plain-text table for a diagnostics pane.
    pub fn render_table(&self) -> String {
        let mut out = String::from("time          attempt  outcome     sent            received\n");
        for entry in &self.entries {
            let _ = writeln!(
                out,
                "{}  {:>7}  {:<10}  {:<14}  {}",
                entry.timestamp.format("%H:%M:%S%.3f"),
                entry.attempt,
                format!("{:?}", entry.outcome),
                entry.sent,
                entry.received_text()
            );
        }
        out
    }
}
