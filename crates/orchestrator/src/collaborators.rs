//! Narrow contracts for the services a session talks to: the fact log,
//! the presentation layer and the outbound transport.

use cadence_core::{Position, RosterReport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::context::HookError;

/// A key-value fact tagged by participant and plan position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub participant_id: String,
    pub position: Position,
    pub key: String,
    pub value: Value,
    pub recorded_at: DateTime<Utc>,
}

impl Fact {
    pub fn new(
        participant_id: impl Into<String>,
        position: Position,
        key: impl Into<String>,
        value: Value,
    ) -> Self {
        Self {
            participant_id: participant_id.into(),
            position,
            key: key.into(),
            value,
            recorded_at: Utc::now(),
        }
    }
}

pub trait FactLog: Send {
    fn record(&mut self, fact: Fact);

    fn facts(&self) -> &[Fact];

    /// Facts recorded at one position, oldest first.
    fn at(&self, position: Position) -> Vec<&Fact> {
        self.facts().iter().filter(|f| f.position == position).collect()
    }

    /// Most recent value for a key.
    fn latest(&self, key: &str) -> Option<&Value> {
        self.facts()
            .iter()
            .rev()
            .find(|f| f.key == key)
            .map(|f| &f.value)
    }
}

#[derive(Debug, Default)]
pub struct MemoryLog {
    facts: Vec<Fact>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FactLog for MemoryLog {
    fn record(&mut self, fact: Fact) {
        self.facts.push(fact);
    }

    fn facts(&self) -> &[Fact] {
        &self.facts
    }
}

/// Renders a step before its callback runs.
pub trait Presenter: Send {
    fn load(&mut self, frame: &str, position: Position) -> Result<(), HookError>;
}

#[derive(Debug, Default)]
pub struct NoopPresenter;

impl Presenter for NoopPresenter {
    fn load(&mut self, _frame: &str, _position: Position) -> Result<(), HookError> {
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("Transport failed: {0}")]
    Failed(String),
}

/// Outbound side of the transport layer.
pub trait Transport: Send {
    fn report(&mut self, report: &RosterReport) -> Result<(), TransportError>;
}

/// Drops every report. Used by solo sessions.
#[derive(Debug, Default)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn report(&mut self, _report: &RosterReport) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Forwards reports into an in-process channel, e.g. to another
/// participant's driver.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    sender: mpsc::UnboundedSender<RosterReport>,
}

impl ChannelTransport {
    pub fn new(sender: mpsc::UnboundedSender<RosterReport>) -> Self {
        Self { sender }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RosterReport>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }
}

impl Transport for ChannelTransport {
    fn report(&mut self, report: &RosterReport) -> Result<(), TransportError> {
        self.sender
            .send(report.clone())
            .map_err(|_| TransportError::Closed)
    }
}
