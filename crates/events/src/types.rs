//! Event types for the cadence event system

use cadence_core::{Position, ProgressLevel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all events with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: Uuid,
    /// Emitter-assigned ordering; 0 when published directly on the bus
    #[serde(default)]
    pub sequence: u64,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// The actual event
    pub event: Event,
}

impl EventEnvelope {
    /// Create a new event envelope with auto-generated ID and timestamp
    pub fn new(event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence: 0,
            timestamp: Utc::now(),
            event,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }
}

/// All possible events in the system
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Session lifecycle
    /// Session start requested and plan-wide init hook completed
    #[serde(rename = "session.started")]
    SessionStarted { participant_id: String },

    /// Session stopped and its state discarded
    #[serde(rename = "session.stopped")]
    SessionStopped { participant_id: String },

    /// Navigation ran past the last plan entry
    #[serde(rename = "session.sequence_ended")]
    SequenceEnded {
        participant_id: String,
        position: Position,
    },

    /// Plan-wide teardown completed
    #[serde(rename = "session.gameover")]
    GameOver { participant_id: String },

    /// Session paused
    #[serde(rename = "session.paused")]
    Paused {
        participant_id: String,
        position: Position,
    },

    /// Session resumed
    #[serde(rename = "session.resumed")]
    Resumed {
        participant_id: String,
        position: Position,
    },

    // Navigation
    #[serde(rename = "stage.entered")]
    StageEntered {
        participant_id: String,
        stage_id: String,
        position: Position,
    },

    #[serde(rename = "stage.exited")]
    StageExited {
        participant_id: String,
        stage_id: String,
        position: Position,
    },

    #[serde(rename = "step.entered")]
    StepEntered {
        participant_id: String,
        stage_id: String,
        step_id: String,
        position: Position,
    },

    #[serde(rename = "step.exited")]
    StepExited {
        participant_id: String,
        stage_id: String,
        step_id: String,
        position: Position,
    },

    /// Own progress level changed
    #[serde(rename = "progress.changed")]
    ProgressChanged {
        participant_id: String,
        position: Position,
        level: ProgressLevel,
    },

    // Roster
    #[serde(rename = "roster.joined")]
    ParticipantJoined { participant_id: String },

    #[serde(rename = "roster.left")]
    ParticipantLeft { participant_id: String },

    /// A participant-count threshold on the current step is violated
    #[serde(rename = "threshold.violated")]
    ThresholdViolated {
        participant_id: String,
        threshold: ThresholdData,
    },

    /// A previously violated threshold holds again
    #[serde(rename = "threshold.restored")]
    ThresholdRestored {
        participant_id: String,
        threshold: ThresholdData,
    },

    /// Collaborator data message delivered to the current step
    #[serde(rename = "message.received")]
    MessageReceived {
        from: String,
        key: String,
        payload: serde_json::Value,
    },

    // System events
    /// Generic error event
    #[serde(rename = "error")]
    Error {
        message: String,
        context: Option<String>,
    },
}

/// Data for threshold events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThresholdData {
    /// "min", "max" or "exact"
    pub kind: String,
    /// Declared participant count
    pub limit: usize,
    /// Participant count that triggered the event
    pub participants: usize,
}

impl Event {
    /// Get the participant ID associated with this event, if any
    pub fn participant_id(&self) -> Option<&str> {
        match self {
            Event::SessionStarted { participant_id }
            | Event::SessionStopped { participant_id }
            | Event::SequenceEnded { participant_id, .. }
            | Event::GameOver { participant_id }
            | Event::Paused { participant_id, .. }
            | Event::Resumed { participant_id, .. }
            | Event::StageEntered { participant_id, .. }
            | Event::StageExited { participant_id, .. }
            | Event::StepEntered { participant_id, .. }
            | Event::StepExited { participant_id, .. }
            | Event::ProgressChanged { participant_id, .. }
            | Event::ParticipantJoined { participant_id }
            | Event::ParticipantLeft { participant_id }
            | Event::ThresholdViolated { participant_id, .. }
            | Event::ThresholdRestored { participant_id, .. } => Some(participant_id),
            Event::MessageReceived { from, .. } => Some(from),
            Event::Error { .. } => None,
        }
    }

    pub fn error(message: impl Into<String>, context: Option<String>) -> Self {
        Event::Error {
            message: message.into(),
            context,
        }
    }
}
