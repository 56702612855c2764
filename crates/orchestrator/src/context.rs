//! What hooks and step callbacks see while they run.

use std::collections::BTreeMap;

use cadence_core::Position;
use events::{Event, ListenerId, ListenerScope, ScopedListeners};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::collaborators::{Fact, FactLog};

/// Named values resolved through step, stage and plan defaults.
pub type Properties = BTreeMap<String, Value>;

/// Error raised by a hook, a step callback or a collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct HookError(pub String);

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Outcome a step callback reports back to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackSignal {
    /// The step is playing; someone calls `done` later.
    Continue,
    /// The step finished immediately.
    Done,
    /// Non-fatal failure. The position does not advance.
    Failed(String),
}

/// A data message delivered by the transport from another participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataMessage {
    pub from: String,
    pub key: String,
    #[serde(default)]
    pub payload: Value,
}

impl DataMessage {
    pub fn new(from: impl Into<String>, key: impl Into<String>, payload: Value) -> Self {
        Self {
            from: from.into(),
            key: key.into(),
            payload,
        }
    }
}

pub struct StepContext<'a> {
    pub participant_id: &'a str,
    pub position: Position,
    pub stage_id: Option<&'a str>,
    pub step_id: Option<&'a str>,
    properties: &'a Properties,
    log: &'a mut dyn FactLog,
    listeners: &'a mut ScopedListeners<Event>,
}

impl<'a> StepContext<'a> {
    pub fn new(
        participant_id: &'a str,
        position: Position,
        stage_id: Option<&'a str>,
        step_id: Option<&'a str>,
        properties: &'a Properties,
        log: &'a mut dyn FactLog,
        listeners: &'a mut ScopedListeners<Event>,
    ) -> Self {
        Self {
            participant_id,
            position,
            stage_id,
            step_id,
            properties,
            log,
            listeners,
        }
    }

    /// Inherited property at the current position.
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn properties(&self) -> &Properties {
        self.properties
    }

    /// Record a fact tagged with this participant and position.
    pub fn record(&mut self, key: impl Into<String>, value: Value) {
        let fact = Fact::new(self.participant_id, self.position, key, value);
        self.log.record(fact);
    }

    pub fn log(&self) -> &dyn FactLog {
        &*self.log
    }

    /// Listen until the current step is exited.
    pub fn on_step(&mut self, listener: impl FnMut(&Event) + Send + 'static) -> ListenerId {
        self.listeners.on(ListenerScope::Step, listener)
    }

    /// Listen until the current stage is exited.
    pub fn on_stage(&mut self, listener: impl FnMut(&Event) + Send + 'static) -> ListenerId {
        self.listeners.on(ListenerScope::Stage, listener)
    }

    /// Listen until the session stops.
    pub fn on_session(&mut self, listener: impl FnMut(&Event) + Send + 'static) -> ListenerId {
        self.listeners.on(ListenerScope::Session, listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::MemoryLog;
    use serde_json::json;

    #[test]
    fn test_context_records_tagged_facts() {
        let mut log = MemoryLog::new();
        let mut listeners = ScopedListeners::new();
        let mut props = Properties::new();
        props.insert("color".into(), json!("red"));

        let mut ctx = StepContext::new(
            "p1",
            Position::new(1, 2, 1),
            Some("intro"),
            Some("welcome"),
            &props,
            &mut log,
            &mut listeners,
        );
        assert_eq!(ctx.property("color"), Some(&json!("red")));
        ctx.record("answer", json!(42));
        ctx.on_step(|_| {});
        ctx.on_stage(|_| {});

        let facts = log.facts();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].participant_id, "p1");
        assert_eq!(facts[0].position, Position::new(1, 2, 1));
        assert_eq!(listeners.count(ListenerScope::Step), 1);
        assert_eq!(listeners.count(ListenerScope::Stage), 1);
    }

    #[test]
    fn test_data_message_payload_defaults_to_null() {
        let msg: DataMessage = serde_json::from_str(r#"{"from":"p2","key":"chat"}"#).unwrap();
        assert_eq!(msg.payload, Value::Null);
    }
}
