use serde::{Deserialize, Serialize};

/// How a plan entry repeats.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EntryKind {
    Plain,
    Repeat { num: u32 },
    /// Entered and repeated while its predicate holds.
    Loop,
    /// Entered unconditionally, repeated while its predicate holds.
    DoLoop,
    Gameover,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Repeat { .. } => "repeat",
            Self::Loop => "loop",
            Self::DoLoop => "doLoop",
            Self::Gameover => "gameover",
        }
    }

    pub fn is_looping(&self) -> bool {
        matches!(self, Self::Loop | Self::DoLoop)
    }
}

/// One stage of a finalized plan, in its persisted/transmitted form:
/// `{ id, type, num?, steps }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanEntry {
    pub id: String,
    #[serde(flatten)]
    pub kind: EntryKind,
    #[serde(default)]
    pub steps: Vec<String>,
}

impl PlanEntry {
    pub fn new(id: impl Into<String>, kind: EntryKind, steps: Vec<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            steps,
        }
    }

    pub fn plain(id: impl Into<String>, steps: Vec<String>) -> Self {
        Self::new(id, EntryKind::Plain, steps)
    }

    pub fn gameover() -> Self {
        Self::new("gameover", EntryKind::Gameover, Vec::new())
    }

    pub fn is_gameover(&self) -> bool {
        matches!(self.kind, EntryKind::Gameover)
    }

    pub fn step_count(&self) -> u32 {
        self.steps.len() as u32
    }

    /// 1-based step lookup.
    pub fn step(&self, ordinal: u32) -> Option<&str> {
        if ordinal == 0 {
            return None;
        }
        self.steps.get(ordinal as usize - 1).map(String::as_str)
    }

    /// 1-based ordinal of a step id within this entry.
    pub fn step_ordinal(&self, step_id: &str) -> Option<u32> {
        self.steps
            .iter()
            .position(|s| s == step_id)
            .map(|i| i as u32 + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_wire_form() {
        let entry = PlanEntry::new(
            "B",
            EntryKind::Repeat { num: 2 },
            vec!["b1".to_string()],
        );
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"id": "B", "type": "repeat", "num": 2, "steps": ["b1"]})
        );

        let plain = serde_json::to_value(PlanEntry::plain("A", vec!["a1".into()])).unwrap();
        assert_eq!(plain["type"], "plain");
        assert!(plain.get("num").is_none());
    }

    #[test]
    fn test_entry_deserialization() {
        let json = r#"{"id":"L","type":"doLoop","steps":["l1","l2"]}"#;
        let entry: PlanEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.kind, EntryKind::DoLoop);
        assert_eq!(entry.step(2), Some("l2"));
        assert_eq!(entry.step(0), None);
        assert_eq!(entry.step_ordinal("l1"), Some(1));

        let over: PlanEntry = serde_json::from_str(r#"{"id":"gameover","type":"gameover"}"#).unwrap();
        assert!(over.is_gameover());
        assert!(over.steps.is_empty());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(EntryKind::DoLoop.as_str(), "doLoop");
        assert!(EntryKind::Loop.is_looping());
        assert!(!EntryKind::Repeat { num: 3 }.is_looping());
    }
}
