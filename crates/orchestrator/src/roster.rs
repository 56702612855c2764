use std::collections::BTreeMap;

use cadence_core::{Position, ProgressLevel, RosterReport};

/// Last known state of another participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub participant_id: String,
    pub position: Position,
    pub progress: ProgressLevel,
}

/// Connected participants other than the local one, mutated only by
/// transport messages.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    entries: BTreeMap<String, RosterEntry>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the participant was not known yet.
    pub fn join(&mut self, participant_id: impl Into<String>) -> bool {
        let participant_id = participant_id.into();
        if self.entries.contains_key(&participant_id) {
            return false;
        }
        self.entries.insert(
            participant_id.clone(),
            RosterEntry {
                participant_id,
                position: Position::ZERO,
                progress: ProgressLevel::Uninitialized,
            },
        );
        true
    }

    pub fn leave(&mut self, participant_id: &str) -> bool {
        self.entries.remove(participant_id).is_some()
    }

    /// Store a progress report. An unknown sender joins implicitly; returns
    /// true in that case.
    pub fn apply(&mut self, report: &RosterReport) -> bool {
        let joined = self.join(report.participant_id.clone());
        if let Some(entry) = self.entries.get_mut(&report.participant_id) {
            entry.position = report.position;
            entry.progress = report.progress_level;
        }
        joined
    }

    pub fn get(&self, participant_id: &str) -> Option<&RosterEntry> {
        self.entries.get(participant_id)
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.entries.contains_key(participant_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &RosterEntry> {
        self.entries.values()
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
}
