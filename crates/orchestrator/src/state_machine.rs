use cadence_core::EngineLevel;

use crate::error::{OrchestratorError, Result};

/// Legal moves between coarse engine levels.
///
/// `stop` is not modelled here: it resets any level back to
/// `Uninitialized` unconditionally.
pub struct LevelStateMachine;

impl LevelStateMachine {
    pub fn validate_transition(from: &EngineLevel, to: &EngineLevel) -> Result<()> {
        let allowed = Self::allowed_transitions(from);

        if allowed.contains(to) {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }

    fn allowed_transitions(from: &EngineLevel) -> Vec<EngineLevel> {
        use EngineLevel::*;
        match from {
            Uninitialized => vec![Starting],
            Starting => vec![Initializing, RuntimeError],
            Initializing => vec![Initialized, RuntimeError],
            Initialized => vec![StageInit, StepInit, Finishing, Gameover, RuntimeError],
            StageInit => vec![StepInit, RuntimeError],
            StepInit => vec![PlayingStep, StepExit, Gameover, RuntimeError],
            PlayingStep => vec![StepExit, Finishing, Gameover, RuntimeError],
            StepExit => vec![StageExit, StepInit, Finishing, Gameover, RuntimeError],
            StageExit => vec![StageInit, Finishing, Gameover, RuntimeError],
            Finishing => vec![Gameover, RuntimeError],
            Gameover => vec![],
            RuntimeError => vec![],
        }
    }

    pub fn can_transition(from: &EngineLevel, to: &EngineLevel) -> bool {
        Self::validate_transition(from, to).is_ok()
    }

    /// Terminal levels accept no further transition except a stop.
    pub fn is_terminal(level: &EngineLevel) -> bool {
        Self::allowed_transitions(level).is_empty()
    }
}
