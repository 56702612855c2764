use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Coarse lifecycle of a participant's session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum EngineLevel {
    #[default]
    Uninitialized,
    Starting,
    Initializing,
    Initialized,
    StageInit,
    StepInit,
    PlayingStep,
    StageExit,
    StepExit,
    Finishing,
    Gameover,
    /// Fatal sentinel; only a stop or restart leaves it.
    RuntimeError,
}

impl EngineLevel {
    pub fn code(&self) -> i32 {
        match self {
            Self::Uninitialized => 0,
            Self::Starting => 1,
            Self::Initializing => 2,
            Self::Initialized => 5,
            Self::StageInit => 10,
            Self::StepInit => 20,
            Self::PlayingStep => 30,
            Self::StageExit => 40,
            Self::StepExit => 50,
            Self::Finishing => 60,
            Self::Gameover => 100,
            Self::RuntimeError => -1,
        }
    }

    pub fn from_code(code: i32) -> Result<Self, CoreError> {
        Ok(match code {
            0 => Self::Uninitialized,
            1 => Self::Starting,
            2 => Self::Initializing,
            5 => Self::Initialized,
            10 => Self::StageInit,
            20 => Self::StepInit,
            30 => Self::PlayingStep,
            40 => Self::StageExit,
            50 => Self::StepExit,
            60 => Self::Finishing,
            100 => Self::Gameover,
            -1 => Self::RuntimeError,
            other => return Err(CoreError::UnknownLevel(other)),
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Starting => "starting",
            Self::Initializing => "initializing",
            Self::Initialized => "initialized",
            Self::StageInit => "stage_init",
            Self::StepInit => "step_init",
            Self::PlayingStep => "playing_step",
            Self::StageExit => "stage_exit",
            Self::StepExit => "step_exit",
            Self::Finishing => "finishing",
            Self::Gameover => "gameover",
            Self::RuntimeError => "runtime_error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uninitialized" => Some(Self::Uninitialized),
            "starting" => Some(Self::Starting),
            "initializing" => Some(Self::Initializing),
            "initialized" => Some(Self::Initialized),
            "stage_init" => Some(Self::StageInit),
            "step_init" => Some(Self::StepInit),
            "playing_step" => Some(Self::PlayingStep),
            "stage_exit" => Some(Self::StageExit),
            "step_exit" => Some(Self::StepExit),
            "finishing" => Some(Self::Finishing),
            "gameover" => Some(Self::Gameover),
            "runtime_error" => Some(Self::RuntimeError),
            _ => None,
        }
    }

    /// Stepping verbs are legal from initialization complete up to, but
    /// excluding, finishing.
    pub fn can_step(&self) -> bool {
        !self.is_error()
            && self.code() >= Self::Initialized.code()
            && self.code() < Self::Finishing.code()
    }

    /// `start` is only legal before initialization has begun.
    pub fn can_start(&self) -> bool {
        !self.is_error() && self.code() < Self::Initializing.code()
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::RuntimeError)
    }
}

/// Fine-grained progress of a participant within the current position.
///
/// Wire messages carry the integer [`code`](ProgressLevel::code).
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
#[serde(try_from = "i32", into = "i32")]
pub enum ProgressLevel {
    #[default]
    Uninitialized,
    Initializing,
    Initialized,
    LoadingFrame,
    FrameLoaded,
    ExecutingCallback,
    CallbackExecuted,
    Loaded,
    Playing,
    Pausing,
    Paused,
    Resuming,
    Resumed,
    DoneRequested,
    EvaluatingDone,
    Done,
    Exiting,
}

impl ProgressLevel {
    pub fn code(&self) -> i32 {
        match self {
            Self::Uninitialized => 0,
            Self::Initializing => 1,
            Self::Initialized => 5,
            Self::LoadingFrame => 25,
            Self::FrameLoaded => 26,
            Self::ExecutingCallback => 30,
            Self::CallbackExecuted => 40,
            Self::Loaded => 45,
            Self::Playing => 50,
            Self::Pausing => 55,
            Self::Paused => 60,
            Self::Resuming => 65,
            Self::Resumed => 70,
            Self::DoneRequested => 90,
            Self::EvaluatingDone => 95,
            Self::Done => 100,
            Self::Exiting => 110,
        }
    }

    pub fn from_code(code: i32) -> Result<Self, CoreError> {
        Ok(match code {
            0 => Self::Uninitialized,
            1 => Self::Initializing,
            5 => Self::Initialized,
            25 => Self::LoadingFrame,
            26 => Self::FrameLoaded,
            30 => Self::ExecutingCallback,
            40 => Self::CallbackExecuted,
            45 => Self::Loaded,
            50 => Self::Playing,
            55 => Self::Pausing,
            60 => Self::Paused,
            65 => Self::Resuming,
            70 => Self::Resumed,
            90 => Self::DoneRequested,
            95 => Self::EvaluatingDone,
            100 => Self::Done,
            110 => Self::Exiting,
            other => return Err(CoreError::UnknownLevel(other)),
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Initialized => "initialized",
            Self::LoadingFrame => "loading_frame",
            Self::FrameLoaded => "frame_loaded",
            Self::ExecutingCallback => "executing_callback",
            Self::CallbackExecuted => "callback_executed",
            Self::Loaded => "loaded",
            Self::Playing => "playing",
            Self::Pausing => "pausing",
            Self::Paused => "paused",
            Self::Resuming => "resuming",
            Self::Resumed => "resumed",
            Self::DoneRequested => "done_requested",
            Self::EvaluatingDone => "evaluating_done",
            Self::Done => "done",
            Self::Exiting => "exiting",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Levels from which a participant may ask to finish its step.
    pub fn accepts_done(&self) -> bool {
        matches!(
            self,
            Self::Loaded | Self::Playing | Self::Resumed | Self::CallbackExecuted
        )
    }
}

impl TryFrom<i32> for ProgressLevel {
    type Error = CoreError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Self::from_code(value)
    }
}

impl From<ProgressLevel> for i32 {
    fn from(level: ProgressLevel) -> Self {
        level.code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_level_window() {
        assert!(EngineLevel::Uninitialized.can_start());
        assert!(EngineLevel::Starting.can_start());
        assert!(!EngineLevel::Initializing.can_start());

        assert!(!EngineLevel::Initializing.can_step());
        assert!(EngineLevel::Initialized.can_step());
        assert!(EngineLevel::PlayingStep.can_step());
        assert!(!EngineLevel::Finishing.can_step());
        assert!(!EngineLevel::Gameover.can_step());
        assert!(!EngineLevel::RuntimeError.can_step());
    }

    #[test]
    fn test_engine_level_strings() {
        assert_eq!(EngineLevel::PlayingStep.as_str(), "playing_step");
        assert_eq!(
            EngineLevel::parse("stage_exit"),
            Some(EngineLevel::StageExit)
        );
        assert_eq!(EngineLevel::parse("bogus"), None);
        assert_eq!(EngineLevel::from_code(-1), Ok(EngineLevel::RuntimeError));
    }

    #[test]
    fn test_progress_codes_are_monotonic() {
        let levels = [
            ProgressLevel::Uninitialized,
            ProgressLevel::Initializing,
            ProgressLevel::Initialized,
            ProgressLevel::LoadingFrame,
            ProgressLevel::FrameLoaded,
            ProgressLevel::ExecutingCallback,
            ProgressLevel::CallbackExecuted,
            ProgressLevel::Loaded,
            ProgressLevel::Playing,
            ProgressLevel::Pausing,
            ProgressLevel::Paused,
            ProgressLevel::Resuming,
            ProgressLevel::Resumed,
            ProgressLevel::DoneRequested,
            ProgressLevel::EvaluatingDone,
            ProgressLevel::Done,
            ProgressLevel::Exiting,
        ];
        for pair in levels.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].code() < pair[1].code());
        }
        for level in levels {
            assert_eq!(ProgressLevel::from_code(level.code()), Ok(level));
        }
    }

    #[test]
    fn test_progress_level_wire_form() {
        let json = serde_json::to_string(&ProgressLevel::Done).unwrap();
        assert_eq!(json, "100");
        let level: ProgressLevel = serde_json::from_str("50").unwrap();
        assert_eq!(level, ProgressLevel::Playing);
        assert!(serde_json::from_str::<ProgressLevel>("51").is_err());
    }
}
