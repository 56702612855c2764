use std::time::Duration;

use cadence_core::{Position, RosterReport};
use events::{Event, ListenerScope};

use crate::thresholds::ThresholdChange;

/// Which lifecycle hook to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    PlanInit,
    PlanTeardown,
    StageInit,
    StageExit,
    StepInit,
    StepExit,
}

impl HookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::PlanInit => "plan init",
            HookKind::PlanTeardown => "plan teardown",
            HookKind::StageInit => "stage init",
            HookKind::StageExit => "stage exit",
            HookKind::StepInit => "step init",
            HookKind::StepExit => "step exit",
        }
    }
}

/// Work postponed to the next tick. Each carries the position it was
/// scheduled at and is dropped if the engine has moved on by then.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deferred {
    /// Finish a `done` request.
    CompleteDone { position: Position },
    /// Decide whether the participant may advance.
    EvaluateStep { position: Position },
}

impl Deferred {
    pub fn position(&self) -> Position {
        match self {
            Deferred::CompleteDone { position } | Deferred::EvaluateStep { position } => *position,
        }
    }
}

/// One side effect requested by the engine, executed in order by the
/// session.
#[derive(Debug, Clone)]
pub enum Effect {
    Hook { kind: HookKind, position: Position },
    ClearListeners(ListenerScope),
    StartTimer { name: String, duration: Duration },
    StopTimer { name: String },
    StopTimers,
    PauseTimers,
    ResumeTimers,
    Threshold(ThresholdChange),
    /// Ask the presenter to load a frame; the session reports back with
    /// `frame_loaded`.
    LoadFrame { frame: String, position: Position },
    /// Play the step callback and report back with `callback_finished`.
    ExecuteCallback { position: Position },
    Publish(Event),
    Report(RosterReport),
    Defer(Deferred),
    /// Hand messages buffered during the pause to the step.
    ReplayBuffer,
}
