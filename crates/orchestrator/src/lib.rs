//! Stage/step orchestration for round-based multi-participant sessions.
//!
//! A [`Stager`] assembles steps and stages into a [`Plan`] out of
//! re-orderable [`Block`]s. A [`PlanNavigator`] walks the plan, and each
//! participant runs a [`Session`] around a pure [`SessionEngine`] that
//! decides when it may advance based on the [`Roster`] of other
//! participants.

pub mod block;
pub mod collaborators;
pub mod config;
pub mod context;
pub mod driver;
pub mod engine;
pub mod error;
pub mod navigator;
pub mod plan;
pub mod roster;
pub mod rules;
pub mod session;
pub mod stager;
pub mod state_machine;
pub mod thresholds;
pub mod timer;

pub use block::{Block, BlockKind, PositionSpec};
pub use collaborators::{
    ChannelTransport, Fact, FactLog, MemoryLog, NoopPresenter, NullTransport, Presenter,
    Transport, TransportError,
};
pub use config::EngineConfig;
pub use context::{CallbackSignal, DataMessage, HookError, Properties, StepContext};
pub use driver::{Inbound, SessionDriver};
pub use engine::{Deferred, Effect, HookKind, SessionEngine, STEP_TIMER};
pub use error::{OrchestratorError, Result};
pub use navigator::{NavTarget, PlanNavigator};
pub use plan::Plan;
pub use roster::{Roster, RosterEntry};
pub use rules::{AdvancementRule, RuleContext, RuleName, RuleRegistry};
pub use session::Session;
pub use stager::{
    callback, done_callback, hook, CallbackRegistry, StageDef, StagePatch, Stager, StagerState,
    StepDef, StepPatch,
};
pub use state_machine::LevelStateMachine;
pub use thresholds::{ParticipantThresholds, Threshold, ThresholdKind};
pub use timer::{TimerError, TimerService};
