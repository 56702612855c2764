//! Per-participant state machine that executes a plan.
//!
//! The engine never runs hooks or touches collaborators. Every verb returns
//! the effects to perform, in order, and the session reports outcomes back
//! through [`SessionEngine::frame_loaded`], [`SessionEngine::callback_finished`]
//! and [`SessionEngine::run_deferred`].

mod effect;

pub use effect::{Deferred, Effect, HookKind};

use std::sync::Arc;

use cadence_core::{EngineLevel, Position, ProgressLevel, RosterReport, StepTarget};
use events::{Event, ListenerScope};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::context::{CallbackSignal, Properties};
use crate::error::{OrchestratorError, Result};
use crate::navigator::{NavTarget, PlanNavigator};
use crate::plan::Plan;
use crate::roster::Roster;
use crate::rules::{AdvancementRule, RuleContext, RuleRegistry};
use crate::state_machine::LevelStateMachine;
use crate::thresholds::ThresholdMonitor;

/// Name of the per-step deadline timer.
pub const STEP_TIMER: &str = "step";

pub struct SessionEngine {
    participant_id: String,
    observer: bool,
    auto_gameover: bool,
    default_rule: AdvancementRule,
    rules: RuleRegistry,
    navigator: PlanNavigator,
    level: EngineLevel,
    progress: ProgressLevel,
    position: Position,
    properties: Properties,
    paused: bool,
    resume_progress: Option<ProgressLevel>,
    thresholds: ThresholdMonitor,
    participants: usize,
    game_over: bool,
}

impl SessionEngine {
    pub fn new(plan: Arc<Plan>, rules: RuleRegistry, config: &EngineConfig) -> Self {
        let own_weight = if config.observer { 0 } else { 1 };
        Self {
            participant_id: config.participant_id.clone(),
            observer: config.observer,
            auto_gameover: config.auto_gameover,
            default_rule: AdvancementRule::named(config.default_rule.clone()),
            rules,
            navigator: PlanNavigator::new(plan),
            level: EngineLevel::Uninitialized,
            progress: ProgressLevel::Uninitialized,
            position: Position::ZERO,
            properties: Properties::new(),
            paused: false,
            resume_progress: None,
            thresholds: ThresholdMonitor::new(),
            participants: own_weight,
            game_over: false,
        }
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn level(&self) -> EngineLevel {
        self.level
    }

    pub fn progress(&self) -> ProgressLevel {
        self.progress
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_observer(&self) -> bool {
        self.observer
    }

    pub fn navigator(&self) -> &PlanNavigator {
        &self.navigator
    }

    /// Inherited properties of the current position.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Participant count last used for thresholds, self included unless
    /// observing.
    pub fn participant_count(&self) -> usize {
        self.participants
    }

    pub fn thresholds_violated(&self) -> bool {
        self.thresholds.is_violated()
    }

    /// Current state as a roster report.
    pub fn report(&self) -> RosterReport {
        RosterReport::new(self.participant_id.clone(), self.position, self.progress)
    }

    // ---- verbs ----

    /// Run the plan init hook and enter the first step.
    pub fn start(&mut self) -> Result<Vec<Effect>> {
        if !self.level.can_start() {
            return Err(OrchestratorError::precondition("start", self.level));
        }
        info!(participant = %self.participant_id, "Starting session");

        let mut effects = Vec::new();
        self.set_level(EngineLevel::Starting)?;
        self.set_level(EngineLevel::Initializing)?;
        self.set_progress(ProgressLevel::Initializing, &mut effects);
        effects.push(Effect::Hook {
            kind: HookKind::PlanInit,
            position: Position::ZERO,
        });
        self.set_level(EngineLevel::Initialized)?;
        self.set_progress(ProgressLevel::Initialized, &mut effects);
        effects.push(Effect::Publish(Event::SessionStarted {
            participant_id: self.participant_id.clone(),
        }));

        effects.extend(self.goto_step(StepTarget::Next)?);
        Ok(effects)
    }

    pub fn step(&mut self) -> Result<Vec<Effect>> {
        self.goto_step(StepTarget::Next)
    }

    pub fn goto_step(&mut self, target: StepTarget) -> Result<Vec<Effect>> {
        self.ensure_running("step")?;

        let resolved = match &target {
            StepTarget::Next => self.navigator.next(self.position)?,
            StepTarget::Gameover => NavTarget::GameOver,
            StepTarget::Position(position) => {
                NavTarget::Position(self.navigator.resolve(position)?)
            }
        };
        debug!(
            participant = %self.participant_id,
            from = %self.position,
            target = %target,
            resolved = ?resolved,
            "Resolved step target"
        );

        match resolved {
            NavTarget::Position(to) => self.transition(to),
            NavTarget::GameOver => self.gameover(),
            NavTarget::EndOfSequence => self.end_sequence(),
            NavTarget::Blocked => Ok(Vec::new()),
        }
    }

    /// Mark the current step finished. Completion lands on the next tick.
    pub fn done(&mut self) -> Result<Vec<Effect>> {
        if self.paused || self.level != EngineLevel::PlayingStep || !self.progress.accepts_done() {
            return Err(self.progress_precondition("done"));
        }
        let mut effects = Vec::new();
        self.set_progress(ProgressLevel::DoneRequested, &mut effects);
        self.set_progress(ProgressLevel::EvaluatingDone, &mut effects);
        effects.push(Effect::Defer(Deferred::CompleteDone {
            position: self.position,
        }));
        Ok(effects)
    }

    pub fn frame_loaded(&mut self) -> Result<Vec<Effect>> {
        if self.progress != ProgressLevel::LoadingFrame {
            return Err(self.progress_precondition("frame_loaded"));
        }
        let mut effects = Vec::new();
        self.set_progress(ProgressLevel::FrameLoaded, &mut effects);
        self.play(&mut effects)?;
        Ok(effects)
    }

    /// Outcome of the step callback. Hard errors go through [`Self::fail`].
    pub fn callback_finished(&mut self, signal: CallbackSignal) -> Result<Vec<Effect>> {
        if self.level != EngineLevel::PlayingStep
            || self.progress != ProgressLevel::ExecutingCallback
        {
            return Err(self.progress_precondition("callback_finished"));
        }
        let mut effects = Vec::new();
        self.set_progress(ProgressLevel::CallbackExecuted, &mut effects);

        match signal {
            CallbackSignal::Continue => {
                self.set_progress(ProgressLevel::Playing, &mut effects);
            }
            CallbackSignal::Done => {
                self.set_progress(ProgressLevel::Playing, &mut effects);
                effects.extend(self.done()?);
            }
            CallbackSignal::Failed(reason) => {
                warn!(
                    participant = %self.participant_id,
                    position = %self.position,
                    reason = %reason,
                    "Step callback reported failure"
                );
                effects.push(Effect::Publish(Event::error(
                    reason,
                    Some(format!("step callback at {}", self.position)),
                )));
            }
        }
        Ok(effects)
    }

    /// Play the callback again after it reported failure.
    pub fn retry_callback(&mut self) -> Result<Vec<Effect>> {
        if self.paused
            || self.level != EngineLevel::PlayingStep
            || self.progress != ProgressLevel::CallbackExecuted
        {
            return Err(self.progress_precondition("retry_callback"));
        }
        let mut effects = Vec::new();
        self.set_progress(ProgressLevel::ExecutingCallback, &mut effects);
        effects.push(Effect::ExecuteCallback {
            position: self.position,
        });
        Ok(effects)
    }

    /// Run a deferred action. Actions scheduled for a position the engine
    /// has since left, or that no longer fit its state, do nothing.
    pub fn run_deferred(&mut self, deferred: Deferred, roster: &Roster) -> Result<Vec<Effect>> {
        if deferred.position() != self.position
            || self.level != EngineLevel::PlayingStep
            || self.paused
        {
            debug!(participant = %self.participant_id, deferred = ?deferred, "Dropping stale deferred action");
            return Ok(Vec::new());
        }

        match deferred {
            Deferred::CompleteDone { .. } => {
                if self.progress != ProgressLevel::EvaluatingDone {
                    return Ok(Vec::new());
                }
                let mut effects = vec![Effect::StopTimer {
                    name: STEP_TIMER.to_string(),
                }];
                self.set_progress(ProgressLevel::Done, &mut effects);
                effects.push(Effect::Defer(Deferred::EvaluateStep {
                    position: self.position,
                }));
                Ok(effects)
            }
            Deferred::EvaluateStep { .. } => {
                if !self.progress.is_done() {
                    return Ok(Vec::new());
                }
                if self.should_step(roster, None) {
                    self.step()
                } else {
                    debug!(participant = %self.participant_id, position = %self.position, "Waiting to advance");
                    Ok(Vec::new())
                }
            }
        }
    }

    /// Whether the rule bound to the current position lets this participant
    /// advance. A violated participant-count threshold always says no.
    pub fn should_step(&self, roster: &Roster, level_override: Option<ProgressLevel>) -> bool {
        if self.thresholds.is_violated() {
            debug!(participant = %self.participant_id, "Threshold violated, holding position");
            return false;
        }
        let rule = self
            .navigator
            .rule_at(self.position)
            .unwrap_or(&self.default_rule);
        let ctx = RuleContext {
            position: self.position,
            progress: level_override.unwrap_or(self.progress),
            roster,
            steps_left: self.navigator.steps_left(self.position),
        };
        let allowed = self.rules.evaluate(rule, &ctx);
        debug!(
            participant = %self.participant_id,
            position = %self.position,
            rule = ?rule,
            allowed,
            "Evaluated advancement rule"
        );
        allowed
    }

    /// React to a roster change: recount participants for thresholds and,
    /// if this participant is waiting, evaluate again on the next tick.
    pub fn on_roster_update(&mut self, roster: &Roster) -> Vec<Effect> {
        self.participants = roster.len() + if self.observer { 0 } else { 1 };

        let mut effects: Vec<Effect> = Vec::new();
        if matches!(self.level, EngineLevel::StepInit | EngineLevel::PlayingStep) {
            effects.extend(
                self.thresholds
                    .evaluate(self.participants)
                    .into_iter()
                    .map(Effect::Threshold),
            );
        }
        if self.level == EngineLevel::PlayingStep && self.progress.is_done() && !self.paused {
            effects.push(Effect::Defer(Deferred::EvaluateStep {
                position: self.position,
            }));
        }
        effects
    }

    pub fn pause(&mut self) -> Result<Vec<Effect>> {
        self.ensure_running("pause")?;
        info!(participant = %self.participant_id, position = %self.position, "Pausing");

        let mut effects = Vec::new();
        self.resume_progress = Some(self.progress);
        self.paused = true;
        self.set_progress(ProgressLevel::Pausing, &mut effects);
        effects.push(Effect::PauseTimers);
        self.set_progress(ProgressLevel::Paused, &mut effects);
        effects.push(Effect::Publish(Event::Paused {
            participant_id: self.participant_id.clone(),
            position: self.position,
        }));
        Ok(effects)
    }

    /// Leave the pause, replay buffered messages and pick up where the
    /// participant was.
    pub fn resume(&mut self) -> Result<Vec<Effect>> {
        if !self.paused || !self.level.can_step() {
            return Err(self.progress_precondition("resume"));
        }
        info!(participant = %self.participant_id, position = %self.position, "Resuming");

        let mut effects = Vec::new();
        self.paused = false;
        self.set_progress(ProgressLevel::Resuming, &mut effects);
        effects.push(Effect::ResumeTimers);
        effects.push(Effect::ReplayBuffer);

        let restored = self.resume_progress.take().unwrap_or(ProgressLevel::Resumed);
        self.set_progress(restored, &mut effects);
        effects.push(Effect::Publish(Event::Resumed {
            participant_id: self.participant_id.clone(),
            position: self.position,
        }));

        match restored {
            ProgressLevel::EvaluatingDone => effects.push(Effect::Defer(Deferred::CompleteDone {
                position: self.position,
            })),
            ProgressLevel::Done => effects.push(Effect::Defer(Deferred::EvaluateStep {
                position: self.position,
            })),
            _ => {}
        }
        Ok(effects)
    }

    /// Run the plan teardown. Legal once per run.
    pub fn gameover(&mut self) -> Result<Vec<Effect>> {
        let reachable = matches!(
            self.level,
            EngineLevel::Initialized
                | EngineLevel::StepInit
                | EngineLevel::PlayingStep
                | EngineLevel::StepExit
                | EngineLevel::StageExit
                | EngineLevel::Finishing
        );
        if self.game_over || !reachable {
            return Err(OrchestratorError::precondition("gameover", self.level));
        }
        info!(participant = %self.participant_id, position = %self.position, "Game over");

        let mut effects = Vec::new();
        self.exit_current(&mut effects, true)?;
        self.paused = false;
        self.resume_progress = None;
        self.thresholds.clear();

        effects.push(Effect::StopTimers);
        effects.push(Effect::Hook {
            kind: HookKind::PlanTeardown,
            position: self.position,
        });
        self.set_level(EngineLevel::Gameover)?;
        self.game_over = true;
        self.set_progress(ProgressLevel::Done, &mut effects);
        effects.push(Effect::Publish(Event::GameOver {
            participant_id: self.participant_id.clone(),
        }));
        Ok(effects)
    }

    /// Discard all run state. Always legal.
    pub fn stop(&mut self) -> Vec<Effect> {
        info!(participant = %self.participant_id, level = %self.level.as_str(), "Stopping session");
        let effects = vec![
            Effect::StopTimers,
            Effect::ClearListeners(ListenerScope::Step),
            Effect::ClearListeners(ListenerScope::Stage),
            Effect::Publish(Event::SessionStopped {
                participant_id: self.participant_id.clone(),
            }),
            Effect::ClearListeners(ListenerScope::Session),
        ];

        self.level = EngineLevel::Uninitialized;
        self.progress = ProgressLevel::Uninitialized;
        self.position = Position::ZERO;
        self.properties.clear();
        self.paused = false;
        self.resume_progress = None;
        self.thresholds.clear();
        self.game_over = false;
        effects
    }

    /// A hook or callback raised an error. The engine stops at
    /// `runtime_error` until stopped.
    pub fn fail(&mut self, reason: &str) -> Vec<Effect> {
        error!(
            participant = %self.participant_id,
            position = %self.position,
            level = %self.level.as_str(),
            reason = %reason,
            "Runtime error"
        );
        self.level = EngineLevel::RuntimeError;
        vec![
            Effect::StopTimers,
            Effect::Publish(Event::error(reason, Some(self.position.to_string()))),
        ]
    }

    // ---- transitions ----

    fn transition(&mut self, to: Position) -> Result<Vec<Effect>> {
        if to.is_zero() {
            return Err(OrchestratorError::UnknownPosition(to.to_string()));
        }
        let from = self.position;
        let stage_changed = from.is_zero() || from.stage != to.stage;

        let mut effects = Vec::new();
        self.exit_current(&mut effects, stage_changed)?;

        info!(participant = %self.participant_id, from = %from, to = %to, "Entering step");
        self.position = to;
        self.properties = self.navigator.inherited_properties(to);
        let (stage_id, step_id) = self.ids(to);

        if stage_changed {
            self.set_level(EngineLevel::StageInit)?;
            effects.push(Effect::Hook {
                kind: HookKind::StageInit,
                position: to,
            });
            effects.push(Effect::Publish(Event::StageEntered {
                participant_id: self.participant_id.clone(),
                stage_id: stage_id.clone(),
                position: to,
            }));
        }

        self.set_level(EngineLevel::StepInit)?;
        self.set_progress(ProgressLevel::Initializing, &mut effects);
        effects.push(Effect::Hook {
            kind: HookKind::StepInit,
            position: to,
        });
        effects.push(Effect::Publish(Event::StepEntered {
            participant_id: self.participant_id.clone(),
            stage_id,
            step_id,
            position: to,
        }));

        let thresholds = self.navigator.thresholds_at(to).cloned().unwrap_or_default();
        self.thresholds.set(thresholds);
        effects.extend(
            self.thresholds
                .evaluate(self.participants)
                .into_iter()
                .map(Effect::Threshold),
        );

        if let Some(duration) = self.navigator.timer_at(to) {
            effects.push(Effect::StartTimer {
                name: STEP_TIMER.to_string(),
                duration,
            });
        }

        self.set_progress(ProgressLevel::Initialized, &mut effects);
        match self.navigator.frame_at(to).map(str::to_string) {
            Some(frame) => {
                self.set_progress(ProgressLevel::LoadingFrame, &mut effects);
                effects.push(Effect::LoadFrame {
                    frame,
                    position: to,
                });
            }
            None => self.play(&mut effects)?,
        }
        Ok(effects)
    }

    /// Exit hooks for the current step and, when `leave_stage`, its stage.
    fn exit_current(&mut self, effects: &mut Vec<Effect>, leave_stage: bool) -> Result<()> {
        let from = self.position;
        if from.is_zero()
            || !matches!(self.level, EngineLevel::StepInit | EngineLevel::PlayingStep)
        {
            return Ok(());
        }
        let (stage_id, step_id) = self.ids(from);

        self.set_level(EngineLevel::StepExit)?;
        self.set_progress(ProgressLevel::Exiting, effects);
        effects.push(Effect::Hook {
            kind: HookKind::StepExit,
            position: from,
        });
        effects.push(Effect::Publish(Event::StepExited {
            participant_id: self.participant_id.clone(),
            stage_id: stage_id.clone(),
            step_id,
            position: from,
        }));
        effects.push(Effect::ClearListeners(ListenerScope::Step));
        effects.push(Effect::StopTimer {
            name: STEP_TIMER.to_string(),
        });

        if leave_stage {
            self.set_level(EngineLevel::StageExit)?;
            effects.push(Effect::Hook {
                kind: HookKind::StageExit,
                position: from,
            });
            effects.push(Effect::Publish(Event::StageExited {
                participant_id: self.participant_id.clone(),
                stage_id,
                position: from,
            }));
            effects.push(Effect::ClearListeners(ListenerScope::Stage));
        }
        Ok(())
    }

    fn end_sequence(&mut self) -> Result<Vec<Effect>> {
        let mut effects = Vec::new();
        self.exit_current(&mut effects, true)?;
        self.set_level(EngineLevel::Finishing)?;
        info!(participant = %self.participant_id, position = %self.position, "Sequence ended");
        effects.push(Effect::Publish(Event::SequenceEnded {
            participant_id: self.participant_id.clone(),
            position: self.position,
        }));
        if self.auto_gameover {
            effects.extend(self.gameover()?);
        }
        Ok(effects)
    }

    fn play(&mut self, effects: &mut Vec<Effect>) -> Result<()> {
        self.set_level(EngineLevel::PlayingStep)?;
        self.set_progress(ProgressLevel::ExecutingCallback, effects);
        effects.push(Effect::ExecuteCallback {
            position: self.position,
        });
        Ok(())
    }

    fn set_level(&mut self, to: EngineLevel) -> Result<()> {
        LevelStateMachine::validate_transition(&self.level, &to)?;
        debug!(
            participant = %self.participant_id,
            from = %self.level.as_str(),
            to = %to.as_str(),
            "Engine level"
        );
        self.level = to;
        Ok(())
    }

    /// Every progress change is reported to the other participants.
    fn set_progress(&mut self, to: ProgressLevel, effects: &mut Vec<Effect>) {
        self.progress = to;
        effects.push(Effect::Report(self.report()));
        effects.push(Effect::Publish(Event::ProgressChanged {
            participant_id: self.participant_id.clone(),
            position: self.position,
            level: to,
        }));
    }

    fn ensure_running(&self, verb: &str) -> Result<()> {
        if !self.level.can_step() {
            return Err(OrchestratorError::precondition(verb, self.level));
        }
        if self.paused {
            return Err(OrchestratorError::Precondition {
                verb: verb.to_string(),
                level: "paused".to_string(),
            });
        }
        Ok(())
    }

    fn progress_precondition(&self, verb: &str) -> OrchestratorError {
        let state = if self.paused {
            "paused"
        } else {
            self.progress.as_str()
        };
        OrchestratorError::Precondition {
            verb: verb.to_string(),
            level: state.to_string(),
        }
    }

    fn ids(&self, pos: Position) -> (String, String) {
        (
            self.navigator.stage_id(pos).unwrap_or_default().to_string(),
            self.navigator.step_id(pos).unwrap_or_default().to_string(),
        )
    }
}

impl std::fmt::Debug for SessionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEngine")
            .field("participant_id", &self.participant_id)
            .field("level", &self.level)
            .field("progress", &self.progress)
            .field("position", &self.position)
            .field("paused", &self.paused)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleName;
    use crate::stager::{done_callback, StageDef, Stager, StepDef};
    use crate::thresholds::{ParticipantThresholds, Threshold};

    fn plan() -> Arc<Plan> {
        let mut stager = Stager::with_seed(3);
        for id in ["a1", "a2", "b1"] {
            stager.add_step(StepDef::with_callback(id, done_callback())).unwrap();
        }
        stager.add_stage(StageDef::with_steps("A", ["a1", "a2"])).unwrap();
        stager.add_stage(StageDef::with_steps("B", ["b1"])).unwrap();
        stager.stage("A").unwrap().stage("B").unwrap();
        stager.finalize().unwrap()
    }

    fn engine_with(plan: Arc<Plan>, config: EngineConfig) -> SessionEngine {
        SessionEngine::new(plan, RuleRegistry::builtin(), &config)
    }

    fn engine() -> SessionEngine {
        engine_with(plan(), EngineConfig::for_participant("p1"))
    }

    fn hooks(effects: &[Effect]) -> Vec<(HookKind, Position)> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Hook { kind, position } => Some((*kind, *position)),
                _ => None,
            })
            .collect()
    }

    fn deferred(effects: &[Effect]) -> Vec<Deferred> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Defer(d) => Some(*d),
                _ => None,
            })
            .collect()
    }

    /// Play the callback with `Done` and run deferred work to completion.
    fn finish_step(engine: &mut SessionEngine, roster: &Roster) -> Vec<Effect> {
        let mut all = engine.callback_finished(CallbackSignal::Done).unwrap();
        let mut queue = deferred(&all);
        while let Some(d) = queue.pop() {
            let effects = engine.run_deferred(d, roster).unwrap();
            queue.extend(deferred(&effects));
            all.extend(effects);
        }
        all
    }

    #[test]
    fn test_start_enters_first_step() {
        let mut engine = engine();
        let effects = engine.start().unwrap();

        assert_eq!(
            hooks(&effects),
            vec![
                (HookKind::PlanInit, Position::ZERO),
                (HookKind::StageInit, Position::new(1, 1, 1)),
                (HookKind::StepInit, Position::new(1, 1, 1)),
            ]
        );
        assert!(matches!(
            effects.last(),
            Some(Effect::ExecuteCallback { position }) if *position == Position::new(1, 1, 1)
        ));
        assert_eq!(engine.level(), EngineLevel::PlayingStep);
        assert_eq!(engine.progress(), ProgressLevel::ExecutingCallback);
    }

    #[test]
    fn test_verbs_outside_their_window() {
        let mut engine = engine();
        assert!(matches!(engine.step(), Err(OrchestratorError::Precondition { .. })));
        assert!(engine.pause().is_err());
        assert!(engine.resume().is_err());
        assert!(engine.gameover().is_err());

        engine.start().unwrap();
        assert!(engine.start().is_err());
        engine.pause().unwrap();
        assert!(engine.pause().is_err());
        assert!(engine.step().is_err());
        engine.resume().unwrap();
        assert!(engine.resume().is_err());

        engine.gameover().unwrap();
        assert!(engine.gameover().is_err());
        assert!(engine.step().is_err());
    }

    #[test]
    fn test_done_is_deferred_then_advances() {
        let mut engine = engine();
        let roster = Roster::new();
        engine.start().unwrap();

        let effects = engine.callback_finished(CallbackSignal::Done).unwrap();
        assert_eq!(engine.progress(), ProgressLevel::EvaluatingDone);
        assert_eq!(
            deferred(&effects),
            vec![Deferred::CompleteDone {
                position: Position::new(1, 1, 1)
            }]
        );

        let effects = engine
            .run_deferred(deferred(&effects)[0], &roster)
            .unwrap();
        assert_eq!(engine.progress(), ProgressLevel::Done);
        assert_eq!(engine.position(), Position::new(1, 1, 1));

        let effects = engine.run_deferred(deferred(&effects)[0], &roster).unwrap();
        assert_eq!(engine.position(), Position::new(1, 2, 1));
        assert_eq!(
            hooks(&effects),
            vec![
                (HookKind::StepExit, Position::new(1, 1, 1)),
                (HookKind::StepInit, Position::new(1, 2, 1)),
            ]
        );
    }

    #[test]
    fn test_stage_change_runs_stage_hooks() {
        let mut engine = engine();
        let roster = Roster::new();
        engine.start().unwrap();
        finish_step(&mut engine, &roster);
        let effects = finish_step(&mut engine, &roster);

        assert_eq!(engine.position(), Position::new(2, 1, 1));
        assert_eq!(
            hooks(&effects),
            vec![
                (HookKind::StepExit, Position::new(1, 2, 1)),
                (HookKind::StageExit, Position::new(1, 2, 1)),
                (HookKind::StageInit, Position::new(2, 1, 1)),
                (HookKind::StepInit, Position::new(2, 1, 1)),
            ]
        );
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::ClearListeners(ListenerScope::Stage))));
    }

    #[test]
    fn test_stale_deferred_is_dropped() {
        let mut engine = engine();
        let roster = Roster::new();
        engine.start().unwrap();
        let effects = engine.callback_finished(CallbackSignal::Done).unwrap();
        let pending = deferred(&effects)[0];

        engine
            .goto_step(StepTarget::Position("B.b1".parse().unwrap()))
            .unwrap();
        assert!(engine.run_deferred(pending, &roster).unwrap().is_empty());
        assert_eq!(engine.progress(), ProgressLevel::ExecutingCallback);
    }

    #[test]
    fn test_end_of_sequence_and_auto_gameover() {
        let roster = Roster::new();
        let mut engine = engine();
        engine.start().unwrap();
        for _ in 0..3 {
            finish_step(&mut engine, &roster);
        }
        assert_eq!(engine.level(), EngineLevel::Finishing);
        assert!(engine.step().is_err());
        engine.gameover().unwrap();
        assert_eq!(engine.level(), EngineLevel::Gameover);
        assert_eq!(engine.progress(), ProgressLevel::Done);

        let config = EngineConfig {
            auto_gameover: true,
            ..EngineConfig::for_participant("p2")
        };
        let mut engine = engine_with(plan(), config);
        engine.start().unwrap();
        let mut teardown = Vec::new();
        for _ in 0..3 {
            teardown.extend(hooks(&finish_step(&mut engine, &roster)));
        }
        assert_eq!(engine.level(), EngineLevel::Gameover);
        assert!(teardown.iter().any(|(kind, _)| *kind == HookKind::PlanTeardown));
    }

    #[test]
    fn test_failed_callback_holds_position_until_retry() {
        let mut engine = engine();
        engine.start().unwrap();

        let effects = engine
            .callback_finished(CallbackSignal::Failed("no data".into()))
            .unwrap();
        assert_eq!(engine.progress(), ProgressLevel::CallbackExecuted);
        assert!(deferred(&effects).is_empty());
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Publish(Event::Error { .. }))));

        let effects = engine.retry_callback().unwrap();
        assert!(matches!(effects.last(), Some(Effect::ExecuteCallback { .. })));
        assert!(engine.retry_callback().is_err());
    }

    #[test]
    fn test_pause_restores_progress_and_pending_done() {
        let mut engine = engine();
        let roster = Roster::new();
        engine.start().unwrap();
        let effects = engine.callback_finished(CallbackSignal::Done).unwrap();
        let pending = deferred(&effects)[0];

        let effects = engine.pause().unwrap();
        assert!(effects.iter().any(|e| matches!(e, Effect::PauseTimers)));
        assert!(engine.run_deferred(pending, &roster).unwrap().is_empty());
        assert!(engine.done().is_err());

        let effects = engine.resume().unwrap();
        assert_eq!(engine.progress(), ProgressLevel::EvaluatingDone);
        assert!(effects.iter().any(|e| matches!(e, Effect::ReplayBuffer)));
        assert_eq!(deferred(&effects), vec![pending]);
    }

    #[test]
    fn test_frame_is_loaded_before_callback() {
        let mut stager = Stager::with_seed(1);
        stager
            .add_step(StepDef::with_callback("s", done_callback()).with_frame("intro.html"))
            .unwrap();
        stager.add_stage(StageDef::with_steps("S", ["s"])).unwrap();
        stager.stage("S").unwrap();
        let mut engine = engine_with(stager.finalize().unwrap(), EngineConfig::for_participant("p1"));

        let effects = engine.start().unwrap();
        assert!(matches!(
            effects.last(),
            Some(Effect::LoadFrame { frame, .. }) if frame == "intro.html"
        ));
        assert_eq!(engine.progress(), ProgressLevel::LoadingFrame);
        assert!(engine.callback_finished(CallbackSignal::Done).is_err());

        let effects = engine.frame_loaded().unwrap();
        assert!(matches!(effects.last(), Some(Effect::ExecuteCallback { .. })));
        assert_eq!(engine.level(), EngineLevel::PlayingStep);
    }

    #[test]
    fn test_reports_precede_callback() {
        let mut engine = engine();
        let effects = engine.start().unwrap();
        let last_report = effects
            .iter()
            .rposition(|e| matches!(e, Effect::Report(_)))
            .unwrap();
        let callback = effects
            .iter()
            .position(|e| matches!(e, Effect::ExecuteCallback { .. }))
            .unwrap();
        assert!(last_report < callback);
    }

    #[test]
    fn test_sync_step_waits_for_roster() {
        let mut stager = Stager::with_seed(1);
        stager
            .add_step(StepDef::with_callback("s1", done_callback()).with_rule(RuleName::SyncStep))
            .unwrap();
        stager.add_step(StepDef::with_callback("s2", done_callback())).unwrap();
        stager.add_stage(StageDef::with_steps("S", ["s1", "s2"])).unwrap();
        stager.stage("S").unwrap();
        let mut engine = engine_with(stager.finalize().unwrap(), EngineConfig::for_participant("p1"));

        let here = Position::new(1, 1, 1);
        let mut roster = Roster::new();
        roster.apply(&RosterReport::new("p2", here, ProgressLevel::Playing));

        engine.start().unwrap();
        finish_step(&mut engine, &roster);
        assert_eq!(engine.progress(), ProgressLevel::Done);
        assert_eq!(engine.position(), here);
        assert!(!engine.should_step(&roster, None));

        roster.apply(&RosterReport::new("p2", here, ProgressLevel::Done));
        let effects = engine.on_roster_update(&roster);
        let pending = deferred(&effects);
        assert_eq!(pending, vec![Deferred::EvaluateStep { position: here }]);
        engine.run_deferred(pending[0], &roster).unwrap();
        assert_eq!(engine.position(), Position::new(1, 2, 1));
    }

    #[test]
    fn test_min_threshold_blocks_and_rearms() {
        let mut stager = Stager::with_seed(1);
        let thresholds = ParticipantThresholds {
            min: Some(Threshold::new(2)),
            ..Default::default()
        };
        stager
            .add_step(StepDef::with_callback("s", done_callback()).with_thresholds(thresholds))
            .unwrap();
        stager.add_stage(StageDef::with_steps("S", ["s"])).unwrap();
        stager.stage("S").unwrap();
        let mut engine = engine_with(stager.finalize().unwrap(), EngineConfig::for_participant("p1"));

        let mut roster = Roster::new();
        roster.join("p2");
        engine.on_roster_update(&roster);
        engine.start().unwrap();
        assert_eq!(engine.participant_count(), 2);
        assert!(engine.should_step(&roster, Some(ProgressLevel::Done)));

        roster.leave("p2");
        let effects = engine.on_roster_update(&roster);
        let changes: Vec<_> = effects
            .iter()
            .filter_map(|e| match e {
                Effect::Threshold(change) => Some(change.violated),
                _ => None,
            })
            .collect();
        assert_eq!(changes, vec![true]);
        assert!(!engine.should_step(&roster, Some(ProgressLevel::Done)));
        assert!(engine
            .on_roster_update(&roster)
            .iter()
            .all(|e| !matches!(e, Effect::Threshold(_))));

        roster.join("p3");
        let effects = engine.on_roster_update(&roster);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Threshold(change) if !change.violated)));
        assert!(engine.should_step(&roster, Some(ProgressLevel::Done)));
    }

    #[test]
    fn test_observer_does_not_count() {
        let config = EngineConfig {
            observer: true,
            ..EngineConfig::for_participant("watcher")
        };
        let mut engine = engine_with(plan(), config);
        let mut roster = Roster::new();
        roster.join("p2");
        engine.on_roster_update(&roster);
        assert_eq!(engine.participant_count(), 1);
        assert!(engine.is_observer());
    }

    #[test]
    fn test_stop_resets_everything() {
        let mut engine = engine();
        engine.start().unwrap();
        engine.pause().unwrap();
        let effects = engine.stop();
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::ClearListeners(ListenerScope::Session))));
        assert_eq!(engine.level(), EngineLevel::Uninitialized);
        assert_eq!(engine.position(), Position::ZERO);
        assert!(!engine.is_paused());
        engine.start().unwrap();
        assert_eq!(engine.position(), Position::new(1, 1, 1));
    }

    #[test]
    fn test_goto_unknown_position() {
        let mut engine = engine();
        engine.start().unwrap();
        let err = engine
            .goto_step(StepTarget::Position("C.c1".parse().unwrap()))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownPosition(_)));
        assert_eq!(engine.position(), Position::new(1, 1, 1));
    }

    #[test]
    fn test_fail_is_terminal_until_stop() {
        let mut engine = engine();
        engine.start().unwrap();
        engine.fail("boom");
        assert_eq!(engine.level(), EngineLevel::RuntimeError);
        assert!(engine.step().is_err());
        engine.stop();
        assert!(engine.start().is_ok());
    }
}
