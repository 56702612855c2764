//! Walks a finalized plan.
//!
//! Stage ordinals in a [`Position`] index plan entries (1-based). A plan
//! without entries runs in flexible mode: ordinals then index the declared
//! stages and the next stage is chosen by callbacks at run time.

use std::sync::Arc;
use std::time::Duration;

use cadence_core::{Coord, EntryKind, Position, PositionRef};
use serde_json::Value;
use tracing::debug;

use crate::context::Properties;
use crate::error::{OrchestratorError, Result};
use crate::plan::Plan;
use crate::rules::AdvancementRule;
use crate::stager::{StageDef, StepDef};
use crate::thresholds::ParticipantThresholds;

/// Stage id a flexible-mode chooser returns to end the session.
pub const GAMEOVER_STAGE: &str = "gameover";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavTarget {
    Position(Position),
    /// No entries remain.
    EndOfSequence,
    /// The next entry is the gameover sentinel.
    GameOver,
    /// A loop predicate would have to be evaluated.
    Blocked,
}

impl NavTarget {
    pub fn position(&self) -> Option<Position> {
        match self {
            NavTarget::Position(pos) => Some(*pos),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlanNavigator {
    plan: Arc<Plan>,
}

impl PlanNavigator {
    pub fn new(plan: Arc<Plan>) -> Self {
        Self { plan }
    }

    pub fn plan(&self) -> &Arc<Plan> {
        &self.plan
    }

    pub fn is_flexible(&self) -> bool {
        self.plan.is_flexible()
    }

    // ---- movement ----

    /// Position after `pos`, evaluating loop predicates.
    pub fn next(&self, pos: Position) -> Result<NavTarget> {
        self.next_with(pos, true)
    }

    /// With `evaluate` off, a loop decision yields [`NavTarget::Blocked`].
    pub fn next_with(&self, pos: Position, evaluate: bool) -> Result<NavTarget> {
        if self.is_flexible() {
            return self.flexible_next(pos);
        }
        if pos.is_zero() {
            return Ok(self.enter_from(0, evaluate));
        }
        let index = self.entry_index(pos)?;
        let entry = &self.plan.entries[index];

        if pos.step < entry.step_count() {
            return Ok(NavTarget::Position(Position::new(pos.stage, pos.step + 1, pos.round)));
        }
        match entry.kind {
            EntryKind::Repeat { num } if pos.round < num => {
                return Ok(NavTarget::Position(Position::new(pos.stage, 1, pos.round + 1)));
            }
            EntryKind::Loop | EntryKind::DoLoop => {
                if !evaluate {
                    return Ok(NavTarget::Blocked);
                }
                if self.condition_holds(index) {
                    return Ok(NavTarget::Position(Position::new(pos.stage, 1, pos.round + 1)));
                }
            }
            _ => {}
        }
        Ok(self.enter_from(index + 1, evaluate))
    }

    /// Scan forward from a 0-based entry index for the next entry to enter.
    /// `loop` entries whose predicate fails are passed over; the scan ends at
    /// the end of the plan.
    fn enter_from(&self, start: usize, evaluate: bool) -> NavTarget {
        for (index, entry) in self.plan.entries.iter().enumerate().skip(start) {
            match entry.kind {
                EntryKind::Gameover => return NavTarget::GameOver,
                EntryKind::Loop => {
                    if !evaluate {
                        return NavTarget::Blocked;
                    }
                    if self.condition_holds(index) {
                        return NavTarget::Position(Position::new(index as u32 + 1, 1, 1));
                    }
                    debug!(stage = %entry.id, "Loop condition false, passing over");
                }
                _ => return NavTarget::Position(Position::new(index as u32 + 1, 1, 1)),
            }
        }
        NavTarget::EndOfSequence
    }

    /// Position before `pos`. `(0,0,0)` maps to itself, and the first step
    /// of the first entered stage maps to `(0,0,0)`.
    pub fn previous(&self, pos: Position) -> Result<NavTarget> {
        self.previous_with(pos, true)
    }

    pub fn previous_with(&self, pos: Position, evaluate: bool) -> Result<NavTarget> {
        if pos.is_zero() {
            return Ok(NavTarget::Position(Position::ZERO));
        }
        if self.is_flexible() {
            return self.flexible_previous(pos);
        }
        let index = self.entry_index(pos)?;
        let entry = &self.plan.entries[index];

        if pos.step > 1 {
            return Ok(NavTarget::Position(Position::new(pos.stage, pos.step - 1, pos.round)));
        }
        if pos.round > 1 {
            return Ok(NavTarget::Position(Position::new(
                pos.stage,
                entry.step_count(),
                pos.round - 1,
            )));
        }

        for back in (0..index).rev() {
            let entry = &self.plan.entries[back];
            let stage = back as u32 + 1;
            let last = entry.step_count();
            match entry.kind {
                EntryKind::Gameover => continue,
                EntryKind::Repeat { num } => {
                    return Ok(NavTarget::Position(Position::new(stage, last, num)));
                }
                EntryKind::Loop => {
                    if !evaluate {
                        return Ok(NavTarget::Blocked);
                    }
                    if self.condition_holds(back) {
                        return Ok(NavTarget::Position(Position::new(stage, last, 1)));
                    }
                }
                EntryKind::Plain | EntryKind::DoLoop => {
                    return Ok(NavTarget::Position(Position::new(stage, last, 1)));
                }
            }
        }
        Ok(NavTarget::Position(Position::ZERO))
    }

    /// Apply `next` (positive delta) or `previous` (negative) repeatedly.
    /// Stops early at the first non-position result.
    pub fn jump(&self, pos: Position, delta: i32, evaluate: bool) -> Result<NavTarget> {
        let mut target = NavTarget::Position(pos);
        for _ in 0..delta.unsigned_abs() {
            let NavTarget::Position(current) = target else {
                break;
            };
            target = if delta > 0 {
                self.next_with(current, evaluate)?
            } else {
                self.previous_with(current, evaluate)?
            };
        }
        Ok(target)
    }

    fn condition_holds(&self, index: usize) -> bool {
        self.plan.condition(index).is_some_and(|condition| condition())
    }

    // ---- flexible mode ----

    fn flexible_next(&self, pos: Position) -> Result<NavTarget> {
        let flexible = self.plan.flexible();
        if pos.is_zero() {
            let first = match flexible.next_after(None) {
                Some(chooser) => chooser(None),
                None => self.plan.stage_order().first().cloned(),
            };
            return self.flexible_enter(first.as_deref(), pos);
        }

        let stage_id = self.flexible_stage_id(pos)?;
        let count = self.flexible_step_count(stage_id);
        if pos.step < count {
            return Ok(NavTarget::Position(Position::new(pos.stage, pos.step + 1, pos.round)));
        }
        let chosen = flexible.next_after(Some(stage_id)).and_then(|chooser| chooser(Some(stage_id)));
        self.flexible_enter(chosen.as_deref(), pos)
    }

    fn flexible_enter(&self, chosen: Option<&str>, from: Position) -> Result<NavTarget> {
        let Some(chosen) = chosen else {
            return Ok(NavTarget::EndOfSequence);
        };
        if chosen == GAMEOVER_STAGE {
            return Ok(NavTarget::GameOver);
        }
        let stage = self.flexible_ordinal(chosen)?;
        if !from.is_zero() && stage == from.stage {
            return Ok(NavTarget::Position(Position::new(stage, 1, from.round + 1)));
        }
        Ok(NavTarget::Position(Position::new(stage, 1, 1)))
    }

    fn flexible_previous(&self, pos: Position) -> Result<NavTarget> {
        let stage_id = self.flexible_stage_id(pos)?;
        if pos.step > 1 {
            return Ok(NavTarget::Position(Position::new(pos.stage, pos.step - 1, pos.round)));
        }
        let chosen = self
            .plan
            .flexible()
            .previous_before(Some(stage_id))
            .and_then(|chooser| chooser(Some(stage_id)));
        let Some(chosen) = chosen else {
            return Ok(NavTarget::Position(Position::ZERO));
        };
        let stage = self.flexible_ordinal(&chosen)?;
        let last = self.flexible_step_count(&chosen);
        if stage == pos.stage {
            if pos.round > 1 {
                return Ok(NavTarget::Position(Position::new(stage, last, pos.round - 1)));
            }
            return Ok(NavTarget::Position(Position::ZERO));
        }
        Ok(NavTarget::Position(Position::new(stage, last, 1)))
    }

    fn flexible_ordinal(&self, stage_id: &str) -> Result<u32> {
        let stage_id = self
            .plan
            .aliases
            .get(stage_id)
            .map(String::as_str)
            .unwrap_or(stage_id);
        self.plan
            .stage_order()
            .iter()
            .position(|s| s == stage_id)
            .map(|i| i as u32 + 1)
            .ok_or_else(|| OrchestratorError::UnknownStage(stage_id.to_string()))
    }

    fn flexible_stage_id(&self, pos: Position) -> Result<&str> {
        self.plan
            .stage_order()
            .get((pos.stage as usize).wrapping_sub(1))
            .map(String::as_str)
            .ok_or_else(|| OrchestratorError::UnknownPosition(pos.to_string()))
    }

    fn flexible_step_count(&self, stage_id: &str) -> u32 {
        self.plan
            .stage(stage_id)
            .map(|s| s.steps.len() as u32)
            .unwrap_or(0)
    }

    // ---- lookups ----

    fn entry_index(&self, pos: Position) -> Result<usize> {
        let index = (pos.stage as usize).wrapping_sub(1);
        match self.plan.entry(index) {
            Some(entry) if !entry.is_gameover() && pos.step >= 1 && pos.step <= entry.step_count() => {
                Ok(index)
            }
            _ => Err(OrchestratorError::UnknownPosition(pos.to_string())),
        }
    }

    /// Ordered step ids of the stage at `pos`.
    fn steps_at(&self, pos: Position) -> Option<&[String]> {
        if pos.is_zero() {
            return None;
        }
        if self.is_flexible() {
            let id = self.plan.stage_order().get((pos.stage as usize).wrapping_sub(1))?;
            return self.plan.stage(id).map(|s| s.steps.as_slice());
        }
        self.plan
            .entry((pos.stage as usize).wrapping_sub(1))
            .map(|e| e.steps.as_slice())
    }

    /// Entry id (the stage id or its alias) at `pos`.
    pub fn stage_id(&self, pos: Position) -> Option<&str> {
        if pos.is_zero() {
            return None;
        }
        if self.is_flexible() {
            return self
                .plan
                .stage_order()
                .get((pos.stage as usize).wrapping_sub(1))
                .map(String::as_str);
        }
        self.plan
            .entry((pos.stage as usize).wrapping_sub(1))
            .map(|e| e.id.as_str())
    }

    pub fn step_id(&self, pos: Position) -> Option<&str> {
        let steps = self.steps_at(pos)?;
        steps.get((pos.step as usize).checked_sub(1)?).map(String::as_str)
    }

    pub fn step_count(&self, pos: Position) -> u32 {
        self.steps_at(pos).map(|s| s.len() as u32).unwrap_or(0)
    }

    pub fn is_first_step(&self, pos: Position) -> bool {
        !pos.is_zero() && pos.step == 1
    }

    pub fn is_last_step(&self, pos: Position) -> bool {
        !pos.is_zero() && pos.step == self.step_count(pos)
    }

    /// Steps after `pos` in its stage.
    pub fn steps_left(&self, pos: Position) -> u32 {
        self.step_count(pos).saturating_sub(pos.step)
    }

    pub fn step_def(&self, pos: Position) -> Option<&StepDef> {
        self.step_id(pos).and_then(|id| self.plan.step(id))
    }

    pub fn stage_def(&self, pos: Position) -> Option<&StageDef> {
        self.stage_id(pos).and_then(|id| self.plan.stage(id))
    }

    /// Turn a caller-supplied position, possibly symbolic, into a concrete
    /// position in this plan.
    pub fn resolve(&self, target: &PositionRef) -> Result<Position> {
        let unknown = || OrchestratorError::UnknownPosition(target.to_string());
        if target.stage == Coord::Ordinal(0)
            && target.step == Coord::Ordinal(0)
            && target.round == 0
        {
            return Ok(Position::ZERO);
        }
        if target.round == 0 {
            return Err(unknown());
        }

        let stage = match &target.stage {
            Coord::Ordinal(n) => *n,
            Coord::Name(name) => self.find_stage(name).ok_or_else(unknown)?,
        };
        let probe = Position::new(stage, 1, 1);
        if stage == 0 || self.steps_at(probe).is_none() {
            return Err(unknown());
        }
        if !self.is_flexible() && self.entry_index(probe).is_err() {
            return Err(unknown());
        }

        let steps = self.steps_at(probe).unwrap_or(&[]);
        let step = match &target.step {
            Coord::Ordinal(n) if *n >= 1 && (*n as usize) <= steps.len() => *n,
            Coord::Ordinal(_) => return Err(unknown()),
            Coord::Name(name) => steps
                .iter()
                .position(|s| s == name)
                .map(|i| i as u32 + 1)
                .ok_or_else(unknown)?,
        };
        Ok(Position::new(stage, step, target.round))
    }

    fn find_stage(&self, name: &str) -> Option<u32> {
        if self.is_flexible() {
            return self.flexible_ordinal(name).ok();
        }
        let entries = self.plan.entries();
        entries
            .iter()
            .position(|e| e.id == name)
            .or_else(|| {
                entries.iter().position(|e| {
                    self.plan.aliases.get(&e.id).map(String::as_str) == Some(name)
                })
            })
            .map(|i| i as u32 + 1)
    }

    // ---- inherited values ----

    /// Named property: step, then stage, then plan default.
    pub fn get_property(&self, pos: Position, name: &str) -> Option<&Value> {
        self.step_def(pos)
            .and_then(|s| s.properties.get(name))
            .or_else(|| self.stage_def(pos).and_then(|s| s.properties.get(name)))
            .or_else(|| self.plan.defaults().properties.get(name))
    }

    /// Global variable, resolved like [`Self::get_property`].
    pub fn get_global(&self, pos: Position, name: &str) -> Option<&Value> {
        self.step_def(pos)
            .and_then(|s| s.globals.get(name))
            .or_else(|| self.stage_def(pos).and_then(|s| s.globals.get(name)))
            .or_else(|| self.plan.defaults().globals.get(name))
    }

    /// Every property visible at `pos`, more specific levels winning.
    pub fn inherited_properties(&self, pos: Position) -> Properties {
        let mut merged = self.plan.defaults().properties.clone();
        if let Some(stage) = self.stage_def(pos) {
            merged.extend(stage.properties.clone());
        }
        if let Some(step) = self.step_def(pos) {
            merged.extend(step.properties.clone());
        }
        merged
    }

    pub fn rule_at(&self, pos: Position) -> Option<&AdvancementRule> {
        self.step_def(pos)
            .and_then(|s| s.rule.as_ref())
            .or_else(|| self.stage_def(pos).and_then(|s| s.rule.as_ref()))
            .or(self.plan.defaults().rule.as_ref())
    }

    pub fn thresholds_at(&self, pos: Position) -> Option<&ParticipantThresholds> {
        self.step_def(pos)
            .and_then(|s| s.thresholds.as_ref())
            .or_else(|| self.stage_def(pos).and_then(|s| s.thresholds.as_ref()))
            .or(self.plan.defaults().thresholds.as_ref())
    }

    /// Step deadline from the `timer` property, in milliseconds.
    pub fn timer_at(&self, pos: Position) -> Option<Duration> {
        self.get_property(pos, "timer")
            .and_then(Value::as_u64)
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Frame to present from the `frame` property.
    pub fn frame_at(&self, pos: Position) -> Option<&str> {
        self.get_property(pos, "frame").and_then(Value::as_str)
    }
}
