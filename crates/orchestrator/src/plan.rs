use std::collections::{BTreeMap, HashMap};
use std::fmt;

use cadence_core::PlanEntry;

use crate::context::Properties;
use crate::rules::AdvancementRule;
use crate::stager::{HookFn, LoopCondition, NextStageFn, StageDef, StepDef};
use crate::thresholds::ParticipantThresholds;

/// Plan-wide fallbacks at the bottom of the step → stage → default chain,
/// plus the one-time init and teardown hooks.
#[derive(Clone, Default)]
pub struct Defaults {
    pub rule: Option<AdvancementRule>,
    pub properties: Properties,
    pub globals: Properties,
    pub thresholds: Option<ParticipantThresholds>,
    pub on_init: Option<HookFn>,
    pub on_gameover: Option<HookFn>,
}

impl fmt::Debug for Defaults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Defaults")
            .field("rule", &self.rule)
            .field("properties", &self.properties)
            .field("globals", &self.globals)
            .field("on_init", &self.on_init.is_some())
            .field("on_gameover", &self.on_gameover.is_some())
            .finish_non_exhaustive()
    }
}

/// Stage choosers used when the plan has no entries.
#[derive(Clone, Default)]
pub struct FlexibleCallbacks {
    pub next: Option<NextStageFn>,
    pub next_for: HashMap<String, NextStageFn>,
    pub previous: Option<NextStageFn>,
    pub previous_for: HashMap<String, NextStageFn>,
}

impl FlexibleCallbacks {
    pub fn next_after(&self, stage: Option<&str>) -> Option<&NextStageFn> {
        stage
            .and_then(|id| self.next_for.get(id))
            .or(self.next.as_ref())
    }

    pub fn previous_before(&self, stage: Option<&str>) -> Option<&NextStageFn> {
        stage
            .and_then(|id| self.previous_for.get(id))
            .or(self.previous.as_ref())
    }
}

impl fmt::Debug for FlexibleCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlexibleCallbacks")
            .field("next", &self.next.is_some())
            .field("next_for", &self.next_for.keys().collect::<Vec<_>>())
            .field("previous", &self.previous.is_some())
            .field("previous_for", &self.previous_for.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// The finalized, read-only output of the stager.
#[derive(Clone, Default)]
pub struct Plan {
    pub(crate) entries: Vec<PlanEntry>,
    pub(crate) conditions: HashMap<usize, LoopCondition>,
    pub(crate) steps: BTreeMap<String, StepDef>,
    pub(crate) stages: BTreeMap<String, StageDef>,
    pub(crate) aliases: BTreeMap<String, String>,
    pub(crate) defaults: Defaults,
    pub(crate) flexible: FlexibleCallbacks,
    pub(crate) stage_order: Vec<String>,
}

impl Plan {
    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }

    pub fn entry(&self, index: usize) -> Option<&PlanEntry> {
        self.entries.get(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// No entries: stages are chosen one at a time by callbacks.
    pub fn is_flexible(&self) -> bool {
        self.entries.is_empty()
    }

    /// Loop predicate of the entry at a 0-based index.
    pub fn condition(&self, index: usize) -> Option<&LoopCondition> {
        self.conditions.get(&index)
    }

    pub fn step(&self, id: &str) -> Option<&StepDef> {
        self.steps.get(id)
    }

    /// Stage definition by stage id or alias.
    pub fn stage(&self, id: &str) -> Option<&StageDef> {
        let id = self.aliases.get(id).map(String::as_str).unwrap_or(id);
        self.stages.get(id)
    }

    pub fn defaults(&self) -> &Defaults {
        &self.defaults
    }

    pub fn flexible(&self) -> &FlexibleCallbacks {
        &self.flexible
    }

    /// Declared stages in declaration order.
    pub fn stage_order(&self) -> &[String] {
        &self.stage_order
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.entries)
    }
}

impl fmt::Debug for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plan")
            .field("entries", &self.entries)
            .field("conditions", &self.conditions.keys().collect::<Vec<_>>())
            .field("defaults", &self.defaults)
            .field("flexible", &self.flexible)
            .finish_non_exhaustive()
    }
}
