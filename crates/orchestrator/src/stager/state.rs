//! Persisted form of a stager, for resuming a build later.
//!
//! Callbacks cannot be serialized. Step callbacks, loop predicates and hooks
//! are looked up again in a [`CallbackRegistry`] when the state is imported.
//! Custom (non-named) advancement rules are not persisted.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use cadence_core::{EntryKind, PlanEntry};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::definition::{HookFn, LoopCondition, StageDef, StepDef, StepFn};
use super::Stager;
use crate::block::PositionSpec;
use crate::context::Properties;
use crate::error::{OrchestratorError, Result};
use crate::rules::AdvancementRule;

/// One recorded sequencing call, replayed in order on import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SequenceOp {
    Stage {
        entry: String,
        kind: EntryKind,
        spec: PositionSpec,
        /// Steps the entry started with.
        steps: Vec<String>,
    },
    Step {
        id: String,
        spec: PositionSpec,
    },
    StageBlock {
        id: String,
        spec: PositionSpec,
    },
    StepBlock {
        id: String,
        spec: PositionSpec,
    },
    EndBlock,
    Gameover,
    SyncSteps {
        stage: String,
        old: Vec<String>,
        new: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub globals: Properties,
    #[serde(default)]
    pub synthetic: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub id: String,
    pub steps: Vec<String>,
    #[serde(default)]
    pub inline: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub globals: Properties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagerState {
    pub steps: BTreeMap<String, StepRecord>,
    /// In declaration order.
    pub stages: Vec<StageRecord>,
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    pub sequence: Vec<SequenceOp>,
    /// The flattened plan, if the stager was finalized when exported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Vec<PlanEntry>>,
    /// Advancement rule names referenced anywhere in the build.
    #[serde(default)]
    pub rules: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_rule: Option<String>,
    #[serde(default)]
    pub default_properties: Properties,
    #[serde(default)]
    pub default_globals: Properties,
    #[serde(default)]
    pub open_blocks: Vec<String>,
    #[serde(default)]
    pub skipped_stages: Vec<String>,
    #[serde(default)]
    pub skipped_steps: Vec<(String, String)>,
}

#[derive(Clone, Default)]
struct Hooks {
    init: Option<HookFn>,
    exit: Option<HookFn>,
}

/// Callbacks to re-attach when importing a [`StagerState`].
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    steps: HashMap<String, StepFn>,
    conditions: HashMap<String, LoopCondition>,
    step_hooks: HashMap<String, Hooks>,
    stage_hooks: HashMap<String, Hooks>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Callback for a step, or for an inline stage by its stage id.
    pub fn step(mut self, id: impl Into<String>, callback: StepFn) -> Self {
        self.steps.insert(id.into(), callback);
        self
    }

    /// Predicate for a loop entry, keyed by entry id.
    pub fn condition(
        mut self,
        entry: impl Into<String>,
        condition: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Self {
        self.conditions.insert(entry.into(), Arc::new(condition));
        self
    }

    pub fn step_init(mut self, id: impl Into<String>, hook: HookFn) -> Self {
        self.step_hooks.entry(id.into()).or_default().init = Some(hook);
        self
    }

    pub fn step_exit(mut self, id: impl Into<String>, hook: HookFn) -> Self {
        self.step_hooks.entry(id.into()).or_default().exit = Some(hook);
        self
    }

    pub fn stage_init(mut self, id: impl Into<String>, hook: HookFn) -> Self {
        self.stage_hooks.entry(id.into()).or_default().init = Some(hook);
        self
    }

    pub fn stage_exit(mut self, id: impl Into<String>, hook: HookFn) -> Self {
        self.stage_hooks.entry(id.into()).or_default().exit = Some(hook);
        self
    }
}

fn rule_name(rule: &Option<AdvancementRule>) -> Option<String> {
    rule.as_ref().and_then(|r| r.name()).map(str::to_string)
}

impl Stager {
    pub fn export_state(&self) -> StagerState {
        let steps = self
            .steps
            .values()
            .map(|s| {
                (
                    s.id.clone(),
                    StepRecord {
                        id: s.id.clone(),
                        rule: rule_name(&s.rule),
                        properties: s.properties.clone(),
                        globals: s.globals.clone(),
                        synthetic: s.synthetic,
                    },
                )
            })
            .collect();
        let stages = self
            .stage_order
            .iter()
            .filter_map(|id| self.stages.get(id))
            .map(|s| StageRecord {
                id: s.id.clone(),
                steps: s.steps.clone(),
                inline: s.inline,
                rule: rule_name(&s.rule),
                properties: s.properties.clone(),
                globals: s.globals.clone(),
            })
            .collect();

        let mut rules = BTreeSet::new();
        rules.extend(self.steps.values().filter_map(|s| rule_name(&s.rule)));
        rules.extend(self.stages.values().filter_map(|s| rule_name(&s.rule)));
        rules.extend(rule_name(&self.defaults.rule));

        StagerState {
            steps,
            stages,
            aliases: self.aliases.clone(),
            sequence: self.ops.clone(),
            plan: self.plan.as_ref().map(|p| p.entries().to_vec()),
            rules: rules.into_iter().collect(),
            default_rule: rule_name(&self.defaults.rule),
            default_properties: self.defaults.properties.clone(),
            default_globals: self.defaults.globals.clone(),
            open_blocks: self.open_blocks().iter().map(|s| s.to_string()).collect(),
            skipped_stages: self.skipped_stages.iter().cloned().collect(),
            skipped_steps: self.skipped_steps.iter().cloned().collect(),
        }
    }

    /// Rebuild declarations and the block hierarchy from an exported state.
    ///
    /// The stager must be empty. On error it is left empty again.
    pub fn import_state(&mut self, state: StagerState, registry: &CallbackRegistry) -> Result<()> {
        self.ensure_open()?;
        if !self.steps.is_empty() || !self.stages.is_empty() || !self.sequenced.is_empty() {
            return Err(OrchestratorError::invalid(
                "state can only be imported into an empty stager",
            ));
        }

        let result = self.apply_state(state, registry);
        if result.is_err() {
            let rng = self.rng.clone();
            *self = Self::with_rng(rng);
        }
        result
    }

    fn apply_state(&mut self, state: StagerState, registry: &CallbackRegistry) -> Result<()> {
        for (id, record) in state.steps {
            let mut def = if record.synthetic {
                StepDef::placeholder(id.clone())
            } else {
                let callback = registry.steps.get(&id).cloned().ok_or_else(|| {
                    OrchestratorError::invalid(format!("no callback registered for step {id}"))
                })?;
                StepDef::with_callback(id.clone(), callback)
            };
            def.rule = record.rule.map(AdvancementRule::Named);
            def.properties = record.properties;
            def.globals = record.globals;
            if let Some(hooks) = registry.step_hooks.get(&id) {
                def.init = hooks.init.clone();
                def.exit = hooks.exit.clone();
            }
            self.steps.insert(id, def);
        }

        for record in state.stages {
            for step in &record.steps {
                if !self.steps.contains_key(step) {
                    return Err(OrchestratorError::UnknownStep(step.clone()));
                }
            }
            let mut def = StageDef::new(record.id.clone());
            def.steps = record.steps;
            def.inline = record.inline;
            def.rule = record.rule.map(AdvancementRule::Named);
            def.properties = record.properties;
            def.globals = record.globals;
            if let Some(hooks) = registry.stage_hooks.get(&record.id) {
                def.init = hooks.init.clone();
                def.exit = hooks.exit.clone();
            }
            self.stage_order.push(record.id.clone());
            self.stages.insert(record.id, def);
        }

        for (alias, stage) in &state.aliases {
            if !self.stages.contains_key(stage) {
                return Err(OrchestratorError::UnknownStage(stage.clone()));
            }
            self.aliases.insert(alias.clone(), stage.clone());
        }

        self.defaults.rule = state.default_rule.map(AdvancementRule::Named);
        self.defaults.properties = state.default_properties;
        self.defaults.globals = state.default_globals;

        self.replaying = true;
        let replayed = self.replay(&state.sequence, registry);
        self.replaying = false;
        replayed?;

        self.skipped_stages = state.skipped_stages.into_iter().collect();
        self.skipped_steps = state.skipped_steps.into_iter().collect();
        info!(
            steps = self.steps.len(),
            stages = self.stages.len(),
            ops = state.sequence.len(),
            "Stager state imported"
        );
        Ok(())
    }

    fn replay(&mut self, ops: &[SequenceOp], registry: &CallbackRegistry) -> Result<()> {
        for op in ops {
            match op {
                SequenceOp::Stage {
                    entry,
                    kind,
                    spec,
                    steps,
                } => {
                    let condition = if kind.is_looping() {
                        Some(registry.conditions.get(entry).cloned().ok_or_else(|| {
                            OrchestratorError::invalid(format!(
                                "no condition registered for {entry}"
                            ))
                        })?)
                    } else {
                        None
                    };
                    self.push_stage(entry, *kind, spec.clone(), condition, Some(steps.clone()))?;
                }
                SequenceOp::Step { id, spec } => {
                    self.step_at(id, spec.clone())?;
                }
                SequenceOp::StageBlock { id, spec } => {
                    self.stage_block(id, spec.clone())?;
                }
                SequenceOp::StepBlock { id, spec } => {
                    self.step_block(id, spec.clone())?;
                }
                SequenceOp::EndBlock => {
                    self.end_block()?;
                }
                SequenceOp::Gameover => {
                    self.gameover()?;
                }
                SequenceOp::SyncSteps { stage, old, new } => {
                    self.sync_steps_blocks(stage, old, new)?;
                }
            }
        }
        Ok(())
    }
}
