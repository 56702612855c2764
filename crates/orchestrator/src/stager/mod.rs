//! Sequence builder.
//!
//! A [`Stager`] collects step and stage declarations, sequences them into a
//! hierarchy of [`Block`]s and flattens that hierarchy into a [`Plan`].
//! Declarations are validated before anything is mutated, so a rejected
//! call leaves the stager as it was.

mod definition;
mod state;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use cadence_core::{EntryKind, PlanEntry};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::block::{
    Block, BlockCursor, BlockId, BlockItem, BlockKind, BlockSet, PositionSpec, StageUnit, StepUnit,
};
use crate::error::{OrchestratorError, Result};
use crate::plan::{Defaults, FlexibleCallbacks, Plan};
use crate::rules::AdvancementRule;
use crate::thresholds::ParticipantThresholds;

pub use definition::{
    callback, done_callback, hook, HookFn, LoopCondition, MessageFn, NextStageFn, ReplayFn,
    StageDef, StagePatch, StepDef, StepFn, StepPatch,
};
pub use state::{CallbackRegistry, SequenceOp, StageRecord, StagerState, StepRecord};

const ROOT_BLOCK: &str = "sequence";
const GAMEOVER_ID: &str = "gameover";

#[derive(Debug, Clone)]
struct CurrentStage {
    stage: String,
    steps_block: BlockId,
}

pub struct Stager {
    steps: BTreeMap<String, StepDef>,
    stages: BTreeMap<String, StageDef>,
    aliases: BTreeMap<String, String>,
    stage_order: Vec<String>,
    blocks: BlockSet,
    root: BlockId,
    open: Vec<BlockId>,
    open_backup: Option<Vec<BlockId>>,
    current: Option<CurrentStage>,
    /// Sequenced entry ids in call order.
    sequenced: Vec<String>,
    steps_blocks: BTreeMap<String, Vec<BlockId>>,
    conditions: HashMap<String, LoopCondition>,
    ops: Vec<SequenceOp>,
    skipped_stages: BTreeSet<String>,
    skipped_steps: BTreeSet<(String, String)>,
    defaults: Defaults,
    flexible: FlexibleCallbacks,
    plan: Option<Arc<Plan>>,
    rng: StdRng,
    /// Set while an exported sequence is replayed; definitions are final.
    replaying: bool,
}

impl Stager {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }

    /// Deterministic block ordering, for tests and replays.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        let (blocks, root) = BlockSet::with_root(Block::new(ROOT_BLOCK, BlockKind::EnclosingStages));
        Self {
            steps: BTreeMap::new(),
            stages: BTreeMap::new(),
            aliases: BTreeMap::new(),
            stage_order: Vec::new(),
            blocks,
            root,
            open: Vec::new(),
            open_backup: None,
            current: None,
            sequenced: Vec::new(),
            steps_blocks: BTreeMap::new(),
            conditions: HashMap::new(),
            ops: Vec::new(),
            skipped_stages: BTreeSet::new(),
            skipped_steps: BTreeSet::new(),
            defaults: Defaults::default(),
            flexible: FlexibleCallbacks::default(),
            plan: None,
            rng,
            replaying: false,
        }
    }

    // ---- declarations ----

    pub fn add_step(&mut self, def: StepDef) -> Result<&mut Self> {
        self.ensure_open()?;
        if def.id.is_empty() {
            return Err(OrchestratorError::invalid("step id must not be empty"));
        }
        if self.steps.contains_key(&def.id) {
            return Err(OrchestratorError::DuplicateId(format!("step {}", def.id)));
        }
        debug!(step = %def.id, "Step declared");
        self.steps.insert(def.id.clone(), def);
        Ok(self)
    }

    pub fn add_stage(&mut self, mut def: StageDef) -> Result<&mut Self> {
        self.ensure_open()?;
        if def.id.is_empty() {
            return Err(OrchestratorError::invalid("stage id must not be empty"));
        }
        if self.stages.contains_key(&def.id) || self.aliases.contains_key(&def.id) {
            return Err(OrchestratorError::DuplicateId(format!("stage {}", def.id)));
        }

        let mut implied_step = None;
        match def.callback.take() {
            Some(_) if !def.steps.is_empty() => {
                return Err(OrchestratorError::invalid(format!(
                    "stage {} declares both steps and an inline callback",
                    def.id
                )));
            }
            Some(callback) => {
                if self.steps.contains_key(&def.id) {
                    return Err(OrchestratorError::DuplicateId(format!("step {}", def.id)));
                }
                implied_step = Some(StepDef::with_callback(def.id.clone(), callback));
                def.steps = vec![def.id.clone()];
                def.inline = true;
            }
            None if def.steps.is_empty() => {
                if !self.steps.contains_key(&def.id) {
                    implied_step = Some(StepDef::placeholder(def.id.clone()));
                }
                def.steps = vec![def.id.clone()];
            }
            None => self.validate_steps(&def.id, &def.steps)?,
        }

        if let Some(step) = implied_step {
            self.steps.insert(step.id.clone(), step);
        }
        debug!(stage = %def.id, steps = def.steps.len(), "Stage declared");
        self.stage_order.push(def.id.clone());
        self.stages.insert(def.id.clone(), def);
        Ok(self)
    }

    /// Bind an alternate name to a declared stage, so the stage can appear
    /// in the sequence more than once.
    pub fn alias(&mut self, stage: &str, alias: &str) -> Result<&mut Self> {
        self.ensure_open()?;
        if !self.stages.contains_key(stage) {
            return Err(OrchestratorError::UnknownStage(stage.to_string()));
        }
        if alias.is_empty() || alias == stage {
            return Err(OrchestratorError::invalid(format!(
                "alias '{alias}' must be non-empty and differ from {stage}"
            )));
        }
        if self.stages.contains_key(alias) || self.aliases.contains_key(alias) {
            return Err(OrchestratorError::DuplicateId(format!("stage {alias}")));
        }
        self.aliases.insert(alias.to_string(), stage.to_string());
        Ok(self)
    }

    pub fn replace_step(&mut self, id: &str, def: StepDef) -> Result<&mut Self> {
        self.ensure_open()?;
        if def.id != id {
            return Err(OrchestratorError::invalid(format!(
                "cannot change step id {id} to {}",
                def.id
            )));
        }
        let slot = self
            .steps
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::UnknownStep(id.to_string()))?;
        *slot = def;
        Ok(self)
    }

    pub fn merge_step(&mut self, id: &str, patch: StepPatch) -> Result<&mut Self> {
        self.ensure_open()?;
        let def = self
            .steps
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::UnknownStep(id.to_string()))?;
        patch.apply(def);
        Ok(self)
    }

    pub fn replace_stage(&mut self, id: &str, mut def: StageDef) -> Result<&mut Self> {
        self.ensure_open()?;
        if def.id != id {
            return Err(OrchestratorError::invalid(format!(
                "cannot change stage id {id} to {}",
                def.id
            )));
        }
        if def.callback.is_some() {
            return Err(OrchestratorError::invalid(format!(
                "stage {id} cannot switch to an inline callback"
            )));
        }
        let old_steps = self
            .stages
            .get(id)
            .map(|s| s.steps.clone())
            .ok_or_else(|| OrchestratorError::UnknownStage(id.to_string()))?;
        self.validate_steps(id, &def.steps)?;

        if self.steps_blocks.contains_key(id) {
            self.sync_steps_blocks(id, &old_steps, &def.steps)?;
        }
        def.inline = false;
        self.stages.insert(id.to_string(), def);
        Ok(self)
    }

    pub fn merge_stage(&mut self, id: &str, patch: StagePatch) -> Result<&mut Self> {
        self.ensure_open()?;
        let old_steps = self
            .stages
            .get(id)
            .map(|s| s.steps.clone())
            .ok_or_else(|| OrchestratorError::UnknownStage(id.to_string()))?;
        if let Some(steps) = &patch.steps {
            self.validate_steps(id, steps)?;
            if self.steps_blocks.contains_key(id) {
                self.sync_steps_blocks(id, &old_steps, steps)?;
            }
        }
        if let Some(def) = self.stages.get_mut(id) {
            patch.apply(def);
        }
        Ok(self)
    }

    fn validate_steps(&self, stage: &str, steps: &[String]) -> Result<()> {
        if steps.is_empty() {
            return Err(OrchestratorError::invalid(format!(
                "stage {stage} needs at least one step"
            )));
        }
        let mut seen = BTreeSet::new();
        for step in steps {
            if !self.steps.contains_key(step) {
                return Err(OrchestratorError::UnknownStep(step.clone()));
            }
            if !seen.insert(step) {
                return Err(OrchestratorError::DuplicateId(format!(
                    "step {step} in stage {stage}"
                )));
            }
        }
        Ok(())
    }

    /// Keep the steps blocks of every sequenced copy of `stage` in line with
    /// its declared step list. Steps queued in nested step blocks stay put.
    fn sync_steps_blocks(&mut self, stage: &str, old: &[String], new: &[String]) -> Result<()> {
        let Some(block_ids) = self.steps_blocks.get(stage) else {
            return Ok(());
        };
        for block_id in block_ids {
            let nested = self.blocks.nested_step_ids(*block_id);
            let Some(block) = self.blocks.get_mut(*block_id) else {
                continue;
            };
            let mut specs = HashMap::new();
            for id in old {
                if block.contains(id) {
                    let (_, spec) = block.take(id)?;
                    specs.insert(id.clone(), spec);
                }
            }
            for id in new {
                if nested.contains(id) || block.contains(id) {
                    continue;
                }
                let synthetic = self.steps.get(id).is_some_and(|s| s.synthetic);
                let spec = specs.remove(id).unwrap_or(PositionSpec::Linear);
                block.add(
                    BlockItem::Step(StepUnit {
                        id: id.clone(),
                        synthetic,
                    }),
                    spec,
                )?;
            }
        }
        self.ops.push(SequenceOp::SyncSteps {
            stage: stage.to_string(),
            old: old.to_vec(),
            new: new.to_vec(),
        });
        Ok(())
    }

    // ---- defaults ----

    pub fn set_default_rule(&mut self, rule: impl Into<AdvancementRule>) -> &mut Self {
        self.defaults.rule = Some(rule.into());
        self
    }

    pub fn set_default_property(&mut self, name: impl Into<String>, value: Value) -> &mut Self {
        self.defaults.properties.insert(name.into(), value);
        self
    }

    pub fn set_default_global(&mut self, name: impl Into<String>, value: Value) -> &mut Self {
        self.defaults.globals.insert(name.into(), value);
        self
    }

    pub fn set_default_thresholds(&mut self, thresholds: ParticipantThresholds) -> &mut Self {
        self.defaults.thresholds = Some(thresholds);
        self
    }

    /// Runs once when a session starts.
    pub fn set_on_init(&mut self, hook: HookFn) -> &mut Self {
        self.defaults.on_init = Some(hook);
        self
    }

    /// Runs once when a session reaches gameover.
    pub fn set_on_gameover(&mut self, hook: HookFn) -> &mut Self {
        self.defaults.on_gameover = Some(hook);
        self
    }

    pub fn set_next_stage(&mut self, chooser: NextStageFn) -> &mut Self {
        self.flexible.next = Some(chooser);
        self
    }

    pub fn set_next_stage_for(&mut self, stage: impl Into<String>, chooser: NextStageFn) -> &mut Self {
        self.flexible.next_for.insert(stage.into(), chooser);
        self
    }

    pub fn set_previous_stage(&mut self, chooser: NextStageFn) -> &mut Self {
        self.flexible.previous = Some(chooser);
        self
    }

    pub fn set_previous_stage_for(
        &mut self,
        stage: impl Into<String>,
        chooser: NextStageFn,
    ) -> &mut Self {
        self.flexible.previous_for.insert(stage.into(), chooser);
        self
    }

    // ---- sequencing ----

    pub fn stage(&mut self, id: &str) -> Result<&mut Self> {
        self.stage_at(id, PositionSpec::Linear)
    }

    pub fn stage_at(&mut self, id: &str, spec: PositionSpec) -> Result<&mut Self> {
        self.push_stage(id, EntryKind::Plain, spec, None, None)
    }

    /// Sequence a declared stage under an alias.
    pub fn stage_as(&mut self, stage: &str, alias: &str) -> Result<&mut Self> {
        if !self.aliases.contains_key(alias) {
            self.alias(stage, alias)?;
        }
        self.stage(alias)
    }

    pub fn repeat(&mut self, id: &str, num: u32) -> Result<&mut Self> {
        if num == 0 {
            return Err(OrchestratorError::invalid(format!(
                "repeat of {id} needs at least one round"
            )));
        }
        self.push_stage(id, EntryKind::Repeat { num }, PositionSpec::Linear, None, None)
    }

    /// Entered and repeated while `condition` holds.
    pub fn loop_stage(
        &mut self,
        id: &str,
        condition: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Result<&mut Self> {
        self.push_stage(
            id,
            EntryKind::Loop,
            PositionSpec::Linear,
            Some(Arc::new(condition)),
            None,
        )
    }

    /// Entered once, then repeated while `condition` holds.
    pub fn do_loop(
        &mut self,
        id: &str,
        condition: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Result<&mut Self> {
        self.push_stage(
            id,
            EntryKind::DoLoop,
            PositionSpec::Linear,
            Some(Arc::new(condition)),
            None,
        )
    }

    /// `initial` overrides the stage's declared steps as the starting content
    /// of the entry's steps block.
    fn push_stage(
        &mut self,
        entry: &str,
        kind: EntryKind,
        spec: PositionSpec,
        condition: Option<LoopCondition>,
        initial: Option<Vec<String>>,
    ) -> Result<&mut Self> {
        self.ensure_open()?;
        if entry.is_empty() {
            return Err(OrchestratorError::invalid("stage id must not be empty"));
        }
        if entry == GAMEOVER_ID || self.sequenced.iter().any(|e| e == entry) {
            return Err(OrchestratorError::DuplicateId(format!(
                "{entry} is already in the sequence; sequence it again under an alias"
            )));
        }
        if kind.is_looping() && condition.is_none() {
            return Err(OrchestratorError::invalid(format!(
                "{} stage {entry} needs a condition",
                kind.as_str()
            )));
        }
        let stage = self
            .aliases
            .get(entry)
            .cloned()
            .unwrap_or_else(|| entry.to_string());
        // An unknown stage is declared as a single placeholder step of the
        // same name, but only once nothing below can fail.
        let declare = !self.stages.contains_key(&stage);

        let steps_name = format!("{entry}#steps");
        if self.blocks.find(&steps_name).is_some() {
            return Err(OrchestratorError::DuplicateId(format!("block {steps_name}")));
        }
        let parent = self.stage_parent();
        let parent_block = self.block_ref(parent)?;
        if parent_block.contains(entry) {
            return Err(OrchestratorError::DuplicateId(format!(
                "{entry} in block {}",
                parent_block.id()
            )));
        }

        let mut steps_block = Block::new(steps_name, BlockKind::EnclosingSteps);
        let step_ids = match initial {
            Some(steps) => steps,
            None if declare => vec![stage.clone()],
            None => self
                .stages
                .get(&stage)
                .map(|s| s.steps.clone())
                .unwrap_or_default(),
        };
        for step in step_ids.iter().cloned() {
            let synthetic = self
                .steps
                .get(&step)
                .map_or(declare && step == stage, |s| s.synthetic);
            steps_block.add(BlockItem::Step(StepUnit { id: step, synthetic }), PositionSpec::Linear)?;
        }

        if declare {
            self.add_stage(StageDef::new(stage.clone()))?;
        }
        self.close_step_blocks();
        let steps_block = self.blocks.insert(steps_block)?;

        let unit = StageUnit {
            id: entry.to_string(),
            stage: stage.clone(),
            kind,
            steps_block: Some(steps_block),
        };
        self.block_mut(parent)?.add(BlockItem::Stage(unit), spec.clone())?;

        self.steps_blocks.entry(stage.clone()).or_default().push(steps_block);
        if let Some(condition) = condition {
            self.conditions.insert(entry.to_string(), condition);
        }
        self.sequenced.push(entry.to_string());
        self.ops.push(SequenceOp::Stage {
            entry: entry.to_string(),
            kind,
            spec,
            steps: step_ids,
        });
        self.current = Some(CurrentStage { stage, steps_block });
        debug!(entry = %entry, kind = kind.as_str(), "Stage sequenced");
        Ok(self)
    }

    /// Append the terminal gameover entry.
    pub fn gameover(&mut self) -> Result<&mut Self> {
        self.ensure_open()?;
        if self.sequenced.iter().any(|e| e == GAMEOVER_ID) {
            return Err(OrchestratorError::DuplicateId(GAMEOVER_ID.to_string()));
        }
        self.close_step_blocks();
        let parent = self.open.last().copied().unwrap_or(self.root);
        let unit = StageUnit {
            id: GAMEOVER_ID.to_string(),
            stage: GAMEOVER_ID.to_string(),
            kind: EntryKind::Gameover,
            steps_block: None,
        };
        self.block_mut(parent)?
            .add(BlockItem::Stage(unit), PositionSpec::Linear)?;
        self.sequenced.push(GAMEOVER_ID.to_string());
        self.ops.push(SequenceOp::Gameover);
        self.current = None;
        Ok(self)
    }

    /// Add a declared step to the most recently sequenced stage.
    pub fn step(&mut self, id: &str) -> Result<&mut Self> {
        self.step_at(id, PositionSpec::Linear)
    }

    pub fn step_at(&mut self, id: &str, spec: PositionSpec) -> Result<&mut Self> {
        self.ensure_open()?;
        let current = self
            .current
            .clone()
            .ok_or_else(|| OrchestratorError::invalid(format!("step {id} is outside a stage")))?;
        if !self.steps.contains_key(id) {
            return Err(OrchestratorError::UnknownStep(id.to_string()));
        }
        let declared = self
            .stages
            .get(&current.stage)
            .map(|s| s.steps.clone())
            .unwrap_or_default();
        if !self.replaying && declared.iter().any(|s| s == id) {
            return Err(OrchestratorError::DuplicateId(format!(
                "step {id} in stage {}",
                current.stage
            )));
        }

        let target = match self.open.last() {
            Some(top) if self.is_step_block(*top) => *top,
            _ => current.steps_block,
        };
        let target_block = self.block_ref(target)?;
        if target_block.contains(id) {
            return Err(OrchestratorError::DuplicateId(format!(
                "step {id} in block {}",
                target_block.id()
            )));
        }

        // Other sequenced copies of the stage pick the step up in order.
        let mut steps: Vec<String> = declared
            .iter()
            .filter(|s| !self.steps.get(*s).is_some_and(|d| d.synthetic))
            .cloned()
            .collect();
        steps.push(id.to_string());
        let mut copies: Vec<BlockId> = Vec::new();
        for block_id in self
            .steps_blocks
            .get(&current.stage)
            .into_iter()
            .flatten()
            .copied()
            .filter(|b| *b != current.steps_block)
        {
            let block = self.block_ref(block_id)?;
            if block.is_finalized() {
                return Err(OrchestratorError::BlockFinalized(block.id().to_string()));
            }
            if !block.contains(id) {
                copies.push(block_id);
            }
        }

        self.block_mut(target)?.add(
            BlockItem::Step(StepUnit {
                id: id.to_string(),
                synthetic: false,
            }),
            spec.clone(),
        )?;
        for block_id in copies {
            self.block_mut(block_id)?.add(
                BlockItem::Step(StepUnit {
                    id: id.to_string(),
                    synthetic: false,
                }),
                PositionSpec::Linear,
            )?;
        }
        self.ops.push(SequenceOp::Step {
            id: id.to_string(),
            spec,
        });
        if !self.replaying {
            if let Some(def) = self.stages.get_mut(&current.stage) {
                def.steps = steps;
                def.inline = false;
            }
        }
        Ok(self)
    }

    // ---- blocks ----

    /// Open a block of stages whose positions may be permuted.
    pub fn stage_block(&mut self, id: &str, spec: PositionSpec) -> Result<&mut Self> {
        self.ensure_open()?;
        self.close_step_blocks();
        let parent = self.open.last().copied().unwrap_or(self.root);
        self.open_block(id, BlockKind::StageBlock, parent, spec.clone())?;
        self.ops.push(SequenceOp::StageBlock {
            id: id.to_string(),
            spec,
        });
        Ok(self)
    }

    /// Open a block of steps inside the current stage.
    pub fn step_block(&mut self, id: &str, spec: PositionSpec) -> Result<&mut Self> {
        self.ensure_open()?;
        let current = self.current.clone().ok_or_else(|| {
            OrchestratorError::invalid(format!("step block {id} is outside a stage"))
        })?;
        let parent = match self.open.last() {
            Some(top) if self.is_step_block(*top) => *top,
            _ => current.steps_block,
        };
        self.open_block(id, BlockKind::StepBlock, parent, spec.clone())?;
        self.ops.push(SequenceOp::StepBlock {
            id: id.to_string(),
            spec,
        });
        Ok(self)
    }

    /// Close the innermost open block.
    pub fn end_block(&mut self) -> Result<&mut Self> {
        self.ensure_open()?;
        if self.open.pop().is_none() {
            return Err(OrchestratorError::invalid("no open block to end"));
        }
        self.ops.push(SequenceOp::EndBlock);
        Ok(self)
    }

    fn open_block(
        &mut self,
        id: &str,
        kind: BlockKind,
        parent: BlockId,
        spec: PositionSpec,
    ) -> Result<()> {
        if id.is_empty() {
            return Err(OrchestratorError::invalid("block id must not be empty"));
        }
        if self.blocks.find(id).is_some() {
            return Err(OrchestratorError::DuplicateId(format!("block {id}")));
        }
        let parent_block = self.block_ref(parent)?;
        if parent_block.contains(id) {
            return Err(OrchestratorError::DuplicateId(format!(
                "{id} in block {}",
                parent_block.id()
            )));
        }
        let block_id = self.blocks.insert(Block::new(id, kind))?;
        self.block_mut(parent)?.add(
            BlockItem::Block {
                id: id.to_string(),
                block: block_id,
            },
            spec,
        )?;
        self.open.push(block_id);
        Ok(())
    }

    /// The block a newly sequenced stage lands in: the innermost open stage
    /// block, skipping any step blocks still open above it.
    fn stage_parent(&self) -> BlockId {
        self.open
            .iter()
            .rev()
            .copied()
            .find(|b| !self.is_step_block(*b))
            .unwrap_or(self.root)
    }

    fn close_step_blocks(&mut self) {
        while let Some(top) = self.open.last() {
            if self.is_step_block(*top) {
                self.open.pop();
            } else {
                break;
            }
        }
    }

    fn is_step_block(&self, id: BlockId) -> bool {
        self.blocks
            .get(id)
            .is_some_and(|b| b.kind() == BlockKind::StepBlock)
    }

    fn block_ref(&self, id: BlockId) -> Result<&Block> {
        self.blocks
            .get(id)
            .ok_or_else(|| OrchestratorError::invalid(format!("missing block {id:?}")))
    }

    fn block_mut(&mut self, id: BlockId) -> Result<&mut Block> {
        self.blocks
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::invalid(format!("missing block {id:?}")))
    }

    // ---- skipping ----

    /// Leave a stage, or one step of it, out of the next finalization.
    pub fn skip(&mut self, stage: &str, step: Option<&str>) -> Result<&mut Self> {
        self.ensure_open()?;
        self.check_known(stage, step)?;
        match step {
            Some(step) => {
                self.skipped_steps.insert((stage.to_string(), step.to_string()));
            }
            None => {
                self.skipped_stages.insert(stage.to_string());
            }
        }
        Ok(self)
    }

    /// Returns whether the stage or step was marked.
    pub fn unskip(&mut self, stage: &str, step: Option<&str>) -> Result<bool> {
        self.ensure_open()?;
        self.check_known(stage, step)?;
        Ok(match step {
            Some(step) => self
                .skipped_steps
                .remove(&(stage.to_string(), step.to_string())),
            None => self.skipped_stages.remove(stage),
        })
    }

    pub fn is_skipped(&self, stage: &str, step: Option<&str>) -> bool {
        match step {
            Some(step) => self
                .skipped_steps
                .contains(&(stage.to_string(), step.to_string())),
            None => self.skipped_stages.contains(stage),
        }
    }

    fn check_known(&self, stage: &str, step: Option<&str>) -> Result<()> {
        if !self.stages.contains_key(stage) && !self.aliases.contains_key(stage) {
            return Err(OrchestratorError::UnknownStage(stage.to_string()));
        }
        if let Some(step) = step {
            if !self.steps.contains_key(step) {
                return Err(OrchestratorError::UnknownStep(step.to_string()));
            }
        }
        Ok(())
    }

    // ---- finalize ----

    /// Fix every block's order and flatten the sequence into a plan.
    ///
    /// On error the blocks are rolled back and the stager can be fixed and
    /// finalized again.
    pub fn finalize(&mut self) -> Result<Arc<Plan>> {
        if self.plan.is_some() {
            return Err(OrchestratorError::AlreadyFinalized);
        }

        self.blocks.backup_all();
        self.open_backup = Some(std::mem::take(&mut self.open));

        match self.build_plan() {
            Ok(plan) => {
                let plan = Arc::new(plan);
                info!(entries = plan.len(), "Sequence finalized");
                self.plan = Some(plan.clone());
                Ok(plan)
            }
            Err(e) => {
                warn!(error = %e, "Finalize failed, rolling back");
                self.blocks.restore_all();
                self.open = self.open_backup.take().unwrap_or_default();
                Err(e)
            }
        }
    }

    /// Undo the last finalize so it can run again with different skips.
    pub fn reset(&mut self) -> Result<()> {
        if self.plan.take().is_none() {
            return Err(OrchestratorError::NotFinalized);
        }
        self.blocks.restore_all();
        self.open = self.open_backup.take().unwrap_or_default();
        debug!("Sequence reset");
        Ok(())
    }

    fn build_plan(&mut self) -> Result<Plan> {
        self.blocks.finalize_from(self.root, &mut self.rng)?;

        let mut entries = Vec::new();
        let mut conditions = HashMap::new();
        let mut cursor = BlockCursor::new(self.root);
        while let Some(item) = cursor.next(&self.blocks) {
            let BlockItem::Stage(unit) = item else {
                debug!(item = %item.id(), "Ignoring step outside of a stage");
                continue;
            };
            if unit.kind == EntryKind::Gameover {
                entries.push(PlanEntry::gameover());
                continue;
            }
            if self.skipped_stages.contains(&unit.id) || self.skipped_stages.contains(&unit.stage) {
                debug!(stage = %unit.id, "Skipping stage");
                continue;
            }

            let steps = self.collect_steps(unit);
            if steps.is_empty() {
                warn!(stage = %unit.id, "Stage has no steps left, leaving it out");
                continue;
            }
            if let Some(condition) = self.conditions.get(&unit.id) {
                conditions.insert(entries.len(), condition.clone());
            }
            entries.push(PlanEntry::new(unit.id.clone(), unit.kind, steps));
        }

        Ok(Plan {
            entries,
            conditions,
            steps: self.steps.clone(),
            stages: self.stages.clone(),
            aliases: self.aliases.clone(),
            defaults: self.defaults.clone(),
            flexible: self.flexible.clone(),
            stage_order: self.stage_order.clone(),
        })
    }

    fn collect_steps(&self, unit: &StageUnit) -> Vec<String> {
        let Some(block) = unit.steps_block else {
            return Vec::new();
        };
        let mut units = Vec::new();
        let mut cursor = BlockCursor::new(block);
        while let Some(item) = cursor.next(&self.blocks) {
            if let BlockItem::Step(step) = item {
                let skipped = self
                    .skipped_steps
                    .contains(&(unit.id.clone(), step.id.clone()))
                    || self
                        .skipped_steps
                        .contains(&(unit.stage.clone(), step.id.clone()));
                if !skipped {
                    units.push(step);
                }
            }
        }
        let has_real = units.iter().any(|s| !s.synthetic);
        units
            .into_iter()
            .filter(|s| !(has_real && s.synthetic))
            .map(|s| s.id.clone())
            .collect()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.plan.is_some() {
            return Err(OrchestratorError::AlreadyFinalized);
        }
        Ok(())
    }

    // ---- introspection ----

    pub fn get_step(&self, id: &str) -> Option<&StepDef> {
        self.steps.get(id)
    }

    /// Stage by id or alias.
    pub fn get_stage(&self, id: &str) -> Option<&StageDef> {
        let id = self.aliases.get(id).map(String::as_str).unwrap_or(id);
        self.stages.get(id)
    }

    /// Sequenced entry ids in call order.
    pub fn sequence_ids(&self) -> &[String] {
        &self.sequenced
    }

    pub fn is_finalized(&self) -> bool {
        self.plan.is_some()
    }

    pub fn plan(&self) -> Option<Arc<Plan>> {
        self.plan.clone()
    }

    /// Ids of the blocks still open, outermost first.
    pub fn open_blocks(&self) -> Vec<&str> {
        self.open
            .iter()
            .filter_map(|id| self.blocks.get(*id))
            .map(|b| b.id())
            .collect()
    }
}

impl Default for Stager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Stager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stager")
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .field("stages", &self.stage_order)
            .field("sequenced", &self.sequenced)
            .field("open", &self.open_blocks())
            .field("finalized", &self.is_finalized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn with_steps(ids: &[&str]) -> Stager {
        let mut stager = Stager::with_seed(11);
        for id in ids {
            stager
                .add_step(StepDef::with_callback(*id, done_callback()))
                .unwrap();
        }
        stager
    }

    fn shape(plan: &Plan) -> Vec<(String, Vec<String>)> {
        plan.entries()
            .iter()
            .map(|e| (e.id.clone(), e.steps.clone()))
            .collect()
    }

    fn pair(id: &str, steps: &[&str]) -> (String, Vec<String>) {
        (id.to_string(), steps.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_declared_stage_with_steps() {
        let mut stager = with_steps(&["a1", "a2", "b1"]);
        stager.add_stage(StageDef::with_steps("A", ["a1", "a2"])).unwrap();
        stager.add_stage(StageDef::with_steps("B", ["b1"])).unwrap();
        stager.stage("A").unwrap().repeat("B", 2).unwrap();

        let plan = stager.finalize().unwrap();
        assert_eq!(shape(&plan), vec![pair("A", &["a1", "a2"]), pair("B", &["b1"])]);
        assert_eq!(plan.entries()[1].kind, EntryKind::Repeat { num: 2 });
    }

    #[test]
    fn test_stage_validation() {
        let mut stager = with_steps(&["a1"]);
        let both = StageDef {
            steps: vec!["a1".into()],
            ..StageDef::inline("X", done_callback())
        };
        assert!(matches!(
            stager.add_stage(both),
            Err(OrchestratorError::InvalidDeclaration(_))
        ));
        assert!(matches!(
            stager.add_stage(StageDef::with_steps("Y", ["missing"])),
            Err(OrchestratorError::UnknownStep(_))
        ));
        assert!(matches!(
            stager.add_stage(StageDef::with_steps("Z", ["a1", "a1"])),
            Err(OrchestratorError::DuplicateId(_))
        ));
        assert!(stager.add_stage(StageDef::new("")).is_err());

        stager.add_stage(StageDef::with_steps("A", ["a1"])).unwrap();
        assert!(matches!(
            stager.add_stage(StageDef::new("A")),
            Err(OrchestratorError::DuplicateId(_))
        ));
        assert!(stager.get_stage("X").is_none());
        assert!(stager.get_stage("Y").is_none());
    }

    #[test]
    fn test_duplicate_step_is_rejected() {
        let mut stager = with_steps(&["s"]);
        assert!(matches!(
            stager.add_step(StepDef::with_callback("s", done_callback())),
            Err(OrchestratorError::DuplicateId(_))
        ));
        assert!(stager
            .add_step(StepDef::with_callback("", done_callback()))
            .is_err());
    }

    #[test]
    fn test_inline_stage_creates_single_step() {
        let mut stager = Stager::with_seed(1);
        stager
            .add_stage(StageDef::inline("quiz", done_callback()))
            .unwrap();
        assert!(stager.get_stage("quiz").unwrap().is_inline());
        assert!(!stager.get_step("quiz").unwrap().is_synthetic());

        stager.stage("quiz").unwrap();
        let plan = stager.finalize().unwrap();
        assert_eq!(shape(&plan), vec![pair("quiz", &["quiz"])]);
    }

    #[test]
    fn test_placeholder_step_dropped_when_steps_added() {
        let mut stager = with_steps(&["w1", "w2"]);
        stager.stage("warmup").unwrap().step("w1").unwrap().step("w2").unwrap();
        assert!(stager.get_step("warmup").unwrap().is_synthetic());
        assert_eq!(stager.get_stage("warmup").unwrap().steps, vec!["w1", "w2"]);

        let plan = stager.finalize().unwrap();
        assert_eq!(shape(&plan), vec![pair("warmup", &["w1", "w2"])]);
    }

    #[test]
    fn test_stage_without_steps_keeps_placeholder() {
        let mut stager = Stager::with_seed(1);
        stager.stage("lobby").unwrap();
        let plan = stager.finalize().unwrap();
        assert_eq!(shape(&plan), vec![pair("lobby", &["lobby"])]);
    }

    #[test]
    fn test_same_stage_twice_needs_alias() {
        let mut stager = with_steps(&["s"]);
        stager.add_stage(StageDef::with_steps("A", ["s"])).unwrap();
        stager.stage("A").unwrap();
        assert!(matches!(
            stager.stage("A"),
            Err(OrchestratorError::DuplicateId(_))
        ));
        assert!(stager.stage_as("A", "A").is_err());
        stager.stage_as("A", "A-again").unwrap();

        let plan = stager.finalize().unwrap();
        assert_eq!(shape(&plan), vec![pair("A", &["s"]), pair("A-again", &["s"])]);
        assert_eq!(plan.stage("A-again").unwrap().id, "A");
    }

    #[test]
    fn test_step_outside_stage() {
        let mut stager = with_steps(&["s"]);
        assert!(matches!(
            stager.step("s"),
            Err(OrchestratorError::InvalidDeclaration(_))
        ));
        stager.stage("A").unwrap();
        assert!(matches!(
            stager.step("missing"),
            Err(OrchestratorError::UnknownStep(_))
        ));
        stager.step("s").unwrap();
        assert!(matches!(
            stager.step("s"),
            Err(OrchestratorError::DuplicateId(_))
        ));
    }

    #[test]
    fn test_merge_and_replace() {
        let mut stager = with_steps(&["a1", "a2", "a3"]);
        stager.add_stage(StageDef::with_steps("A", ["a1"])).unwrap();
        stager.stage("A").unwrap();

        stager
            .merge_stage("A", StagePatch::steps(["a1", "a2"]))
            .unwrap();
        let mut patch = StepPatch::default();
        patch.properties.insert("points".into(), json!(5));
        stager.merge_step("a2", patch).unwrap();

        assert!(matches!(
            stager.replace_stage("A", StageDef::with_steps("B", ["a1"])),
            Err(OrchestratorError::InvalidDeclaration(_))
        ));
        assert!(matches!(
            stager.replace_stage("A", StageDef::inline("A", done_callback())),
            Err(OrchestratorError::InvalidDeclaration(_))
        ));
        assert!(matches!(
            stager.replace_step("a1", StepDef::with_callback("zz", done_callback())),
            Err(OrchestratorError::InvalidDeclaration(_))
        ));
        assert!(matches!(
            stager.merge_step("nope", StepPatch::default()),
            Err(OrchestratorError::UnknownStep(_))
        ));

        let plan = stager.finalize().unwrap();
        assert_eq!(shape(&plan), vec![pair("A", &["a1", "a2"])]);
        assert_eq!(plan.step("a2").unwrap().properties.get("points"), Some(&json!(5)));

        stager.reset().unwrap();
        stager
            .replace_stage("A", StageDef::with_steps("A", ["a3", "a1"]))
            .unwrap();
        let plan = stager.finalize().unwrap();
        assert_eq!(shape(&plan), vec![pair("A", &["a3", "a1"])]);
    }

    #[test]
    fn test_double_finalize_requires_reset() {
        let mut stager = Stager::with_seed(1);
        stager.stage("A").unwrap();
        stager.finalize().unwrap();
        assert!(matches!(
            stager.finalize(),
            Err(OrchestratorError::AlreadyFinalized)
        ));
        assert!(matches!(
            stager.stage("B"),
            Err(OrchestratorError::AlreadyFinalized)
        ));
        stager.reset().unwrap();
        assert!(matches!(stager.reset(), Err(OrchestratorError::NotFinalized)));
        stager.finalize().unwrap();
    }

    #[test]
    fn test_skip_and_unskip_between_finalizations() {
        let mut stager = with_steps(&["a1", "a2", "b1"]);
        stager.add_stage(StageDef::with_steps("A", ["a1", "a2"])).unwrap();
        stager.add_stage(StageDef::with_steps("B", ["b1"])).unwrap();
        stager.stage("A").unwrap().stage("B").unwrap().gameover().unwrap();

        stager.skip("B", None).unwrap().skip("A", Some("a2")).unwrap();
        assert!(stager.is_skipped("B", None));
        let plan = stager.finalize().unwrap();
        assert_eq!(
            shape(&plan),
            vec![pair("A", &["a1"]), pair("gameover", &[])]
        );
        assert!(stager.skip("A", None).is_err());

        stager.reset().unwrap();
        assert!(stager.unskip("B", None).unwrap());
        assert!(!stager.unskip("B", None).unwrap());
        stager.unskip("A", Some("a2")).unwrap();
        stager.skip("A", None).unwrap();
        let plan = stager.finalize().unwrap();
        assert_eq!(
            shape(&plan),
            vec![pair("B", &["b1"]), pair("gameover", &[])]
        );

        assert!(matches!(
            Stager::new().skip("nope", None),
            Err(OrchestratorError::UnknownStage(_))
        ));
    }

    #[test]
    fn test_stage_left_without_steps_is_omitted() {
        let mut stager = with_steps(&["a1"]);
        stager.add_stage(StageDef::with_steps("A", ["a1"])).unwrap();
        stager.stage("A").unwrap();
        stager.skip("A", Some("a1")).unwrap();
        let plan = stager.finalize().unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_rejected_stage_is_not_declared() {
        let mut stager = Stager::with_seed(5);
        stager.stage_block("B#steps", PositionSpec::anywhere()).unwrap();
        assert!(matches!(
            stager.stage("B"),
            Err(OrchestratorError::DuplicateId(_))
        ));
        assert!(stager.get_stage("B").is_none());
        assert!(stager.get_step("B").is_none());
        assert!(stager.sequenced.is_empty());
        assert_eq!(stager.ops.len(), 1);

        // Other stages still sequence into the open block.
        stager.stage("C").unwrap();
        stager.end_block().unwrap();
        let plan = stager.finalize().unwrap();
        assert_eq!(shape(&plan), vec![pair("C", &["C"])]);
    }

    #[test]
    fn test_rejected_step_leaves_stage_untouched() {
        let mut stager = with_steps(&["s", "t"]);
        stager.add_stage(StageDef::with_steps("A", ["s"])).unwrap();
        stager.stage("A").unwrap().step("t").unwrap();
        let ops = stager.ops.len();

        assert!(stager.step("t").is_err());
        assert!(stager.step("missing").is_err());
        assert_eq!(stager.ops.len(), ops);
        assert_eq!(stager.get_stage("A").unwrap().steps, vec!["s", "t"]);

        let plan = stager.finalize().unwrap();
        assert_eq!(shape(&plan), vec![pair("A", &["s", "t"])]);
    }

    #[test]
    fn test_stage_block_with_any_order() {
        let mut stager = Stager::with_seed(5);
        stager.stage("intro").unwrap();
        stager.stage_block("tasks", PositionSpec::Linear).unwrap();
        for id in ["t1", "t2", "t3"] {
            stager.stage_at(id, PositionSpec::anywhere()).unwrap();
        }
        assert_eq!(stager.open_blocks(), vec!["tasks"]);
        stager.end_block().unwrap();
        stager.stage("outro").unwrap();
        assert!(stager.end_block().is_err());

        let plan = stager.finalize().unwrap();
        let ids: Vec<&str> = plan.entries().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids.len(), 5);
        assert_eq!(ids[0], "intro");
        assert_eq!(ids[4], "outro");
        let mut middle: Vec<&str> = ids[1..4].to_vec();
        middle.sort_unstable();
        assert_eq!(middle, vec!["t1", "t2", "t3"]);
    }

    #[test]
    fn test_step_block_inside_stage() {
        let mut stager = with_steps(&["s1", "s2", "s3", "s4"]);
        stager.stage("A").unwrap().step("s1").unwrap();
        stager.step_block("middle", PositionSpec::Linear).unwrap();
        stager.step_at("s2", PositionSpec::anywhere()).unwrap();
        stager.step_at("s3", PositionSpec::anywhere()).unwrap();
        stager.end_block().unwrap();
        stager.step("s4").unwrap();

        let plan = stager.finalize().unwrap();
        let steps = &plan.entries()[0].steps;
        assert_eq!(steps.len(), 4);
        assert_eq!(steps[0], "s1");
        assert_eq!(steps[3], "s4");
    }

    #[test]
    fn test_stage_call_closes_open_step_block() {
        let mut stager = with_steps(&["s1"]);
        stager.stage("A").unwrap();
        stager.step_block("inner", PositionSpec::Linear).unwrap();
        stager.step("s1").unwrap();
        stager.stage("B").unwrap();
        assert!(stager.open_blocks().is_empty());
    }

    #[test]
    fn test_finalize_failure_rolls_back() {
        let mut stager = Stager::with_seed(2);
        stager.stage_at("A", PositionSpec::Exact(0)).unwrap();
        stager.stage_at("B", PositionSpec::Exact(0)).unwrap();
        stager.stage_block("open", PositionSpec::Linear).unwrap();

        assert!(matches!(
            stager.finalize(),
            Err(OrchestratorError::NoLegalPosition { .. })
        ));
        assert!(!stager.is_finalized());
        assert_eq!(stager.open_blocks(), vec!["open"]);
    }

    #[test]
    fn test_loop_entries_carry_conditions() {
        let mut stager = Stager::with_seed(1);
        stager.stage("A").unwrap();
        stager.loop_stage("L", || false).unwrap();
        stager.do_loop("D", || true).unwrap();
        assert!(stager.repeat("R", 0).is_err());

        let plan = stager.finalize().unwrap();
        assert!(plan.condition(0).is_none());
        assert!(!(plan.condition(1).unwrap())());
        assert!((plan.condition(2).unwrap())());
        assert_eq!(plan.entries()[2].kind, EntryKind::DoLoop);
    }

    #[test]
    fn test_defaults_reach_plan() {
        let mut stager = Stager::with_seed(1);
        stager
            .set_default_property("timer", json!(1000))
            .set_default_global("currency", json!("EUR"))
            .set_default_rule(crate::rules::RuleName::SyncStep);
        stager.stage("A").unwrap();
        let plan = stager.finalize().unwrap();
        assert_eq!(plan.defaults().properties.get("timer"), Some(&json!(1000)));
        assert_eq!(plan.defaults().rule.as_ref().and_then(|r| r.name()), Some("SYNC_STEP"));
    }

    proptest! {
        #[test]
        fn plan_matches_declared_non_skipped_steps(
            stage_sizes in proptest::collection::vec(1usize..4, 1..5),
            skip_mask in proptest::collection::vec(any::<bool>(), 20),
            seed in any::<u64>(),
        ) {
            let mut stager = Stager::with_seed(seed);
            let mut expected = Vec::new();
            let mut flag = skip_mask.iter().copied().cycle();

            for (si, size) in stage_sizes.iter().enumerate() {
                let stage = format!("st{si}");
                let steps: Vec<String> = (0..*size).map(|k| format!("{stage}-{k}")).collect();
                for step in &steps {
                    stager.add_step(StepDef::with_callback(step.clone(), done_callback())).unwrap();
                }
                stager.add_stage(StageDef::with_steps(stage.clone(), steps.clone())).unwrap();
                stager.stage(&stage).unwrap();

                let mut kept = Vec::new();
                for step in &steps {
                    if flag.next().unwrap_or(false) {
                        stager.skip(&stage, Some(step)).unwrap();
                    } else {
                        kept.push(step.clone());
                    }
                }
                if !kept.is_empty() {
                    expected.push((stage, kept));
                }
            }

            let plan = stager.finalize().unwrap();
            prop_assert_eq!(shape(&plan), expected);
        }
    }
}
