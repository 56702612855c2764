//! Re-orderable containers of plan items.
//!
//! A [`Block`] collects items together with a [`PositionSpec`] each, and
//! finalizing it fixes a single order that satisfies every constraint.
//! Blocks nest: an item may itself be a block, stored in the same
//! [`BlockSet`] arena and referenced by [`BlockId`]. A [`BlockCursor`] walks
//! the finalized hierarchy depth-first.

use std::collections::{BTreeSet, HashMap};

use cadence_core::EntryKind;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{OrchestratorError, Result};

/// Where an item may be placed inside its block. Slots are 0-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSpec {
    /// Keep insertion order.
    Linear,
    /// Exactly this slot.
    Exact(usize),
    /// A range expression such as `"*"`, `"0..2"`, `"1,3"` or `"2.."`.
    Range(String),
}

impl PositionSpec {
    pub fn anywhere() -> Self {
        Self::Range("*".to_string())
    }

    /// Expand into the legal slots for an item inserted at `index` into a
    /// block of `len` items.
    pub fn legal_slots(&self, index: usize, len: usize) -> Result<Vec<usize>> {
        match self {
            Self::Linear => Ok(vec![index]),
            Self::Exact(slot) if *slot < len => Ok(vec![*slot]),
            Self::Exact(_) => Ok(Vec::new()),
            Self::Range(expr) => parse_range(expr, len),
        }
    }
}

/// Parse a permissive range expression into sorted slots below `len`.
///
/// Terms are comma separated: `n`, `a..b` (inclusive), `a..`, `..b`, `*`.
/// Terms outside the block are clipped rather than rejected.
pub fn parse_range(expr: &str, len: usize) -> Result<Vec<usize>> {
    let invalid = || OrchestratorError::invalid(format!("bad position expression '{expr}'"));
    let mut slots = BTreeSet::new();

    for term in expr.split(',') {
        let term: String = term.chars().filter(|c| !c.is_whitespace()).collect();
        if term.is_empty() {
            return Err(invalid());
        }
        if term == "*" {
            slots.extend(0..len);
            continue;
        }
        if let Some((lo, hi)) = term.split_once("..") {
            let lo = if lo.is_empty() {
                0
            } else {
                lo.parse::<usize>().map_err(|_| invalid())?
            };
            let hi = if hi.is_empty() {
                len.saturating_sub(1)
            } else {
                hi.parse::<usize>().map_err(|_| invalid())?
            };
            if len > 0 && lo <= hi {
                slots.extend(lo..=hi.min(len - 1));
            }
            continue;
        }
        let slot = term.parse::<usize>().map_err(|_| invalid())?;
        if slot < len {
            slots.insert(slot);
        }
    }

    Ok(slots.into_iter().collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    /// Outermost container of the whole sequence.
    EnclosingStages,
    /// Caller-declared group of stages.
    StageBlock,
    /// The steps of one sequenced stage.
    EnclosingSteps,
    /// Caller-declared group of steps.
    StepBlock,
}

impl BlockKind {
    pub fn holds_stages(&self) -> bool {
        matches!(self, Self::EnclosingStages | Self::StageBlock)
    }
}

/// A sequenced stage: the entry id (the stage id, or an alias), the
/// declared stage it plays, and how it repeats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageUnit {
    pub id: String,
    pub stage: String,
    pub kind: EntryKind,
    pub steps_block: Option<BlockId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepUnit {
    pub id: String,
    /// Placeholder step created for a stage declared without steps.
    pub synthetic: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockItem {
    Stage(StageUnit),
    Step(StepUnit),
    Block { id: String, block: BlockId },
}

impl BlockItem {
    pub fn id(&self) -> &str {
        match self {
            Self::Stage(unit) => &unit.id,
            Self::Step(unit) => &unit.id,
            Self::Block { id, .. } => id,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Stage(_) => "stage",
            Self::Step(_) => "step",
            Self::Block { .. } => "block",
        }
    }

    fn is_synthetic_step(&self) -> bool {
        matches!(self, Self::Step(StepUnit { synthetic: true, .. }))
    }
}

#[derive(Debug, Clone)]
struct Snapshot {
    unfinished: Vec<(BlockItem, PositionSpec)>,
    items: Vec<BlockItem>,
    finalized: bool,
}

#[derive(Debug, Clone)]
pub struct Block {
    id: String,
    kind: BlockKind,
    unfinished: Vec<(BlockItem, PositionSpec)>,
    items: Vec<BlockItem>,
    finalized: bool,
    backup: Option<Snapshot>,
}

impl Block {
    pub fn new(id: impl Into<String>, kind: BlockKind) -> Self {
        Self {
            id: id.into(),
            kind,
            unfinished: Vec::new(),
            items: Vec::new(),
            finalized: false,
            backup: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Items in final order. Empty until finalized.
    pub fn items(&self) -> &[BlockItem] {
        &self.items
    }

    /// Queued items with their position specs, in insertion order.
    pub fn unfinished(&self) -> &[(BlockItem, PositionSpec)] {
        &self.unfinished
    }

    pub fn len(&self) -> usize {
        if self.finalized {
            self.items.len()
        } else {
            self.unfinished.len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, item_id: &str) -> bool {
        self.unfinished.iter().any(|(item, _)| item.id() == item_id)
    }

    pub fn add(&mut self, item: BlockItem, spec: PositionSpec) -> Result<()> {
        if self.finalized {
            return Err(OrchestratorError::BlockFinalized(self.id.clone()));
        }
        if item.id().is_empty() {
            return Err(OrchestratorError::invalid(format!(
                "{} in block {} has an empty id",
                item.type_name(),
                self.id
            )));
        }
        if self.contains(item.id()) {
            return Err(OrchestratorError::DuplicateId(format!(
                "{} in block {}",
                item.id(),
                self.id
            )));
        }
        self.unfinished.push((item, spec));
        Ok(())
    }

    pub fn remove(&mut self, item_id: &str) -> Result<BlockItem> {
        self.take(item_id).map(|(item, _)| item)
    }

    /// Remove a queued item and hand back its position spec too.
    pub fn take(&mut self, item_id: &str) -> Result<(BlockItem, PositionSpec)> {
        if self.finalized {
            return Err(OrchestratorError::BlockFinalized(self.id.clone()));
        }
        let index = self
            .unfinished
            .iter()
            .position(|(item, _)| item.id() == item_id)
            .ok_or_else(|| {
                OrchestratorError::invalid(format!("{item_id} is not in block {}", self.id))
            })?;
        Ok(self.unfinished.remove(index))
    }

    /// Fix the order of the queued items.
    ///
    /// Items are placed most-constrained first, each into a slot drawn
    /// uniformly from its remaining legal slots. Nothing changes if any item
    /// runs out of legal slots.
    pub fn finalize<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<()> {
        if self.finalized {
            return Ok(());
        }

        let mut queued = self.unfinished.clone();
        if self.kind == BlockKind::EnclosingSteps
            && queued.len() > 1
            && queued[0].0.is_synthetic_step()
        {
            debug!(block = %self.id, "Dropping placeholder step");
            queued.remove(0);
        }

        let len = queued.len();
        let mut pending = Vec::with_capacity(len);
        for (index, (_, spec)) in queued.iter().enumerate() {
            pending.push((index, spec.legal_slots(index, len)?));
        }

        let mut placed: Vec<Option<usize>> = vec![None; len];
        while !pending.is_empty() {
            // Stable sort, fewest options last; ties pop the latest insertion.
            pending.sort_by(|a, b| b.1.len().cmp(&a.1.len()));
            let Some((index, slots)) = pending.pop() else {
                break;
            };
            if slots.is_empty() {
                return Err(OrchestratorError::NoLegalPosition {
                    block: self.id.clone(),
                    item: queued[index].0.id().to_string(),
                });
            }
            let slot = slots[rng.random_range(0..slots.len())];
            placed[slot] = Some(index);
            for (_, other) in pending.iter_mut() {
                other.retain(|s| *s != slot);
            }
        }

        let mut items = Vec::with_capacity(len);
        for index in placed.into_iter().flatten() {
            items.push(queued[index].0.clone());
        }

        self.unfinished = queued;
        self.items = items;
        self.finalized = true;
        Ok(())
    }

    /// Remember the current queued and finalized lists.
    pub fn backup(&mut self) {
        self.backup = Some(Snapshot {
            unfinished: self.unfinished.clone(),
            items: self.items.clone(),
            finalized: self.finalized,
        });
    }

    /// Roll back to the last backup. Returns false if there was none.
    pub fn restore(&mut self) -> bool {
        match self.backup.take() {
            Some(snapshot) => {
                self.unfinished = snapshot.unfinished;
                self.items = snapshot.items;
                self.finalized = snapshot.finalized;
                true
            }
            None => false,
        }
    }
}

/// Arena owning every block of a sequence.
#[derive(Debug, Clone, Default)]
pub struct BlockSet {
    blocks: Vec<Block>,
    by_name: HashMap<String, BlockId>,
}

impl BlockSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A set holding only `root`.
    pub fn with_root(root: Block) -> (Self, BlockId) {
        let id = BlockId(0);
        let mut set = Self::new();
        set.by_name.insert(root.id().to_string(), id);
        set.blocks.push(root);
        (set, id)
    }

    pub fn insert(&mut self, block: Block) -> Result<BlockId> {
        if self.by_name.contains_key(block.id()) {
            return Err(OrchestratorError::DuplicateId(format!("block {}", block.id())));
        }
        let id = BlockId(self.blocks.len());
        self.by_name.insert(block.id().to_string(), id);
        self.blocks.push(block);
        Ok(id)
    }

    pub fn get(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id.0)
    }

    pub fn get_mut(&mut self, id: BlockId) -> Option<&mut Block> {
        self.blocks.get_mut(id.0)
    }

    pub fn find(&self, name: &str) -> Option<BlockId> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len()).map(BlockId)
    }

    pub fn backup_all(&mut self) {
        for block in &mut self.blocks {
            block.backup();
        }
    }

    pub fn restore_all(&mut self) {
        for block in &mut self.blocks {
            block.restore();
        }
    }

    /// Step ids queued in blocks nested below `id`, not counting its own
    /// direct items.
    pub fn nested_step_ids(&self, id: BlockId) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        if let Some(block) = self.get(id) {
            for (item, _) in &block.unfinished {
                if let BlockItem::Block { block: child, .. } = item {
                    self.collect_step_ids(*child, &mut out);
                }
            }
        }
        out
    }

    fn collect_step_ids(&self, id: BlockId, out: &mut BTreeSet<String>) {
        let Some(block) = self.get(id) else {
            return;
        };
        for (item, _) in &block.unfinished {
            match item {
                BlockItem::Step(step) => {
                    out.insert(step.id.clone());
                }
                BlockItem::Block { block: child, .. } => self.collect_step_ids(*child, out),
                BlockItem::Stage(_) => {}
            }
        }
    }

    /// Finalize every block reachable from `root`, children before parents.
    pub fn finalize_from<R: Rng + ?Sized>(&mut self, root: BlockId, rng: &mut R) -> Result<()> {
        let mut order = Vec::new();
        self.post_order(root, &mut order);
        for id in order {
            if let Some(block) = self.get_mut(id) {
                block.finalize(rng)?;
            }
        }
        Ok(())
    }

    fn post_order(&self, id: BlockId, out: &mut Vec<BlockId>) {
        let Some(block) = self.get(id) else {
            return;
        };
        for (item, _) in &block.unfinished {
            match item {
                BlockItem::Block { block: child, .. } => self.post_order(*child, out),
                BlockItem::Stage(StageUnit {
                    steps_block: Some(steps),
                    ..
                }) => self.post_order(*steps, out),
                _ => {}
            }
        }
        out.push(id);
    }
}

/// Depth-first position in a finalized block hierarchy.
///
/// The cursor is a plain value: restarting means building a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockCursor {
    stack: Vec<(BlockId, usize)>,
}

impl BlockCursor {
    pub fn new(root: BlockId) -> Self {
        Self {
            stack: vec![(root, 0)],
        }
    }

    /// Next leaf (stage or step) in final order, descending into nested
    /// blocks. `None` once the hierarchy is exhausted.
    pub fn next<'a>(&mut self, blocks: &'a BlockSet) -> Option<&'a BlockItem> {
        loop {
            let (block_id, index) = self.stack.last_mut()?;
            let Some(block) = blocks.get(*block_id) else {
                self.stack.pop();
                continue;
            };
            let Some(item) = block.items().get(*index) else {
                self.stack.pop();
                continue;
            };
            *index += 1;
            match item {
                BlockItem::Block { block: child, .. } => self.stack.push((*child, 0)),
                leaf => return Some(leaf),
            }
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.stack.is_empty()
    }
}
