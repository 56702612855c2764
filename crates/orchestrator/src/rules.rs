//! Advancement rules: may a participant move on from its current position?

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use cadence_core::{Position, ProgressLevel};
use tracing::debug;

use crate::roster::Roster;

/// Built-in rule names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleName {
    Solo,
    Wait,
    SyncStep,
    SyncStage,
    OthersSyncStep,
}

impl RuleName {
    pub const ALL: [RuleName; 5] = [
        RuleName::Solo,
        RuleName::Wait,
        RuleName::SyncStep,
        RuleName::SyncStage,
        RuleName::OthersSyncStep,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleName::Solo => "SOLO",
            RuleName::Wait => "WAIT",
            RuleName::SyncStep => "SYNC_STEP",
            RuleName::SyncStage => "SYNC_STAGE",
            RuleName::OthersSyncStep => "OTHERS_SYNC_STEP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SOLO" => Some(RuleName::Solo),
            "WAIT" => Some(RuleName::Wait),
            "SYNC_STEP" => Some(RuleName::SyncStep),
            "SYNC_STAGE" => Some(RuleName::SyncStage),
            "OTHERS_SYNC_STEP" => Some(RuleName::OthersSyncStep),
            _ => None,
        }
    }
}

/// Inputs a rule decides on.
pub struct RuleContext<'a> {
    pub position: Position,
    pub progress: ProgressLevel,
    pub roster: &'a Roster,
    /// Steps after the current one in the current stage.
    pub steps_left: u32,
}

pub type RuleFn = Arc<dyn Fn(&RuleContext<'_>) -> bool + Send + Sync>;

/// A rule bound to a position: a registry name or a direct callback.
#[derive(Clone)]
pub enum AdvancementRule {
    Named(String),
    Custom(RuleFn),
}

impl AdvancementRule {
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    pub fn custom(rule: impl Fn(&RuleContext<'_>) -> bool + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(rule))
    }

    /// Registry name, if the rule is named.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Named(name) => Some(name),
            Self::Custom(_) => None,
        }
    }
}

impl From<RuleName> for AdvancementRule {
    fn from(name: RuleName) -> Self {
        Self::Named(name.as_str().to_string())
    }
}

impl fmt::Debug for AdvancementRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => f.debug_tuple("Named").field(name).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Immutable name → rule map handed to each session engine.
#[derive(Clone)]
pub struct RuleRegistry {
    rules: HashMap<String, RuleFn>,
}

impl RuleRegistry {
    /// Registry holding only the built-in rules.
    pub fn builtin() -> Self {
        let mut rules: HashMap<String, RuleFn> = HashMap::new();
        for name in RuleName::ALL {
            rules.insert(name.as_str().to_string(), builtin_rule(name));
        }
        Self { rules }
    }

    /// Add or override a named rule.
    pub fn with_rule(
        mut self,
        name: impl Into<String>,
        rule: impl Fn(&RuleContext<'_>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.rules.insert(name.into(), Arc::new(rule));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rules.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.rules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// An unknown rule name never permits advancing.
    pub fn evaluate(&self, rule: &AdvancementRule, ctx: &RuleContext<'_>) -> bool {
        match rule {
            AdvancementRule::Custom(f) => f(ctx),
            AdvancementRule::Named(name) => match self.rules.get(name) {
                Some(f) => f(ctx),
                None => {
                    debug!(rule = %name, "Unknown advancement rule");
                    false
                }
            },
        }
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl fmt::Debug for RuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleRegistry")
            .field("rules", &self.names())
            .finish()
    }
}

fn builtin_rule(name: RuleName) -> RuleFn {
    match name {
        RuleName::Solo => Arc::new(solo),
        RuleName::Wait => Arc::new(|_: &RuleContext<'_>| false),
        RuleName::SyncStep => Arc::new(sync_step),
        RuleName::SyncStage => Arc::new(sync_stage),
        RuleName::OthersSyncStep => Arc::new(others_sync_step),
    }
}

fn solo(ctx: &RuleContext<'_>) -> bool {
    ctx.progress.is_done()
}

fn sync_step(ctx: &RuleContext<'_>) -> bool {
    ctx.progress.is_done()
        && ctx
            .roster
            .entries()
            .all(|e| e.position == ctx.position && e.progress.is_done())
}

fn sync_stage(ctx: &RuleContext<'_>) -> bool {
    if !ctx.progress.is_done() {
        return false;
    }
    if ctx.steps_left > 0 {
        return true;
    }
    let pos = ctx.position;
    ctx.roster.entries().all(|e| {
        e.position.stage == pos.stage
            && e.position.round == pos.round
            && (e.position.step > pos.step
                || (e.position.step == pos.step && e.progress.is_done()))
    })
}

fn others_sync_step(ctx: &RuleContext<'_>) -> bool {
    let mut entries = ctx.roster.entries();
    let Some(first) = entries.next() else {
        return false;
    };
    first.progress.is_done()
        && entries.all(|e| e.position == first.position && e.progress.is_done())
}
