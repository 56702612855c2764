//! TOML plan description loaded by the CLI.
//!
//! ```toml
//! default_rule = "SOLO"
//!
//! [[steps]]
//! id = "instructions"
//! timer = 3000
//!
//! [[stages]]
//! id = "game"
//! steps = ["instructions", "bid"]
//!
//! [[sequence]]
//! stage = "game"
//! kind = "repeat"
//! rounds = 3
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use orchestrator::{done_callback, AdvancementRule, Plan, StageDef, Stager, StepDef};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanFile {
    pub default_rule: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub stages: Vec<StageSpec>,
    #[serde(default)]
    pub sequence: Vec<SequenceSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepSpec {
    pub id: String,
    /// Milliseconds
    pub timer: Option<u64>,
    pub frame: Option<String>,
    pub rule: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageSpec {
    pub id: String,
    /// Omitted: the stage is a single step of the same name
    #[serde(default)]
    pub steps: Vec<String>,
    pub rule: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceKind {
    #[default]
    Plain,
    Repeat,
    Loop,
    DoLoop,
    Gameover,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SequenceSpec {
    pub stage: Option<String>,
    #[serde(default)]
    pub kind: SequenceKind,
    /// Repeat count, or how many rounds a loop keeps going
    pub rounds: Option<u32>,
    pub alias: Option<String>,
}

impl PlanFile {
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid plan file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Declare everything on a fresh stager and sequence it, leaving the
    /// stager open so skips can still be applied.
    pub fn stager(&self) -> Result<Stager> {
        let mut stager = Stager::new();

        for step in &self.steps {
            let mut def = StepDef::with_callback(&step.id, done_callback());
            if let Some(timer) = step.timer {
                def = def.with_timer(timer);
            }
            if let Some(frame) = &step.frame {
                def = def.with_frame(frame);
            }
            if let Some(rule) = &step.rule {
                def = def.with_rule(AdvancementRule::named(rule));
            }
            stager.add_step(def)?;
        }

        for stage in &self.stages {
            let mut def = if stage.steps.is_empty() {
                StageDef::new(&stage.id)
            } else {
                StageDef::with_steps(&stage.id, stage.steps.iter().map(String::as_str))
            };
            if let Some(rule) = &stage.rule {
                def = def.with_rule(AdvancementRule::named(rule));
            }
            stager.add_stage(def)?;
        }

        if let Some(rule) = &self.default_rule {
            stager.set_default_rule(AdvancementRule::named(rule));
        }

        for entry in &self.sequence {
            self.sequence_entry(&mut stager, entry)?;
        }
        Ok(stager)
    }

    fn sequence_entry(&self, stager: &mut Stager, entry: &SequenceSpec) -> Result<()> {
        if entry.kind == SequenceKind::Gameover {
            stager.gameover()?;
            return Ok(());
        }
        let Some(stage) = entry.stage.as_deref() else {
            bail!("sequence entry of kind {:?} needs a stage", entry.kind);
        };
        let rounds = entry.rounds.unwrap_or(1);

        match entry.kind {
            SequenceKind::Plain => match entry.alias.as_deref() {
                Some(alias) => stager.stage_as(stage, alias)?,
                None => stager.stage(stage)?,
            },
            SequenceKind::Repeat => stager.repeat(stage, rounds)?,
            SequenceKind::Loop => {
                let checks = Arc::new(AtomicU32::new(0));
                stager.loop_stage(stage, move || checks.fetch_add(1, Ordering::SeqCst) < rounds)?
            }
            // The condition is first checked after the opening round.
            SequenceKind::DoLoop => {
                let checks = Arc::new(AtomicU32::new(1));
                stager.do_loop(stage, move || checks.fetch_add(1, Ordering::SeqCst) < rounds)?
            }
            SequenceKind::Gameover => stager.gameover()?,
        };
        Ok(())
    }

    /// Build the plan with the given `stage` or `stage.step` entries left out.
    pub fn build(&self, skips: &[String]) -> Result<Arc<Plan>> {
        let mut stager = self.stager()?;
        for skip in skips {
            match skip.split_once('.') {
                Some((stage, step)) => stager.skip(stage, Some(step))?,
                None => stager.skip(skip, None)?,
            };
        }
        Ok(stager.finalize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::EntryKind;

    const SAMPLE: &str = r#"
default_rule = "SOLO"

[[steps]]
id = "a1"
timer = 500

[[steps]]
id = "a2"
frame = "a2.html"
rule = "WAIT"

[[stages]]
id = "A"
steps = ["a1", "a2"]

[[stages]]
id = "B"

[[sequence]]
stage = "A"

[[sequence]]
stage = "B"
kind = "repeat"
rounds = 2

[[sequence]]
kind = "gameover"
"#;

    #[test]
    fn test_parse_and_build() {
        let file = PlanFile::parse(SAMPLE).unwrap();
        assert_eq!(file.steps.len(), 2);
        assert_eq!(file.sequence[1].kind, SequenceKind::Repeat);

        let plan = file.build(&[]).unwrap();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.entries()[0].step_count(), 2);
        assert_eq!(plan.entries()[1].kind, EntryKind::Repeat { num: 2 });
        assert!(plan.entries()[2].is_gameover());
    }

    #[test]
    fn test_build_with_skips() {
        let file = PlanFile::parse(SAMPLE).unwrap();
        let plan = file.build(&["A.a2".to_string(), "B".to_string()]).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.entries()[0].step_count(), 1);
    }

    #[test]
    fn test_unknown_skip_is_an_error() {
        let file = PlanFile::parse(SAMPLE).unwrap();
        assert!(file.build(&["Z".to_string()]).is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(PlanFile::parse("[[steps]]\nid = \"a\"\nsize = 3\n").is_err());
    }

    #[test]
    fn test_sequence_entry_needs_stage() {
        let file = PlanFile::parse("[[sequence]]\nkind = \"repeat\"\nrounds = 2\n").unwrap();
        assert!(file.stager().is_err());
    }
}
