use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A resolved point in a plan.
///
/// All three fields are 1-based ordinals. `(0,0,0)` is the unique
/// "not started" position; any other triple with a zero field is invalid.
/// The derived ordering compares stage, then step, then round.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct Position {
    pub stage: u32,
    pub step: u32,
    pub round: u32,
}

impl Position {
    /// The "not started" position.
    pub const ZERO: Position = Position {
        stage: 0,
        step: 0,
        round: 0,
    };

    /// The first position of any non-empty plan.
    pub const FIRST: Position = Position {
        stage: 1,
        step: 1,
        round: 1,
    };

    pub const fn new(stage: u32, step: u32, round: u32) -> Self {
        Self { stage, step, round }
    }

    /// Build a position, rejecting triples that mix zero and non-zero fields.
    pub fn try_new(stage: u32, step: u32, round: u32) -> Result<Self, CoreError> {
        let pos = Self::new(stage, step, round);
        if pos.is_valid() {
            Ok(pos)
        } else {
            Err(CoreError::InvalidPosition(pos.to_string()))
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn is_valid(&self) -> bool {
        self.is_zero() || (self.stage > 0 && self.step > 0 && self.round > 0)
    }

    /// Same stage and round, ignoring the step.
    pub fn same_stage(&self, other: &Position) -> bool {
        self.stage == other.stage && self.round == other.round
    }

    /// Format the position through a template where `S`, `s` and `r` are
    /// replaced by stage, step and round. Other characters pass through.
    pub fn to_hash(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len() + 4);
        for ch in template.chars() {
            match ch {
                'S' => out.push_str(&self.stage.to_string()),
                's' => out.push_str(&self.step.to_string()),
                'r' => out.push_str(&self.round.to_string()),
                other => out.push(other),
            }
        }
        out
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.stage, self.step, self.round)
    }
}

impl FromStr for Position {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = PositionRef::from_str(s)?;
        match (&parsed.stage, &parsed.step) {
            (Coord::Ordinal(stage), Coord::Ordinal(step)) => {
                Position::try_new(*stage, *step, parsed.round)
            }
            _ => Err(CoreError::InvalidPosition(format!(
                "{s}: symbolic names need a plan to resolve"
            ))),
        }
    }
}

impl TryFrom<String> for Position {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Position> for String {
    fn from(pos: Position) -> Self {
        pos.to_string()
    }
}

/// One coordinate of an unresolved position: an ordinal or a symbolic id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Coord {
    Ordinal(u32),
    Name(String),
}

impl Coord {
    fn parse(part: &str, whole: &str) -> Result<Self, CoreError> {
        let part = part.trim();
        if part.is_empty() {
            return Err(CoreError::InvalidPosition(whole.to_string()));
        }
        Ok(match part.parse::<u32>() {
            Ok(n) => Coord::Ordinal(n),
            Err(_) => Coord::Name(part.to_string()),
        })
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Coord::Ordinal(n) => write!(f, "{n}"),
            Coord::Name(name) => f.write_str(name),
        }
    }
}

/// A position as a caller or the wire states it, before it is resolved
/// against a finalized plan. Stage and step may be symbolic ids.
///
/// Parsing accepts `stage`, `stage.step` and `stage.step.round`; missing
/// parts default to 1.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PositionRef {
    pub stage: Coord,
    pub step: Coord,
    pub round: u32,
}

impl PositionRef {
    pub fn named(stage: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            stage: Coord::Name(stage.into()),
            step: Coord::Name(step.into()),
            round: 1,
        }
    }

    pub fn with_round(mut self, round: u32) -> Self {
        self.round = round;
        self
    }
}

impl From<Position> for PositionRef {
    fn from(pos: Position) -> Self {
        Self {
            stage: Coord::Ordinal(pos.stage),
            step: Coord::Ordinal(pos.step),
            round: pos.round,
        }
    }
}

impl fmt::Display for PositionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.stage, self.step, self.round)
    }
}

impl FromStr for PositionRef {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.is_empty() || parts.len() > 3 {
            return Err(CoreError::InvalidPosition(s.to_string()));
        }

        let stage = Coord::parse(parts[0], s)?;
        let step = match parts.get(1) {
            Some(part) => Coord::parse(part, s)?,
            None => Coord::Ordinal(1),
        };
        let round = match parts.get(2) {
            Some(part) => part
                .trim()
                .parse::<u32>()
                .map_err(|_| CoreError::InvalidPosition(s.to_string()))?,
            None => 1,
        };

        Ok(Self { stage, step, round })
    }
}

impl TryFrom<String> for PositionRef {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PositionRef> for String {
    fn from(pos: PositionRef) -> Self {
        pos.to_string()
    }
}
