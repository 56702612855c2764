use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::level::ProgressLevel;
use super::position::{Position, PositionRef};
use crate::error::CoreError;

/// Progress report a participant broadcasts whenever its progress changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RosterReport {
    pub position: Position,
    pub progress_level: ProgressLevel,
    pub participant_id: String,
}

impl RosterReport {
    pub fn new(
        participant_id: impl Into<String>,
        position: Position,
        progress_level: ProgressLevel,
    ) -> Self {
        Self {
            position,
            progress_level,
            participant_id: participant_id.into(),
        }
    }
}

/// Where a step verb should go.
///
/// On the wire this is a string: `"next"`, `"gameover"`, or a dotted
/// position such as `"2.1.1"` or `"intro.welcome.1"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StepTarget {
    Next,
    Gameover,
    Position(PositionRef),
}

impl fmt::Display for StepTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Next => f.write_str("next"),
            Self::Gameover => f.write_str("gameover"),
            Self::Position(pos) => write!(f, "{pos}"),
        }
    }
}

impl FromStr for StepTarget {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err(CoreError::InvalidTarget(s.to_string())),
            "next" => Ok(Self::Next),
            "gameover" => Ok(Self::Gameover),
            other => other
                .parse::<PositionRef>()
                .map(Self::Position)
                .map_err(|_| CoreError::InvalidTarget(s.to_string())),
        }
    }
}

impl TryFrom<String> for StepTarget {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StepTarget> for String {
    fn from(target: StepTarget) -> Self {
        target.to_string()
    }
}

impl From<Position> for StepTarget {
    fn from(pos: Position) -> Self {
        Self::Position(pos.into())
    }
}

/// Boundary verbs a coordinator may send to a participant's session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Start,
    Pause,
    Resume,
    Step,
    Stop,
    GotoStep { target: StepTarget },
    ClearBuffer,
    EraseBuffer,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Step => "step",
            Self::Stop => "stop",
            Self::GotoStep { .. } => "goto_step",
            Self::ClearBuffer => "clear_buffer",
            Self::EraseBuffer => "erase_buffer",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roster_report_wire_form() {
        let report = RosterReport::new("p1", Position::new(2, 1, 1), ProgressLevel::Done);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"position": "2.1.1", "progressLevel": 100, "participantId": "p1"})
        );

        let back: RosterReport = serde_json::from_value(json).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn test_step_target_parsing() {
        assert_eq!("next".parse::<StepTarget>(), Ok(StepTarget::Next));
        assert_eq!("gameover".parse::<StepTarget>(), Ok(StepTarget::Gameover));
        assert_eq!(
            "quiz.q2".parse::<StepTarget>(),
            Ok(StepTarget::Position(PositionRef::named("quiz", "q2")))
        );
        assert!("".parse::<StepTarget>().is_err());
    }

    #[test]
    fn test_command_serialization() {
        let cmd = Command::GotoStep {
            target: StepTarget::from(Position::new(3, 1, 1)),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("goto_step"));
        assert!(json.contains("3.1.1"));

        let cmd: Command = serde_json::from_str(r#"{"command":"erase_buffer"}"#).unwrap();
        assert_eq!(cmd, Command::EraseBuffer);
        assert_eq!(cmd.as_str(), "erase_buffer");
    }
}
