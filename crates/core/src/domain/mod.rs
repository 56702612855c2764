mod level;
mod message;
mod plan;
mod position;

pub use level::{EngineLevel, ProgressLevel};
pub use message::{Command, RosterReport, StepTarget};
pub use plan::{EntryKind, PlanEntry};
pub use position::{Coord, Position, PositionRef};
