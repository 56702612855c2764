use cadence_core::{CoreError, EngineLevel, Position};
use thiserror::Error;

use crate::timer::TimerError;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid engine level transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Cannot {verb} while engine is {level}")]
    Precondition { verb: String, level: String },

    #[error("Unknown position: {0}")]
    UnknownPosition(String),

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Unknown step: {0}")]
    UnknownStep(String),

    #[error("Duplicate id: {0}")]
    DuplicateId(String),

    #[error("Invalid declaration: {0}")]
    InvalidDeclaration(String),

    #[error("Block {0} is already finalized")]
    BlockFinalized(String),

    #[error("No legal position left for {item} in block {block}")]
    NoLegalPosition { block: String, item: String },

    #[error("Sequence is already finalized; reset it first")]
    AlreadyFinalized,

    #[error("Sequence is not finalized")]
    NotFinalized,

    #[error("{hook} failed at {position}: {reason}")]
    Callback {
        hook: String,
        position: String,
        reason: String,
    },

    #[error("Timer error: {0}")]
    Timer(#[from] TimerError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl OrchestratorError {
    /// A verb was called outside the engine levels that allow it.
    pub fn precondition(verb: impl Into<String>, level: EngineLevel) -> Self {
        Self::Precondition {
            verb: verb.into(),
            level: level.as_str().to_string(),
        }
    }

    /// A hook or step callback raised an error.
    pub fn callback(hook: impl Into<String>, position: Position, reason: impl Into<String>) -> Self {
        Self::Callback {
            hook: hook.into(),
            position: position.to_string(),
            reason: reason.into(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidDeclaration(reason.into())
    }

    /// Build-time errors are raised while declaring or finalizing a plan.
    pub fn is_declaration_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateId(_)
                | Self::InvalidDeclaration(_)
                | Self::BlockFinalized(_)
                | Self::NoLegalPosition { .. }
                | Self::UnknownStage(_)
                | Self::UnknownStep(_)
                | Self::AlreadyFinalized
        )
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
