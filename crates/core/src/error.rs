use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Invalid position: {0}")]
    InvalidPosition(String),

    #[error("Unknown level code: {0}")]
    UnknownLevel(i32),

    #[error("Unknown step target: {0}")]
    InvalidTarget(String),

    #[error("Validation error: {0}")]
    Validation(String),
}
