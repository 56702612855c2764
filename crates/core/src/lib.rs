//! Shared domain types for the cadence stage/step engine.
//!
//! Everything here is plain data that crosses crate or wire boundaries:
//! plan positions, lifecycle levels, plan entries and the messages that
//! participants and coordinators exchange.

pub mod domain;
pub mod error;

pub use domain::*;
pub use error::CoreError;
