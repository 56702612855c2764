//! Event system for cadence sessions
//!
//! This crate provides the broadcast event bus used to observe session
//! lifecycle transitions from other tasks, and the scoped synchronous
//! listener registry a session uses to react to them in-line.

mod bus;
mod listeners;
mod types;

pub use bus::EventBus;
pub use listeners::{Listener, ListenerId, ListenerScope, ScopedListeners};
pub use types::*;
