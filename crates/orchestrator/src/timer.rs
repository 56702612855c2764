//! Pausable named timers.
//!
//! The service keeps deadlines only. Whoever drives the session sleeps until
//! [`TimerService::next_deadline`] and then collects what expired, so the
//! service itself never spawns tasks.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TimerError {
    #[error("Unknown timer: {0}")]
    Unknown(String),

    #[error("Timer {0} is not running")]
    NotRunning(String),

    #[error("Timer {0} is already stopped")]
    AlreadyStopped(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Running { deadline: Instant },
    Paused { remaining: Duration },
    Stopped,
}

#[derive(Debug, Default)]
pub struct TimerService {
    timers: BTreeMap<String, TimerState>,
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) a timer.
    pub fn start(&mut self, name: impl Into<String>, duration: Duration) {
        let name = name.into();
        debug!(timer = %name, ms = duration.as_millis() as u64, "Timer started");
        self.timers.insert(
            name,
            TimerState::Running {
                deadline: Instant::now() + duration,
            },
        );
    }

    /// Stop one timer. Stopping a stopped timer is reported, not ignored.
    pub fn stop(&mut self, name: &str) -> Result<(), TimerError> {
        let state = self
            .timers
            .get_mut(name)
            .ok_or_else(|| TimerError::Unknown(name.to_string()))?;
        if *state == TimerState::Stopped {
            return Err(TimerError::AlreadyStopped(name.to_string()));
        }
        *state = TimerState::Stopped;
        Ok(())
    }

    pub fn stop_all(&mut self) {
        for state in self.timers.values_mut() {
            *state = TimerState::Stopped;
        }
    }

    pub fn pause(&mut self, name: &str) -> Result<(), TimerError> {
        let state = self
            .timers
            .get_mut(name)
            .ok_or_else(|| TimerError::Unknown(name.to_string()))?;
        match *state {
            TimerState::Running { deadline } => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                *state = TimerState::Paused { remaining };
                Ok(())
            }
            _ => Err(TimerError::NotRunning(name.to_string())),
        }
    }

    pub fn resume(&mut self, name: &str) -> Result<(), TimerError> {
        let state = self
            .timers
            .get_mut(name)
            .ok_or_else(|| TimerError::Unknown(name.to_string()))?;
        match *state {
            TimerState::Paused { remaining } => {
                *state = TimerState::Running {
                    deadline: Instant::now() + remaining,
                };
                Ok(())
            }
            TimerState::Running { .. } => Ok(()),
            TimerState::Stopped => Err(TimerError::AlreadyStopped(name.to_string())),
        }
    }

    /// Pause every running timer, keeping its remaining time.
    pub fn pause_all(&mut self) {
        let now = Instant::now();
        for state in self.timers.values_mut() {
            if let TimerState::Running { deadline } = *state {
                *state = TimerState::Paused {
                    remaining: deadline.saturating_duration_since(now),
                };
            }
        }
    }

    pub fn resume_all(&mut self) {
        let now = Instant::now();
        for state in self.timers.values_mut() {
            if let TimerState::Paused { remaining } = *state {
                *state = TimerState::Running {
                    deadline: now + remaining,
                };
            }
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        matches!(self.timers.get(name), Some(TimerState::Running { .. }))
    }

    /// Time left on a running or paused timer.
    pub fn remaining(&self, name: &str) -> Option<Duration> {
        match self.timers.get(name)? {
            TimerState::Running { deadline } => {
                Some(deadline.saturating_duration_since(Instant::now()))
            }
            TimerState::Paused { remaining } => Some(*remaining),
            TimerState::Stopped => None,
        }
    }

    /// Earliest deadline among running timers.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers
            .values()
            .filter_map(|state| match state {
                TimerState::Running { deadline } => Some(*deadline),
                _ => None,
            })
            .min()
    }

    /// Stop and return every running timer whose deadline has passed.
    pub fn take_expired(&mut self) -> Vec<String> {
        let now = Instant::now();
        let mut expired = Vec::new();
        for (name, state) in self.timers.iter_mut() {
            if let TimerState::Running { deadline } = *state {
                if deadline <= now {
                    *state = TimerState::Stopped;
                    expired.push(name.clone());
                }
            }
        }
        expired
    }
}
