//! Async loop that feeds a [`Session`] from the transport.

use cadence_core::{Command, EngineLevel, RosterReport};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::context::DataMessage;
use crate::error::Result;
use crate::session::Session;

/// Everything that can reach a participant from outside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Inbound {
    Report(RosterReport),
    Joined(String),
    Left(String),
    Command(Command),
    Data(DataMessage),
    /// The local participant finished its step.
    Done,
}

pub struct SessionDriver {
    session: Session,
    inbound: mpsc::Receiver<Inbound>,
}

impl SessionDriver {
    pub fn new(session: Session, inbound: mpsc::Receiver<Inbound>) -> Self {
        Self { session, inbound }
    }

    /// Driver plus the sender that feeds it.
    pub fn channel(session: Session, capacity: usize) -> (Self, mpsc::Sender<Inbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(session, rx), tx)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Run until the inbound channel closes or the session reaches
    /// gameover. Failed verbs are logged and the loop carries on; the
    /// session stays where it is until a corrective command arrives.
    pub async fn run(mut self) -> Result<Session> {
        info!(participant = %self.session.engine().participant_id(), "Session driver started");
        loop {
            if self.session.engine().level() == EngineLevel::Gameover {
                break;
            }

            let deadline = self.session.timers().next_deadline();
            tokio::select! {
                message = self.inbound.recv() => match message {
                    Some(message) => self.dispatch(message),
                    None => {
                        debug!("Inbound channel closed");
                        break;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Err(e) = self.session.fire_timers() {
                        warn!(error = %e, "Timer handling failed");
                    }
                }
            }

            self.drain().await;
        }
        info!(
            participant = %self.session.engine().participant_id(),
            level = %self.session.engine().level().as_str(),
            "Session driver stopped"
        );
        Ok(self.session)
    }

    fn dispatch(&mut self, message: Inbound) {
        let outcome = match message {
            Inbound::Report(report) => self.session.on_report(&report),
            Inbound::Joined(id) => self.session.on_join(&id),
            Inbound::Left(id) => self.session.on_leave(&id),
            Inbound::Command(command) => self.session.handle_command(command),
            Inbound::Data(data) => self.session.deliver(data),
            Inbound::Done => self.session.done(),
        };
        if let Err(e) = outcome {
            warn!(participant = %self.session.engine().participant_id(), error = %e, "Inbound message rejected");
        }
    }

    /// One deferred action per tick, yielding in between so other tasks
    /// see the intermediate state.
    async fn drain(&mut self) {
        loop {
            match self.session.tick() {
                Ok(true) => tokio::task::yield_now().await,
                Ok(false) => break,
                Err(e) => {
                    warn!(error = %e, "Deferred action failed");
                    break;
                }
            }
        }
    }
}
