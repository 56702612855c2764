//! Executes the effects a [`SessionEngine`] asks for.
//!
//! A `Session` owns one participant's engine together with its roster view,
//! listeners, timers and collaborators. Hooks and callbacks run here,
//! synchronously, and their outcomes are fed back into the engine.

use std::collections::VecDeque;
use std::sync::Arc;

use cadence_core::{Command, Position, RosterReport, StepTarget};
use events::{Event, EventBus, ScopedListeners, ThresholdData};
use tracing::{debug, info, warn};

use crate::collaborators::{FactLog, MemoryLog, NoopPresenter, NullTransport, Presenter, Transport};
use crate::config::EngineConfig;
use crate::context::{DataMessage, HookError, StepContext};
use crate::engine::{Deferred, Effect, HookKind, SessionEngine, STEP_TIMER};
use crate::error::{OrchestratorError, Result};
use crate::plan::Plan;
use crate::roster::Roster;
use crate::rules::RuleRegistry;
use crate::thresholds::ThresholdChange;
use crate::timer::TimerService;

pub struct Session {
    engine: SessionEngine,
    roster: Roster,
    listeners: ScopedListeners<Event>,
    bus: EventBus,
    log: Box<dyn FactLog>,
    presenter: Box<dyn Presenter>,
    transport: Box<dyn Transport>,
    timers: TimerService,
    buffer: VecDeque<DataMessage>,
    buffer_limit: usize,
    deferred: VecDeque<Deferred>,
}

impl Session {
    pub fn new(plan: Arc<Plan>, rules: RuleRegistry, config: &EngineConfig) -> Self {
        Self {
            engine: SessionEngine::new(plan, rules, config),
            roster: Roster::new(),
            listeners: ScopedListeners::new(),
            bus: EventBus::with_capacity(config.event_capacity),
            log: Box::new(MemoryLog::new()),
            presenter: Box::new(NoopPresenter),
            transport: Box::new(NullTransport),
            timers: TimerService::new(),
            buffer: VecDeque::new(),
            buffer_limit: config.pause_buffer_limit,
            deferred: VecDeque::new(),
        }
    }

    pub fn with_log(mut self, log: impl FactLog + 'static) -> Self {
        self.log = Box::new(log);
        self
    }

    pub fn with_presenter(mut self, presenter: impl Presenter + 'static) -> Self {
        self.presenter = Box::new(presenter);
        self
    }

    pub fn with_transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Box::new(transport);
        self
    }

    /// Publish on a shared bus instead of a private one.
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn engine(&self) -> &SessionEngine {
        &self.engine
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn log(&self) -> &dyn FactLog {
        self.log.as_ref()
    }

    pub fn listeners_mut(&mut self) -> &mut ScopedListeners<Event> {
        &mut self.listeners
    }

    pub fn timers(&self) -> &TimerService {
        &self.timers
    }

    pub fn buffered_messages(&self) -> usize {
        self.buffer.len()
    }

    pub fn has_deferred(&self) -> bool {
        !self.deferred.is_empty()
    }

    pub fn should_step(&self) -> bool {
        self.engine.should_step(&self.roster, None)
    }

    // ---- verbs ----

    pub fn start(&mut self) -> Result<()> {
        let effects = self.engine.start()?;
        self.apply(effects)
    }

    pub fn step(&mut self) -> Result<()> {
        let effects = self.engine.step()?;
        self.apply(effects)
    }

    pub fn goto_step(&mut self, target: StepTarget) -> Result<()> {
        let effects = self.engine.goto_step(target)?;
        self.apply(effects)
    }

    pub fn done(&mut self) -> Result<()> {
        let effects = self.engine.done()?;
        self.apply(effects)
    }

    pub fn retry_callback(&mut self) -> Result<()> {
        let effects = self.engine.retry_callback()?;
        self.apply(effects)
    }

    pub fn pause(&mut self) -> Result<()> {
        let effects = self.engine.pause()?;
        self.apply(effects)
    }

    pub fn resume(&mut self) -> Result<()> {
        let effects = self.engine.resume()?;
        self.apply(effects)
    }

    pub fn gameover(&mut self) -> Result<()> {
        let effects = self.engine.gameover()?;
        self.apply(effects)
    }

    /// Drop all run state, pending work and buffered messages.
    pub fn stop(&mut self) -> Result<()> {
        self.deferred.clear();
        self.buffer.clear();
        let effects = self.engine.stop();
        self.apply(effects)
    }

    pub fn handle_command(&mut self, command: Command) -> Result<()> {
        debug!(participant = %self.engine.participant_id(), command = command.as_str(), "Command");
        match command {
            Command::Start => self.start(),
            Command::Pause => self.pause(),
            Command::Resume => self.resume(),
            Command::Step => self.step(),
            Command::Stop => self.stop(),
            Command::GotoStep { target } => self.goto_step(target),
            Command::ClearBuffer => self.clear_buffer(),
            Command::EraseBuffer => {
                self.erase_buffer();
                Ok(())
            }
        }
    }

    // ---- roster ----

    /// Progress report from another participant. Echoes of our own
    /// reports are ignored.
    pub fn on_report(&mut self, report: &RosterReport) -> Result<()> {
        if report.participant_id == self.engine.participant_id() {
            return Ok(());
        }
        if self.roster.apply(report) {
            self.joined(&report.participant_id);
        }
        let effects = self.engine.on_roster_update(&self.roster);
        self.apply(effects)
    }

    pub fn on_join(&mut self, participant_id: &str) -> Result<()> {
        if participant_id == self.engine.participant_id() || !self.roster.join(participant_id) {
            return Ok(());
        }
        self.joined(participant_id);
        let effects = self.engine.on_roster_update(&self.roster);
        self.apply(effects)
    }

    pub fn on_leave(&mut self, participant_id: &str) -> Result<()> {
        if !self.roster.leave(participant_id) {
            return Ok(());
        }
        info!(participant = %self.engine.participant_id(), left = %participant_id, "Participant left");
        self.publish(Event::ParticipantLeft {
            participant_id: participant_id.to_string(),
        });
        let effects = self.engine.on_roster_update(&self.roster);
        self.apply(effects)
    }

    fn joined(&mut self, participant_id: &str) {
        info!(participant = %self.engine.participant_id(), joined = %participant_id, "Participant joined");
        self.publish(Event::ParticipantJoined {
            participant_id: participant_id.to_string(),
        });
    }

    // ---- messages ----

    /// Deliver a data message. While paused it goes to the step's pause
    /// handler, or into the buffer when there is none.
    pub fn deliver(&mut self, message: DataMessage) -> Result<()> {
        if !self.engine.is_paused() {
            self.publish(message_event(message));
            return Ok(());
        }

        let position = self.engine.position();
        let handler = self
            .engine
            .navigator()
            .step_def(position)
            .and_then(|s| s.on_pause_message.clone());
        match handler {
            Some(handler) => {
                let outcome = self.with_context(position, |ctx| handler(ctx, &message));
                self.check_hook("pause message handler", position, outcome)
            }
            None => {
                self.buffer.push_back(message);
                if self.buffer.len() > self.buffer_limit {
                    if let Some(dropped) = self.buffer.pop_front() {
                        warn!(
                            participant = %self.engine.participant_id(),
                            key = %dropped.key,
                            limit = self.buffer_limit,
                            "Pause buffer full, dropping oldest message"
                        );
                    }
                }
                Ok(())
            }
        }
    }

    /// Hand buffered messages to the default handler.
    pub fn clear_buffer(&mut self) -> Result<()> {
        let messages: Vec<DataMessage> = self.buffer.drain(..).collect();
        debug!(participant = %self.engine.participant_id(), count = messages.len(), "Clearing buffer");
        for message in messages {
            self.publish(message_event(message));
        }
        Ok(())
    }

    /// Discard buffered messages.
    pub fn erase_buffer(&mut self) {
        debug!(participant = %self.engine.participant_id(), count = self.buffer.len(), "Erasing buffer");
        self.buffer.clear();
    }

    // ---- ticks and timers ----

    /// Run one deferred action. Returns false when nothing was pending.
    pub fn tick(&mut self) -> Result<bool> {
        let Some(deferred) = self.deferred.pop_front() else {
            return Ok(false);
        };
        let effects = self.engine.run_deferred(deferred, &self.roster)?;
        self.apply(effects)?;
        Ok(true)
    }

    /// Tick until no deferred work is left.
    pub fn run_until_idle(&mut self) -> Result<()> {
        while self.tick()? {}
        Ok(())
    }

    /// Handle timers whose deadline has passed. An expired step timer runs
    /// the step's timeout hook, or finishes the step when there is none.
    pub fn fire_timers(&mut self) -> Result<()> {
        for name in self.timers.take_expired() {
            if name != STEP_TIMER {
                debug!(timer = %name, "Timer expired");
                continue;
            }
            let position = self.engine.position();
            info!(participant = %self.engine.participant_id(), position = %position, "Step timer expired");

            let hook = self
                .engine
                .navigator()
                .step_def(position)
                .and_then(|s| s.on_timeout.clone());
            match hook {
                Some(hook) => {
                    let outcome = self.with_context(position, |ctx| hook(ctx));
                    self.check_hook("timeout hook", position, outcome)?;
                }
                None => match self.engine.done() {
                    Ok(effects) => self.apply(effects)?,
                    Err(e) => warn!(position = %position, error = %e, "Timer expired but step cannot finish"),
                },
            }
        }
        Ok(())
    }

    // ---- effects ----

    fn apply(&mut self, effects: Vec<Effect>) -> Result<()> {
        for effect in effects {
            self.execute(effect)?;
        }
        Ok(())
    }

    fn execute(&mut self, effect: Effect) -> Result<()> {
        match effect {
            Effect::Hook { kind, position } => self.run_hook(kind, position),
            Effect::ClearListeners(scope) => {
                let removed = self.listeners.clear(scope);
                debug!(scope = ?scope, removed, "Cleared listeners");
                Ok(())
            }
            Effect::StartTimer { name, duration } => {
                self.timers.start(name, duration);
                Ok(())
            }
            Effect::StopTimer { name } => {
                if let Err(e) = self.timers.stop(&name) {
                    debug!(timer = %name, error = %e, "Timer not running");
                }
                Ok(())
            }
            Effect::StopTimers => {
                self.timers.stop_all();
                Ok(())
            }
            Effect::PauseTimers => {
                self.timers.pause_all();
                Ok(())
            }
            Effect::ResumeTimers => {
                self.timers.resume_all();
                Ok(())
            }
            Effect::Threshold(change) => self.threshold_changed(change),
            Effect::LoadFrame { frame, position } => {
                match self.presenter.load(&frame, position) {
                    Ok(()) => {
                        let effects = self.engine.frame_loaded()?;
                        self.apply(effects)
                    }
                    Err(e) => Err(self.fail("presenter", position, e)),
                }
            }
            Effect::ExecuteCallback { position } => self.execute_callback(position),
            Effect::Publish(event) => {
                self.publish(event);
                Ok(())
            }
            Effect::Report(report) => {
                if let Err(e) = self.transport.report(&report) {
                    warn!(participant = %report.participant_id, error = %e, "Failed to send progress report");
                    self.publish(Event::error(e.to_string(), Some("transport".to_string())));
                }
                Ok(())
            }
            Effect::Defer(deferred) => {
                self.deferred.push_back(deferred);
                Ok(())
            }
            Effect::ReplayBuffer => self.replay_buffer(),
        }
    }

    fn run_hook(&mut self, kind: HookKind, position: Position) -> Result<()> {
        let navigator = self.engine.navigator();
        let hook = match kind {
            HookKind::PlanInit => navigator.plan().defaults().on_init.clone(),
            HookKind::PlanTeardown => navigator.plan().defaults().on_gameover.clone(),
            HookKind::StageInit => navigator.stage_def(position).and_then(|s| s.init.clone()),
            HookKind::StageExit => navigator.stage_def(position).and_then(|s| s.exit.clone()),
            HookKind::StepInit => navigator.step_def(position).and_then(|s| s.init.clone()),
            HookKind::StepExit => navigator.step_def(position).and_then(|s| s.exit.clone()),
        };
        let Some(hook) = hook else {
            return Ok(());
        };
        debug!(hook = kind.as_str(), position = %position, "Running hook");
        let outcome = self.with_context(position, |ctx| hook(ctx));
        self.check_hook(kind.as_str(), position, outcome)
    }

    fn execute_callback(&mut self, position: Position) -> Result<()> {
        let callback = self
            .engine
            .navigator()
            .step_def(position)
            .map(|s| s.callback.clone());
        let Some(callback) = callback else {
            return Err(self.fail(
                "step callback",
                position,
                HookError::new("no step defined at this position"),
            ));
        };

        match self.with_context(position, |ctx| callback(ctx)) {
            Ok(signal) => {
                let effects = self.engine.callback_finished(signal)?;
                self.apply(effects)
            }
            Err(e) => Err(self.fail("step callback", position, e)),
        }
    }

    fn threshold_changed(&mut self, change: ThresholdChange) -> Result<()> {
        let data = ThresholdData {
            kind: change.kind.as_str().to_string(),
            limit: change.limit,
            participants: change.count,
        };
        let participant_id = self.engine.participant_id().to_string();
        if change.violated {
            warn!(participant = %participant_id, kind = %data.kind, limit = data.limit, count = data.participants, "Participant threshold violated");
            self.publish(Event::ThresholdViolated {
                participant_id,
                threshold: data,
            });
        } else {
            info!(participant = %participant_id, kind = %data.kind, "Participant threshold restored");
            self.publish(Event::ThresholdRestored {
                participant_id,
                threshold: data,
            });
        }

        if let Some(hook) = change.hook {
            let position = self.engine.position();
            let outcome = self.with_context(position, |ctx| hook(ctx));
            self.check_hook("threshold hook", position, outcome)?;
        }
        Ok(())
    }

    fn replay_buffer(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let messages: Vec<DataMessage> = self.buffer.drain(..).collect();
        let position = self.engine.position();
        debug!(count = messages.len(), position = %position, "Replaying buffered messages");

        let handler = self
            .engine
            .navigator()
            .step_def(position)
            .and_then(|s| s.on_resume.clone());
        match handler {
            Some(handler) => {
                let outcome = self.with_context(position, |ctx| handler(ctx, messages));
                self.check_hook("resume handler", position, outcome)
            }
            None => {
                for message in messages {
                    self.publish(message_event(message));
                }
                Ok(())
            }
        }
    }

    /// Listeners run in-line before the event reaches the bus.
    fn publish(&mut self, event: Event) {
        self.listeners.emit(&event);
        self.bus.emit(event);
    }

    fn with_context<T>(&mut self, position: Position, f: impl FnOnce(&mut StepContext<'_>) -> T) -> T {
        let navigator = self.engine.navigator();
        let properties = navigator.inherited_properties(position);
        let stage_id = navigator.stage_id(position).map(str::to_string);
        let step_id = navigator.step_id(position).map(str::to_string);
        let mut ctx = StepContext::new(
            self.engine.participant_id(),
            position,
            stage_id.as_deref(),
            step_id.as_deref(),
            &properties,
            &mut *self.log,
            &mut self.listeners,
        );
        f(&mut ctx)
    }

    fn check_hook(
        &mut self,
        hook: &str,
        position: Position,
        outcome: std::result::Result<(), HookError>,
    ) -> Result<()> {
        outcome.map_err(|e| self.fail(hook, position, e))
    }

    /// Move the engine to its error level and build the error surfaced to
    /// the caller.
    fn fail(&mut self, hook: &str, position: Position, error: HookError) -> OrchestratorError {
        let reason = format!("{hook}: {error}");
        let effects = self.engine.fail(&reason);
        for effect in effects {
            match effect {
                Effect::Publish(event) => self.publish(event),
                Effect::StopTimers => self.timers.stop_all(),
                other => debug!(effect = ?other, "Ignoring effect after failure"),
            }
        }
        OrchestratorError::callback(hook, position, error.0)
    }
}

fn message_event(message: DataMessage) -> Event {
    Event::MessageReceived {
        from: message.from,
        key: message.key,
        payload: message.payload,
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("engine", &self.engine)
            .field("roster", &self.roster.len())
            .field("listeners", &self.listeners)
            .field("buffered", &self.buffer.len())
            .field("deferred", &self.deferred.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::TransportError;
    use crate::context::CallbackSignal;
    use crate::stager::{callback, done_callback, hook, StageDef, Stager, StepDef};
    use cadence_core::{EngineLevel, ProgressLevel};
    use events::ListenerScope;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    fn solo_plan() -> Arc<Plan> {
        let mut stager = Stager::with_seed(5);
        stager
            .add_step(
                StepDef::with_callback(
                    "a1",
                    callback(|ctx| {
                        ctx.record("answer", json!(42));
                        Ok(CallbackSignal::Done)
                    }),
                )
                .with_init(hook(|ctx| {
                    ctx.record("entered", json!(true));
                    Ok(())
                })),
            )
            .unwrap();
        stager.add_step(StepDef::with_callback("a2", done_callback())).unwrap();
        stager.add_stage(StageDef::with_steps("A", ["a1", "a2"])).unwrap();
        stager.repeat("A", 2).unwrap();
        stager.finalize().unwrap()
    }

    /// A step that plays until someone calls `done`.
    fn waiting(id: &str) -> StepDef {
        StepDef::new(id, |_| Ok(CallbackSignal::Continue))
    }

    fn waiting_plan() -> Arc<Plan> {
        let mut stager = Stager::with_seed(5);
        stager.add_step(waiting("w").with_timer(100)).unwrap();
        stager.add_stage(StageDef::with_steps("W", ["w"])).unwrap();
        stager.stage("W").unwrap().gameover().unwrap();
        stager.finalize().unwrap()
    }

    fn session(plan: Arc<Plan>) -> Session {
        Session::new(plan, RuleRegistry::builtin(), &EngineConfig::for_participant("p1"))
    }

    fn record_events(session: &mut Session) -> Arc<Mutex<Vec<Event>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        session
            .listeners_mut()
            .on(ListenerScope::Session, move |e: &Event| sink.lock().unwrap().push(e.clone()));
        seen
    }

    #[test]
    fn test_solo_walk_to_end() {
        let mut session = session(solo_plan());
        let events = record_events(&mut session);

        session.start().unwrap();
        session.run_until_idle().unwrap();

        assert_eq!(session.engine().level(), EngineLevel::Finishing);
        assert_eq!(session.engine().position(), Position::new(1, 2, 2));

        let entered: Vec<Position> = events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                Event::StepEntered { position, .. } => Some(*position),
                _ => None,
            })
            .collect();
        assert_eq!(
            entered,
            vec![
                Position::new(1, 1, 1),
                Position::new(1, 2, 1),
                Position::new(1, 1, 2),
                Position::new(1, 2, 2),
            ]
        );

        let log = session.log();
        assert_eq!(log.at(Position::new(1, 1, 2)).len(), 2);
        assert_eq!(log.latest("answer"), Some(&json!(42)));
        assert!(session.bus().event_count() > 0);
    }

    #[test]
    fn test_step_listeners_cleared_on_exit() {
        let mut stager = Stager::with_seed(1);
        let seen = Arc::new(Mutex::new(0usize));
        let counter = seen.clone();
        stager
            .add_step(StepDef::with_callback(
                "s1",
                callback(move |ctx| {
                    let counter = counter.clone();
                    ctx.on_step(move |_| *counter.lock().unwrap() += 1);
                    Ok(CallbackSignal::Continue)
                }),
            ))
            .unwrap();
        stager.add_step(waiting("s2")).unwrap();
        stager.add_stage(StageDef::with_steps("S", ["s1", "s2"])).unwrap();
        stager.stage("S").unwrap();

        let mut session = session(stager.finalize().unwrap());
        session.start().unwrap();
        assert_eq!(session.listeners_mut().count(ListenerScope::Step), 1);

        session.step().unwrap();
        assert_eq!(session.listeners_mut().count(ListenerScope::Step), 0);
        let before = *seen.lock().unwrap();
        assert!(before > 0);

        session.deliver(DataMessage::new("p2", "chat", json!("hi"))).unwrap();
        assert_eq!(*seen.lock().unwrap(), before);
    }

    #[test]
    fn test_pause_buffers_and_resume_replays() {
        let mut session = session(waiting_plan());
        let events = record_events(&mut session);
        session.start().unwrap();
        session.pause().unwrap();

        session.deliver(DataMessage::new("p2", "bid", json!(3))).unwrap();
        session.deliver(DataMessage::new("p3", "bid", json!(4))).unwrap();
        assert_eq!(session.buffered_messages(), 2);
        let received = |events: &Arc<Mutex<Vec<Event>>>| {
            events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| matches!(e, Event::MessageReceived { .. }))
                .count()
        };
        assert_eq!(received(&events), 0);

        session.resume().unwrap();
        assert_eq!(session.buffered_messages(), 0);
        assert_eq!(received(&events), 2);
    }

    #[test]
    fn test_pause_handlers_and_buffer_commands() {
        let paused_seen = Arc::new(Mutex::new(Vec::new()));
        let replayed = Arc::new(Mutex::new(0usize));
        let paused_sink = paused_seen.clone();
        let replay_sink = replayed.clone();

        let mut stager = Stager::with_seed(1);
        stager
            .add_step(
                waiting("w")
                    .on_pause_message(Arc::new(
                        move |_ctx: &mut StepContext<'_>,
                              message: &DataMessage|
                              -> std::result::Result<(), HookError> {
                            paused_sink.lock().unwrap().push(message.key.clone());
                            Ok(())
                        },
                    ))
                    .on_resume(Arc::new(
                        move |_ctx: &mut StepContext<'_>,
                              messages: Vec<DataMessage>|
                              -> std::result::Result<(), HookError> {
                            *replay_sink.lock().unwrap() += messages.len();
                            Ok(())
                        },
                    )),
            )
            .unwrap();
        stager.add_stage(StageDef::with_steps("W", ["w"])).unwrap();
        stager.stage("W").unwrap();
        let mut session = session(stager.finalize().unwrap());
        session.start().unwrap();
        session.pause().unwrap();

        session.deliver(DataMessage::new("p2", "vote", json!(1))).unwrap();
        assert_eq!(*paused_seen.lock().unwrap(), vec!["vote".to_string()]);
        assert_eq!(session.buffered_messages(), 0);
        session.resume().unwrap();
        assert_eq!(*replayed.lock().unwrap(), 0);

        let mut session = self::session(waiting_plan());
        let events = record_events(&mut session);
        session.start().unwrap();
        session.pause().unwrap();
        session.deliver(DataMessage::new("p2", "a", json!(null))).unwrap();
        session.handle_command(Command::EraseBuffer).unwrap();
        assert_eq!(session.buffered_messages(), 0);
        session.deliver(DataMessage::new("p2", "b", json!(null))).unwrap();
        session.handle_command(Command::ClearBuffer).unwrap();
        let keys: Vec<String> = events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                Event::MessageReceived { key, .. } => Some(key.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(keys, vec!["b".to_string()]);
    }

    #[test]
    fn test_hook_error_is_surfaced() {
        let mut stager = Stager::with_seed(1);
        stager
            .add_step(waiting("s").with_init(hook(|_| Err(HookError::new("database down")))))
            .unwrap();
        stager.add_stage(StageDef::with_steps("S", ["s"])).unwrap();
        stager.stage("S").unwrap();
        let mut session = session(stager.finalize().unwrap());
        let events = record_events(&mut session);

        let err = session.start().unwrap_err();
        assert!(matches!(err, OrchestratorError::Callback { .. }));
        assert_eq!(session.engine().level(), EngineLevel::RuntimeError);
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, Event::Error { .. })));
        assert!(session.step().is_err());
    }

    struct BrokenTransport;

    impl Transport for BrokenTransport {
        fn report(&mut self, _report: &RosterReport) -> std::result::Result<(), TransportError> {
            Err(TransportError::Failed("link down".into()))
        }
    }

    #[test]
    fn test_transport_failure_does_not_stop_session() {
        let mut session = session(solo_plan()).with_transport(BrokenTransport);
        let events = record_events(&mut session);
        session.start().unwrap();
        session.run_until_idle().unwrap();

        assert_eq!(session.engine().level(), EngineLevel::Finishing);
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, Event::Error { context: Some(c), .. } if c == "transport")));
    }

    #[test]
    fn test_own_reports_are_ignored() {
        let mut session = session(waiting_plan());
        session.start().unwrap();
        let own = session.engine().report();
        session.on_report(&own).unwrap();
        assert!(session.roster().is_empty());

        session
            .on_report(&RosterReport::new("p2", Position::new(1, 1, 1), ProgressLevel::Playing))
            .unwrap();
        assert!(session.roster().contains("p2"));
        session.on_leave("p2").unwrap();
        assert!(session.roster().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timer_finishes_step() {
        let mut session = session(waiting_plan());
        session.start().unwrap();
        assert!(session.timers().is_running(STEP_TIMER));

        tokio::time::advance(Duration::from_millis(60)).await;
        session.pause().unwrap();
        tokio::time::advance(Duration::from_millis(200)).await;
        session.fire_timers().unwrap();
        assert_eq!(session.engine().progress(), ProgressLevel::Paused);

        session.resume().unwrap();
        assert_eq!(session.timers().remaining(STEP_TIMER), Some(Duration::from_millis(40)));
        tokio::time::advance(Duration::from_millis(40)).await;
        session.fire_timers().unwrap();
        session.run_until_idle().unwrap();
        assert_eq!(session.engine().level(), EngineLevel::Gameover);
    }

    #[test]
    fn test_stop_discards_pending_work() {
        let mut session = session(solo_plan());
        session.start().unwrap();
        assert!(session.has_deferred());
        session.stop().unwrap();
        assert!(!session.has_deferred());
        assert_eq!(session.engine().level(), EngineLevel::Uninitialized);
        assert_eq!(session.listeners_mut().len(), 0);
    }
}
