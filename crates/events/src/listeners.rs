//! Scoped synchronous listeners.
//!
//! A session reacts to its own lifecycle events in-line, before any
//! deferred work runs. Listeners are grouped by the scope that registered
//! them so that leaving a step or stage drops exactly the listeners that
//! belong to it.

use std::fmt;

/// Lifetime of a listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerScope {
    /// Lives until the session stops.
    Session,
    /// Cleared when the current stage is exited.
    Stage,
    /// Cleared when the current step is exited.
    Step,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

pub type Listener<E> = Box<dyn FnMut(&E) + Send>;

struct Registration<E> {
    id: ListenerId,
    scope: ListenerScope,
    listener: Listener<E>,
}

/// Registry of listeners invoked synchronously in registration order.
pub struct ScopedListeners<E> {
    next_id: u64,
    registrations: Vec<Registration<E>>,
}

impl<E> ScopedListeners<E> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            registrations: Vec::new(),
        }
    }

    pub fn on(&mut self, scope: ListenerScope, listener: impl FnMut(&E) + Send + 'static) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.registrations.push(Registration {
            id,
            scope,
            listener: Box::new(listener),
        });
        id
    }

    /// Remove a single listener. Returns false if it was already gone.
    pub fn off(&mut self, id: ListenerId) -> bool {
        let before = self.registrations.len();
        self.registrations.retain(|r| r.id != id);
        before != self.registrations.len()
    }

    /// Invoke every listener with the event. Returns how many ran.
    pub fn emit(&mut self, event: &E) -> usize {
        for registration in self.registrations.iter_mut() {
            (registration.listener)(event);
        }
        self.registrations.len()
    }

    /// Drop all listeners of a scope. Returns how many were removed.
    pub fn clear(&mut self, scope: ListenerScope) -> usize {
        let before = self.registrations.len();
        self.registrations.retain(|r| r.scope != scope);
        before - self.registrations.len()
    }

    pub fn clear_all(&mut self) {
        self.registrations.clear();
    }

    pub fn count(&self, scope: ListenerScope) -> usize {
        self.registrations.iter().filter(|r| r.scope == scope).count()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

impl<E> Default for ScopedListeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for ScopedListeners<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedListeners")
            .field("session", &self.count(ListenerScope::Session))
            .field("stage", &self.count(ListenerScope::Stage))
            .field("step", &self.count(ListenerScope::Step))
            .finish()
    }
}
