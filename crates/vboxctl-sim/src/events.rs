//! Passive event delivery.
//!
//! Listeners queue references to event objects. An event stays alive from
//! the moment it is queued until the listener acknowledges it or goes away.

use std::collections::{HashMap, HashSet, VecDeque};
use vboxctl_protocol::{EventType, ObjectRef};

/// Upper bound on undelivered events per listener; older events are dropped.
pub(crate) const MAX_PENDING_EVENTS: usize = 500;

/// An event waiting in the server.
#[derive(Debug, Clone)]
pub(crate) struct EventRecord {
    pub event_type: EventType,
    pub waitable: bool,
    pub payload: serde_json::Value,
}

/// Server-side state of one listener.
#[derive(Debug, Default)]
pub(crate) struct ListenerState {
    pub registered: bool,
    pub categories: Vec<EventType>,
    /// Queued, not yet pulled.
    pub queue: VecDeque<ObjectRef>,
    /// Pulled, not yet acknowledged.
    pub delivered: HashSet<ObjectRef>,
}

impl ListenerState {
    pub fn wants(&self, event_type: EventType) -> bool {
        self.registered && self.categories.iter().any(|c| c.matches(event_type))
    }
}

/// Listeners keyed by their reference.
#[derive(Default)]
pub(crate) struct Listeners {
    pub by_ref: HashMap<ObjectRef, ListenerState>,
}

impl Listeners {
    /// Registered listeners.
    pub fn registered(&self) -> usize {
        self.by_ref.values().filter(|l| l.registered).count()
    }

    /// Events queued across all listeners.
    pub fn pending(&self) -> usize {
        self.by_ref.values().map(|l| l.queue.len()).sum()
    }

    /// Events pulled but not acknowledged across all listeners.
    pub fn unacknowledged(&self) -> usize {
        self.by_ref.values().map(|l| l.delivered.len()).sum()
    }

    /// Drop every listener owned by a logon session.
    pub fn remove_owned_by(&mut self, session: u32) {
        self.by_ref.retain(|r, _| r.session() != session);
    }
}
