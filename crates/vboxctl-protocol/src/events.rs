//! Event wire format.
//!
//! Events travel as a type tag plus an untyped payload. Typed views are
//! recovered with [`EventPayload`] after checking the tag, so an unknown or
//! mismatched tag never yields a misread payload.

use crate::types::{MachineState, SessionState};
use crate::ObjectRef;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Event types and categories.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Category: every event.
    Any,
    /// Category: every machine-scoped event.
    MachineEvent,
    MachineStateChanged,
    MachineDataChanged,
    MachineRegistered,
    SessionStateChanged,
    GuestPropertyChanged,
}

impl EventType {
    /// Concrete (non-category) event types.
    pub const CONCRETE: [EventType; 5] = [
        EventType::MachineStateChanged,
        EventType::MachineDataChanged,
        EventType::MachineRegistered,
        EventType::SessionStateChanged,
        EventType::GuestPropertyChanged,
    ];

    /// Wire tag of the type.
    pub fn tag(&self) -> &'static str {
        match self {
            EventType::Any => "Any",
            EventType::MachineEvent => "MachineEvent",
            EventType::MachineStateChanged => "OnMachineStateChanged",
            EventType::MachineDataChanged => "OnMachineDataChanged",
            EventType::MachineRegistered => "OnMachineRegistered",
            EventType::SessionStateChanged => "OnSessionStateChanged",
            EventType::GuestPropertyChanged => "OnGuestPropertyChanged",
        }
    }

    /// Parse a wire tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        [EventType::Any, EventType::MachineEvent]
            .into_iter()
            .chain(Self::CONCRETE)
            .find(|t| t.tag() == tag)
    }

    /// Returns true for category types that match several concrete types.
    pub fn is_category(&self) -> bool {
        matches!(self, EventType::Any | EventType::MachineEvent)
    }

    /// Returns true if a subscription to `self` receives events of `concrete`.
    pub fn matches(&self, concrete: EventType) -> bool {
        match self {
            EventType::Any => true,
            EventType::MachineEvent => matches!(
                concrete,
                EventType::MachineStateChanged
                    | EventType::MachineDataChanged
                    | EventType::MachineRegistered
                    | EventType::SessionStateChanged
                    | EventType::GuestPropertyChanged
            ),
            other => *other == concrete,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// An event as returned by `get_event`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventInfo {
    /// Reference to acknowledge the event with.
    pub event: ObjectRef,
    /// Wire tag; may name a type this client does not know.
    pub event_type: String,
    /// Whether the server waits for an acknowledgement.
    pub waitable: bool,
    /// Type-specific fields.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Typed payload of one concrete event type.
pub trait EventPayload: Serialize + DeserializeOwned {
    /// Event type this payload belongs to.
    const TYPE: EventType;
}

/// Machine execution state changed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineStateChangedEvent {
    pub machine_id: String,
    pub state: MachineState,
}

impl EventPayload for MachineStateChangedEvent {
    const TYPE: EventType = EventType::MachineStateChanged;
}

/// Machine settings changed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineDataChangedEvent {
    pub machine_id: String,
    pub temporary: bool,
}

impl EventPayload for MachineDataChangedEvent {
    const TYPE: EventType = EventType::MachineDataChanged;
}

/// Machine registered or unregistered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineRegisteredEvent {
    pub machine_id: String,
    pub registered: bool,
}

impl EventPayload for MachineRegisteredEvent {
    const TYPE: EventType = EventType::MachineRegistered;
}

/// Machine lock state changed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionStateChangedEvent {
    pub machine_id: String,
    pub state: SessionState,
}

impl EventPayload for SessionStateChangedEvent {
    const TYPE: EventType = EventType::SessionStateChanged;
}

/// Guest property written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuestPropertyChangedEvent {
    pub machine_id: String,
    pub name: String,
    pub value: String,
    pub flags: String,
}

impl EventPayload for GuestPropertyChangedEvent {
    const TYPE: EventType = EventType::GuestPropertyChanged;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_roundtrip() {
        for t in [EventType::Any, EventType::MachineEvent].into_iter().chain(EventType::CONCRETE) {
            assert_eq!(EventType::from_tag(t.tag()), Some(t));
        }
        assert_eq!(EventType::from_tag("OnSomethingNew"), None);
    }

    #[test]
    fn test_category_matching() {
        assert!(EventType::Any.matches(EventType::GuestPropertyChanged));
        assert!(EventType::MachineEvent.matches(EventType::MachineStateChanged));
        assert!(EventType::MachineStateChanged.matches(EventType::MachineStateChanged));
        assert!(!EventType::MachineStateChanged.matches(EventType::SessionStateChanged));
        assert!(EventType::Any.is_category());
        assert!(!EventType::MachineRegistered.is_category());
    }
}
