//! Passive event polling.
//!
//! Events are always pulled. A listener moves through
//! `Unregistered -> Registered -> Polling -> Unregistered`; each event
//! pulled must be acknowledged before the server can drop it.

use crate::error::{Error, Result};
use crate::objects::RemoteObject;
use crate::progress::deadline_after;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use vboxctl_protocol::{
    ApiRequest, EventInfo, EventPayload, EventType, ObjectRef, MAX_SERVER_WAIT,
};

/// Source of event notifications.
#[derive(Debug, Clone)]
pub struct EventSource {
    obj: RemoteObject,
}

impl EventSource {
    pub(crate) fn new(obj: RemoteObject) -> Self {
        Self { obj }
    }

    pub fn handle(&self) -> ObjectRef {
        self.obj.handle()
    }

    /// Allocate a listener handle.
    pub fn create_listener(&self) -> Result<ObjectRef> {
        self.obj.invoke(ApiRequest::CreateListener {
            this: self.obj.handle(),
        })
    }

    pub fn release(&self) -> Result<()> {
        self.obj.release()
    }
}

/// A pulled event.
#[derive(Debug, Clone)]
pub struct Event {
    info: EventInfo,
    kind: Option<EventType>,
}

impl From<EventInfo> for Event {
    fn from(info: EventInfo) -> Self {
        let kind = EventType::from_tag(&info.event_type);
        if kind.is_none() {
            debug!(tag = %info.event_type, "unrecognized event type");
        }
        Self { info, kind }
    }
}

impl Event {
    /// Server reference of the event.
    pub fn handle(&self) -> ObjectRef {
        self.info.event
    }

    /// Raw type tag, e.g. `OnMachineStateChanged`.
    pub fn type_tag(&self) -> &str {
        &self.info.event_type
    }

    /// Concrete type, if the tag is known.
    pub fn kind(&self) -> Option<EventType> {
        self.kind
    }

    pub fn waitable(&self) -> bool {
        self.info.waitable
    }

    /// Untyped payload.
    pub fn payload(&self) -> &serde_json::Value {
        &self.info.payload
    }

    /// Typed view of the payload.
    ///
    /// `None` when the event is of another type or its payload doesn't have
    /// the expected shape.
    pub fn downcast<T: EventPayload>(&self) -> Option<T> {
        if self.kind != Some(T::TYPE) {
            return None;
        }
        match serde_json::from_value(self.info.payload.clone()) {
            Ok(view) => Some(view),
            Err(e) => {
                warn!(tag = %self.info.event_type, error = %e, "event payload has unexpected shape");
                None
            }
        }
    }
}

/// Listener lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Unregistered,
    Registered,
    Polling,
}

/// A passive listener registered on an event source.
#[derive(Debug)]
pub struct EventPoller {
    source: EventSource,
    listener: ObjectRef,
    state: PollerState,
}

impl EventPoller {
    /// Create a listener on `source` and subscribe it to `categories` in
    /// passive mode.
    pub fn register(source: &EventSource, categories: &[EventType]) -> Result<Self> {
        let listener = source.create_listener()?;
        let registered = source.obj.invoke::<()>(ApiRequest::RegisterListener {
            this: source.handle(),
            listener,
            categories: categories.to_vec(),
            active: false,
        });
        if let Err(e) = registered {
            if let Err(release) = source.obj.child(listener).release() {
                debug!(error = %release, "failed to release unregistered listener");
            }
            return Err(e);
        }

        debug!(listener = %listener, ?categories, "listener registered");
        Ok(Self {
            source: source.clone(),
            listener,
            state: PollerState::Registered,
        })
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    pub fn listener(&self) -> ObjectRef {
        self.listener
    }

    /// Wait up to `timeout` for the next event.
    ///
    /// Returns `None` only once `timeout` has fully elapsed.
    pub fn poll(&mut self, timeout: Duration) -> Result<Option<Event>> {
        if self.state == PollerState::Unregistered {
            return Err(Error::InvalidReference(format!(
                "listener {} is unregistered",
                self.listener
            )));
        }
        self.state = PollerState::Polling;

        let deadline = deadline_after(timeout);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let info: Option<EventInfo> = self.source.obj.invoke(ApiRequest::GetEvent {
                this: self.source.handle(),
                listener: self.listener,
                timeout_ms: remaining.min(MAX_SERVER_WAIT).as_millis() as u64,
            })?;
            if let Some(info) = info {
                return Ok(Some(Event::from(info)));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    /// Tell the server `event` has been handled.
    pub fn acknowledge(&self, event: &Event) -> Result<()> {
        self.source.obj.invoke(ApiRequest::EventProcessed {
            this: self.source.handle(),
            listener: self.listener,
            event: event.handle(),
        })
    }

    /// Remove the listener. Later polls fail.
    pub fn unregister(&mut self) -> Result<()> {
        if self.state == PollerState::Unregistered {
            return Ok(());
        }
        self.state = PollerState::Unregistered;
        self.source.obj.invoke(ApiRequest::UnregisterListener {
            this: self.source.handle(),
            listener: self.listener,
        })
    }
}

impl Drop for EventPoller {
    fn drop(&mut self) {
        if let Err(e) = self.unregister() {
            warn!(listener = %self.listener, error = %e, "failed to unregister listener");
        }
    }
}
