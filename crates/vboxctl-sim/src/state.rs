//! Platform state and request dispatch.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use vboxctl_protocol::codes::{
    E_ACCESSDENIED, E_FAIL, E_INVALIDARG, E_POINTER, VBOX_E_INVALID_OBJECT_STATE,
    VBOX_E_INVALID_SESSION_STATE, VBOX_E_INVALID_VM_STATE, VBOX_E_OBJECT_NOT_FOUND,
};
use vboxctl_protocol::events::{
    GuestPropertyChangedEvent, MachineStateChangedEvent, SessionStateChangedEvent,
};
use vboxctl_protocol::{
    ApiRequest, ApiResponse, ErrorInfo, EventInfo, EventPayload, EventType, LockType, LogChunk,
    MachineState, ObjectRef, ProgressState, SessionState, VersionInfo,
};

use crate::events::{EventRecord, ListenerState, Listeners, MAX_PENDING_EVENTS};
use crate::machine::SimMachine;
use crate::perf::{any_matches, Collector, SampleContext, Target, METRICS};
use crate::table::ObjectTable;
use crate::{SimConfig, SimStats};

/// Largest chunk `read_log` hands out.
const MAX_LOG_READ: u64 = 32 * 1024 * 1024;

/// Session types accepted by `launch_vm_process`.
const LAUNCH_KINDS: &[&str] = &["gui", "headless", "sdl", "separate"];

/// Interface a fault is raised from.
#[derive(Clone, Copy)]
struct Iface {
    component: &'static str,
    name: &'static str,
    iid: &'static str,
}

const VIRTUALBOX: Iface = Iface {
    component: "VirtualBoxWrap",
    name: "IVirtualBox",
    iid: "d0a0163f-e254-4e5b-a1f2-011cf991c38d",
};
const HOST: Iface = Iface {
    component: "HostWrap",
    name: "IHost",
    iid: "afcd7e2f-b8bb-4b8a-a7ac-ac7b25ec2a6a",
};
const MACHINE: Iface = Iface {
    component: "MachineWrap",
    name: "IMachine",
    iid: "300763af-5d6b-46e6-aa96-273eac15538a",
};
const SESSION: Iface = Iface {
    component: "SessionWrap",
    name: "ISession",
    iid: "c0447716-ff5a-4795-b57a-ecd5fffa18a4",
};
const CONSOLE: Iface = Iface {
    component: "ConsoleWrap",
    name: "IConsole",
    iid: "6ac83d89-6ee7-4e33-8ae6-b257b2e81be8",
};
const PROGRESS: Iface = Iface {
    component: "ProgressWrap",
    name: "IProgress",
    iid: "d7b98d2b-30e8-447e-99cb-e31becae6ae4",
};
const EVENT_SOURCE: Iface = Iface {
    component: "EventSourceWrap",
    name: "IEventSource",
    iid: "9b6e1aee-35f3-4f4d-b5bb-ed0ecefd8538",
};
const PERF: Iface = Iface {
    component: "PerformanceCollectorWrap",
    name: "IPerformanceCollector",
    iid: "b14290ad-cd54-400c-b858-797bcb82570e",
};
const MANAGED_REF: Iface = Iface {
    component: "ManagedObjectRef",
    name: "IManagedObjectRef",
    iid: "00000000-0000-0000-0000-000000000000",
};

/// A failed call.
pub(crate) struct Fault {
    code: u32,
    iface: Iface,
    message: String,
}

impl Fault {
    fn new(code: u32, iface: Iface, message: impl Into<String>) -> Self {
        Self {
            code,
            iface,
            message: message.into(),
        }
    }

    fn invalid_ref(r: ObjectRef) -> Self {
        Self::new(E_POINTER, MANAGED_REF, format!("Invalid managed object reference \"{}\"", r))
    }

    fn wrong_kind(r: ObjectRef, want: Iface, got: &Managed) -> Self {
        Self::new(
            E_INVALIDARG,
            want,
            format!("Object \"{}\" is a {}, not an {}", r, got.kind(), want.name),
        )
    }

    pub fn into_response(self) -> ApiResponse {
        ApiResponse::Fault {
            error_chain: vec![ErrorInfo {
                result_code: self.code,
                text: self.message.clone(),
                component: self.iface.component.to_string(),
                interface_id: self.iface.iid.to_string(),
            }],
            message: self.message,
            result_code: self.code,
        }
    }
}

type Reply = Result<ApiResponse, Fault>;

/// Object held in the table.
pub(crate) enum Managed {
    Root,
    Host,
    Machine(usize),
    Session(Option<(usize, LockType)>),
    Progress(SimProgress),
    EventSource,
    Listener,
    Event(EventRecord),
    Collector,
}

impl Managed {
    fn kind(&self) -> &'static str {
        match self {
            Managed::Root => "IVirtualBox",
            Managed::Host => "IHost",
            Managed::Machine(_) => "IMachine",
            Managed::Session(_) => "ISession",
            Managed::Progress(_) => "IProgress",
            Managed::EventSource => "IEventSource",
            Managed::Listener => "IEventListener",
            Managed::Event(_) => "IEvent",
            Managed::Collector => "IPerformanceCollector",
        }
    }
}

/// Machine transition applied when a progress completes.
#[derive(Debug, Clone)]
enum Completion {
    Launched { machine: usize, kind: String },
    LaunchFailed { machine: usize },
    PoweredDown { machine: usize },
}

/// A long-running operation.
pub(crate) struct SimProgress {
    description: String,
    started: Instant,
    duration: Duration,
    completed: bool,
    result_code: u32,
    failure: Option<String>,
    error: Vec<ErrorInfo>,
    on_complete: Option<Completion>,
}

impl SimProgress {
    fn new(description: &str, duration: Duration, on_complete: Completion, failure: Option<String>) -> Self {
        Self {
            description: description.to_string(),
            started: Instant::now(),
            duration,
            completed: false,
            result_code: 0,
            failure,
            error: Vec::new(),
            on_complete: Some(on_complete),
        }
    }

    /// Complete the operation if it is due, returning its transition.
    fn poll(&mut self, now: Instant) -> Option<Completion> {
        if self.completed || now < self.started + self.duration {
            return None;
        }
        self.completed = true;
        if let Some(message) = self.failure.take() {
            self.result_code = E_FAIL;
            self.error.push(ErrorInfo {
                result_code: E_FAIL,
                text: message,
                component: CONSOLE.component.to_string(),
                interface_id: CONSOLE.iid.to_string(),
            });
        }
        self.on_complete.take()
    }

    fn state(&self, now: Instant) -> ProgressState {
        let percent = if self.completed {
            100
        } else if self.duration.is_zero() {
            99
        } else {
            let elapsed = now.saturating_duration_since(self.started).as_millis();
            ((elapsed * 100) / self.duration.as_millis()).min(99) as u32
        };
        ProgressState {
            description: self.description.clone(),
            completed: self.completed,
            percent,
            result_code: self.result_code,
            cancelable: false,
            error: self.error.clone(),
        }
    }
}

#[derive(Default)]
struct Counters {
    logons: u64,
    logoffs: u64,
    launches: u64,
    unlocks: u64,
}

/// Complete platform state, guarded by the platform mutex.
pub(crate) struct State {
    config: SimConfig,
    objects: ObjectTable<Managed>,
    machines: Vec<SimMachine>,
    listeners: Listeners,
    outbox: Vec<(EventType, serde_json::Value)>,
    collector: Collector,
    /// Host and machine references minted for metric results, per session.
    target_refs: HashMap<(u32, Target), ObjectRef>,
    sessions: HashSet<u32>,
    next_session: u32,
    counters: Counters,
}

impl State {
    pub fn new(config: SimConfig) -> Self {
        let machines = config
            .machines
            .iter()
            .cloned()
            .map(|spec| SimMachine::new(spec, &config.version.version))
            .collect();
        Self {
            config,
            objects: ObjectTable::new(),
            machines,
            listeners: Listeners::default(),
            outbox: Vec::new(),
            collector: Collector::new(),
            target_refs: HashMap::new(),
            sessions: HashSet::new(),
            next_session: 1,
            counters: Counters::default(),
        }
    }

    pub fn version(&self) -> &VersionInfo {
        &self.config.version
    }

    pub fn stats(&self) -> SimStats {
        SimStats {
            logons: self.counters.logons,
            logoffs: self.counters.logoffs,
            launches: self.counters.launches,
            unlocks: self.counters.unlocks,
            active_sessions: self.sessions.len(),
            live_objects: self.objects.len(),
            registered_listeners: self.listeners.registered(),
            pending_events: self.listeners.pending(),
            unacknowledged_events: self.listeners.unacknowledged(),
        }
    }

    pub fn machine_by_name(&self, name: &str) -> Option<&SimMachine> {
        self.machines.iter().find(|m| m.spec.name == name)
    }

    // ========================================================================
    // Time
    // ========================================================================

    /// Apply everything that became due by `now`.
    pub fn advance(&mut self, now: Instant) {
        let mut finished = Vec::new();
        for (_, object) in self.objects.iter_mut() {
            if let Managed::Progress(p) = object {
                if let Some(c) = p.poll(now) {
                    finished.push(c);
                }
            }
        }
        for completion in finished {
            self.complete(completion);
        }

        for slot in self.collector.slots.iter_mut() {
            let ctx = sample_context(&self.config, &self.machines, slot.target);
            slot.advance(now, &ctx);
        }

        self.deliver();
    }

    fn complete(&mut self, completion: Completion) {
        debug!(?completion, "operation completed");
        match completion {
            Completion::Launched { machine, kind } => {
                let m = &mut self.machines[machine];
                m.state = MachineState::Running;
                m.session_state = SessionState::Locked;
                m.log(0, &format!("VM process started (session type '{}')", kind));
                m.log(0, "Guest Additions: guest reached run level 3");
                let (id, os) = (m.id.clone(), m.spec.os_type_id.clone());
                self.post_machine_state(machine);
                self.post_session_state(machine);
                self.post(GuestPropertyChangedEvent {
                    machine_id: id,
                    name: "/VirtualBox/GuestInfo/OS/Product".to_string(),
                    value: os,
                    flags: "TRANSIENT, RDONLYGUEST".to_string(),
                });
            }
            Completion::LaunchFailed { machine } => {
                let m = &mut self.machines[machine];
                m.state = MachineState::PoweredOff;
                m.session_state = SessionState::Unlocked;
                m.log(0, "VM process failed to start");
                self.post_machine_state(machine);
                self.post_session_state(machine);
            }
            Completion::PoweredDown { machine } => {
                let m = &mut self.machines[machine];
                m.state = MachineState::PoweredOff;
                m.session_state = SessionState::Unlocked;
                m.log(0, "Changing the VM state from 'STOPPING' to 'OFF'");
                self.post_machine_state(machine);
                self.post_session_state(machine);
            }
        }
    }

    // ========================================================================
    // Events
    // ========================================================================

    fn post<P: EventPayload>(&mut self, payload: P) {
        match serde_json::to_value(&payload) {
            Ok(value) => self.outbox.push((P::TYPE, value)),
            Err(e) => warn!(error = %e, event = %P::TYPE, "failed to encode event payload"),
        }
    }

    fn post_machine_state(&mut self, machine: usize) {
        let m = &self.machines[machine];
        let event = MachineStateChangedEvent {
            machine_id: m.id.clone(),
            state: m.state,
        };
        self.post(event);
    }

    fn post_session_state(&mut self, machine: usize) {
        let m = &self.machines[machine];
        let event = SessionStateChangedEvent {
            machine_id: m.id.clone(),
            state: m.session_state,
        };
        self.post(event);
    }

    /// Fan posted events out to listener queues.
    fn deliver(&mut self) {
        let outbox = std::mem::take(&mut self.outbox);
        for (event_type, payload) in outbox {
            for (listener, state) in self.listeners.by_ref.iter_mut() {
                if !state.wants(event_type) {
                    continue;
                }
                let event = self.objects.insert(
                    listener.session(),
                    Managed::Event(EventRecord {
                        event_type,
                        waitable: true,
                        payload: payload.clone(),
                    }),
                );
                state.queue.push_back(event);
                if state.queue.len() > MAX_PENDING_EVENTS {
                    if let Some(dropped) = state.queue.pop_front() {
                        warn!(listener = %listener, "listener queue full, dropping oldest event");
                        self.objects.remove(dropped);
                    }
                }
            }
        }
    }

    /// Pull the next queued event of a listener without blocking.
    pub fn pull_event(&mut self, this: ObjectRef, listener: ObjectRef) -> Result<Option<EventInfo>, Fault> {
        self.expect_event_source(this)?;
        let state = self.listener_state(listener)?;
        if !state.registered {
            return Err(Fault::new(
                VBOX_E_INVALID_OBJECT_STATE,
                EVENT_SOURCE,
                "Listener was never registered",
            ));
        }
        let Some(event) = state.queue.pop_front() else {
            return Ok(None);
        };
        state.delivered.insert(event);

        match self.objects.get(event) {
            Some(Managed::Event(record)) => Ok(Some(EventInfo {
                event,
                event_type: record.event_type.tag().to_string(),
                waitable: record.waitable,
                payload: record.payload.clone(),
            })),
            _ => Err(Fault::invalid_ref(event)),
        }
    }

    // ========================================================================
    // Object resolution
    // ========================================================================

    fn object(&self, r: ObjectRef) -> Result<&Managed, Fault> {
        self.objects.get(r).ok_or_else(|| Fault::invalid_ref(r))
    }

    fn expect_root(&self, r: ObjectRef) -> Result<(), Fault> {
        match self.object(r)? {
            Managed::Root => Ok(()),
            other => Err(Fault::wrong_kind(r, VIRTUALBOX, other)),
        }
    }

    fn expect_machine(&self, r: ObjectRef) -> Result<usize, Fault> {
        match self.object(r)? {
            Managed::Machine(m) => Ok(*m),
            other => Err(Fault::wrong_kind(r, MACHINE, other)),
        }
    }

    fn expect_event_source(&self, r: ObjectRef) -> Result<(), Fault> {
        match self.object(r)? {
            Managed::EventSource => Ok(()),
            other => Err(Fault::wrong_kind(r, EVENT_SOURCE, other)),
        }
    }

    fn session_lock(&self, r: ObjectRef) -> Result<Option<(usize, LockType)>, Fault> {
        match self.object(r)? {
            Managed::Session(lock) => Ok(*lock),
            other => Err(Fault::wrong_kind(r, SESSION, other)),
        }
    }

    fn set_session_lock(&mut self, r: ObjectRef, lock: Option<(usize, LockType)>) {
        if let Some(Managed::Session(l)) = self.objects.get_mut(r) {
            *l = lock;
        }
    }

    fn progress(&self, r: ObjectRef) -> Result<&SimProgress, Fault> {
        match self.object(r)? {
            Managed::Progress(p) => Ok(p),
            other => Err(Fault::wrong_kind(r, PROGRESS, other)),
        }
    }

    /// Returns true once the progress object has completed.
    pub fn progress_completed(&self, r: ObjectRef) -> Result<bool, Fault> {
        Ok(self.progress(r)?.completed)
    }

    fn listener_state(&mut self, r: ObjectRef) -> Result<&mut ListenerState, Fault> {
        match self.object(r)? {
            Managed::Listener => {}
            other => return Err(Fault::wrong_kind(r, EVENT_SOURCE, other)),
        }
        self.listeners
            .by_ref
            .get_mut(&r)
            .ok_or_else(|| Fault::invalid_ref(r))
    }

    fn expect_collector(&self, r: ObjectRef) -> Result<(), Fault> {
        match self.object(r)? {
            Managed::Collector => Ok(()),
            other => Err(Fault::wrong_kind(r, PERF, other)),
        }
    }

    fn target_of(&self, r: ObjectRef) -> Result<Target, Fault> {
        match self.object(r)? {
            Managed::Host => Ok(Target::Host),
            Managed::Machine(m) => Ok(Target::Machine(*m)),
            other => Err(Fault::new(
                E_INVALIDARG,
                PERF,
                format!("Object \"{}\" ({}) has no performance metrics", r, other.kind()),
            )),
        }
    }

    fn targets_of(&self, objects: &[ObjectRef]) -> Result<Vec<Target>, Fault> {
        objects.iter().map(|r| self.target_of(*r)).collect()
    }

    fn remove_listener(&mut self, listener: ObjectRef) {
        if let Some(state) = self.listeners.by_ref.remove(&listener) {
            for event in state.queue.iter().chain(state.delivered.iter()) {
                self.objects.remove(*event);
            }
        }
        self.objects.remove(listener);
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Handle a non-blocking request.
    pub fn dispatch(&mut self, request: ApiRequest) -> ApiResponse {
        let method = request.method();
        match self.dispatch_inner(request) {
            Ok(response) => response,
            Err(fault) => {
                debug!(method, code = fault.code, message = %fault.message, "call failed");
                fault.into_response()
            }
        }
    }

    fn dispatch_inner(&mut self, request: ApiRequest) -> Reply {
        match request {
            ApiRequest::Logon { username, password } => self.logon(&username, &password),
            ApiRequest::Logoff { this } => self.logoff(this),

            ApiRequest::GetVersion { this } => {
                self.expect_root(this)?;
                Ok(ApiResponse::ok(&self.config.version))
            }

            ApiRequest::GetHost { this } => {
                self.expect_root(this)?;
                Ok(ApiResponse::ok(self.objects.insert(this.session(), Managed::Host)))
            }

            ApiRequest::GetHostInfo { this } => match self.object(this)? {
                Managed::Host => Ok(ApiResponse::ok(&self.config.host)),
                other => Err(Fault::wrong_kind(this, HOST, other)),
            },

            ApiRequest::GetMachines { this } => {
                self.expect_root(this)?;
                let refs: Vec<ObjectRef> = (0..self.machines.len())
                    .map(|m| self.objects.insert(this.session(), Managed::Machine(m)))
                    .collect();
                Ok(ApiResponse::ok(refs))
            }

            ApiRequest::GetMachine { this, id } => {
                self.expect_root(this)?;
                let wanted = id.trim_matches(|c| c == '{' || c == '}').to_ascii_lowercase();
                let m = self
                    .machines
                    .iter()
                    .position(|m| m.id == wanted)
                    .ok_or_else(|| {
                        Fault::new(
                            VBOX_E_OBJECT_NOT_FOUND,
                            VIRTUALBOX,
                            format!("Could not find a registered machine with UUID {{{}}}", id),
                        )
                    })?;
                Ok(ApiResponse::ok(self.objects.insert(this.session(), Managed::Machine(m))))
            }

            ApiRequest::FindMachine { this, name } => {
                self.expect_root(this)?;
                let m = self
                    .machines
                    .iter()
                    .position(|m| m.spec.accessible && m.spec.name == name)
                    .ok_or_else(|| {
                        Fault::new(
                            VBOX_E_OBJECT_NOT_FOUND,
                            VIRTUALBOX,
                            format!("Could not find a registered machine named '{}'", name),
                        )
                    })?;
                Ok(ApiResponse::ok(self.objects.insert(this.session(), Managed::Machine(m))))
            }

            ApiRequest::GetMachineInfo { this } => {
                let m = self.expect_machine(this)?;
                Ok(ApiResponse::ok(self.machines[m].info()))
            }

            ApiRequest::ReadLog {
                this,
                index,
                offset,
                size,
            } => {
                let m = self.expect_machine(this)?;
                let log = self.machines[m].logs.get(index as usize).ok_or_else(|| {
                    Fault::new(E_INVALIDARG, MACHINE, format!("Invalid log file index {}", index))
                })?;
                let start = offset.min(log.len() as u64) as usize;
                let end = (offset.saturating_add(size.min(MAX_LOG_READ))).min(log.len() as u64) as usize;
                Ok(ApiResponse::ok(LogChunk {
                    data: log[start..end].to_vec(),
                }))
            }

            ApiRequest::QueryLogFilename { this, index } => {
                let m = self.expect_machine(this)?;
                if index as usize >= self.machines[m].logs.len() {
                    return Err(Fault::new(
                        E_INVALIDARG,
                        MACHINE,
                        format!("Invalid log file index {}", index),
                    ));
                }
                let name = if index == 0 {
                    "VBox.log".to_string()
                } else {
                    format!("VBox.log.{}", index)
                };
                Ok(ApiResponse::ok(name))
            }

            ApiRequest::GetSessionObject { this } => {
                self.expect_root(this)?;
                Ok(ApiResponse::ok(self.objects.insert(this.session(), Managed::Session(None))))
            }

            ApiRequest::LockMachine {
                this,
                session,
                lock_type,
            } => self.lock_machine(this, session, lock_type),

            ApiRequest::LaunchVmProcess {
                this,
                session,
                kind,
            } => self.launch(this, session, &kind),

            ApiRequest::UnlockMachine { this } => self.unlock(this),
            ApiRequest::PowerDown { this } => self.power_down(this),

            ApiRequest::GetProgressState { this } => {
                Ok(ApiResponse::ok(self.progress(this)?.state(Instant::now())))
            }

            ApiRequest::WaitForCompletion { this, .. } => {
                self.progress(this)?;
                Ok(ApiResponse::empty())
            }

            ApiRequest::GetEventSource { this } => {
                self.expect_root(this)?;
                Ok(ApiResponse::ok(self.objects.insert(this.session(), Managed::EventSource)))
            }

            ApiRequest::CreateListener { this } => {
                self.expect_event_source(this)?;
                let listener = self.objects.insert(this.session(), Managed::Listener);
                self.listeners
                    .by_ref
                    .insert(listener, ListenerState::default());
                Ok(ApiResponse::ok(listener))
            }

            ApiRequest::RegisterListener {
                this,
                listener,
                categories,
                active,
            } => {
                self.expect_event_source(this)?;
                if active {
                    return Err(Fault::new(
                        E_INVALIDARG,
                        EVENT_SOURCE,
                        "Active listeners are not supported by this binding, use passive mode",
                    ));
                }
                if categories.is_empty() {
                    return Err(Fault::new(E_INVALIDARG, EVENT_SOURCE, "No event types given"));
                }
                let state = self.listener_state(listener)?;
                if state.registered {
                    return Err(Fault::new(
                        VBOX_E_INVALID_OBJECT_STATE,
                        EVENT_SOURCE,
                        "Listener already registered",
                    ));
                }
                state.registered = true;
                state.categories = categories;
                Ok(ApiResponse::empty())
            }

            ApiRequest::GetEvent { this, listener, .. } => {
                Ok(ApiResponse::ok(self.pull_event(this, listener)?))
            }

            ApiRequest::EventProcessed {
                this,
                listener,
                event,
            } => {
                self.expect_event_source(this)?;
                let state = self.listener_state(listener)?;
                if !state.delivered.remove(&event) {
                    return Err(Fault::new(
                        E_INVALIDARG,
                        EVENT_SOURCE,
                        format!("Event \"{}\" was not delivered to this listener", event),
                    ));
                }
                self.objects.remove(event);
                Ok(ApiResponse::empty())
            }

            ApiRequest::UnregisterListener { this, listener } => {
                self.expect_event_source(this)?;
                self.listener_state(listener)?;
                self.remove_listener(listener);
                Ok(ApiResponse::empty())
            }

            ApiRequest::GetPerformanceCollector { this } => {
                self.expect_root(this)?;
                Ok(ApiResponse::ok(
                    self.objects.insert(this.session(), Managed::Collector),
                ))
            }

            ApiRequest::SetupMetrics {
                this,
                names,
                objects,
                period,
                count,
            } => self.setup_metrics(this, names, objects, period, count),

            ApiRequest::EnableMetrics {
                this,
                names,
                objects,
            } => self.toggle_metrics(this, &names, &objects, true),

            ApiRequest::DisableMetrics {
                this,
                names,
                objects,
            } => self.toggle_metrics(this, &names, &objects, false),

            ApiRequest::GetMetrics {
                this,
                names,
                objects,
            } => {
                self.expect_collector(this)?;
                let targets = self.targets_of(&objects)?;
                let session = this.session();
                let (table, cache) = (&mut self.objects, &mut self.target_refs);
                let descriptors: Vec<_> = self
                    .collector
                    .matching(&names, &targets)
                    .map(|s| s.descriptor(target_ref(table, cache, session, s.target)))
                    .collect();
                Ok(ApiResponse::ok(descriptors))
            }

            ApiRequest::QueryMetricsData {
                this,
                names,
                objects,
            } => {
                self.expect_collector(this)?;
                let targets = self.targets_of(&objects)?;
                let session = this.session();
                let (table, cache) = (&mut self.objects, &mut self.target_refs);
                let data = self
                    .collector
                    .query(&names, &targets, |t| target_ref(table, cache, session, t));
                Ok(ApiResponse::ok(data))
            }

            ApiRequest::Release { this } => {
                let is_listener = match self.object(this)? {
                    Managed::Root => {
                        return Err(Fault::new(
                            E_INVALIDARG,
                            VIRTUALBOX,
                            "The root object is released by logoff",
                        ))
                    }
                    Managed::Listener => true,
                    _ => false,
                };
                if is_listener {
                    self.remove_listener(this);
                } else {
                    self.objects.remove(this);
                }
                Ok(ApiResponse::empty())
            }
        }
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    fn logon(&mut self, username: &str, password: &str) -> Reply {
        if let Some((user, pass)) = &self.config.credentials {
            if user != username || pass != password {
                warn!(user = %username, "logon rejected");
                return Err(Fault::new(
                    E_ACCESSDENIED,
                    VIRTUALBOX,
                    "The specified user was not able to logon",
                ));
            }
        }

        let session = self.next_session;
        self.next_session = self.next_session.checked_add(1).unwrap_or(1);
        self.sessions.insert(session);
        self.counters.logons += 1;

        let root = self.objects.insert(session, Managed::Root);
        info!(session, user = %username, "logon");
        Ok(ApiResponse::ok(root))
    }

    fn logoff(&mut self, this: ObjectRef) -> Reply {
        self.expect_root(this)?;
        let session = this.session();

        // Write locks held by the departing session fall back to the machines.
        let mut released = Vec::new();
        for (r, object) in self.objects.iter_mut() {
            if r.session() != session {
                continue;
            }
            if let Managed::Session(Some((m, LockType::Write))) = object {
                released.push(*m);
            }
        }
        for m in released {
            if self.machines[m].session_state == SessionState::Locked && !self.machines[m].state.is_online() {
                self.machines[m].session_state = SessionState::Unlocked;
                self.post_session_state(m);
            }
        }

        self.listeners.remove_owned_by(session);
        self.target_refs.retain(|(owner, _), _| *owner != session);
        let freed = self.objects.remove_owned_by(session);
        self.sessions.remove(&session);
        self.counters.logoffs += 1;
        info!(session, freed, "logoff");
        Ok(ApiResponse::empty())
    }

    fn lock_machine(&mut self, this: ObjectRef, session: ObjectRef, lock_type: LockType) -> Reply {
        let m = self.expect_machine(this)?;
        if self.session_lock(session)?.is_some() {
            return Err(Fault::new(
                VBOX_E_INVALID_SESSION_STATE,
                SESSION,
                "The given session is busy",
            ));
        }

        let machine = &self.machines[m];
        if !machine.spec.accessible {
            return Err(Fault::new(
                VBOX_E_INVALID_OBJECT_STATE,
                MACHINE,
                "The machine is not accessible",
            ));
        }
        if lock_type == LockType::Write && machine.session_state != SessionState::Unlocked {
            return Err(Fault::new(
                VBOX_E_INVALID_OBJECT_STATE,
                MACHINE,
                format!(
                    "The machine '{}' is already locked for a session (or being unlocked)",
                    machine.spec.name
                ),
            ));
        }

        self.set_session_lock(session, Some((m, lock_type)));
        if lock_type == LockType::Write {
            self.machines[m].session_state = SessionState::Locked;
            self.post_session_state(m);
        }
        Ok(ApiResponse::empty())
    }

    fn launch(&mut self, this: ObjectRef, session: ObjectRef, kind: &str) -> Reply {
        let m = self.expect_machine(this)?;
        if self.session_lock(session)?.is_some() {
            return Err(Fault::new(
                VBOX_E_INVALID_SESSION_STATE,
                SESSION,
                "The given session is busy",
            ));
        }

        let kind = if kind.is_empty() { "gui" } else { kind };
        if !LAUNCH_KINDS.contains(&kind) {
            return Err(Fault::new(
                E_INVALIDARG,
                MACHINE,
                format!("Invalid session type: '{}'", kind),
            ));
        }

        let machine = &self.machines[m];
        if !machine.spec.accessible {
            return Err(Fault::new(
                VBOX_E_INVALID_OBJECT_STATE,
                MACHINE,
                "The machine is not accessible",
            ));
        }
        if machine.state.is_online() || machine.session_state != SessionState::Unlocked {
            return Err(Fault::new(
                VBOX_E_INVALID_OBJECT_STATE,
                MACHINE,
                format!(
                    "The machine '{}' is already locked by a session (or being locked or unlocked)",
                    machine.spec.name
                ),
            ));
        }
        let failure = machine.spec.launch_error.clone();

        self.set_session_lock(session, Some((m, LockType::Write)));
        let machine = &mut self.machines[m];
        machine.state = MachineState::Starting;
        machine.session_state = SessionState::Spawning;
        machine.log(0, &format!("Launching VM process (session type '{}')", kind));
        self.post_machine_state(m);
        self.post_session_state(m);
        self.counters.launches += 1;

        let completion = if failure.is_some() {
            Completion::LaunchFailed { machine: m }
        } else {
            Completion::Launched {
                machine: m,
                kind: kind.to_string(),
            }
        };
        let progress = SimProgress::new(
            "Starting virtual machine",
            self.config.launch_duration,
            completion,
            failure,
        );
        info!(machine = %self.machines[m].spec.name, kind, "launching VM process");
        Ok(ApiResponse::ok(
            self.objects
                .insert(this.session(), Managed::Progress(progress)),
        ))
    }

    fn unlock(&mut self, this: ObjectRef) -> Reply {
        let Some((m, lock_type)) = self.session_lock(this)? else {
            return Err(Fault::new(
                VBOX_E_INVALID_SESSION_STATE,
                SESSION,
                "The session is not locked",
            ));
        };
        self.set_session_lock(this, None);
        self.counters.unlocks += 1;

        let machine = &mut self.machines[m];
        if lock_type == LockType::Write
            && machine.session_state == SessionState::Locked
            && !machine.state.is_online()
        {
            machine.session_state = SessionState::Unlocked;
            self.post_session_state(m);
        }
        Ok(ApiResponse::empty())
    }

    fn power_down(&mut self, this: ObjectRef) -> Reply {
        let Some((m, _)) = self.session_lock(this)? else {
            return Err(Fault::new(
                VBOX_E_INVALID_SESSION_STATE,
                SESSION,
                "The session is not locked",
            ));
        };

        let machine = &mut self.machines[m];
        if !matches!(machine.state, MachineState::Running | MachineState::Paused) {
            return Err(Fault::new(
                VBOX_E_INVALID_VM_STATE,
                CONSOLE,
                format!(
                    "Invalid machine state: {} (must be Running or Paused)",
                    machine.state
                ),
            ));
        }
        machine.state = MachineState::Stopping;
        machine.log(0, "Power off requested");
        self.post_machine_state(m);

        let progress = SimProgress::new(
            "Powering off virtual machine",
            self.config.power_down_duration,
            Completion::PoweredDown { machine: m },
            None,
        );
        Ok(ApiResponse::ok(
            self.objects
                .insert(this.session(), Managed::Progress(progress)),
        ))
    }

    fn setup_metrics(
        &mut self,
        this: ObjectRef,
        names: Vec<String>,
        objects: Vec<ObjectRef>,
        period: u32,
        count: u32,
    ) -> Reply {
        self.expect_collector(this)?;
        if period == 0 || count == 0 {
            return Err(Fault::new(
                E_INVALIDARG,
                PERF,
                "Sampling period and sample count must be positive",
            ));
        }

        let session = this.session();
        let targets: Vec<(ObjectRef, Target)> = if objects.is_empty() {
            let all: Vec<Target> = std::iter::once(Target::Host)
                .chain((0..self.machines.len()).map(Target::Machine))
                .collect();
            all.into_iter()
                .map(|t| (target_ref(&mut self.objects, &mut self.target_refs, session, t), t))
                .collect()
        } else {
            let resolved: Vec<(ObjectRef, Target)> = objects
                .iter()
                .map(|r| self.target_of(*r).map(|t| (*r, t)))
                .collect::<Result<_, Fault>>()?;
            // Later queries name targets by the caller's own references.
            for (r, t) in &resolved {
                self.target_refs.insert((session, *t), *r);
            }
            resolved
        };

        let period = Duration::from_secs(u64::from(period));
        let now = Instant::now();
        let mut descriptors = Vec::new();
        for def in METRICS.iter().filter(|d| any_matches(&names, d.name)) {
            for (object, target) in &targets {
                if def.on_machine != matches!(target, Target::Machine(_)) {
                    continue;
                }
                let ctx = sample_context(&self.config, &self.machines, *target);
                let slot = self.collector.setup(def, *target, period, count, now, &ctx);
                descriptors.push(slot.descriptor(*object));
            }
        }
        debug!(configured = descriptors.len(), "metrics set up");
        Ok(ApiResponse::ok(descriptors))
    }

    fn toggle_metrics(
        &mut self,
        this: ObjectRef,
        names: &[String],
        objects: &[ObjectRef],
        enabled: bool,
    ) -> Reply {
        self.expect_collector(this)?;
        let targets = self.targets_of(objects)?;
        let session = this.session();
        let (table, cache) = (&mut self.objects, &mut self.target_refs);
        let descriptors: Vec<_> = self
            .collector
            .matching_mut(names, &targets)
            .map(|slot| {
                slot.enabled = enabled;
                slot.descriptor(target_ref(table, cache, session, slot.target))
            })
            .collect();
        Ok(ApiResponse::ok(descriptors))
    }
}

/// Reference to a metric target in `session`, minted on first use.
fn target_ref(
    objects: &mut ObjectTable<Managed>,
    cache: &mut HashMap<(u32, Target), ObjectRef>,
    session: u32,
    target: Target,
) -> ObjectRef {
    if let Some(r) = cache.get(&(session, target)) {
        if objects.get(*r).is_some() {
            return *r;
        }
    }
    let object = match target {
        Target::Host => Managed::Host,
        Target::Machine(m) => Managed::Machine(m),
    };
    let r = objects.insert(session, object);
    cache.insert((session, target), r);
    r
}

fn sample_context(config: &SimConfig, machines: &[SimMachine], target: Target) -> SampleContext {
    let guest = match target {
        Target::Machine(m) => machines.get(m),
        Target::Host => None,
    };
    SampleContext {
        host_memory_kb: (config.host.memory_size_mb * 1024) as i64,
        host_cpu_mhz: i64::from(config.host.processor_speed_mhz),
        guest_memory_kb: guest.map(|m| i64::from(m.spec.memory_size_mb) * 1024),
        guest_online: guest.is_some_and(|m| m.state == MachineState::Running),
    }
}
