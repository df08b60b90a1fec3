//! Simulated management platform.
//!
//! [`Platform`] answers [`ApiRequest`]s the way a real hypervisor management
//! service would: it owns machines, sessions, progress objects, event
//! listeners and performance collectors, and hands out [`ObjectRef`]s scoped
//! to the logon session that obtained them.
//!
//! Time moves on its own. Launches and power-downs complete after the
//! configured durations, metrics sample on their periods, and state changes
//! turn into events queued for registered listeners. Calls that wait
//! (`wait_for_completion`, `get_event`) block the caller up to their timeout.
//!
//! [`ObjectRef`]: vboxctl_protocol::ObjectRef

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;
use vboxctl_protocol::{
    ApiRequest, ApiResponse, EventInfo, HostInfo, MachineState, ObjectRef, VersionInfo,
    MAX_SERVER_WAIT,
};

mod events;
mod machine;
mod perf;
mod state;
mod table;

pub use machine::MachineSpec;

use state::State;

/// Longest a blocked call sleeps before re-checking timers.
const WAIT_SLICE: Duration = Duration::from_millis(20);

/// Configuration of a simulated platform.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Reported server version.
    pub version: VersionInfo,
    /// Accepted credentials; `None` accepts any logon.
    pub credentials: Option<(String, String)>,
    /// Reported host attributes.
    pub host: HostInfo,
    /// Registered machines.
    pub machines: Vec<MachineSpec>,
    /// Time a VM process launch takes to complete.
    pub launch_duration: Duration,
    /// Time a power-down takes to complete.
    pub power_down_duration: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            version: VersionInfo {
                version: "7.0.18".to_string(),
                revision: 162_988,
                api_version: "7_0".to_string(),
            },
            credentials: None,
            host: HostInfo {
                operating_system: "Linux".to_string(),
                os_version: "6.8.0".to_string(),
                processor_count: 8,
                processor_online_count: 8,
                processor_description: "Simulated x86-64 Processor".to_string(),
                processor_speed_mhz: 3000,
                memory_size_mb: 16_384,
                memory_available_mb: 9_216,
            },
            machines: Vec::new(),
            launch_duration: Duration::from_millis(1500),
            power_down_duration: Duration::from_millis(800),
        }
    }
}

impl SimConfig {
    /// Platform with a handful of ready-to-use machines.
    pub fn demo() -> Self {
        Self::default()
            .with_machine(MachineSpec::new("alpine", "Linux_64").with_resources(1, 512))
            .with_machine(MachineSpec::new("debian", "Debian_64").with_resources(2, 2048))
            .with_machine(MachineSpec::new("win11", "Windows11_64").with_resources(4, 8192))
    }

    /// Require these credentials on logon.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Register a machine.
    pub fn with_machine(mut self, spec: MachineSpec) -> Self {
        self.machines.push(spec);
        self
    }

    /// Set launch and power-down durations.
    pub fn with_durations(mut self, launch: Duration, power_down: Duration) -> Self {
        self.launch_duration = launch;
        self.power_down_duration = power_down;
        self
    }
}

/// Counters and gauges describing platform state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimStats {
    pub logons: u64,
    pub logoffs: u64,
    pub launches: u64,
    pub unlocks: u64,
    pub active_sessions: usize,
    pub live_objects: usize,
    pub registered_listeners: usize,
    pub pending_events: usize,
    pub unacknowledged_events: usize,
}

/// A simulated management platform.
pub struct Platform {
    state: Mutex<State>,
    changed: Condvar,
}

impl Platform {
    /// Create a platform.
    pub fn new(config: SimConfig) -> Self {
        Self {
            state: Mutex::new(State::new(config)),
            changed: Condvar::new(),
        }
    }

    /// Platform seeded with [`SimConfig::demo`].
    pub fn demo() -> Self {
        Self::new(SimConfig::demo())
    }

    /// Handle one request.
    pub fn handle(&self, request: ApiRequest) -> ApiResponse {
        debug!(method = request.method(), "handling request");
        let response = match request {
            ApiRequest::GetEvent {
                this,
                listener,
                timeout_ms,
            } => self.get_event(this, listener, timeout_ms),
            ApiRequest::WaitForCompletion { this, timeout_ms } => {
                self.wait_for_completion(this, timeout_ms)
            }
            request => {
                let mut state = self.state.lock();
                state.advance(Instant::now());
                state.dispatch(request)
            }
        };
        self.changed.notify_all();
        response
    }

    /// Let platform time pass for up to `timeout`, returning early when
    /// something changes.
    pub fn pump(&self, timeout: Duration) {
        let mut state = self.state.lock();
        state.advance(Instant::now());
        if !timeout.is_zero() {
            self.changed.wait_for(&mut state, timeout);
            state.advance(Instant::now());
        }
    }

    /// Version the platform reports.
    pub fn version(&self) -> VersionInfo {
        self.state.lock().version().clone()
    }

    /// Snapshot of platform counters.
    pub fn stats(&self) -> SimStats {
        let mut state = self.state.lock();
        state.advance(Instant::now());
        state.stats()
    }

    /// Current state of the machine called `name`.
    pub fn machine_state(&self, name: &str) -> Option<MachineState> {
        let mut state = self.state.lock();
        state.advance(Instant::now());
        state.machine_by_name(name).map(|m| m.state)
    }

    /// Full contents of log `index` of the machine called `name`.
    pub fn log_contents(&self, name: &str, index: usize) -> Option<Vec<u8>> {
        let state = self.state.lock();
        state.machine_by_name(name)?.logs.get(index).cloned()
    }

    fn get_event(&self, this: ObjectRef, listener: ObjectRef, timeout_ms: u64) -> ApiResponse {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms).min(MAX_SERVER_WAIT);
        let mut state = self.state.lock();
        loop {
            state.advance(Instant::now());
            match state.pull_event(this, listener) {
                Err(fault) => return fault.into_response(),
                Ok(Some(info)) => return ApiResponse::ok(Some(info)),
                Ok(None) => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return ApiResponse::ok(None::<EventInfo>);
            }
            self.changed
                .wait_for(&mut state, (deadline - now).min(WAIT_SLICE));
        }
    }

    fn wait_for_completion(&self, this: ObjectRef, timeout_ms: u64) -> ApiResponse {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms).min(MAX_SERVER_WAIT);
        let mut state = self.state.lock();
        loop {
            state.advance(Instant::now());
            match state.progress_completed(this) {
                Err(fault) => return fault.into_response(),
                Ok(true) => return ApiResponse::empty(),
                Ok(false) => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return ApiResponse::empty();
            }
            self.changed
                .wait_for(&mut state, (deadline - now).min(WAIT_SLICE));
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::demo()
    }
}
