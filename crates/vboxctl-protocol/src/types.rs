//! Value types returned by the management API.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine execution state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    #[default]
    PoweredOff,
    Saved,
    Aborted,
    Starting,
    Running,
    Paused,
    Stopping,
}

impl MachineState {
    /// Returns true if the machine has a live VM process.
    pub fn is_online(&self) -> bool {
        matches!(
            self,
            MachineState::Starting | MachineState::Running | MachineState::Paused | MachineState::Stopping
        )
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MachineState::PoweredOff => "powered off",
            MachineState::Saved => "saved",
            MachineState::Aborted => "aborted",
            MachineState::Starting => "starting",
            MachineState::Running => "running",
            MachineState::Paused => "paused",
            MachineState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Lock state of a machine or session object.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Unlocked,
    Locked,
    Spawning,
    Unlocking,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Unlocked => "unlocked",
            SessionState::Locked => "locked",
            SessionState::Spawning => "spawning",
            SessionState::Unlocking => "unlocking",
        };
        f.write_str(s)
    }
}

/// Kind of lock requested by `lock_machine`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    /// Share the lock with the session that runs the VM.
    Shared,
    /// Exclusive lock; the machine must not be running.
    Write,
}

/// Server version information.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: String,
    pub revision: u32,
    pub api_version: String,
}

/// Host attributes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostInfo {
    pub operating_system: String,
    pub os_version: String,
    pub processor_count: u32,
    pub processor_online_count: u32,
    pub processor_description: String,
    pub processor_speed_mhz: u32,
    pub memory_size_mb: u64,
    pub memory_available_mb: u64,
}

/// Machine attributes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineInfo {
    pub id: String,
    pub name: String,
    pub os_type_id: String,
    pub accessible: bool,
    pub state: MachineState,
    pub session_state: SessionState,
    pub memory_size_mb: u32,
    pub cpu_count: u32,
    pub log_count: u32,
}

/// One element of a structured error chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorInfo {
    pub result_code: u32,
    pub text: String,
    pub component: String,
    pub interface_id: String,
}

/// Snapshot of a progress object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressState {
    pub description: String,
    pub completed: bool,
    pub percent: u32,
    pub result_code: u32,
    pub cancelable: bool,
    /// Error chain; empty unless the operation failed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error: Vec<ErrorInfo>,
}

/// One chunk of a machine log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogChunk {
    #[serde(with = "crate::base64_bytes")]
    pub data: Vec<u8>,
}
