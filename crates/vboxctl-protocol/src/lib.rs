//! Protocol types for the vboxctl management API.
//!
//! Every remote operation is a single [`ApiRequest`] answered by a single
//! [`ApiResponse`]. Requests address server-side objects through opaque
//! [`ObjectRef`] tokens; the server owns all state behind them.
//!
//! Both transport bindings carry these types: the in-process binding hands
//! them straight to the platform, the web-service binding serializes them as
//! JSON over HTTP.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod codes;
pub mod events;
pub mod metrics;
pub mod objref;
pub mod types;

pub use events::{EventInfo, EventPayload, EventType};
pub use metrics::{MetricDescriptor, MetricsData};
pub use objref::ObjectRef;
pub use types::{
    ErrorInfo, HostInfo, LockType, LogChunk, MachineInfo, MachineState, ProgressState,
    SessionState, VersionInfo,
};

/// Protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default TCP port of the web-service endpoint.
pub const DEFAULT_PORT: u16 = 18083;

/// Path of the call endpoint on the web service.
pub const CALL_PATH: &str = "/api/v1/call";

/// Longest a single blocking call is held server-side. Longer waits are
/// split into repeated calls by the client.
pub const MAX_SERVER_WAIT: Duration = Duration::from_secs(60);

/// Protocol-level errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// An object reference token could not be parsed.
    #[error("invalid object reference '{0}'")]
    InvalidObjectRef(String),

    /// Base64 payload could not be decoded.
    #[error("invalid base64 payload: {0}")]
    InvalidPayload(String),
}

/// A request sent to the management server.
///
/// `this` is always the object the method is invoked on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ApiRequest {
    /// Authenticate and obtain the root object.
    Logon { username: String, password: String },

    /// Invalidate the root object and every reference obtained through it.
    Logoff { this: ObjectRef },

    /// Server version information.
    GetVersion { this: ObjectRef },

    /// Host object of the root.
    GetHost { this: ObjectRef },

    /// Host attributes.
    GetHostInfo { this: ObjectRef },

    /// All registered machines.
    GetMachines { this: ObjectRef },

    /// Look up a machine by UUID.
    GetMachine { this: ObjectRef, id: String },

    /// Look up a machine by name.
    FindMachine { this: ObjectRef, name: String },

    /// Machine attributes.
    GetMachineInfo { this: ObjectRef },

    /// Read a chunk of a machine log file.
    ReadLog {
        this: ObjectRef,
        index: u32,
        offset: u64,
        size: u64,
    },

    /// File name of a machine log.
    QueryLogFilename { this: ObjectRef, index: u32 },

    /// Obtain a fresh, unlocked session object.
    GetSessionObject { this: ObjectRef },

    /// Lock a machine into a session object.
    LockMachine {
        this: ObjectRef,
        session: ObjectRef,
        lock_type: LockType,
    },

    /// Spawn the VM process for a machine; returns a progress object.
    LaunchVmProcess {
        this: ObjectRef,
        session: ObjectRef,
        kind: String,
    },

    /// Release the lock held by a session object.
    UnlockMachine { this: ObjectRef },

    /// Power down the machine locked by a session; returns a progress object.
    PowerDown { this: ObjectRef },

    /// Current state of a progress object.
    GetProgressState { this: ObjectRef },

    /// Block up to `timeout_ms` for a progress object to complete.
    WaitForCompletion { this: ObjectRef, timeout_ms: u64 },

    /// Event source of the root object.
    GetEventSource { this: ObjectRef },

    /// Allocate a passive listener on an event source.
    CreateListener { this: ObjectRef },

    /// Subscribe a listener to event categories.
    RegisterListener {
        this: ObjectRef,
        listener: ObjectRef,
        categories: Vec<EventType>,
        active: bool,
    },

    /// Pull one event, blocking up to `timeout_ms`.
    GetEvent {
        this: ObjectRef,
        listener: ObjectRef,
        timeout_ms: u64,
    },

    /// Acknowledge an event pulled through `listener`.
    EventProcessed {
        this: ObjectRef,
        listener: ObjectRef,
        event: ObjectRef,
    },

    /// Remove a listener; later pulls on it fail.
    UnregisterListener { this: ObjectRef, listener: ObjectRef },

    /// Performance collector of the root object.
    GetPerformanceCollector { this: ObjectRef },

    /// (Re)configure metrics and start sampling.
    SetupMetrics {
        this: ObjectRef,
        names: Vec<String>,
        objects: Vec<ObjectRef>,
        period: u32,
        count: u32,
    },

    /// Resume sampling of configured metrics.
    EnableMetrics {
        this: ObjectRef,
        names: Vec<String>,
        objects: Vec<ObjectRef>,
    },

    /// Pause sampling of configured metrics.
    DisableMetrics {
        this: ObjectRef,
        names: Vec<String>,
        objects: Vec<ObjectRef>,
    },

    /// Descriptors of configured metrics.
    GetMetrics {
        this: ObjectRef,
        names: Vec<String>,
        objects: Vec<ObjectRef>,
    },

    /// Sample buffers in the flattened wire format.
    QueryMetricsData {
        this: ObjectRef,
        names: Vec<String>,
        objects: Vec<ObjectRef>,
    },

    /// Release a reference.
    Release { this: ObjectRef },
}

impl ApiRequest {
    /// Method name, for logging.
    pub fn method(&self) -> &'static str {
        match self {
            ApiRequest::Logon { .. } => "logon",
            ApiRequest::Logoff { .. } => "logoff",
            ApiRequest::GetVersion { .. } => "get_version",
            ApiRequest::GetHost { .. } => "get_host",
            ApiRequest::GetHostInfo { .. } => "get_host_info",
            ApiRequest::GetMachines { .. } => "get_machines",
            ApiRequest::GetMachine { .. } => "get_machine",
            ApiRequest::FindMachine { .. } => "find_machine",
            ApiRequest::GetMachineInfo { .. } => "get_machine_info",
            ApiRequest::ReadLog { .. } => "read_log",
            ApiRequest::QueryLogFilename { .. } => "query_log_filename",
            ApiRequest::GetSessionObject { .. } => "get_session_object",
            ApiRequest::LockMachine { .. } => "lock_machine",
            ApiRequest::LaunchVmProcess { .. } => "launch_vm_process",
            ApiRequest::UnlockMachine { .. } => "unlock_machine",
            ApiRequest::PowerDown { .. } => "power_down",
            ApiRequest::GetProgressState { .. } => "get_progress_state",
            ApiRequest::WaitForCompletion { .. } => "wait_for_completion",
            ApiRequest::GetEventSource { .. } => "get_event_source",
            ApiRequest::CreateListener { .. } => "create_listener",
            ApiRequest::RegisterListener { .. } => "register_listener",
            ApiRequest::GetEvent { .. } => "get_event",
            ApiRequest::EventProcessed { .. } => "event_processed",
            ApiRequest::UnregisterListener { .. } => "unregister_listener",
            ApiRequest::GetPerformanceCollector { .. } => "get_performance_collector",
            ApiRequest::SetupMetrics { .. } => "setup_metrics",
            ApiRequest::EnableMetrics { .. } => "enable_metrics",
            ApiRequest::DisableMetrics { .. } => "disable_metrics",
            ApiRequest::GetMetrics { .. } => "get_metrics",
            ApiRequest::QueryMetricsData { .. } => "query_metrics_data",
            ApiRequest::Release { .. } => "release",
        }
    }

    /// How long the server may legitimately hold this request before replying.
    ///
    /// Transports add this to their normal request timeout. Never more than
    /// [`MAX_SERVER_WAIT`].
    pub fn server_wait(&self) -> Option<Duration> {
        match self {
            ApiRequest::GetEvent { timeout_ms, .. }
            | ApiRequest::WaitForCompletion { timeout_ms, .. } => {
                Some(Duration::from_millis(*timeout_ms).min(MAX_SERVER_WAIT))
            }
            _ => None,
        }
    }

    /// The object the request is invoked on, if any.
    pub fn target(&self) -> Option<ObjectRef> {
        match self {
            ApiRequest::Logon { .. } => None,
            ApiRequest::Logoff { this }
            | ApiRequest::GetVersion { this }
            | ApiRequest::GetHost { this }
            | ApiRequest::GetHostInfo { this }
            | ApiRequest::GetMachines { this }
            | ApiRequest::GetMachine { this, .. }
            | ApiRequest::FindMachine { this, .. }
            | ApiRequest::GetMachineInfo { this }
            | ApiRequest::ReadLog { this, .. }
            | ApiRequest::QueryLogFilename { this, .. }
            | ApiRequest::GetSessionObject { this }
            | ApiRequest::LockMachine { this, .. }
            | ApiRequest::LaunchVmProcess { this, .. }
            | ApiRequest::UnlockMachine { this }
            | ApiRequest::PowerDown { this }
            | ApiRequest::GetProgressState { this }
            | ApiRequest::WaitForCompletion { this, .. }
            | ApiRequest::GetEventSource { this }
            | ApiRequest::CreateListener { this }
            | ApiRequest::RegisterListener { this, .. }
            | ApiRequest::GetEvent { this, .. }
            | ApiRequest::EventProcessed { this, .. }
            | ApiRequest::UnregisterListener { this, .. }
            | ApiRequest::GetPerformanceCollector { this }
            | ApiRequest::SetupMetrics { this, .. }
            | ApiRequest::EnableMetrics { this, .. }
            | ApiRequest::DisableMetrics { this, .. }
            | ApiRequest::GetMetrics { this, .. }
            | ApiRequest::QueryMetricsData { this, .. }
            | ApiRequest::Release { this } => Some(*this),
        }
    }
}

/// A response from the management server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ApiResponse {
    /// The call succeeded; `data` holds the return value, if any.
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },

    /// The call failed on the server.
    Fault {
        message: String,
        result_code: u32,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        error_chain: Vec<ErrorInfo>,
    },
}

impl ApiResponse {
    /// Successful response without a return value.
    pub fn empty() -> Self {
        ApiResponse::Ok { data: None }
    }

    /// Successful response carrying `value`.
    pub fn ok<T: Serialize>(value: T) -> Self {
        match serde_json::to_value(value) {
            Ok(data) => ApiResponse::Ok { data: Some(data) },
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize return value");
                ApiResponse::fault(codes::E_FAIL, format!("failed to serialize return value: {}", e))
            }
        }
    }

    /// Fault without an error chain.
    pub fn fault(result_code: u32, message: impl Into<String>) -> Self {
        ApiResponse::Fault {
            message: message.into(),
            result_code,
            error_chain: Vec::new(),
        }
    }

    /// Returns true if this is a fault.
    pub fn is_fault(&self) -> bool {
        matches!(self, ApiResponse::Fault { .. })
    }
}

/// Serde adapter for byte buffers carried as base64 strings.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| serde::de::Error::custom(crate::ProtocolError::InvalidPayload(e.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oref(slot: u32) -> ObjectRef {
        ObjectRef::new(1, slot, 1)
    }

    #[test]
    fn test_request_wire_shape() {
        let req = ApiRequest::GetEvent {
            this: oref(2),
            listener: oref(3),
            timeout_ms: 500,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["method"], "get_event");
        assert_eq!(json["this"], "00000001-00000002-0001");
        assert_eq!(json["timeout_ms"], 500);

        let back: ApiRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_server_wait() {
        let req = ApiRequest::WaitForCompletion {
            this: oref(1),
            timeout_ms: 200,
        };
        assert_eq!(req.server_wait(), Some(Duration::from_millis(200)));
        assert_eq!(ApiRequest::GetVersion { this: oref(1) }.server_wait(), None);

        let forever = ApiRequest::GetEvent {
            this: oref(1),
            listener: oref(2),
            timeout_ms: u64::MAX,
        };
        assert_eq!(forever.server_wait(), Some(MAX_SERVER_WAIT));
    }

    #[test]
    fn test_target() {
        assert_eq!(
            ApiRequest::Logon {
                username: "u".into(),
                password: "p".into()
            }
            .target(),
            None
        );
        assert_eq!(ApiRequest::Release { this: oref(9) }.target(), Some(oref(9)));
    }

    #[test]
    fn test_fault_response() {
        let resp = ApiResponse::fault(codes::E_ACCESSDENIED, "denied");
        assert!(resp.is_fault());
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"status\":\"fault\""));
        assert!(!json.contains("error_chain"));

        let ok = ApiResponse::ok(42u32);
        assert_eq!(
            ok,
            ApiResponse::Ok {
                data: Some(serde_json::json!(42))
            }
        );
    }

    #[test]
    fn test_log_chunk_base64() {
        let chunk = LogChunk {
            data: b"00:00:00.000 VirtualBox\n".to_vec(),
        };
        let json = serde_json::to_value(&chunk).unwrap();
        assert!(json["data"].is_string());
        let back: LogChunk = serde_json::from_value(json).unwrap();
        assert_eq!(back, chunk);

        let bad = serde_json::json!({ "data": "***" });
        assert!(serde_json::from_value::<LogChunk>(bad).is_err());
    }
}
