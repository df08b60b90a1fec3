//! Error types for vboxctl.

use std::time::Duration;
use vboxctl_protocol::{codes, ErrorInfo};

/// Result type alias using vboxctl's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in vboxctl operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Endpoint unreachable or credentials rejected.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A stale, released or foreign object reference was used.
    #[error("invalid object reference: {0}")]
    InvalidReference(String),

    /// The server reported a failure result code.
    #[error("{message} (rc={})", codes::describe(*.result_code))]
    RemoteOperation {
        /// Primary error text.
        message: String,
        /// Numeric result code.
        result_code: u32,
        /// Structured error chain, outermost first.
        chain: Vec<ErrorInfo>,
    },

    /// A metrics query result violated the flattened format invariants.
    #[error("malformed metrics response: {0}")]
    MalformedMetricsResponse(String),

    /// A bounded wait passed its deadline.
    #[error("timed out after {} waiting for {operation}", humantime::format_duration(*.waited))]
    TimeoutExceeded {
        /// What was being waited for.
        operation: String,
        /// How long the caller waited.
        waited: Duration,
    },

    /// Neither ID nor name lookup found a machine.
    #[error("can't find VM '{0}'")]
    VmNotFound(String),

    /// HTTP or other transport-level failure after connecting.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server answered with an unexpected shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to load the configuration file.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a remote operation error without a chain.
    pub fn remote(result_code: u32, message: impl Into<String>) -> Self {
        Self::RemoteOperation {
            message: message.into(),
            result_code,
            chain: Vec::new(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, waited: Duration) -> Self {
        Self::TimeoutExceeded {
            operation: operation.into(),
            waited,
        }
    }

    /// Numeric result code, if the server produced one.
    pub fn result_code(&self) -> Option<u32> {
        match self {
            Error::RemoteOperation { result_code, .. } => Some(*result_code),
            Error::InvalidReference(_) => Some(codes::E_POINTER),
            _ => None,
        }
    }

    /// Structured error chain, if any.
    pub fn chain(&self) -> &[ErrorInfo] {
        match self {
            Error::RemoteOperation { chain, .. } => chain,
            _ => &[],
        }
    }

    /// Multi-line report with the full error chain.
    pub fn report(&self) -> String {
        let mut out = self.to_string();
        for (depth, info) in self.chain().iter().enumerate() {
            out.push_str(&format!(
                "\n  [{}] {}\n      rc={} component={} interface={}",
                depth,
                info.text,
                codes::describe(info.result_code),
                info.component,
                info.interface_id
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_display_names_code() {
        let err = Error::remote(codes::VBOX_E_OBJECT_NOT_FOUND, "no such machine");
        assert_eq!(
            err.to_string(),
            "no such machine (rc=0x80bb0001 (VBOX_E_OBJECT_NOT_FOUND))"
        );
        assert_eq!(err.result_code(), Some(codes::VBOX_E_OBJECT_NOT_FOUND));
    }

    #[test]
    fn test_report_includes_chain() {
        let err = Error::RemoteOperation {
            message: "launch failed".into(),
            result_code: codes::E_FAIL,
            chain: vec![ErrorInfo {
                result_code: codes::E_FAIL,
                text: "VT-x is not available".into(),
                component: "ConsoleWrap".into(),
                interface_id: "6ac83d89".into(),
            }],
        };
        let report = err.report();
        assert!(report.starts_with("launch failed"));
        assert!(report.contains("VT-x is not available"));
        assert!(report.contains("component=ConsoleWrap"));
        assert!(report.contains("interface=6ac83d89"));
    }

    #[test]
    fn test_timeout_display() {
        let err = Error::timeout("VM start", Duration::from_secs(90));
        assert_eq!(err.to_string(), "timed out after 1m 30s waiting for VM start");
    }
}
