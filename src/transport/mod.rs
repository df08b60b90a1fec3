//! Transport bindings.
//!
//! A [`Transport`] carries one [`ApiRequest`] to the management server and
//! brings back its [`ApiResponse`]. Every higher layer (raw requests, typed
//! object wrappers, the operations module) goes through this one trait, so
//! both bindings behave identically:
//!
//! - [`InProcessTransport`] hands requests straight to a local platform.
//! - [`WebServiceTransport`] posts them as JSON to a remote endpoint.

mod local;
mod web;

pub use local::InProcessTransport;
pub use web::WebServiceTransport;

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use std::time::Duration;
use vboxctl_protocol::{codes, ApiRequest, ApiResponse};

/// How remote object references are reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleasePolicy {
    /// The client must release each reference it obtained.
    Explicit,
    /// The server reclaims references at logoff; release is a no-op.
    Managed,
}

/// A binding to a management server.
pub trait Transport: Send + Sync {
    /// Send one request and wait for its response.
    fn call(&self, request: ApiRequest) -> Result<ApiResponse>;

    /// Service the binding's message loop for up to `timeout`.
    ///
    /// A zero timeout never blocks.
    fn pump(&self, timeout: Duration);

    /// How references obtained through this transport are reclaimed.
    fn release_policy(&self) -> ReleasePolicy;

    /// Human-readable endpoint description.
    fn describe(&self) -> String;
}

/// Invoke a request and decode its return value.
///
/// The transport is pumped after every call. Faults become
/// [`Error::InvalidReference`] for dead references and
/// [`Error::RemoteOperation`] otherwise.
pub fn invoke<T: DeserializeOwned>(transport: &dyn Transport, request: ApiRequest) -> Result<T> {
    let method = request.method();
    let target = request.target();
    let response = transport.call(request);
    transport.pump(Duration::ZERO);

    match response? {
        ApiResponse::Ok { data } => {
            serde_json::from_value(data.unwrap_or(serde_json::Value::Null)).map_err(|e| {
                Error::Protocol(format!("{}: unexpected return value: {}", method, e))
            })
        }
        ApiResponse::Fault {
            message,
            result_code,
            error_chain,
        } => {
            tracing::debug!(
                method,
                rc = %codes::describe(result_code),
                message = %message,
                "remote call failed"
            );
            if result_code == codes::E_POINTER {
                let target = target.map(|t| t.to_string()).unwrap_or_default();
                return Err(Error::InvalidReference(format!("{} ({})", target, message)));
            }
            Err(Error::RemoteOperation {
                message,
                result_code,
                chain: error_chain,
            })
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Transport wrapper that records every method sent.

    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    pub struct RecordingTransport {
        inner: Arc<dyn Transport>,
        calls: Mutex<Vec<&'static str>>,
    }

    impl RecordingTransport {
        pub fn new(inner: Arc<dyn Transport>) -> Self {
            Self {
                inner,
                calls: Mutex::new(Vec::new()),
            }
        }

        /// Number of calls of `method` so far.
        pub fn count(&self, method: &str) -> usize {
            self.calls.lock().iter().filter(|m| **m == method).count()
        }
    }

    impl Transport for RecordingTransport {
        fn call(&self, request: ApiRequest) -> Result<ApiResponse> {
            self.calls.lock().push(request.method());
            self.inner.call(request)
        }

        fn pump(&self, timeout: Duration) {
            self.inner.pump(timeout)
        }

        fn release_policy(&self) -> ReleasePolicy {
            self.inner.release_policy()
        }

        fn describe(&self) -> String {
            self.inner.describe()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vboxctl_protocol::ObjectRef;
    use vboxctl_sim::Platform;

    #[test]
    fn test_invoke_decodes_value() {
        let t = InProcessTransport::new(Arc::new(Platform::demo()));
        let root: ObjectRef = invoke(
            &t,
            ApiRequest::Logon {
                username: String::new(),
                password: String::new(),
            },
        )
        .unwrap();
        let version: vboxctl_protocol::VersionInfo =
            invoke(&t, ApiRequest::GetVersion { this: root }).unwrap();
        assert!(!version.version.is_empty());
    }

    #[test]
    fn test_invoke_maps_dead_reference() {
        let t = InProcessTransport::new(Arc::new(Platform::demo()));
        let bogus = ObjectRef::new(42, 7, 1);
        let err = invoke::<()>(&t, ApiRequest::GetVersion { this: bogus }).unwrap_err();
        assert!(matches!(err, Error::InvalidReference(_)));
    }

    #[test]
    fn test_invoke_maps_fault() {
        let t = InProcessTransport::new(Arc::new(Platform::demo()));
        let root: ObjectRef = invoke(
            &t,
            ApiRequest::Logon {
                username: String::new(),
                password: String::new(),
            },
        )
        .unwrap();
        let err = invoke::<ObjectRef>(
            &t,
            ApiRequest::FindMachine {
                this: root,
                name: "missing".to_string(),
            },
        )
        .unwrap_err();
        assert_eq!(err.result_code(), Some(codes::VBOX_E_OBJECT_NOT_FOUND));
    }

    #[test]
    fn test_invoke_rejects_wrong_shape() {
        let t = InProcessTransport::new(Arc::new(Platform::demo()));
        let err = invoke::<u32>(
            &t,
            ApiRequest::Logon {
                username: String::new(),
                password: String::new(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
