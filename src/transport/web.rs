//! Web-service binding: JSON over HTTP.

use super::{ReleasePolicy, Transport};
use crate::error::{Error, Result};
use std::time::Duration;
use vboxctl_protocol::{ApiRequest, ApiResponse, CALL_PATH};

/// Connect timeout for the HTTP client.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Posts requests to a remote management endpoint.
pub struct WebServiceTransport {
    client: reqwest::blocking::Client,
    endpoint: String,
    call_url: String,
    request_timeout: Duration,
}

impl WebServiceTransport {
    /// Create a transport for `endpoint` (e.g. `http://localhost:18083`).
    pub fn new(endpoint: &str, request_timeout: Duration) -> Result<Self> {
        let endpoint = endpoint.trim_end_matches('/').to_string();
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            call_url: format!("{}{}", endpoint, CALL_PATH),
            endpoint,
            request_timeout,
        })
    }
}

impl Transport for WebServiceTransport {
    fn call(&self, request: ApiRequest) -> Result<ApiResponse> {
        let timeout = self
            .request_timeout
            .saturating_add(request.server_wait().unwrap_or_default());
        let method = request.method();

        let response = self
            .client
            .post(&self.call_url)
            .timeout(timeout)
            .json(&request)
            .send()
            .map_err(|e| {
                if e.is_connect() {
                    Error::Connection(format!("{} unreachable: {}", self.endpoint, e))
                } else {
                    Error::Transport(format!("{} failed: {}", method, e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport(format!(
                "{} returned HTTP {}",
                self.call_url, status
            )));
        }

        response
            .json::<ApiResponse>()
            .map_err(|e| Error::Protocol(format!("{}: undecodable response: {}", method, e)))
    }

    fn pump(&self, _timeout: Duration) {
        // Nothing to service: every reply arrives on its own request.
    }

    fn release_policy(&self) -> ReleasePolicy {
        ReleasePolicy::Explicit
    }

    fn describe(&self) -> String {
        self.endpoint.clone()
    }
}
