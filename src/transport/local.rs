//! In-process binding.

use super::{ReleasePolicy, Transport};
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use vboxctl_protocol::{ApiRequest, ApiResponse};
use vboxctl_sim::Platform;

/// Calls a platform living in the same process.
pub struct InProcessTransport {
    platform: Arc<Platform>,
    policy: ReleasePolicy,
}

impl InProcessTransport {
    /// Bind to `platform`. References are reclaimed by the platform.
    pub fn new(platform: Arc<Platform>) -> Self {
        Self {
            platform,
            policy: ReleasePolicy::Managed,
        }
    }

    /// Override the release policy.
    pub fn with_release_policy(mut self, policy: ReleasePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The bound platform.
    pub fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }
}

impl Transport for InProcessTransport {
    fn call(&self, request: ApiRequest) -> Result<ApiResponse> {
        Ok(self.platform.handle(request))
    }

    fn pump(&self, timeout: Duration) {
        self.platform.pump(timeout);
    }

    fn release_policy(&self) -> ReleasePolicy {
        self.policy
    }

    fn describe(&self) -> String {
        "in-process platform".to_string()
    }
}
