//! API server state.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use vboxctl_sim::Platform;

/// Shared API server state.
pub struct ApiState {
    platform: Arc<Platform>,
    /// Calls served, per method.
    calls: Mutex<BTreeMap<&'static str, u64>>,
}

impl ApiState {
    /// Serve `platform`.
    pub fn new(platform: Arc<Platform>) -> Self {
        Self {
            platform,
            calls: Mutex::new(BTreeMap::new()),
        }
    }

    /// The platform behind the endpoint.
    pub fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }

    /// Count one call of `method`, returning the overall sequence number.
    pub fn record_call(&self, method: &'static str) -> u64 {
        let mut calls = self.calls.lock();
        *calls.entry(method).or_default() += 1;
        calls.values().sum()
    }

    /// Calls served so far.
    pub fn requests_served(&self) -> u64 {
        self.calls.lock().values().sum()
    }

    /// Per-method call counts.
    pub fn call_counts(&self) -> BTreeMap<&'static str, u64> {
        self.calls.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_counts() {
        let state = ApiState::new(Arc::new(Platform::demo()));
        assert_eq!(state.record_call("logon"), 1);
        assert_eq!(state.record_call("get_host"), 2);
        assert_eq!(state.record_call("logon"), 3);
        assert_eq!(state.requests_served(), 3);
        assert_eq!(state.call_counts()["logon"], 2);
    }
}
