//! API response types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Version of the served platform.
    pub platform_version: String,
    pub requests_served: u64,
    /// Calls served, per method.
    pub calls: BTreeMap<String, u64>,
}
