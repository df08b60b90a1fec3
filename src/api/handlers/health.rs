//! Health check endpoint.

use axum::extract::State;
use axum::Json;
use std::sync::Arc;

use crate::api::state::ApiState;
use crate::api::types::HealthResponse;

/// GET /health - Health check endpoint.
pub async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: crate::VERSION.to_string(),
        platform_version: state.platform().version().version,
        requests_served: state.requests_served(),
        calls: state
            .call_counts()
            .into_iter()
            .map(|(method, n)| (method.to_string(), n))
            .collect(),
    })
}
