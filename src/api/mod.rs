//! HTTP endpoint serving the management API.
//!
//! Exposes a simulated platform to [`crate::transport::WebServiceTransport`]
//! clients.
//!
//! # Example
//!
//! ```bash
//! # Start the server
//! vboxctl serve --listen 127.0.0.1:18083
//!
//! # Log on
//! curl -X POST http://localhost:18083/api/v1/call \
//!   -H "Content-Type: application/json" \
//!   -d '{"method": "logon", "username": "", "password": ""}'
//! ```

pub mod error;
pub mod handlers;
pub mod state;
pub mod ticker;
pub mod types;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use vboxctl_protocol::CALL_PATH;

use state::ApiState;

/// Upper bound on a single request, including server-side waits.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Create the API router with all endpoints.
pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health))
        .route(CALL_PATH, post(handlers::call::call))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
