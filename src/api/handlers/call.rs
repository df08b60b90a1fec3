//! Management call endpoint.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use std::sync::Arc;
use vboxctl_protocol::{ApiRequest, ApiResponse};

use crate::api::error::ApiError;
use crate::api::state::ApiState;

/// POST /api/v1/call - Dispatch one management request.
///
/// Requests may block server-side (`get_event`, `wait_for_completion`), so
/// they run on the blocking pool. A body that isn't an `ApiRequest` is a
/// bad request.
pub async fn call(
    State(state): State<Arc<ApiState>>,
    payload: Result<Json<ApiRequest>, JsonRejection>,
) -> Result<Json<ApiResponse>, ApiError> {
    let Json(req) = payload.map_err(|rejection| {
        tracing::debug!(error = %rejection.body_text(), "rejected call body");
        ApiError::from(rejection)
    })?;
    let method = req.method();
    let seq = state.record_call(method);
    tracing::debug!(seq, method, "dispatching call");

    let platform = state.platform().clone();
    let response = tokio::task::spawn_blocking(move || platform.handle(req))
        .await
        .map_err(|e| ApiError::Internal(format!("{} worker failed: {}", method, e)))?;

    if let ApiResponse::Fault {
        result_code,
        message,
        ..
    } = &response
    {
        tracing::debug!(seq, method, result_code, %message, "call faulted");
    }
    Ok(Json(response))
}
