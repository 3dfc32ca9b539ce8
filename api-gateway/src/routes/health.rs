use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;

use crate::state::SharedState;

/// Health-check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Windows waiting for the timestamp authority.
    pub pending_unsigned_batches: i64,
}

/// `GET /health`
///
/// Liveness plus the pending-batch gauge, so a stuck timestamp authority is
/// visible without scraping metrics.
pub async fn health(State(state): State<SharedState>) -> (StatusCode, Json<HealthResponse>) {
    let pending = state.metrics.evidence.pending_unsigned_batches.get();
    let status = if pending > 0 { "degraded" } else { "ok" };
    (
        StatusCode::OK,
        Json(HealthResponse {
            status,
            pending_unsigned_batches: pending,
        }),
    )
}
