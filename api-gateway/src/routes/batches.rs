use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use anchor::{BatchWindow, ChainId, PendingBatch, RetryReport, SealOutcome};

use crate::error::ApiError;
use crate::state::SharedState;

/// Request body for `POST /batches`.
///
/// With a `window` that exact range is sealed; without one the next
/// unsealed receipts of the chain are, up to `max_receipts`.
#[derive(Debug, Deserialize)]
pub struct SealRequest {
    pub chain: String,
    pub window: Option<BatchWindow>,
    pub max_receipts: Option<u64>,
}

/// `POST /batches`
///
/// `201` with the signed root, `202` when the timestamp authority is
/// unavailable and the window is pending, `204` when nothing is left to
/// seal.
pub async fn seal_batch(
    State(state): State<SharedState>,
    Json(body): Json<SealRequest>,
) -> Result<Response, ApiError> {
    let chain = ChainId::new(&body.chain)?;
    let max = body.max_receipts.unwrap_or(state.max_batch_receipts);
    let outcome = state
        .blocking(move |engine, _| match body.window {
            Some(window) => engine.sealer.seal_batch(&chain, window).map(Some),
            None => engine.sealer.seal_next(&chain, max),
        })
        .await?;

    Ok(match outcome {
        Some(sealed @ SealOutcome::Sealed(_)) => (StatusCode::CREATED, Json(sealed)).into_response(),
        Some(deferred @ SealOutcome::Deferred(_)) => {
            (StatusCode::ACCEPTED, Json(deferred)).into_response()
        }
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

/// `GET /batches/pending`
///
/// Windows whose Merkle root is computed but not yet signed.
pub async fn pending_batches(
    State(state): State<SharedState>,
) -> Result<Json<Vec<PendingBatch>>, ApiError> {
    let pending = state
        .blocking(|engine, _| engine.sealer.pending_unsigned_batches())
        .await?;
    Ok(Json(pending))
}

/// `POST /batches/retry`
pub async fn retry_pending(
    State(state): State<SharedState>,
) -> Result<Json<RetryReport>, ApiError> {
    let report = state
        .blocking(|engine, _| engine.sealer.retry_pending())
        .await?;
    Ok(Json(report))
}
