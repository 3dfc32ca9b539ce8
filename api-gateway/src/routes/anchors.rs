use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};

use anchor::{
    Anchor, Commitment, DatasetMetadata, DatasetSplit, Hash256, ModelAnchorId, ModelAnchorSpec,
};

use crate::error::ApiError;
use crate::state::SharedState;

/// Request body for `POST /datasets`.
///
/// Samples arrive as commitments: raw training data never reaches the
/// gateway.
#[derive(Debug, Deserialize)]
pub struct CreateDatasetRequest {
    pub dataset_id: String,
    pub split: DatasetSplit,
    pub metadata: DatasetMetadata,
    /// Hex-encoded per-sample commitments, in dataset order.
    pub samples: Vec<Commitment>,
}

/// Response body for anchor creation.
#[derive(Debug, Serialize)]
pub struct AnchorCreatedResponse {
    pub id: String,
    pub digest: Hash256,
}

/// `POST /datasets`
pub async fn create_dataset(
    State(state): State<SharedState>,
    Json(body): Json<CreateDatasetRequest>,
) -> Result<(StatusCode, Json<AnchorCreatedResponse>), ApiError> {
    let anchor = state
        .blocking(move |engine, _| {
            engine.registry.create_dataset_anchor(
                &body.dataset_id,
                body.split,
                body.metadata,
                body.samples,
            )
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(AnchorCreatedResponse {
            id: anchor.id.to_string(),
            digest: anchor.anchor_digest,
        }),
    ))
}

/// `POST /models`
pub async fn create_model(
    State(state): State<SharedState>,
    Json(spec): Json<ModelAnchorSpec>,
) -> Result<(StatusCode, Json<AnchorCreatedResponse>), ApiError> {
    let anchor = state
        .blocking(move |engine, _| engine.registry.create_model_anchor(spec))
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(AnchorCreatedResponse {
            id: anchor.id.to_string(),
            digest: anchor.model_digest,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct RetireModelRequest {
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct RetireModelResponse {
    pub id: String,
    pub retired: bool,
}

/// `POST /models/{id}/retire`
///
/// Idempotent; retiring an already retired model succeeds.
pub async fn retire_model(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<RetireModelRequest>,
) -> Result<Json<RetireModelResponse>, ApiError> {
    let model = ModelAnchorId::parse(&id)?;
    state
        .blocking(move |engine, _| engine.registry.retire_model_anchor(&model, &body.reason))
        .await?;
    Ok(Json(RetireModelResponse { id, retired: true }))
}

/// `GET /anchors/{id}`
///
/// `id` is either `{dataset}:{split}` or `{name}@{version}`.
pub async fn get_anchor(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Anchor>, ApiError> {
    let anchor = state.blocking(move |engine, _| engine.registry.get(&id)).await?;
    Ok(Json(anchor))
}

#[derive(Debug, Serialize)]
pub struct VerifyAnchorResponse {
    pub id: String,
    pub intact: bool,
}

/// `POST /anchors/{id}/verify`
///
/// Re-reads the anchor from storage and recomputes every digest. A damaged
/// anchor answers `409` with `intact: false`.
pub async fn verify_anchor(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<VerifyAnchorResponse>), ApiError> {
    let lookup = id.clone();
    let intact = state
        .blocking(move |engine, _| engine.registry.verify(&lookup))
        .await?;
    let status = if intact {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    Ok((status, Json(VerifyAnchorResponse { id, intact })))
}
