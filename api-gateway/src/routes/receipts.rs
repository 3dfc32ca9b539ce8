use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};

use anchor::{
    ChainHead, ChainId, Commitment, EvidenceError, InferenceReceipt, ModelAnchorId, ReceiptId,
};

use crate::error::ApiError;
use crate::state::SharedState;

/// Request body for `POST /receipts`.
///
/// Inputs, outputs and explanation artifacts are committed by the caller;
/// the gateway only sees their hex-encoded commitments.
#[derive(Debug, Deserialize)]
pub struct IssueReceiptRequest {
    pub chain: String,
    pub model: String,
    pub input: Commitment,
    pub output: Commitment,
    #[serde(default)]
    pub explanations: Vec<Commitment>,
}

/// `POST /receipts`
///
/// Appends a receipt to `chain`. Returns once the receipt is durable; it is
/// rolled into a signed batch root later.
pub async fn issue_receipt(
    State(state): State<SharedState>,
    Json(body): Json<IssueReceiptRequest>,
) -> Result<(StatusCode, Json<InferenceReceipt>), ApiError> {
    let chain = ChainId::new(&body.chain)?;
    let model = ModelAnchorId::parse(&body.model)?;
    let receipt = state
        .blocking(move |engine, _| {
            engine
                .receipts
                .issue(&chain, &model, body.input, body.output, body.explanations)
        })
        .await?;

    tracing::debug!(receipt = %receipt.id, "receipt issued via API");
    Ok((StatusCode::CREATED, Json(receipt)))
}

/// `GET /receipts/{id}`
///
/// `id` is `{chain}#{sequence}`; the `#` must be sent percent-encoded.
pub async fn get_receipt(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<InferenceReceipt>, ApiError> {
    let id = ReceiptId::parse(&id)?;
    let receipt = state
        .blocking(move |engine, _| engine.receipts.receipt(&id))
        .await?;
    Ok(Json(receipt))
}

#[derive(Debug, Serialize)]
pub struct ChainSummary {
    pub chain: ChainId,
    pub head: ChainHead,
    pub model: Option<ModelAnchorId>,
}

/// `GET /chains`
///
/// Every receipt chain the engine knows, with its current head.
pub async fn list_chains(
    State(state): State<SharedState>,
) -> Result<Json<Vec<ChainSummary>>, ApiError> {
    let chains = state
        .blocking(|engine, _| {
            engine
                .chains()?
                .into_iter()
                .map(|chain| -> Result<ChainSummary, EvidenceError> {
                    Ok(ChainSummary {
                        head: engine.receipts.head(&chain)?,
                        model: engine.receipts.bound_model(&chain)?,
                        chain,
                    })
                })
                .collect()
        })
        .await?;
    Ok(Json(chains))
}
