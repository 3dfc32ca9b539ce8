use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Deserialize;

use anchor::{
    AuditEvent, BatchId, EvidencePackage, EvidenceTarget, InclusionCheck, IntegrityReport,
    ReceiptId, Verdict,
};

use crate::error::ApiError;
use crate::state::SharedState;

/// Request body for `POST /verify`.
#[derive(Debug, Deserialize)]
pub struct VerifyInclusionRequest {
    /// `{chain}#{sequence}`
    pub receipt: String,
    /// `{chain}/{start}-{end}`
    pub batch: String,
}

/// `POST /verify`
///
/// Re-derives the receipt's inclusion proof from storage and checks it
/// against the signed batch root. A proof or signature that does not verify
/// answers `422`.
pub async fn verify_inclusion(
    State(state): State<SharedState>,
    Json(body): Json<VerifyInclusionRequest>,
) -> Result<Json<InclusionCheck>, ApiError> {
    let receipt = ReceiptId::parse(&body.receipt)?;
    let batch = BatchId::parse(&body.batch)?;
    let check = state
        .blocking(move |engine, _| engine.sealer.verify_inclusion(&receipt, &batch))
        .await?;
    Ok(Json(check))
}

/// `GET /materialize/{*id}`
///
/// Reconstructs the evidence package for any anchor, receipt or batch
/// identifier. Batch ids contain `/` and receipt ids a percent-encoded
/// `#`, hence the wildcard. A package whose verdict is `failed` is still
/// returned, with status `422`.
pub async fn materialize(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<EvidencePackage>), ApiError> {
    let target = EvidenceTarget::parse(id.trim_start_matches('/'))?;
    let package = state
        .blocking(move |engine, cancel| engine.materializer.materialize(&target, cancel))
        .await?;
    let status = match package.verdict {
        Verdict::Failed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        Verdict::Verified | Verdict::PendingSeal => StatusCode::OK,
    };
    Ok((status, Json(package)))
}

/// `POST /audit/scan`
///
/// Runs a full integrity scan. The report is returned either way; a scan
/// that found tampering answers `409`.
pub async fn integrity_scan(
    State(state): State<SharedState>,
) -> Result<(StatusCode, Json<IntegrityReport>), ApiError> {
    let report = state
        .blocking(|engine, cancel| engine.verifier.full_scan(cancel))
        .await?;
    let status = if report.tampered {
        StatusCode::CONFLICT
    } else {
        StatusCode::OK
    };
    Ok((status, Json(report)))
}

/// `GET /audit/{stream}`
///
/// Every readable event of one audit stream, in order.
pub async fn audit_events(
    State(state): State<SharedState>,
    Path(stream): Path<String>,
) -> Result<Json<Vec<AuditEvent>>, ApiError> {
    let events = state
        .blocking(move |engine, _| engine.audit.events(&stream))
        .await?;
    Ok(Json(events))
}
