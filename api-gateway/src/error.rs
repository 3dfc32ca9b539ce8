//! Mapping engine errors onto HTTP responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use anchor::{EvidenceError, Outcome};

/// Error returned by every handler.
#[derive(Debug)]
pub enum ApiError {
    Engine(EvidenceError),
    /// The request body or path could not be interpreted.
    BadRequest(String),
    Internal(String),
}

impl From<EvidenceError> for ApiError {
    fn from(e: EvidenceError) -> Self {
        ApiError::Engine(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    outcome: &'static str,
}

/// HTTP status for a coarse engine outcome.
pub fn status_for(outcome: Outcome) -> StatusCode {
    match outcome {
        Outcome::Success => StatusCode::OK,
        Outcome::NotFound => StatusCode::NOT_FOUND,
        Outcome::VerificationFailed => StatusCode::UNPROCESSABLE_ENTITY,
        Outcome::IntegrityViolation => StatusCode::CONFLICT,
        Outcome::Rejected => StatusCode::BAD_REQUEST,
        Outcome::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn outcome_name(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Success => "success",
        Outcome::NotFound => "not_found",
        Outcome::VerificationFailed => "verification_failed",
        Outcome::IntegrityViolation => "integrity_violation",
        Outcome::Rejected => "rejected",
        Outcome::Unavailable => "unavailable",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, outcome, error) = match self {
            ApiError::Engine(e) => {
                let outcome = e.outcome();
                if outcome == Outcome::IntegrityViolation || outcome == Outcome::Unavailable {
                    tracing::warn!(outcome = outcome_name(outcome), "request failed: {e}");
                }
                (status_for(outcome), outcome_name(outcome), e.to_string())
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "rejected", msg),
            ApiError::Internal(msg) => {
                tracing::error!("internal error: {msg}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", msg)
            }
        };
        (status, Json(ErrorBody { error, outcome })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_statuses() {
        let cases = [
            (EvidenceError::NotFound("receipt/x".into()), StatusCode::NOT_FOUND),
            (EvidenceError::InvalidProof("bad path".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (EvidenceError::DuplicateAnchor("ds-A:train".into()), StatusCode::BAD_REQUEST),
            (EvidenceError::IncompleteEvidence("receipt/y".into()), StatusCode::CONFLICT),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }

    #[test]
    fn bad_request_is_400() {
        let response = ApiError::BadRequest("missing chain".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
