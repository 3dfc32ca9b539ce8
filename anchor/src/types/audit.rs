//! Audit events.
//!
//! Audit events describe state-changing or security-relevant actions. They
//! use the same hash-chain construction as receipts, scoped per audit stream.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{Discrepancy, Hash256, canonical_bytes};

const AUDIT_EVENT_TAG: &str = "anchor/audit-event/v1";

/// What happened.
///
/// Externally tagged: event payloads are bincode-encoded, which cannot
/// decode internally tagged enums.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    AnchorCreated {
        anchor: String,
        digest: Hash256,
    },
    ModelRetired {
        model: String,
        reason: String,
    },
    BatchSealed {
        batch: String,
        root: Hash256,
    },
    BatchDeferred {
        batch: String,
        reason: String,
    },
    VerificationRun {
        records_checked: u64,
        failures: u64,
    },
    MaterializationRequested {
        target: String,
    },
    TamperDetected {
        key: String,
        discrepancy: Discrepancy,
    },
    InvalidProof {
        target: String,
        reason: String,
    },
}

impl fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditEventKind::AnchorCreated { anchor, .. } => write!(f, "anchor created: {anchor}"),
            AuditEventKind::ModelRetired { model, reason } => {
                write!(f, "model retired: {model} ({reason})")
            }
            AuditEventKind::BatchSealed { batch, .. } => write!(f, "batch sealed: {batch}"),
            AuditEventKind::BatchDeferred { batch, reason } => {
                write!(f, "batch deferred: {batch} ({reason})")
            }
            AuditEventKind::VerificationRun {
                records_checked,
                failures,
            } => write!(f, "verification run: {records_checked} checked, {failures} failed"),
            AuditEventKind::MaterializationRequested { target } => {
                write!(f, "materialization requested: {target}")
            }
            AuditEventKind::TamperDetected { key, discrepancy } => {
                write!(f, "tamper detected in {key}: {discrepancy}")
            }
            AuditEventKind::InvalidProof { target, reason } => {
                write!(f, "invalid proof for {target}: {reason}")
            }
        }
    }
}

/// One entry of an audit stream.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub stream: String,
    pub sequence: u64,
    pub kind: AuditEventKind,
    pub recorded_at_ms: u64,
    pub prev_digest: Hash256,
    pub digest: Hash256,
}

#[derive(Serialize)]
struct AuditPreimage<'a> {
    stream: &'a str,
    sequence: u64,
    kind: &'a AuditEventKind,
    recorded_at_ms: u64,
    prev_digest: &'a Hash256,
}

impl AuditEvent {
    pub fn new(
        stream: &str,
        sequence: u64,
        kind: AuditEventKind,
        recorded_at_ms: u64,
        prev_digest: Hash256,
    ) -> Self {
        let mut event = Self {
            stream: stream.to_string(),
            sequence,
            kind,
            recorded_at_ms,
            prev_digest,
            digest: Hash256::ZERO,
        };
        event.digest = event.compute_digest();
        event
    }

    /// Record id: `"{stream}#{sequence}"`.
    pub fn id(&self) -> String {
        format!("{}#{}", self.stream, self.sequence)
    }

    pub fn compute_digest(&self) -> Hash256 {
        let preimage = AuditPreimage {
            stream: &self.stream,
            sequence: self.sequence,
            kind: &self.kind,
            recorded_at_ms: self.recorded_at_ms,
            prev_digest: &self.prev_digest,
        };
        Hash256::tagged(AUDIT_EVENT_TAG, &[&canonical_bytes(&preimage)])
    }

    pub fn check(&self) -> Result<(), Discrepancy> {
        if self.compute_digest() != self.digest {
            return Err(Discrepancy::AuditDigest);
        }
        if self.sequence == 0 && !self.prev_digest.is_zero() {
            return Err(Discrepancy::BadChainHead);
        }
        Ok(())
    }
}
