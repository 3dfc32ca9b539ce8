//! Error taxonomy for the evidence engine.
//!
//! Every fallible operation in the crate returns [`EvidenceError`] (or one of
//! the layer-specific errors that convert into it). Structural errors such as
//! [`EvidenceError::DuplicateAnchor`] are ordinary, recoverable results; the
//! integrity-related variants ([`EvidenceError::TamperDetected`],
//! [`EvidenceError::InvalidProof`]) are additionally recorded in the audit log
//! by the component that detects them.

use thiserror::Error;

use crate::merkle::MerkleError;
use crate::signer::SignerError;
use crate::storage::StorageError;
use crate::types::Discrepancy;

/// Coarse result classification shared by the HTTP gateway and the binary.
///
/// External tooling only needs to distinguish a handful of outcomes; the
/// detailed error is still available for logs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    Success,
    NotFound,
    VerificationFailed,
    IntegrityViolation,
    /// The request itself was malformed or conflicts with existing state.
    Rejected,
    /// A collaborator (storage, timestamp authority) is unavailable.
    Unavailable,
}

impl Outcome {
    /// Process exit code used by the `anchor` binary.
    pub fn exit_code(self) -> i32 {
        match self {
            Outcome::Success => 0,
            Outcome::Rejected => 1,
            Outcome::NotFound => 2,
            Outcome::VerificationFailed => 3,
            Outcome::IntegrityViolation => 4,
            Outcome::Unavailable => 5,
        }
    }
}

/// Top-level error type of the evidence engine.
#[derive(Debug, Error)]
pub enum EvidenceError {
    /// An anchor with the same identity has already been written.
    #[error("duplicate anchor: {0}")]
    DuplicateAnchor(String),

    /// A model anchor references a dataset anchor that does not exist.
    #[error("unknown dataset anchor: {0}")]
    UnknownDatasetAnchor(String),

    /// A receipt references a model anchor that does not exist or is retired.
    #[error("unknown or retired model anchor: {0}")]
    UnknownModelAnchor(String),

    /// Plain lookup miss.
    #[error("not found: {0}")]
    NotFound(String),

    /// A recomputed digest does not match the stored one.
    #[error("tamper detected in {key}: {discrepancy}")]
    TamperDetected {
        key: String,
        discrepancy: Discrepancy,
    },

    /// Materialization could not locate a record it depends on.
    #[error("incomplete evidence: missing {0}")]
    IncompleteEvidence(String),

    /// A Merkle inclusion proof failed to verify.
    #[error("invalid proof: {0}")]
    InvalidProof(String),

    /// A batch signature did not verify against the declared public key.
    #[error("invalid signature on {0}")]
    SignatureInvalid(String),

    /// The signer refused a timestamp earlier than the previous batch.
    #[error("stale timestamp for chain {chain}: {requested} < {previous}")]
    StaleTimestamp {
        chain: String,
        previous: u64,
        requested: u64,
    },

    /// Two issuers raced on the same chain head and the retry also lost.
    #[error("concurrent write on chain {0}")]
    ConcurrentChainWrite(String),

    /// A chain is bound to a different model anchor than the one requested.
    #[error("chain {chain} is bound to model {bound}, not {requested}")]
    ChainModelMismatch {
        chain: String,
        bound: String,
        requested: String,
    },

    /// The requested window overlaps an already sealed (or pending) window.
    #[error("batch window already sealed: {0}")]
    BatchAlreadySealed(String),

    /// The requested window contains no receipts.
    #[error("batch window for chain {0} contains no receipts")]
    EmptyWindow(String),

    /// An identifier component contains characters outside `[A-Za-z0-9._-]`.
    #[error("invalid {kind} identifier: {value:?}")]
    InvalidIdentifier { kind: &'static str, value: String },

    /// A long-running read was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// An in-memory lock was poisoned by a panicking thread.
    #[error("lock poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error(transparent)]
    Merkle(#[from] MerkleError),

    #[error(transparent)]
    Storage(StorageError),

    #[error(transparent)]
    Signer(SignerError),
}

impl From<StorageError> for EvidenceError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(key) => EvidenceError::NotFound(key),
            other => EvidenceError::Storage(other),
        }
    }
}

impl From<SignerError> for EvidenceError {
    fn from(e: SignerError) -> Self {
        match e {
            SignerError::StaleTimestamp {
                chain,
                previous,
                requested,
            } => EvidenceError::StaleTimestamp {
                chain,
                previous,
                requested,
            },
            other => EvidenceError::Signer(other),
        }
    }
}

impl EvidenceError {
    /// Maps this error onto the coarse [`Outcome`] taxonomy.
    pub fn outcome(&self) -> Outcome {
        match self {
            EvidenceError::NotFound(_)
            | EvidenceError::UnknownDatasetAnchor(_)
            | EvidenceError::UnknownModelAnchor(_) => Outcome::NotFound,
            EvidenceError::InvalidProof(_)
            | EvidenceError::SignatureInvalid(_)
            | EvidenceError::StaleTimestamp { .. } => Outcome::VerificationFailed,
            EvidenceError::TamperDetected { .. } | EvidenceError::IncompleteEvidence(_) => {
                Outcome::IntegrityViolation
            }
            EvidenceError::Signer(SignerError::Unavailable(_)) | EvidenceError::Storage(_) => {
                Outcome::Unavailable
            }
            EvidenceError::DuplicateAnchor(_)
            | EvidenceError::ConcurrentChainWrite(_)
            | EvidenceError::ChainModelMismatch { .. }
            | EvidenceError::BatchAlreadySealed(_)
            | EvidenceError::EmptyWindow(_)
            | EvidenceError::InvalidIdentifier { .. }
            | EvidenceError::Cancelled
            | EvidenceError::LockPoisoned(_)
            | EvidenceError::Merkle(_)
            | EvidenceError::Signer(_) => Outcome::Rejected,
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for EvidenceError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        EvidenceError::LockPoisoned("evidence engine state")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_not_found_becomes_plain_not_found() {
        let err: EvidenceError = StorageError::NotFound("receipt/x".to_string()).into();
        assert!(matches!(err, EvidenceError::NotFound(ref k) if k == "receipt/x"));
        assert_eq!(err.outcome(), Outcome::NotFound);
    }

    #[test]
    fn stale_timestamp_is_lifted_out_of_signer_error() {
        let err: EvidenceError = SignerError::StaleTimestamp {
            chain: "c".to_string(),
            previous: 10,
            requested: 5,
        }
        .into();
        assert!(matches!(err, EvidenceError::StaleTimestamp { previous: 10, .. }));
        assert_eq!(err.outcome(), Outcome::VerificationFailed);
    }

    #[test]
    fn outcomes_have_distinct_exit_codes() {
        let codes = [
            Outcome::Success,
            Outcome::Rejected,
            Outcome::NotFound,
            Outcome::VerificationFailed,
            Outcome::IntegrityViolation,
            Outcome::Unavailable,
        ]
        .map(Outcome::exit_code);
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
