//! The WORM record envelope.
//!
//! A [`WormRecord`] is the physical persistence unit. It wraps the canonical
//! bincode encoding of a typed payload together with the record type, the
//! record id, a creation timestamp and a digest over all of them. Storage
//! backends only ever see envelopes; they never interpret payloads.
//!
//! Keys are `"{record_type}/{suffix}"` where the suffix is derived from the
//! record id (see [`record_key`]). Sequence numbers are zero-padded to 20
//! digits so that lexicographic key order equals chain order.

use std::fmt;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use super::{
    BatchId, DatasetAnchorId, Discrepancy, Hash256, ModelAnchorId, ReceiptId, hex_bytes,
    validate_component,
};
use crate::error::EvidenceError;

const RECORD_TAG: &str = "anchor/worm-record/v1";

/// Type tag of a persisted record.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    DatasetAnchor,
    ModelAnchor,
    Receipt,
    BatchRoot,
    AuditEvent,
}

impl RecordType {
    /// All record types in dependency order (datasets before models before
    /// receipts before batch roots; audit events last).
    pub const ALL: [RecordType; 5] = [
        RecordType::DatasetAnchor,
        RecordType::ModelAnchor,
        RecordType::Receipt,
        RecordType::BatchRoot,
        RecordType::AuditEvent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::DatasetAnchor => "dataset_anchor",
            RecordType::ModelAnchor => "model_anchor",
            RecordType::Receipt => "receipt",
            RecordType::BatchRoot => "batch_root",
            RecordType::AuditEvent => "audit_event",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        RecordType::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Record type encoded in a storage key's first path segment.
    pub fn of_key(key: &str) -> Option<Self> {
        key.split_once('/').and_then(|(prefix, _)| Self::parse(prefix))
    }

    /// Key prefix shared by every record of this type.
    pub fn prefix(&self) -> String {
        format!("{}/", self.as_str())
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) fn dataset_key(id: &DatasetAnchorId) -> String {
    format!("dataset_anchor/{id}")
}

pub(crate) fn model_key(id: &ModelAnchorId) -> String {
    format!("model_anchor/{id}")
}

pub(crate) fn receipt_key(id: &ReceiptId) -> String {
    format!("receipt/{}/{:020}", id.chain, id.sequence)
}

/// Prefix of every receipt key of one chain.
pub(crate) fn receipt_chain_prefix(chain: &str) -> String {
    format!("receipt/{chain}/")
}

pub(crate) fn batch_key(id: &BatchId) -> String {
    format!("batch_root/{}/{:020}-{:020}", id.chain, id.start, id.end)
}

pub(crate) fn batch_chain_prefix(chain: &str) -> String {
    format!("batch_root/{chain}/")
}

pub(crate) fn audit_key(stream: &str, sequence: u64) -> String {
    format!("audit_event/{stream}/{sequence:020}")
}

pub(crate) fn audit_stream_prefix(stream: &str) -> String {
    format!("audit_event/{stream}/")
}

/// Derives the storage key for a record id of the given type.
pub fn record_key(record_type: RecordType, id: &str) -> Result<String, EvidenceError> {
    match record_type {
        RecordType::DatasetAnchor => DatasetAnchorId::parse(id).map(|id| dataset_key(&id)),
        RecordType::ModelAnchor => ModelAnchorId::parse(id).map(|id| model_key(&id)),
        RecordType::Receipt => ReceiptId::parse(id).map(|id| receipt_key(&id)),
        RecordType::BatchRoot => BatchId::parse(id).map(|id| batch_key(&id)),
        RecordType::AuditEvent => {
            let invalid = || EvidenceError::InvalidIdentifier {
                kind: "audit event",
                value: id.to_string(),
            };
            let (stream, seq) = id.split_once('#').ok_or_else(invalid)?;
            validate_component("audit stream", stream)?;
            let seq = seq.parse::<u64>().map_err(|_| invalid())?;
            Ok(audit_key(stream, seq))
        }
    }
}

/// Persisted envelope of one record.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct WormRecord {
    pub record_type: RecordType,
    pub id: String,
    /// Canonical bincode encoding of the typed payload.
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// Digest over type, id, creation time and payload.
    pub digest: Hash256,
}

impl WormRecord {
    /// Encodes `payload` and seals it into a new envelope.
    pub fn seal<T: Serialize>(record_type: RecordType, id: impl Into<String>, payload: &T) -> Self {
        let created_at = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        Self::seal_at(record_type, id, payload, created_at)
    }

    pub fn seal_at<T: Serialize>(
        record_type: RecordType,
        id: impl Into<String>,
        payload: &T,
        created_at: String,
    ) -> Self {
        let mut record = Self {
            record_type,
            id: id.into(),
            payload: super::canonical_bytes(payload),
            created_at,
            digest: Hash256::ZERO,
        };
        record.digest = record.compute_digest();
        record
    }

    pub fn compute_digest(&self) -> Hash256 {
        Hash256::tagged(
            RECORD_TAG,
            &[
                self.record_type.as_str().as_bytes(),
                self.id.as_bytes(),
                self.created_at.as_bytes(),
                &self.payload,
            ],
        )
    }

    /// `true` when the stored digest matches the envelope contents.
    pub fn is_intact(&self) -> bool {
        self.compute_digest() == self.digest
    }

    /// Decodes the payload, rejecting trailing bytes.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Discrepancy> {
        let cfg = bincode::config::standard();
        let (value, read): (T, usize) = bincode::serde::decode_from_slice(&self.payload, cfg)
            .map_err(|e| Discrepancy::Undecodable(e.to_string()))?;
        if read != self.payload.len() {
            return Err(Discrepancy::Undecodable(format!(
                "{} trailing bytes",
                self.payload.len() - read
            )));
        }
        Ok(value)
    }

    /// Checks the envelope digest and that `key` is where this record belongs.
    pub fn check_envelope(&self, key: &str) -> Result<(), Discrepancy> {
        if !self.is_intact() {
            return Err(Discrepancy::EnvelopeDigest);
        }
        let expected = record_key(self.record_type, &self.id)
            .map_err(|e| Discrepancy::Undecodable(e.to_string()))?;
        if expected != key {
            return Err(Discrepancy::KeyMismatch {
                expected,
                actual: key.to_string(),
            });
        }
        Ok(())
    }

    /// Envelope check followed by a typed decode.
    pub fn open<T: DeserializeOwned>(&self, key: &str) -> Result<T, Discrepancy> {
        self.check_envelope(key)?;
        self.decode()
    }

    /// Renders the logical JSON envelope with a typed payload.
    pub fn to_envelope_json<T: DeserializeOwned + Serialize>(
        &self,
    ) -> Result<serde_json::Value, Discrepancy> {
        let payload: T = self.decode()?;
        Ok(serde_json::json!({
            "record_type": self.record_type,
            "id": self.id,
            "payload": payload,
            "digest": self.digest,
            "created_at": self.created_at,
        }))
    }
}
