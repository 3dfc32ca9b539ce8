//! Core domain types used by the evidence engine.
//!
//! This module defines strongly-typed hashes, commitments, identifiers and
//! signature material shared across the crate. As in the rest of the code
//! base, "naked" byte buffers and free-form strings are avoided in public
//! APIs in favour of domain-specific newtypes.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::EvidenceError;

/// Dataset and model anchors with their descriptors.
pub mod anchor;
/// Audit events.
pub mod audit;
/// Batch windows and signed batch roots.
pub mod batch;
/// Inference receipts and chain heads.
pub mod receipt;
/// The WORM record envelope.
pub mod record;

pub use anchor::{
    Anchor, ArchitectureDescriptor, AuthorizedDataset, DatasetAnchor, DatasetMetadata,
    DatasetSchema, DatasetSplit, EnvironmentDescriptor, FairnessDescriptor, FeatureField,
    HyperValue, HyperparameterSet, ModelAnchor, ModelAnchorSpec, QualityDescriptor,
};
pub use audit::{AuditEvent, AuditEventKind};
pub use batch::{BatchRoot, BatchWindow, PendingBatch, TimestampToken};
pub use receipt::{ChainHead, InferenceReceipt};
pub use record::{RecordType, WormRecord, record_key};

/// Length in bytes of all 256-bit hash types used in this module.
pub const HASH_LEN: usize = 32;

/// Strongly-typed 256-bit hash wrapper (BLAKE3-256).
///
/// Serialized as lowercase hex in human-readable formats (JSON) and as raw
/// bytes in binary formats (bincode), so canonical encodings stay compact.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Hash256(pub [u8; HASH_LEN]);

impl Hash256 {
    /// All-zero hash, used as the "no predecessor" sentinel in hash chains.
    pub const ZERO: Hash256 = Hash256([0u8; HASH_LEN]);

    /// Computes a new [`Hash256`] as the BLAKE3-256 hash of `data`.
    pub fn compute(data: &[u8]) -> Self {
        Hash256(*blake3::hash(data).as_bytes())
    }

    /// Computes a domain-separated hash over several parts.
    ///
    /// Each part is length-prefixed (little-endian `u64`) so that moving
    /// bytes from one part to the next always changes the digest.
    pub fn tagged(tag: &str, parts: &[&[u8]]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(tag.len() as u64).to_le_bytes());
        hasher.update(tag.as_bytes());
        for part in parts {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        Hash256(*hasher.finalize().as_bytes())
    }

    /// Returns the underlying 32-byte hash as a borrowed array.
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Lowercase hex, 64 characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, HashParseError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; HASH_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| HashParseError::Length(bytes.len()))?;
        Ok(Hash256(arr))
    }

    /// True for the [`Hash256::ZERO`] sentinel.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_LEN]
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Hash256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for Hash256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Hash256::from_hex(&s).map_err(serde::de::Error::custom)
        } else {
            <[u8; HASH_LEN]>::deserialize(deserializer).map(Hash256)
        }
    }
}

/// Error returned when parsing a hex-encoded [`Hash256`].
#[derive(Debug, thiserror::Error)]
pub enum HashParseError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("expected {HASH_LEN} bytes, got {0}")]
    Length(usize),
}

/// A commitment: the digest standing in for a payload that is not stored.
///
/// Commitments are value types. They are produced by
/// [`crate::commitment::commit`] / [`crate::commitment::commit_keyed`] or
/// supplied by the caller when the payload was committed elsewhere.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Commitment(pub Hash256);

impl Commitment {
    /// The committed digest.
    pub fn as_hash(&self) -> &Hash256 {
        &self.0
    }
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Ed25519 signature bytes over a batch root message.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "hex_bytes")] pub Vec<u8>);

impl Signature {
    /// Raw signature bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Ed25519 verifying key bytes.
///
/// This type does not validate the key material; verification code parses
/// it and treats malformed keys as a failed verification.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "hex_bytes")] pub Vec<u8>);

impl PublicKey {
    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lowercase hex of the key bytes.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Parses hex key bytes. The length is not checked here.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(s).map(PublicKey)
    }
}

/// Serde helper: hex in JSON, raw bytes in bincode.
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(bytes))
        } else {
            bytes.serialize(serializer)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            hex::decode(s).map_err(serde::de::Error::custom)
        } else {
            <Vec<u8>>::deserialize(deserializer)
        }
    }
}

/// Returns the canonical byte representation of `value`.
///
/// This uses **bincode 2** with the `standard()` configuration and the
/// `serde` integration. Every digest in the crate is computed over bytes
/// produced here, so the configuration must never change silently.
///
/// # Panics
///
/// Panics if encoding fails. All types passed here are closed structs of
/// serializable fields, so a failure is a programming error.
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Vec<u8> {
    let cfg = bincode::config::standard();
    bincode::serde::encode_to_vec(value, cfg)
        .expect("closed record types are always serializable with bincode 2 + serde")
}

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// On error (system clock before epoch) this falls back to 0.
pub fn now_millis() -> u64 {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}

/// Checks one identifier component against `[A-Za-z0-9._-]{1,128}`.
pub fn validate_component(kind: &'static str, value: &str) -> Result<(), EvidenceError> {
    let ok = !value.is_empty()
        && value.len() <= 128
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if ok {
        Ok(())
    } else {
        Err(EvidenceError::InvalidIdentifier {
            kind,
            value: value.to_string(),
        })
    }
}

/// Identifier of a dataset anchor: `"{dataset_id}:{split}"`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetAnchorId(String);

impl DatasetAnchorId {
    /// Builds the id from its parts, validating both.
    pub fn new(dataset_id: &str, split: &DatasetSplit) -> Result<Self, EvidenceError> {
        validate_component("dataset", dataset_id)?;
        let split = split.as_str();
        validate_component("split", split)?;
        Ok(Self(format!("{dataset_id}:{split}")))
    }

    /// Parses `"{dataset_id}:{split}"`.
    pub fn parse(s: &str) -> Result<Self, EvidenceError> {
        let invalid = || EvidenceError::InvalidIdentifier {
            kind: "dataset anchor",
            value: s.to_string(),
        };
        let (dataset, split) = s.split_once(':').ok_or_else(invalid)?;
        validate_component("dataset", dataset)?;
        validate_component("split", split)?;
        Ok(Self(s.to_string()))
    }

    /// The id as it appears in record keys.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatasetAnchorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a model anchor: `"{name}@{version}"`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelAnchorId(String);

impl ModelAnchorId {
    /// Builds `"{name}@{version}"`, validating both components.
    pub fn new(name: &str, version: &str) -> Result<Self, EvidenceError> {
        validate_component("model name", name)?;
        validate_component("model version", version)?;
        Ok(Self(format!("{name}@{version}")))
    }

    /// Parses and validates `"{name}@{version}"`.
    pub fn parse(s: &str) -> Result<Self, EvidenceError> {
        let (name, version) = s
            .split_once('@')
            .ok_or_else(|| EvidenceError::InvalidIdentifier {
                kind: "model anchor",
                value: s.to_string(),
            })?;
        Self::new(name, version)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelAnchorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one receipt chain (one deployed model instance).
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(String);

impl ChainId {
    /// Validates `s` as a single identifier component.
    pub fn new(s: &str) -> Result<Self, EvidenceError> {
        validate_component("chain", s)?;
        Ok(Self(s.to_string()))
    }

    /// Borrowed chain name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a receipt: `"{chain}#{sequence}"`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReceiptId {
    pub chain: ChainId,
    pub sequence: u64,
}

impl ReceiptId {
    /// Receipt `sequence` of `chain`.
    pub fn new(chain: ChainId, sequence: u64) -> Self {
        Self { chain, sequence }
    }

    /// Parses `"{chain}#{sequence}"`.
    pub fn parse(s: &str) -> Result<Self, EvidenceError> {
        let invalid = || EvidenceError::InvalidIdentifier {
            kind: "receipt",
            value: s.to_string(),
        };
        let (chain, seq) = s.split_once('#').ok_or_else(invalid)?;
        let sequence = seq.parse::<u64>().map_err(|_| invalid())?;
        Ok(Self::new(ChainId::new(chain)?, sequence))
    }
}

impl fmt::Display for ReceiptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.chain, self.sequence)
    }
}

/// Identifier of a sealed batch: `"{chain}/{start}-{end}"` (half-open range).
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchId {
    pub chain: ChainId,
    pub start: u64,
    pub end: u64,
}

impl BatchId {
    /// Window `[start, end)` of `chain`. The range is not checked.
    pub fn new(chain: ChainId, start: u64, end: u64) -> Self {
        Self { chain, start, end }
    }

    /// Parses `"{chain}/{start}-{end}"`. Empty windows are rejected.
    pub fn parse(s: &str) -> Result<Self, EvidenceError> {
        let invalid = || EvidenceError::InvalidIdentifier {
            kind: "batch",
            value: s.to_string(),
        };
        let (chain, range) = s.split_once('/').ok_or_else(invalid)?;
        let (start, end) = range.split_once('-').ok_or_else(invalid)?;
        let start = start.parse::<u64>().map_err(|_| invalid())?;
        let end = end.parse::<u64>().map_err(|_| invalid())?;
        if start >= end {
            return Err(invalid());
        }
        Ok(Self::new(ChainId::new(chain)?, start, end))
    }

    /// Number of receipts in the window.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// True when `start >= end`.
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Whether `sequence` falls inside the half-open window.
    pub fn contains(&self, sequence: u64) -> bool {
        (self.start..self.end).contains(&sequence)
    }

    /// Whether `[start, end)` shares at least one sequence with this window.
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}-{}", self.chain, self.start, self.end)
    }
}

/// What a materialization request points at.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EvidenceTarget {
    Dataset(DatasetAnchorId),
    Model(ModelAnchorId),
    Receipt(ReceiptId),
    Batch(BatchId),
}

impl EvidenceTarget {
    /// Resolves an identifier string by its separator.
    ///
    /// Identifier components never contain `#`, `@`, `:` or `/`, so the
    /// separator alone determines the record kind.
    pub fn parse(s: &str) -> Result<Self, EvidenceError> {
        if s.contains('#') {
            ReceiptId::parse(s).map(Self::Receipt)
        } else if s.contains('@') {
            ModelAnchorId::parse(s).map(Self::Model)
        } else if s.contains(':') {
            DatasetAnchorId::parse(s).map(Self::Dataset)
        } else if s.contains('/') {
            BatchId::parse(s).map(Self::Batch)
        } else {
            Err(EvidenceError::InvalidIdentifier {
                kind: "evidence target",
                value: s.to_string(),
            })
        }
    }
}

impl fmt::Display for EvidenceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvidenceTarget::Dataset(id) => id.fmt(f),
            EvidenceTarget::Model(id) => id.fmt(f),
            EvidenceTarget::Receipt(id) => id.fmt(f),
            EvidenceTarget::Batch(id) => id.fmt(f),
        }
    }
}

/// A specific inconsistency found while re-deriving a stored record.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Discrepancy {
    /// The envelope digest does not match the stored payload.
    EnvelopeDigest,
    /// The payload could not be decoded into its record type.
    Undecodable(String),
    /// The record is stored under a key that does not match its id.
    KeyMismatch { expected: String, actual: String },
    MetadataDigest,
    MerkleRoot,
    AnchorDigest,
    ModelDigest,
    ReceiptDigest,
    AuditDigest,
    /// `prev_digest` does not match the predecessor's digest.
    BrokenChainLink { predecessor: String },
    /// The first record of a chain does not carry the zero sentinel.
    BadChainHead,
    /// A record this one depends on is absent from the store.
    MissingReference(String),
    /// An authorized dataset no longer matches the digest pinned by the model.
    PinnedDigest(String),
    /// Recomputed batch root differs from the signed one.
    BatchRoot,
    Signature,
    UntrustedSigner,
}

impl fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Discrepancy::EnvelopeDigest => write!(f, "record digest mismatch"),
            Discrepancy::Undecodable(e) => write!(f, "undecodable payload: {e}"),
            Discrepancy::KeyMismatch { expected, actual } => {
                write!(f, "stored under {actual}, expected {expected}")
            }
            Discrepancy::MetadataDigest => write!(f, "metadata digest mismatch"),
            Discrepancy::MerkleRoot => write!(f, "sample Merkle root mismatch"),
            Discrepancy::AnchorDigest => write!(f, "anchor digest mismatch"),
            Discrepancy::ModelDigest => write!(f, "model digest mismatch"),
            Discrepancy::ReceiptDigest => write!(f, "receipt digest mismatch"),
            Discrepancy::AuditDigest => write!(f, "audit event digest mismatch"),
            Discrepancy::BrokenChainLink { predecessor } => {
                write!(f, "broken chain link to {predecessor}")
            }
            Discrepancy::BadChainHead => write!(f, "chain head does not carry the zero sentinel"),
            Discrepancy::MissingReference(key) => write!(f, "missing referenced record {key}"),
            Discrepancy::PinnedDigest(id) => write!(f, "dataset {id} differs from pinned digest"),
            Discrepancy::BatchRoot => write!(f, "batch Merkle root mismatch"),
            Discrepancy::Signature => write!(f, "batch signature invalid"),
            Discrepancy::UntrustedSigner => write!(f, "batch signed by an untrusted key"),
        }
    }
}
