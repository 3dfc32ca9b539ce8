//! Receipt batches and signed batch roots.
//!
//! Receipts accumulate into windows that are Merkle-rooted, timestamped and
//! signed. The resulting [`BatchRoot`] is an "anchor of anchors": a single
//! signature that covers every receipt in the window through inclusion
//! proofs.

use serde::{Deserialize, Serialize};

use super::{BatchId, Hash256, PublicKey, Signature, hex_bytes};

/// Window of receipts to seal.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchWindow {
    /// Receipts with sequence numbers in `[start, end)`.
    Sequence { start: u64, end: u64 },
    /// Receipts whose issue time falls in `[from_ms, until_ms)`.
    Time { from_ms: u64, until_ms: u64 },
}

/// Timestamp returned by a timestamp authority for a batch root.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TimestampToken {
    /// Attested time in ms since the Unix epoch.
    pub unix_ms: u64,
    /// Name of the authority that produced the token.
    pub authority: String,
    /// Opaque authority response (e.g. an RFC 3161 token). Empty for the
    /// local clock.
    #[serde(with = "hex_bytes")]
    pub token: Vec<u8>,
}

impl TimestampToken {
    pub fn token_digest(&self) -> Hash256 {
        Hash256::compute(&self.token)
    }
}

/// Signed Merkle root over one window of a receipt chain.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BatchRoot {
    pub id: BatchId,
    /// Number of receipts under the root (`id.end - id.start`).
    pub receipt_count: u64,
    /// Merkle root over the receipt digests in chain order.
    pub root: Hash256,
    pub timestamp: TimestampToken,
    pub signature: Signature,
    /// Key the batch was signed with.
    pub public_key: PublicKey,
}

/// A window whose root is computed but could not be signed yet.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PendingBatch {
    pub id: BatchId,
    pub root: Hash256,
    pub deferred_at_ms: u64,
    /// Last error reported by the signer / timestamp authority.
    pub reason: String,
    pub attempts: u32,
}
