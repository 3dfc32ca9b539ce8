//! Inference receipts.
//!
//! One receipt is issued per served prediction. Receipts of the same chain
//! form a singly linked hash chain: every receipt digest covers the digest of
//! its predecessor (or [`Hash256::ZERO`] for the chain head), so removing,
//! reordering or editing any receipt breaks every later link.

use serde::{Deserialize, Serialize};

use super::{Commitment, Discrepancy, Hash256, ModelAnchorId, ReceiptId, canonical_bytes};

const RECEIPT_TAG: &str = "anchor/inference-receipt/v1";

/// Per-chain head state.
///
/// `Empty` corresponds to a chain that has no receipts yet; `Set` carries
/// everything needed to link and order the next receipt.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ChainHead {
    Empty,
    Set {
        sequence: u64,
        digest: Hash256,
        issued_at_ms: u64,
    },
}

impl ChainHead {
    /// Sequence number the next receipt will get.
    pub fn next_sequence(&self) -> u64 {
        match self {
            ChainHead::Empty => 0,
            ChainHead::Set { sequence, .. } => sequence + 1,
        }
    }

    /// Digest the next receipt must link to.
    pub fn link_digest(&self) -> Hash256 {
        match self {
            ChainHead::Empty => Hash256::ZERO,
            ChainHead::Set { digest, .. } => *digest,
        }
    }

    /// Earliest issue time the next receipt may carry.
    pub fn min_issued_at(&self) -> u64 {
        match self {
            ChainHead::Empty => 0,
            ChainHead::Set { issued_at_ms, .. } => *issued_at_ms,
        }
    }
}

/// Receipt for one served prediction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InferenceReceipt {
    pub id: ReceiptId,
    /// Model anchor that served the prediction.
    pub model_anchor: ModelAnchorId,
    /// Digest of that model anchor at issue time.
    pub model_digest: Hash256,
    pub input: Commitment,
    pub output: Commitment,
    /// Optional explanation artefacts (saliency maps, SHAP values, ...).
    pub explanations: Vec<Commitment>,
    /// Digest of the preceding receipt, or zero for the chain head.
    pub prev_digest: Hash256,
    /// Issue time in ms since the Unix epoch; non-decreasing per chain.
    pub issued_at_ms: u64,
    /// Digest over every field above.
    pub digest: Hash256,
}

/// Borrowed view of the digested receipt fields.
#[derive(Serialize)]
struct ReceiptPreimage<'a> {
    id: &'a ReceiptId,
    model_anchor: &'a ModelAnchorId,
    model_digest: &'a Hash256,
    input: &'a Commitment,
    output: &'a Commitment,
    explanations: &'a [Commitment],
    prev_digest: &'a Hash256,
    issued_at_ms: u64,
}

impl InferenceReceipt {
    /// Builds a receipt linked to `head` and computes its digest.
    #[allow(clippy::too_many_arguments)]
    pub fn issue(
        id: ReceiptId,
        model_anchor: ModelAnchorId,
        model_digest: Hash256,
        input: Commitment,
        output: Commitment,
        explanations: Vec<Commitment>,
        prev_digest: Hash256,
        issued_at_ms: u64,
    ) -> Self {
        let mut receipt = Self {
            id,
            model_anchor,
            model_digest,
            input,
            output,
            explanations,
            prev_digest,
            issued_at_ms,
            digest: Hash256::ZERO,
        };
        receipt.digest = receipt.compute_digest();
        receipt
    }

    pub fn compute_digest(&self) -> Hash256 {
        let preimage = ReceiptPreimage {
            id: &self.id,
            model_anchor: &self.model_anchor,
            model_digest: &self.model_digest,
            input: &self.input,
            output: &self.output,
            explanations: &self.explanations,
            prev_digest: &self.prev_digest,
            issued_at_ms: self.issued_at_ms,
        };
        Hash256::tagged(RECEIPT_TAG, &[&canonical_bytes(&preimage)])
    }

    /// Recomputes the self-digest and the head sentinel rule.
    pub fn check(&self) -> Result<(), Discrepancy> {
        if self.compute_digest() != self.digest {
            return Err(Discrepancy::ReceiptDigest);
        }
        if self.id.sequence == 0 && !self.prev_digest.is_zero() {
            return Err(Discrepancy::BadChainHead);
        }
        Ok(())
    }

    /// Head state after this receipt.
    pub fn as_head(&self) -> ChainHead {
        ChainHead::Set {
            sequence: self.id.sequence,
            digest: self.digest,
            issued_at_ms: self.issued_at_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitment::commit;
    use crate::types::ChainId;

    fn receipt(seq: u64, prev: Hash256) -> InferenceReceipt {
        InferenceReceipt::issue(
            ReceiptId::new(ChainId::new("m-v1-prod").unwrap(), seq),
            ModelAnchorId::new("m", "v1").unwrap(),
            Hash256([9u8; 32]),
            commit(b"input", None),
            commit(b"output", None),
            vec![],
            prev,
            1_700_000_000_000 + seq,
        )
    }

    #[test]
    fn receipt_digest_covers_predecessor() {
        let r0 = receipt(0, Hash256::ZERO);
        let r1 = receipt(1, r0.digest);
        let r1_forged = receipt(1, Hash256([7u8; 32]));
        assert_ne!(r1.digest, r1_forged.digest);
        assert!(r0.check().is_ok());
        assert!(r1.check().is_ok());
    }

    #[test]
    fn edited_receipt_fails_check() {
        let mut r = receipt(0, Hash256::ZERO);
        r.output = commit(b"other output", None);
        assert_eq!(r.check(), Err(Discrepancy::ReceiptDigest));
    }

    #[test]
    fn head_receipt_must_use_zero_sentinel() {
        let r = receipt(0, Hash256([1u8; 32]));
        assert_eq!(r.check(), Err(Discrepancy::BadChainHead));
    }

    #[test]
    fn chain_head_transitions() {
        assert_eq!(ChainHead::Empty.next_sequence(), 0);
        assert_eq!(ChainHead::Empty.link_digest(), Hash256::ZERO);
        let r = receipt(4, Hash256([3u8; 32]));
        let head = r.as_head();
        assert_eq!(head.next_sequence(), 5);
        assert_eq!(head.link_digest(), r.digest);
    }
}
