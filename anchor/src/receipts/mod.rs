//! Inference receipt chains and their batch roll-up.
//!
//! [`ReceiptChainManager`] issues hash-linked receipts, one chain per
//! deployed model instance. [`BatchSealer`] rolls windows of a chain into
//! Merkle roots signed by the [`crate::signer::RootSigner`].

use crate::error::EvidenceError;
use crate::storage::{WormStore, fetch};
use crate::types::{ChainId, InferenceReceipt, ReceiptId, record::receipt_key};

pub mod batch;
pub mod chain;

pub use batch::{
    BatchSealer, InclusionCheck, RetryReport, SealOutcome, batch_for_receipt, check_inclusion,
};
pub use chain::ReceiptChainManager;

/// Reads and checks one stored receipt.
pub fn load_receipt<S: WormStore + ?Sized>(
    store: &S,
    id: &ReceiptId,
) -> Result<InferenceReceipt, EvidenceError> {
    let key = receipt_key(id);
    let receipt: InferenceReceipt = fetch(store, &key)?;
    receipt
        .check()
        .map_err(|discrepancy| EvidenceError::TamperDetected { key, discrepancy })?;
    Ok(receipt)
}

/// Receipts `[start, end)` of `chain` in chain order.
///
/// A missing sequence number is [`EvidenceError::IncompleteEvidence`];
/// nothing is ever filled in.
pub fn load_window<S: WormStore + ?Sized>(
    store: &S,
    chain: &ChainId,
    start: u64,
    end: u64,
) -> Result<Vec<InferenceReceipt>, EvidenceError> {
    let mut receipts = Vec::with_capacity(end.saturating_sub(start) as usize);
    for sequence in start..end {
        let id = ReceiptId::new(chain.clone(), sequence);
        match load_receipt(store, &id) {
            Ok(receipt) => receipts.push(receipt),
            Err(EvidenceError::NotFound(key)) => return Err(EvidenceError::IncompleteEvidence(key)),
            Err(e) => return Err(e),
        }
    }
    Ok(receipts)
}
