//! Batch sealing: Merkle roots over receipt windows, timestamped and signed.
//!
//! Sealing never blocks issuance. When the timestamp authority cannot be
//! reached the window's root is kept as a [`PendingBatch`] and re-attempted
//! by [`BatchSealer::retry_pending`]. Pending windows live in memory only;
//! after a restart their receipts are simply unsealed again and the next
//! [`BatchSealer::seal_next`] picks them up.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use super::{ReceiptChainManager, load_receipt, load_window};
use crate::audit::{AuditLog, RECEIPTS_STREAM};
use crate::error::EvidenceError;
use crate::merkle::{MerkleProof, MerkleTree};
use crate::metrics::EvidenceMetrics;
use crate::signer::{RootSigner, SignerError, verify_signature};
use crate::storage::{StorageError, WormStore, fetch};
use crate::types::{
    AuditEventKind, BatchId, BatchRoot, BatchWindow, ChainId, Hash256, InferenceReceipt,
    PendingBatch, ReceiptId, RecordType, WormRecord, now_millis,
    record::{batch_chain_prefix, batch_key, receipt_chain_prefix},
};

/// Result of a seal attempt that did not fail outright.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SealOutcome {
    Sealed(BatchRoot),
    /// The timestamp authority was unavailable; the window is pending.
    Deferred(PendingBatch),
}

/// Result of [`BatchSealer::retry_pending`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    pub sealed: Vec<BatchId>,
    pub still_pending: usize,
}

/// Everything needed to check one receipt against one batch root.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InclusionCheck {
    pub receipt: InferenceReceipt,
    pub batch: BatchRoot,
    pub proof: MerkleProof,
    /// The proof recomputes the signed root.
    pub proof_valid: bool,
    /// The root signature verifies against the stored public key.
    pub signature_valid: bool,
}

impl InclusionCheck {
    pub fn is_valid(&self) -> bool {
        self.proof_valid && self.signature_valid
    }
}

/// Re-derives the inclusion proof of `receipt_id` in `batch_id` purely from
/// stored records. Does not record anything.
///
/// A receipt outside the batch window is [`EvidenceError::InvalidProof`]; a
/// missing receipt of the window is [`EvidenceError::IncompleteEvidence`].
pub fn check_inclusion<S: WormStore + ?Sized>(
    store: &S,
    receipt_id: &ReceiptId,
    batch_id: &BatchId,
) -> Result<InclusionCheck, EvidenceError> {
    if receipt_id.chain != batch_id.chain || !batch_id.contains(receipt_id.sequence) {
        return Err(EvidenceError::InvalidProof(format!(
            "{receipt_id} is not in window {batch_id}"
        )));
    }
    let batch: BatchRoot = fetch(store, &batch_key(batch_id))?;
    let receipt = load_receipt(store, receipt_id)?;
    let window = load_window(store, &batch_id.chain, batch_id.start, batch_id.end)?;

    let leaves: Vec<Hash256> = window.iter().map(|r| r.digest).collect();
    let proof = MerkleTree::build(&leaves)?.prove(receipt_id.sequence - batch_id.start)?;
    let proof_valid = proof.verify(&receipt.digest, &batch.root)?;
    let signature_valid = verify_signature(
        &batch.id.chain,
        &batch.root,
        &batch.timestamp,
        &batch.signature,
        &batch.public_key,
    );
    Ok(InclusionCheck {
        receipt,
        batch,
        proof,
        proof_valid,
        signature_valid,
    })
}

/// Batch covering `receipt` according to the stored batch roots, if any.
pub fn batch_for_receipt<S: WormStore + ?Sized>(
    store: &S,
    receipt: &ReceiptId,
) -> Result<Option<BatchId>, EvidenceError> {
    for id in stored_windows(store, &receipt.chain)? {
        if id.contains(receipt.sequence) {
            return Ok(Some(id));
        }
    }
    Ok(None)
}

/// Windows of every batch root stored for `chain`, in key order.
///
/// Ranges are taken from the keys so that a damaged payload still blocks
/// its window.
fn stored_windows<S: WormStore + ?Sized>(
    store: &S,
    chain: &ChainId,
) -> Result<Vec<BatchId>, EvidenceError> {
    let mut windows = Vec::new();
    for item in store.list_prefix(RecordType::BatchRoot, &batch_chain_prefix(chain.as_str())) {
        let key = match item {
            Ok((key, _)) => key,
            Err(StorageError::Codec { key, .. }) => key,
            Err(e) => return Err(e.into()),
        };
        let range = key.rsplit('/').next().and_then(|r| r.split_once('-'));
        let parsed = range.and_then(|(s, e)| Some((s.parse::<u64>().ok()?, e.parse::<u64>().ok()?)));
        let Some((start, end)) = parsed else {
            tracing::warn!(%key, "ignoring batch root with malformed key");
            continue;
        };
        windows.push(BatchId::new(chain.clone(), start, end));
    }
    Ok(windows)
}

#[derive(Debug, Default)]
struct SealState {
    loaded: bool,
    sealed: Vec<BatchId>,
    /// Pending windows keyed by start sequence.
    pending: BTreeMap<u64, PendingBatch>,
}

impl SealState {
    fn conflicts(&self, start: u64, end: u64) -> bool {
        self.sealed.iter().any(|id| id.overlaps(start, end))
            || self.pending.values().any(|p| p.id.overlaps(start, end))
    }

    /// Sealed and pending windows as `(start, end)`, ordered by start.
    fn covered(&self) -> Vec<(u64, u64)> {
        let sealed = self.sealed.iter().map(|id| (id.start, id.end));
        let pending = self.pending.values().map(|p| (p.id.start, p.id.end));
        let mut ranges: Vec<(u64, u64)> = sealed.chain(pending).collect();
        ranges.sort_unstable();
        ranges
    }

    /// Lowest sequence number not covered by a sealed or pending window,
    /// with the start of the next covered window after it, if any.
    fn next_gap(&self) -> (u64, Option<u64>) {
        let mut start = 0;
        for (s, e) in self.covered() {
            if s > start {
                return (start, Some(s));
            }
            start = start.max(e);
        }
        (start, None)
    }
}

/// Rolls receipt windows into signed batch roots.
pub struct BatchSealer<S: ?Sized> {
    store: Arc<S>,
    receipts: Arc<ReceiptChainManager<S>>,
    signer: Arc<RootSigner>,
    audit: Arc<AuditLog<S>>,
    metrics: EvidenceMetrics,
    chains: Mutex<HashMap<ChainId, Arc<Mutex<SealState>>>>,
}

impl<S: WormStore + ?Sized> BatchSealer<S> {
    pub fn new(
        store: Arc<S>,
        receipts: Arc<ReceiptChainManager<S>>,
        signer: Arc<RootSigner>,
        audit: Arc<AuditLog<S>>,
        metrics: EvidenceMetrics,
    ) -> Self {
        Self {
            store,
            receipts,
            signer,
            audit,
            metrics,
            chains: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, chain: &ChainId) -> Result<Arc<Mutex<SealState>>, EvidenceError> {
        let mut chains = self.chains.lock()?;
        Ok(chains.entry(chain.clone()).or_default().clone())
    }

    fn ensure_loaded(&self, chain: &ChainId, state: &mut SealState) -> Result<(), EvidenceError> {
        if !state.loaded {
            state.sealed = stored_windows(self.store.as_ref(), chain)?;
            state.loaded = true;
        }
        Ok(())
    }

    /// Seals `window` of `chain`.
    ///
    /// Returns [`SealOutcome::Deferred`] rather than an error when the
    /// timestamp authority is unavailable.
    pub fn seal_batch(
        &self,
        chain: &ChainId,
        window: BatchWindow,
    ) -> Result<SealOutcome, EvidenceError> {
        let slot = self.slot(chain)?;
        let mut state = slot.lock()?;
        self.ensure_loaded(chain, &mut state)?;

        let (start, end) = match window {
            BatchWindow::Sequence { start, end } => (start, end),
            BatchWindow::Time { from_ms, until_ms } => self.resolve_time_window(chain, from_ms, until_ms)?,
        };
        self.seal_locked(&mut state, chain, start, end)
    }

    /// Seals the next unsealed window of at most `max_receipts` receipts.
    ///
    /// Returns `None` when every issued receipt is already sealed or pending.
    pub fn seal_next(
        &self,
        chain: &ChainId,
        max_receipts: u64,
    ) -> Result<Option<SealOutcome>, EvidenceError> {
        let slot = self.slot(chain)?;
        let mut state = slot.lock()?;
        self.ensure_loaded(chain, &mut state)?;

        let (start, covered_from) = state.next_gap();
        let available = self.receipts.head(chain)?.next_sequence();
        if available <= start || max_receipts == 0 {
            return Ok(None);
        }
        let mut end = available.min(start.saturating_add(max_receipts));
        if let Some(limit) = covered_from {
            end = end.min(limit);
        }
        self.seal_locked(&mut state, chain, start, end).map(Some)
    }

    /// Receipts issued in `[from_ms, until_ms)`, as a sequence range.
    ///
    /// Issue times never decrease along a chain, so the matching receipts
    /// are contiguous.
    fn resolve_time_window(
        &self,
        chain: &ChainId,
        from_ms: u64,
        until_ms: u64,
    ) -> Result<(u64, u64), EvidenceError> {
        let mut range: Option<(u64, u64)> = None;
        for item in self
            .store
            .list_prefix(RecordType::Receipt, &receipt_chain_prefix(chain.as_str()))
        {
            let (key, record) = item?;
            let receipt = record
                .open::<InferenceReceipt>(&key)
                .map_err(|discrepancy| EvidenceError::TamperDetected {
                    key: key.clone(),
                    discrepancy,
                });
            let receipt = self.audit.surface(RECEIPTS_STREAM, receipt)?;
            if receipt.issued_at_ms >= until_ms {
                break;
            }
            if receipt.issued_at_ms >= from_ms {
                let seq = receipt.id.sequence;
                range = Some(range.map_or((seq, seq + 1), |(s, _)| (s, seq + 1)));
            }
        }
        range.ok_or_else(|| EvidenceError::EmptyWindow(chain.to_string()))
    }

    fn seal_locked(
        &self,
        state: &mut SealState,
        chain: &ChainId,
        start: u64,
        end: u64,
    ) -> Result<SealOutcome, EvidenceError> {
        if start >= end {
            return Err(EvidenceError::EmptyWindow(chain.to_string()));
        }
        let id = BatchId::new(chain.clone(), start, end);
        if state.conflicts(start, end) {
            return Err(EvidenceError::BatchAlreadySealed(id.to_string()));
        }
        if self.receipts.head(chain)?.next_sequence() <= start {
            return Err(EvidenceError::EmptyWindow(chain.to_string()));
        }

        let receipts = self.audit.surface(
            RECEIPTS_STREAM,
            load_window(self.store.as_ref(), chain, start, end),
        )?;
        let leaves: Vec<Hash256> = receipts.iter().map(|r| r.digest).collect();
        let root = MerkleTree::build(&leaves)?.root();
        self.sign_and_store(state, id, root, 0)
    }

    /// Timestamps, signs and persists `root`, or parks it as pending.
    fn sign_and_store(
        &self,
        state: &mut SealState,
        id: BatchId,
        root: Hash256,
        attempts: u32,
    ) -> Result<SealOutcome, EvidenceError> {
        let timer = self.metrics.seal_seconds.start_timer();
        let timestamp = match self.signer.timestamp(&root) {
            Ok(timestamp) => timestamp,
            Err(SignerError::Unavailable(reason)) => {
                timer.stop_and_discard();
                return Ok(SealOutcome::Deferred(self.defer(state, id, root, attempts, reason)));
            }
            Err(e) => return Err(e.into()),
        };
        let signature = self.signer.sign_root_uncommitted(&id.chain, &root, &timestamp)?;

        let batch = BatchRoot {
            id: id.clone(),
            receipt_count: id.len(),
            root,
            timestamp,
            signature,
            public_key: self.signer.public_key(),
        };
        let record = WormRecord::seal(RecordType::BatchRoot, id.to_string(), &batch);
        match self.store.put(&batch_key(&id), &record) {
            Ok(()) => {}
            Err(StorageError::AlreadyExists(_)) => {
                return Err(EvidenceError::BatchAlreadySealed(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        self.signer.restore_watermark(&id.chain, batch.timestamp.unix_ms)?;
        timer.observe_duration();

        state.sealed.push(id.clone());
        if state.pending.remove(&id.start).is_some() {
            self.metrics.pending_unsigned_batches.dec();
        }
        self.metrics.batches_sealed.inc();
        tracing::info!(batch = %id, root = %root, at = batch.timestamp.unix_ms, "batch sealed");
        self.audit.record_or_warn(
            RECEIPTS_STREAM,
            AuditEventKind::BatchSealed {
                batch: id.to_string(),
                root,
            },
        );
        Ok(SealOutcome::Sealed(batch))
    }

    fn defer(
        &self,
        state: &mut SealState,
        id: BatchId,
        root: Hash256,
        attempts: u32,
        reason: String,
    ) -> PendingBatch {
        let pending = PendingBatch {
            id: id.clone(),
            root,
            deferred_at_ms: now_millis(),
            reason: reason.clone(),
            attempts: attempts + 1,
        };
        if state.pending.insert(id.start, pending.clone()).is_none() {
            self.metrics.pending_unsigned_batches.inc();
        }
        self.metrics.batches_deferred.inc();
        tracing::warn!(batch = %id, %reason, attempts = pending.attempts, "batch sealing deferred");
        self.audit.record_or_warn(
            RECEIPTS_STREAM,
            AuditEventKind::BatchDeferred {
                batch: id.to_string(),
                reason,
            },
        );
        pending
    }

    /// Re-attempts every pending window.
    ///
    /// Windows that fail for any reason other than a deferral stay pending
    /// and are logged.
    pub fn retry_pending(&self) -> Result<RetryReport, EvidenceError> {
        let slots: Vec<Arc<Mutex<SealState>>> = self.chains.lock()?.values().cloned().collect();
        let mut report = RetryReport::default();
        for slot in slots {
            let mut state = slot.lock()?;
            let pending: Vec<PendingBatch> = state.pending.values().cloned().collect();
            for batch in pending {
                match self.sign_and_store(&mut state, batch.id.clone(), batch.root, batch.attempts) {
                    Ok(SealOutcome::Sealed(root)) => report.sealed.push(root.id),
                    Ok(SealOutcome::Deferred(_)) => report.still_pending += 1,
                    Err(e) => {
                        tracing::error!(batch = %batch.id, "retrying pending batch failed: {e}");
                        report.still_pending += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    /// Every window whose root is computed but not yet signed.
    pub fn pending_unsigned_batches(&self) -> Result<Vec<PendingBatch>, EvidenceError> {
        let slots: Vec<Arc<Mutex<SealState>>> = self.chains.lock()?.values().cloned().collect();
        let mut pending = Vec::new();
        for slot in slots {
            pending.extend(slot.lock()?.pending.values().cloned());
        }
        pending.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(pending)
    }

    /// Checks that `receipt_id` is included in the signed root of `batch_id`.
    ///
    /// A failing proof is [`EvidenceError::InvalidProof`] and a failing
    /// signature [`EvidenceError::SignatureInvalid`]; both are recorded in
    /// the audit log.
    pub fn verify_inclusion(
        &self,
        receipt_id: &ReceiptId,
        batch_id: &BatchId,
    ) -> Result<InclusionCheck, EvidenceError> {
        let result = check_inclusion(self.store.as_ref(), receipt_id, batch_id).and_then(|check| {
            if !check.proof_valid {
                Err(EvidenceError::InvalidProof(format!(
                    "proof of {receipt_id} does not reach the root of {batch_id}"
                )))
            } else if !check.signature_valid {
                Err(EvidenceError::SignatureInvalid(batch_id.to_string()))
            } else {
                Ok(check)
            }
        });

        match &result {
            Err(EvidenceError::InvalidProof(reason)) => {
                self.invalid_proof(receipt_id, reason.clone());
            }
            Err(EvidenceError::SignatureInvalid(batch)) => {
                self.invalid_proof(receipt_id, format!("signature on {batch} does not verify"));
            }
            Err(EvidenceError::TamperDetected { .. }) => self.metrics.tamper_detected.inc(),
            _ => {}
        }
        self.audit.surface(RECEIPTS_STREAM, result)
    }

    fn invalid_proof(&self, receipt_id: &ReceiptId, reason: String) {
        self.metrics.invalid_proofs.inc();
        tracing::error!(receipt = %receipt_id, %reason, "invalid inclusion proof");
        self.audit.record_or_warn(
            RECEIPTS_STREAM,
            AuditEventKind::InvalidProof {
                target: receipt_id.to_string(),
                reason,
            },
        );
    }

    pub fn batch_for_receipt(&self, receipt: &ReceiptId) -> Result<Option<BatchId>, EvidenceError> {
        batch_for_receipt(self.store.as_ref(), receipt)
    }

    /// Sealed windows of `chain`, from the store.
    pub fn sealed_windows(&self, chain: &ChainId) -> Result<Vec<BatchId>, EvidenceError> {
        stored_windows(self.store.as_ref(), chain)
    }

    /// Reloads sealed windows of every chain from the store and raises the
    /// signer watermarks to the latest stored timestamps.
    ///
    /// Pending windows are dropped. Returns the number of batch roots seen.
    pub fn rebuild(&self) -> Result<usize, EvidenceError> {
        let mut chains_seen: BTreeSet<ChainId> = BTreeSet::new();
        let mut seen = 0;
        for item in self.store.list(RecordType::BatchRoot) {
            let (key, record) = match item {
                Ok(kv) => kv,
                Err(StorageError::Codec { key, reason }) => {
                    tracing::warn!(%key, %reason, "skipping undecodable batch root");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let batch = match record.open::<BatchRoot>(&key) {
                Ok(batch) => batch,
                Err(discrepancy) => {
                    tracing::warn!(%key, %discrepancy, "skipping damaged batch root");
                    continue;
                }
            };
            seen += 1;
            self.signer
                .restore_watermark(&batch.id.chain, batch.timestamp.unix_ms)?;
            chains_seen.insert(batch.id.chain);
        }

        let mut chains = HashMap::with_capacity(chains_seen.len());
        for chain in chains_seen {
            let state = SealState {
                loaded: true,
                sealed: stored_windows(self.store.as_ref(), &chain)?,
                pending: BTreeMap::new(),
            };
            chains.insert(chain, Arc::new(Mutex::new(state)));
        }
        *self.chains.lock()? = chains;
        self.metrics.pending_unsigned_batches.set(0);
        Ok(seen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitment::commit;
    use crate::registry::AnchorRegistry;
    use crate::signer::tests::ManualAuthority;
    use crate::storage::InMemoryWormStore;
    use crate::types::DatasetSplit;
    use crate::types::anchor::tests::{model_spec, sample_metadata, samples};
    use crate::merkle;

    struct Fixture {
        store: Arc<InMemoryWormStore>,
        audit: Arc<AuditLog<InMemoryWormStore>>,
        receipts: Arc<ReceiptChainManager<InMemoryWormStore>>,
        authority: Arc<ManualAuthority>,
        sealer: BatchSealer<InMemoryWormStore>,
        model: crate::types::ModelAnchorId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryWormStore::new());
        let audit = Arc::new(AuditLog::new(store.clone()));
        let metrics = EvidenceMetrics::detached();
        let registry = Arc::new(AnchorRegistry::new(store.clone(), audit.clone(), metrics.clone()));
        let ds = registry
            .create_dataset_anchor("ds-A", DatasetSplit::Train, sample_metadata(), samples(4))
            .unwrap();
        let model = registry.create_model_anchor(model_spec(vec![ds.id])).unwrap().id;
        let receipts = Arc::new(ReceiptChainManager::new(
            store.clone(),
            registry,
            audit.clone(),
            metrics.clone(),
        ));
        let authority = ManualAuthority::new(1_700_000_000_000);
        let signer = Arc::new(RootSigner::ephemeral(authority.clone()));
        let sealer = BatchSealer::new(store.clone(), receipts.clone(), signer, audit.clone(), metrics);
        Fixture {
            store,
            audit,
            receipts,
            authority,
            sealer,
            model,
        }
    }

    fn chain() -> ChainId {
        ChainId::new("m-v1-prod").unwrap()
    }

    impl Fixture {
        fn issue(&self, n: usize) -> Vec<InferenceReceipt> {
            (0..n)
                .map(|i| {
                    self.receipts
                        .issue(
                            &chain(),
                            &self.model,
                            commit(format!("in-{i}").as_bytes(), None),
                            commit(format!("out-{i}").as_bytes(), None),
                            vec![],
                        )
                        .unwrap()
                })
                .collect()
        }
    }

    fn sealed(outcome: SealOutcome) -> BatchRoot {
        match outcome {
            SealOutcome::Sealed(batch) => batch,
            SealOutcome::Deferred(p) => panic!("unexpected deferral of {}", p.id),
        }
    }

    #[test]
    fn sealed_window_proves_every_receipt() {
        let fx = fixture();
        let receipts = fx.issue(3);
        let batch = sealed(
            fx.sealer
                .seal_batch(&chain(), BatchWindow::Sequence { start: 0, end: 3 })
                .unwrap(),
        );
        assert_eq!(batch.receipt_count, 3);

        for r in &receipts {
            let check = fx.sealer.verify_inclusion(&r.id, &batch.id).unwrap();
            assert!(check.is_valid());
        }

        let r2 = &receipts[1];
        let check = check_inclusion(fx.store.as_ref(), &r2.id, &batch.id).unwrap();
        assert!(merkle::verify(&r2.digest, &check.proof, &batch.root).unwrap());
        assert!(!merkle::verify(&r2.digest, &check.proof, &Hash256([0xAB; 32])).unwrap());
    }

    #[test]
    fn overlapping_window_is_rejected() {
        let fx = fixture();
        fx.issue(4);
        fx.sealer
            .seal_batch(&chain(), BatchWindow::Sequence { start: 0, end: 3 })
            .unwrap();
        for (start, end) in [(0, 3), (2, 4)] {
            assert!(matches!(
                fx.sealer.seal_batch(&chain(), BatchWindow::Sequence { start, end }),
                Err(EvidenceError::BatchAlreadySealed(_))
            ));
        }
        assert!(fx
            .sealer
            .seal_batch(&chain(), BatchWindow::Sequence { start: 3, end: 4 })
            .is_ok());
    }

    #[test]
    fn empty_and_incomplete_windows_fail() {
        let fx = fixture();
        assert!(matches!(
            fx.sealer.seal_batch(&chain(), BatchWindow::Sequence { start: 0, end: 2 }),
            Err(EvidenceError::EmptyWindow(_))
        ));
        fx.issue(2);
        assert!(matches!(
            fx.sealer.seal_batch(&chain(), BatchWindow::Sequence { start: 1, end: 1 }),
            Err(EvidenceError::EmptyWindow(_))
        ));
        assert!(matches!(
            fx.sealer.seal_batch(&chain(), BatchWindow::Sequence { start: 0, end: 5 }),
            Err(EvidenceError::IncompleteEvidence(_))
        ));
    }

    #[test]
    fn time_window_resolves_to_contiguous_receipts() {
        let fx = fixture();
        let receipts = fx.issue(3);
        let from_ms = receipts[0].issued_at_ms;
        let until_ms = receipts[2].issued_at_ms + 1;
        let batch = sealed(
            fx.sealer
                .seal_batch(&chain(), BatchWindow::Time { from_ms, until_ms })
                .unwrap(),
        );
        assert_eq!((batch.id.start, batch.id.end), (0, 3));

        assert!(matches!(
            fx.sealer.seal_batch(
                &chain(),
                BatchWindow::Time {
                    from_ms: until_ms + 60_000,
                    until_ms: until_ms + 120_000
                }
            ),
            Err(EvidenceError::EmptyWindow(_))
        ));
    }

    #[test]
    fn unavailable_authority_defers_and_retry_seals() {
        let fx = fixture();
        fx.issue(3);
        fx.authority.set_online(false);

        let outcome = fx.sealer.seal_next(&chain(), 10).unwrap().unwrap();
        let SealOutcome::Deferred(pending) = outcome else {
            panic!("expected deferral");
        };
        assert_eq!((pending.id.start, pending.id.end, pending.attempts), (0, 3, 1));
        assert_eq!(fx.sealer.pending_unsigned_batches().unwrap().len(), 1);

        // Issuance keeps working while the authority is down.
        fx.issue(1);
        assert!(matches!(
            fx.sealer.seal_batch(&chain(), BatchWindow::Sequence { start: 0, end: 3 }),
            Err(EvidenceError::BatchAlreadySealed(_))
        ));

        let report = fx.sealer.retry_pending().unwrap();
        assert_eq!(report.still_pending, 1);

        fx.authority.set_online(true);
        let report = fx.sealer.retry_pending().unwrap();
        assert_eq!(report.sealed.len(), 1);
        assert_eq!(report.still_pending, 0);
        assert!(fx.sealer.pending_unsigned_batches().unwrap().is_empty());

        let events = fx.audit.events(RECEIPTS_STREAM).unwrap();
        assert!(events.iter().any(|e| matches!(e.kind, AuditEventKind::BatchDeferred { .. })));
        assert!(events.iter().any(|e| matches!(e.kind, AuditEventKind::BatchSealed { .. })));
    }

    #[test]
    fn seal_next_continues_after_last_window() {
        let fx = fixture();
        fx.issue(5);
        let first = sealed(fx.sealer.seal_next(&chain(), 2).unwrap().unwrap());
        let second = sealed(fx.sealer.seal_next(&chain(), 2).unwrap().unwrap());
        let third = sealed(fx.sealer.seal_next(&chain(), 2).unwrap().unwrap());
        assert_eq!((first.id.start, first.id.end), (0, 2));
        assert_eq!((second.id.start, second.id.end), (2, 4));
        assert_eq!((third.id.start, third.id.end), (4, 5));
        assert!(fx.sealer.seal_next(&chain(), 2).unwrap().is_none());
    }

    #[test]
    fn seal_next_fills_gap_before_manual_window() {
        let fx = fixture();
        fx.issue(10);
        fx.sealer
            .seal_batch(&chain(), BatchWindow::Sequence { start: 5, end: 10 })
            .unwrap();

        let gap = sealed(fx.sealer.seal_next(&chain(), 16).unwrap().unwrap());
        assert_eq!((gap.id.start, gap.id.end), (0, 5));
        assert!(fx.sealer.seal_next(&chain(), 16).unwrap().is_none());
    }

    #[test]
    fn seal_next_stops_at_pending_window() {
        let fx = fixture();
        fx.issue(6);
        fx.sealer
            .seal_batch(&chain(), BatchWindow::Sequence { start: 0, end: 2 })
            .unwrap();
        fx.authority.set_online(false);
        fx.sealer
            .seal_batch(&chain(), BatchWindow::Sequence { start: 4, end: 6 })
            .unwrap();
        fx.authority.set_online(true);

        let gap = sealed(fx.sealer.seal_next(&chain(), 16).unwrap().unwrap());
        assert_eq!((gap.id.start, gap.id.end), (2, 4));
        assert!(fx.sealer.seal_next(&chain(), 16).unwrap().is_none());
        assert_eq!(fx.sealer.pending_unsigned_batches().unwrap().len(), 1);
    }

    #[test]
    fn backdated_authority_time_is_refused() {
        let fx = fixture();
        fx.issue(2);
        fx.sealer
            .seal_batch(&chain(), BatchWindow::Sequence { start: 0, end: 1 })
            .unwrap();
        fx.authority.set_now(1_600_000_000_000);
        assert!(matches!(
            fx.sealer.seal_batch(&chain(), BatchWindow::Sequence { start: 1, end: 2 }),
            Err(EvidenceError::StaleTimestamp { .. })
        ));
    }

    #[test]
    fn failed_put_leaves_watermark_unchanged() {
        let fx = fixture();
        fx.issue(4);
        let first = sealed(
            fx.sealer
                .seal_batch(&chain(), BatchWindow::Sequence { start: 0, end: 2 })
                .unwrap(),
        );

        // Occupy the next window's key behind the sealer's back.
        let mut squatter = first.clone();
        squatter.id = BatchId::new(chain(), 2, 4);
        let record = WormRecord::seal(RecordType::BatchRoot, squatter.id.to_string(), &squatter);
        fx.store.put(&batch_key(&squatter.id), &record).unwrap();

        fx.authority.set_now(first.timestamp.unix_ms + 5_000);
        assert!(matches!(
            fx.sealer.seal_batch(&chain(), BatchWindow::Sequence { start: 2, end: 4 }),
            Err(EvidenceError::BatchAlreadySealed(_))
        ));
        assert_eq!(fx.sealer.signer.watermark(&chain()), Some(first.timestamp.unix_ms));
    }

    #[test]
    fn receipt_outside_window_is_an_audited_invalid_proof() {
        let fx = fixture();
        let receipts = fx.issue(3);
        let batch = sealed(
            fx.sealer
                .seal_batch(&chain(), BatchWindow::Sequence { start: 0, end: 2 })
                .unwrap(),
        );
        assert!(matches!(
            fx.sealer.verify_inclusion(&receipts[2].id, &batch.id),
            Err(EvidenceError::InvalidProof(_))
        ));
        let events = fx.audit.events(RECEIPTS_STREAM).unwrap();
        assert!(events.iter().any(|e| matches!(e.kind, AuditEventKind::InvalidProof { .. })));
    }

    #[test]
    fn forged_batch_root_fails_proof() {
        let fx = fixture();
        let receipts = fx.issue(2);
        let batch = sealed(
            fx.sealer
                .seal_batch(&chain(), BatchWindow::Sequence { start: 0, end: 2 })
                .unwrap(),
        );
        // Re-seal the envelope around a forged root so only the proof fails.
        let key = batch_key(&batch.id);
        let mut forged = batch.clone();
        forged.root = Hash256([0x42; 32]);
        fx.store.tamper(&key, |r| {
            *r = WormRecord::seal_at(RecordType::BatchRoot, batch.id.to_string(), &forged, r.created_at.clone());
        });
        assert!(matches!(
            fx.sealer.verify_inclusion(&receipts[0].id, &batch.id),
            Err(EvidenceError::InvalidProof(_))
        ));
    }

    #[test]
    fn rebuild_restores_sealed_windows_and_watermarks() {
        let fx = fixture();
        fx.issue(2);
        let batch = sealed(
            fx.sealer
                .seal_batch(&chain(), BatchWindow::Sequence { start: 0, end: 2 })
                .unwrap(),
        );

        let signer = Arc::new(RootSigner::ephemeral(fx.authority.clone()));
        let fresh = BatchSealer::new(
            fx.store.clone(),
            fx.receipts.clone(),
            signer.clone(),
            fx.audit.clone(),
            EvidenceMetrics::detached(),
        );
        assert_eq!(fresh.rebuild().unwrap(), 1);
        assert_eq!(signer.watermark(&chain()), Some(batch.timestamp.unix_ms));
        assert!(matches!(
            fresh.seal_batch(&chain(), BatchWindow::Sequence { start: 1, end: 2 }),
            Err(EvidenceError::BatchAlreadySealed(_))
        ));
        assert_eq!(fx.sealer.batch_for_receipt(&ReceiptId::new(chain(), 1)).unwrap(), Some(batch.id));
    }
}
