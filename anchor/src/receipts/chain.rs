//! Per-chain receipt issuance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::audit::{AuditLog, RECEIPTS_STREAM};
use crate::error::EvidenceError;
use crate::metrics::EvidenceMetrics;
use crate::registry::AnchorRegistry;
use crate::storage::{StorageError, WormStore};
use crate::types::{
    ChainHead, ChainId, Commitment, InferenceReceipt, ModelAnchorId, ReceiptId, RecordType,
    WormRecord, now_millis,
    record::{receipt_chain_prefix, receipt_key},
};

/// In-memory head of one chain. A cache of the last stored receipt.
#[derive(Clone, Debug)]
struct ChainState {
    loaded: bool,
    head: ChainHead,
    /// Model of the chain's receipts, once the first one is issued.
    model: Option<ModelAnchorId>,
}

impl Default for ChainState {
    fn default() -> Self {
        Self {
            loaded: false,
            head: ChainHead::Empty,
            model: None,
        }
    }
}

/// Issues hash-linked inference receipts.
///
/// Each chain has its own lock, so issuance is linearized per chain while
/// independent chains proceed in parallel. The outer map lock is only held
/// long enough to look up (or insert) a chain's slot.
pub struct ReceiptChainManager<S: ?Sized> {
    store: Arc<S>,
    registry: Arc<AnchorRegistry<S>>,
    audit: Arc<AuditLog<S>>,
    metrics: EvidenceMetrics,
    chains: Mutex<HashMap<ChainId, Arc<Mutex<ChainState>>>>,
}

impl<S: WormStore + ?Sized> ReceiptChainManager<S> {
    pub fn new(
        store: Arc<S>,
        registry: Arc<AnchorRegistry<S>>,
        audit: Arc<AuditLog<S>>,
        metrics: EvidenceMetrics,
    ) -> Self {
        Self {
            store,
            registry,
            audit,
            metrics,
            chains: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, chain: &ChainId) -> Result<Arc<Mutex<ChainState>>, EvidenceError> {
        let mut chains = self.chains.lock()?;
        Ok(chains.entry(chain.clone()).or_default().clone())
    }

    /// Reads the head of `chain` from the store.
    ///
    /// A damaged head receipt is surfaced as `TamperDetected`; the chain
    /// stays unusable until it is investigated.
    fn load_state(&self, chain: &ChainId) -> Result<ChainState, EvidenceError> {
        let last = self
            .store
            .last_with_prefix(RecordType::Receipt, &receipt_chain_prefix(chain.as_str()))?;
        let Some((key, record)) = last else {
            return Ok(ChainState {
                loaded: true,
                ..ChainState::default()
            });
        };
        let opened = record
            .open::<InferenceReceipt>(&key)
            .and_then(|r| r.check().map(|()| r))
            .map_err(|discrepancy| EvidenceError::TamperDetected {
                key: key.clone(),
                discrepancy,
            });
        if opened.is_err() {
            self.metrics.tamper_detected.inc();
        }
        let receipt = self.audit.surface(RECEIPTS_STREAM, opened)?;
        Ok(ChainState {
            loaded: true,
            head: receipt.as_head(),
            model: Some(receipt.model_anchor),
        })
    }

    /// Issues the next receipt of `chain` for a prediction served by `model`.
    ///
    /// The model must be active. A chain is bound to the model of its first
    /// receipt. `issued_at_ms` never goes backwards within a chain, even if
    /// the wall clock does.
    pub fn issue(
        &self,
        chain: &ChainId,
        model: &ModelAnchorId,
        input: Commitment,
        output: Commitment,
        explanations: Vec<Commitment>,
    ) -> Result<InferenceReceipt, EvidenceError> {
        let anchor = self.registry.active_model(model)?;
        let slot = self.slot(chain)?;
        let mut state = slot.lock()?;
        if !state.loaded {
            *state = self.load_state(chain)?;
        }

        let mut retried = false;
        loop {
            if let Some(bound) = &state.model {
                if bound != model {
                    return Err(EvidenceError::ChainModelMismatch {
                        chain: chain.to_string(),
                        bound: bound.to_string(),
                        requested: model.to_string(),
                    });
                }
            }

            let receipt = InferenceReceipt::issue(
                ReceiptId::new(chain.clone(), state.head.next_sequence()),
                anchor.id.clone(),
                anchor.model_digest,
                input,
                output,
                explanations.clone(),
                state.head.link_digest(),
                now_millis().max(state.head.min_issued_at()),
            );
            let record = WormRecord::seal(RecordType::Receipt, receipt.id.to_string(), &receipt);
            match self.store.put(&receipt_key(&receipt.id), &record) {
                Ok(()) => {
                    state.head = receipt.as_head();
                    state.model = Some(anchor.id.clone());
                    self.metrics.receipts_issued.inc();
                    tracing::debug!(receipt = %receipt.id, digest = %receipt.digest, "receipt issued");
                    return Ok(receipt);
                }
                Err(StorageError::AlreadyExists(key)) if !retried => {
                    tracing::warn!(%key, "chain head moved underneath us; re-reading");
                    retried = true;
                    *state = self.load_state(chain)?;
                }
                Err(StorageError::AlreadyExists(_)) => {
                    return Err(EvidenceError::ConcurrentChainWrite(chain.to_string()));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Current head of `chain`.
    pub fn head(&self, chain: &ChainId) -> Result<ChainHead, EvidenceError> {
        let slot = self.slot(chain)?;
        let mut state = slot.lock()?;
        if !state.loaded {
            *state = self.load_state(chain)?;
        }
        Ok(state.head)
    }

    /// Model the chain is bound to, if it has any receipts.
    pub fn bound_model(&self, chain: &ChainId) -> Result<Option<ModelAnchorId>, EvidenceError> {
        let slot = self.slot(chain)?;
        let mut state = slot.lock()?;
        if !state.loaded {
            *state = self.load_state(chain)?;
        }
        Ok(state.model.clone())
    }

    pub fn receipt(&self, id: &ReceiptId) -> Result<InferenceReceipt, EvidenceError> {
        super::load_receipt(self.store.as_ref(), id)
    }

    pub fn receipts_in_range(
        &self,
        chain: &ChainId,
        start: u64,
        end: u64,
    ) -> Result<Vec<InferenceReceipt>, EvidenceError> {
        super::load_window(self.store.as_ref(), chain, start, end)
    }

    /// Chains with a cached head, sorted.
    pub fn known_chains(&self) -> Result<Vec<ChainId>, EvidenceError> {
        let mut chains: Vec<ChainId> = self.chains.lock()?.keys().cloned().collect();
        chains.sort();
        Ok(chains)
    }

    /// Drops every cached head and reloads one per chain found in the store.
    ///
    /// Chains whose head is damaged are left unloaded (and reported).
    /// Returns the number of chains loaded.
    pub fn rebuild(&self) -> Result<usize, EvidenceError> {
        let mut chain_ids: Vec<ChainId> = Vec::new();
        for item in self.store.list(RecordType::Receipt) {
            let key = match item {
                Ok((key, _)) => key,
                Err(StorageError::Codec { key, .. }) => key,
                Err(e) => return Err(e.into()),
            };
            let Some(chain) = key.split('/').nth(1) else {
                continue;
            };
            if chain_ids.last().map(ChainId::as_str) != Some(chain) {
                chain_ids.push(ChainId::new(chain)?);
            }
        }

        let mut chains = HashMap::with_capacity(chain_ids.len());
        let mut loaded = 0;
        for chain in chain_ids {
            let state = match self.load_state(&chain) {
                Ok(state) => {
                    loaded += 1;
                    state
                }
                Err(EvidenceError::TamperDetected { key, discrepancy }) => {
                    tracing::warn!(%chain, %key, %discrepancy, "chain head damaged; not restored");
                    ChainState::default()
                }
                Err(e) => return Err(e),
            };
            chains.insert(chain, Arc::new(Mutex::new(state)));
        }
        *self.chains.lock()? = chains;
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitment::commit;
    use crate::storage::InMemoryWormStore;
    use crate::types::{DatasetAnchorId, DatasetSplit};
    use crate::types::anchor::tests::{model_spec, sample_metadata, samples};

    struct Fixture {
        store: Arc<InMemoryWormStore>,
        registry: Arc<AnchorRegistry<InMemoryWormStore>>,
        audit: Arc<AuditLog<InMemoryWormStore>>,
        model: ModelAnchorId,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(InMemoryWormStore::new());
            let audit = Arc::new(AuditLog::new(store.clone()));
            let registry = Arc::new(AnchorRegistry::new(
                store.clone(),
                audit.clone(),
                EvidenceMetrics::detached(),
            ));
            let ds = registry
                .create_dataset_anchor("ds-A", DatasetSplit::Train, sample_metadata(), samples(4))
                .unwrap();
            let model = registry.create_model_anchor(model_spec(vec![ds.id])).unwrap().id;
            Self {
                store,
                registry,
                audit,
                model,
            }
        }

        fn manager(&self) -> ReceiptChainManager<InMemoryWormStore> {
            ReceiptChainManager::new(
                self.store.clone(),
                self.registry.clone(),
                self.audit.clone(),
                EvidenceMetrics::detached(),
            )
        }
    }

    fn chain() -> ChainId {
        ChainId::new("m-v1-prod").unwrap()
    }

    fn issue(m: &ReceiptChainManager<InMemoryWormStore>, model: &ModelAnchorId, n: u32) -> InferenceReceipt {
        m.issue(
            &chain(),
            model,
            commit(format!("in-{n}").as_bytes(), None),
            commit(format!("out-{n}").as_bytes(), None),
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn receipts_link_to_their_predecessor() {
        let fx = Fixture::new();
        let m = fx.manager();
        let r0 = issue(&m, &fx.model, 0);
        let r1 = issue(&m, &fx.model, 1);
        let r2 = issue(&m, &fx.model, 2);

        assert_eq!(r0.id.sequence, 0);
        assert!(r0.prev_digest.is_zero());
        assert_eq!(r1.prev_digest, r0.digest);
        assert_eq!(r2.prev_digest, r1.digest);
        assert!(r1.issued_at_ms >= r0.issued_at_ms);
        assert_eq!(m.head(&chain()).unwrap(), r2.as_head());
        assert_eq!(m.receipts_in_range(&chain(), 0, 3).unwrap(), vec![r0, r1, r2]);
    }

    #[test]
    fn unknown_or_retired_model_is_rejected() {
        let fx = Fixture::new();
        let m = fx.manager();
        let unknown = ModelAnchorId::new("m", "v9").unwrap();
        let err = m
            .issue(&chain(), &unknown, commit(b"i", None), commit(b"o", None), vec![])
            .unwrap_err();
        assert!(matches!(err, EvidenceError::UnknownModelAnchor(_)));

        fx.registry.retire_model_anchor(&fx.model, "rollback").unwrap();
        let err = m
            .issue(&chain(), &fx.model, commit(b"i", None), commit(b"o", None), vec![])
            .unwrap_err();
        assert!(matches!(err, EvidenceError::UnknownModelAnchor(_)));
        assert_eq!(fx.store.list(RecordType::Receipt).count(), 0);
    }

    #[test]
    fn chain_is_bound_to_its_first_model() {
        let fx = Fixture::new();
        let m = fx.manager();
        issue(&m, &fx.model, 0);

        let ds = DatasetAnchorId::parse("ds-A:train").unwrap();
        let mut spec = model_spec(vec![ds]);
        spec.version = "v2".to_string();
        let v2 = fx.registry.create_model_anchor(spec).unwrap().id;

        let err = m
            .issue(&chain(), &v2, commit(b"i", None), commit(b"o", None), vec![])
            .unwrap_err();
        assert!(matches!(err, EvidenceError::ChainModelMismatch { .. }));
    }

    #[test]
    fn concurrent_issuance_is_linearized_per_chain() {
        let fx = Fixture::new();
        let m = fx.manager();
        std::thread::scope(|s| {
            for t in 0..4 {
                let m = &m;
                let model = &fx.model;
                s.spawn(move || {
                    for i in 0..25 {
                        issue(m, model, t * 100 + i);
                    }
                });
            }
        });

        let receipts = m.receipts_in_range(&chain(), 0, 100).unwrap();
        assert!(receipts[0].prev_digest.is_zero());
        for pair in receipts.windows(2) {
            assert_eq!(pair[1].prev_digest, pair[0].digest);
        }
        assert_eq!(m.head(&chain()).unwrap().next_sequence(), 100);
    }

    #[test]
    fn stale_head_is_re_read_and_retried_once() {
        let fx = Fixture::new();
        let a = fx.manager();
        let b = fx.manager();
        issue(&a, &fx.model, 0);
        // `b` takes sequence 1 behind `a`'s back.
        issue(&b, &fx.model, 1);

        let r = issue(&a, &fx.model, 2);
        assert_eq!(r.id.sequence, 2);
        let r1 = a.receipt(&ReceiptId::new(chain(), 1)).unwrap();
        assert_eq!(r.prev_digest, r1.digest);
    }

    #[test]
    fn rebuild_restores_heads_from_store() {
        let fx = Fixture::new();
        let m = fx.manager();
        issue(&m, &fx.model, 0);
        let last = issue(&m, &fx.model, 1);

        let fresh = fx.manager();
        assert_eq!(fresh.rebuild().unwrap(), 1);
        assert_eq!(fresh.known_chains().unwrap(), vec![chain()]);
        assert_eq!(fresh.head(&chain()).unwrap(), last.as_head());
        assert_eq!(fresh.bound_model(&chain()).unwrap(), Some(fx.model.clone()));
    }

    #[test]
    fn missing_receipt_in_range_is_incomplete_evidence() {
        let fx = Fixture::new();
        let m = fx.manager();
        issue(&m, &fx.model, 0);
        issue(&m, &fx.model, 1);
        fx.store.remove(&receipt_key(&ReceiptId::new(chain(), 0)));

        assert!(matches!(
            m.receipts_in_range(&chain(), 0, 2),
            Err(EvidenceError::IncompleteEvidence(_))
        ));
    }
}
