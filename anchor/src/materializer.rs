//! Lazy evidence materialization.
//!
//! Nothing here is cached: an evidence package is a pure function of the
//! records in the store, so asking twice without intervening writes yields
//! identical packages. Missing ancestors are never approximated; they fail
//! the request with [`EvidenceError::IncompleteEvidence`].

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditLog, MATERIALIZATION_STREAM};
use crate::error::EvidenceError;
use crate::merkle::{MerkleProof, MerkleTree};
use crate::metrics::EvidenceMetrics;
use crate::receipts::{batch_for_receipt, check_inclusion, load_receipt, load_window};
use crate::signer::verify_signature;
use crate::storage::{WormStore, fetch};
use crate::types::{
    AuditEventKind, BatchId, BatchRoot, DatasetAnchor, DatasetAnchorId, Discrepancy,
    EvidenceTarget, Hash256, InferenceReceipt, ModelAnchor, ModelAnchorId, ReceiptId,
    canonical_bytes,
    record::{batch_key, dataset_key, model_key, receipt_key},
};

/// Overall judgement of a package.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// Every digest, link, proof and signature checked out.
    Verified,
    /// Everything checked out but the receipt is not covered by a signed
    /// batch root yet.
    PendingSeal,
    Failed { reasons: Vec<String> },
}

/// Proof that a receipt is covered by a signed batch root.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InclusionEvidence {
    pub batch: BatchRoot,
    pub proof: MerkleProof,
    pub proof_valid: bool,
    pub signature_valid: bool,
}

/// The reconstructed record and its ancestors.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvidenceSubject {
    Dataset {
        anchor: DatasetAnchor,
    },
    Model {
        anchor: ModelAnchor,
        /// Authorized dataset anchors, in the model's order.
        datasets: Vec<DatasetAnchor>,
    },
    Receipt {
        receipt: InferenceReceipt,
        model: ModelAnchor,
        /// `None` until the receipt's window is sealed.
        inclusion: Option<InclusionEvidence>,
    },
    Batch {
        batch: BatchRoot,
        /// Receipt digests under the root, in chain order.
        receipt_digests: Vec<Hash256>,
    },
}

/// Auditor-facing bundle for one identifier.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EvidencePackage {
    pub target: String,
    pub subject: EvidenceSubject,
    pub verdict: Verdict,
}

impl EvidencePackage {
    /// Digest over the canonical encoding of the whole package.
    pub fn digest(&self) -> Hash256 {
        Hash256::tagged("anchor/evidence-package/v1", &[&canonical_bytes(self)])
    }
}

/// Accumulates failure reasons while a package is assembled.
#[derive(Default)]
struct Findings(Vec<String>);

impl Findings {
    fn require(&mut self, ok: bool, reason: impl FnOnce() -> String) {
        if !ok {
            self.0.push(reason());
        }
    }

    fn verdict(self, sealed: bool) -> Verdict {
        if !self.0.is_empty() {
            Verdict::Failed { reasons: self.0 }
        } else if sealed {
            Verdict::Verified
        } else {
            Verdict::PendingSeal
        }
    }
}

/// Reconstructs evidence packages on demand.
pub struct Materializer<S: ?Sized> {
    store: Arc<S>,
    audit: Arc<AuditLog<S>>,
    metrics: EvidenceMetrics,
}

impl<S: WormStore + ?Sized> Materializer<S> {
    pub fn new(store: Arc<S>, audit: Arc<AuditLog<S>>, metrics: EvidenceMetrics) -> Self {
        Self {
            store,
            audit,
            metrics,
        }
    }

    /// Builds the evidence package for `target`.
    ///
    /// A completed request is recorded as a `MaterializationRequested` audit
    /// event; a cancelled one returns [`EvidenceError::Cancelled`] and
    /// records nothing.
    pub fn materialize(
        &self,
        target: &EvidenceTarget,
        cancel: &CancellationToken,
    ) -> Result<EvidencePackage, EvidenceError> {
        let timer = self.metrics.materialize_seconds.start_timer();
        let built = match target {
            EvidenceTarget::Dataset(id) => self.dataset(id),
            EvidenceTarget::Model(id) => self.model(id, cancel),
            EvidenceTarget::Receipt(id) => self.receipt(id, cancel),
            EvidenceTarget::Batch(id) => self.batch(id, cancel),
        };
        if let Err(EvidenceError::TamperDetected { .. }) = &built {
            self.metrics.tamper_detected.inc();
        }
        let (subject, verdict) = self.audit.surface(MATERIALIZATION_STREAM, built)?;
        timer.observe_duration();

        if let Verdict::Failed { reasons } = &verdict {
            tracing::warn!(%target, ?reasons, "materialized evidence does not verify");
        }
        self.audit.record_or_warn(
            MATERIALIZATION_STREAM,
            AuditEventKind::MaterializationRequested {
                target: target.to_string(),
            },
        );
        Ok(EvidencePackage {
            target: target.to_string(),
            subject,
            verdict,
        })
    }

    fn load_dataset(&self, id: &DatasetAnchorId) -> Result<DatasetAnchor, EvidenceError> {
        fetch(self.store.as_ref(), &dataset_key(id))
    }

    fn load_model(&self, id: &ModelAnchorId) -> Result<ModelAnchor, EvidenceError> {
        fetch(self.store.as_ref(), &model_key(id))
    }

    fn dataset(&self, id: &DatasetAnchorId) -> Result<(EvidenceSubject, Verdict), EvidenceError> {
        let anchor = self.load_dataset(id)?;
        let mut findings = Findings::default();
        if let Err(d) = anchor.check() {
            findings.0.push(format!("dataset {id}: {d}"));
            self.tampered(&dataset_key(id), d);
        }
        Ok((EvidenceSubject::Dataset { anchor }, findings.verdict(true)))
    }

    /// Model plus every authorized dataset it pins.
    fn model_with_datasets(
        &self,
        id: &ModelAnchorId,
        findings: &mut Findings,
        cancel: &CancellationToken,
    ) -> Result<(ModelAnchor, Vec<DatasetAnchor>), EvidenceError> {
        let anchor = self.load_model(id)?;
        if let Err(d) = anchor.check() {
            findings.0.push(format!("model {id}: {d}"));
            self.tampered(&model_key(id), d);
        }

        let mut datasets = Vec::with_capacity(anchor.authorized_datasets.len());
        for pinned in &anchor.authorized_datasets {
            if cancel.is_cancelled() {
                return Err(EvidenceError::Cancelled);
            }
            let dataset = match self.load_dataset(&pinned.id) {
                Err(EvidenceError::NotFound(key)) => return Err(EvidenceError::IncompleteEvidence(key)),
                other => other?,
            };
            if let Err(d) = dataset.check() {
                findings.0.push(format!("dataset {}: {d}", pinned.id));
                self.tampered(&dataset_key(&pinned.id), d);
            }
            findings.require(dataset.anchor_digest == pinned.anchor_digest, || {
                format!("dataset {} differs from the digest pinned by {id}", pinned.id)
            });
            datasets.push(dataset);
        }
        Ok((anchor, datasets))
    }

    fn model(
        &self,
        id: &ModelAnchorId,
        cancel: &CancellationToken,
    ) -> Result<(EvidenceSubject, Verdict), EvidenceError> {
        let mut findings = Findings::default();
        let (anchor, datasets) = self.model_with_datasets(id, &mut findings, cancel)?;
        Ok((
            EvidenceSubject::Model { anchor, datasets },
            findings.verdict(true),
        ))
    }

    fn receipt(
        &self,
        id: &ReceiptId,
        cancel: &CancellationToken,
    ) -> Result<(EvidenceSubject, Verdict), EvidenceError> {
        let receipt = load_receipt(self.store.as_ref(), id)?;
        let mut findings = Findings::default();

        if id.sequence > 0 {
            let prev_id = ReceiptId::new(id.chain.clone(), id.sequence - 1);
            let prev = match load_receipt(self.store.as_ref(), &prev_id) {
                Err(EvidenceError::NotFound(key)) => return Err(EvidenceError::IncompleteEvidence(key)),
                other => other?,
            };
            findings.require(prev.digest == receipt.prev_digest, || {
                format!("{id} does not link to {}", receipt_key(&prev_id))
            });
        }

        let model = match self.model_with_datasets(&receipt.model_anchor, &mut findings, cancel) {
            Err(EvidenceError::NotFound(key)) => return Err(EvidenceError::IncompleteEvidence(key)),
            other => other?.0,
        };
        findings.require(model.model_digest == receipt.model_digest, || {
            format!("{id} was issued against a different digest of {}", model.id)
        });

        if cancel.is_cancelled() {
            return Err(EvidenceError::Cancelled);
        }
        let inclusion = match batch_for_receipt(self.store.as_ref(), id)? {
            None => None,
            Some(batch_id) => {
                let check = check_inclusion(self.store.as_ref(), id, &batch_id)?;
                if !check.proof_valid {
                    let reason = format!("proof of {id} does not reach the root of {batch_id}");
                    self.invalid_proof(id, &reason);
                    findings.0.push(reason);
                }
                findings.require(check.signature_valid, || {
                    format!("signature on {batch_id} does not verify")
                });
                Some(InclusionEvidence {
                    batch: check.batch,
                    proof: check.proof,
                    proof_valid: check.proof_valid,
                    signature_valid: check.signature_valid,
                })
            }
        };

        let sealed = inclusion.is_some();
        Ok((
            EvidenceSubject::Receipt {
                receipt,
                model,
                inclusion,
            },
            findings.verdict(sealed),
        ))
    }

    fn batch(
        &self,
        id: &BatchId,
        cancel: &CancellationToken,
    ) -> Result<(EvidenceSubject, Verdict), EvidenceError> {
        let batch: BatchRoot = fetch(self.store.as_ref(), &batch_key(id))?;
        if cancel.is_cancelled() {
            return Err(EvidenceError::Cancelled);
        }
        let receipts = load_window(self.store.as_ref(), &id.chain, id.start, id.end)?;
        let receipt_digests: Vec<Hash256> = receipts.iter().map(|r| r.digest).collect();

        let mut findings = Findings::default();
        let root = MerkleTree::build(&receipt_digests)?.root();
        findings.require(root == batch.root, || {
            format!("receipts of {id} do not reproduce the signed root")
        });
        findings.require(
            verify_signature(
                &batch.id.chain,
                &batch.root,
                &batch.timestamp,
                &batch.signature,
                &batch.public_key,
            ),
            || format!("signature on {id} does not verify"),
        );
        Ok((
            EvidenceSubject::Batch {
                batch,
                receipt_digests,
            },
            findings.verdict(true),
        ))
    }

    fn tampered(&self, key: &str, discrepancy: Discrepancy) {
        self.metrics.tamper_detected.inc();
        tracing::error!(%key, %discrepancy, "tamper detected");
        self.audit.record_or_warn(
            MATERIALIZATION_STREAM,
            AuditEventKind::TamperDetected {
                key: key.to_string(),
                discrepancy,
            },
        );
    }

    fn invalid_proof(&self, id: &ReceiptId, reason: &str) {
        self.metrics.invalid_proofs.inc();
        tracing::error!(receipt = %id, reason, "invalid inclusion proof");
        self.audit.record_or_warn(
            MATERIALIZATION_STREAM,
            AuditEventKind::InvalidProof {
                target: id.to_string(),
                reason: reason.to_string(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitment::commit;
    use crate::receipts::{BatchSealer, ReceiptChainManager};
    use crate::registry::AnchorRegistry;
    use crate::signer::{RootSigner, SystemClockAuthority};
    use crate::storage::InMemoryWormStore;
    use crate::types::anchor::tests::{model_spec, sample_metadata, samples};
    use crate::types::{BatchWindow, ChainId, DatasetSplit, RecordType, WormRecord};

    struct World {
        store: Arc<InMemoryWormStore>,
        audit: Arc<AuditLog<InMemoryWormStore>>,
        sealer: BatchSealer<InMemoryWormStore>,
    }

    fn world(receipt_count: u32) -> World {
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
        let chain = ChainId::new("m-v1-prod").unwrap();
        for i in 0..receipt_count {
            receipts
                .issue(
                    &chain,
                    &model,
                    commit(format!("in-{i}").as_bytes(), None),
                    commit(format!("out-{i}").as_bytes(), None),
                    vec![commit(b"saliency", None)],
                )
                .unwrap();
        }
        let signer = Arc::new(RootSigner::ephemeral(Arc::new(SystemClockAuthority)));
        let sealer = BatchSealer::new(store.clone(), receipts, signer, audit.clone(), metrics);
        World {
            store,
            audit,
            sealer,
        }
    }

    fn materializer(w: &World) -> Materializer<InMemoryWormStore> {
        Materializer::new(w.store.clone(), w.audit.clone(), EvidenceMetrics::detached())
    }

    fn target(s: &str) -> EvidenceTarget {
        EvidenceTarget::parse(s).unwrap()
    }

    #[test]
    fn sealed_receipt_materializes_with_valid_proof() {
        let w = world(3);
        w.sealer
            .seal_batch(
                &ChainId::new("m-v1-prod").unwrap(),
                BatchWindow::Sequence { start: 0, end: 3 },
            )
            .unwrap();

        let package = materializer(&w)
            .materialize(&target("m-v1-prod#1"), &CancellationToken::new())
            .unwrap();
        assert_eq!(package.verdict, Verdict::Verified);
        let EvidenceSubject::Receipt { inclusion: Some(inclusion), model, .. } = &package.subject else {
            panic!("expected a sealed receipt package");
        };
        assert_eq!(model.id.as_str(), "m@v1");
        assert_eq!(inclusion.proof.path.len(), 2);
        assert!(inclusion.proof_valid && inclusion.signature_valid);
    }

    #[test]
    fn unsealed_receipt_is_pending() {
        let w = world(2);
        let package = materializer(&w)
            .materialize(&target("m-v1-prod#0"), &CancellationToken::new())
            .unwrap();
        assert_eq!(package.verdict, Verdict::PendingSeal);
    }

    #[test]
    fn materialization_is_idempotent() {
        let w = world(3);
        w.sealer
            .seal_batch(
                &ChainId::new("m-v1-prod").unwrap(),
                BatchWindow::Sequence { start: 0, end: 3 },
            )
            .unwrap();
        let m = materializer(&w);
        for id in ["ds-A:train", "m@v1", "m-v1-prod#2", "m-v1-prod/0-3"] {
            let a = m.materialize(&target(id), &CancellationToken::new()).unwrap();
            let b = m.materialize(&target(id), &CancellationToken::new()).unwrap();
            assert_eq!(serde_json::to_vec(&a).unwrap(), serde_json::to_vec(&b).unwrap());
            assert_eq!(a.digest(), b.digest());
        }
    }

    #[test]
    fn missing_ancestor_is_incomplete_evidence() {
        let w = world(2);
        w.store.remove("dataset_anchor/ds-A:train");
        assert!(matches!(
            materializer(&w).materialize(&target("m@v1"), &CancellationToken::new()),
            Err(EvidenceError::IncompleteEvidence(_))
        ));

        let w = world(2);
        w.store.remove(&receipt_key(&ReceiptId::new(ChainId::new("m-v1-prod").unwrap(), 0)));
        assert!(matches!(
            materializer(&w).materialize(&target("m-v1-prod#1"), &CancellationToken::new()),
            Err(EvidenceError::IncompleteEvidence(_))
        ));
    }

    #[test]
    fn unknown_target_is_not_found() {
        let w = world(0);
        assert!(matches!(
            materializer(&w).materialize(&target("ds-Z:test"), &CancellationToken::new()),
            Err(EvidenceError::NotFound(_))
        ));
    }

    #[test]
    fn resealed_forged_dataset_fails_verdict() {
        let w = world(0);
        let key = "dataset_anchor/ds-A:train";
        let mut forged: DatasetAnchor = w.store.get(key).unwrap().decode().unwrap();
        forged.metadata.sample_count = 1_000_000;
        w.store.tamper(key, |r| {
            *r = WormRecord::seal_at(RecordType::DatasetAnchor, "ds-A:train", &forged, r.created_at.clone());
        });

        let package = materializer(&w)
            .materialize(&target("ds-A:train"), &CancellationToken::new())
            .unwrap();
        assert!(matches!(package.verdict, Verdict::Failed { .. }));
        let events = w.audit.events(MATERIALIZATION_STREAM).unwrap();
        let tampered: Vec<&str> = events
            .iter()
            .filter_map(|e| match &e.kind {
                AuditEventKind::TamperDetected { key, .. } => Some(key.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(tampered, vec![key]);
    }

    #[test]
    fn cancelled_request_records_nothing() {
        let w = world(2);
        let before = w.store.len();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            materializer(&w).materialize(&target("m@v1"), &cancel),
            Err(EvidenceError::Cancelled)
        ));
        assert_eq!(w.store.len(), before);
    }

    #[test]
    fn completed_request_is_audited() {
        let w = world(1);
        materializer(&w)
            .materialize(&target("m-v1-prod#0"), &CancellationToken::new())
            .unwrap();
        let events = w.audit.events(MATERIALIZATION_STREAM).unwrap();
        assert!(matches!(
            &events[0].kind,
            AuditEventKind::MaterializationRequested { target } if target == "m-v1-prod#0"
        ));
    }
}
