//! The wired-up evidence engine.
//!
//! [`EvidenceEngine`] owns one store and every component built on it: audit
//! log, anchor registry, receipt chains, batch sealer, integrity verifier
//! and materializer. Binaries construct it from an [`AnchorConfig`]; tests
//! usually hand it an [`InMemoryWormStore`] directly.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditLog, IntegrityVerifier, Recovery, RecoveryReport};
use crate::config::{AnchorConfig, SigningKeySource, StorageBackend};
use crate::error::EvidenceError;
use crate::materializer::Materializer;
use crate::metrics::EvidenceMetrics;
use crate::receipts::{BatchSealer, ReceiptChainManager, RetryReport, SealOutcome};
use crate::registry::AnchorRegistry;
use crate::signer::{HttpTimestampAuthority, RootSigner, SystemClockAuthority, TimestampAuthority};
use crate::storage::{InMemoryWormStore, RocksDbWormStore, WormStore};
use crate::types::{BatchId, ChainId, PublicKey};

/// Result of one scheduled sealing pass.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SealingPass {
    pub sealed: Vec<BatchId>,
    pub deferred: Vec<BatchId>,
    pub retried: RetryReport,
}

/// Every component of the engine over a shared store.
pub struct EvidenceEngine<S: ?Sized = dyn WormStore> {
    pub store: Arc<S>,
    pub signer: Arc<RootSigner>,
    pub audit: Arc<AuditLog<S>>,
    pub registry: Arc<AnchorRegistry<S>>,
    pub receipts: Arc<ReceiptChainManager<S>>,
    pub sealer: BatchSealer<S>,
    pub verifier: IntegrityVerifier<S>,
    pub materializer: Materializer<S>,
}

impl EvidenceEngine {
    /// Opens the configured store and signer and rebuilds caches from the
    /// store contents.
    pub fn open(cfg: &AnchorConfig, metrics: EvidenceMetrics) -> Result<Self, EvidenceError> {
        let store: Arc<dyn WormStore> = match &cfg.storage {
            StorageBackend::Memory => Arc::new(InMemoryWormStore::new()),
            StorageBackend::RocksDb(rocks) => Arc::new(RocksDbWormStore::open(rocks)?),
        };

        let authority: Arc<dyn TimestampAuthority> = match &cfg.signer.timestamp_url {
            Some(url) => Arc::new(HttpTimestampAuthority::new(
                url.clone(),
                cfg.signer.timestamp_timeout,
            )?),
            None => Arc::new(SystemClockAuthority),
        };
        let signer = match &cfg.signer.key {
            SigningKeySource::Ephemeral => {
                tracing::warn!("no signing key configured; batch roots use an ephemeral key");
                RootSigner::ephemeral(authority)
            }
            SigningKeySource::SeedHex(seed) => RootSigner::from_seed_hex(seed, authority)?,
            SigningKeySource::KeyFile(path) => RootSigner::from_key_file(path, authority)?,
        };

        let engine = Self::with_store(
            store,
            Arc::new(signer),
            metrics,
            cfg.schedule.trusted_keys.clone(),
        );
        engine.recover(false, &CancellationToken::new())?;
        Ok(engine)
    }
}

impl<S: WormStore + ?Sized> EvidenceEngine<S> {
    /// Wires every component over `store`. Caches start empty; call
    /// [`EvidenceEngine::recover`] when the store is not fresh.
    pub fn with_store(
        store: Arc<S>,
        signer: Arc<RootSigner>,
        metrics: EvidenceMetrics,
        trusted_keys: Vec<PublicKey>,
    ) -> Self {
        let audit = Arc::new(AuditLog::new(store.clone()));
        let registry = Arc::new(AnchorRegistry::new(
            store.clone(),
            audit.clone(),
            metrics.clone(),
        ));
        let receipts = Arc::new(ReceiptChainManager::new(
            store.clone(),
            registry.clone(),
            audit.clone(),
            metrics.clone(),
        ));
        let sealer = BatchSealer::new(
            store.clone(),
            receipts.clone(),
            signer.clone(),
            audit.clone(),
            metrics.clone(),
        );
        let verifier = IntegrityVerifier::new(store.clone(), audit.clone(), metrics.clone())
            .with_trusted_keys(trusted_keys);
        let materializer = Materializer::new(store.clone(), audit.clone(), metrics);

        Self {
            store,
            signer,
            audit,
            registry,
            receipts,
            sealer,
            verifier,
            materializer,
        }
    }

    /// Rebuilds every in-memory cache from the store, optionally scanning it
    /// first.
    pub fn recover(
        &self,
        scan_first: bool,
        cancel: &CancellationToken,
    ) -> Result<RecoveryReport, EvidenceError> {
        Recovery {
            audit: &self.audit,
            registry: &self.registry,
            receipts: &self.receipts,
            sealer: &self.sealer,
            verifier: &self.verifier,
        }
        .rebuild(scan_first, cancel)
    }

    /// Retries pending windows, then seals the next window of every known
    /// chain.
    ///
    /// A failing chain is logged and does not stop the others.
    pub fn seal_due(&self, max_receipts: u64) -> Result<SealingPass, EvidenceError> {
        let mut pass = SealingPass {
            retried: self.sealer.retry_pending()?,
            ..SealingPass::default()
        };
        for chain in self.receipts.known_chains()? {
            match self.sealer.seal_next(&chain, max_receipts) {
                Ok(Some(SealOutcome::Sealed(root))) => pass.sealed.push(root.id),
                Ok(Some(SealOutcome::Deferred(pending))) => pass.deferred.push(pending.id),
                Ok(None) => {}
                Err(e) => tracing::error!(%chain, "scheduled sealing failed: {e}"),
            }
        }
        Ok(pass)
    }

    /// Chains issued against since the last rebuild, plus those in the store.
    pub fn chains(&self) -> Result<Vec<ChainId>, EvidenceError> {
        self.receipts.known_chains()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::CheckStatus;
    use crate::commitment::commit;
    use crate::merkle::MerkleTree;
    use crate::signer::tests::ManualAuthority;
    use crate::storage::RocksDbConfig;
    use crate::types::anchor::tests::{model_spec, sample_metadata, samples};
    use crate::types::{
        BatchWindow, DatasetAnchor, DatasetSplit, EvidenceTarget, Hash256, ModelAnchorId, ReceiptId,
        RecordType, WormRecord,
    };

    fn memory_engine() -> EvidenceEngine<InMemoryWormStore> {
        EvidenceEngine::with_store(
            Arc::new(InMemoryWormStore::new()),
            Arc::new(RootSigner::ephemeral(Arc::new(SystemClockAuthority))),
            EvidenceMetrics::detached(),
            Vec::new(),
        )
    }

    fn issue<S: WormStore + ?Sized>(engine: &EvidenceEngine<S>, chain: &ChainId, n: u32) {
        let model = ModelAnchorId::parse("m@v1").unwrap();
        for i in 0..n {
            engine
                .receipts
                .issue(
                    chain,
                    &model,
                    commit(format!("in-{i}").as_bytes(), None),
                    commit(format!("out-{i}").as_bytes(), None),
                    Vec::new(),
                )
                .unwrap();
        }
    }

    #[test]
    fn anchor_seal_verify_and_detect_tampering() {
        let engine = memory_engine();
        let ds = engine
            .registry
            .create_dataset_anchor("ds-A", DatasetSplit::Train, sample_metadata(), samples(4))
            .unwrap();
        engine.registry.create_model_anchor(model_spec(vec![ds.id.clone()])).unwrap();
        let chain = ChainId::new("m-v1-prod").unwrap();
        issue(&engine, &chain, 3);

        let SealOutcome::Sealed(root) = engine
            .sealer
            .seal_batch(&chain, BatchWindow::Sequence { start: 0, end: 3 })
            .unwrap()
        else {
            panic!("system clock authority never defers");
        };

        // r2 proves against the signed root but not against a foreign one.
        let r2 = ReceiptId::new(chain.clone(), 2);
        let check = engine.sealer.verify_inclusion(&r2, &root.id).unwrap();
        assert!(check.is_valid());
        assert!(check.proof.verify(&check.receipt.digest, &root.root).unwrap());
        let foreign = MerkleTree::build(&[Hash256::compute(b"x"), Hash256::compute(b"y")])
            .unwrap()
            .root();
        assert!(!check.proof.verify(&check.receipt.digest, &foreign).unwrap());

        // Tampering with the dataset is the only failure the scan reports.
        let key = "dataset_anchor/ds-A:train";
        let mut forged: DatasetAnchor = engine.store.get(key).unwrap().decode().unwrap();
        forged.sample_commitments[0] = commit(b"poisoned", None);
        engine.store.tamper(key, |r| {
            *r = WormRecord::seal_at(RecordType::DatasetAnchor, "ds-A:train", &forged, r.created_at.clone());
        });
        let report = engine.verifier.full_scan(&CancellationToken::new()).unwrap();
        assert!(report.tampered);
        let failures: Vec<&str> = report.failures().map(|(key, _)| key).collect();
        assert_eq!(failures, vec![key]);
        assert!(matches!(report.status_of(key), Some(CheckStatus::Failed(_))));
        assert!(!engine.registry.verify("ds-A:train").unwrap());
    }

    #[test]
    fn materialization_is_stable_across_requests() {
        let engine = memory_engine();
        let ds = engine
            .registry
            .create_dataset_anchor("ds-A", DatasetSplit::Train, sample_metadata(), samples(4))
            .unwrap();
        engine.registry.create_model_anchor(model_spec(vec![ds.id])).unwrap();
        let chain = ChainId::new("m-v1-prod").unwrap();
        issue(&engine, &chain, 3);
        engine.seal_due(16).unwrap();

        let target = EvidenceTarget::parse("m-v1-prod#2").unwrap();
        let a = engine.materializer.materialize(&target, &CancellationToken::new()).unwrap();
        let b = engine.materializer.materialize(&target, &CancellationToken::new()).unwrap();
        assert_eq!(serde_json::to_vec(&a).unwrap(), serde_json::to_vec(&b).unwrap());
        assert_eq!(a.verdict, crate::materializer::Verdict::Verified);
    }

    #[test]
    fn seal_due_defers_while_authority_is_offline() {
        let store = Arc::new(InMemoryWormStore::new());
        let authority = ManualAuthority::new(1_000);
        let engine = EvidenceEngine::with_store(
            store,
            Arc::new(RootSigner::ephemeral(authority.clone())),
            EvidenceMetrics::detached(),
            Vec::new(),
        );
        let ds = engine
            .registry
            .create_dataset_anchor("ds-A", DatasetSplit::Train, sample_metadata(), samples(2))
            .unwrap();
        engine.registry.create_model_anchor(model_spec(vec![ds.id])).unwrap();
        let chain = ChainId::new("m-v1-prod").unwrap();
        issue(&engine, &chain, 2);

        authority.set_online(false);
        let pass = engine.seal_due(8).unwrap();
        assert!(pass.sealed.is_empty());
        assert_eq!(pass.deferred.len(), 1);

        authority.set_online(true);
        let pass = engine.seal_due(8).unwrap();
        assert_eq!(pass.retried.sealed.len(), 1);
        assert!(engine.sealer.pending_unsigned_batches().unwrap().is_empty());
    }

    #[test]
    fn reopened_rocksdb_engine_recovers_state() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AnchorConfig {
            storage: StorageBackend::RocksDb(RocksDbConfig {
                path: dir.path().join("db").to_string_lossy().into_owned(),
                create_if_missing: true,
                sync_writes: false,
            }),
            signer: crate::config::SignerConfig {
                key: SigningKeySource::SeedHex("07".repeat(32)),
                ..Default::default()
            },
            ..Default::default()
        };

        let chain = ChainId::new("m-v1-prod").unwrap();
        {
            let engine = EvidenceEngine::open(&cfg, EvidenceMetrics::detached()).unwrap();
            let ds = engine
                .registry
                .create_dataset_anchor("ds-A", DatasetSplit::Train, sample_metadata(), samples(4))
                .unwrap();
            engine.registry.create_model_anchor(model_spec(vec![ds.id])).unwrap();
            issue(&engine, &chain, 3);
            engine.seal_due(2).unwrap();
        }

        let engine = EvidenceEngine::open(&cfg, EvidenceMetrics::detached()).unwrap();
        assert_eq!(engine.chains().unwrap(), vec![chain.clone()]);
        assert_eq!(engine.receipts.head(&chain).unwrap().next_sequence(), 3);
        assert_eq!(engine.sealer.sealed_windows(&chain).unwrap().len(), 1);

        let report = engine.recover(true, &CancellationToken::new()).unwrap();
        assert_eq!((report.datasets, report.models, report.chains), (1, 1, 1));
        assert!(!report.integrity.unwrap().tampered);

        // Sealing continues after the recovered window.
        let pass = engine.seal_due(16).unwrap();
        assert_eq!(pass.sealed.len(), 1);
        assert_eq!(pass.sealed[0].start, 2);
    }
}
