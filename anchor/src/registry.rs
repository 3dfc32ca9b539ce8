//! Store-backed anchor registry.
//!
//! The registry creates dataset and model anchors, persists them through the
//! [`WormStore`] and answers lookups. The store is the single source of
//! truth: the in-memory maps below are caches that [`AnchorRegistry::rebuild`]
//! can reconstruct at any time.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::audit::{AuditLog, REGISTRY_STREAM};
use crate::error::EvidenceError;
use crate::metrics::EvidenceMetrics;
use crate::storage::{StorageError, WormStore, fetch};
use crate::types::{
    Anchor, AuditEventKind, AuthorizedDataset, Commitment, DatasetAnchor, DatasetAnchorId,
    DatasetMetadata, DatasetSplit, Discrepancy, EvidenceTarget, ModelAnchor, ModelAnchorId,
    ModelAnchorSpec, RecordType, WormRecord, now_millis,
    record::{dataset_key, model_key},
};

/// Registry of dataset and model anchors.
pub struct AnchorRegistry<S: ?Sized> {
    store: Arc<S>,
    audit: Arc<AuditLog<S>>,
    metrics: EvidenceMetrics,
    datasets: RwLock<HashMap<DatasetAnchorId, DatasetAnchor>>,
    models: RwLock<HashMap<ModelAnchorId, ModelAnchor>>,
    /// Retired models and the reason given.
    retired: RwLock<HashMap<ModelAnchorId, String>>,
}

impl<S: WormStore + ?Sized> AnchorRegistry<S> {
    pub fn new(store: Arc<S>, audit: Arc<AuditLog<S>>, metrics: EvidenceMetrics) -> Self {
        Self {
            store,
            audit,
            metrics,
            datasets: RwLock::new(HashMap::new()),
            models: RwLock::new(HashMap::new()),
            retired: RwLock::new(HashMap::new()),
        }
    }

    /// Freezes a dataset split into an anchor and persists it.
    ///
    /// Fails with [`EvidenceError::DuplicateAnchor`] if `(dataset_id, split)`
    /// is already anchored, and with a Merkle error if `samples` is empty.
    pub fn create_dataset_anchor(
        &self,
        dataset_id: &str,
        split: DatasetSplit,
        metadata: DatasetMetadata,
        samples: Vec<Commitment>,
    ) -> Result<DatasetAnchor, EvidenceError> {
        let anchor = DatasetAnchor::build(dataset_id, split, metadata, samples, now_millis())?;
        let record = WormRecord::seal(RecordType::DatasetAnchor, anchor.id.as_str(), &anchor);
        self.put_anchor(&dataset_key(&anchor.id), &record, anchor.id.as_str())?;

        tracing::info!(
            anchor = %anchor.id,
            samples = anchor.sample_commitments.len(),
            digest = %anchor.anchor_digest,
            "dataset anchor created"
        );
        self.audit.record_or_warn(
            REGISTRY_STREAM,
            AuditEventKind::AnchorCreated {
                anchor: anchor.id.to_string(),
                digest: anchor.anchor_digest,
            },
        );
        self.datasets
            .write()?
            .insert(anchor.id.clone(), anchor.clone());
        Ok(anchor)
    }

    /// Registers a model version trained on already anchored datasets.
    ///
    /// Every authorized dataset must exist and verify before anything is
    /// written; each one is pinned to its current anchor digest.
    pub fn create_model_anchor(&self, spec: ModelAnchorSpec) -> Result<ModelAnchor, EvidenceError> {
        let id = ModelAnchorId::new(&spec.name, &spec.version)?;
        let key = model_key(&id);
        if self.store.contains(&key)? {
            return Err(EvidenceError::DuplicateAnchor(id.to_string()));
        }

        let mut authorized = Vec::with_capacity(spec.authorized_datasets.len());
        for dataset_id in &spec.authorized_datasets {
            let dataset = match self.load_dataset(dataset_id) {
                Err(EvidenceError::NotFound(_)) => {
                    return Err(EvidenceError::UnknownDatasetAnchor(dataset_id.to_string()));
                }
                other => other?,
            };
            authorized.push(AuthorizedDataset {
                id: dataset.id.clone(),
                anchor_digest: dataset.anchor_digest,
            });
        }

        let anchor = ModelAnchor::build(spec, authorized, now_millis())?;
        let record = WormRecord::seal(RecordType::ModelAnchor, anchor.id.as_str(), &anchor);
        self.put_anchor(&key, &record, anchor.id.as_str())?;

        tracing::info!(
            anchor = %anchor.id,
            datasets = anchor.authorized_datasets.len(),
            digest = %anchor.model_digest,
            "model anchor created"
        );
        self.audit.record_or_warn(
            REGISTRY_STREAM,
            AuditEventKind::AnchorCreated {
                anchor: anchor.id.to_string(),
                digest: anchor.model_digest,
            },
        );
        self.models.write()?.insert(anchor.id.clone(), anchor.clone());
        Ok(anchor)
    }

    fn put_anchor(&self, key: &str, record: &WormRecord, id: &str) -> Result<(), EvidenceError> {
        match self.store.put(key, record) {
            Ok(()) => Ok(()),
            Err(StorageError::AlreadyExists(_)) => Err(EvidenceError::DuplicateAnchor(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Looks up an anchor by its identifier (`"ds:split"` or `"name@version"`).
    pub fn get(&self, id: &str) -> Result<Anchor, EvidenceError> {
        match EvidenceTarget::parse(id)? {
            EvidenceTarget::Dataset(id) => self.get_dataset(&id).map(Anchor::Dataset),
            EvidenceTarget::Model(id) => self.get_model(&id).map(Anchor::Model),
            EvidenceTarget::Receipt(_) | EvidenceTarget::Batch(_) => {
                Err(EvidenceError::InvalidIdentifier {
                    kind: "anchor",
                    value: id.to_string(),
                })
            }
        }
    }

    pub fn get_dataset(&self, id: &DatasetAnchorId) -> Result<DatasetAnchor, EvidenceError> {
        if let Some(anchor) = self.datasets.read()?.get(id) {
            return Ok(anchor.clone());
        }
        self.load_dataset(id)
    }

    pub fn get_model(&self, id: &ModelAnchorId) -> Result<ModelAnchor, EvidenceError> {
        if let Some(anchor) = self.models.read()?.get(id) {
            return Ok(anchor.clone());
        }
        self.load_model(id)
    }

    /// Reads a dataset anchor from the store, checks it and caches it.
    fn load_dataset(&self, id: &DatasetAnchorId) -> Result<DatasetAnchor, EvidenceError> {
        let key = dataset_key(id);
        let loaded = fetch::<DatasetAnchor, _>(self.store.as_ref(), &key).and_then(|anchor| {
            anchor
                .check()
                .map(|()| anchor)
                .map_err(|discrepancy| EvidenceError::TamperDetected { key, discrepancy })
        });
        let anchor = self.surface(loaded)?;
        self.datasets.write()?.insert(id.clone(), anchor.clone());
        Ok(anchor)
    }

    fn load_model(&self, id: &ModelAnchorId) -> Result<ModelAnchor, EvidenceError> {
        let key = model_key(id);
        let loaded = fetch::<ModelAnchor, _>(self.store.as_ref(), &key).and_then(|anchor| {
            anchor
                .check()
                .map(|()| anchor)
                .map_err(|discrepancy| EvidenceError::TamperDetected { key, discrepancy })
        });
        let anchor = self.surface(loaded)?;
        self.models.write()?.insert(id.clone(), anchor.clone());
        Ok(anchor)
    }

    fn surface<T>(&self, result: Result<T, EvidenceError>) -> Result<T, EvidenceError> {
        if matches!(result, Err(EvidenceError::TamperDetected { .. })) {
            self.metrics.tamper_detected.inc();
        }
        self.audit.surface(REGISTRY_STREAM, result)
    }

    /// Re-derives the stored anchor and compares every digest.
    ///
    /// Always reads the store, never the cache. A mismatch is recorded as a
    /// `TamperDetected` audit event, evicts the cache entry and returns
    /// `Ok(false)`; a missing anchor is [`EvidenceError::NotFound`].
    pub fn verify(&self, id: &str) -> Result<bool, EvidenceError> {
        let result = match EvidenceTarget::parse(id)? {
            EvidenceTarget::Dataset(id) => {
                self.datasets.write()?.remove(&id);
                self.load_dataset(&id).map(|_| ())
            }
            EvidenceTarget::Model(id) => {
                self.models.write()?.remove(&id);
                self.load_model(&id).and_then(|model| self.check_references(&model))
            }
            EvidenceTarget::Receipt(_) | EvidenceTarget::Batch(_) => {
                return Err(EvidenceError::InvalidIdentifier {
                    kind: "anchor",
                    value: id.to_string(),
                });
            }
        };
        match result {
            Ok(()) => Ok(true),
            Err(EvidenceError::TamperDetected { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Every authorized dataset of `model` must still be present.
    fn check_references(&self, model: &ModelAnchor) -> Result<(), EvidenceError> {
        for dataset in &model.authorized_datasets {
            if !self.store.contains(&dataset_key(&dataset.id))? {
                let missing = Err(EvidenceError::TamperDetected {
                    key: model_key(&model.id),
                    discrepancy: Discrepancy::MissingReference(dataset_key(&dataset.id)),
                });
                return self.surface(missing);
            }
        }
        Ok(())
    }

    /// Model anchor that may serve new receipts: present, intact and not
    /// retired. Anything else is [`EvidenceError::UnknownModelAnchor`].
    pub fn active_model(&self, id: &ModelAnchorId) -> Result<ModelAnchor, EvidenceError> {
        if self.retired.read()?.contains_key(id) {
            return Err(EvidenceError::UnknownModelAnchor(id.to_string()));
        }
        match self.get_model(id) {
            Err(EvidenceError::NotFound(_)) => Err(EvidenceError::UnknownModelAnchor(id.to_string())),
            other => other,
        }
    }

    /// Retires a model anchor. Retired models reject new receipts; their
    /// anchor and existing receipts stay in the store unchanged.
    ///
    /// Retiring an already retired model is a no-op.
    pub fn retire_model_anchor(&self, id: &ModelAnchorId, reason: &str) -> Result<(), EvidenceError> {
        match self.get_model(id) {
            Err(EvidenceError::NotFound(_)) => {
                return Err(EvidenceError::UnknownModelAnchor(id.to_string()));
            }
            other => other?,
        };
        let mut retired = self.retired.write()?;
        if retired.contains_key(id) {
            return Ok(());
        }
        self.audit.record(
            REGISTRY_STREAM,
            AuditEventKind::ModelRetired {
                model: id.to_string(),
                reason: reason.to_string(),
            },
        )?;
        retired.insert(id.clone(), reason.to_string());
        tracing::info!(model = %id, reason, "model anchor retired");
        Ok(())
    }

    pub fn is_retired(&self, id: &ModelAnchorId) -> Result<bool, EvidenceError> {
        Ok(self.retired.read()?.contains_key(id))
    }

    /// Drops every cache and reloads it from the store.
    ///
    /// Damaged records are skipped (the integrity scan reports them).
    /// Returns `(datasets, models, retired)` counts.
    pub fn rebuild(&self) -> Result<(usize, usize, usize), EvidenceError> {
        let mut datasets = HashMap::new();
        for item in self.store.list(RecordType::DatasetAnchor) {
            let Some(anchor) = open_intact::<DatasetAnchor>(item, DatasetAnchor::check)? else {
                continue;
            };
            datasets.insert(anchor.id.clone(), anchor);
        }

        let mut models = HashMap::new();
        for item in self.store.list(RecordType::ModelAnchor) {
            let Some(anchor) = open_intact::<ModelAnchor>(item, ModelAnchor::check)? else {
                continue;
            };
            models.insert(anchor.id.clone(), anchor);
        }

        let mut retired = HashMap::new();
        for event in self.audit.events(REGISTRY_STREAM)? {
            if let AuditEventKind::ModelRetired { model, reason } = event.kind {
                retired.insert(ModelAnchorId::parse(&model)?, reason);
            }
        }

        let counts = (datasets.len(), models.len(), retired.len());
        *self.datasets.write()? = datasets;
        *self.models.write()? = models;
        *self.retired.write()? = retired;
        Ok(counts)
    }
}

/// Opens a listed record, returning `None` (with a warning) if it is damaged.
fn open_intact<T: serde::de::DeserializeOwned>(
    item: Result<(String, WormRecord), StorageError>,
    check: impl Fn(&T) -> Result<(), Discrepancy>,
) -> Result<Option<T>, EvidenceError> {
    let (key, record) = match item {
        Ok(kv) => kv,
        Err(StorageError::Codec { key, reason }) => {
            tracing::warn!(%key, %reason, "skipping undecodable record");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    match record.open::<T>(&key).and_then(|v| check(&v).map(|()| v)) {
        Ok(value) => Ok(Some(value)),
        Err(discrepancy) => {
            tracing::warn!(%key, %discrepancy, "skipping damaged record");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryWormStore;
    use crate::types::anchor::tests::{model_spec, sample_metadata, samples};

    fn registry() -> (Arc<InMemoryWormStore>, AnchorRegistry<InMemoryWormStore>) {
        let store = Arc::new(InMemoryWormStore::new());
        let audit = Arc::new(AuditLog::new(store.clone()));
        let registry = AnchorRegistry::new(store.clone(), audit, EvidenceMetrics::detached());
        (store, registry)
    }

    fn ds_a(registry: &AnchorRegistry<InMemoryWormStore>) -> DatasetAnchor {
        registry
            .create_dataset_anchor("ds-A", DatasetSplit::Train, sample_metadata(), samples(4))
            .unwrap()
    }

    #[test]
    fn dataset_anchor_is_persisted_and_retrievable() {
        let (store, registry) = registry();
        let anchor = ds_a(&registry);

        assert!(store.contains(&dataset_key(&anchor.id)).unwrap());
        let fetched = registry.get("ds-A:train").unwrap();
        assert_eq!(fetched, Anchor::Dataset(anchor.clone()));
        assert!(registry.verify("ds-A:train").unwrap());
        assert_eq!(fetched.digest(), anchor.anchor_digest);
    }

    #[test]
    fn duplicate_dataset_anchor_is_rejected() {
        let (_, registry) = registry();
        ds_a(&registry);
        let err = registry
            .create_dataset_anchor("ds-A", DatasetSplit::Train, sample_metadata(), samples(2))
            .unwrap_err();
        assert!(matches!(err, EvidenceError::DuplicateAnchor(ref id) if id == "ds-A:train"));
    }

    #[test]
    fn model_anchor_pins_dataset_digests() {
        let (_, registry) = registry();
        let dataset = ds_a(&registry);
        let model = registry
            .create_model_anchor(model_spec(vec![dataset.id.clone()]))
            .unwrap();

        assert_eq!(model.id.as_str(), "m@v1");
        assert_eq!(model.authorized_datasets[0].anchor_digest, dataset.anchor_digest);
        assert!(registry.verify("m@v1").unwrap());

        let err = registry
            .create_model_anchor(model_spec(vec![dataset.id]))
            .unwrap_err();
        assert!(matches!(err, EvidenceError::DuplicateAnchor(_)));
    }

    #[test]
    fn dangling_dataset_reference_writes_nothing() {
        let (store, registry) = registry();
        let before = store.len();
        let missing = DatasetAnchorId::parse("ds-missing:train").unwrap();
        let err = registry.create_model_anchor(model_spec(vec![missing])).unwrap_err();

        assert!(matches!(err, EvidenceError::UnknownDatasetAnchor(ref id) if id == "ds-missing:train"));
        assert_eq!(store.len(), before);
    }

    #[test]
    fn tampered_dataset_fails_verification_and_is_audited() {
        let (store, registry) = registry();
        let dataset = ds_a(&registry);
        let key = dataset_key(&dataset.id);
        store.tamper(&key, |r| {
            let last = r.payload.len() - 1;
            r.payload[last] ^= 0x01;
        });

        assert!(!registry.verify("ds-A:train").unwrap());
        let events = registry.audit.events(REGISTRY_STREAM).unwrap();
        assert!(events.iter().any(|e| matches!(
            &e.kind,
            AuditEventKind::TamperDetected { key: k, .. } if *k == key
        )));

        let err = registry
            .create_model_anchor(model_spec(vec![dataset.id]))
            .unwrap_err();
        assert!(matches!(err, EvidenceError::TamperDetected { .. }));
    }

    #[test]
    fn retired_model_is_not_active() {
        let (_, registry) = registry();
        let dataset = ds_a(&registry);
        let model = registry.create_model_anchor(model_spec(vec![dataset.id])).unwrap();

        assert!(registry.active_model(&model.id).is_ok());
        registry.retire_model_anchor(&model.id, "superseded").unwrap();
        registry.retire_model_anchor(&model.id, "again").unwrap();
        assert!(matches!(
            registry.active_model(&model.id),
            Err(EvidenceError::UnknownModelAnchor(_))
        ));

        let retirements = registry
            .audit
            .events(REGISTRY_STREAM)
            .unwrap()
            .into_iter()
            .filter(|e| matches!(e.kind, AuditEventKind::ModelRetired { .. }))
            .count();
        assert_eq!(retirements, 1);
    }

    #[test]
    fn rebuild_restores_caches_from_store() {
        let (store, registry) = registry();
        let dataset = ds_a(&registry);
        let model = registry.create_model_anchor(model_spec(vec![dataset.id])).unwrap();
        registry.retire_model_anchor(&model.id, "superseded").unwrap();

        let audit = Arc::new(AuditLog::new(store.clone()));
        let fresh = AnchorRegistry::new(store, audit, EvidenceMetrics::detached());
        assert_eq!(fresh.rebuild().unwrap(), (1, 1, 1));
        assert!(fresh.is_retired(&model.id).unwrap());
    }

    #[test]
    fn get_rejects_non_anchor_identifiers() {
        let (_, registry) = registry();
        assert!(matches!(
            registry.get("chain#1"),
            Err(EvidenceError::InvalidIdentifier { .. })
        ));
        assert!(matches!(registry.get("ds-X:train"), Err(EvidenceError::NotFound(_))));
    }
}
