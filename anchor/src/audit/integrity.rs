//! Full-store integrity verification.
//!
//! The verifier walks every record in dependency order (datasets, models,
//! receipts, batch roots, audit events) and re-derives it. Each record is
//! judged on its own: a record whose predecessor or referenced ancestor is
//! damaged is reported as inconclusive for that link, never as failed, so
//! that exactly the tampered records are flagged.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::{AuditLog, VERIFICATION_STREAM};
use crate::error::EvidenceError;
use crate::merkle::MerkleTree;
use crate::metrics::EvidenceMetrics;
use crate::receipts::load_window;
use crate::signer::verify_signature;
use crate::storage::{StorageError, WormStore};
use crate::types::{
    AuditEvent, AuditEventKind, BatchRoot, DatasetAnchor, Discrepancy, Hash256, InferenceReceipt,
    ModelAnchor, PublicKey, ReceiptId, RecordType, WormRecord,
    record::{audit_key, batch_key, dataset_key, model_key, receipt_key},
};

/// Verdict for one record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum CheckStatus {
    Passed,
    Failed(Discrepancy),
    /// The record itself is intact but a check depending on a damaged
    /// record could not be completed.
    Inconclusive(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RecordCheck {
    pub key: String,
    pub record_type: RecordType,
    pub status: CheckStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub checks: Vec<RecordCheck>,
    pub passed: u64,
    pub failed: u64,
    pub inconclusive: u64,
    /// At least one record failed.
    pub tampered: bool,
}

impl IntegrityReport {
    fn push(&mut self, key: String, record_type: RecordType, status: CheckStatus) {
        match &status {
            CheckStatus::Passed => self.passed += 1,
            CheckStatus::Failed(_) => {
                self.failed += 1;
                self.tampered = true;
            }
            CheckStatus::Inconclusive(_) => self.inconclusive += 1,
        }
        self.checks.push(RecordCheck {
            key,
            record_type,
            status,
        });
    }

    /// Failed records with their discrepancy.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &Discrepancy)> {
        self.checks.iter().filter_map(|c| match &c.status {
            CheckStatus::Failed(d) => Some((c.key.as_str(), d)),
            _ => None,
        })
    }

    pub fn status_of(&self, key: &str) -> Option<&CheckStatus> {
        self.checks.iter().find(|c| c.key == key).map(|c| &c.status)
    }

    pub fn records_checked(&self) -> u64 {
        self.checks.len() as u64
    }
}

/// Last record seen on a hash chain (receipt chain or audit stream).
struct ChainCursor {
    group: String,
    sequence: u64,
    key: String,
    /// `None` if that record failed its own checks.
    digest: Option<Hash256>,
}

/// Checks `prev_digest` of record `(group, sequence)` against the cursor.
fn check_link(
    cursor: Option<&ChainCursor>,
    group: &str,
    sequence: u64,
    prev_digest: &Hash256,
    predecessor_key: impl FnOnce() -> String,
) -> CheckStatus {
    if sequence == 0 {
        // Head sentinel is covered by the record's own check.
        return CheckStatus::Passed;
    }
    match cursor {
        Some(c) if c.group == group && c.sequence + 1 == sequence => match c.digest {
            Some(d) if d == *prev_digest => CheckStatus::Passed,
            Some(_) => CheckStatus::Failed(Discrepancy::BrokenChainLink {
                predecessor: c.key.clone(),
            }),
            None => CheckStatus::Inconclusive(format!("predecessor {} is damaged", c.key)),
        },
        _ => CheckStatus::Failed(Discrepancy::MissingReference(predecessor_key())),
    }
}

/// `(group, sequence)` of keys shaped `{type}/{group}/{sequence}`.
fn group_and_sequence(key: &str) -> Option<(&str, u64)> {
    let mut parts = key.splitn(3, '/');
    let _record_type = parts.next()?;
    let group = parts.next()?;
    let sequence = parts.next()?.parse().ok()?;
    Some((group, sequence))
}

/// Walks the store and re-derives every record.
pub struct IntegrityVerifier<S: ?Sized> {
    store: Arc<S>,
    audit: Arc<AuditLog<S>>,
    metrics: EvidenceMetrics,
    trusted_keys: Vec<PublicKey>,
}

impl<S: WormStore + ?Sized> IntegrityVerifier<S> {
    pub fn new(store: Arc<S>, audit: Arc<AuditLog<S>>, metrics: EvidenceMetrics) -> Self {
        Self {
            store,
            audit,
            metrics,
            trusted_keys: Vec::new(),
        }
    }

    /// Batch roots signed by any other key are reported as
    /// [`Discrepancy::UntrustedSigner`]. An empty set trusts every key.
    pub fn with_trusted_keys(mut self, keys: Vec<PublicKey>) -> Self {
        self.trusted_keys = keys;
        self
    }

    /// Scans the whole store.
    ///
    /// Cancellation is checked between records; a cancelled scan returns
    /// [`EvidenceError::Cancelled`] and records nothing. A completed scan
    /// appends one `TamperDetected` event per failure and a closing
    /// `VerificationRun` event to the verification stream.
    pub fn full_scan(&self, cancel: &CancellationToken) -> Result<IntegrityReport, EvidenceError> {
        let started = Instant::now();
        let mut scan = Scan::default();

        self.walk(RecordType::DatasetAnchor, cancel, |key, record| {
            scan.dataset(key, record)
        })?;
        self.walk(RecordType::ModelAnchor, cancel, |key, record| {
            scan.model(key, record)
        })?;
        self.walk(RecordType::Receipt, cancel, |key, record| {
            scan.receipt(key, record)
        })?;
        let store = self.store.as_ref();
        let trusted = &self.trusted_keys;
        self.walk(RecordType::BatchRoot, cancel, |key, record| {
            scan.batch(store, trusted, key, record)
        })?;
        self.walk(RecordType::AuditEvent, cancel, |key, record| {
            scan.audit_event(key, record)
        })?;

        let report = scan.report;
        for (key, discrepancy) in report.failures() {
            self.metrics.tamper_detected.inc();
            tracing::error!(%key, %discrepancy, "integrity scan: tamper detected");
            self.audit.record_or_warn(
                VERIFICATION_STREAM,
                AuditEventKind::TamperDetected {
                    key: key.to_string(),
                    discrepancy: discrepancy.clone(),
                },
            );
        }
        self.audit.record(
            VERIFICATION_STREAM,
            AuditEventKind::VerificationRun {
                records_checked: report.records_checked(),
                failures: report.failed,
            },
        )?;

        let elapsed = started.elapsed();
        self.metrics.scan_seconds.observe(elapsed.as_secs_f64());
        tracing::info!(
            checked = report.records_checked(),
            failed = report.failed,
            inconclusive = report.inconclusive,
            elapsed_ms = elapsed.as_millis() as u64,
            "integrity scan finished"
        );
        Ok(report)
    }

    /// Feeds every record of one type to `check`, turning undecodable
    /// envelopes into failures.
    fn walk(
        &self,
        record_type: RecordType,
        cancel: &CancellationToken,
        mut check: impl FnMut(String, Result<WormRecord, Discrepancy>) -> Result<(), EvidenceError>,
    ) -> Result<(), EvidenceError> {
        for item in self.store.list(record_type) {
            if cancel.is_cancelled() {
                tracing::info!(%record_type, "integrity scan cancelled");
                return Err(EvidenceError::Cancelled);
            }
            match item {
                Ok((key, record)) => check(key, Ok(record))?,
                Err(StorageError::Codec { key, reason }) => {
                    check(key, Err(Discrepancy::Undecodable(reason)))?
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Working state of one scan.
#[derive(Default)]
struct Scan {
    report: IntegrityReport,
    /// Anchor digests of datasets that passed.
    datasets: HashMap<String, Hash256>,
    /// Keys of every dataset / model present, intact or not.
    present: HashSet<String>,
    /// Model digests of models that passed.
    models: HashMap<String, Hash256>,
    receipt_cursor: Option<ChainCursor>,
    audit_cursor: Option<ChainCursor>,
}

impl Scan {
    /// Envelope, decode and domain check; `Err` carries the first failure.
    fn open<T: serde::de::DeserializeOwned>(
        key: &str,
        record: Result<WormRecord, Discrepancy>,
        check: impl FnOnce(&T) -> Result<(), Discrepancy>,
        expected_key: impl FnOnce(&T) -> String,
    ) -> Result<T, Discrepancy> {
        let value: T = record?.open(key)?;
        check(&value)?;
        let expected = expected_key(&value);
        if expected != key {
            return Err(Discrepancy::KeyMismatch {
                expected,
                actual: key.to_string(),
            });
        }
        Ok(value)
    }

    fn dataset(
        &mut self,
        key: String,
        record: Result<WormRecord, Discrepancy>,
    ) -> Result<(), EvidenceError> {
        self.present.insert(key.clone());
        let status = match Self::open::<DatasetAnchor>(&key, record, DatasetAnchor::check, |a| {
            dataset_key(&a.id)
        }) {
            Ok(anchor) => {
                self.datasets.insert(key.clone(), anchor.anchor_digest);
                CheckStatus::Passed
            }
            Err(d) => CheckStatus::Failed(d),
        };
        self.report.push(key, RecordType::DatasetAnchor, status);
        Ok(())
    }

    fn model(
        &mut self,
        key: String,
        record: Result<WormRecord, Discrepancy>,
    ) -> Result<(), EvidenceError> {
        self.present.insert(key.clone());
        let status = match Self::open::<ModelAnchor>(&key, record, ModelAnchor::check, |m| {
            model_key(&m.id)
        }) {
            Ok(model) => {
                let status = self.model_references(&model);
                if !matches!(status, CheckStatus::Failed(_)) {
                    self.models.insert(key.clone(), model.model_digest);
                }
                status
            }
            Err(d) => CheckStatus::Failed(d),
        };
        self.report.push(key, RecordType::ModelAnchor, status);
        Ok(())
    }

    fn model_references(&self, model: &ModelAnchor) -> CheckStatus {
        let mut status = CheckStatus::Passed;
        for pinned in &model.authorized_datasets {
            let dataset = dataset_key(&pinned.id);
            if !self.present.contains(&dataset) {
                return CheckStatus::Failed(Discrepancy::MissingReference(dataset));
            }
            match self.datasets.get(&dataset) {
                Some(digest) if *digest != pinned.anchor_digest => {
                    return CheckStatus::Failed(Discrepancy::PinnedDigest(pinned.id.to_string()));
                }
                Some(_) => {}
                None => status = CheckStatus::Inconclusive(format!("dataset {dataset} is damaged")),
            }
        }
        status
    }

    fn receipt(
        &mut self,
        key: String,
        record: Result<WormRecord, Discrepancy>,
    ) -> Result<(), EvidenceError> {
        let Some((chain, sequence)) = group_and_sequence(&key).map(|(c, s)| (c.to_string(), s))
        else {
            self.report.push(
                key.clone(),
                RecordType::Receipt,
                CheckStatus::Failed(Discrepancy::KeyMismatch {
                    expected: "receipt/{chain}/{sequence}".to_string(),
                    actual: key,
                }),
            );
            return Ok(());
        };

        let opened = Self::open::<InferenceReceipt>(&key, record, InferenceReceipt::check, |r| {
            receipt_key(&r.id)
        });
        let (status, digest) = match opened {
            Err(d) => (CheckStatus::Failed(d), None),
            Ok(receipt) => {
                let link = check_link(
                    self.receipt_cursor.as_ref(),
                    &chain,
                    sequence,
                    &receipt.prev_digest,
                    || receipt_key(&ReceiptId::new(receipt.id.chain.clone(), sequence - 1)),
                );
                let status = match link {
                    CheckStatus::Passed => self.receipt_model(&receipt),
                    other => other,
                };
                let digest = match status {
                    CheckStatus::Failed(_) => None,
                    _ => Some(receipt.digest),
                };
                (status, digest)
            }
        };
        self.receipt_cursor = Some(ChainCursor {
            group: chain,
            sequence,
            key: key.clone(),
            digest,
        });
        self.report.push(key, RecordType::Receipt, status);
        Ok(())
    }

    fn receipt_model(&self, receipt: &InferenceReceipt) -> CheckStatus {
        let model = model_key(&receipt.model_anchor);
        if !self.present.contains(&model) {
            return CheckStatus::Failed(Discrepancy::MissingReference(model));
        }
        match self.models.get(&model) {
            Some(digest) if *digest != receipt.model_digest => {
                CheckStatus::Failed(Discrepancy::PinnedDigest(receipt.model_anchor.to_string()))
            }
            Some(_) => CheckStatus::Passed,
            None => CheckStatus::Inconclusive(format!("model {model} is damaged or unverified")),
        }
    }

    fn batch<S: WormStore + ?Sized>(
        &mut self,
        store: &S,
        trusted: &[PublicKey],
        key: String,
        record: Result<WormRecord, Discrepancy>,
    ) -> Result<(), EvidenceError> {
        let opened = Self::open::<BatchRoot>(&key, record, |_| Ok(()), |b| batch_key(&b.id));
        let status = match opened {
            Err(d) => CheckStatus::Failed(d),
            Ok(batch) => Self::batch_status(store, trusted, &batch)?,
        };
        self.report.push(key, RecordType::BatchRoot, status);
        Ok(())
    }

    fn batch_status<S: WormStore + ?Sized>(
        store: &S,
        trusted: &[PublicKey],
        batch: &BatchRoot,
    ) -> Result<CheckStatus, EvidenceError> {
        if batch.receipt_count != batch.id.len() {
            return Ok(CheckStatus::Failed(Discrepancy::BatchRoot));
        }
        if !verify_signature(
            &batch.id.chain,
            &batch.root,
            &batch.timestamp,
            &batch.signature,
            &batch.public_key,
        ) {
            return Ok(CheckStatus::Failed(Discrepancy::Signature));
        }
        if !trusted.is_empty() && !trusted.contains(&batch.public_key) {
            return Ok(CheckStatus::Failed(Discrepancy::UntrustedSigner));
        }
        let receipts = match load_window(store, &batch.id.chain, batch.id.start, batch.id.end) {
            Ok(receipts) => receipts,
            Err(EvidenceError::IncompleteEvidence(missing)) => {
                return Ok(CheckStatus::Failed(Discrepancy::MissingReference(missing)));
            }
            Err(EvidenceError::TamperDetected { key, .. }) => {
                return Ok(CheckStatus::Inconclusive(format!("receipt {key} is damaged")));
            }
            Err(e) => return Err(e),
        };
        let leaves: Vec<Hash256> = receipts.iter().map(|r| r.digest).collect();
        if MerkleTree::build(&leaves)?.root() != batch.root {
            return Ok(CheckStatus::Failed(Discrepancy::BatchRoot));
        }
        Ok(CheckStatus::Passed)
    }

    fn audit_event(
        &mut self,
        key: String,
        record: Result<WormRecord, Discrepancy>,
    ) -> Result<(), EvidenceError> {
        let Some((stream, sequence)) = group_and_sequence(&key).map(|(g, s)| (g.to_string(), s))
        else {
            self.report.push(
                key.clone(),
                RecordType::AuditEvent,
                CheckStatus::Failed(Discrepancy::KeyMismatch {
                    expected: "audit_event/{stream}/{sequence}".to_string(),
                    actual: key,
                }),
            );
            return Ok(());
        };

        let opened = Self::open::<AuditEvent>(&key, record, AuditEvent::check, |e| {
            audit_key(&e.stream, e.sequence)
        });
        let (status, digest) = match opened {
            Err(d) => (CheckStatus::Failed(d), None),
            Ok(event) => {
                let status = check_link(
                    self.audit_cursor.as_ref(),
                    &stream,
                    sequence,
                    &event.prev_digest,
                    || audit_key(&stream, sequence - 1),
                );
                let digest = match status {
                    CheckStatus::Failed(_) => None,
                    _ => Some(event.digest),
                };
                (status, digest)
            }
        };
        self.audit_cursor = Some(ChainCursor {
            group: stream,
            sequence,
            key: key.clone(),
            digest,
        });
        self.report.push(key, RecordType::AuditEvent, status);
        Ok(())
    }
}
