//! Audit log, integrity verification and recovery.
//!
//! The [`AuditLog`] appends hash-chained [`AuditEvent`]s per stream. The
//! [`IntegrityVerifier`] walks every stored record and re-derives it, and
//! [`Recovery`] rebuilds all in-memory caches from the store alone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::EvidenceError;
use crate::storage::{StorageError, WormStore};
use crate::types::{
    AuditEvent, AuditEventKind, Hash256, RecordType, WormRecord, now_millis,
    record::{audit_key, audit_stream_prefix},
    validate_component,
};

pub mod integrity;
pub mod recovery;

pub use integrity::{CheckStatus, IntegrityReport, IntegrityVerifier, RecordCheck};
pub use recovery::{Recovery, RecoveryReport};

/// Anchor creation and model retirement.
pub const REGISTRY_STREAM: &str = "registry";
/// Batch sealing and deferral.
pub const RECEIPTS_STREAM: &str = "receipts";
/// Integrity scans and the findings they produce.
pub const VERIFICATION_STREAM: &str = "verification";
/// Materialization requests and failed proofs found while materializing.
pub const MATERIALIZATION_STREAM: &str = "materialization";

/// Head of one audit stream.
#[derive(Clone, Copy, Debug, Default)]
struct StreamHead {
    loaded: bool,
    next_sequence: u64,
    last_digest: Hash256,
}

/// Append-only, hash-chained audit log on top of a [`WormStore`].
///
/// Appends are serialized per stream. When another writer (for example a
/// second process on the same RocksDB) took the next sequence number first,
/// the head is re-read from the store and the append is retried once before
/// [`EvidenceError::ConcurrentChainWrite`] is returned.
pub struct AuditLog<S: ?Sized> {
    store: Arc<S>,
    streams: Mutex<HashMap<String, Arc<Mutex<StreamHead>>>>,
}

impl<S: WormStore + ?Sized> AuditLog<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            streams: Mutex::new(HashMap::new()),
        }
    }

    fn head_slot(&self, stream: &str) -> Result<Arc<Mutex<StreamHead>>, EvidenceError> {
        let mut streams = self.streams.lock()?;
        Ok(streams.entry(stream.to_string()).or_default().clone())
    }

    /// Reads the current head of `stream` from the store.
    fn load_head(&self, stream: &str) -> Result<StreamHead, EvidenceError> {
        let last = self
            .store
            .last_with_prefix(RecordType::AuditEvent, &audit_stream_prefix(stream))?;
        let Some((key, record)) = last else {
            return Ok(StreamHead {
                loaded: true,
                ..StreamHead::default()
            });
        };

        match record.open::<AuditEvent>(&key) {
            Ok(event) => Ok(StreamHead {
                loaded: true,
                next_sequence: event.sequence + 1,
                last_digest: event.digest,
            }),
            Err(discrepancy) => {
                // A damaged head must not stop the log from recording the
                // damage; continue after it and let the scan flag it.
                tracing::warn!(%key, %discrepancy, "audit stream head is damaged");
                let sequence = key
                    .rsplit('/')
                    .next()
                    .and_then(|s| s.parse::<u64>().ok())
                    .ok_or_else(|| EvidenceError::TamperDetected {
                        key: key.clone(),
                        discrepancy: discrepancy.clone(),
                    })?;
                Ok(StreamHead {
                    loaded: true,
                    next_sequence: sequence + 1,
                    last_digest: record.digest,
                })
            }
        }
    }

    /// Appends one event to `stream`.
    pub fn record(&self, stream: &str, kind: AuditEventKind) -> Result<AuditEvent, EvidenceError> {
        validate_component("audit stream", stream)?;
        let slot = self.head_slot(stream)?;
        let mut head = slot.lock()?;
        if !head.loaded {
            *head = self.load_head(stream)?;
        }

        let mut retried = false;
        loop {
            let event = AuditEvent::new(
                stream,
                head.next_sequence,
                kind.clone(),
                now_millis(),
                head.last_digest,
            );
            let record = WormRecord::seal(RecordType::AuditEvent, event.id(), &event);
            match self.store.put(&audit_key(stream, event.sequence), &record) {
                Ok(()) => {
                    head.next_sequence = event.sequence + 1;
                    head.last_digest = event.digest;
                    tracing::debug!(stream, sequence = event.sequence, kind = %event.kind, "audit event");
                    return Ok(event);
                }
                Err(StorageError::AlreadyExists(_)) if !retried => {
                    retried = true;
                    *head = self.load_head(stream)?;
                }
                Err(StorageError::AlreadyExists(_)) => {
                    return Err(EvidenceError::ConcurrentChainWrite(format!(
                        "audit stream {stream}"
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Appends an event and only logs a failure.
    ///
    /// Used on error paths where the original error must reach the caller
    /// even if the audit write fails too.
    pub fn record_or_warn(&self, stream: &str, kind: AuditEventKind) {
        if let Err(e) = self.record(stream, kind) {
            tracing::error!(stream, "failed to append audit event: {e}");
        }
    }

    /// Records a `TamperDetected` event on `stream` if `result` carries one,
    /// then hands `result` back unchanged.
    pub fn surface<T>(
        &self,
        stream: &str,
        result: Result<T, EvidenceError>,
    ) -> Result<T, EvidenceError> {
        if let Err(EvidenceError::TamperDetected { key, discrepancy }) = &result {
            tracing::error!(%key, %discrepancy, "tamper detected");
            self.record_or_warn(
                stream,
                AuditEventKind::TamperDetected {
                    key: key.clone(),
                    discrepancy: discrepancy.clone(),
                },
            );
        }
        result
    }

    /// Every readable event of `stream`, in sequence order. Damaged records
    /// are skipped.
    pub fn events(&self, stream: &str) -> Result<Vec<AuditEvent>, EvidenceError> {
        let mut events = Vec::new();
        for item in self
            .store
            .list_prefix(RecordType::AuditEvent, &audit_stream_prefix(stream))
        {
            let (key, record) = match item {
                Ok(kv) => kv,
                Err(StorageError::Codec { key, reason }) => {
                    tracing::warn!(%key, %reason, "skipping undecodable audit record");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            match record.open::<AuditEvent>(&key) {
                Ok(event) => events.push(event),
                Err(d) => tracing::warn!(%key, %d, "skipping damaged audit record"),
            }
        }
        Ok(events)
    }

    /// Forgets all cached stream heads; they are re-read on next use.
    pub fn reset(&self) -> Result<(), EvidenceError> {
        self.streams.lock()?.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryWormStore;

    fn kind(n: u64) -> AuditEventKind {
        AuditEventKind::VerificationRun {
            records_checked: n,
            failures: 0,
        }
    }

    #[test]
    fn events_form_a_hash_chain() {
        let store = Arc::new(InMemoryWormStore::new());
        let log = AuditLog::new(store);
        let e0 = log.record(REGISTRY_STREAM, kind(0)).unwrap();
        let e1 = log.record(REGISTRY_STREAM, kind(1)).unwrap();
        let other = log.record(VERIFICATION_STREAM, kind(2)).unwrap();

        assert_eq!(e0.sequence, 0);
        assert!(e0.prev_digest.is_zero());
        assert_eq!(e1.sequence, 1);
        assert_eq!(e1.prev_digest, e0.digest);
        assert_eq!(other.sequence, 0);

        let events = log.events(REGISTRY_STREAM).unwrap();
        assert_eq!(events, vec![e0, e1]);
    }

    #[test]
    fn head_is_reloaded_from_store() {
        let store = Arc::new(InMemoryWormStore::new());
        let first = AuditLog::new(store.clone());
        let e0 = first.record(REGISTRY_STREAM, kind(0)).unwrap();

        let second = AuditLog::new(store);
        let e1 = second.record(REGISTRY_STREAM, kind(1)).unwrap();
        assert_eq!(e1.sequence, 1);
        assert_eq!(e1.prev_digest, e0.digest);
    }

    #[test]
    fn lost_race_is_retried_against_fresh_head() {
        let store = Arc::new(InMemoryWormStore::new());
        let a = AuditLog::new(store.clone());
        let b = AuditLog::new(store.clone());
        a.record(REGISTRY_STREAM, kind(0)).unwrap();
        b.record(REGISTRY_STREAM, kind(1)).unwrap();

        // `a` still believes the head is at sequence 0.
        let e = a.record(REGISTRY_STREAM, kind(2)).unwrap();
        assert_eq!(e.sequence, 2);
        assert_eq!(store.list(RecordType::AuditEvent).count(), 3);
    }

    #[test]
    fn invalid_stream_name_is_rejected() {
        let log = AuditLog::new(Arc::new(InMemoryWormStore::new()));
        assert!(matches!(
            log.record("bad/stream", kind(0)),
            Err(EvidenceError::InvalidIdentifier { .. })
        ));
    }
}
