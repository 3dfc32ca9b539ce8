//! In-memory WORM store.
//!
//! This implementation is useful for unit tests and ephemeral deployments.
//! It keeps all records in a `BTreeMap` per record type so that listings come
//! back in key order, exactly like the RocksDB backend.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::RwLock;

use super::{RecordIter, StorageError, WormStore, route};
use crate::types::{RecordType, WormRecord};

/// Number of records fetched per lock acquisition while listing.
const PAGE_SIZE: usize = 256;

/// In-memory implementation of [`WormStore`].
#[derive(Default)]
pub struct InMemoryWormStore {
    partitions: RwLock<BTreeMap<RecordType, BTreeMap<String, WormRecord>>>,
}

impl InMemoryWormStore {
    /// Creates a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of records currently stored.
    pub fn len(&self) -> usize {
        self.partitions
            .read()
            .map(|p| p.values().map(BTreeMap::len).sum())
            .unwrap_or(0)
    }

    /// Returns `true` if no records are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetches the next page of records strictly after `after`.
    fn page(
        &self,
        record_type: RecordType,
        prefix: &str,
        after: Option<&str>,
    ) -> Result<Vec<(String, WormRecord)>, StorageError> {
        let partitions = self.partitions.read().map_err(|_| StorageError::Poisoned)?;
        let Some(partition) = partitions.get(&record_type) else {
            return Ok(Vec::new());
        };
        let lower = match after {
            Some(key) => Bound::Excluded(key.to_string()),
            None => Bound::Included(prefix.to_string()),
        };
        Ok(partition
            .range((lower, Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .take(PAGE_SIZE)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    /// Overwrites a stored record in place, bypassing the write-once rule.
    /// Simulates tampering with the underlying medium.
    #[cfg(test)]
    pub(crate) fn tamper(&self, key: &str, f: impl FnOnce(&mut WormRecord)) {
        let record_type = route(key).unwrap();
        let mut partitions = self.partitions.write().unwrap();
        let record = partitions
            .get_mut(&record_type)
            .and_then(|p| p.get_mut(key))
            .expect("tampered key must exist");
        f(record);
    }

    /// Removes a record, bypassing the write-once rule.
    #[cfg(test)]
    pub(crate) fn remove(&self, key: &str) {
        let record_type = route(key).unwrap();
        let mut partitions = self.partitions.write().unwrap();
        partitions.get_mut(&record_type).and_then(|p| p.remove(key));
    }
}

impl WormStore for InMemoryWormStore {
    fn put(&self, key: &str, record: &WormRecord) -> Result<(), StorageError> {
        let record_type = route(key)?;
        let mut partitions = self.partitions.write().map_err(|_| StorageError::Poisoned)?;
        let partition = partitions.entry(record_type).or_default();
        if partition.contains_key(key) {
            return Err(StorageError::AlreadyExists(key.to_string()));
        }
        partition.insert(key.to_string(), record.clone());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<WormRecord, StorageError> {
        let record_type = route(key)?;
        let partitions = self.partitions.read().map_err(|_| StorageError::Poisoned)?;
        partitions
            .get(&record_type)
            .and_then(|p| p.get(key))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn contains(&self, key: &str) -> Result<bool, StorageError> {
        let record_type = route(key)?;
        let partitions = self.partitions.read().map_err(|_| StorageError::Poisoned)?;
        Ok(partitions
            .get(&record_type)
            .is_some_and(|p| p.contains_key(key)))
    }

    fn list_prefix(&self, record_type: RecordType, prefix: &str) -> RecordIter<'_> {
        Box::new(PagedIter {
            store: self,
            record_type,
            prefix: prefix.to_string(),
            after: None,
            buffer: VecDeque::new(),
            done: false,
        })
    }

    fn last_with_prefix(
        &self,
        record_type: RecordType,
        prefix: &str,
    ) -> Result<Option<(String, WormRecord)>, StorageError> {
        let partitions = self.partitions.read().map_err(|_| StorageError::Poisoned)?;
        let upper = super::prefix_upper_bound(prefix);
        Ok(partitions.get(&record_type).and_then(|p| {
            p.range::<str, _>((Bound::Included(prefix), Bound::Excluded(upper.as_str())))
                .next_back()
                .map(|(k, v)| (k.clone(), v.clone()))
        }))
    }
}

/// Listing iterator that re-acquires the read lock once per page, so long
/// scans never block writers for their whole duration.
struct PagedIter<'a> {
    store: &'a InMemoryWormStore,
    record_type: RecordType,
    prefix: String,
    after: Option<String>,
    buffer: VecDeque<(String, WormRecord)>,
    done: bool,
}

impl Iterator for PagedIter<'_> {
    type Item = Result<(String, WormRecord), StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.done {
            match self
                .store
                .page(self.record_type, &self.prefix, self.after.as_deref())
            {
                Ok(page) => {
                    self.done = page.len() < PAGE_SIZE;
                    self.after = page.last().map(|(k, _)| k.clone());
                    self.buffer.extend(page);
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AuditEvent, AuditEventKind, Hash256, record::audit_key};

    fn event(stream: &str, seq: u64) -> (String, WormRecord) {
        let ev = AuditEvent::new(
            stream,
            seq,
            AuditEventKind::VerificationRun {
                records_checked: seq,
                failures: 0,
            },
            seq,
            Hash256::ZERO,
        );
        (
            audit_key(stream, seq),
            WormRecord::seal(RecordType::AuditEvent, ev.id(), &ev),
        )
    }

    #[test]
    fn put_and_get_roundtrip() {
        let store = InMemoryWormStore::new();
        let (key, record) = event("registry", 0);
        store.put(&key, &record).unwrap();

        assert_eq!(store.get(&key).unwrap(), record);
        assert!(store.contains(&key).unwrap());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn second_put_fails_and_keeps_original() {
        let store = InMemoryWormStore::new();
        let (key, first) = event("registry", 0);
        let (_, second) = event("registry", 1);
        store.put(&key, &first).unwrap();

        let err = store.put(&key, &second).unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(ref k) if *k == key));
        assert_eq!(store.get(&key).unwrap(), first);
    }

    #[test]
    fn missing_key_is_not_found() {
        let store = InMemoryWormStore::new();
        assert!(matches!(
            store.get("receipt/c/00000000000000000000"),
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            store.get("bogus/key"),
            Err(StorageError::UnroutableKey(_))
        ));
    }

    #[test]
    fn listing_spans_pages_in_key_order() {
        let store = InMemoryWormStore::new();
        let n = PAGE_SIZE as u64 * 2 + 3;
        for seq in (0..n).rev() {
            let (key, record) = event("registry", seq);
            store.put(&key, &record).unwrap();
        }
        let (key, record) = event("other", 0);
        store.put(&key, &record).unwrap();

        let keys: Vec<String> = store
            .list_prefix(RecordType::AuditEvent, "audit_event/registry/")
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(keys.len() as u64, n);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(store.list(RecordType::AuditEvent).count() as u64, n + 1);

        let (last, _) = store
            .last_with_prefix(RecordType::AuditEvent, "audit_event/registry/")
            .unwrap()
            .unwrap();
        assert_eq!(last, audit_key("registry", n - 1));
    }

    #[test]
    fn verify_integrity_flags_only_tampered_record() {
        let store = InMemoryWormStore::new();
        for seq in 0..3 {
            let (key, record) = event("registry", seq);
            store.put(&key, &record).unwrap();
        }
        let victim = audit_key("registry", 1);
        store.tamper(&victim, |r| r.payload[0] ^= 0x80);

        let report = store.verify_integrity().unwrap();
        assert_eq!(report.checked, 3);
        assert_eq!(report.mismatched.len(), 1);
        assert_eq!(report.mismatched[0].0, victim);
    }
}
