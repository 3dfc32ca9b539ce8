//! Write-once storage backends.
//!
//! Every guarantee of the engine (immutable anchors, receipts and batch
//! roots) rests on [`WormStore::put`] refusing to overwrite an occupied key.
//! This module provides the trait and two implementations:
//!
//! - an in-memory store ([`mem::InMemoryWormStore`]) suitable for tests and
//!   ephemeral deployments,
//! - a RocksDB-backed store ([`rocksdb::RocksDbWormStore`]) with one column
//!   family per record type.

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::error::EvidenceError;
use crate::types::{Discrepancy, RecordType, WormRecord};

pub mod mem;
pub mod rocksdb;

pub use mem::InMemoryWormStore;
pub use rocksdb::{RocksDbConfig, RocksDbWormStore};

/// Storage-level error type.
#[derive(Debug, Error)]
pub enum StorageError {
    /// `put` targeted a key that is already occupied.
    #[error("key already exists: {0}")]
    AlreadyExists(String),
    #[error("key not found: {0}")]
    NotFound(String),
    /// The key does not start with a known record type prefix.
    #[error("key {0:?} does not belong to any record type")]
    UnroutableKey(String),
    /// Underlying RocksDB error.
    #[error("rocksdb: {0}")]
    RocksDb(#[from] ::rocksdb::Error),
    /// Required column family was not found.
    #[error("missing column family {0}")]
    MissingColumnFamily(&'static str),
    /// A stored envelope could not be decoded.
    #[error("undecodable envelope at {key}: {reason}")]
    Codec { key: String, reason: String },
    #[error("storage lock poisoned")]
    Poisoned,
}

/// Lazy sequence of `(key, record)` pairs in ascending key order.
pub type RecordIter<'a> = Box<dyn Iterator<Item = Result<(String, WormRecord), StorageError>> + 'a>;

/// Result of [`WormStore::verify_integrity`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreIntegrityReport {
    pub checked: u64,
    /// Keys whose envelope no longer matches its digest or key.
    pub mismatched: Vec<(String, Discrepancy)>,
}

impl StoreIntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.mismatched.is_empty()
    }
}

/// Append-only key/value store of [`WormRecord`] envelopes.
///
/// Implementations must make `put` atomic at single-key granularity: of two
/// concurrent `put`s to the same free key exactly one succeeds.
pub trait WormStore: Send + Sync {
    /// Stores `record` under `key`; fails with
    /// [`StorageError::AlreadyExists`] if the key is occupied, leaving the
    /// existing record untouched.
    fn put(&self, key: &str, record: &WormRecord) -> Result<(), StorageError>;

    fn get(&self, key: &str) -> Result<WormRecord, StorageError>;

    fn contains(&self, key: &str) -> Result<bool, StorageError>;

    /// Records of one type whose key starts with `prefix`.
    fn list_prefix(&self, record_type: RecordType, prefix: &str) -> RecordIter<'_>;

    /// Record with the greatest key under `prefix`, if any.
    fn last_with_prefix(
        &self,
        record_type: RecordType,
        prefix: &str,
    ) -> Result<Option<(String, WormRecord)>, StorageError>;

    /// Every record of one type.
    fn list(&self, record_type: RecordType) -> RecordIter<'_> {
        self.list_prefix(record_type, &record_type.prefix())
    }

    /// Recomputes every envelope digest and key binding.
    fn verify_integrity(&self) -> Result<StoreIntegrityReport, StorageError> {
        let mut report = StoreIntegrityReport::default();
        for record_type in RecordType::ALL {
            for item in self.list(record_type) {
                report.checked += 1;
                match item {
                    Ok((key, record)) => {
                        if let Err(d) = record.check_envelope(&key) {
                            report.mismatched.push((key, d));
                        }
                    }
                    Err(StorageError::Codec { key, reason }) => {
                        report.mismatched.push((key, Discrepancy::Undecodable(reason)));
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(report)
    }
}

/// Reads and opens the record at `key` as a `T`.
///
/// A missing key is [`EvidenceError::NotFound`]; an envelope that fails its
/// digest, key binding or decode is [`EvidenceError::TamperDetected`].
pub fn fetch<T, S>(store: &S, key: &str) -> Result<T, EvidenceError>
where
    T: DeserializeOwned,
    S: WormStore + ?Sized,
{
    let record = match store.get(key) {
        Ok(record) => record,
        Err(StorageError::Codec { key, reason }) => {
            return Err(EvidenceError::TamperDetected {
                key,
                discrepancy: Discrepancy::Undecodable(reason),
            });
        }
        Err(e) => return Err(e.into()),
    };
    record
        .open(key)
        .map_err(|discrepancy| EvidenceError::TamperDetected {
            key: key.to_string(),
            discrepancy,
        })
}

/// Exclusive upper bound of all keys under `prefix`.
///
/// Identifier components are restricted to `[A-Za-z0-9._-]` and separators
/// to `/:@#`, all of which sort before `~`.
pub(crate) fn prefix_upper_bound(prefix: &str) -> String {
    format!("{prefix}~")
}

/// Column family / partition a key belongs to.
pub(crate) fn route(key: &str) -> Result<RecordType, StorageError> {
    RecordType::of_key(key).ok_or_else(|| StorageError::UnroutableKey(key.to_string()))
}
