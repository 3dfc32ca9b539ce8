//! RocksDB-backed WORM store.
//!
//! Records are persisted as canonical bincode envelopes in one column family
//! per record type (`"dataset_anchor"`, `"model_anchor"`, `"receipt"`,
//! `"batch_root"`, `"audit_event"`). Keys are the full record keys, so a
//! prefix scan inside a column family returns records in chain order.

use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteOptions,
};
use serde::{Deserialize, Serialize};

use super::{RecordIter, StorageError, WormStore, prefix_upper_bound, route};
use crate::types::{RecordType, WormRecord, canonical_bytes};

/// Configuration for [`RocksDbWormStore`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RocksDbConfig {
    /// Filesystem path to the RocksDB database directory.
    pub path: String,
    /// Whether to create the database and missing column families if they
    /// do not yet exist.
    pub create_if_missing: bool,
    /// fsync the WAL on every put.
    pub sync_writes: bool,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            path: "data/anchor-db".to_string(),
            create_if_missing: true,
            sync_writes: true,
        }
    }
}

/// RocksDB-backed implementation of [`WormStore`].
pub struct RocksDbWormStore {
    db: DB,
    sync_writes: bool,
    /// Serializes the check-then-put sequence of [`WormStore::put`].
    write_lock: Mutex<()>,
}

impl RocksDbWormStore {
    /// Opens (or creates) a RocksDB-backed store at the given path.
    ///
    /// The `"default"` column family is also created to keep RocksDB happy,
    /// but it is not used.
    pub fn open(cfg: &RocksDbConfig) -> Result<Self, StorageError> {
        let path = Path::new(&cfg.path);

        let mut opts = Options::default();
        opts.create_if_missing(cfg.create_if_missing);
        opts.create_missing_column_families(cfg.create_if_missing);

        let mut cfs = vec![ColumnFamilyDescriptor::new("default", Options::default())];
        cfs.extend(
            RecordType::ALL
                .iter()
                .map(|t| ColumnFamilyDescriptor::new(t.as_str(), Options::default())),
        );

        let db = DB::open_cf_descriptors(&opts, path, cfs)?;
        tracing::info!(path = %cfg.path, "opened rocksdb worm store");

        Ok(Self {
            db,
            sync_writes: cfg.sync_writes,
            write_lock: Mutex::new(()),
        })
    }

    fn cf(&self, record_type: RecordType) -> Result<Arc<BoundColumnFamily<'_>>, StorageError> {
        self.db
            .cf_handle(record_type.as_str())
            .ok_or(StorageError::MissingColumnFamily(record_type.as_str()))
    }

    fn decode(key: &[u8], value: &[u8]) -> Result<(String, WormRecord), StorageError> {
        let key = String::from_utf8(key.to_vec()).map_err(|e| StorageError::Codec {
            key: String::from_utf8_lossy(key).into_owned(),
            reason: e.to_string(),
        })?;
        let cfg = bincode::config::standard();
        match bincode::serde::decode_from_slice::<WormRecord, _>(value, cfg) {
            Ok((record, read)) if read == value.len() => Ok((key, record)),
            Ok((_, read)) => Err(StorageError::Codec {
                key,
                reason: format!("{} trailing bytes", value.len() - read),
            }),
            Err(e) => Err(StorageError::Codec {
                key,
                reason: e.to_string(),
            }),
        }
    }

    /// Writes raw bytes under `key`, bypassing the write-once rule.
    /// Simulates corruption of the underlying medium.
    #[cfg(test)]
    pub(crate) fn overwrite_raw(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let cf = self.cf(route(key)?)?;
        self.db.put_cf(&cf, key.as_bytes(), bytes)?;
        Ok(())
    }
}

impl WormStore for RocksDbWormStore {
    fn put(&self, key: &str, record: &WormRecord) -> Result<(), StorageError> {
        let cf = self.cf(route(key)?)?;
        let bytes = canonical_bytes(record);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);

        let _guard = self.write_lock.lock().map_err(|_| StorageError::Poisoned)?;
        if self.db.get_pinned_cf(&cf, key.as_bytes())?.is_some() {
            return Err(StorageError::AlreadyExists(key.to_string()));
        }
        self.db.put_cf_opt(&cf, key.as_bytes(), bytes, &write_opts)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<WormRecord, StorageError> {
        let cf = self.cf(route(key)?)?;
        match self.db.get_pinned_cf(&cf, key.as_bytes())? {
            None => Err(StorageError::NotFound(key.to_string())),
            Some(bytes) => Self::decode(key.as_bytes(), &bytes).map(|(_, record)| record),
        }
    }

    fn contains(&self, key: &str) -> Result<bool, StorageError> {
        let cf = self.cf(route(key)?)?;
        Ok(self.db.get_pinned_cf(&cf, key.as_bytes())?.is_some())
    }

    fn list_prefix(&self, record_type: RecordType, prefix: &str) -> RecordIter<'_> {
        let cf = match self.cf(record_type) {
            Ok(cf) => cf,
            Err(e) => return Box::new(std::iter::once(Err(e))),
        };
        let prefix = prefix.as_bytes().to_vec();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));

        Box::new(
            iter.take_while(move |item| match item {
                Ok((k, _)) => k.starts_with(&prefix),
                Err(_) => true,
            })
            .map(|item| {
                let (k, v) = item?;
                Self::decode(&k, &v)
            }),
        )
    }

    fn last_with_prefix(
        &self,
        record_type: RecordType,
        prefix: &str,
    ) -> Result<Option<(String, WormRecord)>, StorageError> {
        let cf = self.cf(record_type)?;
        let upper = prefix_upper_bound(prefix);
        let mut iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(upper.as_bytes(), Direction::Reverse),
        );
        match iter.next() {
            Some(Ok((k, v))) if k.starts_with(prefix.as_bytes()) => {
                Self::decode(&k, &v).map(Some)
            }
            Some(Err(e)) => Err(e.into()),
            _ => Ok(None),
        }
    }
}
