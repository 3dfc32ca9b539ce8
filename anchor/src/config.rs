//! Top-level configuration for the evidence engine.
//!
//! This module aggregates configuration for:
//!
//! - storage (in-memory or RocksDB),
//! - signer key material and the trusted-timestamp endpoint,
//! - batching and audit-scan scheduling,
//! - metrics exporter (enable flag + listen address).
//!
//! Binaries start from [`AnchorConfig::default`] and apply `ANCHOR_*`
//! environment overrides with [`AnchorConfig::from_env`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::storage::RocksDbConfig;
use crate::types::PublicKey;

/// Errors raised while reading configuration overrides.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Where WORM records live.
#[derive(Clone, Debug)]
pub enum StorageBackend {
    /// Process-local store; contents are lost on exit.
    Memory,
    RocksDb(RocksDbConfig),
}

impl Default for StorageBackend {
    fn default() -> Self {
        Self::RocksDb(RocksDbConfig::default())
    }
}

/// Source of the Ed25519 key that signs batch roots.
#[derive(Clone, Debug, Default)]
pub enum SigningKeySource {
    /// Fresh key per process. Only useful for demos and tests.
    #[default]
    Ephemeral,
    /// 32-byte seed as 64 hex characters.
    SeedHex(String),
    /// File holding the hex seed.
    KeyFile(PathBuf),
}

/// Signer and timestamp authority configuration.
#[derive(Clone, Debug)]
pub struct SignerConfig {
    pub key: SigningKeySource,
    /// Base URL of an RFC 3161-style timestamp service. `None` uses the
    /// local clock.
    pub timestamp_url: Option<String>,
    pub timestamp_timeout: Duration,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            key: SigningKeySource::Ephemeral,
            timestamp_url: None,
            timestamp_timeout: Duration::from_secs(5),
        }
    }
}

/// Scheduled sealing and auditing.
#[derive(Clone, Debug)]
pub struct ScheduleConfig {
    /// Upper bound on receipts rolled into one batch root.
    pub max_batch_receipts: u64,
    pub seal_interval: Duration,
    pub audit_interval: Duration,
    /// Public keys whose batch signatures the integrity scan accepts. Empty
    /// accepts any key that verifies.
    pub trusted_keys: Vec<PublicKey>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            max_batch_receipts: 1_024,
            seal_interval: Duration::from_secs(60),
            audit_interval: Duration::from_secs(3_600),
            trusted_keys: Vec::new(),
        }
    }
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Clone, Debug)]
pub struct MetricsConfig {
    /// Whether to run a `/metrics` HTTP exporter.
    pub enabled: bool,
    /// Address to bind the metrics HTTP server to.
    pub listen_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        // Safe to unwrap: this is a fixed, valid address literal.
        let addr: SocketAddr = "127.0.0.1:9898"
            .parse()
            .expect("hard-coded metrics listen address should parse");
        Self {
            enabled: true,
            listen_addr: addr,
        }
    }
}

/// Top-level configuration for an evidence engine process.
#[derive(Clone, Debug, Default)]
pub struct AnchorConfig {
    pub storage: StorageBackend,
    pub signer: SignerConfig,
    pub schedule: ScheduleConfig,
    pub metrics: MetricsConfig,
}

impl AnchorConfig {
    /// Defaults overridden by `ANCHOR_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overridden by whatever `lookup` returns.
    ///
    /// | variable | meaning |
    /// |---|---|
    /// | `ANCHOR_STORAGE` | `memory` or `rocksdb` |
    /// | `ANCHOR_DB_PATH` | RocksDB directory |
    /// | `ANCHOR_DB_SYNC` | fsync every put (`true`/`false`) |
    /// | `ANCHOR_SIGNING_SEED` | hex Ed25519 seed |
    /// | `ANCHOR_SIGNING_KEY_FILE` | file holding the hex seed |
    /// | `ANCHOR_TSA_URL` | timestamp service base URL |
    /// | `ANCHOR_TSA_TIMEOUT_MS` | timestamp request timeout |
    /// | `ANCHOR_MAX_BATCH` | receipts per batch |
    /// | `ANCHOR_SEAL_INTERVAL_SECS` | scheduled sealing period |
    /// | `ANCHOR_AUDIT_INTERVAL_SECS` | scheduled integrity scan period |
    /// | `ANCHOR_TRUSTED_KEYS` | comma-separated hex public keys |
    /// | `ANCHOR_METRICS_ADDR` | exporter address, or `off` |
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        let mut rocks = RocksDbConfig::default();
        if let Some(path) = lookup("ANCHOR_DB_PATH") {
            rocks.path = path;
        }
        if let Some(sync) = lookup("ANCHOR_DB_SYNC") {
            rocks.sync_writes = parse_bool("ANCHOR_DB_SYNC", &sync)?;
        }
        cfg.storage = match lookup("ANCHOR_STORAGE").as_deref() {
            None | Some("rocksdb") => StorageBackend::RocksDb(rocks),
            Some("memory") => StorageBackend::Memory,
            Some(other) => return Err(invalid("ANCHOR_STORAGE", other, "expected memory or rocksdb")),
        };

        if let Some(seed) = lookup("ANCHOR_SIGNING_SEED") {
            cfg.signer.key = SigningKeySource::SeedHex(seed);
        } else if let Some(path) = lookup("ANCHOR_SIGNING_KEY_FILE") {
            cfg.signer.key = SigningKeySource::KeyFile(PathBuf::from(path));
        }
        if let Some(url) = lookup("ANCHOR_TSA_URL") {
            cfg.signer.timestamp_url = Some(url.trim_end_matches('/').to_string());
        }
        if let Some(ms) = lookup("ANCHOR_TSA_TIMEOUT_MS") {
            cfg.signer.timestamp_timeout =
                Duration::from_millis(parse_u64("ANCHOR_TSA_TIMEOUT_MS", &ms)?);
        }

        if let Some(max) = lookup("ANCHOR_MAX_BATCH") {
            let max = parse_u64("ANCHOR_MAX_BATCH", &max)?;
            if max == 0 {
                return Err(invalid("ANCHOR_MAX_BATCH", "0", "must be positive"));
            }
            cfg.schedule.max_batch_receipts = max;
        }
        if let Some(secs) = lookup("ANCHOR_SEAL_INTERVAL_SECS") {
            cfg.schedule.seal_interval =
                Duration::from_secs(parse_u64("ANCHOR_SEAL_INTERVAL_SECS", &secs)?);
        }
        if let Some(secs) = lookup("ANCHOR_AUDIT_INTERVAL_SECS") {
            cfg.schedule.audit_interval =
                Duration::from_secs(parse_u64("ANCHOR_AUDIT_INTERVAL_SECS", &secs)?);
        }
        if let Some(keys) = lookup("ANCHOR_TRUSTED_KEYS") {
            cfg.schedule.trusted_keys = keys
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(|k| {
                    PublicKey::from_hex(k)
                        .map_err(|e| invalid("ANCHOR_TRUSTED_KEYS", k, &e.to_string()))
                })
                .collect::<Result<_, _>>()?;
        }

        match lookup("ANCHOR_METRICS_ADDR").as_deref() {
            None => {}
            Some("off") => cfg.metrics.enabled = false,
            Some(addr) => {
                cfg.metrics.listen_addr = addr
                    .parse()
                    .map_err(|e: std::net::AddrParseError| {
                        invalid("ANCHOR_METRICS_ADDR", addr, &e.to_string())
                    })?;
            }
        }

        Ok(cfg)
    }
}

fn invalid(var: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_u64(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|e: std::num::ParseIntError| invalid(var, value, &e.to_string()))
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(invalid(var, value, "expected true or false")),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn defaults_without_overrides() {
        let cfg = AnchorConfig::from_lookup(lookup(&[])).unwrap();
        assert!(matches!(cfg.storage, StorageBackend::RocksDb(ref r) if r.path == "data/anchor-db"));
        assert!(matches!(cfg.signer.key, SigningKeySource::Ephemeral));
        assert_eq!(cfg.schedule.max_batch_receipts, 1_024);
        assert!(cfg.metrics.enabled);
    }

    #[test]
    fn overrides_apply() {
        let key = "ab".repeat(32);
        let cfg = AnchorConfig::from_lookup(lookup(&[
            ("ANCHOR_STORAGE", "memory"),
            ("ANCHOR_TSA_URL", "http://tsa.local:3180/"),
            ("ANCHOR_TSA_TIMEOUT_MS", "250"),
            ("ANCHOR_MAX_BATCH", "64"),
            ("ANCHOR_TRUSTED_KEYS", &format!("{key}, {key}")),
            ("ANCHOR_METRICS_ADDR", "off"),
        ]))
        .unwrap();
        assert!(matches!(cfg.storage, StorageBackend::Memory));
        assert_eq!(cfg.signer.timestamp_url.as_deref(), Some("http://tsa.local:3180"));
        assert_eq!(cfg.signer.timestamp_timeout, Duration::from_millis(250));
        assert_eq!(cfg.schedule.max_batch_receipts, 64);
        assert_eq!(cfg.schedule.trusted_keys.len(), 2);
        assert!(!cfg.metrics.enabled);
    }

    #[test]
    fn malformed_values_are_rejected() {
        for pairs in [
            [("ANCHOR_STORAGE", "postgres")],
            [("ANCHOR_MAX_BATCH", "0")],
            [("ANCHOR_SEAL_INTERVAL_SECS", "soon")],
            [("ANCHOR_TRUSTED_KEYS", "zz")],
            [("ANCHOR_METRICS_ADDR", "localhost")],
            [("ANCHOR_DB_SYNC", "maybe")],
        ] {
            assert!(AnchorConfig::from_lookup(lookup(&pairs)).is_err(), "{pairs:?}");
        }
    }
}
