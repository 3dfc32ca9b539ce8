//! Anchor library crate.
//!
//! This crate records cheap, tamper-evident commitments to ML lifecycle
//! events at write time and reconstructs full evidence only when an auditor
//! asks for it:
//!
//! - strongly-typed domain records and identifiers (`types`),
//! - salted and keyed commitments (`commitment`) and Merkle trees (`merkle`),
//! - write-once storage backends (`storage`),
//! - the anchor registry (`registry`) and receipt chains with signed batch
//!   roots (`receipts`, `signer`),
//! - hash-chained audit log, integrity scans and recovery (`audit`),
//! - on-demand evidence packages (`materializer`),
//! - Prometheus-based metrics (`metrics`),
//! - and a top-level configuration (`config`) plus the wired-up
//!   [`EvidenceEngine`] (`engine`).
//!
//! Serving layers, batch jobs and CLIs compose the engine; the crate itself
//! exposes no network protocol besides the metrics exporter.

pub mod audit;
pub mod commitment;
pub mod config;
pub mod engine;
pub mod error;
pub mod materializer;
pub mod merkle;
pub mod metrics;
pub mod receipts;
pub mod registry;
pub mod signer;
pub mod storage;
pub mod types;

// Re-export top-level configuration and the engine.
pub use config::{
    AnchorConfig, ConfigError, MetricsConfig, ScheduleConfig, SignerConfig, SigningKeySource,
    StorageBackend,
};
pub use engine::{EvidenceEngine, SealingPass};
pub use error::{EvidenceError, Outcome};

// Re-export the core components.
pub use audit::{
    AuditLog, CheckStatus, IntegrityReport, IntegrityVerifier, RecordCheck, Recovery,
    RecoveryReport,
};
pub use commitment::{CommitmentKey, Salt, commit, commit_keyed};
pub use materializer::{EvidencePackage, EvidenceSubject, InclusionEvidence, Materializer, Verdict};
pub use merkle::{MerkleError, MerkleProof, MerkleTree};
pub use receipts::{
    BatchSealer, InclusionCheck, ReceiptChainManager, RetryReport, SealOutcome,
};
pub use registry::AnchorRegistry;
pub use signer::{
    HttpTimestampAuthority, RootSigner, SignerError, SystemClockAuthority, TimestampAuthority,
};

// Re-export storage backends.
pub use storage::{
    InMemoryWormStore, RocksDbConfig, RocksDbWormStore, StorageError, WormStore,
};

// Re-export metrics registry and evidence metrics.
pub use metrics::{EvidenceMetrics, MetricsRegistry, run_prometheus_http_server};

// Re-export domain types at the crate root for convenience.
pub use types::*;
