//! Disaster recovery: rebuilding every in-memory cache from the store.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::{AuditLog, IntegrityReport, IntegrityVerifier};
use crate::error::EvidenceError;
use crate::receipts::{BatchSealer, ReceiptChainManager};
use crate::registry::AnchorRegistry;
use crate::storage::WormStore;

/// What [`Recovery::rebuild`] restored.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub datasets: usize,
    pub models: usize,
    pub retired_models: usize,
    pub chains: usize,
    pub batches: usize,
    /// Integrity scan run before rebuilding, if requested.
    pub integrity: Option<IntegrityReport>,
}

/// Rebuilds registry, chain heads, sealed windows, signer watermarks and
/// audit stream heads purely from WORM contents.
pub struct Recovery<'a, S: ?Sized> {
    pub audit: &'a Arc<AuditLog<S>>,
    pub registry: &'a AnchorRegistry<S>,
    pub receipts: &'a ReceiptChainManager<S>,
    pub sealer: &'a BatchSealer<S>,
    pub verifier: &'a IntegrityVerifier<S>,
}

impl<S: WormStore + ?Sized> Recovery<'_, S> {
    /// Optionally scans the store first, then reloads every cache.
    ///
    /// Damaged records are skipped during the reload; the scan (when run)
    /// reports them.
    pub fn rebuild(
        &self,
        scan_first: bool,
        cancel: &CancellationToken,
    ) -> Result<RecoveryReport, EvidenceError> {
        let integrity = if scan_first {
            Some(self.verifier.full_scan(cancel)?)
        } else {
            None
        };

        self.audit.reset()?;
        let (datasets, models, retired_models) = self.registry.rebuild()?;
        let chains = self.receipts.rebuild()?;
        let batches = self.sealer.rebuild()?;

        tracing::info!(
            datasets,
            models,
            retired_models,
            chains,
            batches,
            "caches rebuilt from store"
        );
        Ok(RecoveryReport {
            datasets,
            models,
            retired_models,
            chains,
            batches,
            integrity,
        })
    }
}
