//! Shared application state and the bridge to the blocking engine.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use anchor::{EvidenceEngine, EvidenceError, MetricsRegistry};

use crate::error::ApiError;

/// Shared state held by the API handlers.
///
/// This is wrapped in an [`Arc`] and passed to request handlers via Axum's
/// `State` extractor.
pub struct AppState {
    /// Embedded evidence engine (store + registry + chains + sealer).
    pub engine: Arc<EvidenceEngine>,
    /// Metrics registry shared between the engine and the API.
    pub metrics: Arc<MetricsRegistry>,
    /// Upper bound on receipts per batch when a request names no window.
    pub max_batch_receipts: u64,
    /// Cancelled on shutdown; long scans and materializations observe it.
    pub shutdown: CancellationToken,
}

/// Thread-safe alias for `AppState`.
pub type SharedState = Arc<AppState>;

impl AppState {
    /// Runs `f` against the engine on the blocking pool.
    ///
    /// Every engine call does synchronous storage I/O, and sealing may wait
    /// on the timestamp authority, so none of it runs on a runtime worker.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&EvidenceEngine, &CancellationToken) -> Result<T, EvidenceError> + Send + 'static,
    {
        let engine = self.engine.clone();
        let cancel = self.shutdown.clone();
        let joined = tokio::task::spawn_blocking(move || f(&engine, &cancel)).await;
        match joined {
            Ok(result) => result.map_err(ApiError::from),
            Err(e) => Err(ApiError::Internal(format!("engine task failed: {e}"))),
        }
    }
}
