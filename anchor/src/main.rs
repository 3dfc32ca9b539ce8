// src/main.rs
//
// Scheduled evidence job that wires up the anchor library:
//
// - WORM storage (RocksDB or in-memory) and the batch-root signer
// - Prometheus metrics exporter on /metrics
// - Periodic sealing of every known receipt chain, with retries of windows
//   deferred while the timestamp authority was unreachable
// - Periodic full integrity scans of the store
//
// With ANCHOR_RUN_ONCE=1 the job runs a single sealing pass plus a scan and
// exits with a code describing the outcome (0 clean, 4 tampering found, ...).

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use anchor::{
    AnchorConfig, ConfigError, EvidenceEngine, EvidenceError, MetricsRegistry, Outcome,
    run_prometheus_http_server,
};

#[derive(Debug, thiserror::Error)]
enum JobError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to initialise metrics registry: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("scheduler task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Engine(#[from] EvidenceError),
}

impl JobError {
    fn exit_code(&self) -> i32 {
        match self {
            JobError::Engine(e) => e.outcome().exit_code(),
            _ => Outcome::Rejected.exit_code(),
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let code = match run_job().await {
        Ok(outcome) => outcome.exit_code(),
        Err(err) => {
            tracing::error!("fatal error: {err}");
            err.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run_job() -> Result<Outcome, JobError> {
    let cfg = AnchorConfig::from_env()?;
    let run_once = std::env::var("ANCHOR_RUN_ONCE").is_ok_and(|v| v == "1" || v == "true");

    // ---------------------------
    // Metrics registry + exporter
    // ---------------------------

    let metrics = Arc::new(MetricsRegistry::new()?);

    if cfg.metrics.enabled && !run_once {
        let metrics_clone = metrics.clone();
        let addr = cfg.metrics.listen_addr;
        tokio::spawn(async move {
            if let Err(e) = run_prometheus_http_server(metrics_clone, addr).await {
                tracing::error!("metrics HTTP server error: {e}");
            }
        });
        tracing::info!("metrics exporter listening on http://{addr}/metrics");
    }

    // ---------------------------
    // Shutdown on Ctrl-C
    // ---------------------------

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                cancel.cancel();
            }
        });
    }

    // The engine does blocking I/O (RocksDB, timestamp HTTP calls), so it
    // lives and dies on a blocking thread.
    let handle = Handle::current();
    let evidence = metrics.evidence.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let engine = EvidenceEngine::open(&cfg, evidence)?;
        if run_once {
            run_pass(&engine, &cfg, &cancel)
        } else {
            run_schedule(&engine, &cfg, &cancel, &handle)
        }
    })
    .await??;
    Ok(outcome)
}

/// One sealing pass followed by one integrity scan.
fn run_pass(
    engine: &EvidenceEngine,
    cfg: &AnchorConfig,
    cancel: &CancellationToken,
) -> Result<Outcome, EvidenceError> {
    let pass = engine.seal_due(cfg.schedule.max_batch_receipts)?;
    tracing::info!(
        sealed = pass.sealed.len(),
        deferred = pass.deferred.len(),
        retried = pass.retried.sealed.len(),
        "sealing pass finished"
    );

    let report = engine.verifier.full_scan(cancel)?;
    if report.tampered {
        return Ok(Outcome::IntegrityViolation);
    }
    if !pass.deferred.is_empty() || pass.retried.still_pending > 0 {
        return Ok(Outcome::Unavailable);
    }
    Ok(Outcome::Success)
}

fn run_schedule(
    engine: &EvidenceEngine,
    cfg: &AnchorConfig,
    cancel: &CancellationToken,
    handle: &Handle,
) -> Result<Outcome, EvidenceError> {
    tracing::info!(
        seal_interval_secs = cfg.schedule.seal_interval.as_secs(),
        audit_interval_secs = cfg.schedule.audit_interval.as_secs(),
        max_batch_receipts = cfg.schedule.max_batch_receipts,
        "starting evidence scheduler"
    );

    let mut last_scan: Option<Instant> = None;
    loop {
        match engine.seal_due(cfg.schedule.max_batch_receipts) {
            Ok(pass) if !pass.sealed.is_empty() || !pass.deferred.is_empty() => {
                tracing::info!(
                    sealed = pass.sealed.len(),
                    deferred = pass.deferred.len(),
                    "sealing pass finished"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::error!("sealing pass failed: {e}"),
        }

        if last_scan.is_none_or(|at| at.elapsed() >= cfg.schedule.audit_interval) {
            match engine.verifier.full_scan(cancel) {
                Ok(report) if report.tampered => {
                    tracing::error!(failed = report.failed, "integrity scan found tampering");
                }
                Ok(_) => {}
                Err(EvidenceError::Cancelled) => break,
                Err(e) => tracing::error!("integrity scan failed: {e}"),
            }
            last_scan = Some(Instant::now());
        }

        if wait(handle, cancel, cfg.schedule.seal_interval) {
            break;
        }
    }

    tracing::info!("evidence scheduler stopped");
    Ok(Outcome::Success)
}

/// Sleeps for `period`; returns `true` if cancelled first.
fn wait(handle: &Handle, cancel: &CancellationToken, period: Duration) -> bool {
    handle.block_on(async {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(period) => false,
        }
    })
}
