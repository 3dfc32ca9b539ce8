// api-gateway/src/main.rs

//! API gateway binary.
//!
//! This binary exposes the evidence engine of the `anchor` crate over HTTP:
//!
//! - `GET /health`
//! - `POST /datasets`, `POST /models`, `POST /models/{id}/retire`
//! - `GET /anchors/{id}`, `POST /anchors/{id}/verify`
//! - `POST /receipts`, `GET /receipts/{id}`, `GET /chains`
//! - `POST /batches`, `GET /batches/pending`, `POST /batches/retry`
//! - `POST /verify`, `GET /materialize/{*id}`
//! - `POST /audit/scan`, `GET /audit/{stream}`
//!
//! It embeds an `EvidenceEngine` (configured from `ANCHOR_*` variables), a
//! background sealing loop, and a Prometheus metrics exporter on `/metrics`.

mod config;
mod error;
mod routes;
mod state;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

use anchor::{AnchorConfig, EvidenceEngine, MetricsRegistry, run_prometheus_http_server};
use config::ApiConfig;
use routes::{anchors, batches, evidence, health, receipts};
use state::{AppState, SharedState};

#[tokio::main]
async fn main() {
    // Basic tracing setup.
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "api_gateway=info,anchor=info".to_string()),
        )
        .init();

    if let Err(e) = run().await {
        tracing::error!("fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let api_cfg = ApiConfig::from_env().map_err(|e| e.to_string())?;
    let anchor_cfg = AnchorConfig::from_env().map_err(|e| e.to_string())?;

    // ---------------------------
    // Metrics
    // ---------------------------

    let metrics = Arc::new(
        MetricsRegistry::new()
            .map_err(|e| format!("failed to initialise metrics registry: {e}"))?,
    );

    if anchor_cfg.metrics.enabled {
        let metrics_clone = metrics.clone();
        let addr = anchor_cfg.metrics.listen_addr;
        tokio::spawn(async move {
            if let Err(e) = run_prometheus_http_server(metrics_clone, addr).await {
                tracing::error!("metrics HTTP server error: {e}");
            }
        });
        tracing::info!("metrics exporter listening on http://{}/metrics", addr);
    }

    // ---------------------------
    // Evidence engine
    // ---------------------------

    // Opening replays the store to rebuild caches, and the timestamp client
    // is blocking; both belong on the blocking pool.
    let engine = {
        let cfg = anchor_cfg.clone();
        let evidence = metrics.evidence.clone();
        tokio::task::spawn_blocking(move || EvidenceEngine::open(&cfg, evidence))
            .await
            .map_err(|e| format!("engine start-up task failed: {e}"))?
            .map_err(|e| format!("failed to open evidence engine: {e}"))?
    };

    let shutdown = CancellationToken::new();
    let app_state: SharedState = Arc::new(AppState {
        engine: Arc::new(engine),
        metrics: metrics.clone(),
        max_batch_receipts: anchor_cfg.schedule.max_batch_receipts,
        shutdown: shutdown.clone(),
    });

    // ---------------------------
    // Background sealing loop
    // ---------------------------

    let sealer_state = app_state.clone();
    let seal_interval = anchor_cfg.schedule.seal_interval;
    let sealer = tokio::spawn(async move {
        run_sealer(sealer_state, seal_interval).await;
    });

    // ---------------------------
    // HTTP router
    // ---------------------------

    let app = Router::new()
        .route("/health", get(health::health))
        .route("/datasets", post(anchors::create_dataset))
        .route("/models", post(anchors::create_model))
        .route("/models/{id}/retire", post(anchors::retire_model))
        .route("/anchors/{id}", get(anchors::get_anchor))
        .route("/anchors/{id}/verify", post(anchors::verify_anchor))
        .route("/receipts", post(receipts::issue_receipt))
        .route("/receipts/{id}", get(receipts::get_receipt))
        .route("/chains", get(receipts::list_chains))
        .route("/batches", post(batches::seal_batch))
        .route("/batches/pending", get(batches::pending_batches))
        .route("/batches/retry", post(batches::retry_pending))
        .route("/verify", post(evidence::verify_inclusion))
        .route("/materialize/{*id}", get(evidence::materialize))
        .route("/audit/scan", post(evidence::integrity_scan))
        .route("/audit/{stream}", get(evidence::audit_events))
        .with_state(app_state.clone());

    // ---------------------------
    // axum 0.8 server (hyper 1 / tokio 1.48 style)
    // ---------------------------

    tracing::info!("API gateway listening on http://{}", api_cfg.listen_addr);

    let listener = tokio::net::TcpListener::bind(api_cfg.listen_addr)
        .await
        .map_err(|e| format!("failed to bind {}: {e}", api_cfg.listen_addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .map_err(|e| format!("API server error: {e}"))?;

    let _ = sealer.await;
    // The engine may own a blocking HTTP client, which must not be dropped
    // on a runtime worker.
    let _ = tokio::task::spawn_blocking(move || drop(app_state)).await;

    Ok(())
}

/// Background sealing loop.
///
/// Periodically seals the next window of every known chain and retries
/// windows deferred while the timestamp authority was unreachable.
async fn run_sealer(state: SharedState, interval: std::time::Duration) {
    let interval = interval.max(std::time::Duration::from_secs(1));
    tracing::info!("batch sealer running with interval {}s", interval.as_secs());

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let max = state.max_batch_receipts;
        match state.blocking(move |engine, _| engine.seal_due(max)).await {
            Ok(pass) => {
                for batch in &pass.sealed {
                    tracing::info!(%batch, "sealed batch");
                }
                for batch in &pass.deferred {
                    tracing::warn!(%batch, "batch deferred, timestamp authority unavailable");
                }
            }
            Err(e) => tracing::warn!("sealing pass failed: {e:?}"),
        }
    }
}

/// Waits for Ctrl-C, then cancels background work.
async fn shutdown_signal(shutdown: CancellationToken) {
    let _ = signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
    shutdown.cancel();
}
