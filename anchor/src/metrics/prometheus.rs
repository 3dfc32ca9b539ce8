//! Prometheus-backed metrics and HTTP exporter.
//!
//! This module defines a [`MetricsRegistry`] that owns a Prometheus
//! registry and a set of strongly-typed evidence metrics, and an async HTTP
//! exporter that serves `/metrics` using `hyper`.

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    Method, Request, Response, StatusCode, body::Incoming, header, header::HeaderValue,
    server::conn::http1, service::service_fn,
};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};

/// Evidence-engine Prometheus metrics.
///
/// These are registered into a [`Registry`] and updated by the registry,
/// receipt manager, sealer, materializer and integrity verifier. All handles
/// are cheap to clone.
#[derive(Clone)]
pub struct EvidenceMetrics {
    /// Number of inference receipts persisted.
    pub receipts_issued: IntCounter,
    /// Number of batch roots signed and persisted.
    pub batches_sealed: IntCounter,
    /// Number of seal attempts deferred because the timestamp authority was
    /// unavailable.
    pub batches_deferred: IntCounter,
    /// Windows whose root is computed but not yet signed.
    pub pending_unsigned_batches: IntGauge,
    /// Number of records found tampered (by any check).
    pub tamper_detected: IntCounter,
    /// Number of inclusion proofs that failed verification.
    pub invalid_proofs: IntCounter,
    /// Latency of evidence materialization, in seconds.
    pub materialize_seconds: Histogram,
    /// Latency of sealing one batch (including the timestamp call), in seconds.
    pub seal_seconds: Histogram,
    /// Duration of a full integrity scan, in seconds.
    pub scan_seconds: Histogram,
}

impl EvidenceMetrics {
    /// Registers evidence metrics into the given `Registry`.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let receipts_issued = IntCounter::with_opts(Opts::new(
            "receipts_issued_total",
            "Total number of inference receipts persisted",
        ))?;
        registry.register(Box::new(receipts_issued.clone()))?;

        let batches_sealed = IntCounter::with_opts(Opts::new(
            "batches_sealed_total",
            "Total number of batch roots signed and persisted",
        ))?;
        registry.register(Box::new(batches_sealed.clone()))?;

        let batches_deferred = IntCounter::with_opts(Opts::new(
            "batches_deferred_total",
            "Total number of seal attempts deferred because the timestamp authority was unavailable",
        ))?;
        registry.register(Box::new(batches_deferred.clone()))?;

        let pending_unsigned_batches = IntGauge::with_opts(Opts::new(
            "pending_unsigned_batches",
            "Receipt windows whose Merkle root is computed but not yet signed",
        ))?;
        registry.register(Box::new(pending_unsigned_batches.clone()))?;

        let tamper_detected = IntCounter::with_opts(Opts::new(
            "tamper_detected_total",
            "Total number of records whose recomputed digest differs from the stored one",
        ))?;
        registry.register(Box::new(tamper_detected.clone()))?;

        let invalid_proofs = IntCounter::with_opts(Opts::new(
            "invalid_proofs_total",
            "Total number of Merkle inclusion proofs that failed verification",
        ))?;
        registry.register(Box::new(invalid_proofs.clone()))?;

        let materialize_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "materialize_seconds",
                "Time to reconstruct one evidence package in seconds",
            )
            .buckets(vec![
                0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
            ]),
        )?;
        registry.register(Box::new(materialize_seconds.clone()))?;

        let seal_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "seal_seconds",
                "Time to seal one receipt window (timestamp + signature) in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
        )?;
        registry.register(Box::new(seal_seconds.clone()))?;

        let scan_seconds = Histogram::with_opts(
            HistogramOpts::new("scan_seconds", "Duration of a full integrity scan in seconds")
                .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]),
        )?;
        registry.register(Box::new(scan_seconds.clone()))?;

        Ok(Self {
            receipts_issued,
            batches_sealed,
            batches_deferred,
            pending_unsigned_batches,
            tamper_detected,
            invalid_proofs,
            materialize_seconds,
            seal_seconds,
            scan_seconds,
        })
    }

    /// Metrics registered into a private registry nobody exports.
    ///
    /// For library users and tests that do not run an exporter.
    ///
    /// # Panics
    ///
    /// Panics only if the hard-coded metric definitions above are invalid.
    pub fn detached() -> Self {
        Self::register(&Registry::new()).expect("hard-coded metric definitions should register")
    }
}

/// Wrapper around a Prometheus registry and the evidence metrics.
///
/// This is the main handle you pass around in a binary. It can be wrapped
/// in an [`Arc`] and shared across threads/tasks.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    pub evidence: EvidenceMetrics,
}

impl MetricsRegistry {
    /// Creates a new `MetricsRegistry` with a fresh underlying `Registry`
    /// (prefix `anchor_`) and registers the evidence metrics.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("anchor".to_string()), None)?;
        let evidence = EvidenceMetrics::register(&registry)?;
        Ok(Self { registry, evidence })
    }

    /// Encodes all metrics in this registry into the Prometheus text format.
    pub fn gather_text(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("failed to encode Prometheus metrics: {e}");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Runs an HTTP server that exposes Prometheus metrics.
///
/// The server listens on `addr` and serves `GET /metrics` with the
/// Prometheus text exposition format. All other paths return 404.
///
/// This function is `async` and is intended to be spawned onto a Tokio
/// runtime.
pub async fn run_prometheus_http_server(
    metrics: Arc<MetricsRegistry>,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let svc = service_fn(move |req| {
                let metrics = metrics.clone();
                handle_request(req, metrics)
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, svc).await {
                tracing::warn!("prometheus HTTP server error: {err}");
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    metrics: Arc<MetricsRegistry>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(route(req.method(), req.uri().path(), &metrics))
}

fn route(method: &Method, path: &str, metrics: &MetricsRegistry) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/metrics") => {
            let mut resp = Response::new(Full::new(Bytes::from(metrics.gather_text())));
            resp.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            resp
        }
        _ => {
            let mut resp = Response::new(Full::new(Bytes::from("not found")));
            *resp.status_mut() = StatusCode::NOT_FOUND;
            resp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Registry;

    #[test]
    fn evidence_metrics_register_and_record() {
        let registry = Registry::new();
        let metrics = EvidenceMetrics::register(&registry).expect("register metrics");

        metrics.receipts_issued.inc();
        metrics.pending_unsigned_batches.set(2);
        metrics.seal_seconds.observe(0.045);
        metrics.materialize_seconds.observe(0.002);

        let metric_families = registry.gather();
        assert!(!metric_families.is_empty());
    }

    #[test]
    fn metrics_registry_gather_text_works() {
        let registry = MetricsRegistry::new().expect("create metrics registry");
        registry.evidence.batches_sealed.inc();
        let text = registry.gather_text();
        assert!(text.contains("anchor_batches_sealed_total"));
    }

    #[test]
    fn exporter_routes_only_metrics_path() {
        let registry = MetricsRegistry::new().expect("create metrics registry");
        assert_eq!(route(&Method::GET, "/metrics", &registry).status(), StatusCode::OK);
        assert_eq!(
            route(&Method::GET, "/other", &registry).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            route(&Method::POST, "/metrics", &registry).status(),
            StatusCode::NOT_FOUND
        );
    }
}
