//! Metrics and instrumentation for the evidence engine.
//!
//! This module defines Prometheus-compatible metrics for receipt issuance,
//! batch sealing, materialization and integrity scans, and exposes a small
//! HTTP exporter that serves `/metrics` in Prometheus text format.
//!
//! Typical usage in a binary:
//!
//! ```ignore
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//! use anchor::metrics::{MetricsRegistry, run_prometheus_http_server};
//!
//! let registry = Arc::new(MetricsRegistry::new()?);
//! let addr: SocketAddr = "127.0.0.1:9898".parse()?;
//!
//! // Spawn the HTTP exporter in the background:
//! tokio::spawn(run_prometheus_http_server(registry.clone(), addr));
//!
//! // Hand the metric handles to the engine:
//! let engine = EvidenceEngine::open(&cfg, registry.evidence.clone())?;
//! ```

pub mod prometheus;

pub use prometheus::{EvidenceMetrics, MetricsRegistry, run_prometheus_http_server};
