//! API gateway configuration.
//!
//! This only configures the HTTP listen address. The embedded evidence
//! engine is configured by `anchor::AnchorConfig::from_env()`.

use std::net::SocketAddr;

use anchor::ConfigError;

/// Configuration for the API gateway HTTP server.
#[derive(Clone, Debug)]
pub struct ApiConfig {
    /// Address to bind the HTTP server to.
    pub listen_addr: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        // Safe to unwrap: fixed, valid address literal.
        // Bind to all interfaces so a container port mapping (8081->8081) is
        // reachable from the host.
        let addr: SocketAddr = "0.0.0.0:8081"
            .parse()
            .expect("hard-coded API listen address should parse");
        Self { listen_addr: addr }
    }
}

impl ApiConfig {
    /// Defaults overridden by `ANCHOR_API_ADDR`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Ok(addr) = std::env::var("ANCHOR_API_ADDR") {
            cfg.listen_addr = addr.parse().map_err(|e: std::net::AddrParseError| {
                ConfigError::Invalid {
                    var: "ANCHOR_API_ADDR",
                    value: addr.clone(),
                    reason: e.to_string(),
                }
            })?;
        }
        Ok(cfg)
    }
}
