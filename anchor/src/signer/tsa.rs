//! HTTP timestamp authority client.
//!
//! This implementation of [`super::TimestampAuthority`] talks to a
//! timestamping service over HTTP. It assumes the service exposes a JSON API
//! of the form:
//!
//! ```json
//! POST /timestamp
//! { "digest": "hex-encoded-batch-root" }
//!
//! Response:
//! { "unix_ms": 1718000000000, "token": "hex-encoded-opaque-token" }
//! ```
//!
//! The token is stored verbatim in the batch root and its digest is covered
//! by the batch signature, so an RFC 3161 response can be carried as-is.

use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use super::{SignerError, TimestampAuthority};
use crate::types::{Hash256, TimestampToken};

/// HTTP-based timestamp authority.
///
/// The client is `Send + Sync` and uses the blocking `reqwest` client;
/// async callers run sealing under `spawn_blocking`. Every transport failure
/// (including the configured timeout) maps to [`SignerError::Unavailable`],
/// which defers the batch instead of failing it.
pub struct HttpTimestampAuthority {
    base_url: String,
    client: Client,
}

impl HttpTimestampAuthority {
    /// Constructs a client pointing at `base_url`, e.g.
    /// `"http://127.0.0.1:3180"` (without a trailing slash).
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SignerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SignerError::Unavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Serialize)]
struct StampRequest {
    digest: String,
}

#[derive(Debug, Deserialize)]
struct StampResponse {
    unix_ms: u64,
    #[serde(default)]
    token: String,
}

impl StampResponse {
    fn into_token(self, authority: &str) -> Result<TimestampToken, SignerError> {
        let token = hex::decode(&self.token)
            .map_err(|e| SignerError::Protocol(format!("token is not hex: {e}")))?;
        Ok(TimestampToken {
            unix_ms: self.unix_ms,
            authority: authority.to_string(),
            token,
        })
    }
}

impl TimestampAuthority for HttpTimestampAuthority {
    fn name(&self) -> &str {
        &self.base_url
    }

    fn stamp(&self, digest: &Hash256) -> Result<TimestampToken, SignerError> {
        let url = self.endpoint("/timestamp");
        let req_body = StampRequest {
            digest: digest.to_hex(),
        };

        let resp = self
            .client
            .post(&url)
            .json(&req_body)
            .send()
            .map_err(|e| SignerError::Unavailable(format!("HTTP POST {url} failed: {e}")))?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(SignerError::Unavailable(format!(
                "timestamp authority returned HTTP status {status}"
            )));
        }
        if !status.is_success() {
            return Err(SignerError::Protocol(format!(
                "timestamp authority returned HTTP status {status}"
            )));
        }

        resp.json::<StampResponse>()
            .map_err(|e| SignerError::Protocol(format!("failed to parse JSON response: {e}")))?
            .into_token(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_avoids_double_slashes() {
        let tsa = HttpTimestampAuthority::new("http://tsa.local/", Duration::from_millis(50))
            .unwrap();
        assert_eq!(tsa.endpoint("/timestamp"), "http://tsa.local/timestamp");
    }

    #[test]
    fn stamp_response_can_be_deserialized() {
        let json = r#"{ "unix_ms": 1718000000000, "token": "0a0b" }"#;
        let resp: StampResponse = serde_json::from_str(json).expect("StampResponse should parse");
        let token = resp.into_token("tsa").unwrap();
        assert_eq!(token.unix_ms, 1_718_000_000_000);
        assert_eq!(token.token, vec![0x0a, 0x0b]);
    }

    #[test]
    fn non_hex_token_is_a_protocol_error() {
        let resp = StampResponse {
            unix_ms: 1,
            token: "xyz".to_string(),
        };
        assert!(matches!(resp.into_token("tsa"), Err(SignerError::Protocol(_))));
    }

    #[test]
    fn unreachable_authority_is_unavailable() {
        // Port 9 (discard) on localhost is closed in test environments.
        let tsa = HttpTimestampAuthority::new("http://127.0.0.1:9", Duration::from_millis(200))
            .unwrap();
        assert!(matches!(
            tsa.stamp(&Hash256::ZERO),
            Err(SignerError::Unavailable(_))
        ));
    }
}
