//! Batch-root signing and timestamping.
//!
//! A batch root is bound to a trusted time before it is signed: the
//! [`TimestampAuthority`] attests the root digest, and the [`RootSigner`]
//! signs `(chain, root, attested time, token digest)` with Ed25519. Ed25519
//! signatures are deterministic (RFC 8032), so the same message always
//! yields the same signature.
//!
//! The signer keeps a per-chain watermark of the last signed timestamp and
//! refuses to sign anything earlier, which prevents backdating a batch
//! behind one that was already sealed.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use ed25519_dalek::{Signature as DalekSignature, Signer as _, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

use crate::types::{ChainId, Hash256, PublicKey, Signature, TimestampToken, now_millis};

pub mod tsa;

pub use tsa::HttpTimestampAuthority;

const SIGNING_TAG: &[u8] = b"anchor/batch-root-signature/v1";

/// Errors reported by the signer and timestamp authorities.
#[derive(Debug, Error)]
pub enum SignerError {
    /// The timestamp authority could not be reached or timed out.
    #[error("timestamp authority unavailable: {0}")]
    Unavailable(String),
    /// The authority answered with something we cannot use.
    #[error("timestamp authority protocol error: {0}")]
    Protocol(String),
    #[error("stale timestamp for chain {chain}: {requested} < {previous}")]
    StaleTimestamp {
        chain: String,
        previous: u64,
        requested: u64,
    },
    #[error("invalid signing key: {0}")]
    InvalidKey(String),
    #[error("signer state poisoned")]
    Poisoned,
}

/// Source of trusted time for batch roots.
pub trait TimestampAuthority: Send + Sync {
    /// Short name recorded in every token this authority issues.
    fn name(&self) -> &str;

    /// Attests that `digest` existed at the returned time.
    fn stamp(&self, digest: &Hash256) -> Result<TimestampToken, SignerError>;
}

/// Uses the local wall clock. The token is empty.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClockAuthority;

impl TimestampAuthority for SystemClockAuthority {
    fn name(&self) -> &str {
        "system-clock"
    }

    fn stamp(&self, _digest: &Hash256) -> Result<TimestampToken, SignerError> {
        Ok(TimestampToken {
            unix_ms: now_millis(),
            authority: self.name().to_string(),
            token: Vec::new(),
        })
    }
}

/// Signs batch roots with an Ed25519 key.
pub struct RootSigner {
    key: SigningKey,
    authority: Arc<dyn TimestampAuthority>,
    watermarks: Mutex<HashMap<ChainId, u64>>,
}

impl RootSigner {
    pub fn new(key: SigningKey, authority: Arc<dyn TimestampAuthority>) -> Self {
        Self {
            key,
            authority,
            watermarks: Mutex::new(HashMap::new()),
        }
    }

    /// Signer with a fresh random key. Signatures from an ephemeral key only
    /// verify against the public key stored next to them.
    pub fn ephemeral(authority: Arc<dyn TimestampAuthority>) -> Self {
        Self::new(SigningKey::generate(&mut OsRng), authority)
    }

    /// Signer from a hex-encoded 32-byte seed.
    pub fn from_seed_hex(
        seed_hex: &str,
        authority: Arc<dyn TimestampAuthority>,
    ) -> Result<Self, SignerError> {
        let bytes = hex::decode(seed_hex.trim())
            .map_err(|e| SignerError::InvalidKey(format!("seed is not hex: {e}")))?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| SignerError::InvalidKey(format!("seed has {} bytes", bytes.len())))?;
        Ok(Self::new(SigningKey::from_bytes(&seed), authority))
    }

    /// Signer from a file containing a hex-encoded seed.
    pub fn from_key_file(
        path: &Path,
        authority: Arc<dyn TimestampAuthority>,
    ) -> Result<Self, SignerError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SignerError::InvalidKey(format!("{}: {e}", path.display())))?;
        Self::from_seed_hex(&contents, authority)
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.key.verifying_key().to_bytes().to_vec())
    }

    pub fn authority_name(&self) -> &str {
        self.authority.name()
    }

    /// Obtains a timestamp for `root` from the configured authority.
    pub fn timestamp(&self, root: &Hash256) -> Result<TimestampToken, SignerError> {
        self.authority.stamp(root)
    }

    /// Signs `root` at `timestamp` for `chain` and advances the chain's
    /// watermark.
    ///
    /// Fails with [`SignerError::StaleTimestamp`] if `timestamp` is earlier
    /// than the last timestamp signed for the same chain. Equal timestamps
    /// are accepted.
    pub fn sign_root(
        &self,
        chain: &ChainId,
        root: &Hash256,
        timestamp: &TimestampToken,
    ) -> Result<Signature, SignerError> {
        let mut watermarks = self.watermarks.lock().map_err(|_| SignerError::Poisoned)?;
        let signature = self.sign_checked(&watermarks, chain, root, timestamp)?;
        watermarks.insert(chain.clone(), timestamp.unix_ms);
        Ok(signature)
    }

    /// Like [`sign_root`](Self::sign_root), but leaves the watermark alone.
    ///
    /// The caller raises it with [`restore_watermark`](Self::restore_watermark)
    /// once the signed root is durably stored, and must serialize signing
    /// per chain until then.
    pub fn sign_root_uncommitted(
        &self,
        chain: &ChainId,
        root: &Hash256,
        timestamp: &TimestampToken,
    ) -> Result<Signature, SignerError> {
        let watermarks = self.watermarks.lock().map_err(|_| SignerError::Poisoned)?;
        self.sign_checked(&watermarks, chain, root, timestamp)
    }

    fn sign_checked(
        &self,
        watermarks: &HashMap<ChainId, u64>,
        chain: &ChainId,
        root: &Hash256,
        timestamp: &TimestampToken,
    ) -> Result<Signature, SignerError> {
        if let Some(&previous) = watermarks.get(chain) {
            if timestamp.unix_ms < previous {
                return Err(SignerError::StaleTimestamp {
                    chain: chain.to_string(),
                    previous,
                    requested: timestamp.unix_ms,
                });
            }
        }
        let message = signing_message(chain, root, timestamp);
        Ok(Signature(self.key.sign(&message).to_bytes().to_vec()))
    }

    /// Raises the watermark of `chain` to at least `unix_ms`. Never lowers it.
    pub fn restore_watermark(&self, chain: &ChainId, unix_ms: u64) -> Result<(), SignerError> {
        let mut watermarks = self.watermarks.lock().map_err(|_| SignerError::Poisoned)?;
        let entry = watermarks.entry(chain.clone()).or_insert(unix_ms);
        *entry = (*entry).max(unix_ms);
        Ok(())
    }

    /// Last signed timestamp recorded for `chain`.
    pub fn watermark(&self, chain: &ChainId) -> Option<u64> {
        self.watermarks
            .lock()
            .ok()
            .and_then(|w| w.get(chain).copied())
    }
}

/// Exact byte string covered by a batch-root signature.
pub fn signing_message(chain: &ChainId, root: &Hash256, timestamp: &TimestampToken) -> Vec<u8> {
    let chain = chain.as_str().as_bytes();
    let mut message = Vec::with_capacity(SIGNING_TAG.len() + 8 + chain.len() + 32 + 8 + 32);
    message.extend_from_slice(SIGNING_TAG);
    message.extend_from_slice(&(chain.len() as u64).to_le_bytes());
    message.extend_from_slice(chain);
    message.extend_from_slice(root.as_bytes());
    message.extend_from_slice(&timestamp.unix_ms.to_le_bytes());
    message.extend_from_slice(timestamp.token_digest().as_bytes());
    message
}

/// Checks a batch-root signature using public material only.
///
/// Malformed keys or signatures verify as `false`.
pub fn verify_signature(
    chain: &ChainId,
    root: &Hash256,
    timestamp: &TimestampToken,
    signature: &Signature,
    public_key: &PublicKey,
) -> bool {
    let Ok(key_bytes) = <[u8; 32]>::try_from(public_key.as_bytes()) else {
        return false;
    };
    let Ok(vk) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig) = DalekSignature::from_slice(signature.as_bytes()) else {
        return false;
    };
    vk.verify_strict(&signing_message(chain, root, timestamp), &sig)
        .is_ok()
}
