//! Commitment primitives.
//!
//! A commitment stands in for a payload that is never stored. Plain
//! commitments are deterministic over the payload alone; salted and keyed
//! commitments exist for low-entropy inputs (short text queries, categorical
//! features) that could otherwise be recovered by hashing a dictionary of
//! candidates offline.
//!
//! All functions here are pure.

use rand::RngCore;

use crate::types::{Commitment, Hash256};

const COMMIT_TAG: &[u8] = b"anchor/commit/v1";
const SALTED_COMMIT_TAG: &[u8] = b"anchor/commit-salted/v1";

/// Salt mixed into a commitment. Callers keep it next to the payload (not in
/// the WORM store) so the commitment can be re-derived at audit time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Salt(pub Vec<u8>);

impl Salt {
    /// 32 random bytes from the OS RNG.
    pub fn random() -> Self {
        let mut bytes = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Salt(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// 32-byte secret key for [`commit_keyed`].
#[derive(Clone, Eq, PartialEq)]
pub struct CommitmentKey([u8; 32]);

impl CommitmentKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derives a key from high-entropy key material under a fixed context.
    ///
    /// The context string should be globally unique per deployment and
    /// purpose, e.g. `"acme credit-scoring 2024 query commitments"`.
    pub fn derive(context: &str, material: &[u8]) -> Self {
        Self(blake3::derive_key(context, material))
    }
}

impl std::fmt::Debug for CommitmentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CommitmentKey(..)")
    }
}

/// Commits to `payload`, optionally mixing in a salt.
///
/// The salt is length-prefixed, so `(salt, payload)` pairs cannot be
/// re-split into a different pair with the same commitment.
pub fn commit(payload: &[u8], salt: Option<&Salt>) -> Commitment {
    let mut hasher = blake3::Hasher::new();
    match salt {
        None => {
            hasher.update(COMMIT_TAG);
        }
        Some(salt) => {
            hasher.update(SALTED_COMMIT_TAG);
            hasher.update(&(salt.0.len() as u64).to_le_bytes());
            hasher.update(&salt.0);
        }
    }
    hasher.update(payload);
    Commitment(Hash256(*hasher.finalize().as_bytes()))
}

/// Commits to `payload` under a secret key (BLAKE3 keyed mode).
pub fn commit_keyed(payload: &[u8], key: &CommitmentKey) -> Commitment {
    Commitment(Hash256(*blake3::keyed_hash(&key.0, payload).as_bytes()))
}
