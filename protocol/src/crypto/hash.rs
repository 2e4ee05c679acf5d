//! # Hashing Utilities
//!
//! The 32-byte [`Hash`] type and the digest functions that produce it.
//! Basalt uses two hash functions, each for exactly one job:
//!
//! - **SHA-256** over a header's canonical bytes. This is the block hash,
//!   the thing `prev_block_hash` links to and the validator signs.
//! - **BLAKE3** for transaction ids and the Merkle tree over them that
//!   becomes a header's `data_hash`.
//!
//! The all-zero hash is a valid value but doubles as the "not computed yet"
//! sentinel and as the empty-tree Merkle root, so [`Hash::is_zero`] is
//! meaningful everywhere.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::HASH_LENGTH;

/// Errors from building a [`Hash`] out of untrusted input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HashError {
    #[error("invalid hash length: expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },

    #[error("invalid hex encoding: {0}")]
    InvalidHex(String),
}

// ---------------------------------------------------------------------------
// Hash
// ---------------------------------------------------------------------------

/// A fixed-width 32-byte digest.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash([u8; HASH_LENGTH]);

impl Hash {
    /// The all-zero hash.
    pub const fn zero() -> Self {
        Self([0u8; HASH_LENGTH])
    }

    /// Wraps raw digest bytes.
    pub const fn new(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Builds a hash from a slice, rejecting anything that isn't exactly
    /// 32 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, HashError> {
        let arr: [u8; HASH_LENGTH] = bytes.try_into().map_err(|_| HashError::InvalidLength {
            expected: HASH_LENGTH,
            got: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    /// Parses a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, HashError> {
        let bytes = hex::decode(s).map_err(|e| HashError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// A uniformly random hash. Handy for tests and for forging bad links.
    pub fn random() -> Self {
        let mut bytes = [0u8; HASH_LENGTH];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Returns `true` if every byte is zero.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; HASH_LENGTH]> for Hash {
    fn from(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Eight bytes is enough to tell hashes apart in logs.
        write!(f, "Hash({}..)", &self.to_hex()[..16])
    }
}

// ---------------------------------------------------------------------------
// Digest functions
// ---------------------------------------------------------------------------

/// SHA-256 of `data`.
///
/// # Example
///
/// ```
/// use basalt_protocol::crypto::hash::sha256;
///
/// let h = sha256(b"basalt");
/// assert!(!h.is_zero());
/// ```
pub fn sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Hash(hasher.finalize().into())
}

/// BLAKE3 of `data`.
pub fn blake3_hash(data: &[u8]) -> Hash {
    Hash(*blake3::hash(data).as_bytes())
}

/// BLAKE3 over several slices without concatenating them first.
pub fn blake3_hash_multi(parts: &[&[u8]]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    Hash(*hasher.finalize().as_bytes())
}

/// Binary Merkle root over `leaves`, hashed with BLAKE3.
///
/// An odd node at any level is paired with itself, and a single leaf is
/// hashed with itself so the root is never a raw leaf. An empty list yields
/// the zero hash.
pub fn merkle_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return Hash::zero();
    }

    let mut level: Vec<Hash> = leaves.to_vec();
    if level.len() == 1 {
        return blake3_hash_multi(&[level[0].as_ref(), level[0].as_ref()]);
    }

    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                blake3_hash_multi(&[left.as_ref(), right.as_ref()])
            })
            .collect();
    }

    level[0]
}
