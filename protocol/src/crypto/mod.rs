//! # Cryptographic Primitives
//!
//! Thin, typed wrappers around audited implementations:
//!
//! - **Ed25519** (`ed25519-dalek`) for block and transaction signatures.
//! - **SHA-256** (`sha2`) for block header hashes.
//! - **BLAKE3** for transaction ids and the per-block Merkle root.

pub mod hash;
pub mod keys;

pub use hash::{blake3_hash, merkle_root, sha256, Hash, HashError};
pub use keys::{KeyError, Keypair, PublicKey, Signature};
