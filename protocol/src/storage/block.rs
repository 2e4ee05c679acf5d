//! # Block Structure
//!
//! A block is a header, an ordered transaction list, and the validator's
//! signature over the header.
//!
//! ## Header Layout
//!
//! The canonical encoding is fixed-width little-endian, 88 bytes, in field
//! order. It is the only input to the block hash and the only thing the
//! validator signs.
//!
//! ```text
//! ┌────────────┬─────────────┬──────────────────┬─────────────┬──────────┬──────────┐
//! │ version u32│ data_hash 32│ prev_block_hash 32│ timestamp i64│ height u32│ nonce u64│
//! └────────────┴─────────────┴──────────────────┴─────────────┴──────────┴──────────┘
//! ```
//!
//! ## Hashes
//!
//! - Block hash: SHA-256 of the canonical header bytes, memoized per block.
//! - `data_hash`: BLAKE3 Merkle root of the transaction ids. The signature
//!   covers the header, and the header covers the transactions through this
//!   root, so a relayed block cannot have its transaction list swapped.
//!
//! ## Immutability
//!
//! The header is private and has no mutable accessor. That is what makes
//! memoizing the hash sound: once computed it can never go stale.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{GENESIS_KEY_SEED, HEADER_ENCODED_LEN, HEADER_VERSION};
use crate::crypto::hash::{merkle_root, sha256, Hash};
use crate::crypto::keys::{Keypair, PublicKey, Signature};
use crate::transaction::Transaction;

/// Errors from block verification.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("block at height {height} is unsigned")]
    MissingSignature { height: u32 },

    #[error("block at height {height} has an invalid signature")]
    InvalidSignature { height: u32 },

    #[error("block at height {height} has data hash {got}, transactions hash to {expected}")]
    DataHashMismatch {
        height: u32,
        expected: Hash,
        got: Hash,
    },
}

/// A canonical header encoding of the wrong length.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed header encoding: expected {HEADER_ENCODED_LEN} bytes, got {0}")]
pub struct MalformedHeader(pub usize);

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Fixed-field metadata identifying a block's position and linkage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Header format version.
    pub version: u32,
    /// Merkle root of the block's transaction ids.
    pub data_hash: Hash,
    /// Hash of the previous block's header. Zero for genesis.
    pub prev_block_hash: Hash,
    /// Production time in nanoseconds since the UNIX epoch.
    pub timestamp: i64,
    /// Position in the chain; genesis is 0.
    pub height: u32,
    /// Free-form nonce. Always 0 for blocks produced by this node.
    pub nonce: u64,
}

impl Header {
    /// The fixed-width little-endian encoding used for hashing and signing.
    pub fn canonical_bytes(&self) -> [u8; HEADER_ENCODED_LEN] {
        let mut out = [0u8; HEADER_ENCODED_LEN];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(self.data_hash.as_bytes());
        out[36..68].copy_from_slice(self.prev_block_hash.as_bytes());
        out[68..76].copy_from_slice(&self.timestamp.to_le_bytes());
        out[76..80].copy_from_slice(&self.height.to_le_bytes());
        out[80..88].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    /// Inverse of [`canonical_bytes`](Self::canonical_bytes).
    pub fn from_canonical_bytes(bytes: &[u8]) -> Result<Self, MalformedHeader> {
        if bytes.len() != HEADER_ENCODED_LEN {
            return Err(MalformedHeader(bytes.len()));
        }
        // Lengths are fixed above, so the conversions below cannot fail.
        let le_u32 = |r: std::ops::Range<usize>| {
            u32::from_le_bytes(bytes[r].try_into().unwrap_or_default())
        };
        let le_u64 = |r: std::ops::Range<usize>| {
            u64::from_le_bytes(bytes[r].try_into().unwrap_or_default())
        };
        let hash_at = |r: std::ops::Range<usize>| Hash::from_slice(&bytes[r]).unwrap_or_default();

        Ok(Self {
            version: le_u32(0..4),
            data_hash: hash_at(4..36),
            prev_block_hash: hash_at(36..68),
            timestamp: le_u64(68..76) as i64,
            height: le_u32(76..80),
            nonce: le_u64(80..88),
        })
    }

    /// SHA-256 of the canonical encoding.
    pub fn hash(&self) -> Hash {
        sha256(&self.canonical_bytes())
    }
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

/// A header plus its ordered transactions and the validator's signature.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    /// Block metadata and chain linkage. Immutable after construction.
    header: Header,
    /// Ordered transactions, executed in this order on acceptance.
    pub transactions: Vec<Transaction>,
    /// Public key of the validator that signed the header.
    pub validator: Option<PublicKey>,
    /// Signature over the header's canonical bytes.
    pub signature: Option<Signature>,
    /// Memoized header hash. Never serialized.
    #[serde(skip)]
    hash: OnceLock<Hash>,
}

impl Block {
    /// An unsigned block from an explicit header.
    pub fn new(header: Header, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
            validator: None,
            signature: None,
            hash: OnceLock::new(),
        }
    }

    /// An unsigned block extending `prev`: next height, linked hash, data
    /// hash over `transactions`, current timestamp.
    pub fn from_prev_header(prev: &Header, transactions: Vec<Transaction>) -> Self {
        let header = Header {
            version: HEADER_VERSION,
            data_hash: compute_data_hash(&transactions),
            prev_block_hash: prev.hash(),
            timestamp: timestamp_nanos(),
            height: prev.height + 1,
            nonce: 0,
        };
        Self::new(header, transactions)
    }

    /// The genesis block.
    ///
    /// Fully deterministic so that every node derives the same genesis hash,
    /// and signed with the well-known genesis key so it verifies like any
    /// other block.
    pub fn genesis() -> Self {
        let header = Header {
            version: HEADER_VERSION,
            data_hash: Hash::zero(),
            prev_block_hash: Hash::zero(),
            timestamp: 0,
            height: 0,
            nonce: 0,
        };
        let mut block = Self::new(header, Vec::new());
        block.sign(&Keypair::from_seed(&GENESIS_KEY_SEED));
        block
    }

    /// The block's header.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Shorthand for `header().height`.
    pub fn height(&self) -> u32 {
        self.header.height
    }

    /// Header hash, computed once and cached.
    pub fn hash(&self) -> Hash {
        *self.hash.get_or_init(|| self.header.hash())
    }

    /// Sign the canonical header bytes.
    pub fn sign(&mut self, keypair: &Keypair) {
        self.signature = Some(keypair.sign(&self.header.canonical_bytes()));
        self.validator = Some(keypair.public_key());
    }

    /// Check the validator signature over the header, then the data hash
    /// over the transactions. Transaction signatures are not checked here;
    /// they were checked when each transaction entered a pool.
    pub fn verify(&self) -> Result<(), BlockError> {
        let height = self.header.height;
        let (Some(validator), Some(signature)) = (&self.validator, &self.signature) else {
            return Err(BlockError::MissingSignature { height });
        };
        if !validator.verify(&self.header.canonical_bytes(), signature) {
            return Err(BlockError::InvalidSignature { height });
        }

        let expected = compute_data_hash(&self.transactions);
        if expected != self.header.data_hash {
            return Err(BlockError::DataHashMismatch {
                height,
                expected,
                got: self.header.data_hash,
            });
        }
        Ok(())
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header
            && self.transactions == other.transactions
            && self.validator == other.validator
            && self.signature == other.signature
    }
}

impl Eq for Block {}

/// Merkle root of the transaction ids, in block order.
pub fn compute_data_hash(transactions: &[Transaction]) -> Hash {
    let leaves: Vec<Hash> = transactions.iter().map(Transaction::hash).collect();
    merkle_root(&leaves)
}

/// Current wall-clock time in nanoseconds since the UNIX epoch.
pub fn timestamp_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_tx(data: &[u8]) -> Transaction {
        let mut tx = Transaction::new(data.to_vec());
        tx.sign(&Keypair::generate());
        tx
    }

    fn random_header(height: u32) -> Header {
        Header {
            version: 1,
            data_hash: Hash::zero(),
            prev_block_hash: Hash::random(),
            timestamp: timestamp_nanos(),
            height,
            nonce: 989_394,
        }
    }

    // -- 1. Canonical encoding ------------------------------------------------

    #[test]
    fn canonical_bytes_layout() {
        let header = Header {
            version: 1,
            data_hash: Hash::new([0xAA; 32]),
            prev_block_hash: Hash::new([0xBB; 32]),
            timestamp: 2,
            height: 3,
            nonce: 4,
        };
        let bytes = header.canonical_bytes();
        assert_eq!(bytes.len(), HEADER_ENCODED_LEN);
        assert_eq!(&bytes[0..4], &[1, 0, 0, 0]);
        assert!(bytes[4..36].iter().all(|b| *b == 0xAA));
        assert!(bytes[36..68].iter().all(|b| *b == 0xBB));
        assert_eq!(&bytes[68..76], &2i64.to_le_bytes());
        assert_eq!(&bytes[76..80], &3u32.to_le_bytes());
        assert_eq!(&bytes[80..88], &4u64.to_le_bytes());
    }

    #[test]
    fn canonical_bytes_decode() {
        let header = random_header(10);
        let decoded = Header::from_canonical_bytes(&header.canonical_bytes()).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(
            Header::from_canonical_bytes(&[0u8; 12]),
            Err(MalformedHeader(12))
        );
    }

    // -- 2. Hashing -----------------------------------------------------------

    #[test]
    fn block_hash_matches_header_hash_and_is_stable() {
        let block = Block::new(random_header(0), vec![]);
        let first = block.hash();
        assert!(!first.is_zero());
        assert_eq!(first, block.header().hash());
        assert_eq!(block.hash(), first);
    }

    #[test]
    fn hash_survives_serialization() {
        let mut block = Block::new(random_header(1), vec![]);
        block.sign(&Keypair::generate());
        let original = block.hash();
        let decoded: Block = bincode::deserialize(&bincode::serialize(&block).unwrap()).unwrap();
        assert_eq!(decoded.hash(), original);
    }

    // -- 3. Signing -------------------------------------------------------------

    #[test]
    fn sign_and_verify_block() {
        let kp = Keypair::generate();
        let mut block = Block::new(random_header(0), vec![]);
        block.sign(&kp);
        assert!(block.verify().is_ok());
        assert_eq!(block.validator, Some(kp.public_key()));
    }

    #[test]
    fn unsigned_block_fails() {
        let block = Block::new(random_header(4), vec![]);
        assert_eq!(block.verify(), Err(BlockError::MissingSignature { height: 4 }));
    }

    #[test]
    fn substituted_validator_fails() {
        let mut block = Block::new(random_header(0), vec![]);
        block.sign(&Keypair::generate());
        block.validator = Some(Keypair::generate().public_key());
        assert_eq!(block.verify(), Err(BlockError::InvalidSignature { height: 0 }));
    }

    #[test]
    fn flipped_signature_bit_fails() {
        let mut block = Block::new(random_header(0), vec![]);
        block.sign(&Keypair::generate());
        for byte in [0usize, 31, 63] {
            let mut tampered = block.clone();
            let mut sig = tampered.signature.take().unwrap().as_bytes().to_vec();
            sig[byte] ^= 0x80;
            tampered.signature = Some(Signature::from_slice(&sig).unwrap());
            assert!(tampered.verify().is_err(), "bit flip in byte {byte} went unnoticed");
        }
    }

    // -- 4. Data hash ----------------------------------------------------------

    #[test]
    fn swapped_transactions_fail_data_hash() {
        let kp = Keypair::generate();
        let mut block = Block::from_prev_header(&random_header(0), vec![signed_tx(b"a")]);
        block.sign(&kp);
        assert!(block.verify().is_ok());

        block.transactions = vec![signed_tx(b"b")];
        assert!(matches!(
            block.verify(),
            Err(BlockError::DataHashMismatch { height: 1, .. })
        ));
    }

    #[test]
    fn from_prev_header_links() {
        let prev = random_header(7);
        let block = Block::from_prev_header(&prev, vec![]);
        assert_eq!(block.height(), 8);
        assert_eq!(block.header().prev_block_hash, prev.hash());
        assert_eq!(block.header().data_hash, Hash::zero());
    }

    // -- 5. Genesis ------------------------------------------------------------

    #[test]
    fn genesis_is_deterministic_and_verifies() {
        let a = Block::genesis();
        let b = Block::genesis();
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.height(), 0);
        assert!(a.header().prev_block_hash.is_zero());
        assert!(a.verify().is_ok());
    }

    // -- 6. Encoding -----------------------------------------------------------

    #[test]
    fn block_encoding_preserves_every_field() {
        let kp = Keypair::generate();
        let mut block = Block::from_prev_header(
            &random_header(2),
            vec![signed_tx(b"one"), signed_tx(b"two")],
        );
        block.sign(&kp);

        let decoded: Block = bincode::deserialize(&bincode::serialize(&block).unwrap()).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.header(), block.header());
        assert_eq!(decoded.signature, block.signature);
        assert!(decoded.verify().is_ok());
    }
}
