//! # Block Validation
//!
//! The acceptance rules a block must pass before the chain executes and
//! appends it. Checks run in a fixed order and the first failure wins:
//!
//! ```text
//! 1. already have a block at this height?    → AlreadyExists
//! 2. height == tip + 1?                       → NonContiguousHeight
//! 3. prev_block_hash == hash(header[h - 1])?  → LinkageMismatch
//! 4. validator signature over the header?     → InvalidSignature
//!    data hash over the transactions?         → DataHashMismatch
//! ```
//!
//! There is no fork choice and no buffering of future blocks: anything that
//! does not extend the current tip is rejected outright.
//!
//! Transaction signatures are not re-checked. Every transaction was verified
//! when it entered a pool, and the block signature plus data hash bind the
//! list to a validator.

use thiserror::Error;

use super::block::{Block, BlockError};
use super::chain::Blockchain;
use crate::crypto::hash::Hash;

/// Reasons a block is refused. None of them mutate chain state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("chain already contains a block at height {height}")]
    AlreadyExists { height: u32 },

    #[error("block height {got} does not extend the tip (expected {expected})")]
    NonContiguousHeight { expected: u32, got: u32 },

    #[error("block {height} links to {got}, but the previous header hashes to {expected}")]
    LinkageMismatch {
        height: u32,
        expected: Hash,
        got: Hash,
    },

    #[error("block {height} has a missing or invalid validator signature")]
    InvalidSignature { height: u32 },

    #[error("block {height} data hash {got} does not match its transactions ({expected})")]
    DataHashMismatch {
        height: u32,
        expected: Hash,
        got: Hash,
    },
}

impl From<BlockError> for ValidationError {
    fn from(err: BlockError) -> Self {
        match err {
            BlockError::MissingSignature { height } | BlockError::InvalidSignature { height } => {
                ValidationError::InvalidSignature { height }
            }
            BlockError::DataHashMismatch {
                height,
                expected,
                got,
            } => ValidationError::DataHashMismatch {
                height,
                expected,
                got,
            },
        }
    }
}

/// Pluggable acceptance rules.
pub trait Validator: Send + Sync {
    fn validate_block(&self, chain: &Blockchain, block: &Block) -> Result<(), ValidationError>;
}

/// The default rule set: contiguity, linkage, signature.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockValidator;

impl Validator for BlockValidator {
    fn validate_block(&self, chain: &Blockchain, block: &Block) -> Result<(), ValidationError> {
        let height = block.height();

        if chain.has_block(height) {
            return Err(ValidationError::AlreadyExists { height });
        }

        let expected = chain.height() + 1;
        if height != expected {
            return Err(ValidationError::NonContiguousHeight {
                expected,
                got: height,
            });
        }

        // height >= 1 here: has_block(0) is always true.
        let prev = chain
            .get_header(height - 1)
            .map_err(|_| ValidationError::NonContiguousHeight {
                expected,
                got: height,
            })?;
        let prev_hash = prev.hash();
        if prev_hash != block.header().prev_block_hash {
            return Err(ValidationError::LinkageMismatch {
                height,
                expected: prev_hash,
                got: block.header().prev_block_hash,
            });
        }

        block.verify()?;
        Ok(())
    }
}
