//! # Blockchain
//!
//! The height-indexed ledger. Owns the headers and blocks, the pluggable
//! [`Validator`], the persistence sink, and the single [`ContractState`]
//! every transaction executes against.
//!
//! ## Locking
//!
//! ```text
//! add_block ── commit mutex (one writer at a time) ─────────────────────┐
//!   │ validate      index.read()   (tip, prev header)                   │
//!   │ execute txs   state.lock()   (VM only)                            │
//!   │ append        index.write()  (push header/block, hash indexes)    │
//!   │ persist       no chain lock held, store.put(block)                │
//!   └───────────────────────────────────────────────────────────────────┘
//! readers ── index.read() only
//! ```
//!
//! Readers are never blocked behind VM execution or disk I/O; they only wait
//! for the append itself. The commit mutex keeps validation, execution and
//! append atomic with respect to other writers, so two blocks for the same
//! height cannot both pass validation.
//!
//! ## Invariants
//!
//! - `headers[i].height == i` for every `i`; genesis is at 0.
//! - Blocks are never mutated or removed once appended.
//! - A VM failure aborts the remaining transactions of that block and the
//!   block is not appended, but state writes from earlier transactions in
//!   the same block stay in place. There is no rollback.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::block::{Block, Header};
use super::db::{BlockStore, StoreError};
use super::state::ContractState;
use super::validator::{BlockValidator, ValidationError, Validator};
use crate::crypto::hash::Hash;
use crate::transaction::Transaction;
use crate::vm::{Vm, VmError};

/// Errors from chain reads and block ingestion.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("height {height} is beyond the chain tip {tip}")]
    OutOfRange { height: u32, tip: u32 },

    #[error("block rejected: {0}")]
    Validation(#[from] ValidationError),

    #[error("transaction {tx_index} of block {height} failed: {source}")]
    Execution {
        height: u32,
        tx_index: usize,
        #[source]
        source: VmError,
    },

    #[error("block appended but not persisted: {0}")]
    Storage(#[from] StoreError),
}

#[derive(Debug, Default)]
struct ChainIndex {
    headers: Vec<Header>,
    blocks: Vec<Arc<Block>>,
    by_hash: HashMap<Hash, u32>,
    /// Ids of every transaction sealed into an accepted block.
    tx_hashes: HashSet<Hash>,
}

impl ChainIndex {
    fn tip(&self) -> u32 {
        // Never empty: the genesis block is appended in `Blockchain::new`.
        self.headers.len().saturating_sub(1) as u32
    }

    fn push(&mut self, block: Arc<Block>) {
        self.by_hash.insert(block.hash(), block.height());
        self.tx_hashes
            .extend(block.transactions.iter().map(Transaction::hash));
        self.headers.push(block.header().clone());
        self.blocks.push(block);
    }

    fn out_of_range(&self, height: u32) -> ChainError {
        ChainError::OutOfRange {
            height,
            tip: self.tip(),
        }
    }
}

/// The node's ledger.
pub struct Blockchain {
    /// Headers, blocks and the hash lookup.
    index: RwLock<ChainIndex>,
    /// Shared contract state. Only the VM writes to it.
    state: Mutex<ContractState>,
    /// Serializes `add_block`.
    commit: Mutex<()>,
    /// Acceptance rules.
    validator: Box<dyn Validator>,
    /// Where accepted blocks go after they are appended.
    store: Arc<dyn BlockStore>,
}

impl Blockchain {
    /// Bootstrap a chain from `genesis`.
    ///
    /// Genesis bypasses the validator, but its transactions (normally none)
    /// are executed and it is persisted like any other block.
    pub fn new(genesis: Block, store: Arc<dyn BlockStore>) -> Result<Self, ChainError> {
        let chain = Self {
            index: RwLock::new(ChainIndex::default()),
            state: Mutex::new(ContractState::new()),
            commit: Mutex::new(()),
            validator: Box::new(BlockValidator),
            store,
        };
        chain.commit_block(genesis)?;
        Ok(chain)
    }

    /// Replace the acceptance rules.
    pub fn with_validator(mut self, validator: Box<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    /// Tip height. Genesis alone is height 0.
    pub fn height(&self) -> u32 {
        self.index.read().tip()
    }

    pub fn has_block(&self, height: u32) -> bool {
        height <= self.height()
    }

    pub fn get_header(&self, height: u32) -> Result<Header, ChainError> {
        let index = self.index.read();
        index
            .headers
            .get(height as usize)
            .cloned()
            .ok_or_else(|| index.out_of_range(height))
    }

    /// The tip header, read under one lock.
    pub fn current_header(&self) -> Header {
        let index = self.index.read();
        index.headers[index.headers.len() - 1].clone()
    }

    pub fn get_block(&self, height: u32) -> Result<Arc<Block>, ChainError> {
        let index = self.index.read();
        index
            .blocks
            .get(height as usize)
            .cloned()
            .ok_or_else(|| index.out_of_range(height))
    }

    pub fn get_block_by_hash(&self, hash: &Hash) -> Option<Arc<Block>> {
        let index = self.index.read();
        let height = *index.by_hash.get(hash)?;
        index.blocks.get(height as usize).cloned()
    }

    /// Blocks in `[from, to]`, clamped to the tip. Empty if `from` is past it.
    pub fn get_blocks(&self, from: u32, to: u32) -> Vec<Arc<Block>> {
        let index = self.index.read();
        let to = to.min(index.tip());
        if from > to {
            return Vec::new();
        }
        index.blocks[from as usize..=to as usize].to_vec()
    }

    /// Whether an accepted block already carries the transaction `hash`.
    pub fn has_transaction(&self, hash: &Hash) -> bool {
        self.index.read().tx_hashes.contains(hash)
    }

    /// Current value stored under `key` by contract execution.
    pub fn contract_value(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.state.lock().get(key).ok().map(<[u8]>::to_vec)
    }

    /// Number of keys in the contract state.
    pub fn contract_state_len(&self) -> usize {
        self.state.lock().len()
    }

    /// Validate, execute and append `block`, then hand it to the store.
    ///
    /// On [`ChainError::Storage`] the block *is* part of the chain; only the
    /// persistence step failed.
    pub fn add_block(&self, block: Block) -> Result<(), ChainError> {
        let _commit = self.commit.lock();

        if let Err(err) = self.validator.validate_block(self, &block) {
            debug!(height = block.height(), error = %err, "block failed validation");
            return Err(err.into());
        }
        self.commit_locked(block)
    }

    fn commit_block(&self, block: Block) -> Result<(), ChainError> {
        let _commit = self.commit.lock();
        self.commit_locked(block)
    }

    /// Execute, append, persist. Caller holds `commit`.
    fn commit_locked(&self, block: Block) -> Result<(), ChainError> {
        let height = block.height();
        self.execute(&block)?;

        let block = Arc::new(block);
        self.index.write().push(Arc::clone(&block));

        info!(
            height,
            hash = %block.hash(),
            txs = block.transactions.len(),
            "block added"
        );

        if let Err(err) = self.store.put(&block) {
            warn!(height, error = %err, "failed to persist block");
            return Err(err.into());
        }
        Ok(())
    }

    fn execute(&self, block: &Block) -> Result<(), ChainError> {
        let mut state = self.state.lock();
        for (tx_index, tx) in block.transactions.iter().enumerate() {
            let mut vm = Vm::new(&tx.data, &mut state);
            if let Err(source) = vm.run() {
                warn!(
                    height = block.height(),
                    tx_index,
                    error = %source,
                    "contract execution failed"
                );
                return Err(ChainError::Execution {
                    height: block.height(),
                    tx_index,
                    source,
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Blockchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blockchain")
            .field("height", &self.height())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
