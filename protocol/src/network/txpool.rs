//! # Transaction Pool
//!
//! De-duplicated staging area for transactions waiting to be included in a
//! block. Keyed by transaction hash; ordered for block assembly by the time
//! this node first saw each transaction.
//!
//! ## Lifecycle
//!
//! ```text
//! peer / API ──▶ contains? ──▶ verify ──▶ stamp first_seen ──▶ add
//!                                                              │
//! validator tick ◀── pending() (sorted by first_seen) ◀────────┘
//!        │
//!        └──▶ block produced ──▶ clear_pending()
//!
//! relayed / synced block accepted ──▶ remove_included(block.transactions)
//! ```
//!
//! ## Capacity
//!
//! The pool holds at most `max_size` transactions. When full, new
//! transactions are refused with [`TxPoolError::Full`]; nothing already in
//! the pool is evicted. Room is made when a block is produced here or when
//! a block carrying pooled transactions is accepted from a peer.

use dashmap::DashMap;
use thiserror::Error;

use crate::config::TXPOOL_MAX_SIZE;
use crate::crypto::hash::Hash;
use crate::transaction::Transaction;

/// Pool tuning.
#[derive(Debug, Clone)]
pub struct TxPoolConfig {
    /// Maximum number of transactions held at once.
    pub max_size: usize,
}

impl Default for TxPoolConfig {
    fn default() -> Self {
        Self {
            max_size: TXPOOL_MAX_SIZE,
        }
    }
}

/// Why a transaction was not added.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TxPoolError {
    #[error("transaction {0} is already in the pool")]
    Duplicate(Hash),

    #[error("pool is full ({0} transactions)")]
    Full(usize),
}

/// Concurrent transaction pool.
#[derive(Debug)]
pub struct TxPool {
    txs: DashMap<Hash, Transaction>,
    config: TxPoolConfig,
}

impl TxPool {
    pub fn new(config: TxPoolConfig) -> Self {
        Self {
            txs: DashMap::new(),
            config,
        }
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.txs.contains_key(hash)
    }

    /// Insert `tx`. The caller stamps `first_seen` beforehand.
    pub fn add(&self, tx: Transaction) -> Result<Hash, TxPoolError> {
        let hash = tx.hash();
        if self.txs.contains_key(&hash) {
            return Err(TxPoolError::Duplicate(hash));
        }
        if self.txs.len() >= self.config.max_size {
            return Err(TxPoolError::Full(self.config.max_size));
        }
        self.txs.insert(hash, tx);
        Ok(hash)
    }

    pub fn get(&self, hash: &Hash) -> Option<Transaction> {
        self.txs.get(hash).map(|e| e.value().clone())
    }

    pub fn remove(&self, hash: &Hash) -> Option<Transaction> {
        self.txs.remove(hash).map(|(_, tx)| tx)
    }

    /// Every pooled transaction, oldest `first_seen` first. Ties are broken
    /// by hash so the order is fully deterministic.
    pub fn pending(&self) -> Vec<Transaction> {
        let mut entries: Vec<(Hash, Transaction)> = self
            .txs
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        entries.sort_by(|(ha, a), (hb, b)| {
            a.first_seen()
                .cmp(&b.first_seen())
                .then_with(|| ha.cmp(hb))
        });
        entries.into_iter().map(|(_, tx)| tx).collect()
    }

    /// Drop every transaction in `txs` that is still pooled, typically the
    /// contents of a block accepted from a peer. Returns how many were removed.
    pub fn remove_included(&self, txs: &[Transaction]) -> usize {
        txs.iter()
            .filter(|tx| self.txs.remove(&tx.hash()).is_some())
            .count()
    }

    pub fn clear_pending(&self) {
        self.txs.clear();
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.config.max_size
    }
}

impl Default for TxPool {
    fn default() -> Self {
        Self::new(TxPoolConfig::default())
    }
}
