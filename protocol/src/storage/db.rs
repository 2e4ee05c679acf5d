//! # Block Persistence
//!
//! Accepted blocks are handed to a [`BlockStore`] after they are appended to
//! the in-memory chain. The chain never reads back from the store while
//! running; it is a sink. The only reader is node startup, which replays a
//! [`SledStore`] through `add_block` to rebuild headers and contract state.
//!
//! ## Tree Layout (sled)
//!
//! | Tree           | Key                 | Value             |
//! |----------------|---------------------|-------------------|
//! | `blocks`       | `height` (4B BE)    | `bincode(Block)`  |
//! | `block_hashes` | `hash` (32B)        | `height` (4B BE)  |
//! | `metadata`     | key (UTF-8)         | value (bytes)     |
//!
//! Heights are big-endian so sled's lexicographic order is numeric order and
//! range scans come back sorted.

use std::collections::BTreeMap;
use std::path::Path;

use parking_lot::RwLock;
use sled::{Batch, Db, Tree};

use super::block::Block;
use crate::crypto::hash::Hash;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence sink for accepted blocks.
pub trait BlockStore: Send + Sync {
    fn put(&self, block: &Block) -> StoreResult<()>;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// Keeps blocks in a map for the life of the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blocks: RwLock<BTreeMap<u32, Block>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }

    pub fn get(&self, height: u32) -> Option<Block> {
        self.blocks.read().get(&height).cloned()
    }
}

impl BlockStore for MemoryStore {
    fn put(&self, block: &Block) -> StoreResult<()> {
        self.blocks.write().insert(block.height(), block.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SledStore
// ---------------------------------------------------------------------------

/// Well-known key in the `metadata` tree for the latest block height.
const META_LATEST_HEIGHT: &[u8] = b"latest_block_height";

/// On-disk block store.
///
/// sled trees are safe for concurrent use, so a `SledStore` can be shared
/// through an `Arc` without extra locking.
#[derive(Debug, Clone)]
pub struct SledStore {
    /// The underlying sled database handle.
    db: Db,
    /// Blocks indexed by height.
    blocks: Tree,
    /// Reverse index: block hash -> height.
    block_hashes: Tree,
    /// Chain metadata (latest height).
    metadata: Tree,
}

impl SledStore {
    /// Open or create a database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// A database that is deleted when dropped. For tests.
    pub fn open_temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StoreResult<Self> {
        let blocks = db.open_tree("blocks")?;
        let block_hashes = db.open_tree("block_hashes")?;
        let metadata = db.open_tree("metadata")?;
        Ok(Self {
            db,
            blocks,
            block_hashes,
            metadata,
        })
    }

    /// Block at `height`, if persisted.
    pub fn get_block(&self, height: u32) -> StoreResult<Option<Block>> {
        match self.blocks.get(height.to_be_bytes())? {
            Some(bytes) => Ok(Some(decode_block(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Block with header hash `hash`, if persisted.
    pub fn get_block_by_hash(&self, hash: &Hash) -> StoreResult<Option<Block>> {
        match self.block_hashes.get(hash.as_bytes())? {
            Some(height_bytes) => self.get_block(decode_height(&height_bytes)?),
            None => Ok(None),
        }
    }

    /// Highest persisted height, `None` for an empty database.
    pub fn latest_height(&self) -> StoreResult<Option<u32>> {
        match self.metadata.get(META_LATEST_HEIGHT)? {
            Some(bytes) => Ok(Some(decode_height(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every persisted block from `from` upward, in height order.
    pub fn load_blocks(&self, from: u32) -> StoreResult<Vec<Block>> {
        let mut blocks = Vec::new();
        for entry in self.blocks.range(from.to_be_bytes()..) {
            let (_key, value) = entry?;
            blocks.push(decode_block(&value)?);
        }
        Ok(blocks)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl BlockStore for SledStore {
    fn put(&self, block: &Block) -> StoreResult<()> {
        let height_key = block.height().to_be_bytes();
        let bytes =
            bincode::serialize(block).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut batch = Batch::default();
        batch.insert(&height_key, bytes);
        self.blocks.apply_batch(batch)?;
        self.block_hashes.insert(block.hash().as_bytes(), &height_key)?;

        let latest = self.latest_height()?;
        if latest.map_or(true, |h| block.height() > h) {
            self.metadata.insert(META_LATEST_HEIGHT, &height_key)?;
        }
        self.db.flush()?;
        Ok(())
    }
}

fn decode_block(bytes: &[u8]) -> StoreResult<Block> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_height(bytes: &[u8]) -> StoreResult<u32> {
    let arr: [u8; 4] = bytes
        .try_into()
        .map_err(|_| StoreError::Serialization("invalid height bytes".to_string()))?;
    Ok(u32::from_be_bytes(arr))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::Keypair;
    use crate::transaction::Transaction;

    fn make_blocks(count: usize) -> Vec<Block> {
        let kp = Keypair::generate();
        let mut blocks = vec![Block::genesis()];
        for i in 1..count {
            let mut tx = Transaction::new(vec![i as u8, 0x0a]);
            tx.sign(&kp);
            let mut block = Block::from_prev_header(blocks[i - 1].header(), vec![tx]);
            block.sign(&kp);
            blocks.push(block);
        }
        blocks
    }

    // -- 1. MemoryStore -----------------------------------------------------

    #[test]
    fn memory_store_put_and_get() {
        let store = MemoryStore::new();
        assert!(store.is_empty());
        for block in make_blocks(3) {
            store.put(&block).unwrap();
        }
        assert_eq!(store.len(), 3);
        assert_eq!(store.get(2).unwrap().height(), 2);
        assert!(store.get(3).is_none());
    }

    // -- 2. SledStore -------------------------------------------------------

    #[test]
    fn sled_empty_database() {
        let store = SledStore::open_temporary().unwrap();
        assert_eq!(store.block_count(), 0);
        assert_eq!(store.latest_height().unwrap(), None);
        assert!(store.get_block(0).unwrap().is_none());
    }

    #[test]
    fn sled_put_get_by_height_and_hash() {
        let store = SledStore::open_temporary().unwrap();
        let blocks = make_blocks(3);
        for block in &blocks {
            store.put(block).unwrap();
        }

        assert_eq!(store.latest_height().unwrap(), Some(2));
        assert_eq!(store.get_block(1).unwrap().unwrap(), blocks[1]);
        let by_hash = store.get_block_by_hash(&blocks[2].hash()).unwrap().unwrap();
        assert_eq!(by_hash, blocks[2]);
        assert!(store.get_block_by_hash(&Hash::random()).unwrap().is_none());
    }

    #[test]
    fn sled_load_blocks_in_height_order() {
        let store = SledStore::open_temporary().unwrap();
        let blocks = make_blocks(5);
        // Insert out of order; the tree keys sort them.
        for i in [3usize, 0, 4, 1, 2] {
            store.put(&blocks[i]).unwrap();
        }
        let loaded = store.load_blocks(1).unwrap();
        let heights: Vec<u32> = loaded.iter().map(Block::height).collect();
        assert_eq!(heights, vec![1, 2, 3, 4]);
        assert_eq!(store.latest_height().unwrap(), Some(4));
    }

    #[test]
    fn sled_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = make_blocks(2);
        {
            let store = SledStore::open(dir.path()).unwrap();
            for block in &blocks {
                store.put(block).unwrap();
            }
        }
        let store = SledStore::open(dir.path()).unwrap();
        assert_eq!(store.block_count(), 2);
        assert_eq!(store.get_block(1).unwrap().unwrap().hash(), blocks[1].hash());
    }
}
