//! # Contract State
//!
//! The chain-wide key/value store that contract programs write into. One
//! instance lives inside the [`Blockchain`](super::chain::Blockchain) for the
//! whole life of the process; every transaction in every accepted block
//! mutates the same map, and nothing is ever rolled back.

use std::collections::HashMap;

use thiserror::Error;

/// Errors from state lookups.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("key not found: {0}")]
    KeyNotFound(String),
}

/// Byte-keyed, byte-valued contract storage.
#[derive(Debug, Default, Clone)]
pub struct ContractState {
    data: HashMap<Vec<u8>, Vec<u8>>,
}

impl ContractState {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite `key`.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.data.insert(key, value);
    }

    /// Look up `key`.
    pub fn get(&self, key: &[u8]) -> Result<&[u8], StateError> {
        self.data
            .get(key)
            .map(Vec::as_slice)
            .ok_or_else(|| StateError::KeyNotFound(String::from_utf8_lossy(key).into_owned()))
    }

    /// Remove `key`, returning its old value if there was one.
    pub fn delete(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.remove(key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
