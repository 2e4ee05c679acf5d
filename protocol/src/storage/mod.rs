//! # Storage Module
//!
//! The ledger and everything it owns.
//!
//! ```text
//! block.rs        Header, Block, canonical encoding, signing
//! state.rs        contract key/value state
//! validator.rs    block acceptance rules
//! chain.rs        Blockchain: index, execution, locking
//! db.rs           BlockStore sink: MemoryStore, SledStore
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! Block → Validator → Vm (per tx) → Blockchain index → BlockStore::put
//!                         ↓
//!                   ContractState
//! ```
//!
//! ## Design Decisions
//!
//! 1. **SHA-256 for headers, BLAKE3 for transactions.** The header hash is
//!    the one peers compare for linkage; transaction ids and the data-hash
//!    Merkle root only need to be fast and collision resistant.
//!
//! 2. **Bincode for the wire and for disk.** Compact and deterministic. JSON
//!    is only used by the HTTP API.
//!
//! 3. **The store is a sink.** The chain keeps everything it needs in
//!    memory; a store only has to accept `put`.

pub mod block;
pub mod chain;
pub mod db;
pub mod state;
pub mod validator;

pub use block::{Block, BlockError, Header, MalformedHeader};
pub use chain::{Blockchain, ChainError};
pub use db::{BlockStore, MemoryStore, SledStore, StoreError};
pub use state::{ContractState, StateError};
pub use validator::{BlockValidator, ValidationError, Validator};
