// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Basalt Protocol Core Library
//!
//! A minimal blockchain node: a hash-linked ledger of signed blocks, a
//! transaction pool, a pull-based sync protocol over pluggable transports,
//! and a tiny bytecode VM that runs every transaction against shared
//! contract state.
//!
//! ## Architecture
//!
//! - **crypto**: hashing (SHA-256, BLAKE3, Merkle root) and Ed25519 keys.
//! - **transaction**: signed contract invocations.
//! - **vm**: the contract interpreter.
//! - **storage**: blocks, validation, the `Blockchain`, persistence sinks.
//! - **network**: transports, wire messages, pool, sync, node server.
//! - **config**: protocol constants.
//!
//! ## Data Flow
//!
//! ```text
//! wire bytes → Transport → decode → Server → { TxPool | Blockchain }
//!                                                        │
//!                                       Vm per tx → ContractState
//!                                                        │
//!                                                  BlockStore::put
//! ```
//!
//! There is no fork choice and no consensus beyond "a node with a key
//! produces a block every tick". Blocks that do not extend the tip are
//! rejected.

pub mod config;
pub mod crypto;
pub mod network;
pub mod storage;
pub mod transaction;
pub mod vm;
