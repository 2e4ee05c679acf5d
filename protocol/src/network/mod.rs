//! # Network Module
//!
//! Peer transport, wire protocol, transaction pool, block sync and the node
//! server that ties them together.
//!
//! ## Architecture
//!
//! ```text
//! transport.rs    Transport trait, NetAddr, inbound events
//! local.rs        in-process transport over a shared registry
//! tcp.rs          length-framed TCP transport
//! message.rs      wire envelope, payload types, decoding seam
//! txpool.rs       de-duplicated, arrival-ordered transaction pool
//! sync.rs         per-peer pull-based block sync
//! server.rs       event loop, message handling, block production
//! ```
//!
//! ## Design Decisions
//!
//! - Every channel is bounded and every send has a timeout. A slow peer
//!   costs its own messages, not the node's memory.
//! - Background tasks (connection readers and writers, sync requesters) are
//!   owned by whoever spawned them and are aborted on disconnect or
//!   shutdown; nothing is detached.
//! - The pool uses `DashMap` rather than a single lock: the API, the event
//!   loop and the block producer all touch it concurrently.

pub mod local;
pub mod message;
pub mod server;
pub mod sync;
pub mod tcp;
pub mod transport;
pub mod txpool;

pub use local::{LocalNetwork, LocalTransport};
pub use message::{
    default_rpc_decode, BlocksMessage, DecodeError, DecodedMessage, GetBlocksMessage,
    GetStatusMessage, Message, MessageType, Payload, RpcDecodeFn, RpcProcessor, StatusMessage,
};
pub use server::{Server, ServerError, ServerOptions};
pub use sync::{SyncConfig, SyncManager};
pub use tcp::TcpTransport;
pub use transport::{Inbound, NetAddr, Rpc, Transport, TransportError};
pub use txpool::{TxPool, TxPoolConfig, TxPoolError};
