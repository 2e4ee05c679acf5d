//! # Peer Transport
//!
//! The capability set every transport offers the node server: hand out an
//! inbound event stream once, connect to a peer, send bytes to a peer, and
//! report its own address. Two implementations exist:
//!
//! - [`LocalTransport`](super::local::LocalTransport): in-process, peers
//!   found through a shared registry. Used by tests and the demo.
//! - [`TcpTransport`](super::tcp::TcpTransport): length-framed TCP.
//!
//! ## Backpressure
//!
//! Every queue is bounded. A sender that finds a peer's queue full waits at
//! most [`SEND_TIMEOUT`](crate::config::SEND_TIMEOUT) and then gets
//! [`TransportError::Timeout`]; nothing buffers without limit.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

/// A peer address. For TCP this is `host:port`; for the local transport it
/// is any unique name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetAddr(String);

impl NetAddr {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NetAddr {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NetAddr {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One inbound message envelope: who sent it and the raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rpc {
    pub from: NetAddr,
    pub payload: Bytes,
}

/// Everything a transport reports to its consumer, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    PeerConnected(NetAddr),
    PeerDisconnected(NetAddr),
    Message(Rpc),
}

/// Transport-level failures. None are fatal to the node.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer not found: {0}")]
    PeerNotFound(NetAddr),

    #[error("inbound stream already consumed")]
    AlreadyConsumed,

    #[error("timed out sending to {0}")]
    Timeout(NetAddr),

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: u32 },

    #[error("transport closed")]
    Closed,

    #[error("address already registered: {0}")]
    AddrInUse(NetAddr),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Message transport between nodes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Take the inbound event stream. Succeeds once per transport.
    fn consume(&self) -> Result<mpsc::Receiver<Inbound>, TransportError>;

    /// Establish a link to `addr`. Both sides see `PeerConnected`.
    async fn connect(&self, addr: &NetAddr) -> Result<(), TransportError>;

    /// Deliver `payload` to `to`.
    async fn send_message(&self, to: &NetAddr, payload: Bytes) -> Result<(), TransportError>;

    /// This transport's own address.
    fn addr(&self) -> NetAddr;

    /// Currently connected peers.
    fn peers(&self) -> Vec<NetAddr>;

    /// Tear down every link and background task.
    async fn close(&self);

    /// Send `payload` to every connected peer concurrently. Per-peer failures
    /// are logged and skipped.
    async fn broadcast(&self, payload: Bytes) {
        let peers = self.peers();
        let sends = peers.iter().map(|peer| {
            let payload = payload.clone();
            async move { (peer, self.send_message(peer, payload).await) }
        });
        for (peer, result) in join_all(sends).await {
            if let Err(err) = result {
                warn!(peer = %peer, error = %err, "broadcast send failed");
            }
        }
    }
}
