//! # Block Synchronization
//!
//! Pull-based catch-up. A node that learns a peer is ahead (through a
//! `Status` reply) starts a requester for that peer; the requester asks for
//! everything above the local tip on a fixed interval until the local chain
//! reaches the height the peer advertised.
//!
//! ```text
//!  us                                    peer
//!  ── PeerConnected ──▶ GetStatus ─────────▶
//!  ◀──────────────────────────── Status{h}
//!  h > height()?  spawn requester(target = h)
//!  every interval:
//!    height() >= target → stop
//!    GetBlocks{from: height()+1, to: 0} ──▶
//!  ◀─────────────────────────── Blocks[..]   (add_block each, skip failures)
//! ```
//!
//! There is at most one requester per peer. A later `Status` from the same
//! peer raises the running requester's target instead of starting another.
//! Requesters are aborted when their peer disconnects and on shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::message::{GetBlocksMessage, Payload};
use super::transport::{NetAddr, Transport, TransportError};
use crate::config::{MAX_BLOCKS_PER_RESPONSE, SYNC_INTERVAL};
use crate::storage::block::Block;
use crate::storage::chain::Blockchain;

/// Sync tuning.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Delay between `GetBlocks` requests to a peer that is ahead.
    pub interval: Duration,
    /// Most blocks returned for a single `GetBlocks`.
    pub max_blocks_per_response: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: SYNC_INTERVAL,
            max_blocks_per_response: MAX_BLOCKS_PER_RESPONSE,
        }
    }
}

/// Blocks answering `request`: `[from, tip]`, or `[from, min(to, tip)]`
/// when `to` is set, truncated to `cap` blocks.
pub fn blocks_for_request(chain: &Blockchain, request: &GetBlocksMessage, cap: usize) -> Vec<Block> {
    let tip = chain.height();
    let to = if request.to == 0 { tip } else { request.to.min(tip) };
    if request.from > to {
        return Vec::new();
    }
    let span = u32::try_from(cap.max(1)).unwrap_or(u32::MAX);
    let end = to.min(request.from.saturating_add(span - 1));
    chain
        .get_blocks(request.from, end)
        .iter()
        .map(|b| b.as_ref().clone())
        .collect()
}

struct Requester {
    target: watch::Sender<u32>,
    handle: JoinHandle<()>,
}

/// Tracks one requester task per peer.
pub struct SyncManager {
    config: SyncConfig,
    requesters: Mutex<HashMap<NetAddr, Requester>>,
}

impl SyncManager {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            requesters: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// React to a peer's advertised height. Returns `true` if a new
    /// requester was started.
    pub fn on_status(
        &self,
        peer: NetAddr,
        remote_height: u32,
        chain: Arc<Blockchain>,
        transport: Arc<dyn Transport>,
    ) -> bool {
        if remote_height <= chain.height() {
            return false;
        }

        let mut requesters = self.requesters.lock();
        if let Some(running) = requesters.get(&peer) {
            if !running.handle.is_finished() {
                running.target.send_if_modified(|target| {
                    if remote_height > *target {
                        *target = remote_height;
                        true
                    } else {
                        false
                    }
                });
                return false;
            }
        }

        info!(peer = %peer, remote_height, local_height = chain.height(), "starting sync");
        let (target_tx, target_rx) = watch::channel(remote_height);
        let handle = tokio::spawn(run_requester(
            peer.clone(),
            target_rx,
            chain,
            transport,
            self.config.interval,
        ));
        requesters.insert(
            peer,
            Requester {
                target: target_tx,
                handle,
            },
        );
        true
    }

    /// Stop syncing from `peer`.
    pub fn cancel(&self, peer: &NetAddr) {
        if let Some(requester) = self.requesters.lock().remove(peer) {
            requester.handle.abort();
        }
    }

    /// Stop every requester.
    pub fn cancel_all(&self) {
        for (_, requester) in self.requesters.lock().drain() {
            requester.handle.abort();
        }
    }

    /// Requesters still running.
    pub fn active(&self) -> usize {
        self.requesters
            .lock()
            .values()
            .filter(|r| !r.handle.is_finished())
            .count()
    }
}

impl Default for SyncManager {
    fn default() -> Self {
        Self::new(SyncConfig::default())
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

async fn run_requester(
    peer: NetAddr,
    target: watch::Receiver<u32>,
    chain: Arc<Blockchain>,
    transport: Arc<dyn Transport>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;

        let height = chain.height();
        let target_height = *target.borrow();
        if height >= target_height {
            info!(peer = %peer, height, "sync caught up");
            return;
        }

        let request = Payload::GetBlocks(GetBlocksMessage {
            from: height + 1,
            to: 0,
        });
        let bytes = match request.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "failed to encode GetBlocks");
                return;
            }
        };
        debug!(peer = %peer, from = height + 1, target = target_height, "requesting blocks");
        match transport.send_message(&peer, bytes).await {
            Ok(()) => {}
            Err(TransportError::PeerNotFound(_)) | Err(TransportError::Closed) => {
                debug!(peer = %peer, "sync peer gone");
                return;
            }
            Err(err) => warn!(peer = %peer, error = %err, "sync request failed"),
        }
    }
}
