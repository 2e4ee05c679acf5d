//! # Node Server
//!
//! The composition root. One `Server` owns the chain, the transaction pool,
//! the sync requesters and a transport, and drives them from a single event
//! loop:
//!
//! ```text
//!                 ┌──────────── Server::start ────────────┐
//! transport ────▶ │ inbound event  → decode → process      │
//!                 │ block ticker   → create_new_block      │ (validators only)
//!                 │ shutdown       → cancel sync, close    │
//!                 └────────────────────────────────────────┘
//! ```
//!
//! ## Message Handling
//!
//! | Message     | Action                                                          |
//! |-------------|-----------------------------------------------------------------|
//! | `Tx`        | skip if pooled or sealed; verify, stamp first_seen, pool, relay |
//! | `Block`     | `add_block`; if accepted, unpool its txs and relay; on a gap, sync |
//! | `GetStatus` | reply `Status { id, version, current_height }`                  |
//! | `Status`    | if the peer is ahead, start (or raise) a sync requester         |
//! | `GetBlocks` | reply `Blocks` with `[from, tip]`, capped                       |
//! | `Blocks`    | `add_block` each in order, unpooling accepted txs; skip failures |
//!
//! New peers are sent `GetStatus` as soon as they connect.
//!
//! Relayed blocks die at the first node that already has them
//! (`AlreadyExists`), so rebroadcasting cannot loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::message::{
    default_rpc_decode, BlocksMessage, DecodeError, DecodedMessage, GetBlocksMessage,
    GetStatusMessage, Payload, RpcDecodeFn, RpcProcessor, StatusMessage,
};
use super::sync::{blocks_for_request, SyncConfig, SyncManager};
use super::transport::{Inbound, NetAddr, Transport, TransportError};
use super::txpool::{TxPool, TxPoolConfig, TxPoolError};
use crate::config::{DEFAULT_BLOCK_TIME, DEFAULT_P2P_PORT, PROTOCOL_VERSION};
use crate::crypto::hash::Hash;
use crate::crypto::keys::Keypair;
use crate::storage::block::{timestamp_nanos, Block};
use crate::storage::chain::{Blockchain, ChainError};
use crate::storage::db::{BlockStore, MemoryStore};
use crate::storage::validator::ValidationError;
use crate::transaction::{Transaction, TransactionError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from message processing and block production. All are logged by
/// the event loop; none stop the node.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Pool(#[from] TxPoolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("node has no validator key")]
    NotValidator,
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Everything needed to build a [`Server`].
#[derive(Clone)]
pub struct ServerOptions {
    /// Node id reported in `Status`. Defaults to a random UUID.
    pub id: String,
    /// Address the node's transport listens on.
    pub listen_addr: String,
    /// Peers dialed on start.
    pub seed_nodes: Vec<NetAddr>,
    /// Interval between block production ticks.
    pub block_time: Duration,
    /// Signing key. Its presence makes this node a validator.
    pub keypair: Option<Keypair>,
    /// Maps raw envelopes to typed messages.
    pub rpc_decode_fn: RpcDecodeFn,
    /// Receives decoded messages. `None` means the server handles them.
    pub rpc_processor: Option<Arc<dyn RpcProcessor>>,
    /// Transaction pool settings.
    pub txpool: TxPoolConfig,
    /// Sync settings.
    pub sync: SyncConfig,
    /// Persistence sink for accepted blocks.
    pub store: Arc<dyn BlockStore>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            listen_addr: format!("0.0.0.0:{DEFAULT_P2P_PORT}"),
            seed_nodes: Vec::new(),
            block_time: DEFAULT_BLOCK_TIME,
            keypair: None,
            rpc_decode_fn: Arc::new(default_rpc_decode),
            rpc_processor: None,
            txpool: TxPoolConfig::default(),
            sync: SyncConfig::default(),
            store: Arc::new(MemoryStore::new()),
        }
    }
}

impl std::fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerOptions")
            .field("id", &self.id)
            .field("listen_addr", &self.listen_addr)
            .field("seed_nodes", &self.seed_nodes)
            .field("block_time", &self.block_time)
            .field("validator", &self.keypair.as_ref().map(Keypair::public_key))
            .field("txpool", &self.txpool)
            .field("sync", &self.sync)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// A running node.
pub struct Server {
    id: String,
    seed_nodes: Vec<NetAddr>,
    block_time: Duration,
    keypair: Option<Keypair>,
    rpc_decode_fn: RpcDecodeFn,
    rpc_processor: Option<Arc<dyn RpcProcessor>>,
    transport: Arc<dyn Transport>,
    chain: Arc<Blockchain>,
    pool: Arc<TxPool>,
    sync: SyncManager,
}

impl Server {
    /// Build a node on `transport`, bootstrapping the chain from the
    /// genesis block.
    pub fn new(
        options: ServerOptions,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>, ServerError> {
        let chain = Blockchain::new(Block::genesis(), options.store)?;
        Ok(Arc::new(Self {
            id: options.id,
            seed_nodes: options.seed_nodes,
            block_time: options.block_time,
            keypair: options.keypair,
            rpc_decode_fn: options.rpc_decode_fn,
            rpc_processor: options.rpc_processor,
            transport,
            chain: Arc::new(chain),
            pool: Arc::new(TxPool::new(options.txpool)),
            sync: SyncManager::new(options.sync),
        }))
    }

    /// Run the event loop until `shutdown` flips to `true` (or its sender is
    /// dropped). Dials the seed nodes first.
    pub async fn start(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
        let mut inbound = self.transport.consume()?;

        for seed in &self.seed_nodes {
            if let Err(err) = self.transport.connect(seed).await {
                warn!(seed = %seed, error = %err, "failed to dial seed node");
            }
        }

        let mut ticker = tokio::time::interval(self.block_time);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        info!(
            id = %self.id,
            addr = %self.transport.addr(),
            validator = self.is_validator(),
            "server started"
        );

        loop {
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(event) => self.handle_inbound(event).await,
                    None => {
                        warn!("inbound stream closed");
                        break;
                    }
                },
                _ = ticker.tick(), if self.is_validator() => {
                    if let Err(err) = self.create_new_block().await {
                        warn!(error = %err, "block production failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        self.sync.cancel_all();
        self.transport.close().await;
        info!(id = %self.id, height = self.chain.height(), "server stopped");
        Ok(())
    }

    async fn handle_inbound(&self, event: Inbound) {
        match event {
            Inbound::PeerConnected(peer) => {
                info!(peer = %peer, "peer connected");
                if let Err(err) = self.send(&peer, &Payload::GetStatus(GetStatusMessage)).await {
                    warn!(peer = %peer, error = %err, "failed to request status");
                }
            }
            Inbound::PeerDisconnected(peer) => {
                info!(peer = %peer, "peer disconnected");
                self.sync.cancel(&peer);
            }
            Inbound::Message(rpc) => {
                let message = match (self.rpc_decode_fn)(&rpc) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(peer = %rpc.from, error = %err, "dropping undecodable message");
                        return;
                    }
                };
                debug!(peer = %message.from, kind = %message.data.message_type(), "message received");
                let result = match &self.rpc_processor {
                    Some(processor) => processor.process_message(message).await,
                    None => self.handle_message(message).await,
                };
                if let Err(err) = result {
                    warn!(peer = %rpc.from, error = %err, "message processing failed");
                }
            }
        }
    }

    /// Route one decoded message.
    pub async fn handle_message(&self, message: DecodedMessage) -> Result<(), ServerError> {
        let DecodedMessage { from, data } = message;
        match data {
            Payload::Transaction(tx) => self.process_transaction(tx).await.map(|_| ()),
            Payload::Block(block) => self.process_block(from, block).await,
            Payload::GetStatus(_) => self.process_get_status(&from).await,
            Payload::Status(status) => {
                self.process_status(from, status);
                Ok(())
            }
            Payload::GetBlocks(request) => self.process_get_blocks(&from, request).await,
            Payload::Blocks(blocks) => {
                self.process_blocks(&from, blocks);
                Ok(())
            }
        }
    }

    /// Submit a locally created transaction. Same path as one from a peer.
    pub async fn submit_transaction(&self, tx: Transaction) -> Result<Hash, ServerError> {
        self.process_transaction(tx).await
    }

    async fn process_transaction(&self, mut tx: Transaction) -> Result<Hash, ServerError> {
        let hash = tx.hash();
        if self.pool.contains(&hash) {
            debug!(hash = %hash, pool_len = self.pool.len(), "transaction already pooled");
            return Ok(hash);
        }
        if self.chain.has_transaction(&hash) {
            debug!(hash = %hash, "transaction already sealed in a block");
            return Ok(hash);
        }

        tx.verify()?;
        tx.set_first_seen(timestamp_nanos());

        match self.pool.add(tx.clone()) {
            Ok(_) => {}
            Err(TxPoolError::Duplicate(_)) => return Ok(hash),
            Err(err) => return Err(err.into()),
        }
        info!(hash = %hash, pool_len = self.pool.len(), "transaction added to pool");

        self.broadcast(&Payload::Transaction(tx)).await;
        Ok(hash)
    }

    async fn process_block(&self, from: NetAddr, block: Block) -> Result<(), ServerError> {
        let height = block.height();
        match self.chain.add_block(block.clone()) {
            Ok(()) | Err(ChainError::Storage(_)) => {
                self.unpool_included(&block);
                self.broadcast(&Payload::Block(block)).await;
                Ok(())
            }
            Err(ChainError::Validation(ValidationError::AlreadyExists { .. })) => {
                debug!(height, "block already known");
                Ok(())
            }
            // A block from the future means we missed some; the sender has
            // at least up to `got`.
            Err(ChainError::Validation(ValidationError::NonContiguousHeight { expected, got }))
                if got > expected =>
            {
                debug!(peer = %from, expected, got, "gap in relayed blocks");
                self.sync.on_status(
                    from,
                    got,
                    Arc::clone(&self.chain),
                    Arc::clone(&self.transport),
                );
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn process_get_status(&self, from: &NetAddr) -> Result<(), ServerError> {
        let status = StatusMessage {
            id: self.id.clone(),
            version: PROTOCOL_VERSION,
            current_height: self.chain.height(),
        };
        self.send(from, &Payload::Status(status)).await
    }

    fn process_status(&self, from: NetAddr, status: StatusMessage) {
        debug!(
            peer = %from,
            peer_id = %status.id,
            remote_height = status.current_height,
            local_height = self.chain.height(),
            "status received"
        );
        self.sync.on_status(
            from,
            status.current_height,
            Arc::clone(&self.chain),
            Arc::clone(&self.transport),
        );
    }

    async fn process_get_blocks(
        &self,
        from: &NetAddr,
        request: GetBlocksMessage,
    ) -> Result<(), ServerError> {
        let blocks = blocks_for_request(
            &self.chain,
            &request,
            self.sync.config().max_blocks_per_response,
        );
        debug!(peer = %from, from_height = request.from, count = blocks.len(), "serving blocks");
        self.send(from, &Payload::Blocks(BlocksMessage { blocks })).await
    }

    fn process_blocks(&self, from: &NetAddr, message: BlocksMessage) {
        let total = message.blocks.len();
        let mut accepted = 0usize;
        for block in message.blocks {
            let height = block.height();
            match self.chain.add_block(block.clone()) {
                Ok(()) | Err(ChainError::Storage(_)) => {
                    self.unpool_included(&block);
                    accepted += 1;
                }
                Err(err) => debug!(peer = %from, height, error = %err, "skipping synced block"),
            }
        }
        info!(peer = %from, accepted, total, height = self.chain.height(), "applied block batch");
    }

    /// Assemble the pool into a block on top of the tip, sign it, add it,
    /// clear the pool and broadcast.
    pub async fn create_new_block(&self) -> Result<Hash, ServerError> {
        let keypair = self.keypair.as_ref().ok_or(ServerError::NotValidator)?;

        // A relay can re-pool a transaction after the block sealing it was
        // produced; never seal it twice.
        let txs: Vec<Transaction> = self
            .pool
            .pending()
            .into_iter()
            .filter(|tx| !self.chain.has_transaction(&tx.hash()))
            .collect();
        let mut block = Block::from_prev_header(&self.chain.current_header(), txs);
        block.sign(keypair);
        let hash = block.hash();

        match self.chain.add_block(block.clone()) {
            Ok(()) => {}
            Err(ChainError::Storage(err)) => {
                warn!(height = block.height(), error = %err, "produced block not persisted");
            }
            Err(ChainError::Execution {
                height,
                tx_index,
                source,
            }) => {
                // Drop the failing transaction so the next tick can make
                // progress with the rest.
                if let Some(tx) = block.transactions.get(tx_index) {
                    self.pool.remove(&tx.hash());
                }
                return Err(ChainError::Execution {
                    height,
                    tx_index,
                    source,
                }
                .into());
            }
            Err(err) => return Err(err.into()),
        }

        self.pool.clear_pending();
        info!(
            height = block.height(),
            hash = %hash,
            txs = block.transactions.len(),
            "produced block"
        );
        self.broadcast(&Payload::Block(block)).await;
        Ok(hash)
    }

    /// Drop the transactions of an accepted peer block from the pool.
    fn unpool_included(&self, block: &Block) {
        let removed = self.pool.remove_included(&block.transactions);
        if removed > 0 {
            debug!(
                height = block.height(),
                removed,
                pool_len = self.pool.len(),
                "unpooled sealed transactions"
            );
        }
    }

    async fn send(&self, to: &NetAddr, payload: &Payload) -> Result<(), ServerError> {
        let bytes = payload.encode()?;
        self.transport.send_message(to, bytes).await?;
        Ok(())
    }

    async fn broadcast(&self, payload: &Payload) {
        match payload.encode() {
            Ok(bytes) => self.transport.broadcast(bytes).await,
            Err(err) => warn!(error = %err, "failed to encode broadcast"),
        }
    }

    // -- Accessors ----------------------------------------------------------

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_validator(&self) -> bool {
        self.keypair.is_some()
    }

    /// Public key of the validator key, if any.
    pub fn validator_key(&self) -> Option<String> {
        self.keypair.as_ref().map(|kp| kp.public_key().to_hex())
    }

    pub fn chain(&self) -> &Arc<Blockchain> {
        &self.chain
    }

    pub fn pool(&self) -> &Arc<TxPool> {
        &self.pool
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn peer_count(&self) -> usize {
        self.transport.peers().len()
    }

    /// Sync requesters currently running.
    pub fn syncing_peers(&self) -> usize {
        self.sync.active()
    }
}

#[async_trait]
impl RpcProcessor for Server {
    async fn process_message(&self, message: DecodedMessage) -> Result<(), ServerError> {
        self.handle_message(message).await
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.id)
            .field("validator", &self.is_validator())
            .field("height", &self.chain.height())
            .field("pool", &self.pool.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::local::{LocalNetwork, LocalTransport};
    use tokio::sync::mpsc;

    /// pack "FOO", push `n`, store FOO -> n
    fn store_foo(n: u8) -> Vec<u8> {
        vec![
            0x03, 0x0a, 0x46, 0x0c, 0x4f, 0x0c, 0x4f, 0x0c, 0x0d, n, 0x0a, 0x0f,
        ]
    }

    fn signed_tx(data: Vec<u8>) -> Transaction {
        let mut tx = Transaction::new(data);
        tx.sign(&Keypair::generate());
        tx
    }

    struct Harness {
        server: Arc<Server>,
        peer: Arc<LocalTransport>,
        peer_rx: mpsc::Receiver<Inbound>,
        store: Arc<MemoryStore>,
    }

    async fn setup_with(options: ServerOptions) -> Harness {
        let net = LocalNetwork::new();
        let transport = net.transport("node").unwrap();
        let peer = net.transport("peer").unwrap();
        let mut peer_rx = peer.consume().unwrap();

        let store = Arc::new(MemoryStore::new());
        let server = Server::new(
            ServerOptions {
                store: store.clone(),
                ..options
            },
            transport.clone(),
        )
        .unwrap();

        transport.connect(&peer.addr()).await.unwrap();
        assert_eq!(peer_rx.recv().await, Some(Inbound::PeerConnected("node".into())));

        Harness {
            server,
            peer,
            peer_rx,
            store,
        }
    }

    async fn setup(validator: bool) -> Harness {
        setup_with(ServerOptions {
            keypair: validator.then(Keypair::generate),
            ..ServerOptions::default()
        })
        .await
    }

    async fn next_payload(rx: &mut mpsc::Receiver<Inbound>) -> Payload {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("closed");
        match event {
            Inbound::Message(rpc) => default_rpc_decode(&rpc).unwrap().data,
            other => panic!("unexpected event: {other:?}"),
        }
    }

    fn from_peer(data: Payload) -> DecodedMessage {
        DecodedMessage {
            from: "peer".into(),
            data,
        }
    }

    // -- 1. Construction ----------------------------------------------------

    #[tokio::test]
    async fn new_server_starts_at_genesis() {
        let h = setup(false).await;
        assert_eq!(h.server.chain().height(), 0);
        assert!(!h.server.is_validator());
        assert!(!h.server.id().is_empty());
        assert_eq!(h.server.peer_count(), 1);
        assert_eq!(h.store.len(), 1);
    }

    // -- 2. Transactions ----------------------------------------------------

    #[tokio::test]
    async fn valid_transaction_is_pooled_and_relayed() {
        let mut h = setup(false).await;
        let tx = signed_tx(store_foo(1));
        let hash = h.server.submit_transaction(tx.clone()).await.unwrap();

        assert!(h.server.pool().contains(&hash));
        assert!(h.server.pool().get(&hash).unwrap().first_seen() > 0);
        match next_payload(&mut h.peer_rx).await {
            Payload::Transaction(relayed) => assert_eq!(relayed.hash(), hash),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_transaction_is_ignored() {
        let mut h = setup(false).await;
        let tx = signed_tx(store_foo(1));
        h.server
            .handle_message(from_peer(Payload::Transaction(tx.clone())))
            .await
            .unwrap();
        let _ = next_payload(&mut h.peer_rx).await;

        h.server
            .handle_message(from_peer(Payload::Transaction(tx)))
            .await
            .unwrap();
        assert_eq!(h.server.pool().len(), 1);
        assert!(h.peer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsigned_transaction_is_rejected() {
        let h = setup(false).await;
        let err = h
            .server
            .submit_transaction(Transaction::new(store_foo(1)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServerError::Transaction(TransactionError::MissingSignature)
        ));
        assert!(h.server.pool().is_empty());
    }

    #[tokio::test]
    async fn full_pool_rejects_transaction() {
        let h = setup_with(ServerOptions {
            txpool: TxPoolConfig { max_size: 1 },
            ..ServerOptions::default()
        })
        .await;
        h.server.submit_transaction(signed_tx(vec![1])).await.unwrap();
        let err = h
            .server
            .submit_transaction(signed_tx(vec![2]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Pool(TxPoolError::Full(1))));
    }

    #[tokio::test]
    async fn relayed_block_frees_pool_space() {
        let h = setup_with(ServerOptions {
            txpool: TxPoolConfig { max_size: 1 },
            ..ServerOptions::default()
        })
        .await;
        let sealed = signed_tx(store_foo(3));
        h.server.submit_transaction(sealed.clone()).await.unwrap();

        let kp = Keypair::generate();
        let mut block = Block::from_prev_header(Block::genesis().header(), vec![sealed]);
        block.sign(&kp);
        h.server
            .handle_message(from_peer(Payload::Block(block)))
            .await
            .unwrap();

        assert_eq!(h.server.chain().height(), 1);
        assert!(h.server.pool().is_empty());
        h.server
            .submit_transaction(signed_tx(store_foo(4)))
            .await
            .unwrap();
        assert_eq!(h.server.pool().len(), 1);
    }

    // -- 3. Block production ------------------------------------------------

    #[tokio::test]
    async fn validator_produces_block_from_pool() {
        let mut h = setup(true).await;
        h.server.submit_transaction(signed_tx(store_foo(4))).await.unwrap();
        let _ = next_payload(&mut h.peer_rx).await; // relayed tx

        let hash = h.server.create_new_block().await.unwrap();

        let chain = h.server.chain();
        assert_eq!(chain.height(), 1);
        let block = chain.get_block(1).unwrap();
        assert_eq!(block.hash(), hash);
        assert_eq!(block.transactions.len(), 1);
        assert!(h.server.pool().is_empty());
        assert_eq!(chain.contract_value(b"FOO"), Some(4i64.to_le_bytes().to_vec()));
        assert_eq!(h.store.len(), 2);

        match next_payload(&mut h.peer_rx).await {
            Payload::Block(relayed) => assert_eq!(relayed.hash(), hash),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_pool_still_produces_block() {
        let h = setup(true).await;
        h.server.create_new_block().await.unwrap();
        h.server.create_new_block().await.unwrap();
        assert_eq!(h.server.chain().height(), 2);
    }

    #[tokio::test]
    async fn non_validator_cannot_produce() {
        let h = setup(false).await;
        assert!(matches!(
            h.server.create_new_block().await,
            Err(ServerError::NotValidator)
        ));
    }

    #[tokio::test]
    async fn failing_transaction_is_evicted_from_pool() {
        let h = setup(true).await;
        let bad = signed_tx(vec![0x0b]);
        let bad_hash = h.server.submit_transaction(bad).await.unwrap();
        h.server.submit_transaction(signed_tx(store_foo(2))).await.unwrap();

        assert!(matches!(
            h.server.create_new_block().await,
            Err(ServerError::Chain(ChainError::Execution { .. }))
        ));
        assert_eq!(h.server.chain().height(), 0);
        assert!(!h.server.pool().contains(&bad_hash));
        assert_eq!(h.server.pool().len(), 1);

        h.server.create_new_block().await.unwrap();
        assert_eq!(h.server.chain().height(), 1);
    }

    #[tokio::test]
    async fn sealed_transaction_is_not_sealed_again() {
        let h = setup(true).await;
        let tx = signed_tx(store_foo(5));
        let hash = h.server.submit_transaction(tx.clone()).await.unwrap();
        h.server.create_new_block().await.unwrap();
        assert!(h.server.chain().has_transaction(&hash));

        // A peer's relay of the same transaction arrives after the flush.
        h.server
            .handle_message(from_peer(Payload::Transaction(tx.clone())))
            .await
            .unwrap();
        assert!(h.server.pool().is_empty());

        // Even if it gets pooled behind our back, production skips it.
        h.server.pool().add(tx).unwrap();
        h.server.create_new_block().await.unwrap();
        assert!(h.server.chain().get_block(2).unwrap().transactions.is_empty());
    }

    // -- 4. Sync protocol ---------------------------------------------------

    #[tokio::test]
    async fn get_status_is_answered() {
        let mut h = setup(true).await;
        h.server.create_new_block().await.unwrap();
        let _ = next_payload(&mut h.peer_rx).await; // relayed block

        h.server
            .handle_message(from_peer(Payload::GetStatus(GetStatusMessage)))
            .await
            .unwrap();
        match next_payload(&mut h.peer_rx).await {
            Payload::Status(status) => {
                assert_eq!(status.current_height, 1);
                assert_eq!(status.version, PROTOCOL_VERSION);
                assert_eq!(status.id, h.server.id());
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_blocks_is_answered() {
        let mut h = setup(true).await;
        for _ in 0..3 {
            h.server.create_new_block().await.unwrap();
            let _ = next_payload(&mut h.peer_rx).await;
        }

        h.server
            .handle_message(from_peer(Payload::GetBlocks(GetBlocksMessage {
                from: 2,
                to: 0,
            })))
            .await
            .unwrap();
        match next_payload(&mut h.peer_rx).await {
            Payload::Blocks(msg) => {
                let heights: Vec<u32> = msg.blocks.iter().map(Block::height).collect();
                assert_eq!(heights, vec![2, 3]);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn blocks_batch_applies_partially() {
        let h = setup(false).await;
        let kp = Keypair::generate();
        let mut b1 = Block::from_prev_header(Block::genesis().header(), vec![]);
        b1.sign(&kp);
        let mut b2 = Block::from_prev_header(b1.header(), vec![]);
        b2.sign(&kp);
        let mut b3 = Block::from_prev_header(b2.header(), vec![]);
        b3.sign(&kp);

        // b2 arrives unsigned and is skipped; b3 then no longer links.
        let mut broken = b2.clone();
        broken.signature = None;
        h.server
            .handle_message(from_peer(Payload::Blocks(BlocksMessage {
                blocks: vec![b1, broken, b3.clone()],
            })))
            .await
            .unwrap();
        assert_eq!(h.server.chain().height(), 1);

        h.server
            .handle_message(from_peer(Payload::Blocks(BlocksMessage {
                blocks: vec![b2, b3],
            })))
            .await
            .unwrap();
        assert_eq!(h.server.chain().height(), 3);
    }

    #[tokio::test]
    async fn synced_blocks_unpool_their_transactions() {
        let h = setup(false).await;
        let sealed = signed_tx(store_foo(6));
        let waiting = signed_tx(vec![0x01, 0x0a]);
        h.server.submit_transaction(sealed.clone()).await.unwrap();
        h.server.submit_transaction(waiting.clone()).await.unwrap();

        let kp = Keypair::generate();
        let mut b1 = Block::from_prev_header(Block::genesis().header(), vec![]);
        b1.sign(&kp);
        let mut b2 = Block::from_prev_header(b1.header(), vec![sealed.clone()]);
        b2.sign(&kp);
        h.server
            .handle_message(from_peer(Payload::Blocks(BlocksMessage {
                blocks: vec![b1, b2],
            })))
            .await
            .unwrap();

        assert_eq!(h.server.chain().height(), 2);
        assert!(!h.server.pool().contains(&sealed.hash()));
        assert!(h.server.pool().contains(&waiting.hash()));
    }

    #[tokio::test]
    async fn new_block_is_relayed_once() {
        let mut h = setup(false).await;
        let kp = Keypair::generate();
        let mut block = Block::from_prev_header(Block::genesis().header(), vec![]);
        block.sign(&kp);

        h.server
            .handle_message(from_peer(Payload::Block(block.clone())))
            .await
            .unwrap();
        assert!(matches!(next_payload(&mut h.peer_rx).await, Payload::Block(_)));

        // Second copy dies at AlreadyExists and is not relayed.
        h.server
            .handle_message(from_peer(Payload::Block(block)))
            .await
            .unwrap();
        assert!(h.peer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn block_past_a_gap_starts_sync() {
        let mut h = setup(false).await;
        let kp = Keypair::generate();
        let mut b1 = Block::from_prev_header(Block::genesis().header(), vec![]);
        b1.sign(&kp);
        let mut b2 = Block::from_prev_header(b1.header(), vec![]);
        b2.sign(&kp);

        h.server
            .handle_message(from_peer(Payload::Block(b2)))
            .await
            .unwrap();
        assert_eq!(h.server.chain().height(), 0);
        assert_eq!(h.server.syncing_peers(), 1);
        assert_eq!(
            next_payload(&mut h.peer_rx).await,
            Payload::GetBlocks(GetBlocksMessage { from: 1, to: 0 })
        );
    }

    // -- 5. Event loop ------------------------------------------------------

    #[tokio::test]
    async fn event_loop_answers_peers_and_stops_on_shutdown() {
        let mut h = setup(false).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = Arc::clone(&h.server);
        let handle = tokio::spawn(async move { server.start(shutdown_rx).await });

        // The loop reacts to the PeerConnected queued during setup.
        assert!(matches!(
            next_payload(&mut h.peer_rx).await,
            Payload::GetStatus(_)
        ));

        h.peer
            .send_message(
                &"node".into(),
                Payload::GetStatus(GetStatusMessage).encode().unwrap(),
            )
            .await
            .unwrap();
        assert!(matches!(next_payload(&mut h.peer_rx).await, Payload::Status(_)));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn validator_ticks_produce_blocks() {
        let h = setup_with(ServerOptions {
            keypair: Some(Keypair::generate()),
            block_time: Duration::from_millis(100),
            ..ServerOptions::default()
        })
        .await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = Arc::clone(&h.server);
        let handle = tokio::spawn(async move { server.start(shutdown_rx).await });

        tokio::time::sleep(Duration::from_millis(350)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert!(h.server.chain().height() >= 3);
    }
}
