//! End-to-end tests for the Basalt node.
//!
//! Several full `Server`s run their event loops against each other, over
//! the in-process network and over real TCP sockets on localhost. The tests
//! check what an operator would: blocks produced by the validator reach
//! every node, late joiners catch up, transactions submitted anywhere end
//! up executed everywhere, and shutdown stops everything.
//!
//! Each test builds its own network; nothing is shared between tests.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use basalt_protocol::crypto::keys::Keypair;
use basalt_protocol::network::local::LocalNetwork;
use basalt_protocol::network::server::{Server, ServerError, ServerOptions};
use basalt_protocol::network::sync::SyncConfig;
use basalt_protocol::network::tcp::TcpTransport;
use basalt_protocol::network::transport::{NetAddr, Transport};
use basalt_protocol::storage::db::SledStore;
use basalt_protocol::transaction::Transaction;

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

const BLOCK_TIME: Duration = Duration::from_millis(100);

fn options(id: &str, keypair: Option<Keypair>, seeds: Vec<NetAddr>) -> ServerOptions {
    ServerOptions {
        id: id.to_string(),
        listen_addr: id.to_string(),
        seed_nodes: seeds,
        block_time: BLOCK_TIME,
        keypair,
        sync: SyncConfig {
            interval: Duration::from_millis(50),
            ..SyncConfig::default()
        },
        ..ServerOptions::default()
    }
}

fn spawn(
    server: &Arc<Server>,
    shutdown: &watch::Receiver<bool>,
) -> JoinHandle<Result<(), ServerError>> {
    let server = Arc::clone(server);
    let shutdown = shutdown.clone();
    tokio::spawn(async move { server.start(shutdown).await })
}

/// Poll `cond` until it holds or `limit` passes.
async fn eventually(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

/// Stores `value` under `key`; see the VM docs for the encoding.
fn store_program(key: &[u8], value: u8) -> Vec<u8> {
    let mut program = vec![key.len() as u8, 0x0a];
    for &b in key {
        program.extend_from_slice(&[b, 0x0c]);
    }
    program.push(0x0d);
    program.extend_from_slice(&[value, 0x0a, 0x0f]);
    program
}

fn signed(data: Vec<u8>) -> Transaction {
    let mut tx = Transaction::new(data);
    tx.sign(&Keypair::generate());
    tx
}

fn int_at(server: &Server, key: &[u8]) -> Option<i64> {
    server
        .chain()
        .contract_value(key)
        .and_then(|v| <[u8; 8]>::try_from(v.as_slice()).ok())
        .map(i64::from_le_bytes)
}

async fn stop(shutdown: watch::Sender<bool>, handles: Vec<JoinHandle<Result<(), ServerError>>>) {
    shutdown.send(true).unwrap();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("node did not stop")
            .unwrap()
            .unwrap();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

// -- 1. Blocks from the validator reach every peer ---------------------------

#[tokio::test]
async fn validator_blocks_reach_all_peers() {
    let net = LocalNetwork::new();
    let validator = Server::new(
        options("validator", Some(Keypair::generate()), vec![]),
        net.transport("validator").unwrap(),
    )
    .unwrap();
    let peers: Vec<_> = ["a", "b"]
        .into_iter()
        .map(|id| {
            Server::new(
                options(id, None, vec!["validator".into()]),
                net.transport(id).unwrap(),
            )
            .unwrap()
        })
        .collect();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = vec![spawn(&validator, &shutdown_rx)];
    handles.extend(peers.iter().map(|p| spawn(p, &shutdown_rx)));

    assert!(
        eventually(Duration::from_secs(5), || {
            peers.iter().all(|p| p.chain().height() >= 3)
        })
        .await,
        "peers did not follow the validator"
    );

    for peer in &peers {
        let h = peer.chain().height().min(validator.chain().height());
        assert_eq!(
            peer.chain().get_header(h).unwrap(),
            validator.chain().get_header(h).unwrap()
        );
    }
    stop(shutdown_tx, handles).await;
}

// -- 2. A node that joins late syncs the backlog -----------------------------

#[tokio::test]
async fn late_node_catches_up_and_stops_syncing() {
    let net = LocalNetwork::new();
    let keypair = Keypair::generate();
    let validator = Server::new(
        options("validator", Some(keypair.clone()), vec![]),
        net.transport("validator").unwrap(),
    )
    .unwrap();

    // Build a backlog before anyone is listening.
    for _ in 0..10 {
        validator.create_new_block().await.unwrap();
    }
    assert_eq!(validator.chain().height(), 10);

    let late = Server::new(
        options("late", None, vec!["validator".into()]),
        net.transport("late").unwrap(),
    )
    .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = vec![spawn(&validator, &shutdown_rx), spawn(&late, &shutdown_rx)];

    assert!(
        eventually(Duration::from_secs(5), || late.chain().height() >= 10).await,
        "late node stuck at {}",
        late.chain().height()
    );
    assert!(
        eventually(Duration::from_secs(2), || late.syncing_peers() == 0).await,
        "sync requester kept running after catching up"
    );
    assert_eq!(
        late.chain().get_header(10).unwrap(),
        validator.chain().get_header(10).unwrap()
    );
    stop(shutdown_tx, handles).await;
}

// -- 3. Transactions submitted to a non-validator get executed everywhere ----

#[tokio::test]
async fn transaction_propagates_and_executes_on_every_node() {
    let net = LocalNetwork::new();
    let validator = Server::new(
        options("validator", Some(Keypair::generate()), vec![]),
        net.transport("validator").unwrap(),
    )
    .unwrap();
    let a = Server::new(
        options("a", None, vec!["validator".into()]),
        net.transport("a").unwrap(),
    )
    .unwrap();
    let b = Server::new(
        options("b", None, vec!["validator".into()]),
        net.transport("b").unwrap(),
    )
    .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = vec![
        spawn(&validator, &shutdown_rx),
        spawn(&a, &shutdown_rx),
        spawn(&b, &shutdown_rx),
    ];
    assert!(eventually(Duration::from_secs(2), || a.peer_count() == 1).await);

    a.submit_transaction(signed(store_program(b"FOO", 5)))
        .await
        .unwrap();

    let nodes = [&validator, &a, &b];
    assert!(
        eventually(Duration::from_secs(5), || {
            nodes.iter().all(|n| int_at(n, b"FOO") == Some(5))
        })
        .await,
        "FOO was not stored on every node"
    );
    assert!(validator.pool().is_empty());
    stop(shutdown_tx, handles).await;
}

// -- 4. A failing transaction does not wedge the validator -------------------

#[tokio::test]
async fn failing_transaction_is_evicted_and_production_resumes() {
    let net = LocalNetwork::new();
    let validator = Server::new(
        options("validator", Some(Keypair::generate()), vec![]),
        net.transport("validator").unwrap(),
    )
    .unwrap();

    // Sub on an empty queue underflows.
    validator
        .submit_transaction(signed(vec![0x0e]))
        .await
        .unwrap();
    assert!(validator.create_new_block().await.is_err());
    assert!(validator.pool().is_empty());

    let before = validator.chain().height();
    validator
        .submit_transaction(signed(store_program(b"BAR", 7)))
        .await
        .unwrap();
    validator.create_new_block().await.unwrap();
    assert_eq!(validator.chain().height(), before + 1);
    assert_eq!(int_at(&validator, b"BAR"), Some(7));
}

// -- 5. Over TCP -------------------------------------------------------------

#[tokio::test]
async fn tcp_nodes_sync_and_relay() {
    let validator_transport = TcpTransport::bind("127.0.0.1:0").await.unwrap();
    let validator_addr = validator_transport.addr();
    let validator = Server::new(
        options("validator", Some(Keypair::generate()), vec![]),
        validator_transport,
    )
    .unwrap();
    for _ in 0..3 {
        validator.create_new_block().await.unwrap();
    }

    let follower = Server::new(
        options("follower", None, vec![validator_addr]),
        TcpTransport::bind("127.0.0.1:0").await.unwrap(),
    )
    .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = vec![
        spawn(&validator, &shutdown_rx),
        spawn(&follower, &shutdown_rx),
    ];

    assert!(
        eventually(Duration::from_secs(5), || follower.chain().height() >= 3).await,
        "follower did not sync over TCP"
    );

    follower
        .submit_transaction(signed(store_program(b"TCP", 9)))
        .await
        .unwrap();
    assert!(
        eventually(Duration::from_secs(5), || {
            int_at(&validator, b"TCP") == Some(9) && int_at(&follower, b"TCP") == Some(9)
        })
        .await,
        "transaction did not round-trip over TCP"
    );
    stop(shutdown_tx, handles).await;
}

// -- 6. Restart from disk ----------------------------------------------------

#[tokio::test]
async fn sled_store_replays_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blocks");

    let tip = {
        let store = Arc::new(SledStore::open(&path).unwrap());
        let net = LocalNetwork::new();
        let node = Server::new(
            ServerOptions {
                store: store.clone(),
                ..options("node", Some(Keypair::generate()), vec![])
            },
            net.transport("node").unwrap(),
        )
        .unwrap();
        node.submit_transaction(signed(store_program(b"FOO", 5)))
            .await
            .unwrap();
        for _ in 0..4 {
            node.create_new_block().await.unwrap();
        }
        store.flush().unwrap();
        node.chain().current_header()
    };

    let store = Arc::new(SledStore::open(&path).unwrap());
    assert_eq!(store.latest_height().unwrap(), Some(4));
    let persisted = store.load_blocks(1).unwrap();

    let net = LocalNetwork::new();
    let node = Server::new(
        ServerOptions {
            store: store.clone(),
            ..options("node", None, vec![])
        },
        net.transport("node").unwrap(),
    )
    .unwrap();
    for block in persisted {
        node.chain().add_block(block).unwrap();
    }
    assert_eq!(node.chain().current_header(), tip);
    assert_eq!(int_at(&node, b"FOO"), Some(5));
}
