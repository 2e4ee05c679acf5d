// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Basalt Node
//!
//! Entry point for the `basalt-node` binary. Parses CLI arguments,
//! initializes logging and metrics, starts the node's event loop over TCP,
//! and serves the HTTP API.
//!
//! Subcommands:
//!
//! - `run`     start a node
//! - `keygen`  print a fresh validator key
//! - `demo`    run three in-process nodes and watch them agree
//! - `version` print build version information

mod api;
mod cli;
mod logging;
mod metrics;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;

use basalt_protocol::config::PROTOCOL_VERSION;
use basalt_protocol::crypto::keys::Keypair;
use basalt_protocol::network::local::LocalNetwork;
use basalt_protocol::network::server::{Server, ServerOptions};
use basalt_protocol::network::tcp::TcpTransport;
use basalt_protocol::network::transport::NetAddr;
use basalt_protocol::storage::db::{BlockStore, MemoryStore, SledStore};
use basalt_protocol::transaction::Transaction;

use cli::{BasaltNodeCli, Commands};
use logging::LogFormat;
use metrics::NodeMetrics;

/// How often the metrics gauges are refreshed from the node.
const METRICS_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

const DEFAULT_LOG_FILTER: &str = "basalt_node=info,basalt_protocol=info,tower_http=info";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = BasaltNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Keygen => {
            keygen();
            Ok(())
        }
        Commands::Demo(args) => run_demo(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Starts a node: P2P transport, event loop, API and metrics servers.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(DEFAULT_LOG_FILTER, args.log_format);

    let keypair = match (&args.validator_key, args.generate_key) {
        (Some(hex_key), _) => {
            Some(Keypair::from_hex(hex_key).context("invalid --validator-key")?)
        }
        (None, true) => Some(Keypair::generate()),
        (None, false) => None,
    };

    tracing::info!(
        listen_addr = %args.listen_addr,
        seeds = ?args.seeds,
        block_time_secs = args.block_time,
        validator = ?keypair.as_ref().map(|kp| kp.public_key().to_hex()),
        api_port = args.api_port,
        metrics_port = args.metrics_port,
        "starting basalt-node"
    );

    // --- Block storage ---
    let (store, persisted): (Arc<dyn BlockStore>, Vec<_>) = match &args.data_dir {
        Some(dir) => {
            let db_path = dir.join("blocks");
            std::fs::create_dir_all(&db_path).with_context(|| {
                format!("failed to create database directory: {}", db_path.display())
            })?;
            let sled = SledStore::open(&db_path)
                .with_context(|| format!("failed to open database at {}", db_path.display()))?;
            let blocks = sled
                .load_blocks(1)
                .context("failed to load persisted blocks")?;
            tracing::info!(path = %db_path.display(), blocks = blocks.len(), "database opened");
            (Arc::new(sled), blocks)
        }
        None => (Arc::new(MemoryStore::new()), Vec::new()),
    };

    // --- Transport & server ---
    let transport = TcpTransport::bind(&args.listen_addr)
        .await
        .with_context(|| format!("failed to bind P2P listener on {}", args.listen_addr))?;

    let options = ServerOptions {
        listen_addr: args.listen_addr.clone(),
        seed_nodes: args.seeds.iter().map(|s| NetAddr::from(s.as_str())).collect(),
        block_time: Duration::from_secs(args.block_time.max(1)),
        keypair,
        store,
        ..ServerOptions::default()
    };
    let server = Server::new(options, transport).context("failed to build node")?;

    // Replay what is already on disk before talking to anyone.
    for block in persisted {
        let height = block.height();
        if let Err(e) = server.chain().add_block(block) {
            tracing::warn!(height, error = %e, "stopping replay at unreadable block");
            break;
        }
    }
    tracing::info!(id = %server.id(), height = server.chain().height(), "chain loaded");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);
    let sampler = {
        let metrics = Arc::clone(&node_metrics);
        let server = Arc::clone(&server);
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(METRICS_SAMPLE_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => metrics.sample(&server),
                    _ = shutdown.changed() => break,
                }
            }
        })
    };

    // --- API server ---
    let app_state = api::AppState {
        version: format!("{} (protocol {})", env!("CARGO_PKG_VERSION"), PROTOCOL_VERSION),
        server: Arc::clone(&server),
    };
    let api_router = api::create_router(app_state);
    let api_addr = format!("0.0.0.0:{}", args.api_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!(addr = %api_addr, "API server listening");

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&node_metrics));
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!(addr = %metrics_addr, "metrics server listening");

    // --- Node event loop ---
    let node_loop = {
        let server = Arc::clone(&server);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { server.start(shutdown).await })
    };

    // --- Serve ---
    let api_shutdown = wait_for_shutdown(shutdown_rx.clone());
    let metrics_shutdown = wait_for_shutdown(shutdown_rx.clone());
    let api_task = tokio::spawn(async move {
        axum::serve(api_listener, api_router)
            .with_graceful_shutdown(api_shutdown)
            .await
    });
    let metrics_task = tokio::spawn(async move {
        axum::serve(metrics_listener, metrics_router)
            .with_graceful_shutdown(metrics_shutdown)
            .await
    });

    shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping node");
    let _ = shutdown_tx.send(true);

    match node_loop.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "node loop failed"),
        Err(e) => tracing::error!(error = %e, "node loop panicked"),
    }
    for (name, task) in [("API", api_task), ("metrics", metrics_task)] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "{name} server error"),
            Err(e) => tracing::error!(error = %e, "{name} server panicked"),
        }
    }
    let _ = sampler.await;

    tracing::info!(height = server.chain().height(), "basalt-node stopped");
    Ok(())
}

/// Prints a fresh validator key and its public key.
fn keygen() {
    let keypair = Keypair::generate();
    println!("secret key : {}", keypair.secret_key_hex());
    println!("public key : {}", keypair.public_key().to_hex());
}

/// Three nodes on an in-process network: one validator and two peers.
/// Sample contract transactions are submitted to a peer, relayed to the
/// validator, sealed into blocks and synced back out.
async fn run_demo(args: cli::DemoArgs) -> Result<()> {
    logging::init_logging("basalt_node=info,basalt_protocol=info", LogFormat::Pretty);

    let net = LocalNetwork::new();
    let validator_addr = NetAddr::from("validator");

    let mut servers = Vec::new();
    for (name, keypair) in [
        ("validator", Some(Keypair::generate())),
        ("peer-a", None),
        ("peer-b", None),
    ] {
        let transport = net
            .transport(name)
            .with_context(|| format!("failed to register {name}"))?;
        let seed_nodes = if keypair.is_some() {
            Vec::new()
        } else {
            vec![validator_addr.clone()]
        };
        let options = ServerOptions {
            id: name.to_string(),
            listen_addr: name.to_string(),
            seed_nodes,
            block_time: Duration::from_secs(args.block_time.max(1)),
            keypair,
            ..ServerOptions::default()
        };
        servers.push(Server::new(options, transport).context("failed to build node")?);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles: Vec<_> = servers
        .iter()
        .map(|server| {
            let server = Arc::clone(server);
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move { server.start(shutdown).await })
        })
        .collect();

    // Let the seeds connect before submitting anything.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let client = Keypair::generate();
    for (key, value) in [(&b"FOO"[..], 5u8), (&b"BAR"[..], 7)] {
        let mut tx = Transaction::new(store_program(key, value));
        tx.sign(&client);
        let hash = servers[1]
            .submit_transaction(tx)
            .await
            .context("failed to submit demo transaction")?;
        tracing::info!(hash = %hash, key = %String::from_utf8_lossy(key), value, "submitted");
    }

    let target = args.blocks;
    let deadline = Duration::from_secs(args.block_time.max(1) * u64::from(target) * 4 + 10);
    let reached = tokio::time::timeout(deadline, async {
        loop {
            if servers.iter().all(|s| s.chain().height() >= target) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_ok();

    for server in &servers {
        let foo = server
            .chain()
            .contract_value(b"FOO")
            .and_then(|v| <[u8; 8]>::try_from(v.as_slice()).ok())
            .map(i64::from_le_bytes);
        println!(
            "{:<10} height={:<4} tip={} FOO={:?}",
            server.id(),
            server.chain().height(),
            server.chain().current_header().hash(),
            foo
        );
    }

    let _ = shutdown_tx.send(true);
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "demo node failed"),
            Err(e) => tracing::error!(error = %e, "demo node panicked"),
        }
    }

    if !reached {
        anyhow::bail!("nodes did not reach height {target} in time");
    }
    Ok(())
}

/// Bytecode storing `value` under `key`. Key bytes and the value must stay
/// clear of the opcode range or they would execute as instructions.
fn store_program(key: &[u8], value: u8) -> Vec<u8> {
    let mut program = Vec::with_capacity(key.len() * 2 + 6);
    program.extend_from_slice(&[key.len() as u8, 0x0a]);
    for &b in key {
        program.extend_from_slice(&[b, 0x0c]);
    }
    program.push(0x0d);
    program.extend_from_slice(&[value, 0x0a, 0x0f]);
    program
}

/// Prints version information to stdout.
fn print_version() {
    println!("basalt-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol    {}", PROTOCOL_VERSION);
}

/// Resolves once the shutdown flag flips (or its sender is dropped).
async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported. If a handler cannot be
/// installed the other one still works.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_protocol::storage::state::ContractState;
    use basalt_protocol::vm::Vm;

    #[test]
    fn store_program_matches_known_encoding() {
        assert_eq!(
            store_program(b"FOO", 5),
            vec![0x03, 0x0a, 0x46, 0x0c, 0x4f, 0x0c, 0x4f, 0x0c, 0x0d, 0x05, 0x0a, 0x0f]
        );
    }

    #[test]
    fn store_program_runs() {
        let mut state = ContractState::new();
        let program = store_program(b"BAR", 7);
        Vm::new(&program, &mut state).run().unwrap();
        assert_eq!(state.get(b"BAR").unwrap(), &7i64.to_le_bytes());
    }
}
