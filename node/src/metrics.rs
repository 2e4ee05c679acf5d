//! # Prometheus Metrics
//!
//! Operational gauges for the node, scraped by Prometheus at `/metrics` on
//! the metrics port.
//!
//! All metrics live in a dedicated [`prometheus::Registry`] with the
//! `basalt` prefix, so they do not collide with the default global registry.
//! Gauges are refreshed by [`NodeMetrics::sample`], which `main` calls on a
//! fixed interval.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

use basalt_protocol::network::server::Server;

/// Prometheus handles for the node.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Height of the local chain tip.
    pub block_height: IntGauge,
    /// Transactions waiting in the pool.
    pub transactions_in_pool: IntGauge,
    /// Currently connected peers.
    pub connected_peers: IntGauge,
    /// Peers this node is syncing from.
    pub syncing_peers: IntGauge,
    /// Blocks accepted since the node started, counted from tip movement.
    pub blocks_processed_total: IntCounter,
}

impl NodeMetrics {
    /// Create and register all metrics.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("basalt".into()), None)?;

        let block_height = IntGauge::new("block_height", "Height of the local chain tip")?;
        registry.register(Box::new(block_height.clone()))?;

        let transactions_in_pool = IntGauge::new(
            "transactions_in_pool",
            "Current number of transactions waiting in the pool",
        )?;
        registry.register(Box::new(transactions_in_pool.clone()))?;

        let connected_peers =
            IntGauge::new("connected_peers", "Number of currently connected peers")?;
        registry.register(Box::new(connected_peers.clone()))?;

        let syncing_peers =
            IntGauge::new("syncing_peers", "Number of peers blocks are being pulled from")?;
        registry.register(Box::new(syncing_peers.clone()))?;

        let blocks_processed_total = IntCounter::new(
            "blocks_processed_total",
            "Total number of blocks accepted since start",
        )?;
        registry.register(Box::new(blocks_processed_total.clone()))?;

        Ok(Self {
            registry,
            block_height,
            transactions_in_pool,
            connected_peers,
            syncing_peers,
            blocks_processed_total,
        })
    }

    /// Refresh every gauge from the server's current state.
    pub fn sample(&self, server: &Server) {
        let height = i64::from(server.chain().height());
        let previous = self.block_height.get();
        if height > previous {
            self.blocks_processed_total
                .inc_by(u64::try_from(height - previous).unwrap_or_default());
        }
        self.block_height.set(height);
        self.transactions_in_pool
            .set(i64::try_from(server.pool().len()).unwrap_or(i64::MAX));
        self.connected_peers
            .set(i64::try_from(server.peer_count()).unwrap_or(i64::MAX));
        self.syncing_peers
            .set(i64::try_from(server.syncing_peers()).unwrap_or(i64::MAX));
    }

    /// Encode all registered metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Shared metrics handle for axum handlers and the sampler task.
pub type SharedMetrics = Arc<NodeMetrics>;

/// Renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(State(metrics): State<SharedMetrics>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
