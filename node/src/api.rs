//! # HTTP API
//!
//! A thin JSON façade over a running [`Server`]. Every handler reads the
//! node through the shared [`AppState`]; nothing here holds chain state of
//! its own.
//!
//! ## Endpoints
//!
//! | Method | Path                      | Description                           |
//! |--------|---------------------------|---------------------------------------|
//! | GET    | `/health`                 | Liveness probe                        |
//! | GET    | `/status`                 | Node id, height, pool and peer counts |
//! | GET    | `/block/:hash_or_height`  | Block by decimal height or hex hash   |
//! | POST   | `/tx`                     | Submit a signed transaction           |
//! | GET    | `/state/:key`             | Contract state value for a key        |
//!
//! Byte fields (`data`, signatures, values) are hex strings. State keys are
//! UTF-8 in the path unless `?encoding=hex` is given.

use axum::{
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use basalt_protocol::crypto::hash::Hash;
use basalt_protocol::crypto::keys::{PublicKey, Signature};
use basalt_protocol::network::server::{Server, ServerError};
use basalt_protocol::network::txpool::TxPoolError;
use basalt_protocol::storage::block::Block;
use basalt_protocol::transaction::Transaction;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared state for all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Node software version.
    pub version: String,
    /// The node being served.
    pub server: Arc<Server>,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the axum [`Router`] with all routes, CORS and request tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/block/:hash_or_height", get(block_handler))
        .route("/tx", post(submit_tx_handler))
        .route("/state/:key", get(state_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / Response Types
// ---------------------------------------------------------------------------

/// Response payload for `GET /status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub id: String,
    pub version: String,
    pub height: u32,
    pub tip_hash: String,
    pub validator: Option<String>,
    pub peer_count: usize,
    pub syncing_peers: usize,
    pub pool_size: usize,
    /// RFC 3339 time of the response.
    pub timestamp: String,
}

/// Response payload for `GET /block/:hash_or_height`.
#[derive(Debug, Serialize, Deserialize)]
pub struct BlockResponse {
    pub height: u32,
    pub hash: String,
    pub prev_block_hash: String,
    pub data_hash: String,
    /// Nanoseconds since the UNIX epoch.
    pub timestamp: i64,
    pub validator: Option<String>,
    pub transactions: Vec<TransactionResponse>,
}

/// A transaction as rendered inside [`BlockResponse`].
#[derive(Debug, Serialize, Deserialize)]
pub struct TransactionResponse {
    pub hash: String,
    pub from: Option<String>,
    pub data: String,
}

/// Request body for `POST /tx`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitTxRequest {
    /// Hex-encoded VM bytecode.
    pub data: String,
    /// Hex-encoded Ed25519 public key of the signer.
    pub from: String,
    /// Hex-encoded signature over the raw `data` bytes.
    pub signature: String,
}

/// Response payload for `POST /tx`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitTxResponse {
    pub hash: String,
}

/// How the `:key` segment of `GET /state/:key` is read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyEncoding {
    #[default]
    Utf8,
    Hex,
}

/// Query string for `GET /state/:key`.
#[derive(Debug, Default, Deserialize)]
pub struct StateQuery {
    #[serde(default)]
    pub encoding: KeyEncoding,
}

/// Response payload for `GET /state/:key`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StateResponse {
    /// The key as requested.
    pub key: String,
    /// Hex-encoded stored bytes.
    pub value: String,
    /// The value read as a little-endian `i64`, when it is 8 bytes long.
    pub int: Option<i64>,
}

/// Error body returned by every endpoint on failure.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

impl From<&Block> for BlockResponse {
    fn from(block: &Block) -> Self {
        let header = block.header();
        Self {
            height: header.height,
            hash: block.hash().to_hex(),
            prev_block_hash: header.prev_block_hash.to_hex(),
            data_hash: header.data_hash.to_hex(),
            timestamp: header.timestamp,
            validator: block.validator.as_ref().map(PublicKey::to_hex),
            transactions: block
                .transactions
                .iter()
                .map(|tx| TransactionResponse {
                    hash: tx.hash().to_hex(),
                    from: tx.from.as_ref().map(PublicKey::to_hex),
                    data: hex::encode(&tx.data),
                })
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health`: 200 while the process is serving requests.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// `GET /status`
async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let server = &state.server;
    let tip = server.chain().current_header();
    Json(StatusResponse {
        id: server.id().to_string(),
        version: state.version.clone(),
        height: tip.height,
        tip_hash: tip.hash().to_hex(),
        validator: server.validator_key(),
        peer_count: server.peer_count(),
        syncing_peers: server.syncing_peers(),
        pool_size: server.pool().len(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// `GET /block/:hash_or_height`
///
/// A path of decimal digits is a height; anything else must be a 64-char
/// hex block hash.
async fn block_handler(
    Path(hash_or_height): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let chain = state.server.chain();
    let block = if let Ok(height) = hash_or_height.parse::<u32>() {
        chain.get_block(height).ok()
    } else {
        match Hash::from_hex(&hash_or_height) {
            Ok(hash) => chain.get_block_by_hash(&hash),
            Err(e) => return error(StatusCode::BAD_REQUEST, format!("invalid block hash: {e}")),
        }
    };

    match block {
        Some(block) => Json(BlockResponse::from(block.as_ref())).into_response(),
        None => error(
            StatusCode::NOT_FOUND,
            format!("block not found: {hash_or_height}"),
        ),
    }
}

/// `POST /tx`
///
/// Decodes the hex fields, then hands the transaction to the node, which
/// verifies it, pools it and relays it to peers.
async fn submit_tx_handler(
    State(state): State<AppState>,
    Json(req): Json<SubmitTxRequest>,
) -> Response {
    let data = match hex::decode(&req.data) {
        Ok(data) => data,
        Err(e) => return error(StatusCode::BAD_REQUEST, format!("invalid data: {e}")),
    };
    let from = match PublicKey::from_hex(&req.from) {
        Ok(pk) => pk,
        Err(e) => return error(StatusCode::BAD_REQUEST, format!("invalid sender key: {e}")),
    };
    let signature = match Signature::from_hex(&req.signature) {
        Ok(sig) => sig,
        Err(e) => return error(StatusCode::BAD_REQUEST, format!("invalid signature: {e}")),
    };

    let mut tx = Transaction::new(data);
    tx.from = Some(from);
    tx.signature = Some(signature);

    match state.server.submit_transaction(tx).await {
        Ok(hash) => (
            StatusCode::ACCEPTED,
            Json(SubmitTxResponse {
                hash: hash.to_hex(),
            }),
        )
            .into_response(),
        Err(ServerError::Transaction(e)) => error(StatusCode::BAD_REQUEST, e.to_string()),
        Err(ServerError::Pool(e @ TxPoolError::Full(_))) => {
            error(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
        Err(e) => {
            tracing::warn!(error = %e, "transaction submission failed");
            error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// `GET /state/:key[?encoding=utf8|hex]`
///
/// `/state/FOO` and `/state/464f4f?encoding=hex` name the same key.
async fn state_handler(
    Path(key): Path<String>,
    Query(query): Query<StateQuery>,
    State(state): State<AppState>,
) -> Response {
    let raw = match query.encoding {
        KeyEncoding::Utf8 => key.clone().into_bytes(),
        KeyEncoding::Hex => match hex::decode(&key) {
            Ok(raw) => raw,
            Err(e) => return error(StatusCode::BAD_REQUEST, format!("invalid hex key: {e}")),
        },
    };
    match state.server.chain().contract_value(&raw) {
        Some(value) => {
            let int = <[u8; 8]>::try_from(value.as_slice())
                .ok()
                .map(i64::from_le_bytes);
            Json(StateResponse {
                key,
                value: hex::encode(&value),
                int,
            })
            .into_response()
        }
        None => error(StatusCode::NOT_FOUND, format!("no state for key: {key}")),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
