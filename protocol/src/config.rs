//! # Protocol Configuration & Constants
//!
//! Every tunable number in Basalt lives here. Peers must agree on the ones
//! that touch the wire (`PROTOCOL_VERSION`, `MAX_FRAME_SIZE`, the header
//! layout); the rest are local defaults that `ServerOptions`, `TxPoolConfig`
//! and `SyncConfig` pick up through their `Default` impls.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// Version advertised in `Status` replies. The protocol is closed and
/// versionless in practice: peers report it but never negotiate on it.
pub const PROTOCOL_VERSION: u32 = 1;

/// Version stamped into every block header this node produces.
pub const HEADER_VERSION: u32 = 1;

/// Size of a header's canonical encoding:
/// `version(4) + data_hash(32) + prev_block_hash(32) + timestamp(8) + height(4) + nonce(8)`.
pub const HEADER_ENCODED_LEN: usize = 88;

/// Seed of the well-known key that signs the genesis block. Not a secret;
/// it only exists so the genesis block passes `Block::verify` like any other.
pub const GENESIS_KEY_SEED: [u8; 32] = *b"basalt/genesis/signing-key/v1...";

// ---------------------------------------------------------------------------
// Cryptographic Parameters
// ---------------------------------------------------------------------------

/// Ed25519 secret key length in bytes.
pub const SECRET_KEY_LENGTH: usize = 32;

/// Ed25519 public key length in bytes.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Ed25519 signature length. Always 64 bytes.
pub const SIGNATURE_LENGTH: usize = 64;

/// Digest length shared by SHA-256 (headers) and BLAKE3 (transaction ids).
pub const HASH_LENGTH: usize = 32;

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// Interval between validator block production ticks.
pub const DEFAULT_BLOCK_TIME: Duration = Duration::from_secs(5);

/// How often a sync requester re-sends `GetBlocks` while behind a peer.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(3);

/// Upper bound on how long a send may wait for room in a full peer queue
/// before the message is dropped.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound on establishing an outbound TCP connection.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Queues & Limits
// ---------------------------------------------------------------------------

/// Inbound queue depth of an in-process transport.
pub const LOCAL_QUEUE_CAPACITY: usize = 1024;

/// Inbound queue depth of a TCP transport, shared by all its connections.
pub const INBOUND_QUEUE_CAPACITY: usize = 1024;

/// Outbound frames buffered per TCP peer before senders start waiting.
pub const PEER_OUTBOUND_CAPACITY: usize = 256;

/// Largest frame accepted from the wire. A `Blocks` reply is the biggest
/// message we send; 16 MiB leaves plenty of room for a full batch.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Most blocks served in a single `Blocks` reply. The requester simply asks
/// again on its next tick for whatever is left.
pub const MAX_BLOCKS_PER_RESPONSE: usize = 500;

/// Transaction pool capacity. Beyond this, new transactions are rejected.
pub const TXPOOL_MAX_SIZE: usize = 10_000;

// ---------------------------------------------------------------------------
// Network Defaults
// ---------------------------------------------------------------------------

/// Default P2P listening port.
pub const DEFAULT_P2P_PORT: u16 = 3000;

/// Default HTTP API port.
pub const DEFAULT_API_PORT: u16 = 8080;

/// Default Prometheus metrics port.
pub const DEFAULT_METRICS_PORT: u16 = 9100;
