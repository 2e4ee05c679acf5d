//! # Wire Messages
//!
//! Every message on the wire is one type byte followed by a bincode payload:
//!
//! ```text
//! ┌──────────────┬──────────────────────────────────────┐
//! │ type: u8     │ payload (bincode, depends on type)    │
//! └──────────────┴──────────────────────────────────────┘
//!   0x1 Tx         Transaction
//!   0x2 Block      Block
//!   0x3 GetBlocks  GetBlocksMessage { from, to }
//!   0x4 Blocks     BlocksMessage { blocks }
//!   0x5 GetStatus  GetStatusMessage
//!   0x6 Status     StatusMessage { id, version, current_height }
//! ```
//!
//! The protocol is closed and versionless: there is no negotiation, and an
//! unknown type byte is a decode error.
//!
//! Decoding goes through a pluggable [`RpcDecodeFn`] so a node can be wired
//! with a different payload mapping; [`default_rpc_decode`] is the one above.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bincode::Options;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use super::server::ServerError;
use super::transport::{NetAddr, Rpc};
use crate::config::MAX_FRAME_SIZE;
use crate::storage::block::Block;
use crate::transaction::Transaction;

/// Message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Tx = 0x1,
    Block = 0x2,
    GetBlocks = 0x3,
    Blocks = 0x4,
    GetStatus = 0x5,
    Status = 0x6,
}

impl TryFrom<u8> for MessageType {
    type Error = DecodeError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0x1 => Ok(Self::Tx),
            0x2 => Ok(Self::Block),
            0x3 => Ok(Self::GetBlocks),
            0x4 => Ok(Self::Blocks),
            0x5 => Ok(Self::GetStatus),
            0x6 => Ok(Self::Status),
            other => Err(DecodeError::UnknownType(other)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Errors from encoding or decoding wire messages. Decode failures are
/// logged and the message is dropped.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty message")]
    Empty,

    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),

    #[error("malformed {kind} payload: {reason}")]
    Payload { kind: MessageType, reason: String },

    #[error("failed to encode {kind} payload: {reason}")]
    Encode { kind: MessageType, reason: String },
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Ask a peer for its status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetStatusMessage;

/// A node's identity and tip height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    /// Node id (free-form, a UUID by default).
    pub id: String,
    /// Protocol version. Informational only.
    pub version: u32,
    /// Sender's tip height.
    pub current_height: u32,
}

/// Request blocks `[from, to]`. `to == 0` means "up to your tip".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlocksMessage {
    pub from: u32,
    pub to: u32,
}

/// Blocks in ascending height order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlocksMessage {
    pub blocks: Vec<Block>,
}

/// A decoded payload of any message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Transaction(Transaction),
    Block(Block),
    GetBlocks(GetBlocksMessage),
    Blocks(BlocksMessage),
    GetStatus(GetStatusMessage),
    Status(StatusMessage),
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::Transaction(_) => MessageType::Tx,
            Payload::Block(_) => MessageType::Block,
            Payload::GetBlocks(_) => MessageType::GetBlocks,
            Payload::Blocks(_) => MessageType::Blocks,
            Payload::GetStatus(_) => MessageType::GetStatus,
            Payload::Status(_) => MessageType::Status,
        }
    }

    /// Encode into a full wire message.
    pub fn encode(&self) -> Result<Bytes, DecodeError> {
        let kind = self.message_type();
        let data = match self {
            Payload::Transaction(tx) => encode_body(kind, tx)?,
            Payload::Block(block) => encode_body(kind, block)?,
            Payload::GetBlocks(msg) => encode_body(kind, msg)?,
            Payload::Blocks(msg) => encode_body(kind, msg)?,
            Payload::GetStatus(msg) => encode_body(kind, msg)?,
            Payload::Status(msg) => encode_body(kind, msg)?,
        };
        Ok(Message::new(kind, data).encode())
    }
}

fn encode_body<T: Serialize>(kind: MessageType, value: &T) -> Result<Vec<u8>, DecodeError> {
    bincode::serialize(value).map_err(|e| DecodeError::Encode {
        kind,
        reason: e.to_string(),
    })
}

// Same layout as `bincode::serialize`, but with a size limit so a hostile
// length prefix cannot trigger a huge allocation.
fn decode_body<T: DeserializeOwned>(kind: MessageType, bytes: &[u8]) -> Result<T, DecodeError> {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_limit(u64::from(MAX_FRAME_SIZE))
        .deserialize(bytes)
        .map_err(|e| DecodeError::Payload {
            kind,
            reason: e.to_string(),
        })
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The wire envelope: a type tag and opaque payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: MessageType,
    pub data: Bytes,
}

impl Message {
    pub fn new(header: MessageType, data: impl Into<Bytes>) -> Self {
        Self {
            header,
            data: data.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.data.len());
        buf.put_u8(self.header as u8);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn decode(bytes: &Bytes) -> Result<Self, DecodeError> {
        let (&tag, _) = bytes.split_first().ok_or(DecodeError::Empty)?;
        Ok(Self {
            header: MessageType::try_from(tag)?,
            data: bytes.slice(1..),
        })
    }

    /// Decode the payload according to the type tag.
    pub fn payload(&self) -> Result<Payload, DecodeError> {
        let kind = self.header;
        let data = &self.data[..];
        Ok(match kind {
            MessageType::Tx => Payload::Transaction(decode_body(kind, data)?),
            MessageType::Block => Payload::Block(decode_body(kind, data)?),
            MessageType::GetBlocks => Payload::GetBlocks(decode_body(kind, data)?),
            MessageType::Blocks => Payload::Blocks(decode_body(kind, data)?),
            MessageType::GetStatus => Payload::GetStatus(decode_body(kind, data)?),
            MessageType::Status => Payload::Status(decode_body(kind, data)?),
        })
    }
}

// ---------------------------------------------------------------------------
// Decoding & processing seams
// ---------------------------------------------------------------------------

/// A message with its sender, ready for processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    pub from: NetAddr,
    pub data: Payload,
}

/// Maps a raw inbound envelope to a typed message.
pub type RpcDecodeFn = Arc<dyn Fn(&Rpc) -> Result<DecodedMessage, DecodeError> + Send + Sync>;

/// The standard decoder for the message table above.
pub fn default_rpc_decode(rpc: &Rpc) -> Result<DecodedMessage, DecodeError> {
    let message = Message::decode(&rpc.payload)?;
    Ok(DecodedMessage {
        from: rpc.from.clone(),
        data: message.payload()?,
    })
}

/// Handles decoded messages. The node server is the default processor.
#[async_trait]
pub trait RpcProcessor: Send + Sync {
    async fn process_message(&self, message: DecodedMessage) -> Result<(), ServerError>;
}
