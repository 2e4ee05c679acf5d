//! # Transactions
//!
//! A transaction is a signed blob of contract bytecode. The payload (`data`)
//! is what the [`Vm`](crate::vm::Vm) executes when the transaction's block is
//! added to the chain; the signature covers exactly that payload.
//!
//! ## Identity
//!
//! A transaction's id is `BLAKE3(data || from)`. Two senders submitting the
//! same program produce two distinct transactions; the same sender
//! submitting it twice produces one. Neither the signature nor `first_seen`
//! take part in the id: the signature is not needed to tell transactions
//! apart, and `first_seen` is local pool bookkeeping.
//!
//! ## first_seen
//!
//! Stamped by the node (nanoseconds since the epoch) at the moment the
//! transaction enters its pool, and used to order block assembly. It is
//! carried on the wire only so that encoding is lossless; receivers
//! overwrite it on admission.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::hash::{blake3_hash_multi, Hash};
use crate::crypto::keys::{Keypair, PublicKey, Signature};

/// Why a transaction failed verification.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransactionError {
    #[error("transaction has no signature")]
    MissingSignature,

    #[error("transaction signature is invalid")]
    InvalidSignature,
}

/// A signed contract invocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// VM bytecode.
    pub data: Vec<u8>,
    /// Public key of the signer. `None` until signed.
    pub from: Option<PublicKey>,
    /// Signature over `data`. `None` until signed.
    pub signature: Option<Signature>,
    /// Pool admission time in nanoseconds since the UNIX epoch, 0 if unset.
    first_seen: i64,
}

impl Transaction {
    /// An unsigned transaction carrying `data`.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            from: None,
            signature: None,
            first_seen: 0,
        }
    }

    /// Sign the payload with `keypair`, recording its public key as the sender.
    pub fn sign(&mut self, keypair: &Keypair) {
        self.signature = Some(keypair.sign(&self.data));
        self.from = Some(keypair.public_key());
    }

    /// Check that the transaction carries a valid signature from `from`.
    pub fn verify(&self) -> Result<(), TransactionError> {
        let (Some(from), Some(signature)) = (&self.from, &self.signature) else {
            return Err(TransactionError::MissingSignature);
        };
        if !from.verify(&self.data, signature) {
            return Err(TransactionError::InvalidSignature);
        }
        Ok(())
    }

    /// Transaction id: BLAKE3 over the payload and the sender key.
    pub fn hash(&self) -> Hash {
        let from: &[u8] = match &self.from {
            Some(pk) => pk.as_bytes(),
            None => &[],
        };
        blake3_hash_multi(&[&self.data, from])
    }

    /// When this node first admitted the transaction.
    pub fn first_seen(&self) -> i64 {
        self.first_seen
    }

    /// Record the admission time.
    pub fn set_first_seen(&mut self, nanos: i64) {
        self.first_seen = nanos;
    }
}
