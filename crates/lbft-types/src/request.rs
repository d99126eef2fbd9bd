//! Transaction batches and their admission rules.
//!
//! A [`Request`] is the unit of ordering: one primary proposes it, every
//! replica of the chain votes on its [`Digest`], and it ends up as a single
//! committed sequence entry.
//!
//! # Admission
//!
//! A batch is admissible iff it is the designated no-op batch
//! ([`EMPTY_REQUEST`]) or every transaction in it shares one source chain and
//! one destination chain. Admission is a pure predicate: it never mutates
//! the batch and never touches I/O.

use std::collections::BTreeSet;
use std::fmt::Display;

use blake3::Hasher;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ChainId, Digest};

/// Request ID reserved for the no-op heartbeat batch.
///
/// An empty request carries no transactions and is admissible on any chain.
pub const EMPTY_REQUEST: i64 = i64::MIN;

// ============================================================================
// Transaction
// ============================================================================

/// A single cross-chain transaction.
///
/// Only the chain routing is interpreted by consensus; the payload is opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Chain the transaction originates from.
    pub from_chain: ChainId,
    /// Chain the transaction is delivered to.
    pub to_chain: ChainId,
    /// Sender-assigned nonce.
    pub nonce: u64,
    /// Opaque transaction body.
    pub payload: Bytes,
}

impl Transaction {
    pub fn new(
        from_chain: impl Into<ChainId>,
        to_chain: impl Into<ChainId>,
        nonce: u64,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            from_chain: from_chain.into(),
            to_chain: to_chain.into(),
            nonce,
            payload: payload.into(),
        }
    }
}

// ============================================================================
// Request
// ============================================================================

/// A proposed batch of transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Batch identifier; [`EMPTY_REQUEST`] marks the no-op batch.
    pub id: i64,
    /// Proposal time (seconds, as assigned by the submitter).
    pub time: u32,
    /// Block height the batch was built against.
    pub height: u32,
    /// Ordered transactions.
    pub txs: Vec<Transaction>,
}

impl Request {
    pub fn new(id: i64, time: u32, height: u32, txs: Vec<Transaction>) -> Self {
        Self {
            id,
            time,
            height,
            txs,
        }
    }

    /// Creates the no-op heartbeat batch.
    pub fn empty(time: u32, height: u32) -> Self {
        Self::new(EMPTY_REQUEST, time, height, Vec::new())
    }

    /// Returns true if this is the no-op batch.
    pub fn is_empty_request(&self) -> bool {
        self.id == EMPTY_REQUEST
    }

    /// Admission predicate.
    ///
    /// True iff this is the no-op batch or all transactions agree on exactly
    /// one source chain and exactly one destination chain.
    ///
    /// # Examples
    ///
    /// ```
    /// use lbft_types::{Request, Transaction};
    ///
    /// let ok = Request::new(1, 0, 0, vec![Transaction::new("X", "Y", 0, vec![])]);
    /// assert!(ok.is_valid());
    ///
    /// let mixed = Request::new(2, 0, 0, vec![
    ///     Transaction::new("X", "Y", 0, vec![]),
    ///     Transaction::new("X", "Z", 1, vec![]),
    /// ]);
    /// assert!(!mixed.is_valid());
    /// ```
    pub fn is_valid(&self) -> bool {
        self.check().is_ok()
    }

    /// Admission predicate with a reason on rejection.
    pub fn check(&self) -> Result<(), AdmissionError> {
        if self.is_empty_request() {
            return Ok(());
        }

        let from: BTreeSet<&ChainId> = self.txs.iter().map(|tx| &tx.from_chain).collect();
        let to: BTreeSet<&ChainId> = self.txs.iter().map(|tx| &tx.to_chain).collect();

        match (from.len(), to.len()) {
            (0, _) | (_, 0) => Err(AdmissionError::NoTransactions),
            (1, 1) => Ok(()),
            (1, n) => Err(AdmissionError::MixedDestinationChains(n)),
            (n, _) => Err(AdmissionError::MixedSourceChains(n)),
        }
    }

    /// Source chain of the batch (first transaction), if any.
    pub fn from_chain(&self) -> Option<&ChainId> {
        self.txs.first().map(|tx| &tx.from_chain)
    }

    /// Destination chain of the batch (first transaction), if any.
    pub fn to_chain(&self) -> Option<&ChainId> {
        self.txs.first().map(|tx| &tx.to_chain)
    }

    /// Returns true if `chain` takes part in this batch.
    ///
    /// The no-op batch belongs to every chain.
    pub fn involves(&self, chain: &ChainId) -> bool {
        self.is_empty_request()
            || self.from_chain() == Some(chain)
            || self.to_chain() == Some(chain)
    }

    /// Content digest binding votes to this exact batch.
    ///
    /// Fields are hashed in a fixed order with length prefixes so that
    /// distinct batches cannot collide by concatenation.
    pub fn digest(&self) -> Digest {
        let mut hasher = Hasher::new();

        hasher.update(&self.id.to_le_bytes());
        hasher.update(&self.time.to_le_bytes());
        hasher.update(&self.height.to_le_bytes());
        hasher.update(&(self.txs.len() as u64).to_le_bytes());

        for tx in &self.txs {
            update_prefixed(&mut hasher, tx.from_chain.as_str().as_bytes());
            update_prefixed(&mut hasher, tx.to_chain.as_str().as_bytes());
            hasher.update(&tx.nonce.to_le_bytes());
            update_prefixed(&mut hasher, &tx.payload);
        }

        Digest::from_bytes(*hasher.finalize().as_bytes())
    }

    /// Batch identity used for logging and dedup keys.
    pub fn name(&self) -> BatchName {
        BatchName {
            from_chain: self.from_chain().cloned().unwrap_or_default(),
            to_chain: self.to_chain().cloned().unwrap_or_default(),
            digest: self.digest(),
            tx_count: self.txs.len(),
        }
    }
}

fn update_prefixed(hasher: &mut Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

// ============================================================================
// Batch Identity
// ============================================================================

/// Four-part batch identity: `(from_chain, to_chain, digest, tx_count)`.
///
/// Renders as `from-to-digesthex-count`. Two requests with equal names carry
/// identical content, so the digest alone is the dedup key; the chains and
/// count make log lines readable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchName {
    pub from_chain: ChainId,
    pub to_chain: ChainId,
    pub digest: Digest,
    pub tx_count: usize,
}

impl Display for BatchName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.from_chain, self.to_chain, self.digest, self.tx_count
        )
    }
}

// ============================================================================
// Admission Errors
// ============================================================================

/// Reasons a batch is refused before it may enter consensus.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// A non-empty request without any transactions.
    #[error("batch has no transactions and is not the empty request")]
    NoTransactions,

    /// Transactions originate from more than one chain.
    #[error("batch spans {0} source chains")]
    MixedSourceChains(usize),

    /// Transactions target more than one chain.
    #[error("batch spans {0} destination chains")]
    MixedDestinationChains(usize),

    /// The batch was submitted to a chain it does not touch.
    #[error("batch does not involve chain {0}")]
    ChainNotInvolved(ChainId),

    /// This replica does not serve the chain.
    #[error("chain {0} is not served by this replica")]
    UnknownChain(ChainId),

    /// The chain's pending queue is at capacity.
    #[error("pending request queue for chain {0} is full")]
    QueueFull(ChainId),
}
