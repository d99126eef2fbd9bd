//! Per-chain replica state machine.
//!
//! One [`ChainReplica`] orders one chain. It is a pure, deterministic state
//! machine:
//! - Takes messages, submissions, ticks and storage acknowledgements as input
//! - Produces new state, outgoing messages, and effects as output
//! - No I/O, no clocks, no randomness
//!
//! # Protocol Overview
//!
//! ## Normal Operation
//!
//! ```text
//! Client ──Request──► Primary
//!                       │
//!                       ├──PrePrepare──► All
//!                       │
//!   All ──Prepare──► All        (quorum of matching digests → Prepared)
//!   All ──Commit───► All        (quorum of matching digests → Committed)
//!                       │
//!                       ▼
//!                 Persist(Committed) ──► store ──► Persisted ──► Committed ──► All
//! ```
//!
//! ## Catch-up
//!
//! ```text
//! Lagging ──FetchCommitted(seq)──► All
//!         ◄──Committed(seq)──────  Replicas holding seq (f + 1 matching → append)
//! ```
//!
//! ## View Change
//!
//! ```text
//! Replica ──ViewChange(priority, seq, height, hash)──► All   (on round timeout)
//!           │
//!           ▼ (f + 1 votes: join; quorum: install)
//! Highest-priority eligible candidate becomes primary
//! ```
//!
//! # Key Types
//!
//! - [`ChainReplica`]: The core state machine state
//! - [`ReplicaOutput`]: Output from processing an event
//! - [`ReplicaEvent`]: Events that can trigger state transitions

mod normal;
mod state;
mod sync;
mod view_change;

pub use state::*;

use std::fmt::Display;

use lbft_types::{AdmissionError, ReplicaId, Request, SeqNo};

use crate::message::{Committed, MessagePayload};
use crate::store::StoreError;

// ============================================================================
// Replica Output
// ============================================================================

/// Output produced by the replica state machine.
///
/// The caller (engine) is responsible for:
/// 1. Sending the outgoing messages via the transport
/// 2. Executing the effects and feeding results back as events
#[derive(Debug, Default)]
pub struct ReplicaOutput {
    /// Messages to send to other replicas.
    pub messages: Vec<OutboundMessage>,

    /// Effects to execute, in order.
    pub effects: Vec<Effect>,

    /// Sequence numbers that became durable while processing the event.
    pub committed: Vec<SeqNo>,

    /// Verdict on a [`ReplicaEvent::Submit`].
    pub submission: Option<Result<Submitted, AdmissionError>>,
}

impl ReplicaOutput {
    /// Creates an empty output (no messages, no effects).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates output with only messages.
    pub fn with_messages(messages: Vec<OutboundMessage>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// Creates output carrying a submission verdict.
    pub fn with_submission(submission: Result<Submitted, AdmissionError>) -> Self {
        Self {
            submission: Some(submission),
            ..Self::default()
        }
    }

    /// Returns true if there are no messages or effects.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.effects.is_empty()
            && self.committed.is_empty()
            && self.submission.is_none()
    }

    /// Merges another output into this one.
    pub fn merge(&mut self, other: ReplicaOutput) {
        self.messages.extend(other.messages);
        self.effects.extend(other.effects);
        self.committed.extend(other.committed);
        if other.submission.is_some() {
            self.submission = other.submission;
        }
    }
}

/// A message to send, with its destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// `None` for broadcasts.
    pub to: Option<ReplicaId>,
    pub payload: MessagePayload,
}

/// Side effects the engine executes on the replica's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Durably append this entry; report back with [`ReplicaEvent::Persisted`].
    Persist(Committed),

    /// Read `seq_no` from the store and send it to `to` as a `Committed`.
    ///
    /// Emitted when the entry has left the in-memory cache.
    ServeFetch { to: ReplicaId, seq_no: SeqNo },
}

// ============================================================================
// Replica Event
// ============================================================================

/// Events that can trigger replica state transitions.
#[derive(Debug, Clone)]
pub enum ReplicaEvent {
    /// Received a message from another replica.
    ///
    /// `from` is the sender identity established by the transport.
    Message {
        from: ReplicaId,
        payload: MessagePayload,
    },

    /// A local client submitted a batch.
    Submit(Request),

    /// A timeout fired.
    Timeout(TimeoutKind),

    /// Tick event for periodic housekeeping.
    Tick,

    /// Result of a [`Effect::Persist`].
    Persisted {
        seq_no: SeqNo,
        result: Result<(), StoreError>,
    },
}

/// Types of timeouts that can fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// The current round, or a pending request, made no progress.
    Round,

    /// A view change did not reach quorum.
    ViewChange,

    /// Catch-up fetches went unanswered.
    Sync,
}

/// How an accepted submission was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// Queued at the primary; proposed when the chain is idle.
    Queued,
    /// Queued locally and forwarded to the primary.
    Forwarded,
    /// Already pending or committed; nothing to do.
    Duplicate,
}

/// Where a chain instance is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsensusState {
    /// No round in flight.
    Idle,
    /// Accepted a proposal; collecting Prepare votes.
    PrePrepared,
    /// Prepare quorum observed; collecting Commit votes.
    Prepared,
    /// Decided; waiting for the store to acknowledge.
    Committed,
    /// Replacing the primary.
    ViewChanging,
    /// Fetching committed entries from peers.
    Syncing,
}

impl ConsensusState {
    /// Returns true while a round is in its voting phases.
    pub fn is_voting(self) -> bool {
        matches!(self, Self::PrePrepared | Self::Prepared)
    }
}

impl Display for ConsensusState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::PrePrepared => "pre-prepared",
            Self::Prepared => "prepared",
            Self::Committed => "committed",
            Self::ViewChanging => "view-changing",
            Self::Syncing => "syncing",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Creates a message to a specific target.
pub(crate) fn msg_to(to: ReplicaId, payload: MessagePayload) -> OutboundMessage {
    OutboundMessage {
        to: Some(to),
        payload,
    }
}

/// Creates a broadcast message.
pub(crate) fn msg_broadcast(payload: MessagePayload) -> OutboundMessage {
    OutboundMessage { to: None, payload }
}
