//! # lbft-consensus: Multi-chain BFT ordering core
//!
//! Orders transaction batches independently per chain with a three-phase
//! (PrePrepare / Prepare / Commit) protocol that tolerates `f` Byzantine
//! replicas out of `n`, where `f = (n - 1) / 3`.
//!
//! ## Architecture
//!
//! - [`replica`]: Pure per-chain state machine, `process(event) -> (state, output)`
//! - [`engine`]: Drives one replica per chain, executes effects, owns I/O
//! - [`quorum`]: Vote counting and equivocation detection
//! - [`checkpoint`]: Gapless commit log with durability tracking
//! - [`message`] / [`codec`]: Wire envelope and type-checked payload codec
//! - [`store`] / [`transport`]: Collaborator traits with in-memory versions
//! - [`instrumentation`]: Process-wide counters
//!
//! ## Example
//!
//! ```ignore
//! use lbft_consensus::{ConsensusConfig, Engine, MemoryCommitStore, MemoryTransport};
//!
//! let config = ConsensusConfig::new("a", replicas, chains);
//! let engine = Engine::new(config, MemoryCommitStore::new(), MemoryTransport::new())?;
//!
//! engine.submit(&chain, request)?;
//! engine.on_message(&from, &message)?;
//! engine.tick()?;
//! ```

pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod engine;
pub mod instrumentation;
pub mod message;
pub mod quorum;
pub mod replica;
pub mod store;
pub mod transport;

#[cfg(test)]
mod tests;

// Re-export commonly used items
pub use checkpoint::{AppendOutcome, CommitLog, CommitLogError, LogHead};
pub use codec::CodecError;
pub use config::{ConsensusConfig, max_faults, quorum_size};
pub use engine::{Engine, EngineError};
pub use instrumentation::{METRICS, Metrics, MetricsSnapshot};
pub use message::{
    Commit, Committed, FetchCommitted, Message, MessagePayload, MessageType, PrePrepare, Prepare,
    ViewChange,
};
pub use quorum::{Equivocation, Phase, QuorumTracker, VoteKey, VoteOutcome};
pub use replica::{
    ChainReplica, ChainStatus, ConsensusState, Effect, OutboundMessage, ReplicaEvent,
    ReplicaOutput, Submitted, TimeoutKind,
};
pub use store::{CommitStore, MemoryCommitStore, StoreError};
pub use transport::{MemoryTransport, Sent, Transport};
