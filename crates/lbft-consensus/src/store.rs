//! Durable storage for committed entries.
//!
//! The replica state machine never touches storage directly; it emits
//! persist effects and the engine executes them against a [`CommitStore`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use lbft_types::{ChainId, SeqNo};
use thiserror::Error;

use crate::message::Committed;

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("chain {chain}: expected append at {expected}, got {got}")]
    OutOfOrder {
        chain: ChainId,
        expected: SeqNo,
        got: SeqNo,
    },

    #[error("chain {chain}: a different entry is already stored at {seq_no}")]
    Conflict { chain: ChainId, seq_no: SeqNo },

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Append-only, per-chain store of committed entries.
///
/// Implementations must accept appends only in sequence order and treat a
/// repeated append of an identical entry as success.
pub trait CommitStore: Send + Sync {
    /// Durably appends `entry` at `entry.seq_no` of `chain`.
    fn append(&self, chain: &ChainId, entry: &Committed) -> Result<(), StoreError>;

    /// Reads the entry at `seq_no`, if stored.
    fn read(&self, chain: &ChainId, seq_no: SeqNo) -> Result<Option<Committed>, StoreError>;

    /// Highest stored sequence number of `chain`.
    fn last_seq_no(&self, chain: &ChainId) -> Result<SeqNo, StoreError>;
}

/// In-memory commit store for testing and development.
///
/// Not suitable for production - data is lost on restart. Appends can be
/// made to fail on demand to exercise the retry path.
#[derive(Debug, Default)]
pub struct MemoryCommitStore {
    chains: Mutex<HashMap<ChainId, Vec<Committed>>>,
    fail_next: AtomicUsize,
    appends: AtomicU64,
}

impl MemoryCommitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` appends fail with [`StoreError::Unavailable`].
    pub fn fail_next_appends(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Successful appends so far.
    pub fn append_count(&self) -> u64 {
        self.appends.load(Ordering::Relaxed)
    }

    /// Copy of every stored entry of `chain`, in order.
    pub fn entries(&self, chain: &ChainId) -> Vec<Committed> {
        self.chains
            .lock()
            .map(|chains| chains.get(chain).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    fn take_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl CommitStore for MemoryCommitStore {
    fn append(&self, chain: &ChainId, entry: &Committed) -> Result<(), StoreError> {
        if self.take_failure() {
            return Err(StoreError::Unavailable("injected append failure".to_string()));
        }

        let mut chains = self
            .chains
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))?;
        let log = chains.entry(chain.clone()).or_default();

        let index = entry.seq_no.as_u32() as usize;
        if index == 0 {
            return Err(StoreError::OutOfOrder {
                chain: chain.clone(),
                expected: SeqNo::new(log.len() as u32 + 1),
                got: entry.seq_no,
            });
        }

        if let Some(existing) = log.get(index - 1) {
            return if existing.digest() == entry.digest() {
                Ok(())
            } else {
                Err(StoreError::Conflict {
                    chain: chain.clone(),
                    seq_no: entry.seq_no,
                })
            };
        }

        if index != log.len() + 1 {
            return Err(StoreError::OutOfOrder {
                chain: chain.clone(),
                expected: SeqNo::new(log.len() as u32 + 1),
                got: entry.seq_no,
            });
        }

        log.push(entry.clone());
        self.appends.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn read(&self, chain: &ChainId, seq_no: SeqNo) -> Result<Option<Committed>, StoreError> {
        let chains = self
            .chains
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))?;
        let index = seq_no.as_u32() as usize;
        if index == 0 {
            return Ok(None);
        }
        Ok(chains
            .get(chain)
            .and_then(|log| log.get(index - 1))
            .cloned())
    }

    fn last_seq_no(&self, chain: &ChainId) -> Result<SeqNo, StoreError> {
        let chains = self
            .chains
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))?;
        Ok(SeqNo::new(
            chains.get(chain).map_or(0, |log| log.len() as u32),
        ))
    }
}
