//! Per-chain commit log.
//!
//! The log is the gapless sequence of committed entries for one chain. It
//! tracks two cursors:
//!
//! - `last_seq_no`: highest entry appended in memory
//! - `durable_seq_no`: highest entry the commit store has acknowledged
//!
//! `durable_seq_no <= last_seq_no` always holds, and entries become durable
//! strictly in order. Entries that arrive ahead of `last_seq_no + 1` are
//! buffered and drained as soon as the gap closes.
//!
//! Only a bounded window of recent durable entries is kept in memory; older
//! ones are served from the commit store.

use std::collections::{BTreeMap, HashMap};

use lbft_types::{ChainId, Digest, SeqNo};
use thiserror::Error;

use crate::message::Committed;

/// Errors from appending to the commit log.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitLogError {
    /// The entry is not the next in sequence. It was buffered if it lies
    /// within the buffering window.
    #[error("gap in commit log: expected {expected}, got {got}")]
    Gap { expected: SeqNo, got: SeqNo },

    /// A different batch is already recorded at this sequence number.
    #[error("conflicting entry at {seq_no}: have {existing:?}, got {incoming:?}")]
    Conflict {
        seq_no: SeqNo,
        existing: Digest,
        incoming: Digest,
    },

    /// The entry belongs to another chain.
    #[error("entry for chain {got} appended to log of chain {expected}")]
    WrongChain { expected: ChainId, got: ChainId },
}

/// Result of a successful append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// These entries were appended, in order: the one passed in followed by
    /// any buffered successors it unblocked.
    Appended(Vec<Committed>),
    /// The same batch was already recorded at this sequence number.
    Duplicate,
}

/// The durable head of the log, reported in view-change votes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogHead {
    pub seq_no: SeqNo,
    pub height: u32,
    pub digest: Digest,
}

/// Gapless commit log for one chain.
#[derive(Debug)]
pub struct CommitLog {
    chain: ChainId,
    capacity: usize,

    last_seq_no: SeqNo,
    durable_seq_no: SeqNo,
    head: LogHead,

    /// Recent entries, durable and not yet durable.
    entries: BTreeMap<SeqNo, Committed>,
    digests: HashMap<Digest, SeqNo>,

    /// Entries waiting for a gap below them to close.
    buffered: BTreeMap<SeqNo, Committed>,
}

impl CommitLog {
    /// Creates an empty log retaining up to `capacity` durable entries.
    pub fn new(chain: ChainId, capacity: usize) -> Self {
        Self {
            chain,
            capacity: capacity.max(1),
            last_seq_no: SeqNo::ZERO,
            durable_seq_no: SeqNo::ZERO,
            head: LogHead::default(),
            entries: BTreeMap::new(),
            digests: HashMap::new(),
            buffered: BTreeMap::new(),
        }
    }

    /// Reopens a log whose durable tail is `last`, as read back from storage.
    pub fn recovered(chain: ChainId, capacity: usize, last: Option<Committed>) -> Self {
        let mut log = Self::new(chain, capacity);
        if let Some(entry) = last {
            let digest = entry.digest();
            log.last_seq_no = entry.seq_no;
            log.durable_seq_no = entry.seq_no;
            log.head = LogHead {
                seq_no: entry.seq_no,
                height: entry.request.height,
                digest,
            };
            log.digests.insert(digest, entry.seq_no);
            log.entries.insert(entry.seq_no, entry);
        }
        log
    }

    pub fn chain(&self) -> &ChainId {
        &self.chain
    }

    pub fn last_seq_no(&self) -> SeqNo {
        self.last_seq_no
    }

    pub fn durable_seq_no(&self) -> SeqNo {
        self.durable_seq_no
    }

    pub fn head(&self) -> LogHead {
        self.head
    }

    /// Returns true if every appended entry is durable.
    pub fn is_settled(&self) -> bool {
        self.durable_seq_no == self.last_seq_no
    }

    /// Appends the next committed entry.
    ///
    /// Idempotent for a repeated `(seq_no, digest)`. An entry past the next
    /// slot is buffered (when within the cache window) and reported as a gap.
    pub fn append(&mut self, entry: Committed) -> Result<AppendOutcome, CommitLogError> {
        if entry.chain != self.chain {
            return Err(CommitLogError::WrongChain {
                expected: self.chain.clone(),
                got: entry.chain,
            });
        }

        let seq_no = entry.seq_no;
        let incoming = entry.digest();

        if seq_no <= self.last_seq_no {
            return match self.entries.get(&seq_no) {
                Some(existing) if existing.digest() != incoming => Err(CommitLogError::Conflict {
                    seq_no,
                    existing: existing.digest(),
                    incoming,
                }),
                // Evicted entries were durable; trust the earlier decision.
                _ => Ok(AppendOutcome::Duplicate),
            };
        }

        let expected = self.last_seq_no.next();
        if seq_no > expected {
            if let Some(existing) = self.buffered.get(&seq_no) {
                let existing = existing.digest();
                if existing != incoming {
                    return Err(CommitLogError::Conflict {
                        seq_no,
                        existing,
                        incoming,
                    });
                }
            } else if self.last_seq_no.distance_to(seq_no) as usize <= self.capacity {
                self.buffered.insert(seq_no, entry);
            }
            return Err(CommitLogError::Gap {
                expected,
                got: seq_no,
            });
        }

        let mut appended = vec![entry.clone()];
        self.push(entry, incoming);

        while let Some(next) = self.buffered.remove(&self.last_seq_no.next()) {
            let digest = next.digest();
            appended.push(next.clone());
            self.push(next, digest);
        }

        Ok(AppendOutcome::Appended(appended))
    }

    fn push(&mut self, entry: Committed, digest: Digest) {
        self.last_seq_no = entry.seq_no;
        self.digests.insert(digest, entry.seq_no);
        self.entries.insert(entry.seq_no, entry);
    }

    /// Marks `seq_no` durable. Returns false unless it is the next entry
    /// awaiting durability.
    pub fn mark_durable(&mut self, seq_no: SeqNo) -> bool {
        if seq_no != self.durable_seq_no.next() || seq_no > self.last_seq_no {
            return false;
        }

        self.durable_seq_no = seq_no;
        if let Some(entry) = self.entries.get(&seq_no) {
            self.head = LogHead {
                seq_no,
                height: entry.request.height,
                digest: entry.digest(),
            };
        }
        self.evict();
        true
    }

    /// Drops the oldest durable entries beyond the cache capacity.
    fn evict(&mut self) {
        while self.entries.len() > self.capacity {
            let Some((&oldest, _)) = self.entries.first_key_value() else {
                break;
            };
            if oldest >= self.durable_seq_no {
                break;
            }
            if let Some(entry) = self.entries.remove(&oldest) {
                self.digests.remove(&entry.digest());
            }
        }
    }

    /// Cached entry at `seq_no`, durable or not.
    pub fn get(&self, seq_no: SeqNo) -> Option<&Committed> {
        self.entries.get(&seq_no)
    }

    /// Cached durable entry at `seq_no`; `None` if not durable or evicted.
    pub fn fetch(&self, seq_no: SeqNo) -> Option<&Committed> {
        if seq_no > self.durable_seq_no {
            return None;
        }
        self.entries.get(&seq_no)
    }

    /// Sequence number a cached entry with this digest was committed at.
    pub fn seq_no_of(&self, digest: &Digest) -> Option<SeqNo> {
        self.digests.get(digest).copied()
    }

    /// Appended entries the store has not acknowledged yet, in order.
    pub fn undurable(&self) -> impl Iterator<Item = &Committed> {
        self.entries
            .range(self.durable_seq_no.next()..=self.last_seq_no)
            .map(|(_, entry)| entry)
    }

    /// Lowest buffered sequence number, if any.
    pub fn first_buffered(&self) -> Option<SeqNo> {
        self.buffered.keys().next().copied()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lbft_types::{Request, Transaction};
    use proptest::prelude::*;

    fn entry(seq: u32, id: i64) -> Committed {
        Committed {
            seq_no: SeqNo::new(seq),
            request: Request::new(
                id,
                0,
                seq,
                vec![Transaction::new("X", "Y", id as u64, vec![])],
            ),
            chain: ChainId::from("X"),
            replica_id: "a".into(),
        }
    }

    fn appended_seqs(outcome: AppendOutcome) -> Vec<u32> {
        match outcome {
            AppendOutcome::Appended(entries) => {
                entries.iter().map(|e| e.seq_no.as_u32()).collect()
            }
            AppendOutcome::Duplicate => Vec::new(),
        }
    }

    #[test]
    fn appends_in_order() {
        let mut log = CommitLog::new(ChainId::from("X"), 16);
        assert_eq!(appended_seqs(log.append(entry(1, 10)).unwrap()), vec![1]);
        assert_eq!(appended_seqs(log.append(entry(2, 20)).unwrap()), vec![2]);
        assert_eq!(log.last_seq_no(), SeqNo::new(2));
        assert_eq!(log.durable_seq_no(), SeqNo::ZERO);
        assert_eq!(log.undurable().count(), 2);
    }

    #[test]
    fn same_entry_twice_is_idempotent() {
        let mut log = CommitLog::new(ChainId::from("X"), 16);
        log.append(entry(1, 10)).unwrap();
        assert_eq!(log.append(entry(1, 10)).unwrap(), AppendOutcome::Duplicate);
        assert_eq!(log.last_seq_no(), SeqNo::new(1));
    }

    #[test]
    fn conflicting_entry_is_rejected() {
        let mut log = CommitLog::new(ChainId::from("X"), 16);
        log.append(entry(1, 10)).unwrap();
        assert!(matches!(
            log.append(entry(1, 11)),
            Err(CommitLogError::Conflict { .. })
        ));
    }

    #[test]
    fn gap_is_buffered_then_drained() {
        let mut log = CommitLog::new(ChainId::from("X"), 16);
        assert_eq!(
            log.append(entry(3, 30)),
            Err(CommitLogError::Gap {
                expected: SeqNo::new(1),
                got: SeqNo::new(3),
            })
        );
        assert!(log.append(entry(2, 20)).is_err());
        assert_eq!(log.first_buffered(), Some(SeqNo::new(2)));
        assert_eq!(log.last_seq_no(), SeqNo::ZERO);

        assert_eq!(appended_seqs(log.append(entry(1, 10)).unwrap()), vec![1, 2, 3]);
        assert_eq!(log.last_seq_no(), SeqNo::new(3));
        assert_eq!(log.buffered_len(), 0);
    }

    #[test]
    fn durability_advances_in_order() {
        let mut log = CommitLog::new(ChainId::from("X"), 16);
        log.append(entry(1, 10)).unwrap();
        log.append(entry(2, 20)).unwrap();

        assert!(!log.mark_durable(SeqNo::new(2)));
        assert!(log.mark_durable(SeqNo::new(1)));
        assert!(log.mark_durable(SeqNo::new(2)));
        assert!(!log.mark_durable(SeqNo::new(3)));

        assert!(log.is_settled());
        assert_eq!(log.head().seq_no, SeqNo::new(2));
        assert_eq!(log.head().height, 2);
        assert_eq!(log.head().digest, entry(2, 20).digest());
    }

    #[test]
    fn fetch_serves_only_durable_entries() {
        let mut log = CommitLog::new(ChainId::from("X"), 16);
        log.append(entry(1, 10)).unwrap();
        assert!(log.fetch(SeqNo::new(1)).is_none());
        log.mark_durable(SeqNo::new(1));
        assert_eq!(log.fetch(SeqNo::new(1)), Some(&entry(1, 10)));
    }

    #[test]
    fn cache_evicts_oldest_durable_entries() {
        let mut log = CommitLog::new(ChainId::from("X"), 2);
        for seq in 1..=4 {
            log.append(entry(seq, i64::from(seq) * 10)).unwrap();
            log.mark_durable(SeqNo::new(seq));
        }
        assert!(log.fetch(SeqNo::new(1)).is_none());
        assert!(log.fetch(SeqNo::new(4)).is_some());
        assert_eq!(log.seq_no_of(&entry(4, 40).digest()), Some(SeqNo::new(4)));
        assert_eq!(log.seq_no_of(&entry(1, 10).digest()), None);

        // Evicted slots are assumed settled.
        assert_eq!(log.append(entry(1, 99)).unwrap(), AppendOutcome::Duplicate);
    }

    #[test]
    fn recovered_log_resumes_after_tail() {
        let mut log = CommitLog::recovered(ChainId::from("X"), 8, Some(entry(5, 50)));
        assert_eq!(log.durable_seq_no(), SeqNo::new(5));
        assert_eq!(log.head().height, 5);
        assert_eq!(appended_seqs(log.append(entry(6, 60)).unwrap()), vec![6]);
    }

    #[test]
    fn foreign_chain_is_rejected() {
        let mut log = CommitLog::new(ChainId::from("Y"), 8);
        assert!(matches!(
            log.append(entry(1, 10)),
            Err(CommitLogError::WrongChain { .. })
        ));
    }

    proptest! {
        /// Any arrival order within the cache window yields one gapless,
        /// ordered sequence of appended entries.
        #[test]
        fn prop_appends_are_gapless(
            order in (1u32..=12).prop_flat_map(|n| Just((1..=n).collect::<Vec<u32>>()).prop_shuffle()),
        ) {
            let mut log = CommitLog::new(ChainId::from("X"), 16);
            let mut appended = Vec::new();
            for seq in &order {
                if let Ok(outcome) = log.append(entry(*seq, i64::from(*seq) * 10)) {
                    appended.extend(appended_seqs(outcome));
                }
            }

            let expected: Vec<u32> = (1..=order.len() as u32).collect();
            prop_assert_eq!(appended, expected);
            prop_assert_eq!(log.last_seq_no(), SeqNo::new(order.len() as u32));
            prop_assert_eq!(log.buffered_len(), 0);
        }
    }
}
