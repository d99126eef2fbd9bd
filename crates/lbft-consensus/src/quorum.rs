//! Vote counting for quorum certificates.
//!
//! The tracker counts distinct voters per `(chain, seq_no, phase)` slot and
//! per digest. A slot is certified the first time any digest reaches the
//! phase threshold; later votes never re-certify it.
//!
//! # Invariants
//!
//! - A voter counts at most once per slot. A second vote for the same
//!   digest is a [`VoteOutcome::Duplicate`]; a vote for a different digest
//!   is an [`VoteOutcome::Equivocation`] and is not counted.
//! - [`VoteOutcome::QuorumReached`] is returned exactly once per slot.

use std::collections::{BTreeSet, HashMap, VecDeque};

use lbft_types::{ChainId, Digest, ReplicaId, SeqNo};

/// Equivocation records retained for inspection.
const MAX_EVIDENCE: usize = 64;

/// Which vote a slot collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    /// First-phase votes; certified at a strong quorum.
    Prepare,
    /// Second-phase votes; certified at a strong quorum.
    Commit,
    /// Committed announcements from peers; certified at `f + 1`.
    Committed,
}

/// Identifies one vote-collection slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoteKey {
    pub chain: ChainId,
    pub seq_no: SeqNo,
    pub phase: Phase,
}

impl VoteKey {
    pub fn new(chain: ChainId, seq_no: SeqNo, phase: Phase) -> Self {
        Self {
            chain,
            seq_no,
            phase,
        }
    }
}

/// A replica voted for two digests in the same slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Equivocation {
    pub key: VoteKey,
    pub replica: ReplicaId,
    pub first: Digest,
    pub second: Digest,
}

/// Result of recording one vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    /// Counted; `votes` distinct voters now back this digest.
    Recorded { votes: usize },
    /// Counted, and this vote certified the slot for the digest.
    QuorumReached(Digest),
    /// The voter already voted for this digest.
    Duplicate,
    /// The voter already voted for a different digest; not counted.
    Equivocation(Equivocation),
}

#[derive(Debug, Default)]
struct VoteSet {
    by_replica: HashMap<ReplicaId, Digest>,
    by_digest: HashMap<Digest, BTreeSet<ReplicaId>>,
    certified: Option<Digest>,
}

/// Counts votes and detects quorum certificates.
#[derive(Debug)]
pub struct QuorumTracker {
    quorum: usize,
    weak: usize,
    slots: HashMap<VoteKey, VoteSet>,
    evidence: VecDeque<Equivocation>,
}

impl QuorumTracker {
    /// Creates a tracker certifying at `quorum` (strong) and `weak` (`f + 1`).
    pub fn new(quorum: usize, weak: usize) -> Self {
        debug_assert!(weak >= 1 && weak <= quorum);
        Self {
            quorum,
            weak,
            slots: HashMap::new(),
            evidence: VecDeque::new(),
        }
    }

    /// Voters a phase needs for a certificate.
    pub fn threshold(&self, phase: Phase) -> usize {
        match phase {
            Phase::Prepare | Phase::Commit => self.quorum,
            Phase::Committed => self.weak,
        }
    }

    /// Records `replica`'s vote for `digest` in the slot `key`.
    pub fn record(&mut self, key: VoteKey, digest: Digest, replica: ReplicaId) -> VoteOutcome {
        let threshold = self.threshold(key.phase);
        let slot = self.slots.entry(key.clone()).or_default();

        if let Some(&previous) = slot.by_replica.get(&replica) {
            if previous == digest {
                return VoteOutcome::Duplicate;
            }

            let evidence = Equivocation {
                key,
                replica,
                first: previous,
                second: digest,
            };
            if self.evidence.len() == MAX_EVIDENCE {
                self.evidence.pop_front();
            }
            self.evidence.push_back(evidence.clone());
            return VoteOutcome::Equivocation(evidence);
        }

        slot.by_replica.insert(replica.clone(), digest);
        let voters = slot.by_digest.entry(digest).or_default();
        voters.insert(replica);
        let votes = voters.len();

        if slot.certified.is_none() && votes >= threshold {
            slot.certified = Some(digest);
            return VoteOutcome::QuorumReached(digest);
        }

        VoteOutcome::Recorded { votes }
    }

    /// Digest the slot was certified for, if any.
    pub fn certified(&self, key: &VoteKey) -> Option<Digest> {
        self.slots.get(key).and_then(|slot| slot.certified)
    }

    /// Distinct voters backing `digest` in the slot.
    pub fn votes_for(&self, key: &VoteKey, digest: &Digest) -> usize {
        self.slots
            .get(key)
            .and_then(|slot| slot.by_digest.get(digest))
            .map_or(0, BTreeSet::len)
    }

    /// Drops every slot at or below `seq_no`.
    pub fn retire_through(&mut self, chain: &ChainId, seq_no: SeqNo) {
        self.slots
            .retain(|key, _| !(key.chain == *chain && key.seq_no <= seq_no));
    }

    /// Drops Prepare and Commit slots at or above `from`.
    ///
    /// Used when a round is cancelled; Committed announcements stay since
    /// they describe entries that are final regardless of the primary.
    pub fn abandon_from(&mut self, chain: &ChainId, from: SeqNo) {
        self.slots.retain(|key, _| {
            !(key.chain == *chain && key.seq_no >= from && key.phase != Phase::Committed)
        });
    }

    /// Recent equivocations, oldest first.
    pub fn evidence(&self) -> impl Iterator<Item = &Equivocation> {
        self.evidence.iter()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }
}
