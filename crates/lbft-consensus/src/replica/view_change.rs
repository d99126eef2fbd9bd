//! View change protocol handlers.
//!
//! A replica that suspects the primary broadcasts a [`ViewChange`] vote
//! carrying its candidacy priority and its durable log head. Votes are kept
//! per voter (a re-vote replaces the earlier one) and count whichever
//! primary they name, so replicas that settled on different primaries can
//! still pool their votes for the next one.
//!
//! - `f + 1` votes: join the view change.
//! - `quorum` votes: install the new primary, the highest-priority eligible
//!   candidate (ties go to the lower replica id). Every primary named by a
//!   vote is a suspect and not eligible. Replicas behind the highest
//!   reported sequence number catch up before taking part in new rounds.
//!
//! A replica that missed a view change learns the new primary once `f + 1`
//! peers are seen acting under it. A replica whose primary came out of its
//! own view change needs a full quorum of such peers before it switches.

use std::cmp::Ordering;
use std::collections::HashSet;

use blake3::Hasher;
use lbft_types::{ReplicaId, SeqNo};

use crate::instrumentation::METRICS;
use crate::message::{MessagePayload, MessageType, ViewChange};

use super::{ChainReplica, ConsensusState, ReplicaOutput, msg_broadcast};

impl ChainReplica {
    // ========================================================================
    // Starting a View Change
    // ========================================================================

    /// Suspects the current primary and casts a vote to replace it.
    pub(crate) fn start_view_change(mut self) -> (Self, ReplicaOutput) {
        if self.state == ConsensusState::ViewChanging {
            return (self, ReplicaOutput::empty());
        }

        tracing::warn!(
            replica = %self.replica_id,
            chain = %self.chain,
            suspect = %self.primary,
            seq = %self.log.durable_seq_no(),
            "starting view change"
        );
        METRICS.increment_view_changes_started();

        if let Some(round) = self.round.take() {
            self.tracker.abandon_from(&self.chain, round.seq_no);
            let digest = round.digest;
            if !self.pending_digests.contains(&digest)
                && self.log.seq_no_of(&digest).is_none()
                && self.pending.len() < self.config.max_pending_requests
            {
                self.enqueue(digest, round.request);
            }
        }
        self.deferred = None;
        self.elected = false;
        self.primary_hints.clear();
        self.deposed.clear();
        self.state = ConsensusState::ViewChanging;

        self.cast_view_change_vote()
    }

    /// Broadcasts this replica's vote and checks for a quorum.
    fn cast_view_change_vote(mut self) -> (Self, ReplicaOutput) {
        self.view_attempt += 1;
        let head = self.log.head();
        let vote = ViewChange {
            id: self.replica_id.clone(),
            priority: self.candidacy_priority(),
            primary_id: self.primary.clone(),
            seq_no: head.seq_no,
            height: head.height,
            hash: head.digest,
            replica_id: self.replica_id.clone(),
            chain: self.chain.clone(),
        };

        tracing::debug!(
            replica = %self.replica_id,
            chain = %self.chain,
            priority = vote.priority,
            attempt = self.view_attempt,
            "casting view-change vote"
        );

        self.view_votes.insert(self.replica_id.clone(), vote.clone());
        self.arm(self.config.view_change_timeout_ticks);

        let mut output =
            ReplicaOutput::with_messages(vec![msg_broadcast(MessagePayload::ViewChange(vote))]);
        let (next, install_output) = self.try_install();
        output.merge(install_output);
        (next, output)
    }

    /// Priority for the current attempt.
    ///
    /// A configured priority is used as-is. Otherwise it is derived from
    /// the chain, replica and attempt number, so retries rotate candidates.
    pub(crate) fn candidacy_priority(&self) -> i64 {
        if let Some(priority) = self.config.priority {
            return priority;
        }

        let mut hasher = Hasher::new();
        hasher.update(self.chain.as_str().as_bytes());
        hasher.update(&[0]);
        hasher.update(self.replica_id.as_str().as_bytes());
        hasher.update(&self.view_attempt.to_le_bytes());
        let hash = hasher.finalize();

        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&hash.as_bytes()[..8]);
        (u64::from_le_bytes(bytes) >> 1) as i64
    }

    // ========================================================================
    // ViewChange Handler
    // ========================================================================

    /// Handles a view-change vote from a peer.
    pub(crate) fn on_view_change(mut self, from: ReplicaId, vote: ViewChange) -> (Self, ReplicaOutput) {
        if vote.id != vote.replica_id {
            self.violation(&from, MessageType::ViewChange, "candidate is not the voter");
            return (self, ReplicaOutput::empty());
        }

        if !self.config.contains(&vote.primary_id) {
            self.violation(&from, MessageType::ViewChange, "names a primary outside the cluster");
            return (self, ReplicaOutput::empty());
        }

        self.view_votes.insert(from, vote);

        if self.state != ConsensusState::ViewChanging {
            if self.view_votes.len() < self.weak_quorum() {
                return (self, ReplicaOutput::empty());
            }
            tracing::info!(
                replica = %self.replica_id,
                chain = %self.chain,
                suspect = %self.primary,
                votes = self.view_votes.len(),
                "joining view change"
            );
            return self.start_view_change();
        }

        self.try_install()
    }

    /// The view change did not reach quorum in time; vote again.
    pub(crate) fn on_view_change_timeout(self) -> (Self, ReplicaOutput) {
        if self.state != ConsensusState::ViewChanging {
            return (self, ReplicaOutput::empty());
        }

        tracing::warn!(
            replica = %self.replica_id,
            chain = %self.chain,
            suspect = %self.primary,
            votes = self.view_votes.len(),
            "view change timed out, voting again"
        );
        self.cast_view_change_vote()
    }

    // ========================================================================
    // Installing the New Primary
    // ========================================================================

    fn try_install(self) -> (Self, ReplicaOutput) {
        if self.state != ConsensusState::ViewChanging || self.view_votes.len() < self.quorum() {
            return (self, ReplicaOutput::empty());
        }

        let suspects: HashSet<&ReplicaId> = self
            .view_votes
            .values()
            .map(|vote| &vote.primary_id)
            .chain([&self.primary])
            .collect();
        let by_priority = |a: &&ViewChange, b: &&ViewChange| -> Ordering {
            a.priority
                .cmp(&b.priority)
                .then_with(|| b.id.cmp(&a.id))
        };

        let winner = self
            .view_votes
            .values()
            .filter(|vote| !suspects.contains(&vote.id) && self.config.contains(&vote.id))
            .max_by(by_priority)
            .or_else(|| self.view_votes.values().max_by(by_priority))
            .map(|vote| vote.id.clone());

        let Some(winner) = winner else {
            return (self, ReplicaOutput::empty());
        };

        let target = self
            .view_votes
            .values()
            .map(|vote| vote.seq_no)
            .max()
            .unwrap_or(SeqNo::ZERO);

        self.install_primary(winner, target)
    }

    /// Switches to `winner` and catches up to `target` if behind.
    fn install_primary(mut self, winner: ReplicaId, target: SeqNo) -> (Self, ReplicaOutput) {
        tracing::info!(
            replica = %self.replica_id,
            chain = %self.chain,
            old_primary = %self.primary,
            new_primary = %winner,
            target = %target,
            "view change complete"
        );
        METRICS.increment_view_changes_completed();

        let old = std::mem::replace(&mut self.primary, winner);
        if old != self.primary {
            self.deposed.insert(old);
        }
        self.deposed.remove(&self.primary);
        self.elected = true;
        self.view_votes.clear();
        self.primary_hints.clear();
        self.tracker
            .abandon_from(&self.chain, self.log.durable_seq_no().next());
        self.disarm();

        self.state = self.resting_state();
        let mut output = self.forward_pending();

        let (next, sync_output) = self.start_sync(target);
        self = next;
        output.merge(sync_output);

        let (next, resume_output) = self.resume();
        output.merge(resume_output);
        (next, output)
    }

    // ========================================================================
    // Primary Hints
    // ========================================================================

    /// Records that `from` acts under `claimed` as primary.
    ///
    /// Once `f + 1` replicas do, at least one correct replica installed
    /// `claimed`, and this replica follows. A replica that elected its
    /// current primary itself waits for a quorum, which no competing group
    /// from the same view change can muster.
    pub(crate) fn note_primary_hint(
        mut self,
        from: ReplicaId,
        claimed: ReplicaId,
        kind: MessageType,
    ) -> (Self, ReplicaOutput) {
        if !self.config.contains(&claimed) {
            self.violation(&from, kind, "names a primary outside the cluster");
            return (self, ReplicaOutput::empty());
        }

        if self.deposed.contains(&claimed) {
            tracing::debug!(
                replica = %self.replica_id,
                chain = %self.chain,
                from = %from,
                claimed = %claimed,
                "peer still follows a replaced primary"
            );
            return (self, ReplicaOutput::empty());
        }

        let needed = if self.elected {
            self.quorum()
        } else {
            self.weak_quorum()
        };
        let voters = self.primary_hints.entry(claimed.clone()).or_default();
        voters.insert(from);
        if voters.len() < needed {
            return (self, ReplicaOutput::empty());
        }

        tracing::info!(
            replica = %self.replica_id,
            chain = %self.chain,
            old_primary = %self.primary,
            new_primary = %claimed,
            "following primary recognized by peers"
        );

        let old = std::mem::replace(&mut self.primary, claimed);
        self.deposed.insert(old);
        self.elected = false;
        self.primary_hints.clear();
        self.view_votes.clear();
        let primary = self.primary.clone();
        self.deferred = self.deferred.take().filter(|held| held.primary_id == primary);
        if let Some(round) = self.round.take() {
            self.tracker.abandon_from(&self.chain, round.seq_no);
        }
        if matches!(
            self.state,
            ConsensusState::ViewChanging | ConsensusState::PrePrepared | ConsensusState::Prepared
        ) {
            self.state = self.resting_state();
            self.disarm();
        }

        let mut output = self.forward_pending();
        let (next, resume_output) = self.resume();
        output.merge(resume_output);
        (next, output)
    }
}
