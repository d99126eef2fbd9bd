//! Normal operation protocol handlers.
//!
//! This module implements the three-phase ordering path:
//! - Request (any → primary)
//! - PrePrepare (primary → all)
//! - Prepare / Commit (all → all)
//! - Persistence of decided entries and their acknowledgement

use lbft_types::{Digest, ReplicaId, Request, SeqNo};

use crate::checkpoint::{AppendOutcome, CommitLogError};
use crate::instrumentation::METRICS;
use crate::message::{
    Commit, Committed, MessagePayload, MessageType, PrePrepare, Prepare,
};
use crate::quorum::{Phase, VoteKey, VoteOutcome};
use crate::store::StoreError;

use super::{ChainReplica, ConsensusState, Effect, ReplicaOutput, Round, msg_broadcast};

/// The fields Prepare and Commit share.
#[derive(Debug, Clone)]
pub(crate) struct Ballot {
    pub primary_id: ReplicaId,
    pub seq_no: SeqNo,
    pub digest: Digest,
    pub quorum: u32,
}

impl From<Prepare> for Ballot {
    fn from(prepare: Prepare) -> Self {
        Self {
            primary_id: prepare.primary_id,
            seq_no: prepare.seq_no,
            digest: prepare.digest,
            quorum: prepare.quorum,
        }
    }
}

impl From<Commit> for Ballot {
    fn from(commit: Commit) -> Self {
        Self {
            primary_id: commit.primary_id,
            seq_no: commit.seq_no,
            digest: commit.digest,
            quorum: commit.quorum,
        }
    }
}

impl ChainReplica {
    // ========================================================================
    // Request Handler
    // ========================================================================

    /// Handles a batch forwarded by a peer.
    pub(crate) fn on_request(mut self, from: ReplicaId, request: Request) -> (Self, ReplicaOutput) {
        if let Err(err) = self.admit(&request) {
            self.violation(&from, MessageType::Request, &err.to_string());
            return (self, ReplicaOutput::empty());
        }

        let digest = request.digest();
        if self.is_known(&digest) {
            return (self, ReplicaOutput::empty());
        }

        if self.pending.len() >= self.config.max_pending_requests {
            tracing::debug!(
                replica = %self.replica_id,
                chain = %self.chain,
                from = %from,
                "pending queue full, dropping forwarded request"
            );
            return (self, ReplicaOutput::empty());
        }

        self.enqueue(digest, request);
        self.resume()
    }

    // ========================================================================
    // PrePrepare Handler
    // ========================================================================

    /// Handles a proposal from the primary.
    pub(crate) fn on_pre_prepare(
        mut self,
        from: ReplicaId,
        pre_prepare: PrePrepare,
    ) -> (Self, ReplicaOutput) {
        if pre_prepare.primary_id != from {
            self.violation(&from, MessageType::PrePrepare, "proposal not sent by its primary");
            return (self, ReplicaOutput::empty());
        }

        if (pre_prepare.quorum as usize) < self.quorum() {
            self.violation(&from, MessageType::PrePrepare, "quorum below local quorum");
            return (self, ReplicaOutput::empty());
        }

        if let Err(err) = self.admit(&pre_prepare.request) {
            self.violation(&from, MessageType::PrePrepare, &err.to_string());
            return (self, ReplicaOutput::empty());
        }

        if self.state == ConsensusState::ViewChanging {
            tracing::debug!(
                replica = %self.replica_id,
                chain = %self.chain,
                seq = %pre_prepare.seq_no,
                "holding proposal during view change"
            );
            if pre_prepare.primary_id == self.primary {
                return (self, ReplicaOutput::empty());
            }
            // Replayed once its sender is recognized as primary.
            let claimed = pre_prepare.primary_id.clone();
            self.deferred = Some(pre_prepare);
            return self.note_primary_hint(from, claimed, MessageType::PrePrepare);
        }

        if pre_prepare.primary_id != self.primary {
            return self.note_primary_hint(from, pre_prepare.primary_id, MessageType::PrePrepare);
        }

        let seq_no = pre_prepare.seq_no;
        if seq_no <= self.log.durable_seq_no() {
            return self.serve_committed(from, seq_no);
        }

        let expected = self.log.last_seq_no().next();
        if seq_no < expected {
            // Decided here, not yet durable.
            return (self, ReplicaOutput::empty());
        }

        if seq_no > expected {
            if self
                .deferred
                .as_ref()
                .is_none_or(|held| held.seq_no <= seq_no)
            {
                self.deferred = Some(pre_prepare);
            }

            // The primary moved on while our round at `expected` still
            // collects votes; finish it before taking the next proposal.
            let finishing = seq_no == expected.next()
                && self.round.as_ref().is_some_and(|round| round.seq_no == expected);
            if finishing {
                return (self, ReplicaOutput::empty());
            }

            tracing::debug!(
                replica = %self.replica_id,
                chain = %self.chain,
                expected = %expected,
                got = %seq_no,
                "proposal ahead of local log, catching up"
            );
            return self.start_sync(SeqNo::new(seq_no.as_u32() - 1));
        }

        match self.state {
            ConsensusState::Idle => {}
            ConsensusState::PrePrepared | ConsensusState::Prepared => {
                if let Some(round) = &self.round {
                    if round.seq_no == seq_no && round.digest != pre_prepare.request.digest() {
                        tracing::warn!(
                            replica = %self.replica_id,
                            chain = %self.chain,
                            primary = %from,
                            seq = %seq_no,
                            "primary proposed two batches for one sequence number"
                        );
                        METRICS.increment_equivocations();
                    }
                }
                return (self, ReplicaOutput::empty());
            }
            ConsensusState::Committed | ConsensusState::Syncing => {
                self.deferred = Some(pre_prepare);
                return (self, ReplicaOutput::empty());
            }
            ConsensusState::ViewChanging => return (self, ReplicaOutput::empty()),
        }

        tracing::debug!(
            replica = %self.replica_id,
            chain = %self.chain,
            seq = %seq_no,
            batch = %pre_prepare.request.name(),
            "accepted proposal"
        );
        self.enter_round(seq_no, pre_prepare.request)
    }

    // ========================================================================
    // Prepare / Commit Handlers
    // ========================================================================

    pub(crate) fn on_prepare(self, from: ReplicaId, prepare: Prepare) -> (Self, ReplicaOutput) {
        self.on_ballot(from, Phase::Prepare, Ballot::from(prepare))
    }

    pub(crate) fn on_commit(self, from: ReplicaId, commit: Commit) -> (Self, ReplicaOutput) {
        self.on_ballot(from, Phase::Commit, Ballot::from(commit))
    }

    fn on_ballot(mut self, from: ReplicaId, phase: Phase, ballot: Ballot) -> (Self, ReplicaOutput) {
        let kind = match phase {
            Phase::Prepare => MessageType::Prepare,
            _ => MessageType::Commit,
        };

        if (ballot.quorum as usize) < self.quorum() {
            self.violation(&from, kind, "quorum below local quorum");
            return (self, ReplicaOutput::empty());
        }

        if ballot.primary_id != self.primary {
            return self.note_primary_hint(from, ballot.primary_id, kind);
        }

        if self.state == ConsensusState::ViewChanging {
            return (self, ReplicaOutput::empty());
        }

        let seq_no = ballot.seq_no;
        if seq_no <= self.log.durable_seq_no() {
            return self.serve_committed(from, seq_no);
        }

        let expected = self.log.last_seq_no().next();
        if seq_no < expected {
            return (self, ReplicaOutput::empty());
        }

        if expected.distance_to(seq_no) > self.config.vote_window {
            tracing::debug!(
                replica = %self.replica_id,
                chain = %self.chain,
                from = %from,
                seq = %seq_no,
                "vote beyond window dropped"
            );
            return (self, ReplicaOutput::empty());
        }

        let key = VoteKey::new(self.chain.clone(), seq_no, phase);
        match self.tracker.record(key, ballot.digest, from) {
            VoteOutcome::Equivocation(evidence) => {
                tracing::warn!(
                    replica = %self.replica_id,
                    chain = %self.chain,
                    from = %evidence.replica,
                    seq = %seq_no,
                    first = ?evidence.first,
                    second = ?evidence.second,
                    "equivocating vote"
                );
                METRICS.increment_equivocations();
                (self, ReplicaOutput::empty())
            }
            VoteOutcome::Duplicate => (self, ReplicaOutput::empty()),
            VoteOutcome::Recorded { .. } | VoteOutcome::QuorumReached(_) => self.advance(),
        }
    }

    // ========================================================================
    // Round Progression
    // ========================================================================

    /// Starts voting on `request` at `seq_no`.
    pub(crate) fn enter_round(mut self, seq_no: SeqNo, request: Request) -> (Self, ReplicaOutput) {
        let digest = request.digest();
        self.round = Some(Round {
            seq_no,
            request,
            digest,
        });
        self.state = ConsensusState::PrePrepared;
        self.arm(self.config.round_timeout_ticks);

        let prepare = Prepare {
            primary_id: self.primary.clone(),
            seq_no,
            digest,
            quorum: self.quorum() as u32,
            chain: self.chain.clone(),
            replica_id: self.replica_id.clone(),
        };
        self.tracker.record(
            VoteKey::new(self.chain.clone(), seq_no, Phase::Prepare),
            digest,
            self.replica_id.clone(),
        );

        let mut output =
            ReplicaOutput::with_messages(vec![msg_broadcast(MessagePayload::Prepare(prepare))]);
        let (next, advance_output) = self.advance();
        output.merge(advance_output);
        (next, output)
    }

    /// Moves the round forward as far as the recorded votes allow.
    pub(crate) fn advance(mut self) -> (Self, ReplicaOutput) {
        let mut output = ReplicaOutput::empty();

        loop {
            let Some(round) = self.round.as_ref() else {
                break;
            };
            let (seq_no, digest) = (round.seq_no, round.digest);

            match self.state {
                ConsensusState::PrePrepared => {
                    let key = VoteKey::new(self.chain.clone(), seq_no, Phase::Prepare);
                    if self.tracker.certified(&key) != Some(digest) {
                        break;
                    }

                    tracing::debug!(
                        replica = %self.replica_id,
                        chain = %self.chain,
                        seq = %seq_no,
                        "prepared"
                    );
                    self.state = ConsensusState::Prepared;
                    self.arm(self.config.round_timeout_ticks);

                    let commit = Commit {
                        primary_id: self.primary.clone(),
                        seq_no,
                        digest,
                        quorum: self.quorum() as u32,
                        chain: self.chain.clone(),
                        replica_id: self.replica_id.clone(),
                    };
                    output
                        .messages
                        .push(msg_broadcast(MessagePayload::Commit(commit)));
                    self.tracker.record(
                        VoteKey::new(self.chain.clone(), seq_no, Phase::Commit),
                        digest,
                        self.replica_id.clone(),
                    );
                }
                ConsensusState::Prepared => {
                    let key = VoteKey::new(self.chain.clone(), seq_no, Phase::Commit);
                    if self.tracker.certified(&key) != Some(digest) {
                        break;
                    }
                    output.merge(self.decide());
                    break;
                }
                _ => break,
            }
        }

        (self, output)
    }

    /// Records the current round as committed and requests persistence.
    fn decide(&mut self) -> ReplicaOutput {
        let Some(round) = self.round.as_ref() else {
            return ReplicaOutput::empty();
        };

        tracing::info!(
            replica = %self.replica_id,
            chain = %self.chain,
            seq = %round.seq_no,
            batch = %round.request.name(),
            "committed"
        );

        let entry = Committed {
            seq_no: round.seq_no,
            request: round.request.clone(),
            chain: self.chain.clone(),
            replica_id: self.replica_id.clone(),
        };
        self.state = ConsensusState::Committed;
        self.disarm();
        self.append_committed(entry)
    }

    /// Appends a decided entry to the commit log and emits persist effects.
    pub(crate) fn append_committed(&mut self, entry: Committed) -> ReplicaOutput {
        let seq_no = entry.seq_no;
        let mut output = ReplicaOutput::empty();

        match self.log.append(entry) {
            Ok(AppendOutcome::Appended(entries)) => {
                output
                    .effects
                    .extend(entries.into_iter().map(Effect::Persist));
            }
            Ok(AppendOutcome::Duplicate) => {}
            Err(CommitLogError::Gap { expected, got }) => {
                tracing::debug!(
                    replica = %self.replica_id,
                    chain = %self.chain,
                    expected = %expected,
                    got = %got,
                    "committed entry buffered behind a gap"
                );
            }
            Err(err) => {
                tracing::error!(
                    replica = %self.replica_id,
                    chain = %self.chain,
                    seq = %seq_no,
                    error = %err,
                    "commit log rejected entry"
                );
                METRICS.increment_protocol_violations();
            }
        }

        // A round overtaken by entries decided elsewhere is finished.
        let overtaken = self
            .round
            .as_ref()
            .is_some_and(|round| round.seq_no <= self.log.last_seq_no());
        if overtaken && self.state.is_voting() {
            self.state = ConsensusState::Committed;
            self.disarm();
        }
        if self.state == ConsensusState::Idle && !self.log.is_settled() {
            self.state = ConsensusState::Committed;
        }

        output
    }

    /// Persist effects for every entry not yet acknowledged by the store.
    pub(crate) fn persist_effects(&self) -> Vec<Effect> {
        self.log.undurable().cloned().map(Effect::Persist).collect()
    }

    // ========================================================================
    // Persistence Acknowledgement
    // ========================================================================

    /// Handles the store's answer to a persist effect.
    pub(crate) fn on_persisted(
        mut self,
        seq_no: SeqNo,
        result: Result<(), StoreError>,
    ) -> (Self, ReplicaOutput) {
        if let Err(err) = result {
            tracing::warn!(
                replica = %self.replica_id,
                chain = %self.chain,
                seq = %seq_no,
                error = %err,
                "persist failed, will retry"
            );
            METRICS.increment_persist_failures();
            self.persist_retry = true;
            return (self, ReplicaOutput::empty());
        }

        if !self.log.mark_durable(seq_no) {
            return (self, ReplicaOutput::empty());
        }

        METRICS.increment_commits();
        let mut output = ReplicaOutput::empty();
        output.committed.push(seq_no);

        // Votes against a primary that is still deciding are stale.
        if self.state != ConsensusState::ViewChanging {
            self.view_votes.clear();
        }

        if let Some(entry) = self.log.get(seq_no).cloned() {
            self.dequeue(&entry.digest());
            let announcement = Committed {
                replica_id: self.replica_id.clone(),
                ..entry
            };
            output
                .messages
                .push(msg_broadcast(MessagePayload::Committed(announcement)));
        }

        self.tracker.retire_through(&self.chain, seq_no);
        self.catchup = self.catchup.split_off(&seq_no.next());
        if self.round.as_ref().is_some_and(|round| round.seq_no <= seq_no) {
            self.round = None;
        }

        if self.log.is_settled() {
            match self.state {
                ConsensusState::Committed => self.state = ConsensusState::Idle,
                ConsensusState::Syncing => {
                    let (next, sync_output) = self.continue_sync();
                    self = next;
                    output.merge(sync_output);
                }
                _ => {}
            }
        }

        let (next, resume_output) = self.resume();
        output.merge(resume_output);
        (next, output)
    }

    // ========================================================================
    // Proposal (Primary)
    // ========================================================================

    /// Picks up work once the chain is idle: a held proposal, or (on the
    /// primary) the next pending request.
    pub(crate) fn resume(mut self) -> (Self, ReplicaOutput) {
        if self.state != ConsensusState::Idle {
            return (self, ReplicaOutput::empty());
        }

        if let Some(held) = self.deferred.take() {
            let expected = self.log.last_seq_no().next();
            if held.seq_no == expected && held.primary_id == self.primary {
                let from = held.replica_id.clone();
                return self.on_pre_prepare(from, held);
            }
            if held.seq_no > expected {
                self.deferred = Some(held);
            }
        }

        self.propose()
    }

    /// Proposes the oldest pending request (primary only).
    fn propose(self) -> (Self, ReplicaOutput) {
        if !self.is_primary() || self.state != ConsensusState::Idle || !self.log.is_settled() {
            return (self, ReplicaOutput::empty());
        }

        let Some((_, request)) = self.pending.front().cloned() else {
            return (self, ReplicaOutput::empty());
        };

        let seq_no = self.log.last_seq_no().next();
        tracing::info!(
            replica = %self.replica_id,
            chain = %self.chain,
            seq = %seq_no,
            batch = %request.name(),
            "proposing"
        );

        let pre_prepare = PrePrepare {
            primary_id: self.replica_id.clone(),
            seq_no,
            quorum: self.quorum() as u32,
            request: request.clone(),
            chain: self.chain.clone(),
            replica_id: self.replica_id.clone(),
        };

        let mut output = ReplicaOutput::with_messages(vec![msg_broadcast(
            MessagePayload::PrePrepare(pre_prepare),
        )]);
        let (next, round_output) = self.enter_round(seq_no, request);
        output.merge(round_output);
        (next, output)
    }

    // ========================================================================
    // Round Timeout
    // ========================================================================

    /// The round (or a waiting request) made no progress in time.
    pub(crate) fn on_round_timeout(self) -> (Self, ReplicaOutput) {
        match self.state {
            ConsensusState::Idle | ConsensusState::PrePrepared | ConsensusState::Prepared => {
                tracing::warn!(
                    replica = %self.replica_id,
                    chain = %self.chain,
                    primary = %self.primary,
                    state = %self.state,
                    "round timed out"
                );
                self.start_view_change()
            }
            _ => (self, ReplicaOutput::empty()),
        }
    }
}
