//! Catch-up from peers.
//!
//! A replica that falls behind asks every peer for the missing entries
//! with FetchCommitted, in bursts of `fetch_batch` sequence numbers. An
//! entry is accepted once `f + 1` distinct replicas vouch for the same
//! `(seq_no, digest)`, which guarantees at least one correct replica
//! committed it. The same rule applies to unsolicited Committed
//! announcements.

use lbft_types::{ReplicaId, SeqNo};

use crate::instrumentation::METRICS;
use crate::message::{Committed, FetchCommitted, MessagePayload, MessageType};
use crate::quorum::{Phase, VoteKey, VoteOutcome};

use super::{ChainReplica, ConsensusState, Effect, ReplicaOutput, msg_broadcast, msg_to};

/// Fetch rounds without progress before the primary is suspected.
const SYNC_STALL_LIMIT: u32 = 3;

impl ChainReplica {
    // ========================================================================
    // Committed Handler
    // ========================================================================

    /// Handles a committed entry vouched for by a peer.
    pub(crate) fn on_committed(mut self, from: ReplicaId, entry: Committed) -> (Self, ReplicaOutput) {
        if let Err(err) = self.admit(&entry.request) {
            self.violation(&from, MessageType::Committed, &err.to_string());
            return (self, ReplicaOutput::empty());
        }

        let seq_no = entry.seq_no;
        let digest = entry.digest();

        if seq_no.is_zero() {
            self.violation(&from, MessageType::Committed, "sequence number zero");
            return (self, ReplicaOutput::empty());
        }

        if seq_no <= self.log.last_seq_no() {
            if let Some(ours) = self.log.get(seq_no) {
                if ours.digest() != digest {
                    tracing::warn!(
                        replica = %self.replica_id,
                        chain = %self.chain,
                        from = %from,
                        seq = %seq_no,
                        "peer vouches for a different committed entry"
                    );
                    METRICS.increment_protocol_violations();
                }
            }
            return (self, ReplicaOutput::empty());
        }

        let window = self.config.fetch_batch.max(self.config.vote_window);
        if self.log.last_seq_no().distance_to(seq_no) > window {
            tracing::debug!(
                replica = %self.replica_id,
                chain = %self.chain,
                from = %from,
                seq = %seq_no,
                "committed entry beyond catch-up window"
            );
            return (self, ReplicaOutput::empty());
        }

        let key = VoteKey::new(self.chain.clone(), seq_no, Phase::Committed);
        let outcome = self.tracker.record(key, digest, from);
        if let VoteOutcome::Equivocation(evidence) = &outcome {
            tracing::warn!(
                replica = %self.replica_id,
                chain = %self.chain,
                from = %evidence.replica,
                seq = %seq_no,
                "replica vouches for two committed entries"
            );
            METRICS.increment_equivocations();
            return (self, ReplicaOutput::empty());
        }

        self.catchup
            .entry(seq_no)
            .or_default()
            .entry(digest)
            .or_insert(entry);

        let VoteOutcome::QuorumReached(certified) = outcome else {
            return (self, ReplicaOutput::empty());
        };

        let Some(entry) = self
            .catchup
            .remove(&seq_no)
            .and_then(|mut candidates| candidates.remove(&certified))
        else {
            return (self, ReplicaOutput::empty());
        };

        tracing::info!(
            replica = %self.replica_id,
            chain = %self.chain,
            seq = %seq_no,
            batch = %entry.request.name(),
            "adopting entry committed by peers"
        );

        let expected = self.log.last_seq_no().next();
        let mut output = self.append_committed(entry);
        if seq_no > expected {
            let (next, sync_output) = self.start_sync(seq_no);
            self = next;
            output.merge(sync_output);
        }
        (self, output)
    }

    // ========================================================================
    // FetchCommitted Handler
    // ========================================================================

    /// Serves a lagging peer's request for a committed entry.
    pub(crate) fn on_fetch_committed(
        self,
        from: ReplicaId,
        fetch: &FetchCommitted,
    ) -> (Self, ReplicaOutput) {
        if fetch.seq_no.is_zero() || fetch.seq_no > self.log.durable_seq_no() {
            return (self, ReplicaOutput::empty());
        }

        METRICS.increment_fetches_served();
        self.serve_committed(from, fetch.seq_no)
    }

    /// Sends the durable entry at `seq_no` to `to`, from cache or store.
    pub(crate) fn serve_committed(self, to: ReplicaId, seq_no: SeqNo) -> (Self, ReplicaOutput) {
        METRICS.increment_replays_served();

        let mut output = ReplicaOutput::empty();
        match self.log.fetch(seq_no) {
            Some(entry) => {
                let reply = Committed {
                    replica_id: self.replica_id.clone(),
                    ..entry.clone()
                };
                output
                    .messages
                    .push(msg_to(to, MessagePayload::Committed(reply)));
            }
            None => output.effects.push(Effect::ServeFetch { to, seq_no }),
        }
        (self, output)
    }

    // ========================================================================
    // Sync Lifecycle
    // ========================================================================

    /// Starts (or extends) catching up until `target` is durable.
    pub(crate) fn start_sync(mut self, target: SeqNo) -> (Self, ReplicaOutput) {
        if target <= self.log.durable_seq_no() {
            return (self, ReplicaOutput::empty());
        }

        self.sync_target = self.sync_target.max(target);
        if self.state == ConsensusState::ViewChanging {
            return (self, ReplicaOutput::empty());
        }

        if self.state != ConsensusState::Syncing {
            tracing::info!(
                replica = %self.replica_id,
                chain = %self.chain,
                from = %self.log.durable_seq_no(),
                target = %self.sync_target,
                "catching up"
            );
            if let Some(round) = self.round.take() {
                self.tracker.abandon_from(&self.chain, round.seq_no);
            }
            self.state = ConsensusState::Syncing;
            self.sync_progress = self.log.durable_seq_no();
            self.sync_stalls = 0;
            self.fetch_high = self.log.last_seq_no();
        }

        if self.fetch_high >= self.sync_target {
            return (self, ReplicaOutput::empty());
        }
        let output = self.fetch_burst();
        (self, output)
    }

    /// Requests the next window of missing entries from every peer.
    fn fetch_burst(&mut self) -> ReplicaOutput {
        let from = self.log.last_seq_no().next();
        let to = self
            .sync_target
            .min(self.log.last_seq_no().advance(self.config.fetch_batch));
        self.arm(self.config.sync_timeout_ticks);

        let mut output = ReplicaOutput::empty();
        let mut seq_no = from;
        while seq_no <= to {
            let fetch = FetchCommitted {
                seq_no,
                chain: self.chain.clone(),
                replica_id: self.replica_id.clone(),
            };
            output
                .messages
                .push(msg_broadcast(MessagePayload::FetchCommitted(fetch)));
            if seq_no == SeqNo::new(u32::MAX) {
                break;
            }
            seq_no = seq_no.next();
        }

        let issued = output.messages.len() as u64;
        if issued > 0 {
            METRICS.add_fetches_issued(issued);
            self.fetch_high = to;
        }
        tracing::debug!(
            replica = %self.replica_id,
            chain = %self.chain,
            from = %from,
            to = %to,
            "fetching committed entries"
        );
        output
    }

    /// Called once the log is settled while syncing: finish, or fetch more.
    pub(crate) fn continue_sync(mut self) -> (Self, ReplicaOutput) {
        if self.log.durable_seq_no() >= self.sync_target {
            tracing::info!(
                replica = %self.replica_id,
                chain = %self.chain,
                seq = %self.log.durable_seq_no(),
                "caught up"
            );
            self.state = ConsensusState::Idle;
            self.disarm();
            return (self, ReplicaOutput::empty());
        }

        if self.log.last_seq_no() >= self.fetch_high {
            let output = self.fetch_burst();
            return (self, output);
        }
        (self, ReplicaOutput::empty())
    }

    /// Fetch replies did not arrive in time.
    pub(crate) fn on_sync_timeout(mut self) -> (Self, ReplicaOutput) {
        if self.state != ConsensusState::Syncing {
            return (self, ReplicaOutput::empty());
        }

        if self.log.durable_seq_no() > self.sync_progress {
            self.sync_progress = self.log.durable_seq_no();
            self.sync_stalls = 0;
        } else {
            self.sync_stalls += 1;
        }

        if self.sync_stalls >= SYNC_STALL_LIMIT {
            tracing::warn!(
                replica = %self.replica_id,
                chain = %self.chain,
                seq = %self.log.durable_seq_no(),
                target = %self.sync_target,
                "catch-up stalled"
            );
            self.sync_target = self.log.durable_seq_no();
            self.state = self.resting_state();
            return self.start_view_change();
        }

        let output = self.fetch_burst();
        (self, output)
    }
}
