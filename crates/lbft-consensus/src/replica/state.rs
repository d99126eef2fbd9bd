//! Replica state structure.
//!
//! This module defines [`ChainReplica`], the consensus state of one chain on
//! one replica, and its event dispatch. Protocol handlers live in the
//! sibling modules.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use lbft_types::{AdmissionError, ChainId, Digest, ReplicaId, Request, SeqNo};

use crate::checkpoint::CommitLog;
use crate::config::ConsensusConfig;
use crate::instrumentation::METRICS;
use crate::message::{Committed, MessagePayload, MessageType, PrePrepare, ViewChange};
use crate::quorum::QuorumTracker;

use super::{
    ConsensusState, ReplicaEvent, ReplicaOutput, Submitted, TimeoutKind, msg_to,
};

/// The proposal a replica is currently voting on.
#[derive(Debug, Clone)]
pub(crate) struct Round {
    pub seq_no: SeqNo,
    pub request: Request,
    pub digest: Digest,
}

/// Point-in-time view of a chain instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainStatus {
    pub chain: ChainId,
    /// Highest durably committed sequence number.
    pub last_seq_no: SeqNo,
    pub primary: ReplicaId,
    pub state: ConsensusState,
    pub pending_requests: usize,
}

/// Consensus state of one chain on one replica.
#[derive(Debug)]
pub struct ChainReplica {
    // ========================================================================
    // Identity
    // ========================================================================
    pub(crate) chain: ChainId,
    pub(crate) replica_id: ReplicaId,
    pub(crate) config: ConsensusConfig,

    // ========================================================================
    // Round State
    // ========================================================================
    pub(crate) primary: ReplicaId,
    pub(crate) state: ConsensusState,
    pub(crate) round: Option<Round>,
    /// A proposal for a later slot, held until this replica catches up.
    pub(crate) deferred: Option<PrePrepare>,
    pub(crate) tracker: QuorumTracker,

    // ========================================================================
    // Commit Log
    // ========================================================================
    pub(crate) log: CommitLog,
    /// Set when an append failed; undurable entries are re-persisted on tick.
    pub(crate) persist_retry: bool,
    /// Committed announcements awaiting `f + 1` matching senders.
    pub(crate) catchup: BTreeMap<SeqNo, HashMap<Digest, Committed>>,
    pub(crate) sync_target: SeqNo,
    pub(crate) fetch_high: SeqNo,
    pub(crate) sync_progress: SeqNo,
    pub(crate) sync_stalls: u32,

    // ========================================================================
    // Requests
    // ========================================================================
    pub(crate) pending: VecDeque<(Digest, Request)>,
    pub(crate) pending_digests: HashSet<Digest>,

    // ========================================================================
    // View Change
    // ========================================================================
    pub(crate) view_votes: BTreeMap<ReplicaId, ViewChange>,
    pub(crate) view_attempt: u64,
    /// Replicas seen acting under a primary other than ours.
    pub(crate) primary_hints: HashMap<ReplicaId, BTreeSet<ReplicaId>>,
    /// Primaries replaced since this replica's last view change started.
    pub(crate) deposed: HashSet<ReplicaId>,
    /// The current primary won a view change this replica completed itself.
    pub(crate) elected: bool,

    // ========================================================================
    // Timers
    // ========================================================================
    pub(crate) now: u64,
    pub(crate) deadline: Option<u64>,
}

impl ChainReplica {
    /// Creates a fresh instance for `chain` with an empty commit log.
    pub fn new(chain: ChainId, config: ConsensusConfig) -> Self {
        Self::recover(chain, config, None)
    }

    /// Creates an instance whose durable log ends at `last`.
    pub fn recover(chain: ChainId, config: ConsensusConfig, last: Option<Committed>) -> Self {
        let tracker = QuorumTracker::new(config.quorum_size(), config.weak_quorum());
        let log = CommitLog::recovered(chain.clone(), config.log_cache_capacity, last);
        let sync_progress = log.durable_seq_no();

        Self {
            replica_id: config.replica_id.clone(),
            primary: config.initial_primary(),
            chain,
            state: ConsensusState::Idle,
            round: None,
            deferred: None,
            tracker,
            log,
            persist_retry: false,
            catchup: BTreeMap::new(),
            sync_target: SeqNo::ZERO,
            fetch_high: SeqNo::ZERO,
            sync_progress,
            sync_stalls: 0,
            pending: VecDeque::new(),
            pending_digests: HashSet::new(),
            view_votes: BTreeMap::new(),
            view_attempt: 0,
            primary_hints: HashMap::new(),
            deposed: HashSet::new(),
            elected: false,
            now: 0,
            deadline: None,
            config,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn chain(&self) -> &ChainId {
        &self.chain
    }

    pub fn replica_id(&self) -> &ReplicaId {
        &self.replica_id
    }

    pub fn primary(&self) -> &ReplicaId {
        &self.primary
    }

    pub fn is_primary(&self) -> bool {
        self.primary == self.replica_id
    }

    pub fn state(&self) -> ConsensusState {
        self.state
    }

    /// Highest durably committed sequence number.
    pub fn last_seq_no(&self) -> SeqNo {
        self.log.durable_seq_no()
    }

    pub fn commit_log(&self) -> &CommitLog {
        &self.log
    }

    pub fn quorum_tracker(&self) -> &QuorumTracker {
        &self.tracker
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Number of view-change votes this replica has cast.
    pub fn view_attempt(&self) -> u64 {
        self.view_attempt
    }

    pub fn status(&self) -> ChainStatus {
        ChainStatus {
            chain: self.chain.clone(),
            last_seq_no: self.last_seq_no(),
            primary: self.primary.clone(),
            state: self.state,
            pending_requests: self.pending.len(),
        }
    }

    pub(crate) fn quorum(&self) -> usize {
        self.config.quorum_size()
    }

    pub(crate) fn weak_quorum(&self) -> usize {
        self.config.weak_quorum()
    }

    // ========================================================================
    // Event Processing (Main Entry Point)
    // ========================================================================

    /// Processes an event and returns the new state and output.
    ///
    /// This method is pure: it takes ownership of `self`, processes the
    /// event, and returns a new state. The caller is responsible for
    /// sending the messages and executing the effects.
    pub fn process(self, event: ReplicaEvent) -> (Self, ReplicaOutput) {
        let (mut next, output) = match event {
            ReplicaEvent::Message { from, payload } => self.on_message(from, payload),
            ReplicaEvent::Submit(request) => self.on_submit(request),
            ReplicaEvent::Timeout(kind) => self.on_timeout(kind),
            ReplicaEvent::Tick => self.on_tick(),
            ReplicaEvent::Persisted { seq_no, result } => self.on_persisted(seq_no, result),
        };
        next.settle_timer();
        (next, output)
    }

    /// Handles an incoming message.
    fn on_message(self, from: ReplicaId, payload: MessagePayload) -> (Self, ReplicaOutput) {
        METRICS.increment_messages_received();

        if from == self.replica_id || !self.config.contains(&from) {
            tracing::debug!(
                replica = %self.replica_id,
                chain = %self.chain,
                from = %from,
                "ignoring message from outside the cluster"
            );
            return (self, ReplicaOutput::empty());
        }

        if let Some(claimed) = payload.replica_id() {
            if *claimed != from {
                self.violation(&from, payload.kind(), "payload replica id does not match sender");
                return (self, ReplicaOutput::empty());
            }
        }

        if let Some(chain) = payload.chain() {
            if *chain != self.chain {
                tracing::debug!(
                    replica = %self.replica_id,
                    chain = %self.chain,
                    msg_chain = %chain,
                    "ignoring message for another chain"
                );
                return (self, ReplicaOutput::empty());
            }
        }

        match payload {
            // Ordering
            MessagePayload::Request(request) => self.on_request(from, request),
            MessagePayload::PrePrepare(pre_prepare) => self.on_pre_prepare(from, pre_prepare),
            MessagePayload::Prepare(prepare) => self.on_prepare(from, prepare),
            MessagePayload::Commit(commit) => self.on_commit(from, commit),

            // Catch-up
            MessagePayload::Committed(committed) => self.on_committed(from, committed),
            MessagePayload::FetchCommitted(fetch) => self.on_fetch_committed(from, &fetch),

            // View change
            MessagePayload::ViewChange(vote) => self.on_view_change(from, vote),
        }
    }

    /// Handles a timeout event.
    pub(crate) fn on_timeout(self, kind: TimeoutKind) -> (Self, ReplicaOutput) {
        match kind {
            TimeoutKind::Round => self.on_round_timeout(),
            TimeoutKind::ViewChange => self.on_view_change_timeout(),
            TimeoutKind::Sync => self.on_sync_timeout(),
        }
    }

    /// Advances logical time, retries failed persists and fires the deadline.
    fn on_tick(mut self) -> (Self, ReplicaOutput) {
        self.now += 1;
        let mut output = ReplicaOutput::empty();

        if self.persist_retry {
            self.persist_retry = false;
            output.effects.extend(self.persist_effects());
        }

        let expired = self.deadline.is_some_and(|deadline| deadline <= self.now);
        if !expired {
            return (self, output);
        }

        self.deadline = None;
        let kind = match self.state {
            ConsensusState::Idle | ConsensusState::PrePrepared | ConsensusState::Prepared => {
                TimeoutKind::Round
            }
            ConsensusState::ViewChanging => TimeoutKind::ViewChange,
            ConsensusState::Syncing => TimeoutKind::Sync,
            ConsensusState::Committed => return (self, output),
        };

        let (next, timeout_output) = self.on_timeout(kind);
        output.merge(timeout_output);
        (next, output)
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Handles a locally submitted batch.
    fn on_submit(mut self, request: Request) -> (Self, ReplicaOutput) {
        if let Err(err) = self.admit(&request) {
            return (self, ReplicaOutput::with_submission(Err(err)));
        }

        let digest = request.digest();
        if self.is_known(&digest) {
            return (self, ReplicaOutput::with_submission(Ok(Submitted::Duplicate)));
        }

        if self.pending.len() >= self.config.max_pending_requests {
            let err = AdmissionError::QueueFull(self.chain.clone());
            return (self, ReplicaOutput::with_submission(Err(err)));
        }

        tracing::debug!(
            replica = %self.replica_id,
            chain = %self.chain,
            batch = %request.name(),
            "request submitted"
        );
        self.enqueue(digest, request.clone());

        if self.is_primary() {
            let (next, mut output) = self.resume();
            output.submission = Some(Ok(Submitted::Queued));
            return (next, output);
        }

        let forward = msg_to(self.primary.clone(), MessagePayload::Request(request));
        let mut output = ReplicaOutput::with_messages(vec![forward]);
        output.submission = Some(Ok(Submitted::Forwarded));
        (self, output)
    }

    /// Admission check for a batch on this chain.
    pub(crate) fn admit(&self, request: &Request) -> Result<(), AdmissionError> {
        request.check()?;
        if !request.involves(&self.chain) {
            return Err(AdmissionError::ChainNotInvolved(self.chain.clone()));
        }
        Ok(())
    }

    /// Returns true if the batch is pending, in flight, or recently committed.
    pub(crate) fn is_known(&self, digest: &Digest) -> bool {
        self.pending_digests.contains(digest)
            || self.log.seq_no_of(digest).is_some()
            || self.round.as_ref().is_some_and(|round| round.digest == *digest)
    }

    pub(crate) fn enqueue(&mut self, digest: Digest, request: Request) {
        if self.pending_digests.insert(digest) {
            self.pending.push_back((digest, request));
        }
    }

    pub(crate) fn dequeue(&mut self, digest: &Digest) {
        if self.pending_digests.remove(digest) {
            self.pending.retain(|(d, _)| d != digest);
        }
    }

    /// Sends every pending request to the current primary.
    pub(crate) fn forward_pending(&self) -> ReplicaOutput {
        if self.is_primary() {
            return ReplicaOutput::empty();
        }
        let messages = self
            .pending
            .iter()
            .map(|(_, request)| {
                msg_to(
                    self.primary.clone(),
                    MessagePayload::Request(request.clone()),
                )
            })
            .collect();
        ReplicaOutput::with_messages(messages)
    }

    // ========================================================================
    // Timers
    // ========================================================================

    pub(crate) fn arm(&mut self, ticks: u64) {
        self.deadline = Some(self.now + ticks.max(1));
    }

    pub(crate) fn disarm(&mut self) {
        self.deadline = None;
    }

    /// Keeps the round timer running while requests wait on an idle chain.
    fn settle_timer(&mut self) {
        match self.state {
            ConsensusState::Idle => {
                if self.pending.is_empty() {
                    self.disarm();
                } else if self.deadline.is_none() {
                    self.arm(self.config.round_timeout_ticks);
                }
            }
            ConsensusState::Committed => self.disarm(),
            _ => {}
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// State to return to once no round, sync or view change is in progress.
    pub(crate) fn resting_state(&self) -> ConsensusState {
        if self.log.is_settled() {
            ConsensusState::Idle
        } else {
            ConsensusState::Committed
        }
    }

    /// Logs and counts a message dropped for breaking protocol rules.
    pub(crate) fn violation(&self, from: &ReplicaId, kind: MessageType, reason: &str) {
        tracing::warn!(
            replica = %self.replica_id,
            chain = %self.chain,
            from = %from,
            msg = %kind,
            reason,
            "protocol violation"
        );
        METRICS.increment_protocol_violations();
    }
}
