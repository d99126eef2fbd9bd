//! Multi-chain engine that drives replica state machines.
//!
//! The engine owns one [`ChainReplica`] per served chain and is the only
//! place that touches I/O. For every event it:
//!
//! 1. Locks the chain, runs `process`, and releases the lock
//! 2. Sends the outgoing messages through the [`Transport`]
//! 3. Executes the effects against the [`CommitStore`] and feeds the
//!    results back as new events
//!
//! Chains never share a lock, so different chains make progress in
//! parallel while each chain sees its events strictly one at a time.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use lbft_types::{AdmissionError, ChainId, ReplicaId, Request, SeqNo};
use thiserror::Error;

use crate::codec::CodecError;
use crate::config::ConsensusConfig;
use crate::instrumentation::METRICS;
use crate::message::{Committed, Message, MessagePayload};
use crate::replica::{
    ChainReplica, ChainStatus, Effect, OutboundMessage, ReplicaEvent, Submitted,
};
use crate::store::{CommitStore, StoreError};
use crate::transport::Transport;

/// Errors surfaced to callers of the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("request rejected: {0}")]
    Admission(#[from] AdmissionError),

    #[error("chain {0} is not served by this replica")]
    UnknownChain(ChainId),

    #[error("undecodable message: {0}")]
    Decode(#[from] CodecError),

    #[error("message from {from} claims to be from {claimed}")]
    SenderMismatch { from: ReplicaId, claimed: ReplicaId },

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("chain {0} is unavailable after a failed transition")]
    ChainUnavailable(ChainId),
}

/// What a driven event produced, beyond messages and effects.
#[derive(Debug, Default)]
struct Outcome {
    committed: Vec<SeqNo>,
    submission: Option<Result<Submitted, AdmissionError>>,
}

/// A chain slot. `None` only while a transition panicked mid-flight.
type ChainSlot = Mutex<Option<ChainReplica>>;

/// Ordering engine for every chain this replica serves.
pub struct Engine<S, T>
where
    S: CommitStore,
    T: Transport,
{
    replica_id: ReplicaId,
    config: ConsensusConfig,
    chains: HashMap<ChainId, ChainSlot>,
    store: S,
    transport: T,
}

impl<S, T> Engine<S, T>
where
    S: CommitStore,
    T: Transport,
{
    /// Creates an engine, recovering every configured chain from `store`.
    pub fn new(config: ConsensusConfig, store: S, transport: T) -> Result<Self, EngineError> {
        let mut chains = HashMap::new();
        for chain in &config.chains {
            let replica = recover_chain(&store, &config, chain)?;
            chains.insert(chain.clone(), Mutex::new(Some(replica)));
        }

        tracing::info!(
            replica = %config.replica_id,
            cluster = config.cluster_size(),
            quorum = config.quorum_size(),
            chains = chains.len(),
            "engine started"
        );

        Ok(Self {
            replica_id: config.replica_id.clone(),
            config,
            chains,
            store,
            transport,
        })
    }

    pub fn replica_id(&self) -> &ReplicaId {
        &self.replica_id
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// How often the embedder should call [`Engine::tick`].
    pub fn tick_interval(&self) -> Duration {
        self.config.tick_interval()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Served chains, sorted.
    pub fn chains(&self) -> Vec<ChainId> {
        let sorted: BTreeSet<&ChainId> = self.chains.keys().collect();
        sorted.into_iter().cloned().collect()
    }

    /// Starts serving `chain`. Returns false if it was already served.
    pub fn open_chain(&mut self, chain: ChainId) -> Result<bool, EngineError> {
        if self.chains.contains_key(&chain) {
            return Ok(false);
        }

        let replica = recover_chain(&self.store, &self.config, &chain)?;
        tracing::info!(
            replica = %self.replica_id,
            chain = %chain,
            seq = %replica.last_seq_no(),
            "chain opened"
        );
        self.config.chains.push(chain.clone());
        self.chains.insert(chain, Mutex::new(Some(replica)));
        Ok(true)
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Submits a batch for ordering on `chain`.
    pub fn submit(&self, chain: &ChainId, request: Request) -> Result<Submitted, EngineError> {
        if !self.chains.contains_key(chain) {
            return Err(AdmissionError::UnknownChain(chain.clone()).into());
        }

        let outcome = self.drive(chain, ReplicaEvent::Submit(request))?;
        let verdict = outcome
            .submission
            .ok_or_else(|| EngineError::ChainUnavailable(chain.clone()))?;
        Ok(verdict?)
    }

    /// Transport delivery callback. `from` is the authenticated sender.
    pub fn on_message(&self, from: &ReplicaId, message: &Message) -> Result<(), EngineError> {
        let payload = match message.decode() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(
                    replica = %self.replica_id,
                    from = %from,
                    msg = %message.kind,
                    error = %err,
                    "dropping undecodable message"
                );
                METRICS.increment_decode_failures();
                return Err(err.into());
            }
        };

        if let Some(claimed) = payload.replica_id() {
            if claimed != from {
                tracing::warn!(
                    replica = %self.replica_id,
                    from = %from,
                    claimed = %claimed,
                    msg = %payload.kind(),
                    "sender does not match payload"
                );
                METRICS.increment_protocol_violations();
                return Err(EngineError::SenderMismatch {
                    from: from.clone(),
                    claimed: claimed.clone(),
                });
            }
        }

        let targets = self.route(&payload)?;
        for chain in targets {
            self.drive(
                &chain,
                ReplicaEvent::Message {
                    from: from.clone(),
                    payload: payload.clone(),
                },
            )?;
        }
        Ok(())
    }

    /// Advances logical time on every chain.
    ///
    /// Every chain is ticked even if one fails; the first error is returned.
    pub fn tick(&self) -> Result<(), EngineError> {
        let mut first_error = None;
        for chain in self.chains() {
            if let Err(err) = self.drive(&chain, ReplicaEvent::Tick) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Operational snapshot of one chain.
    pub fn fetch_status(&self, chain: &ChainId) -> Option<ChainStatus> {
        let slot = self.chains.get(chain)?;
        let guard = slot.lock().ok()?;
        guard.as_ref().map(ChainReplica::status)
    }

    /// Chains a payload is delivered to.
    fn route(&self, payload: &MessagePayload) -> Result<Vec<ChainId>, EngineError> {
        if let MessagePayload::Request(request) = payload {
            if request.is_empty_request() {
                return Ok(self.chains());
            }

            let named: BTreeSet<&ChainId> =
                request.from_chain().into_iter().chain(request.to_chain()).collect();
            let served: Vec<ChainId> = named
                .iter()
                .filter(|chain| self.chains.contains_key(**chain))
                .map(|chain| (*chain).clone())
                .collect();

            if served.is_empty() {
                let chain = named.into_iter().next().cloned().unwrap_or_default();
                return Err(EngineError::UnknownChain(chain));
            }
            return Ok(served);
        }

        match payload.chain() {
            Some(chain) if self.chains.contains_key(chain) => Ok(vec![chain.clone()]),
            Some(chain) => Err(EngineError::UnknownChain(chain.clone())),
            None => Err(EngineError::UnknownChain(ChainId::default())),
        }
    }

    // ========================================================================
    // Event Loop
    // ========================================================================

    /// Runs `event` and every storage result it leads to.
    fn drive(&self, chain: &ChainId, event: ReplicaEvent) -> Result<Outcome, EngineError> {
        let slot = self
            .chains
            .get(chain)
            .ok_or_else(|| EngineError::UnknownChain(chain.clone()))?;

        let mut outcome = Outcome::default();
        let mut events = VecDeque::from([event]);

        while let Some(event) = events.pop_front() {
            let output = {
                let mut guard = slot
                    .lock()
                    .map_err(|_| EngineError::ChainUnavailable(chain.clone()))?;
                let replica = guard
                    .take()
                    .ok_or_else(|| EngineError::ChainUnavailable(chain.clone()))?;
                let (next, output) = replica.process(event);
                *guard = Some(next);
                output
            };

            outcome.committed.extend(output.committed);
            if output.submission.is_some() {
                outcome.submission = output.submission;
            }

            self.send(output.messages);
            events.extend(self.execute(chain, output.effects));
        }

        if !outcome.committed.is_empty() {
            tracing::trace!(
                replica = %self.replica_id,
                chain = %chain,
                committed = outcome.committed.len(),
                "event settled"
            );
        }
        Ok(outcome)
    }

    /// Encodes and sends outbound messages.
    fn send(&self, messages: Vec<OutboundMessage>) {
        for outbound in messages {
            let kind = outbound.payload.kind();
            let message = match Message::encode(&outbound.payload) {
                Ok(message) => message,
                Err(err) => {
                    tracing::error!(
                        replica = %self.replica_id,
                        msg = %kind,
                        error = %err,
                        "failed to encode outbound message"
                    );
                    continue;
                }
            };

            METRICS.increment_messages_sent(kind);
            match outbound.to {
                Some(to) => self.transport.send_to(&to, message),
                None => self.transport.broadcast(message),
            }
        }
    }

    /// Executes effects and returns the events reporting their results.
    ///
    /// Appends must land in order, so once one fails the remaining appends
    /// of the batch are skipped; the replica re-issues them on a later tick.
    fn execute(&self, chain: &ChainId, effects: Vec<Effect>) -> Vec<ReplicaEvent> {
        let mut results = Vec::new();
        let mut append_failed = false;

        for effect in effects {
            match effect {
                Effect::Persist(entry) => {
                    if append_failed {
                        continue;
                    }
                    let result = self.store.append(chain, &entry);
                    if let Err(err) = &result {
                        tracing::error!(
                            replica = %self.replica_id,
                            chain = %chain,
                            seq = %entry.seq_no,
                            error = %err,
                            "append to commit store failed"
                        );
                        append_failed = true;
                    }
                    results.push(ReplicaEvent::Persisted {
                        seq_no: entry.seq_no,
                        result,
                    });
                }
                Effect::ServeFetch { to, seq_no } => self.serve_from_store(chain, to, seq_no),
            }
        }
        results
    }

    fn serve_from_store(&self, chain: &ChainId, to: ReplicaId, seq_no: SeqNo) {
        match self.store.read(chain, seq_no) {
            Ok(Some(entry)) => {
                let reply = Committed {
                    replica_id: self.replica_id.clone(),
                    ..entry
                };
                self.send(vec![OutboundMessage {
                    to: Some(to),
                    payload: MessagePayload::Committed(reply),
                }]);
            }
            Ok(None) => {
                tracing::debug!(
                    replica = %self.replica_id,
                    chain = %chain,
                    seq = %seq_no,
                    "requested entry not in store"
                );
            }
            Err(err) => {
                tracing::error!(
                    replica = %self.replica_id,
                    chain = %chain,
                    seq = %seq_no,
                    error = %err,
                    "read from commit store failed"
                );
            }
        }
    }
}

/// Rebuilds a chain's replica from the durable tail in `store`.
fn recover_chain<S: CommitStore>(
    store: &S,
    config: &ConsensusConfig,
    chain: &ChainId,
) -> Result<ChainReplica, EngineError> {
    let last = store.last_seq_no(chain)?;
    let tail = if last.is_zero() {
        None
    } else {
        store.read(chain, last)?
    };
    Ok(ChainReplica::recover(chain.clone(), config.clone(), tail))
}
