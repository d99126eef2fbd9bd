//! Scenario tests for the replica state machine.
//!
//! A small in-process cluster routes messages between pure
//! [`ChainReplica`]s and executes their effects against per-replica maps,
//! so whole protocol runs stay deterministic and need no engine.

use std::collections::{BTreeMap, HashSet, VecDeque};

use lbft_types::{AdmissionError, ChainId, Digest, ReplicaId, Request, SeqNo, Transaction};

use crate::config::ConsensusConfig;
use crate::message::{Committed, MessagePayload, MessageType, PrePrepare, Prepare, ViewChange};
use crate::replica::{
    ChainReplica, ConsensusState, Effect, OutboundMessage, ReplicaEvent, ReplicaOutput, Submitted,
};
use crate::store::StoreError;

// ============================================================================
// Helper Functions
// ============================================================================

const CHAIN: &str = "X";
const ROUND_TIMEOUT: u64 = 5;
const VIEW_CHANGE_TIMEOUT: u64 = 10;
const SYNC_TIMEOUT: u64 = 3;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn id(name: &str) -> ReplicaId {
    ReplicaId::new(name)
}

fn request(batch: i64) -> Request {
    Request::new(
        batch,
        0,
        batch as u32,
        vec![Transaction::new(CHAIN, "Y", batch as u64, vec![7u8; 4])],
    )
}

fn prepare(from: &str, primary: &str, seq: u32, digest: Digest) -> MessagePayload {
    MessagePayload::Prepare(Prepare {
        primary_id: id(primary),
        seq_no: SeqNo::new(seq),
        digest,
        quorum: 3,
        chain: ChainId::new(CHAIN),
        replica_id: id(from),
    })
}

fn vote(from: &str, priority: i64, suspect: &str) -> MessagePayload {
    MessagePayload::ViewChange(ViewChange {
        id: id(from),
        priority,
        primary_id: id(suspect),
        seq_no: SeqNo::ZERO,
        height: 0,
        hash: Digest::ZERO,
        replica_id: id(from),
        chain: ChainId::new(CHAIN),
    })
}

struct Envelope {
    from: ReplicaId,
    to: ReplicaId,
    payload: MessagePayload,
}

struct Node {
    replica: Option<ChainReplica>,
    stored: BTreeMap<SeqNo, Committed>,
    fail_appends: usize,
    last_submission: Option<Result<Submitted, AdmissionError>>,
}

/// Deterministic cluster of replicas ordering one chain.
struct Cluster {
    order: Vec<ReplicaId>,
    nodes: BTreeMap<ReplicaId, Node>,
    network: VecDeque<Envelope>,
    down: HashSet<ReplicaId>,
    /// Links that drop one message kind.
    blocked: HashSet<(ReplicaId, ReplicaId, MessageType)>,
}

impl Cluster {
    fn new(names: &[&str]) -> Self {
        Self::with(names, |config| config)
    }

    fn with(names: &[&str], configure: impl Fn(ConsensusConfig) -> ConsensusConfig) -> Self {
        init_tracing();
        let order: Vec<ReplicaId> = names.iter().map(|name| id(name)).collect();
        let base = ConsensusConfig::new(names[0], order.clone(), [ChainId::new(CHAIN)])
            .with_timeouts(ROUND_TIMEOUT, VIEW_CHANGE_TIMEOUT, SYNC_TIMEOUT);

        let nodes = order
            .iter()
            .map(|replica| {
                let config = configure(base.for_replica(replica.clone()));
                let node = Node {
                    replica: Some(ChainReplica::new(ChainId::new(CHAIN), config)),
                    stored: BTreeMap::new(),
                    fail_appends: 0,
                    last_submission: None,
                };
                (replica.clone(), node)
            })
            .collect();

        Self {
            order,
            nodes,
            network: VecDeque::new(),
            down: HashSet::new(),
            blocked: HashSet::new(),
        }
    }

    fn replica(&self, name: &str) -> &ChainReplica {
        self.nodes[&id(name)].replica.as_ref().unwrap()
    }

    fn crash(&mut self, name: &str) {
        self.down.insert(id(name));
    }

    fn restart(&mut self, name: &str) {
        self.down.remove(&id(name));
    }

    fn block(&mut self, from: &str, to: &str, kind: MessageType) {
        self.blocked.insert((id(from), id(to), kind));
    }

    fn heal(&mut self) {
        self.blocked.clear();
    }

    fn fail_next_appends(&mut self, name: &str, count: usize) {
        self.nodes.get_mut(&id(name)).unwrap().fail_appends = count;
    }

    /// Processes one event without routing its output.
    fn step(&mut self, to: &str, event: ReplicaEvent) -> ReplicaOutput {
        let node = self.nodes.get_mut(&id(to)).unwrap();
        let (next, output) = node.replica.take().unwrap().process(event);
        node.replica = Some(next);
        output
    }

    /// Processes `event` at `to`, executing effects and queueing messages.
    fn deliver(&mut self, to: &ReplicaId, event: ReplicaEvent) {
        let mut events = VecDeque::from([event]);
        while let Some(event) = events.pop_front() {
            let node = self.nodes.get_mut(to).unwrap();
            let (next, output) = node.replica.take().unwrap().process(event);
            node.replica = Some(next);
            if output.submission.is_some() {
                node.last_submission = output.submission;
            }

            let mut outbound = output.messages;
            for effect in output.effects {
                match effect {
                    Effect::Persist(entry) => {
                        let seq_no = entry.seq_no;
                        let result = if node.fail_appends > 0 {
                            node.fail_appends -= 1;
                            Err(StoreError::Unavailable("injected".into()))
                        } else {
                            node.stored.insert(seq_no, entry);
                            Ok(())
                        };
                        events.push_back(ReplicaEvent::Persisted { seq_no, result });
                    }
                    Effect::ServeFetch { to: peer, seq_no } => {
                        if let Some(entry) = node.stored.get(&seq_no) {
                            outbound.push(OutboundMessage {
                                to: Some(peer),
                                payload: MessagePayload::Committed(Committed {
                                    replica_id: to.clone(),
                                    ..entry.clone()
                                }),
                            });
                        }
                    }
                }
            }
            self.post(to, outbound);
        }
    }

    fn post(&mut self, from: &ReplicaId, messages: Vec<OutboundMessage>) {
        for message in messages {
            let recipients: Vec<ReplicaId> = match message.to {
                Some(to) => vec![to],
                None => self.order.iter().filter(|r| *r != from).cloned().collect(),
            };
            for to in recipients {
                self.network.push_back(Envelope {
                    from: from.clone(),
                    to,
                    payload: message.payload.clone(),
                });
            }
        }
    }

    /// Delivers queued messages until the network is quiet.
    fn run(&mut self) {
        let mut steps = 0;
        while let Some(envelope) = self.network.pop_front() {
            steps += 1;
            assert!(steps < 100_000, "cluster did not quiesce");
            if self.down.contains(&envelope.from) || self.down.contains(&envelope.to) {
                continue;
            }
            let link = (envelope.from.clone(), envelope.to.clone(), envelope.payload.kind());
            if self.blocked.contains(&link) {
                continue;
            }
            self.deliver(
                &envelope.to,
                ReplicaEvent::Message {
                    from: envelope.from,
                    payload: envelope.payload,
                },
            );
        }
    }

    fn submit(&mut self, name: &str, request: Request) -> Result<Submitted, AdmissionError> {
        let replica = id(name);
        self.deliver(&replica, ReplicaEvent::Submit(request));
        self.nodes
            .get_mut(&replica)
            .unwrap()
            .last_submission
            .take()
            .unwrap()
    }

    /// Ticks every live replica `ticks` times, settling the network after
    /// each replica's tick.
    fn tick_all(&mut self, ticks: u64) {
        for _ in 0..ticks {
            for replica in self.order.clone() {
                if self.down.contains(&replica) {
                    continue;
                }
                self.deliver(&replica, ReplicaEvent::Tick);
                self.run();
            }
        }
    }

    fn tick(&mut self, name: &str) {
        self.deliver(&id(name), ReplicaEvent::Tick);
        self.run();
    }

    fn last_seq_no(&self, name: &str) -> u32 {
        self.replica(name).last_seq_no().as_u32()
    }
}

// ============================================================================
// Normal Operation
// ============================================================================

#[test]
fn four_replicas_commit_one_batch() {
    let mut cluster = Cluster::new(&["p", "a", "b", "c"]);

    assert_eq!(cluster.submit("p", request(1)), Ok(Submitted::Queued));
    cluster.run();

    for name in ["p", "a", "b", "c"] {
        assert_eq!(cluster.last_seq_no(name), 1, "replica {name}");
        assert_eq!(cluster.replica(name).state(), ConsensusState::Idle);
        assert_eq!(cluster.nodes[&id(name)].stored.len(), 1);
    }
    assert_eq!(cluster.replica("p").pending_requests(), 0);
}

#[test]
fn backups_forward_to_the_primary() {
    let mut cluster = Cluster::new(&["p", "a", "b", "c"]);

    assert_eq!(cluster.submit("b", request(1)), Ok(Submitted::Forwarded));
    assert_eq!(cluster.replica("b").pending_requests(), 1);
    cluster.run();

    for name in ["p", "a", "b", "c"] {
        assert_eq!(cluster.last_seq_no(name), 1, "replica {name}");
    }
    assert_eq!(cluster.replica("b").pending_requests(), 0);
}

#[test]
fn batches_commit_in_submission_order() {
    let mut cluster = Cluster::new(&["p", "a", "b", "c"]);

    for batch in 1..=5 {
        cluster.submit("p", request(batch)).unwrap();
    }
    cluster.run();

    for name in ["p", "a", "b", "c"] {
        assert_eq!(cluster.last_seq_no(name), 5, "replica {name}");
        let stored: Vec<i64> = cluster.nodes[&id(name)]
            .stored
            .values()
            .map(|entry| entry.request.id)
            .collect();
        assert_eq!(stored, vec![1, 2, 3, 4, 5]);
    }
}

#[test]
fn single_replica_cluster_commits_alone() {
    let mut cluster = Cluster::new(&["solo"]);

    assert_eq!(cluster.submit("solo", request(1)), Ok(Submitted::Queued));
    cluster.run();

    assert_eq!(cluster.last_seq_no("solo"), 1);
    assert_eq!(cluster.replica("solo").state(), ConsensusState::Idle);
}

#[test]
fn mixed_destination_batch_is_rejected() {
    let mut cluster = Cluster::new(&["p", "a", "b", "c"]);
    let mixed = Request::new(
        2,
        0,
        0,
        vec![
            Transaction::new("X", "Y", 0, vec![]),
            Transaction::new("X", "Z", 1, vec![]),
        ],
    );

    assert_eq!(
        cluster.submit("p", mixed),
        Err(AdmissionError::MixedDestinationChains(2))
    );
    cluster.run();
    assert_eq!(cluster.last_seq_no("p"), 0);
    assert_eq!(cluster.replica("p").pending_requests(), 0);
}

#[test]
fn resubmitting_a_committed_batch_is_a_duplicate() {
    let mut cluster = Cluster::new(&["p", "a", "b", "c"]);
    cluster.submit("p", request(1)).unwrap();
    cluster.run();

    assert_eq!(cluster.submit("p", request(1)), Ok(Submitted::Duplicate));
    assert_eq!(cluster.submit("a", request(1)), Ok(Submitted::Duplicate));
}

#[test]
fn replayed_proposal_is_answered_without_state_change() {
    let mut cluster = Cluster::new(&["p", "a", "b", "c"]);
    cluster.submit("p", request(1)).unwrap();
    cluster.run();

    let replay = MessagePayload::PrePrepare(PrePrepare {
        primary_id: id("p"),
        seq_no: SeqNo::new(1),
        quorum: 3,
        request: request(1),
        chain: ChainId::new(CHAIN),
        replica_id: id("p"),
    });
    let output = cluster.step(
        "a",
        ReplicaEvent::Message {
            from: id("p"),
            payload: replay,
        },
    );

    assert!(output.effects.is_empty());
    assert_eq!(output.messages.len(), 1);
    let reply = &output.messages[0];
    assert_eq!(reply.to, Some(id("p")));
    assert!(matches!(
        &reply.payload,
        MessagePayload::Committed(entry) if entry.seq_no == SeqNo::new(1) && entry.replica_id == id("a")
    ));
    assert_eq!(cluster.last_seq_no("a"), 1);
    assert_eq!(cluster.replica("a").commit_log().last_seq_no(), SeqNo::new(1));
}

// ============================================================================
// Persistence
// ============================================================================

#[test]
fn failed_persist_is_retried_on_tick() {
    let mut cluster = Cluster::new(&["p", "a", "b", "c"]);
    cluster.fail_next_appends("a", 1);

    cluster.submit("p", request(1)).unwrap();
    cluster.run();

    assert_eq!(cluster.replica("a").state(), ConsensusState::Committed);
    assert_eq!(cluster.last_seq_no("a"), 0);
    assert_eq!(cluster.replica("a").commit_log().last_seq_no(), SeqNo::new(1));
    for name in ["p", "b", "c"] {
        assert_eq!(cluster.last_seq_no(name), 1);
    }

    cluster.tick("a");

    assert_eq!(cluster.last_seq_no("a"), 1);
    assert_eq!(cluster.replica("a").state(), ConsensusState::Idle);
}

// ============================================================================
// Catch-up
// ============================================================================

#[test]
fn lagging_replica_catches_up_through_fetch() {
    let mut cluster = Cluster::new(&["p", "a", "b", "c"]);

    cluster.crash("c");
    for batch in 1..=3 {
        cluster.submit("p", request(batch)).unwrap();
    }
    cluster.run();
    assert_eq!(cluster.last_seq_no("p"), 3);
    assert_eq!(cluster.last_seq_no("c"), 0);

    cluster.restart("c");
    cluster.submit("p", request(4)).unwrap();
    cluster.run();

    for name in ["p", "a", "b", "c"] {
        assert_eq!(cluster.last_seq_no(name), 4, "replica {name}");
    }
    let caught_up: Vec<u32> = cluster.nodes[&id("c")]
        .stored
        .keys()
        .map(|seq| seq.as_u32())
        .collect();
    assert_eq!(caught_up, vec![1, 2, 3, 4]);
    assert_eq!(cluster.replica("c").state(), ConsensusState::Idle);
}

#[test]
fn single_voucher_is_not_enough_to_adopt_an_entry() {
    let mut cluster = Cluster::new(&["p", "a", "b", "c"]);
    let entry = Committed {
        seq_no: SeqNo::new(1),
        request: request(1),
        chain: ChainId::new(CHAIN),
        replica_id: id("b"),
    };

    cluster.step(
        "a",
        ReplicaEvent::Message {
            from: id("b"),
            payload: MessagePayload::Committed(entry.clone()),
        },
    );
    assert_eq!(cluster.replica("a").commit_log().last_seq_no(), SeqNo::ZERO);

    let output = cluster.step(
        "a",
        ReplicaEvent::Message {
            from: id("c"),
            payload: MessagePayload::Committed(Committed {
                replica_id: id("c"),
                ..entry
            }),
        },
    );
    assert_eq!(cluster.replica("a").commit_log().last_seq_no(), SeqNo::new(1));
    assert!(matches!(&output.effects[..], [Effect::Persist(e)] if e.seq_no == SeqNo::new(1)));
}

#[test]
fn stalled_catch_up_escalates_to_view_change() {
    let mut cluster = Cluster::new(&["p", "a", "b", "c"]);
    let ahead = MessagePayload::PrePrepare(PrePrepare {
        primary_id: id("p"),
        seq_no: SeqNo::new(5),
        quorum: 3,
        request: request(5),
        chain: ChainId::new(CHAIN),
        replica_id: id("p"),
    });

    cluster.step(
        "a",
        ReplicaEvent::Message {
            from: id("p"),
            payload: ahead,
        },
    );
    assert_eq!(cluster.replica("a").state(), ConsensusState::Syncing);

    for _ in 0..(SYNC_TIMEOUT * 3) {
        cluster.step("a", ReplicaEvent::Tick);
    }
    assert_eq!(cluster.replica("a").state(), ConsensusState::ViewChanging);
    assert_eq!(cluster.replica("a").view_attempt(), 1);

    for _ in 0..VIEW_CHANGE_TIMEOUT {
        cluster.step("a", ReplicaEvent::Tick);
    }
    assert_eq!(cluster.replica("a").view_attempt(), 2);
}

// ============================================================================
// View Change
// ============================================================================

fn prioritized(config: ConsensusConfig) -> ConsensusConfig {
    let priority = match config.replica_id.as_str() {
        "a" => 5,
        "b" => 9,
        "c" => 2,
        _ => 100,
    };
    config.with_priority(priority)
}

#[test]
fn highest_priority_replica_replaces_a_dead_primary() {
    let mut cluster = Cluster::with(&["p", "a", "b", "c"], prioritized);

    cluster.submit("p", request(1)).unwrap();
    cluster.run();

    cluster.crash("p");
    for name in ["a", "b", "c"] {
        assert_eq!(cluster.submit(name, request(2)), Ok(Submitted::Forwarded));
    }
    cluster.run();

    cluster.tick_all(ROUND_TIMEOUT);

    for name in ["a", "b", "c"] {
        assert_eq!(cluster.replica(name).primary(), &id("b"), "replica {name}");
        assert_eq!(cluster.last_seq_no(name), 2, "replica {name}");
        assert_eq!(cluster.replica(name).pending_requests(), 0);
    }
    assert!(cluster.replica("b").is_primary());

    // The new primary continued after every sequence number in the votes.
    let second = &cluster.nodes[&id("b")].stored[&SeqNo::new(2)];
    assert_eq!(second.request.id, 2);
}

#[test]
fn suspected_primary_is_not_eligible() {
    let mut cluster = Cluster::with(&["p", "a", "b", "c"], prioritized);
    for name in ["p", "b", "c"] {
        cluster.crash(name);
    }

    cluster.submit("a", request(1)).unwrap();
    for _ in 0..ROUND_TIMEOUT {
        cluster.step("a", ReplicaEvent::Tick);
    }
    assert_eq!(cluster.replica("a").state(), ConsensusState::ViewChanging);

    // The suspect votes too, with the highest priority.
    cluster.step(
        "a",
        ReplicaEvent::Message {
            from: id("p"),
            payload: vote("p", 1_000, "p"),
        },
    );
    cluster.step(
        "a",
        ReplicaEvent::Message {
            from: id("b"),
            payload: vote("b", 1, "p"),
        },
    );

    assert!(cluster.replica("a").is_primary());
    assert_eq!(cluster.replica("a").state(), ConsensusState::PrePrepared);
}

#[test]
fn replica_joins_after_weak_certificate_of_votes() {
    let mut cluster = Cluster::with(&["p", "a", "b", "c"], prioritized);

    cluster.step(
        "a",
        ReplicaEvent::Message {
            from: id("b"),
            payload: vote("b", 9, "p"),
        },
    );
    assert_eq!(cluster.replica("a").state(), ConsensusState::Idle);

    let output = cluster.step(
        "a",
        ReplicaEvent::Message {
            from: id("c"),
            payload: vote("c", 2, "p"),
        },
    );

    // Three votes (b, c, and a's own) form a quorum right away.
    assert_eq!(cluster.replica("a").primary(), &id("b"));
    assert!(
        output
            .messages
            .iter()
            .any(|m| matches!(&m.payload, MessagePayload::ViewChange(v) if v.id == id("a")))
    );
}

#[test]
fn vote_for_another_candidate_is_a_violation() {
    let mut cluster = Cluster::new(&["p", "a", "b", "c"]);
    let forged = MessagePayload::ViewChange(ViewChange {
        id: id("c"),
        priority: 1,
        primary_id: id("p"),
        seq_no: SeqNo::ZERO,
        height: 0,
        hash: Digest::ZERO,
        replica_id: id("b"),
        chain: ChainId::new(CHAIN),
    });

    for from in ["b", "b", "b"] {
        cluster.step(
            "a",
            ReplicaEvent::Message {
                from: id(from),
                payload: forged.clone(),
            },
        );
    }
    assert_eq!(cluster.replica("a").state(), ConsensusState::Idle);
    assert_eq!(cluster.replica("a").primary(), &id("p"));
}

#[test]
fn replica_follows_primary_named_by_weak_certificate() {
    let mut cluster = Cluster::new(&["p", "a", "b", "c"]);
    let digest = request(1).digest();

    cluster.step(
        "a",
        ReplicaEvent::Message {
            from: id("b"),
            payload: prepare("b", "b", 1, digest),
        },
    );
    assert_eq!(cluster.replica("a").primary(), &id("p"));

    cluster.step(
        "a",
        ReplicaEvent::Message {
            from: id("c"),
            payload: prepare("c", "b", 1, digest),
        },
    );
    assert_eq!(cluster.replica("a").primary(), &id("b"));
}

#[test]
fn vote_naming_another_primary_still_counts() {
    let mut cluster = Cluster::with(&["p", "a", "b", "c"], prioritized);
    cluster.crash("p");

    cluster.submit("a", request(1)).unwrap();
    for _ in 0..ROUND_TIMEOUT {
        cluster.step("a", ReplicaEvent::Tick);
    }
    assert_eq!(cluster.replica("a").state(), ConsensusState::ViewChanging);

    // b already replaced p with c and now suspects c.
    cluster.step(
        "a",
        ReplicaEvent::Message {
            from: id("b"),
            payload: vote("b", 9, "c"),
        },
    );
    assert_eq!(cluster.replica("a").state(), ConsensusState::ViewChanging);

    cluster.step(
        "a",
        ReplicaEvent::Message {
            from: id("c"),
            payload: vote("c", 2, "p"),
        },
    );

    // Both named primaries are suspects; b is the best remaining candidate.
    assert_eq!(cluster.replica("a").primary(), &id("b"));
    assert_eq!(cluster.replica("a").state(), ConsensusState::Idle);
}

#[test]
fn primary_timing_out_mid_round_hands_over_to_highest_priority() {
    let mut cluster = Cluster::with(&["p", "a", "b", "c"], prioritized);

    // The proposal never leaves p.
    cluster.step("p", ReplicaEvent::Submit(request(1)));
    assert_eq!(cluster.replica("p").state(), ConsensusState::PrePrepared);

    for _ in 0..ROUND_TIMEOUT {
        cluster.step("p", ReplicaEvent::Tick);
    }
    assert_eq!(cluster.replica("p").state(), ConsensusState::ViewChanging);

    cluster.step(
        "p",
        ReplicaEvent::Message {
            from: id("a"),
            payload: vote("a", 5, "p"),
        },
    );
    assert_eq!(cluster.replica("p").state(), ConsensusState::ViewChanging);

    let output = cluster.step(
        "p",
        ReplicaEvent::Message {
            from: id("b"),
            payload: vote("b", 9, "p"),
        },
    );
    assert_eq!(cluster.replica("p").primary(), &id("b"));
    assert!(!cluster.replica("p").is_primary());
    assert_eq!(cluster.replica("p").state(), ConsensusState::Idle);
    assert!(output.messages.iter().any(|m| {
        m.to.as_ref() == Some(&id("b")) && matches!(&m.payload, MessagePayload::Request(r) if r.id == 1)
    }));

    // A late vote after the install changes nothing.
    cluster.step(
        "p",
        ReplicaEvent::Message {
            from: id("c"),
            payload: vote("c", 2, "p"),
        },
    );
    assert_eq!(cluster.replica("p").primary(), &id("b"));
    assert_eq!(cluster.replica("p").state(), ConsensusState::Idle);
}

fn two_favorites(config: ConsensusConfig) -> ConsensusConfig {
    let priority = match config.replica_id.as_str() {
        "r1" => 10,
        "r2" => 20,
        _ => 1,
    };
    config.with_priority(priority)
}

#[test]
fn split_view_change_converges_and_commits() {
    const NAMES: [&str; 7] = ["r0", "r1", "r2", "r3", "r4", "r5", "r6"];
    const LIVE: [&str; 6] = ["r1", "r2", "r3", "r4", "r5", "r6"];

    let mut cluster = Cluster::with(&NAMES, two_favorites);
    cluster.crash("r0");
    for name in LIVE {
        assert_eq!(cluster.submit(name, request(1)), Ok(Submitted::Forwarded));
    }
    cluster.run();

    // Only r2, r5 and r6 learn of r2's vote, so they pick r2 while the
    // rest pick r1. Neither group reaches a quorum on its own.
    for to in ["r1", "r3", "r4"] {
        cluster.block("r2", to, MessageType::ViewChange);
    }
    cluster.tick_all(ROUND_TIMEOUT);

    assert_eq!(cluster.replica("r1").primary(), &id("r1"));
    assert_eq!(cluster.replica("r2").primary(), &id("r2"));
    for name in LIVE {
        assert_eq!(cluster.last_seq_no(name), 0, "replica {name}");
    }

    cluster.heal();
    cluster.tick_all(200);

    let primary = cluster.replica("r1").primary().clone();
    for name in LIVE {
        assert_eq!(cluster.last_seq_no(name), 1, "replica {name}");
        assert_eq!(cluster.replica(name).primary(), &primary, "replica {name}");
        assert_eq!(cluster.replica(name).pending_requests(), 0, "replica {name}");
    }
}

// ============================================================================
// Byzantine Inputs
// ============================================================================

#[test]
fn equivocating_prepare_is_recorded_as_evidence() {
    let mut cluster = Cluster::new(&["p", "a", "b", "c"]);

    cluster.step(
        "a",
        ReplicaEvent::Message {
            from: id("b"),
            payload: prepare("b", "p", 1, Digest::of(b"first")),
        },
    );
    cluster.step(
        "a",
        ReplicaEvent::Message {
            from: id("b"),
            payload: prepare("b", "p", 1, Digest::of(b"second")),
        },
    );

    let evidence: Vec<_> = cluster.replica("a").quorum_tracker().evidence().collect();
    assert_eq!(evidence.len(), 1);
    assert_eq!(evidence[0].replica, id("b"));
    assert_eq!(evidence[0].first, Digest::of(b"first"));
    assert_eq!(evidence[0].second, Digest::of(b"second"));
}

#[test]
fn conflicting_proposal_does_not_replace_the_round() {
    let mut cluster = Cluster::new(&["p", "a", "b", "c"]);
    let proposal = |batch: i64| {
        MessagePayload::PrePrepare(PrePrepare {
            primary_id: id("p"),
            seq_no: SeqNo::new(1),
            quorum: 3,
            request: request(batch),
            chain: ChainId::new(CHAIN),
            replica_id: id("p"),
        })
    };

    let first = cluster.step(
        "a",
        ReplicaEvent::Message {
            from: id("p"),
            payload: proposal(1),
        },
    );
    assert_eq!(first.messages.len(), 1);
    assert_eq!(cluster.replica("a").state(), ConsensusState::PrePrepared);

    let second = cluster.step(
        "a",
        ReplicaEvent::Message {
            from: id("p"),
            payload: proposal(2),
        },
    );
    assert!(second.messages.is_empty());
    assert_eq!(cluster.replica("a").state(), ConsensusState::PrePrepared);
}

#[test]
fn spoofed_sender_is_dropped() {
    let mut cluster = Cluster::new(&["p", "a", "b", "c"]);
    let digest = request(1).digest();

    // Claims to be b, arrives from c.
    cluster.step(
        "a",
        ReplicaEvent::Message {
            from: id("c"),
            payload: prepare("b", "p", 1, digest),
        },
    );
    // Not a cluster member.
    cluster.step(
        "a",
        ReplicaEvent::Message {
            from: id("z"),
            payload: prepare("z", "p", 1, digest),
        },
    );

    assert_eq!(cluster.replica("a").quorum_tracker().slot_count(), 0);
}

#[test]
fn proposal_from_a_backup_is_rejected() {
    let mut cluster = Cluster::new(&["p", "a", "b", "c"]);
    let output = cluster.step(
        "a",
        ReplicaEvent::Message {
            from: id("b"),
            payload: MessagePayload::PrePrepare(PrePrepare {
                primary_id: id("p"),
                seq_no: SeqNo::new(1),
                quorum: 3,
                request: request(1),
                chain: ChainId::new(CHAIN),
                replica_id: id("b"),
            }),
        },
    );

    assert!(output.is_empty());
    assert_eq!(cluster.replica("a").state(), ConsensusState::Idle);
}

#[test]
fn undersized_quorum_is_rejected() {
    let mut cluster = Cluster::new(&["p", "a", "b", "c"]);
    let weak = MessagePayload::Prepare(Prepare {
        primary_id: id("p"),
        seq_no: SeqNo::new(1),
        digest: request(1).digest(),
        quorum: 2,
        chain: ChainId::new(CHAIN),
        replica_id: id("b"),
    });

    cluster.step(
        "a",
        ReplicaEvent::Message {
            from: id("b"),
            payload: weak,
        },
    );
    assert_eq!(cluster.replica("a").quorum_tracker().slot_count(), 0);
}
