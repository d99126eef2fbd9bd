//! Cluster configuration and quorum arithmetic.
//!
//! For `n` replicas the cluster tolerates `f = (n - 1) / 3` Byzantine
//! replicas. A strong quorum is `ceil((n + f + 1) / 2)`; any two strong
//! quorums intersect in at least one correct replica. A weak certificate
//! is `f + 1` matching voices, enough to include one correct replica.
//!
//! | n | f | quorum | weak |
//! |---|---|--------|------|
//! | 1 | 0 | 1      | 1    |
//! | 3 | 0 | 2      | 1    |
//! | 4 | 1 | 3      | 2    |
//! | 5 | 1 | 4      | 2    |
//! | 7 | 2 | 5      | 3    |

use std::time::Duration;

use lbft_config::LbftConfig;
use lbft_types::{ChainId, ReplicaId};

/// Per-replica consensus parameters shared by every chain instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusConfig {
    /// This replica's identity.
    pub replica_id: ReplicaId,
    /// Every replica in the cluster, in configured order. The first entry
    /// is the initial primary of every chain.
    pub replicas: Vec<ReplicaId>,
    /// Chains this replica orders.
    pub chains: Vec<ChainId>,

    /// Wall-clock length of one logical tick.
    pub tick_interval_ms: u64,
    pub round_timeout_ticks: u64,
    pub view_change_timeout_ticks: u64,
    pub sync_timeout_ticks: u64,

    /// Early votes are kept up to this many sequence numbers ahead.
    pub vote_window: u32,
    pub log_cache_capacity: usize,
    pub max_pending_requests: usize,
    pub fetch_batch: u32,

    /// Fixed candidacy priority; derived per view-change attempt when unset.
    pub priority: Option<i64>,
}

impl ConsensusConfig {
    /// Creates a configuration with default limits and timing.
    ///
    /// Duplicate replica ids are dropped, keeping the first occurrence.
    pub fn new(
        replica_id: impl Into<ReplicaId>,
        replicas: impl IntoIterator<Item = ReplicaId>,
        chains: impl IntoIterator<Item = ChainId>,
    ) -> Self {
        let defaults = LbftConfig::default();
        let mut ids: Vec<ReplicaId> = Vec::new();
        for id in replicas {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }

        Self {
            replica_id: replica_id.into(),
            replicas: ids,
            chains: chains.into_iter().collect(),
            tick_interval_ms: defaults.timing.tick_interval_ms,
            round_timeout_ticks: defaults.timing.round_timeout_ticks,
            view_change_timeout_ticks: defaults.timing.view_change_timeout_ticks,
            sync_timeout_ticks: defaults.timing.sync_timeout_ticks,
            vote_window: defaults.limits.vote_window,
            log_cache_capacity: defaults.limits.log_cache_capacity,
            max_pending_requests: defaults.limits.max_pending_requests,
            fetch_batch: defaults.limits.fetch_batch,
            priority: defaults.view_change.priority,
        }
    }

    /// Returns a copy of this configuration for another member of the cluster.
    pub fn for_replica(&self, replica_id: impl Into<ReplicaId>) -> Self {
        Self {
            replica_id: replica_id.into(),
            ..self.clone()
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_timeouts(mut self, round: u64, view_change: u64, sync: u64) -> Self {
        self.round_timeout_ticks = round;
        self.view_change_timeout_ticks = view_change;
        self.sync_timeout_ticks = sync;
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn cluster_size(&self) -> usize {
        self.replicas.len()
    }

    /// Maximum Byzantine replicas tolerated, `f`.
    pub fn max_faults(&self) -> usize {
        max_faults(self.cluster_size())
    }

    /// Strong quorum size.
    pub fn quorum_size(&self) -> usize {
        quorum_size(self.cluster_size())
    }

    /// Weak certificate size, `f + 1`.
    pub fn weak_quorum(&self) -> usize {
        self.max_faults() + 1
    }

    pub fn contains(&self, replica: &ReplicaId) -> bool {
        self.replicas.contains(replica)
    }

    pub fn serves(&self, chain: &ChainId) -> bool {
        self.chains.contains(chain)
    }

    /// Primary every chain starts with.
    pub fn initial_primary(&self) -> ReplicaId {
        self.replicas
            .first()
            .cloned()
            .unwrap_or_else(|| self.replica_id.clone())
    }

    /// Every replica except this one.
    pub fn peers(&self) -> impl Iterator<Item = &ReplicaId> {
        self.replicas.iter().filter(move |r| **r != self.replica_id)
    }
}

impl From<&LbftConfig> for ConsensusConfig {
    fn from(config: &LbftConfig) -> Self {
        let mut consensus = Self::new(
            config.node.replica_id.as_str(),
            config.cluster.replicas.iter().map(|r| ReplicaId::new(r.as_str())),
            config.chains.served.iter().map(|c| ChainId::new(c.as_str())),
        );
        consensus.tick_interval_ms = config.timing.tick_interval_ms;
        consensus.round_timeout_ticks = config.timing.round_timeout_ticks;
        consensus.view_change_timeout_ticks = config.timing.view_change_timeout_ticks;
        consensus.sync_timeout_ticks = config.timing.sync_timeout_ticks;
        consensus.vote_window = config.limits.vote_window;
        consensus.log_cache_capacity = config.limits.log_cache_capacity;
        consensus.max_pending_requests = config.limits.max_pending_requests;
        consensus.fetch_batch = config.limits.fetch_batch;
        consensus.priority = config.view_change.priority;
        consensus
    }
}

/// `f = (n - 1) / 3`.
pub fn max_faults(n: usize) -> usize {
    n.saturating_sub(1) / 3
}

/// `ceil((n + f + 1) / 2)`.
pub fn quorum_size(n: usize) -> usize {
    (n + max_faults(n) + 1).div_ceil(2)
}
