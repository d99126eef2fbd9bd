//! Configuration management for lbft replicas
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (LBFT_* prefix, `__` between nesting levels)
//! 2. lbft.local.toml (gitignored, local overrides)
//! 3. lbft.toml (git-tracked, deployment config)
//! 4. ~/.config/lbft/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Main replica configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LbftConfig {
    pub node: NodeConfig,
    pub cluster: ClusterConfig,
    pub chains: ChainsConfig,
    pub timing: TimingConfig,
    pub limits: LimitsConfig,
    pub view_change: ViewChangeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This replica's identity; must appear in `cluster.replicas`.
    pub replica_id: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            replica_id: "replica-0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// All replica ids, including this one.
    pub replicas: Vec<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            replicas: vec!["replica-0".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainsConfig {
    /// Chains this replica orders.
    pub served: Vec<String>,
}

impl Default for ChainsConfig {
    fn default() -> Self {
        Self {
            served: vec!["main".to_string()],
        }
    }
}

/// Liveness timing, expressed in logical ticks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Wall-clock length of one tick. The engine exposes it as
    /// `Engine::tick_interval` for whatever drives its `tick()`.
    pub tick_interval_ms: u64,
    /// Ticks a round may spend without reaching its next quorum.
    pub round_timeout_ticks: u64,
    /// Ticks to wait for a view-change quorum before re-voting.
    pub view_change_timeout_ticks: u64,
    /// Ticks between FetchCommitted retries while catching up.
    pub sync_timeout_ticks: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            round_timeout_ticks: 50,
            view_change_timeout_ticks: 100,
            sync_timeout_ticks: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// How far past the next expected sequence number early votes are kept.
    pub vote_window: u32,
    /// Committed entries retained in memory for replay and fetch.
    pub log_cache_capacity: usize,
    /// Pending (not yet proposed) requests per chain.
    pub max_pending_requests: usize,
    /// Sequence numbers requested per FetchCommitted burst.
    pub fetch_batch: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            vote_window: 16,
            log_cache_capacity: 1024,
            max_pending_requests: 4096,
            fetch_batch: 32,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewChangeConfig {
    /// Fixed candidacy priority; derived per attempt when unset.
    pub priority: Option<i64>,
}

impl LbftConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Parse a single TOML file without layering.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Create a configuration for an in-process cluster of `ids`, as `me`.
    pub fn for_cluster(me: &str, ids: &[&str], chains: &[&str]) -> Self {
        Self {
            node: NodeConfig {
                replica_id: me.to_string(),
            },
            cluster: ClusterConfig {
                replicas: ids.iter().map(ToString::to_string).collect(),
            },
            chains: ChainsConfig {
                served: chains.iter().map(ToString::to_string).collect(),
            },
            ..Default::default()
        }
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.replicas.is_empty() {
            return Err(ConfigError::ValidationError(
                "cluster.replicas must not be empty".to_string(),
            ));
        }

        let unique: BTreeSet<&String> = self.cluster.replicas.iter().collect();
        if unique.len() != self.cluster.replicas.len() {
            return Err(ConfigError::ValidationError(
                "cluster.replicas contains duplicate ids".to_string(),
            ));
        }

        if !unique.contains(&self.node.replica_id) {
            return Err(ConfigError::ValidationError(format!(
                "node.replica_id {} is not listed in cluster.replicas",
                self.node.replica_id
            )));
        }

        if self.chains.served.is_empty() {
            return Err(ConfigError::ValidationError(
                "chains.served must name at least one chain".to_string(),
            ));
        }

        let timing = &self.timing;
        if timing.tick_interval_ms == 0
            || timing.round_timeout_ticks == 0
            || timing.view_change_timeout_ticks == 0
            || timing.sync_timeout_ticks == 0
        {
            return Err(ConfigError::ValidationError(
                "timing values must be positive".to_string(),
            ));
        }

        if self.limits.fetch_batch == 0 || self.limits.log_cache_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "limits.fetch_batch and limits.log_cache_capacity must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
