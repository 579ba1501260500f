//! Kernel configuration: TOML file with serde defaults, validated before
//! the node starts. Timing values default to the network constants and are
//! only meant to change on test networks.

use crate::foundation::constants::{
    NODE_ACCEPT_PERIOD_MINIMUM, NODE_REMOVAL_GRACE_PERIOD, SNAPSHOT_REFERENCE_THRESHOLD, SNAPSHOT_ROUND_GAP,
    SNAPSHOT_SYNC_ROUND_THRESHOLD,
};
use crate::foundation::{KernelError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KernelConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Accept finalizations only from consensus peers.
    #[serde(default = "default_consensus_only")]
    pub consensus_only: bool,
    /// Optional log directory; console-only when unset.
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Log filter expression, e.g. `"info"` or `"chorus_core=debug"`.
    #[serde(default = "default_log_filters")]
    pub log_filters: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self { consensus_only: default_consensus_only(), log_dir: None, log_filters: default_log_filters() }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusConfig {
    #[serde(default = "default_round_gap")]
    pub snapshot_round_gap: u64,
    #[serde(default = "default_reference_threshold")]
    pub snapshot_reference_threshold: u64,
    #[serde(default = "default_sync_round_threshold")]
    pub snapshot_sync_round_threshold: u64,
    #[serde(default = "default_accept_period")]
    pub node_accept_period_minimum: u64,
    #[serde(default = "default_removal_grace")]
    pub node_removal_grace_period: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            snapshot_round_gap: default_round_gap(),
            snapshot_reference_threshold: default_reference_threshold(),
            snapshot_sync_round_threshold: default_sync_round_threshold(),
            node_accept_period_minimum: default_accept_period(),
            node_removal_grace_period: default_removal_grace(),
        }
    }
}

impl ConsensusConfig {
    /// The staleness window applied to announcement and challenge
    /// timestamps.
    pub fn timestamp_threshold(&self) -> u64 {
        self.snapshot_round_gap.saturating_mul(self.snapshot_reference_threshold)
    }
}

fn default_consensus_only() -> bool {
    true
}

fn default_log_filters() -> String {
    "info".to_string()
}

fn default_round_gap() -> u64 {
    SNAPSHOT_ROUND_GAP
}

fn default_reference_threshold() -> u64 {
    SNAPSHOT_REFERENCE_THRESHOLD
}

fn default_sync_round_threshold() -> u64 {
    SNAPSHOT_SYNC_ROUND_THRESHOLD
}

fn default_accept_period() -> u64 {
    NODE_ACCEPT_PERIOD_MINIMUM
}

fn default_removal_grace() -> u64 {
    NODE_REMOVAL_GRACE_PERIOD
}

impl KernelConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: KernelConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.consensus.snapshot_round_gap == 0 {
            return Err(KernelError::ConfigError("snapshot_round_gap must be positive".to_string()));
        }
        if self.consensus.snapshot_reference_threshold == 0 {
            return Err(KernelError::ConfigError("snapshot_reference_threshold must be positive".to_string()));
        }
        if self.consensus.snapshot_sync_round_threshold < self.consensus.snapshot_reference_threshold {
            return Err(KernelError::ConfigError(
                "snapshot_sync_round_threshold must not undercut the reference threshold".to_string(),
            ));
        }
        Ok(())
    }
}
