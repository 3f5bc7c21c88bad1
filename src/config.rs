//! Daemon configuration: `embercoin.toml` in the data directory with
//! defaults, overridden by command-line flags.

use std::path::Path;

use serde::Deserialize;
use tracing::{info, warn};

use crate::constants::{DEFAULT_BAN_SCORE, DEFAULT_BAN_TIME, MAX_BLOCK_SIZE_GEN, MAX_OUTBOUND_CONNECTIONS};
use crate::error::NodeError;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub data_dir: String,
    pub testnet: bool,
    pub listen: bool,
    /// Zero selects the network default.
    pub port: u16,
    /// Connect only to these peers; disables other outbound selection.
    pub connect: Vec<String>,
    /// Operator-maintained peers, reconnected when lost.
    pub add_nodes: Vec<String>,
    pub max_outbound: usize,
    pub ban_score: u16,
    pub ban_time_secs: u64,
    /// Free-relay budget, thousand-bytes per minute.
    pub limit_free_relay: i64,
    /// strict, advisory or permissive.
    pub checkpoint_mode: String,
    pub generate: bool,
    pub miner_threads: usize,
    pub block_max_size: usize,
    pub block_min_size: usize,
    pub block_priority_size: usize,
    /// Initial-download heuristics are timing-sensitive, so they are
    /// configuration rather than constants.
    pub ibd_update_window_secs: i64,
    pub ibd_tip_age_secs: i64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            data_dir: ".embercoin".into(),
            testnet: false,
            listen: true,
            port: 0,
            connect: vec![],
            add_nodes: vec![],
            max_outbound: MAX_OUTBOUND_CONNECTIONS,
            ban_score: DEFAULT_BAN_SCORE,
            ban_time_secs: DEFAULT_BAN_TIME,
            limit_free_relay: 15,
            checkpoint_mode: "strict".into(),
            generate: false,
            miner_threads: 1,
            block_max_size: MAX_BLOCK_SIZE_GEN,
            block_min_size: 0,
            block_priority_size: 27_000,
            ibd_update_window_secs: 10,
            ibd_tip_age_secs: 4 * 60 * 60,
        }
    }
}

impl NodeConfig {
    /// Load `embercoin.toml` from the data directory; defaults when the
    /// file is absent, a hard failure when it is unparseable.
    pub fn load(data_dir: &Path) -> Result<Self, NodeError> {
        let path = data_dir.join("embercoin.toml");
        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str::<NodeConfig>(&contents) {
                Ok(mut config) => {
                    info!(path = %path.display(), "loaded configuration");
                    config.data_dir = data_dir.display().to_string();
                    Ok(config)
                }
                Err(e) => Err(NodeError::Config(format!(
                    "failed to parse {}: {}",
                    path.display(),
                    e
                ))),
            },
            Err(_) => {
                let mut config = NodeConfig::default();
                config.data_dir = data_dir.display().to_string();
                Ok(config)
            }
        }
    }

    pub fn validate(&self) -> Result<(), NodeError> {
        if self.block_max_size < 1000 || self.block_max_size > MAX_BLOCK_SIZE_GEN {
            return Err(NodeError::Config(format!(
                "block_max_size must be within 1000..={}",
                MAX_BLOCK_SIZE_GEN
            )));
        }
        if self.max_outbound == 0 {
            return Err(NodeError::Config("max_outbound must be positive".into()));
        }
        if self.limit_free_relay < 0 {
            return Err(NodeError::Config("limit_free_relay must not be negative".into()));
        }
        self.checkpoint_mode
            .parse::<crate::checkpoints::CheckpointMode>()
            .map_err(NodeError::Config)?;
        if self.miner_threads == 0 && self.generate {
            warn!("generate enabled with zero miner threads");
        }
        Ok(())
    }

    pub fn checkpoint_mode(&self) -> crate::checkpoints::CheckpointMode {
        self.checkpoint_mode.parse().unwrap_or(crate::checkpoints::CheckpointMode::Strict)
    }
}
