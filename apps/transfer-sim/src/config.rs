//! Simulator configuration.
//!
//! Stored as JSON; the path comes from the first argument or
//! `SKYHOP_SIM_CONFIG`, defaulting to `transfer-sim.json`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use skyhop_engine::FeedConfig;
use skyhop_node_batch::BatchConfig;
use skyhop_transfer::{HandoffConfig, ScanStagePolicy, StagingConfig};

const DEFAULT_CONFIG_FILE: &str = "transfer-sim.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub feed: FeedConfig,
    pub scan: ScanStagePolicy,
    pub handoff: HandoffConfig,
    pub staging: StagingConfig,
    pub batch: BatchConfig,
    pub sim: ScenarioConfig,
}

/// Shape of the scripted run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Files inside the scripted folder upload.
    pub folder_files: usize,
    /// Nodes in the copy batch.
    pub copy_nodes: u64,
    /// Delay of every remote call of the scripted engine.
    pub call_delay_ms: u64,
    /// Time the durable worker needs before it listens.
    pub worker_start_delay_ms: u64,
    /// Pending attachment file; kept in memory when unset.
    pub attachments_path: Option<PathBuf>,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            folder_files: 3,
            copy_nodes: 12,
            call_delay_ms: 20,
            worker_start_delay_ms: 100,
            attachments_path: None,
        }
    }
}

impl SimConfig {
    /// Loads the configuration file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SimConfig = serde_json::from_str(&content)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }
}

/// Resolves the configuration file path.
pub fn config_path() -> PathBuf {
    std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os("SKYHOP_SIM_CONFIG"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}
