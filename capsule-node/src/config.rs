//! Node configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use time_capsule::EngineConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    /// Engine settings, passed through unchanged
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Config {
    /// Load from `path`, falling back to defaults when the file is missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            tracing::info!("Config file not found, using defaults");
            Ok(Self::default())
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier, used in logs
    #[serde(default = "default_node_id")]
    pub id: String,

    /// Data directory holding the capsule database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_node_id() -> String {
    format!("capsule-node-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./capsule-data")
}
