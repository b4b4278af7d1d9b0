//! Daemon configuration surface: defaults, file loading, and the
//! validation that must fail hard before any component starts.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::{fs, path::Path};
use thiserror::Error;

/// Free-form operator contact string; anything longer is rejected.
pub const MAX_NODE_ID_LEN: usize = 128;

pub const DEFAULT_P2P_PORT: u16 = 39999;
pub const DEFAULT_RPC_PORT: u16 = 40000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {0}: {1}")]
    Read(String, std::io::Error),
    #[error("cannot parse config file {0}: {1}")]
    Parse(String, serde_json::Error),
    #[error("node-id is too long ({len} > {MAX_NODE_ID_LEN} characters)")]
    NodeIdTooLong { len: usize },
    #[error("cannot create data directory {0}: {1}")]
    DataDir(String, std::io::Error),
    #[error("p2p and rpc bind ports must differ")]
    PortClash,
}

/// How `--load-checkpoints` was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointsSource {
    /// use the embedded list
    Embedded,
    /// merge the embedded list with a CSV file
    File(PathBuf),
    /// run without checkpoints
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: String,
    pub testnet: bool,
    /// "default" = embedded list, a path = CSV file, "" = disabled
    pub load_checkpoints: String,
    pub fee_address: Option<String>,
    pub fee_amount: u64,
    pub view_key: Option<String>,
    pub node_id: Option<String>,
    pub p2p_bind_ip: String,
    pub p2p_bind_port: u16,
    pub rpc_bind_ip: String,
    pub rpc_bind_port: u16,
    /// extra peers dialed alongside the seed nodes
    pub add_peers: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: Self::default_data_dir(),
            testnet: false,
            load_checkpoints: "default".to_string(),
            fee_address: None,
            fee_amount: 0,
            view_key: None,
            node_id: None,
            p2p_bind_ip: "0.0.0.0".to_string(),
            p2p_bind_port: DEFAULT_P2P_PORT,
            rpc_bind_ip: "127.0.0.1".to_string(),
            rpc_bind_port: DEFAULT_RPC_PORT,
            add_peers: Vec::new(),
        }
    }
}

impl Config {
    fn expand_path(path: &str) -> PathBuf {
        let expanded = shellexpand::tilde(path);
        PathBuf::from(expanded.into_owned())
    }

    /// Compute the default data directory depending on the target OS.
    fn default_data_dir() -> String {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));

        if cfg!(target_os = "windows") {
            let base = dirs::data_dir().unwrap_or(home).join("CacheCash");
            return base.to_string_lossy().into_owned();
        }

        home.join(".cache-cash").to_string_lossy().into_owned()
    }

    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.display().to_string(), e))?;
        serde_json::from_str(&text).map_err(|e| ConfigError::Parse(path.display().to_string(), e))
    }

    /// Data directory with tilde expansion applied; testnet state lives
    /// in its own subdirectory so the nets never share a store.
    pub fn data_dir_resolved(&self) -> PathBuf {
        let base = Self::expand_path(&self.data_dir);
        if self.testnet { base.join("testnet") } else { base }
    }

    pub fn checkpoints_source(&self) -> CheckpointsSource {
        match self.load_checkpoints.trim() {
            "" => CheckpointsSource::Disabled,
            "default" => CheckpointsSource::Embedded,
            path => CheckpointsSource::File(Self::expand_path(path)),
        }
    }

    pub fn p2p_bind_addr(&self) -> String {
        format!("{}:{}", self.p2p_bind_ip, self.p2p_bind_port)
    }

    pub fn rpc_bind_addr(&self) -> String {
        format!("{}:{}", self.rpc_bind_ip, self.rpc_bind_port)
    }

    /// Startup validation: anything wrong here is fatal. Address-level
    /// checks (fee-address parse) happen in the daemon where the
    /// currency profile is known.
    pub fn validate_and_prepare(&self) -> Result<(), ConfigError> {
        if let Some(id) = &self.node_id {
            if id.len() > MAX_NODE_ID_LEN {
                return Err(ConfigError::NodeIdTooLong { len: id.len() });
            }
        }
        if self.p2p_bind_port == self.rpc_bind_port {
            return Err(ConfigError::PortClash);
        }
        let dir = self.data_dir_resolved();
        fs::create_dir_all(&dir)
            .map_err(|e| ConfigError::DataDir(dir.display().to_string(), e))?;
        Ok(())
    }
}
