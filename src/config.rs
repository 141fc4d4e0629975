//! Configuration management for TweetChain

use crate::error::ChainError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub mempool: MempoolConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_genesis_label")]
    pub genesis_label: String,
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
    #[serde(default)]
    pub client_only: bool,
    #[serde(default = "default_max_msg_bytes")]
    pub max_msg_bytes: usize,
    #[serde(default = "default_rate_window_ms")]
    pub rate_window_ms: u64,
    #[serde(default = "default_rate_max_msgs")]
    pub rate_max_msgs: u32,
    #[serde(default = "default_ban_score_limit")]
    pub ban_score_limit: u32,
    /// How many recent blocks an INV exchange transfers.
    #[serde(default = "default_sync_window")]
    pub sync_window: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            genesis_label: default_genesis_label(),
            bootstrap_peers: Vec::new(),
            client_only: false,
            max_msg_bytes: default_max_msg_bytes(),
            rate_window_ms: default_rate_window_ms(),
            rate_max_msgs: default_rate_max_msgs(),
            ban_score_limit: default_ban_score_limit(),
            sync_window: default_sync_window(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsensusConfig {
    /// PoW target used until governance sets `difficultyBits`.
    #[serde(default = "default_difficulty_bits")]
    pub difficulty_bits: u32,
    #[serde(default = "default_max_block_ops")]
    pub max_block_ops: usize,
    #[serde(default = "default_max_clock_drift_ms")]
    pub max_clock_drift_ms: u64,
    #[serde(default = "default_daily_chat_limit")]
    pub daily_chat_limit: usize,
    #[serde(default = "default_post_ttl_ms")]
    pub post_ttl_ms: u64,
    /// Hex fingerprints seeding the validator set on first start.
    #[serde(default)]
    pub bootstrap_validators: Vec<String>,
    /// Add this node's own key to the bootstrap validator set.
    #[serde(default)]
    pub self_validator: bool,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            difficulty_bits: default_difficulty_bits(),
            max_block_ops: default_max_block_ops(),
            max_clock_drift_ms: default_max_clock_drift_ms(),
            daily_chat_limit: default_daily_chat_limit(),
            post_ttl_ms: default_post_ttl_ms(),
            bootstrap_validators: Vec::new(),
            self_validator: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MempoolConfig {
    #[serde(default = "default_mempool_max")]
    pub max_entries: usize,
    #[serde(default = "default_min_fee")]
    pub min_fee: u64,
    #[serde(default = "default_evict_batch")]
    pub evict_batch: usize,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_entries: default_mempool_max(),
            min_fee: default_min_fee(),
            evict_batch: default_evict_batch(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Config {
    /// Reject values no node could run with.
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.network.genesis_label.trim().is_empty() {
            return Err(ChainError::ConfigError(
                "network.genesis_label must not be empty".to_string(),
            ));
        }
        if self.network.max_msg_bytes == 0 {
            return Err(ChainError::ConfigError(
                "network.max_msg_bytes must be positive".to_string(),
            ));
        }
        if self.network.sync_window == 0 {
            return Err(ChainError::ConfigError(
                "network.sync_window must be positive".to_string(),
            ));
        }
        if self.consensus.difficulty_bits == 0 || self.consensus.difficulty_bits > 256 {
            return Err(ChainError::ConfigError(format!(
                "consensus.difficulty_bits must be in 1..=256, got {}",
                self.consensus.difficulty_bits
            )));
        }
        if self.consensus.max_block_ops == 0 {
            return Err(ChainError::ConfigError(
                "consensus.max_block_ops must be positive".to_string(),
            ));
        }
        if self.mempool.max_entries == 0 || self.mempool.evict_batch == 0 {
            return Err(ChainError::ConfigError(
                "mempool.max_entries and mempool.evict_batch must be positive".to_string(),
            ));
        }
        for id in &self.consensus.bootstrap_validators {
            crate::crypto::address_from_hex(id).map_err(|e| {
                ChainError::ConfigError(format!("bootstrap validator {}: {}", id, e))
            })?;
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.network.host, self.network.port)
    }
}

/// Load `path`, falling back to defaults when the file does not exist.
pub fn load_config(path: &Path) -> Result<Config, ChainError> {
    let config = match fs::read_to_string(path) {
        Ok(text) => toml::from_str(&text).map_err(|e| {
            ChainError::ConfigError(format!("Failed to parse {}: {}", path.display(), e))
        })?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
        Err(e) => {
            return Err(ChainError::ConfigError(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };

    config.validate()?;
    Ok(config)
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9001
}

fn default_genesis_label() -> String {
    "p2p-tweet-pro".to_string()
}

fn default_max_msg_bytes() -> usize {
    256 * 1024
}

fn default_rate_window_ms() -> u64 {
    10_000
}

fn default_rate_max_msgs() -> u32 {
    80
}

fn default_ban_score_limit() -> u32 {
    100
}

fn default_sync_window() -> usize {
    256
}

fn default_difficulty_bits() -> u32 {
    18
}

fn default_max_block_ops() -> usize {
    2000
}

fn default_max_clock_drift_ms() -> u64 {
    10 * 60 * 1000
}

fn default_daily_chat_limit() -> usize {
    5000
}

fn default_post_ttl_ms() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_mempool_max() -> usize {
    10_000
}

fn default_min_fee() -> u64 {
    1
}

fn default_evict_batch() -> usize {
    500
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./.tweetchain")
}
