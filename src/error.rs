//! Error types for TweetChain

use crate::blockchain::RejectReason;
use thiserror::Error;

/// Why the mempool refused an op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MempoolRejection {
    #[error("op already queued")]
    Duplicate,
    #[error("fee below minimum")]
    FeeTooLow,
    #[error("op already confirmed on chain")]
    AlreadyConfirmed,
}

#[derive(Debug, Clone, Error)]
pub enum ChainError {
    #[error("Block rejected: {0}")]
    Rejected(#[from] RejectReason),

    #[error("Invalid op: {0}")]
    InvalidOp(String),

    #[error("Cryptographic error: {0}")]
    CryptoError(String),

    #[error("Mempool rejected op: {0}")]
    MempoolRejected(MempoolRejection),

    #[error("Mined block failed self-validation: {0}")]
    MinedBlockInvalid(RejectReason),

    #[error("Mining preempted by a new chain tip")]
    MiningPreempted,

    #[error("Block template is stale: chain tip moved")]
    StaleTemplate,

    #[error("Nothing to mine: mempool is empty")]
    NothingToMine,

    #[error("Mining worker failed: {0}")]
    WorkerFailed(String),

    #[error("Persistence error: {0}")]
    PersistenceError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::SerializationError(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;
