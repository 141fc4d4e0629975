//! Durable storage for TweetChain
//!
//! Each logical artifact (chain, seen ops, process parameters, validator set)
//! lives in its own JSON file whose name carries the network id, so distinct
//! networks sharing one data directory never collide. Writes land in a
//! temporary sibling file which is then renamed over the target.

use crate::blockchain::Block;
use crate::error::ChainError;
use crate::governance::{ProcessParameters, ValidatorSet};
use crate::op::OpId;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Abstraction for persistence backends. Every save replaces the whole
/// artifact; a failed save leaves the previous version intact.
pub trait Persistence: Send + Sync {
    fn load_chain(&self) -> Result<Option<Vec<Block>>, ChainError>;
    fn save_chain(&self, chain: &[Block]) -> Result<(), ChainError>;
    fn load_seen_ops(&self) -> Result<HashSet<OpId>, ChainError>;
    fn save_seen_ops(&self, seen: &HashSet<OpId>) -> Result<(), ChainError>;
    fn load_params(&self) -> Result<Option<ProcessParameters>, ChainError>;
    fn save_params(&self, params: &ProcessParameters) -> Result<(), ChainError>;
    fn load_validators(&self) -> Result<Option<ValidatorSet>, ChainError>;
    fn save_validators(&self, validators: &ValidatorSet) -> Result<(), ChainError>;
}

/// Serialize `value` to `path` via write-temp-then-rename.
pub fn atomic_write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), ChainError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| {
                ChainError::PersistenceError(format!("Failed to create dir {:?}: {}", parent, e))
            })?;
        }
    }

    let json = serde_json::to_vec_pretty(value).map_err(|e| {
        ChainError::PersistenceError(format!("Failed to serialize {:?}: {}", path, e))
    })?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, json)
        .map_err(|e| ChainError::PersistenceError(format!("Failed to write {:?}: {}", tmp, e)))?;
    fs::rename(&tmp, path).map_err(|e| {
        ChainError::PersistenceError(format!("Failed to rename {:?} into place: {}", tmp, e))
    })
}

/// Read a JSON artifact. A missing file is `Ok(None)`; a corrupt one is an error.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ChainError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(ChainError::PersistenceError(format!(
                "Failed to read {:?}: {}",
                path, e
            )))
        }
    };

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| ChainError::PersistenceError(format!("Corrupt file {:?}: {}", path, e)))
}

fn seen_to_hex(seen: &HashSet<OpId>) -> Vec<String> {
    let mut ids: Vec<String> = seen.iter().map(hex::encode).collect();
    ids.sort();
    ids
}

fn seen_from_hex(ids: Vec<String>) -> Result<HashSet<OpId>, ChainError> {
    ids.iter()
        .map(|s| {
            let bytes = hex::decode(s).map_err(|e| {
                ChainError::PersistenceError(format!("Invalid op id {}: {}", s, e))
            })?;
            <OpId>::try_from(bytes.as_slice())
                .map_err(|_| ChainError::PersistenceError(format!("Op id {} is not 32 bytes", s)))
        })
        .collect()
}

/// One JSON file per artifact under a data directory.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    data_dir: PathBuf,
    network_id: String,
}

impl JsonFileStore {
    pub fn open(data_dir: impl Into<PathBuf>, network_id: &str) -> Result<Self, ChainError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir).map_err(|e| {
            ChainError::PersistenceError(format!("Failed to create data dir {:?}: {}", data_dir, e))
        })?;
        Ok(Self {
            data_dir,
            network_id: network_id.to_string(),
        })
    }

    fn file(&self, artifact: &str) -> PathBuf {
        self.data_dir
            .join(format!("{}-{}.json", artifact, self.network_id))
    }

    pub fn chain_path(&self) -> PathBuf {
        self.file("chain")
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

impl Persistence for JsonFileStore {
    fn load_chain(&self) -> Result<Option<Vec<Block>>, ChainError> {
        read_json(&self.chain_path())
    }

    fn save_chain(&self, chain: &[Block]) -> Result<(), ChainError> {
        atomic_write_json(&self.chain_path(), chain)
    }

    fn load_seen_ops(&self) -> Result<HashSet<OpId>, ChainError> {
        match read_json::<Vec<String>>(&self.file("seen"))? {
            Some(ids) => seen_from_hex(ids),
            None => Ok(HashSet::new()),
        }
    }

    fn save_seen_ops(&self, seen: &HashSet<OpId>) -> Result<(), ChainError> {
        atomic_write_json(&self.file("seen"), &seen_to_hex(seen))
    }

    fn load_params(&self) -> Result<Option<ProcessParameters>, ChainError> {
        read_json(&self.file("params"))
    }

    fn save_params(&self, params: &ProcessParameters) -> Result<(), ChainError> {
        atomic_write_json(&self.file("params"), params)
    }

    fn load_validators(&self) -> Result<Option<ValidatorSet>, ChainError> {
        read_json(&self.file("validators"))
    }

    fn save_validators(&self, validators: &ValidatorSet) -> Result<(), ChainError> {
        atomic_write_json(&self.file("validators"), validators)
    }
}

/// Simple in-memory persistence implementation useful for tests and ephemeral runs.
#[derive(Clone, Default)]
pub struct InMemoryPersistence {
    pub chain: Arc<Mutex<Option<Vec<Block>>>>,
    pub seen_ops: Arc<Mutex<HashSet<OpId>>>,
    pub params: Arc<Mutex<Option<ProcessParameters>>>,
    pub validators: Arc<Mutex<Option<ValidatorSet>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> ChainError {
    ChainError::PersistenceError("Mutex poisoned".to_string())
}

impl Persistence for InMemoryPersistence {
    fn load_chain(&self) -> Result<Option<Vec<Block>>, ChainError> {
        Ok(self.chain.lock().map_err(poisoned)?.clone())
    }

    fn save_chain(&self, chain: &[Block]) -> Result<(), ChainError> {
        *self.chain.lock().map_err(poisoned)? = Some(chain.to_vec());
        Ok(())
    }

    fn load_seen_ops(&self) -> Result<HashSet<OpId>, ChainError> {
        Ok(self.seen_ops.lock().map_err(poisoned)?.clone())
    }

    fn save_seen_ops(&self, seen: &HashSet<OpId>) -> Result<(), ChainError> {
        *self.seen_ops.lock().map_err(poisoned)? = seen.clone();
        Ok(())
    }

    fn load_params(&self) -> Result<Option<ProcessParameters>, ChainError> {
        Ok(self.params.lock().map_err(poisoned)?.clone())
    }

    fn save_params(&self, params: &ProcessParameters) -> Result<(), ChainError> {
        *self.params.lock().map_err(poisoned)? = Some(params.clone());
        Ok(())
    }

    fn load_validators(&self) -> Result<Option<ValidatorSet>, ChainError> {
        Ok(self.validators.lock().map_err(poisoned)?.clone())
    }

    fn save_validators(&self, validators: &ValidatorSet) -> Result<(), ChainError> {
        *self.validators.lock().map_err(poisoned)? = Some(validators.clone());
        Ok(())
    }
}
