//! Proof-of-work mining for TweetChain
//!
//! The nonce search is synchronous and CPU-bound; callers run it on a
//! blocking worker. A [`Preemption`] handle lets a new chain tip abandon a
//! search in progress.

use crate::blockchain::{meets_difficulty, unix_millis, Block};
use crate::error::ChainError;
use crate::op::Op;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Attempts between timestamp refreshes, so long searches stay inside the
/// clock-drift window.
pub const TIMESTAMP_REFRESH_INTERVAL: u64 = 200_000;

/// Cancels a search once the chain generation moves past the one the
/// template was built on.
#[derive(Debug, Clone)]
pub struct Preemption {
    generation: Arc<AtomicU64>,
    started_at: u64,
}

impl Preemption {
    pub fn new(generation: Arc<AtomicU64>) -> Self {
        let started_at = generation.load(Ordering::Acquire);
        Self {
            generation,
            started_at,
        }
    }

    pub fn is_preempted(&self) -> bool {
        self.generation.load(Ordering::Acquire) != self.started_at
    }
}

/// Block skeleton on top of `prev`: nonce zero, `ops_root` committed.
pub fn assemble_block(prev: &Block, ops: Vec<Op>, difficulty: u32, now_ms: u64) -> Block {
    let timestamp = now_ms.max(prev.header.timestamp);
    Block::new(prev, ops, difficulty, timestamp)
}

/// Search nonces until the header hash meets the block's difficulty.
pub fn mine_block(mut block: Block, preemption: Option<&Preemption>) -> Result<Block, ChainError> {
    let mut attempts: u64 = 0;
    loop {
        let hash = block.header.hash();
        if meets_difficulty(&hash, block.header.difficulty) {
            block.hash = hash;
            debug!(
                "Found nonce {} for block {} after {} attempts",
                block.header.nonce, block.header.index, attempts
            );
            return Ok(block);
        }

        if preemption.is_some_and(|p| p.is_preempted()) {
            return Err(ChainError::MiningPreempted);
        }

        attempts += 1;
        block.header.nonce = block.header.nonce.wrapping_add(1);
        if attempts % TIMESTAMP_REFRESH_INTERVAL == 0 {
            block.header.timestamp = unix_millis().max(block.header.timestamp);
        }
    }
}
