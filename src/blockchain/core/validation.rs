//! Block validation with a closed set of rejection reasons.
//!
//! [`validate_block`] is pure: it reads the chain prefix, the seen-op set and
//! the active rules, and never mutates anything. Checks run in a fixed order
//! and the first failure is reported.

use crate::blockchain::core::chain::{meets_difficulty, Block, MAX_DIFFICULTY_BITS};
use crate::blockchain::core::merkle::ops_root;
use crate::crypto::Address;
use crate::op::OpId;
use chrono::{DateTime, NaiveDate};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum RejectReason {
    #[error("invalid_block_structure")]
    StructInvalid,
    #[error("genesis_mismatch")]
    GenesisMismatch,
    #[error("prev_hash_mismatch_or_height_gap")]
    PrevMismatch,
    #[error("timestamp_drift_exceeded")]
    TimestampDrift,
    #[error("timestamp_backwards")]
    TimestampBackward,
    #[error("ops_empty_or_exceeds_max")]
    OpsEmptyOrTooMany,
    #[error("op_signature_invalid")]
    OpSigInvalid,
    #[error("op_duplicate")]
    OpDuplicate,
    #[error("daily_chat_quota_exceeded")]
    QuotaExceeded,
    #[error("pow_invalid")]
    PowInvalid,
    #[error("ops_merkle_root_mismatch")]
    OpsRootMismatch,
}

impl RejectReason {
    /// Stable code reported to peers and logs.
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::StructInvalid => "invalid_block_structure",
            RejectReason::GenesisMismatch => "genesis_mismatch",
            RejectReason::PrevMismatch => "prev_hash_mismatch_or_height_gap",
            RejectReason::TimestampDrift => "timestamp_drift_exceeded",
            RejectReason::TimestampBackward => "timestamp_backwards",
            RejectReason::OpsEmptyOrTooMany => "ops_empty_or_exceeds_max",
            RejectReason::OpSigInvalid => "op_signature_invalid",
            RejectReason::OpDuplicate => "op_duplicate",
            RejectReason::QuotaExceeded => "daily_chat_quota_exceeded",
            RejectReason::PowInvalid => "pow_invalid",
            RejectReason::OpsRootMismatch => "ops_merkle_root_mismatch",
        }
    }
}

/// Locally configured limits every block is checked against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusRules {
    pub max_block_ops: usize,
    pub max_clock_drift_ms: u64,
    pub daily_chat_limit: usize,
}

impl Default for ConsensusRules {
    fn default() -> Self {
        Self {
            max_block_ops: 2000,
            max_clock_drift_ms: 10 * 60 * 1000,
            daily_chat_limit: 5000,
        }
    }
}

/// Everything besides the chain prefix that a verdict depends on.
#[derive(Debug, Clone, Copy)]
pub struct ValidationContext<'a> {
    pub genesis: &'a Block,
    pub seen_ops: &'a HashSet<OpId>,
    pub rules: &'a ConsensusRules,
    /// Difficulty target in force (governance override or configured default).
    pub target_bits: u32,
    pub now_ms: u64,
    /// Re-validating blocks of a chain offered as a replacement: their age is
    /// not held against them, only timestamps ahead of `now_ms`.
    pub replay: bool,
}

/// UTC calendar day of a millisecond timestamp.
pub fn day_key(timestamp_ms: u64) -> NaiveDate {
    DateTime::from_timestamp_millis(timestamp_ms as i64)
        .map(|dt| dt.date_naive())
        .unwrap_or_default()
}

/// Validate `block` as the next block after `prefix`.
pub fn validate_block(
    prefix: &[Block],
    block: &Block,
    ctx: &ValidationContext<'_>,
) -> Result<(), RejectReason> {
    check_structure(block)?;

    if block.header.index == 0 {
        return if block == ctx.genesis {
            Ok(())
        } else {
            Err(RejectReason::GenesisMismatch)
        };
    }

    let prev = match prefix.last() {
        Some(prev) if prefix.len() as u64 == block.header.index => prev,
        _ => return Err(RejectReason::PrevMismatch),
    };
    if block.header.prev_hash != prev.hash {
        return Err(RejectReason::PrevMismatch);
    }

    let ahead = block.header.timestamp.saturating_sub(ctx.now_ms);
    let behind = ctx.now_ms.saturating_sub(block.header.timestamp);
    if ahead > ctx.rules.max_clock_drift_ms || (!ctx.replay && behind > ctx.rules.max_clock_drift_ms) {
        return Err(RejectReason::TimestampDrift);
    }
    if block.header.timestamp < prev.header.timestamp {
        return Err(RejectReason::TimestampBackward);
    }

    if block.ops.is_empty() || block.ops.len() > ctx.rules.max_block_ops {
        return Err(RejectReason::OpsEmptyOrTooMany);
    }

    for op in &block.ops {
        let verified = if op.is_vote() {
            op.verify_binding()
        } else {
            op.verify_binding().and_then(|_| op.verify_signature())
        };
        if verified.is_err() {
            return Err(RejectReason::OpSigInvalid);
        }
    }

    let mut in_block = HashSet::with_capacity(block.ops.len());
    for op in &block.ops {
        if ctx.seen_ops.contains(&op.id) || !in_block.insert(op.id) {
            return Err(RejectReason::OpDuplicate);
        }
    }

    if exceeds_daily_quota(prefix, block, ctx.rules.daily_chat_limit) {
        return Err(RejectReason::QuotaExceeded);
    }

    // A block must declare at least the active target and its hash must
    // carry the work it declares, so fork-choice weight cannot be inflated.
    if block.header.difficulty < ctx.target_bits
        || !block.hash_is_consistent()
        || !meets_difficulty(&block.hash, block.header.difficulty)
    {
        return Err(RejectReason::PowInvalid);
    }

    if block.header.ops_root != ops_root(&block.ops) {
        return Err(RejectReason::OpsRootMismatch);
    }

    Ok(())
}

fn check_structure(block: &Block) -> Result<(), RejectReason> {
    if block.header.difficulty > MAX_DIFFICULTY_BITS {
        return Err(RejectReason::StructInvalid);
    }
    if block.header.index == 0 {
        return Ok(());
    }
    if block.ops.iter().any(|op| op.check_structure().is_err()) {
        return Err(RejectReason::StructInvalid);
    }
    Ok(())
}

/// Chat ops per author already on `prefix` during `day`. Timestamps never
/// decrease along a chain, so the scan stops at the first block of an
/// earlier day.
pub fn daily_chat_counts(prefix: &[Block], day: NaiveDate) -> HashMap<Address, usize> {
    let mut counts: HashMap<Address, usize> = HashMap::new();
    let history = prefix
        .iter()
        .rev()
        .take_while(|b| day_key(b.header.timestamp) == day)
        .flat_map(|b| b.ops.iter());
    for op in history.filter(|op| op.is_chat()) {
        *counts.entry(op.author_id).or_insert(0) += 1;
    }
    counts
}

/// Whether the candidate pushes any author past `limit` chat ops on its
/// UTC day, counting the prefix and the candidate together.
fn exceeds_daily_quota(prefix: &[Block], block: &Block, limit: usize) -> bool {
    let mut counts = daily_chat_counts(prefix, day_key(block.header.timestamp));
    for op in block.ops.iter().filter(|op| op.is_chat()) {
        let count = counts.entry(op.author_id).or_insert(0);
        *count += 1;
        if *count > limit {
            return true;
        }
    }
    false
}
