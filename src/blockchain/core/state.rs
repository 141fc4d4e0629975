//! Consensus state: the authoritative chain plus everything its validation
//! and governance depend on, owned by a single value.

use crate::blockchain::core::chain::{genesis_block, Block};
use crate::blockchain::core::fork_choice::is_better_chain;
use crate::blockchain::core::validation::{validate_block, ConsensusRules, RejectReason, ValidationContext};
use crate::crypto::{Address, Sha256Hash};
use crate::error::ChainError;
use crate::governance::{apply_block_governance, GovAction, ProcessParameters, ValidatorSet};
use crate::op::OpId;
use crate::persistence::Persistence;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of offering a competing chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdoptOutcome {
    /// The candidate replaced the chain from `fork_point` on.
    Adopted {
        fork_point: usize,
        height: usize,
        confirmed: Vec<OpId>,
        governance: Vec<GovAction>,
    },
    /// Valid, but not strictly better than the current chain.
    NotBetter,
}

/// Result of appending one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Appended {
    pub height: usize,
    pub confirmed: Vec<OpId>,
    pub governance: Vec<GovAction>,
}

pub struct ConsensusState {
    chain: Vec<Block>,
    seen_ops: HashSet<OpId>,
    params: ProcessParameters,
    validators: ValidatorSet,
    genesis: Block,
    rules: ConsensusRules,
    default_difficulty: u32,
    store: Box<dyn Persistence>,
    /// Bumped on every tip change; lets a miner notice it was overtaken.
    generation: Arc<AtomicU64>,
}

impl ConsensusState {
    /// Load persisted state for the network named `genesis_label`, or start
    /// from genesis. `bootstrap_validators` seeds the validator set only when
    /// none was persisted.
    pub fn open(
        genesis_label: &str,
        rules: ConsensusRules,
        default_difficulty: u32,
        bootstrap_validators: impl IntoIterator<Item = Address>,
        store: Box<dyn Persistence>,
    ) -> Result<Self, ChainError> {
        let genesis = genesis_block(genesis_label);

        let chain = match store.load_chain()? {
            Some(chain) if !chain.is_empty() => chain,
            _ => vec![genesis.clone()],
        };
        if chain[0] != genesis {
            return Err(ChainError::PersistenceError(format!(
                "Stored chain does not start with the genesis block of '{}'",
                genesis_label
            )));
        }

        let mut seen_ops = store.load_seen_ops()?;
        seen_ops.extend(chain.iter().flat_map(|b| b.ops.iter().map(|op| op.id)));

        let params = store.load_params()?.unwrap_or_default();
        let validators = match store.load_validators()? {
            Some(validators) => validators,
            None => ValidatorSet::from_members(bootstrap_validators),
        };

        store.save_seen_ops(&seen_ops)?;
        store.save_params(&params)?;
        store.save_validators(&validators)?;

        info!(
            "Consensus state ready: height={}, validators={}, difficulty={}",
            chain.len(),
            validators.len(),
            params.difficulty_bits().unwrap_or(default_difficulty)
        );

        Ok(Self {
            chain,
            seen_ops,
            params,
            validators,
            genesis,
            rules,
            default_difficulty,
            store,
            generation: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn chain(&self) -> &[Block] {
        &self.chain
    }

    /// Number of blocks, genesis included.
    pub fn height(&self) -> usize {
        self.chain.len()
    }

    pub fn tip(&self) -> &Block {
        // The chain always holds at least the genesis block.
        &self.chain[self.chain.len() - 1]
    }

    pub fn tip_hash(&self) -> Sha256Hash {
        self.tip().hash
    }

    pub fn genesis(&self) -> &Block {
        &self.genesis
    }

    pub fn params(&self) -> &ProcessParameters {
        &self.params
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    pub fn rules(&self) -> &ConsensusRules {
        &self.rules
    }

    pub fn is_seen(&self, id: &OpId) -> bool {
        self.seen_ops.contains(id)
    }

    pub fn generation(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.generation)
    }

    /// PoW target in force: the governance override, else the configured default.
    pub fn active_difficulty(&self) -> u32 {
        self.params
            .difficulty_bits()
            .unwrap_or(self.default_difficulty)
    }

    pub fn contains_block(&self, block: &Block) -> bool {
        self.chain
            .get(block.header.index as usize)
            .is_some_and(|b| b.hash == block.hash)
    }

    /// Validate `block` as the next block of the current chain.
    pub fn validate_next(&self, block: &Block, now_ms: u64) -> Result<(), RejectReason> {
        let ctx = ValidationContext {
            genesis: &self.genesis,
            seen_ops: &self.seen_ops,
            rules: &self.rules,
            target_bits: self.active_difficulty(),
            now_ms,
            replay: false,
        };
        validate_block(&self.chain, block, &ctx)
    }

    /// Validate, push, record ops as seen, apply governance and persist. A
    /// failed save leaves the in-memory state as it was.
    pub fn append(&mut self, block: Block, now_ms: u64) -> Result<Appended, ChainError> {
        self.validate_next(&block, now_ms)?;

        let confirmed: Vec<OpId> = block.ops.iter().map(|op| op.id).collect();
        let newly_seen = self.mark_seen(&confirmed);
        self.chain.push(block);

        let governance = match self.commit_from(self.chain.len() - 1) {
            Ok(governance) => governance,
            Err(e) => {
                self.chain.pop();
                self.unmark_seen(&newly_seen);
                return Err(e);
            }
        };

        Ok(Appended {
            height: self.chain.len(),
            confirmed,
            governance,
        })
    }

    /// Replace the chain with `candidate` when it validates from the point of
    /// divergence and fork-choice strictly prefers it.
    pub fn adopt_chain(&mut self, candidate: Vec<Block>, now_ms: u64) -> Result<AdoptOutcome, ChainError> {
        match candidate.first() {
            Some(first) if *first == self.genesis => {}
            _ => return Err(RejectReason::GenesisMismatch.into()),
        }

        let fork_point = self
            .chain
            .iter()
            .zip(candidate.iter())
            .take_while(|(ours, theirs)| ours.hash == theirs.hash)
            .count();

        if !is_better_chain(&candidate, &self.chain) {
            return Ok(AdoptOutcome::NotBetter);
        }

        // Ops on the abandoned branch must not block their re-inclusion, so
        // duplicates are judged against the candidate's own history.
        let mut scratch_seen: HashSet<OpId> = candidate[..fork_point]
            .iter()
            .flat_map(|b| b.ops.iter().map(|op| op.id))
            .collect();
        let target_bits = self.active_difficulty();
        for i in fork_point..candidate.len() {
            let ctx = ValidationContext {
                genesis: &self.genesis,
                seen_ops: &scratch_seen,
                rules: &self.rules,
                target_bits,
                now_ms,
                replay: true,
            };
            validate_block(&candidate[..i], &candidate[i], &ctx)?;
            scratch_seen.extend(candidate[i].ops.iter().map(|op| op.id));
        }

        let confirmed: Vec<OpId> = candidate[fork_point..]
            .iter()
            .flat_map(|b| b.ops.iter().map(|op| op.id))
            .collect();
        let dropped = self.chain.len() - fork_point;

        let newly_seen = self.mark_seen(&confirmed);
        let previous = std::mem::replace(&mut self.chain, candidate);
        let governance = match self.commit_from(fork_point) {
            Ok(governance) => governance,
            Err(e) => {
                self.chain = previous;
                self.unmark_seen(&newly_seen);
                return Err(e);
            }
        };

        if dropped > 0 {
            warn!(
                "Reorganized: dropped {} block(s) after height {}, new height {}",
                dropped,
                fork_point,
                self.chain.len()
            );
        }

        Ok(AdoptOutcome::Adopted {
            fork_point,
            height: self.chain.len(),
            confirmed,
            governance,
        })
    }

    /// Insert `ids` into SeenOps, returning the ones that were new.
    fn mark_seen(&mut self, ids: &[OpId]) -> Vec<OpId> {
        ids.iter().copied().filter(|id| self.seen_ops.insert(*id)).collect()
    }

    fn unmark_seen(&mut self, ids: &[OpId]) {
        for id in ids {
            self.seen_ops.remove(id);
        }
    }

    /// Apply governance of `chain[from..]` to copies of the params and
    /// validator set, save everything, and only then adopt the copies and
    /// advance the generation.
    fn commit_from(&mut self, from: usize) -> Result<Vec<GovAction>, ChainError> {
        let mut params = self.params.clone();
        let mut validators = self.validators.clone();
        let mut governance = Vec::new();
        for block in &self.chain[from..] {
            governance.extend(apply_block_governance(block, &mut params, &mut validators));
        }

        self.store.save_chain(&self.chain)?;
        self.store.save_seen_ops(&self.seen_ops)?;
        if !governance.is_empty() {
            self.store.save_params(&params)?;
            self.store.save_validators(&validators)?;
        }

        self.params = params;
        self.validators = validators;
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(governance)
    }
}
