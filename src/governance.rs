//! On-chain governance
//!
//! A `GOV_PROPOSE` op is ratified by `GOV_VOTE` ops carried in the same
//! block. A vote counts when its attestation signature covers the proposal
//! id and the hash of that very block, and its author belongs to the
//! validator set as it stood before the block. Ratification needs
//! `floor(2n/3) + 1` distinct validators; anything less is dropped.
//! Applying an action sets state rather than incrementing it, so replaying a
//! block is harmless.

use crate::blockchain::{Block, MAX_DIFFICULTY_BITS};
use crate::crypto::{address_from_hex, fingerprint, verify_signature, Address, KeyPair, Sha256Hash};
use crate::error::ChainError;
use crate::op::{vote_attestation_message, GovPayload, OpBody};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use tracing::{info, warn};

/// Parameter key overriding the PoW target.
pub const DIFFICULTY_BITS_KEY: &str = "difficultyBits";

/// Mutable key-value settings, overridable by ratified `PARAMS_SET`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessParameters {
    values: BTreeMap<String, u64>,
}

impl ProcessParameters {
    pub fn get(&self, key: &str) -> Option<u64> {
        self.values.get(key).copied()
    }

    pub fn set(&mut self, key: &str, value: u64) {
        self.values.insert(key.to_string(), value);
    }

    /// On-chain difficulty override; zero means "use the configured default".
    pub fn difficulty_bits(&self) -> Option<u32> {
        self.get(DIFFICULTY_BITS_KEY)
            .and_then(|bits| u32::try_from(bits).ok())
            .filter(|bits| (1..=MAX_DIFFICULTY_BITS).contains(bits))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &u64)> {
        self.values.iter()
    }
}

/// Validator key fingerprints, persisted as a sorted list of hex strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct ValidatorSet {
    members: BTreeSet<Address>,
}

impl ValidatorSet {
    pub fn from_members(members: impl IntoIterator<Item = Address>) -> Self {
        Self {
            members: members.into_iter().collect(),
        }
    }

    pub fn contains(&self, id: &Address) -> bool {
        self.members.contains(id)
    }

    pub fn insert(&mut self, id: Address) -> bool {
        self.members.insert(id)
    }

    pub fn remove(&mut self, id: &Address) -> bool {
        self.members.remove(id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Address> {
        self.members.iter()
    }
}

impl TryFrom<Vec<String>> for ValidatorSet {
    type Error = ChainError;

    fn try_from(ids: Vec<String>) -> Result<Self, Self::Error> {
        let members = ids
            .iter()
            .map(|id| address_from_hex(id))
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(Self { members })
    }
}

impl From<ValidatorSet> for Vec<String> {
    fn from(set: ValidatorSet) -> Self {
        set.members.iter().map(hex::encode).collect()
    }
}

/// Votes needed to ratify a proposal with `validators` members.
pub fn threshold(validators: usize) -> usize {
    (2 * validators) / 3 + 1
}

/// A state change made by a ratified proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GovAction {
    ParamSet { key: String, value: u64 },
    ValidatorAdded(Address),
    ValidatorRemoved(Address),
}

impl fmt::Display for GovAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GovAction::ParamSet { key, value } => write!(f, "PARAMS_SET {}={}", key, value),
            GovAction::ValidatorAdded(id) => write!(f, "VALIDATOR_ADD {}", hex::encode(id)),
            GovAction::ValidatorRemoved(id) => write!(f, "VALIDATOR_DEL {}", hex::encode(id)),
        }
    }
}

/// Whether `attestation` by `public_key` endorses `proposal_id` inside the
/// block hashed `block_hash`.
pub fn verify_vote(
    public_key: &[u8],
    proposal_id: &str,
    block_hash: &Sha256Hash,
    attestation: &[u8],
) -> bool {
    verify_signature(
        public_key,
        &vote_attestation_message(proposal_id, block_hash),
        attestation,
    )
    .is_ok()
}

/// Distinct eligible voters per proposal id among the block's votes.
pub fn tally_votes<'a>(block: &'a Block, validators: &ValidatorSet) -> HashMap<&'a str, BTreeSet<Address>> {
    let mut tally: HashMap<&str, BTreeSet<Address>> = HashMap::new();
    for op in &block.ops {
        let OpBody::GovVote { proposal_id, .. } = &op.body else {
            continue;
        };
        if fingerprint(&op.author_public_key) != op.author_id
            || !validators.contains(&op.author_id)
            || !verify_vote(&op.author_public_key, proposal_id, &block.hash, &op.signature)
        {
            continue;
        }
        tally
            .entry(proposal_id.as_str())
            .or_default()
            .insert(op.author_id);
    }
    tally
}

/// Apply every proposal in `block` that its own votes ratify. Eligibility is
/// judged against the validator set as it was before the block.
pub fn apply_block_governance(
    block: &Block,
    params: &mut ProcessParameters,
    validators: &mut ValidatorSet,
) -> Vec<GovAction> {
    let snapshot = validators.clone();
    let needed = threshold(snapshot.len());
    let tally = tally_votes(block, &snapshot);
    let mut applied = Vec::new();

    for op in &block.ops {
        let OpBody::GovPropose {
            proposal_id,
            payload,
            ..
        } = &op.body
        else {
            continue;
        };
        if op.verify().is_err() {
            continue;
        }
        let votes = tally.get(proposal_id.as_str()).map_or(0, |v| v.len());
        if votes < needed {
            continue;
        }
        if let GovPayload::ParamsSet { key, value } = payload {
            if key == DIFFICULTY_BITS_KEY && *value > u64::from(MAX_DIFFICULTY_BITS) {
                warn!(
                    "[governance] ignoring ratified {}={} above the {}-bit maximum (pid={})",
                    key, value, MAX_DIFFICULTY_BITS, proposal_id
                );
                continue;
            }
        }

        let action = match payload {
            GovPayload::ParamsSet { key, value } => {
                params.set(key, *value);
                GovAction::ParamSet {
                    key: key.clone(),
                    value: *value,
                }
            }
            GovPayload::ValidatorAdd { id } => {
                validators.insert(*id);
                GovAction::ValidatorAdded(*id)
            }
            GovPayload::ValidatorDel { id } => {
                validators.remove(id);
                GovAction::ValidatorRemoved(*id)
            }
        };
        info!(
            "[governance] {} ratified by {}/{} validators (pid={}, block={})",
            action,
            votes,
            snapshot.len(),
            proposal_id,
            block.header.index
        );
        applied.push(action);
    }
    applied
}

/// Attach attestations for the votes authored by `keypair` now that the
/// block hash is final. Returns how many votes were sealed.
pub fn seal_votes(block: &mut Block, keypair: &KeyPair) -> Result<usize, ChainError> {
    let own_key = keypair.public_key_bytes();
    let block_hash = block.hash;
    let mut sealed = 0;

    for op in block.ops.iter_mut() {
        let OpBody::GovVote { proposal_id, .. } = &op.body else {
            continue;
        };
        if op.author_public_key.as_slice() != own_key.as_slice() {
            continue;
        }
        let attestation = keypair.sign(&vote_attestation_message(proposal_id, &block_hash))?;
        op.signature = attestation.to_vec();
        sealed += 1;
    }
    Ok(sealed)
}
