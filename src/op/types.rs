/// Op types for TweetChain
use crate::crypto::{sha256, Address, KeyPair, Sha256Hash};
use crate::error::ChainError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Content digest identifying an op.
pub type OpId = Sha256Hash;

/// Longest accepted governance proposal id.
pub const MAX_PROPOSAL_ID_LEN: usize = 64;

/// Change requested by a governance proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GovPayload {
    ParamsSet {
        key: String,
        value: u64,
    },
    ValidatorAdd {
        #[serde(with = "hex::serde")]
        id: Address,
    },
    ValidatorDel {
        #[serde(with = "hex::serde")]
        id: Address,
    },
}

impl GovPayload {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            GovPayload::ParamsSet { key, value } => {
                buf.push(0);
                put_bytes(buf, key.as_bytes());
                buf.extend_from_slice(&value.to_le_bytes());
            }
            GovPayload::ValidatorAdd { id } => {
                buf.push(1);
                buf.extend_from_slice(id);
            }
            GovPayload::ValidatorDel { id } => {
                buf.push(2);
                buf.extend_from_slice(id);
            }
        }
    }
}

impl fmt::Display for GovPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GovPayload::ParamsSet { key, value } => write!(f, "PARAMS_SET {}={}", key, value),
            GovPayload::ValidatorAdd { id } => write!(f, "VALIDATOR_ADD {}", hex::encode(id)),
            GovPayload::ValidatorDel { id } => write!(f, "VALIDATOR_DEL {}", hex::encode(id)),
        }
    }
}

/// Type-specific part of an op. The `type` tag sits next to the common
/// fields on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpBody {
    Post {
        text: String,
        fee: u64,
    },
    #[serde(rename_all = "camelCase")]
    Reply {
        #[serde(with = "hex::serde")]
        reply_target: OpId,
        text: String,
        fee: u64,
    },
    #[serde(rename_all = "camelCase")]
    GovPropose {
        proposal_id: String,
        payload: GovPayload,
        fee: u64,
    },
    #[serde(rename_all = "camelCase")]
    GovVote {
        proposal_id: String,
        fee: u64,
    },
    Genesis {
        note: String,
    },
}

/// A signed application event.
///
/// For every kind except `GOV_VOTE`, `signature` covers the canonical
/// payload and `id` is its SHA-256. A vote's `signature` is an attestation
/// over the proposal id and the hash of the block carrying the vote, so it
/// is attached only once that hash is known; its `id` commits to the rest
/// of the vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Op {
    #[serde(with = "hex::serde")]
    pub id: OpId,
    pub timestamp: u64,
    #[serde(with = "hex::serde")]
    pub author_id: Address,
    #[serde(with = "hex::serde")]
    pub author_public_key: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
    #[serde(flatten)]
    pub body: OpBody,
}

/// Length-prefixed field, so adjacent variable-size fields cannot be
/// shifted into each other.
fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

/// Canonical bytes hashed into an op id and, except for votes, signed by
/// the author. This is the only place these bytes are assembled.
pub fn canonical_payload(author_public_key: &[u8], timestamp: u64, body: &OpBody) -> Vec<u8> {
    let mut message = Vec::new();
    let header = |message: &mut Vec<u8>, tag: &[u8], fee: u64| {
        message.extend_from_slice(tag);
        put_bytes(message, author_public_key);
        message.extend_from_slice(&timestamp.to_le_bytes());
        message.extend_from_slice(&fee.to_le_bytes());
    };

    match body {
        OpBody::Post { text, fee } => {
            header(&mut message, b"POST:", *fee);
            put_bytes(&mut message, text.as_bytes());
        }
        OpBody::Reply {
            reply_target,
            text,
            fee,
        } => {
            header(&mut message, b"REPLY:", *fee);
            message.extend_from_slice(reply_target);
            put_bytes(&mut message, text.as_bytes());
        }
        OpBody::GovPropose {
            proposal_id,
            payload,
            fee,
        } => {
            header(&mut message, b"GOV_PROPOSE:", *fee);
            put_bytes(&mut message, proposal_id.as_bytes());
            payload.encode_into(&mut message);
        }
        OpBody::GovVote { proposal_id, fee } => {
            header(&mut message, b"GOV_VOTE:", *fee);
            put_bytes(&mut message, proposal_id.as_bytes());
        }
        // The genesis op id is the hash of the network label alone.
        OpBody::Genesis { note } => message.extend_from_slice(note.as_bytes()),
    }
    message
}

/// Bytes a validator signs to endorse `proposal_id` inside the block whose
/// hash is `block_hash`.
pub fn vote_attestation_message(proposal_id: &str, block_hash: &Sha256Hash) -> Vec<u8> {
    let mut message = Vec::new();
    message.extend_from_slice(b"GOV_VOTE_ATTEST:");
    put_bytes(&mut message, proposal_id.as_bytes());
    message.extend_from_slice(block_hash);
    message
}

impl Op {
    /// The fixed op carried by block 0.
    pub fn genesis(label: &str) -> Self {
        let body = OpBody::Genesis {
            note: label.to_string(),
        };
        Op {
            id: sha256(&canonical_payload(&[], 0, &body)),
            timestamp: 0,
            author_id: [0u8; 32],
            author_public_key: Vec::new(),
            signature: Vec::new(),
            body,
        }
    }

    pub fn new_post(keypair: &KeyPair, text: &str, fee: u64, timestamp: u64) -> Result<Self, ChainError> {
        Self::signed(
            keypair,
            timestamp,
            OpBody::Post {
                text: text.to_string(),
                fee,
            },
        )
    }

    pub fn new_reply(
        keypair: &KeyPair,
        reply_target: OpId,
        text: &str,
        fee: u64,
        timestamp: u64,
    ) -> Result<Self, ChainError> {
        Self::signed(
            keypair,
            timestamp,
            OpBody::Reply {
                reply_target,
                text: text.to_string(),
                fee,
            },
        )
    }

    pub fn new_proposal(
        keypair: &KeyPair,
        proposal_id: &str,
        payload: GovPayload,
        fee: u64,
        timestamp: u64,
    ) -> Result<Self, ChainError> {
        Self::signed(
            keypair,
            timestamp,
            OpBody::GovPropose {
                proposal_id: proposal_id.to_string(),
                payload,
                fee,
            },
        )
    }

    /// A vote starts without an attestation; the miner holding the voter's
    /// key seals it once the block hash is fixed.
    pub fn new_vote(keypair: &KeyPair, proposal_id: &str, fee: u64, timestamp: u64) -> Self {
        let author_public_key = keypair.public_key_bytes().to_vec();
        let body = OpBody::GovVote {
            proposal_id: proposal_id.to_string(),
            fee,
        };
        Op {
            id: sha256(&canonical_payload(&author_public_key, timestamp, &body)),
            timestamp,
            author_id: keypair.address(),
            author_public_key,
            signature: Vec::new(),
            body,
        }
    }

    fn signed(keypair: &KeyPair, timestamp: u64, body: OpBody) -> Result<Self, ChainError> {
        let author_public_key = keypair.public_key_bytes().to_vec();
        let payload = canonical_payload(&author_public_key, timestamp, &body);
        let signature = keypair.sign(&payload)?;
        Ok(Op {
            id: sha256(&payload),
            timestamp,
            author_id: keypair.address(),
            author_public_key,
            signature: signature.to_vec(),
            body,
        })
    }

    pub fn canonical_payload(&self) -> Vec<u8> {
        canonical_payload(&self.author_public_key, self.timestamp, &self.body)
    }

    pub fn id_hex(&self) -> String {
        hex::encode(self.id)
    }

    /// Self-reported fee; genesis carries none.
    pub fn fee(&self) -> u64 {
        match &self.body {
            OpBody::Post { fee, .. }
            | OpBody::Reply { fee, .. }
            | OpBody::GovPropose { fee, .. }
            | OpBody::GovVote { fee, .. } => *fee,
            OpBody::Genesis { .. } => 0,
        }
    }

    /// Posts and replies count against the daily chat quota.
    pub fn is_chat(&self) -> bool {
        matches!(self.body, OpBody::Post { .. } | OpBody::Reply { .. })
    }

    pub fn is_vote(&self) -> bool {
        matches!(self.body, OpBody::GovVote { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self.body {
            OpBody::Post { .. } => "POST",
            OpBody::Reply { .. } => "REPLY",
            OpBody::GovPropose { .. } => "GOV_PROPOSE",
            OpBody::GovVote { .. } => "GOV_VOTE",
            OpBody::Genesis { .. } => "GENESIS",
        }
    }

    /// Text of a post or reply.
    pub fn text(&self) -> Option<&str> {
        match &self.body {
            OpBody::Post { text, .. } | OpBody::Reply { text, .. } => Some(text),
            _ => None,
        }
    }
}
