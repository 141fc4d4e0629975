/// Standalone op verification, separated from the type definitions
use crate::crypto::{fingerprint, verify_signature};
use crate::error::ChainError;
use crate::op::types::{Op, OpBody, MAX_PROPOSAL_ID_LEN};
use secp256k1::constants::{COMPACT_SIGNATURE_SIZE, PUBLIC_KEY_SIZE};

impl Op {
    /// Field shapes every non-genesis op must have before any hashing.
    pub fn check_structure(&self) -> Result<(), ChainError> {
        match &self.body {
            OpBody::Genesis { .. } => {
                return Err(ChainError::InvalidOp(
                    "GENESIS op outside the genesis block".to_string(),
                ))
            }
            OpBody::GovPropose { proposal_id, .. } | OpBody::GovVote { proposal_id, .. } => {
                if proposal_id.is_empty() || proposal_id.len() > MAX_PROPOSAL_ID_LEN {
                    return Err(ChainError::InvalidOp(format!(
                        "Proposal id must be 1..={} bytes",
                        MAX_PROPOSAL_ID_LEN
                    )));
                }
            }
            _ => {}
        }

        if self.author_public_key.len() != PUBLIC_KEY_SIZE {
            return Err(ChainError::InvalidOp("Missing author public key".to_string()));
        }
        // Votes carry an attestation only once sealed into a block.
        if !self.is_vote() && self.signature.len() != COMPACT_SIGNATURE_SIZE {
            return Err(ChainError::InvalidOp("Op not signed".to_string()));
        }
        Ok(())
    }

    /// `author_id` is the key fingerprint and `id` hashes the canonical payload.
    pub fn verify_binding(&self) -> Result<(), ChainError> {
        if fingerprint(&self.author_public_key) != self.author_id {
            return Err(ChainError::InvalidOp(format!(
                "Author id {} does not match public key",
                hex::encode(self.author_id)
            )));
        }
        if crate::crypto::sha256(&self.canonical_payload()) != self.id {
            return Err(ChainError::InvalidOp(format!(
                "Op id {} does not match payload",
                self.id_hex()
            )));
        }
        Ok(())
    }

    /// Checks the author's signature over the canonical payload.
    pub fn verify_signature(&self) -> Result<(), ChainError> {
        verify_signature(
            &self.author_public_key,
            &self.canonical_payload(),
            &self.signature,
        )
    }

    /// Verification that needs no chain context. Votes are checked for id and
    /// author binding only; their attestation depends on the enclosing block.
    pub fn verify(&self) -> Result<(), ChainError> {
        self.check_structure()?;
        self.verify_binding()?;
        if !self.is_vote() {
            self.verify_signature()?;
        }
        Ok(())
    }
}
