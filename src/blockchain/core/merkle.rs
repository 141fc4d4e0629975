//! Merkle commitment over an ordered list of op ids.

use crate::crypto::{sha256, Sha256Hash};
use crate::op::{Op, OpId};
use sha2::{Digest, Sha256};

/// Root committed for an empty list.
pub fn empty_merkle_root() -> Sha256Hash {
    sha256(b"[]")
}

/// Leaves are `sha256(id)`; each layer hashes adjacent pairs left to right,
/// pairing a trailing odd node with itself. Order-sensitive.
pub fn merkle_root(ids: &[OpId]) -> Sha256Hash {
    if ids.is_empty() {
        return empty_merkle_root();
    }

    let mut layer: Vec<Sha256Hash> = ids.iter().map(|id| sha256(id)).collect();
    while layer.len() > 1 {
        layer = layer
            .chunks(2)
            .map(|pair| {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                let mut hasher = Sha256::new();
                hasher.update(left);
                hasher.update(right);
                hasher.finalize().into()
            })
            .collect();
    }
    layer[0]
}

pub fn ops_root(ops: &[Op]) -> Sha256Hash {
    let ids: Vec<OpId> = ops.iter().map(|op| op.id).collect();
    merkle_root(&ids)
}
