use crate::blockchain::core::merkle::ops_root;
use crate::crypto::{sha256, Sha256Hash};
use crate::op::Op;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Timestamp of the hardcoded genesis block (ms since the Unix epoch).
pub const GENESIS_TIMESTAMP: u64 = 1_720_000_000_000;
pub const GENESIS_DIFFICULTY: u32 = 1;

/// Widest possible target: every bit of a SHA-256 digest.
pub const MAX_DIFFICULTY_BITS: u32 = 256;

/// Current wall-clock time in milliseconds.
pub fn unix_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub index: u64,
    #[serde(with = "hex::serde")]
    pub prev_hash: Sha256Hash,
    pub timestamp: u64,
    pub difficulty: u32,
    #[serde(with = "hex::serde")]
    pub ops_root: Sha256Hash,
    pub nonce: u64,
}

impl BlockHeader {
    pub fn hash(&self) -> Sha256Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.index.to_le_bytes());
        hasher.update(self.prev_hash);
        hasher.update(self.timestamp.to_le_bytes());
        hasher.update(self.difficulty.to_le_bytes());
        hasher.update(self.ops_root);
        hasher.update(self.nonce.to_le_bytes());
        hasher.finalize().into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    #[serde(flatten)]
    pub header: BlockHeader,
    pub ops: Vec<Op>,
    /// Declared header hash; validation recomputes it.
    #[serde(with = "hex::serde")]
    pub hash: Sha256Hash,
}

impl Block {
    /// Unsealed block on top of `prev`, nonce zero.
    pub fn new(prev: &Block, ops: Vec<Op>, difficulty: u32, timestamp: u64) -> Self {
        let header = BlockHeader {
            index: prev.header.index + 1,
            prev_hash: prev.hash,
            timestamp,
            difficulty,
            ops_root: ops_root(&ops),
            nonce: 0,
        };
        let hash = header.hash();
        Block { header, ops, hash }
    }

    pub fn index(&self) -> u64 {
        self.header.index
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// Whether the declared hash matches the header.
    pub fn hash_is_consistent(&self) -> bool {
        self.header.hash() == self.hash
    }
}

/// Block 0 for the network named by `label`. It is a constant, never mined.
pub fn genesis_block(label: &str) -> Block {
    let ops = vec![Op::genesis(label)];
    let header = BlockHeader {
        index: 0,
        prev_hash: [0u8; 32],
        timestamp: GENESIS_TIMESTAMP,
        difficulty: GENESIS_DIFFICULTY,
        ops_root: ops_root(&ops),
        nonce: 0,
    };
    let hash = header.hash();
    Block { header, ops, hash }
}

/// Identifier namespacing on-disk state: hex SHA-256 of the genesis label.
pub fn network_id(label: &str) -> String {
    hex::encode(sha256(label.as_bytes()))
}

/// True when the leading `bits` bits of `hash` are all zero.
pub fn meets_difficulty(hash: &Sha256Hash, bits: u32) -> bool {
    if bits > MAX_DIFFICULTY_BITS {
        return false;
    }
    let full_bytes = (bits / 8) as usize;
    let partial_bits = bits % 8;

    if hash[..full_bytes].iter().any(|b| *b != 0) {
        return false;
    }
    if partial_bits == 0 {
        return true;
    }
    let mask = 0xFFu8 << (8 - partial_bits);
    hash[full_bytes] & mask == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_is_deterministic_per_label() {
        assert_eq!(genesis_block("a"), genesis_block("a"));
        assert_ne!(genesis_block("a").hash, genesis_block("b").hash);

        let genesis = genesis_block("p2p-tweet-pro");
        assert_eq!(genesis.header.index, 0);
        assert_eq!(genesis.header.prev_hash, [0u8; 32]);
        assert_eq!(genesis.header.timestamp, GENESIS_TIMESTAMP);
        assert_eq!(genesis.header.difficulty, 1);
        assert_eq!(genesis.ops[0].id, sha256(b"p2p-tweet-pro"));
        assert!(genesis.hash_is_consistent());
        assert_eq!(network_id("p2p-tweet-pro"), genesis.ops[0].id_hex());
    }

    #[test]
    fn test_header_hash_covers_every_field() {
        let genesis = genesis_block("net");
        let base = genesis.header.clone();

        let mut changed = base.clone();
        changed.nonce += 1;
        assert_ne!(changed.hash(), base.hash());

        let mut changed = base.clone();
        changed.ops_root = [9u8; 32];
        assert_ne!(changed.hash(), base.hash());

        let mut changed = base.clone();
        changed.difficulty += 1;
        assert_ne!(changed.hash(), base.hash());
    }

    #[test]
    fn test_meets_difficulty_bit_test() {
        let mut hash = [0xFFu8; 32];
        assert!(meets_difficulty(&hash, 0));
        assert!(!meets_difficulty(&hash, 1));

        hash[0] = 0x00;
        hash[1] = 0x1F;
        assert!(meets_difficulty(&hash, 8));
        assert!(meets_difficulty(&hash, 11));
        assert!(!meets_difficulty(&hash, 12));

        assert!(meets_difficulty(&[0u8; 32], 256));
        assert!(!meets_difficulty(&[0u8; 32], 257));
    }

    #[test]
    fn test_block_json_is_flat() {
        let genesis = genesis_block("net");
        let json = serde_json::to_value(&genesis).unwrap();
        assert_eq!(json["index"], 0);
        assert_eq!(json["prevHash"], "0".repeat(64));
        assert_eq!(json["hash"], genesis.hash_hex());
        assert_eq!(json["ops"][0]["type"], "GENESIS");

        let back: Block = serde_json::from_value(json).unwrap();
        assert_eq!(back, genesis);
    }
}
