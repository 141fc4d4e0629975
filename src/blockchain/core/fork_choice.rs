//! Fork-choice: a total order over competing chains.

use crate::blockchain::core::chain::Block;
use std::cmp::Ordering;

/// Sum of declared per-block difficulty bits.
pub fn total_difficulty(chain: &[Block]) -> u64 {
    chain.iter().map(|b| u64::from(b.header.difficulty)).sum()
}

/// `Ordering::Greater` when `a` is preferred over `b`: more total
/// difficulty, then more blocks, then the lexicographically smaller tip hash.
pub fn compare_chains(a: &[Block], b: &[Block]) -> Ordering {
    total_difficulty(a)
        .cmp(&total_difficulty(b))
        .then_with(|| a.len().cmp(&b.len()))
        .then_with(|| {
            let tip_a = a.last().map(|blk| blk.hash);
            let tip_b = b.last().map(|blk| blk.hash);
            // Smaller hash wins, so the comparison is reversed.
            tip_b.cmp(&tip_a)
        })
}

/// Strict improvement only; an equal chain is never adopted.
pub fn is_better_chain(candidate: &[Block], current: &[Block]) -> bool {
    compare_chains(candidate, current) == Ordering::Greater
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::core::chain::{genesis_block, BlockHeader};

    fn block(index: u64, difficulty: u32, tip: u8) -> Block {
        Block {
            header: BlockHeader {
                index,
                prev_hash: [0u8; 32],
                timestamp: 0,
                difficulty,
                ops_root: [0u8; 32],
                nonce: 0,
            },
            ops: vec![],
            hash: [tip; 32],
        }
    }

    fn chain(difficulties: &[u32], tip: u8) -> Vec<Block> {
        let mut chain = vec![genesis_block("fork-choice")];
        for (i, d) in difficulties.iter().enumerate() {
            chain.push(block(i as u64 + 1, *d, tip));
        }
        chain
    }

    #[test]
    fn test_more_work_beats_more_blocks() {
        let heavy = chain(&[20], 5);
        let long = chain(&[4, 4, 4], 5);
        assert!(is_better_chain(&heavy, &long));
        assert!(!is_better_chain(&long, &heavy));
    }

    #[test]
    fn test_length_breaks_work_tie() {
        let short = chain(&[8], 5);
        let long = chain(&[4, 4], 5);
        assert!(is_better_chain(&long, &short));
    }

    #[test]
    fn test_smaller_tip_hash_breaks_full_tie() {
        let low = chain(&[4, 4], 1);
        let high = chain(&[4, 4], 9);
        assert_eq!(compare_chains(&low, &high), Ordering::Greater);
        assert!(is_better_chain(&low, &high));
        assert!(!is_better_chain(&high, &low));
    }

    #[test]
    fn test_equal_chain_is_not_better() {
        let a = chain(&[4, 4], 3);
        assert_eq!(compare_chains(&a, &a.clone()), Ordering::Equal);
        assert!(!is_better_chain(&a, &a.clone()));
    }

    #[test]
    fn test_order_is_antisymmetric_and_transitive() {
        let chains = vec![
            chain(&[4], 1),
            chain(&[4], 2),
            chain(&[2, 2], 3),
            chain(&[2, 2], 0),
            chain(&[6], 7),
            chain(&[1, 1, 1, 1], 4),
            chain(&[5, 1], 9),
        ];

        for a in &chains {
            for b in &chains {
                assert_eq!(compare_chains(a, b), compare_chains(b, a).reverse());
                for c in &chains {
                    if is_better_chain(a, b) && is_better_chain(b, c) {
                        assert!(is_better_chain(a, c));
                    }
                }
            }
        }
    }
}
