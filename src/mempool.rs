//! Fee-ranked admission queue for unconfirmed ops.
//!
//! Entries are indexed twice: by id for lookup, and by `(fee, arrival)` so
//! overflow eviction takes the cheapest, oldest entries without a scan.

use crate::config::MempoolConfig;
use crate::error::MempoolRejection;
use crate::op::{Op, OpId};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

struct Entry {
    op: Op,
    seq: u64,
}

pub struct Mempool {
    config: MempoolConfig,
    entries: HashMap<OpId, Entry>,
    by_fee: BTreeSet<(u64, u64, OpId)>,
    next_seq: u64,
}

impl Mempool {
    pub fn new(config: MempoolConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            by_fee: BTreeSet::new(),
            next_seq: 0,
        }
    }

    /// Queue `op`, evicting a batch of the cheapest entries if capacity is
    /// exceeded. The new op itself may be among those evicted.
    pub fn add(&mut self, op: Op) -> Result<(), MempoolRejection> {
        if self.entries.contains_key(&op.id) {
            return Err(MempoolRejection::Duplicate);
        }
        let fee = op.fee();
        if fee < self.config.min_fee {
            return Err(MempoolRejection::FeeTooLow);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_fee.insert((fee, seq, op.id));
        self.entries.insert(op.id, Entry { op, seq });

        if self.entries.len() > self.config.max_entries {
            self.evict();
        }
        Ok(())
    }

    fn evict(&mut self) {
        let victims: Vec<(u64, u64, OpId)> = self
            .by_fee
            .iter()
            .take(self.config.evict_batch)
            .copied()
            .collect();
        for key in &victims {
            self.by_fee.remove(key);
            self.entries.remove(&key.2);
        }
        debug!(
            "Mempool over capacity: evicted {} op(s), {} remain",
            victims.len(),
            self.entries.len()
        );
    }

    pub fn contains(&self, id: &OpId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &OpId) -> Option<&Op> {
        self.entries.get(id).map(|e| &e.op)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop the given ids; unknown ids are ignored. Returns how many were removed.
    pub fn remove_many<'a>(&mut self, ids: impl IntoIterator<Item = &'a OpId>) -> usize {
        let mut removed = 0;
        for id in ids {
            if let Some(entry) = self.entries.remove(id) {
                self.by_fee.remove(&(entry.op.fee(), entry.seq, *id));
                removed += 1;
            }
        }
        removed
    }

    /// Up to `max` ops for a block template: highest fee first, earlier
    /// timestamp first among equal fees.
    pub fn select(&self, max: usize) -> Vec<Op> {
        let mut ranked: Vec<&Entry> = self.entries.values().collect();
        ranked.sort_by(|a, b| {
            b.op.fee()
                .cmp(&a.op.fee())
                .then_with(|| a.op.timestamp.cmp(&b.op.timestamp))
                .then_with(|| a.seq.cmp(&b.seq))
        });
        ranked.into_iter().take(max).map(|e| e.op.clone()).collect()
    }

    /// All queued ops in arrival order.
    pub fn ops(&self) -> Vec<&Op> {
        let mut ops: Vec<&Entry> = self.entries.values().collect();
        ops.sort_by_key(|e| e.seq);
        ops.into_iter().map(|e| &e.op).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn config(max_entries: usize, evict_batch: usize) -> MempoolConfig {
        MempoolConfig {
            max_entries,
            min_fee: 1,
            evict_batch,
        }
    }

    fn post(keypair: &KeyPair, n: usize, fee: u64, ts: u64) -> Op {
        Op::new_post(keypair, &format!("post {}", n), fee, ts).unwrap()
    }

    #[test]
    fn test_rejects_duplicates_and_low_fee() {
        let keypair = KeyPair::generate().unwrap();
        let mut pool = Mempool::new(config(10, 2));
        let op = post(&keypair, 0, 1, 1);

        assert!(pool.add(op.clone()).is_ok());
        assert_eq!(pool.add(op), Err(MempoolRejection::Duplicate));
        assert_eq!(
            pool.add(post(&keypair, 1, 0, 1)),
            Err(MempoolRejection::FeeTooLow)
        );
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_select_orders_by_fee_then_timestamp() {
        let keypair = KeyPair::generate().unwrap();
        let mut pool = Mempool::new(config(10, 2));
        let cheap = post(&keypair, 0, 1, 10);
        let late_rich = post(&keypair, 1, 5, 30);
        let early_rich = post(&keypair, 2, 5, 20);
        for op in [cheap.clone(), late_rich.clone(), early_rich.clone()] {
            pool.add(op).unwrap();
        }

        let picked: Vec<OpId> = pool.select(10).iter().map(|op| op.id).collect();
        assert_eq!(picked, vec![early_rich.id, late_rich.id, cheap.id]);
        assert_eq!(pool.select(1).len(), 1);
    }

    #[test]
    fn test_overflow_evicts_cheapest_batch() {
        let keypair = KeyPair::generate().unwrap();
        let mut pool = Mempool::new(config(10_000, 500));

        // Fees cycle 1..=20 so several entries share each fee level.
        let ops: Vec<Op> = (0..10_001)
            .map(|i| post(&keypair, i, (i % 20) as u64 + 1, 1_000 + i as u64))
            .collect();
        for op in ops.iter().cloned() {
            pool.add(op).unwrap();
        }

        assert_eq!(pool.len(), 10_001 - 500);

        // Stable order by fee, insertion order within a fee level.
        let mut ranked: Vec<(u64, usize)> = ops.iter().enumerate().map(|(i, op)| (op.fee(), i)).collect();
        ranked.sort();
        for (_, i) in &ranked[..500] {
            assert!(!pool.contains(&ops[*i].id));
        }
        for (_, i) in &ranked[500..] {
            assert!(pool.contains(&ops[*i].id));
        }
    }

    #[test]
    fn test_remove_many_prunes_both_indexes() {
        let keypair = KeyPair::generate().unwrap();
        let mut pool = Mempool::new(config(3, 1));
        let a = post(&keypair, 0, 1, 1);
        let b = post(&keypair, 1, 2, 1);
        pool.add(a.clone()).unwrap();
        pool.add(b.clone()).unwrap();

        assert_eq!(pool.remove_many([&a.id, &[9u8; 32]]), 1);
        assert!(!pool.contains(&a.id));
        assert_eq!(pool.ops().len(), 1);

        // Capacity bookkeeping still works after removal.
        pool.add(post(&keypair, 2, 3, 1)).unwrap();
        pool.add(post(&keypair, 3, 4, 1)).unwrap();
        assert_eq!(pool.len(), 3);
        pool.add(post(&keypair, 4, 5, 1)).unwrap();
        assert_eq!(pool.len(), 3);
        assert!(!pool.contains(&b.id));
    }
}
