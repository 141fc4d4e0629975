//! Read model over the accepted chain: posts, their replies, and a
//! newest-first timeline.

use crate::blockchain::Block;
use crate::crypto::Address;
use crate::op::{OpBody, OpId};
use std::collections::HashMap;

/// A post or reply as shown to users.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub id: OpId,
    pub author_id: Address,
    pub text: String,
    pub timestamp: u64,
    pub fee: u64,
    pub block_index: u64,
}

#[derive(Debug, Clone, Default)]
pub struct TimelineView {
    pub posts: HashMap<OpId, Entry>,
    /// Replies per post, oldest first.
    pub replies_by_target: HashMap<OpId, Vec<Entry>>,
    /// Posts, newest first.
    pub timeline: Vec<Entry>,
}

impl TimelineView {
    pub fn replies(&self, target: &OpId) -> &[Entry] {
        self.replies_by_target
            .get(target)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Full id of the single post whose hex id starts with `prefix`.
    pub fn resolve_prefix(&self, prefix: &str) -> Option<OpId> {
        let prefix = prefix.to_ascii_lowercase();
        let mut matches = self
            .posts
            .keys()
            .filter(|id| hex::encode(id).starts_with(&prefix));
        match (matches.next(), matches.next()) {
            (Some(id), None) => Some(*id),
            _ => None,
        }
    }
}

/// Rebuild the view from `chain`. With `active_only`, blocks older than
/// `ttl_ms` at `now_ms` contribute nothing. Replies are kept only when their
/// target post is part of the view.
pub fn rebuild_state(chain: &[Block], now_ms: u64, ttl_ms: u64, active_only: bool) -> TimelineView {
    let visible = || {
        chain
            .iter()
            .filter(move |b| !active_only || now_ms.saturating_sub(b.header.timestamp) <= ttl_ms)
    };

    let mut view = TimelineView::default();
    for block in visible() {
        for op in &block.ops {
            if let OpBody::Post { text, fee } = &op.body {
                view.posts.insert(
                    op.id,
                    Entry {
                        id: op.id,
                        author_id: op.author_id,
                        text: text.clone(),
                        timestamp: op.timestamp,
                        fee: *fee,
                        block_index: block.header.index,
                    },
                );
            }
        }
    }

    for block in visible() {
        for op in &block.ops {
            let OpBody::Reply {
                reply_target,
                text,
                fee,
            } = &op.body
            else {
                continue;
            };
            if !view.posts.contains_key(reply_target) {
                continue;
            }
            view.replies_by_target
                .entry(*reply_target)
                .or_default()
                .push(Entry {
                    id: op.id,
                    author_id: op.author_id,
                    text: text.clone(),
                    timestamp: op.timestamp,
                    fee: *fee,
                    block_index: block.header.index,
                });
        }
    }

    for replies in view.replies_by_target.values_mut() {
        replies.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    }

    view.timeline = view.posts.values().cloned().collect();
    view.timeline
        .sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
    view
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::genesis_block;
    use crate::crypto::KeyPair;
    use crate::op::Op;

    const HOUR: u64 = 60 * 60 * 1000;
    const TTL: u64 = 24 * HOUR;

    /// Unmined block: the read model does not check proof-of-work.
    fn block_at(prev: &Block, ops: Vec<Op>, timestamp: u64) -> Block {
        Block::new(prev, ops, 1, timestamp)
    }

    #[test]
    fn test_orders_posts_and_replies() {
        let keypair = KeyPair::generate().unwrap();
        let now = 100 * HOUR;
        let first = Op::new_post(&keypair, "first", 1, now - 3 * HOUR).unwrap();
        let second = Op::new_post(&keypair, "second", 1, now - 2 * HOUR).unwrap();
        let late_reply = Op::new_reply(&keypair, first.id, "late", 1, now - HOUR).unwrap();
        let early_reply = Op::new_reply(&keypair, first.id, "early", 1, now - 2 * HOUR).unwrap();

        let genesis = genesis_block("timeline-tests");
        let b1 = block_at(&genesis, vec![first.clone(), second.clone()], now - 2 * HOUR);
        let b2 = block_at(&b1, vec![late_reply, early_reply], now - HOUR);

        let view = rebuild_state(&[genesis, b1, b2], now, TTL, true);
        let order: Vec<&str> = view.timeline.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(order, vec!["second", "first"]);

        let replies: Vec<&str> = view.replies(&first.id).iter().map(|e| e.text.as_str()).collect();
        assert_eq!(replies, vec!["early", "late"]);
        assert!(view.replies(&second.id).is_empty());
    }

    #[test]
    fn test_expired_target_hides_reply_only_in_active_view() {
        let keypair = KeyPair::generate().unwrap();
        let now = 100 * HOUR;
        let old_post = Op::new_post(&keypair, "old", 1, now - 30 * HOUR).unwrap();
        let reply = Op::new_reply(&keypair, old_post.id, "still talking", 1, now - HOUR).unwrap();

        let genesis = genesis_block("timeline-tests");
        let b1 = block_at(&genesis, vec![old_post.clone()], now - 30 * HOUR);
        let b2 = block_at(&b1, vec![reply.clone()], now - HOUR);
        let chain = vec![genesis, b1, b2];

        let active = rebuild_state(&chain, now, TTL, true);
        assert!(!active.posts.contains_key(&old_post.id));
        assert!(active.replies_by_target.values().flatten().all(|e| e.id != reply.id));

        let all = rebuild_state(&chain, now, TTL, false);
        assert!(all.posts.contains_key(&old_post.id));
        assert_eq!(all.replies(&old_post.id)[0].id, reply.id);
    }

    #[test]
    fn test_resolve_prefix() {
        let keypair = KeyPair::generate().unwrap();
        let post = Op::new_post(&keypair, "findable", 1, 5).unwrap();
        let genesis = genesis_block("timeline-tests");
        let b1 = block_at(&genesis, vec![post.clone()], 10);
        let view = rebuild_state(&[genesis, b1], 10, TTL, false);

        assert_eq!(view.resolve_prefix(&post.id_hex()[..8]), Some(post.id));
        assert_eq!(view.resolve_prefix("zz"), None);
    }
}
