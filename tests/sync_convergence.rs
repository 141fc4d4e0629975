//! Integration tests for chain synchronization between in-process nodes
//!
//! Messages are shuttled between two nodes' sync engines directly, so the
//! protocol is exercised without sockets.

use std::time::Duration;
use tweetchain::blockchain::unix_millis;
use tweetchain::config::Config;
use tweetchain::crypto::KeyPair;
use tweetchain::node::Node;
use tweetchain::persistence::InMemoryPersistence;
use tweetchain::sync::{PeerSession, SessionState, SyncAction, WireMessage};

type TestResult = Result<(), Box<dyn std::error::Error>>;

const MAX_ROUNDS: usize = 32;

fn test_config() -> Config {
    let mut config = Config::default();
    config.network.genesis_label = "sync-convergence".to_string();
    config.consensus.difficulty_bits = 2;
    config
}

async fn create_node() -> Result<Node, Box<dyn std::error::Error>> {
    create_node_with(test_config()).await
}

async fn create_node_with(config: Config) -> Result<Node, Box<dyn std::error::Error>> {
    Ok(Node::with_store(
        config,
        KeyPair::generate()?,
        Box::new(InMemoryPersistence::new()),
    )
    .await?)
}

async fn mine_posts(node: &Node, blocks: usize, tag: &str) -> TestResult {
    for i in 0..blocks {
        node.post(&format!("{} {}", tag, i), 1).await?;
        node.mine_once(usize::MAX).await?;
    }
    Ok(())
}

/// Deliver messages back and forth until both sides go quiet. Broadcasts
/// exclude the sender, so with two nodes they reach nobody.
async fn pump(
    a: &Node,
    session_a: &mut PeerSession,
    b: &Node,
    session_b: &mut PeerSession,
    mut to_a: Vec<WireMessage>,
    mut to_b: Vec<WireMessage>,
) -> TestResult {
    for _ in 0..MAX_ROUNDS {
        if to_a.is_empty() && to_b.is_empty() {
            return Ok(());
        }

        let mut next_to_a = Vec::new();
        let mut next_to_b = Vec::new();
        for msg in to_b.drain(..) {
            for action in b.network().engine().handle_message(session_b, msg, unix_millis()).await {
                match action {
                    SyncAction::Reply(reply) => next_to_a.push(reply),
                    SyncAction::Broadcast(_) => {}
                    SyncAction::Disconnect => return Err("b disconnected a".into()),
                }
            }
        }
        for msg in to_a.drain(..) {
            for action in a.network().engine().handle_message(session_a, msg, unix_millis()).await {
                match action {
                    SyncAction::Reply(reply) => next_to_b.push(reply),
                    SyncAction::Broadcast(_) => {}
                    SyncAction::Disconnect => return Err("a disconnected b".into()),
                }
            }
        }
        to_a = next_to_a;
        to_b = next_to_b;
    }
    Err("protocol did not settle".into())
}

/// Run the connection opening in both directions and let the sync settle.
async fn connect_and_sync(a: &Node, b: &Node) -> Result<(PeerSession, PeerSession), Box<dyn std::error::Error>> {
    let mut session_a = a.network().engine().new_session("b");
    let mut session_b = b.network().engine().new_session("a");
    let to_b = a.network().engine().start(&mut session_a, unix_millis()).await?;
    let to_a = b.network().engine().start(&mut session_b, unix_millis()).await?;

    tokio::time::timeout(
        Duration::from_secs(60),
        pump(a, &mut session_a, b, &mut session_b, to_a, to_b),
    )
    .await??;
    Ok((session_a, session_b))
}

#[tokio::test]
async fn test_fresh_node_catches_up() -> TestResult {
    let a = create_node().await?;
    let b = create_node().await?;
    mine_posts(&b, 3, "b").await?;

    let (session_a, session_b) = connect_and_sync(&a, &b).await?;

    assert_eq!(a.height().await, 4);
    assert_eq!(a.tip().await, b.tip().await);
    assert_eq!(session_a.state, SessionState::Synced);
    assert!(session_b.is_authenticated());
    assert_eq!(a.timeline(false).await.timeline.len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_longer_fork_wins_on_both_sides() -> TestResult {
    let a = create_node().await?;
    let b = create_node().await?;
    mine_posts(&a, 2, "a").await?;
    mine_posts(&b, 3, "b").await?;
    let winning_tip = b.tip().await;

    connect_and_sync(&a, &b).await?;

    assert_eq!(a.tip().await, winning_tip);
    assert_eq!(b.tip().await, winning_tip);
    assert_eq!(a.height().await, 4);
    Ok(())
}

#[tokio::test]
async fn test_equal_forks_converge_on_smaller_tip() -> TestResult {
    let a = create_node().await?;
    let b = create_node().await?;
    mine_posts(&a, 2, "a").await?;
    mine_posts(&b, 2, "b").await?;
    let expected = a.tip().await.min(b.tip().await);

    connect_and_sync(&a, &b).await?;

    assert_eq!(a.tip().await, expected);
    assert_eq!(b.tip().await, expected);
    Ok(())
}

#[tokio::test]
async fn test_gossiped_op_is_mined_and_pruned() -> TestResult {
    let a = create_node().await?;
    let b = create_node().await?;
    let (mut session_a, mut session_b) = connect_and_sync(&a, &b).await?;

    let op = a.post("travels", 1).await?;
    pump(
        &a,
        &mut session_a,
        &b,
        &mut session_b,
        Vec::new(),
        vec![WireMessage::Tx { op: Box::new(op.clone()) }],
    )
    .await?;
    assert!(b.mempool().read().await.contains(&op.id));

    let outcome = b.mine_once(usize::MAX).await?;
    pump(
        &a,
        &mut session_a,
        &b,
        &mut session_b,
        vec![WireMessage::NewBlock {
            block: Box::new(outcome.block.clone()),
        }],
        Vec::new(),
    )
    .await?;

    assert_eq!(a.tip().await, outcome.block.hash);
    assert_eq!(a.mempool_len().await, 0);
    Ok(())
}

#[tokio::test]
async fn test_chain_larger_than_one_message_converges() -> TestResult {
    // Roughly ten one-post blocks fit in a CHAIN message of this size.
    let mut config = test_config();
    config.network.max_msg_bytes = 8 * 1024;
    let a = create_node_with(config.clone()).await?;
    let b = create_node_with(config).await?;
    mine_posts(&b, 40, "b").await?;

    let (mut session_a, mut session_b) = connect_and_sync(&a, &b).await?;
    assert_eq!(a.height().await, 41);
    assert_eq!(a.tip().await, b.tip().await);

    b.post("one more", 1).await?;
    let outcome = b.mine_once(usize::MAX).await?;
    pump(
        &a,
        &mut session_a,
        &b,
        &mut session_b,
        vec![WireMessage::NewBlock {
            block: Box::new(outcome.block),
        }],
        Vec::new(),
    )
    .await?;
    assert_eq!(a.height().await, 42);
    assert_eq!(a.tip().await, b.tip().await);
    Ok(())
}
