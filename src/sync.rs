//! Chain synchronization protocol for TweetChain
//!
//! This module is transport-agnostic: it turns one inbound line from a peer
//! into a list of [`SyncAction`]s for the network layer to carry out.
//!
//! - [`WireMessage`]: the newline-delimited JSON records peers exchange
//! - [`PeerGuard`]: per-peer size cap, sliding-window rate limit and ban score
//! - [`PeerSession`]: handshake state machine for one connection
//! - [`SyncEngine`]: message handling against the shared consensus state

use crate::blockchain::{Block, ConsensusState, AdoptOutcome, RejectReason};
use crate::config::NetworkConfig;
use crate::crypto::{fingerprint, short_hex, verify_signature, Address, KeyPair, Sha256Hash};
use crate::error::ChainError;
use crate::mempool::Mempool;
use crate::op::Op;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Ban score added for a line that is not a valid message.
pub const PENALTY_MALFORMED: u32 = 5;
/// Ban score added for exceeding the per-window message budget.
pub const PENALTY_RATE_LIMIT: u32 = 10;
/// Ban score added for a HELLO that fails verification.
pub const PENALTY_BAD_HELLO: u32 = 50;
/// Ban score added for a block or op that fails validation.
pub const PENALTY_INVALID_DATA: u32 = 2;
/// Ban score added for protocol traffic sent before the handshake.
pub const PENALTY_UNAUTHENTICATED: u32 = 5;

/// One protocol record. Serialized as a JSON object whose `type` field
/// names the variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireMessage {
    Hello {
        #[serde(with = "hex::serde")]
        genesis: Sha256Hash,
        #[serde(rename = "nodeId", with = "hex::serde")]
        node_id: Address,
        #[serde(rename = "pub", with = "hex::serde")]
        public_key: Vec<u8>,
        #[serde(with = "hex::serde")]
        sig: Vec<u8>,
        payload: String,
    },
    HelloAck {
        #[serde(with = "hex::serde")]
        genesis: Sha256Hash,
        height: usize,
    },
    Inv {
        height: usize,
        #[serde(with = "hex::serde")]
        tip: Sha256Hash,
    },
    GetChainFrom {
        from: u64,
    },
    Chain {
        blocks: Vec<Block>,
    },
    NewBlock {
        block: Box<Block>,
    },
    Tx {
        op: Box<Op>,
    },
    Error {
        reason: String,
    },
}

impl WireMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Hello { .. } => "HELLO",
            WireMessage::HelloAck { .. } => "HELLO_ACK",
            WireMessage::Inv { .. } => "INV",
            WireMessage::GetChainFrom { .. } => "GET_CHAIN_FROM",
            WireMessage::Chain { .. } => "CHAIN",
            WireMessage::NewBlock { .. } => "NEW_BLOCK",
            WireMessage::Tx { .. } => "TX",
            WireMessage::Error { .. } => "ERROR",
        }
    }

    /// One wire line, newline included.
    pub fn to_line(&self) -> Result<Vec<u8>, ChainError> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

/// Signed body of a HELLO: proves the sender holds the key behind `nodeId`
/// and is on the same network.
#[derive(Debug, Serialize, Deserialize)]
struct HelloPayload {
    #[serde(with = "hex::serde")]
    hello: Sha256Hash,
    ts: u64,
}

/// What the network layer should do after a message was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    /// Send to the originating peer.
    Reply(WireMessage),
    /// Send to every other connected peer.
    Broadcast(WireMessage),
    /// Close the originating connection.
    Disconnect,
}

/// Verdict on an inbound line before it is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    /// Over the rate budget; the line is dropped and penalized.
    Throttled,
    /// Over the size cap; the peer is banned outright.
    Oversize,
}

/// Resource limits and misbehavior score for one connection.
#[derive(Debug, Clone)]
pub struct PeerGuard {
    max_msg_bytes: usize,
    rate_window_ms: u64,
    rate_max_msgs: u32,
    ban_score_limit: u32,
    window_start: Option<u64>,
    window_count: u32,
    score: u32,
}

impl PeerGuard {
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            max_msg_bytes: config.max_msg_bytes,
            rate_window_ms: config.rate_window_ms,
            rate_max_msgs: config.rate_max_msgs,
            ban_score_limit: config.ban_score_limit,
            window_start: None,
            window_count: 0,
            score: 0,
        }
    }

    pub fn admit(&mut self, bytes: usize, now_ms: u64) -> Admission {
        if bytes > self.max_msg_bytes {
            self.score = self.score.max(self.ban_score_limit);
            return Admission::Oversize;
        }

        match self.window_start {
            Some(start) if now_ms.saturating_sub(start) <= self.rate_window_ms => {}
            _ => {
                self.window_start = Some(now_ms);
                self.window_count = 0;
            }
        }
        self.window_count += 1;
        if self.window_count > self.rate_max_msgs {
            self.penalize(PENALTY_RATE_LIMIT);
            return Admission::Throttled;
        }
        Admission::Accept
    }

    /// Add to the ban score; true once the peer should be dropped.
    pub fn penalize(&mut self, points: u32) -> bool {
        self.score = self.score.saturating_add(points);
        self.is_banned()
    }

    pub fn score(&self) -> u32 {
        self.score
    }

    pub fn is_banned(&self) -> bool {
        self.score >= self.ban_score_limit
    }
}

/// Handshake progress of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    /// Our HELLO is out; the peer's has not been verified yet.
    HelloSent,
    /// The peer proved its key and network.
    Authenticated,
    /// Authenticated, and the last inventory exchange left nothing to fetch.
    Synced,
}

#[derive(Debug, Clone)]
pub struct PeerSession {
    pub addr: String,
    pub state: SessionState,
    pub guard: PeerGuard,
    pub remote_id: Option<Address>,
    /// Highest chain height the peer has announced or shown us.
    pub peer_height: usize,
    /// A competing branch still being transferred page by page. Kept until
    /// enough of it arrived to beat the local chain.
    pending: Vec<Block>,
    /// First index of the page most recently requested from the peer.
    requested_from: Option<usize>,
}

impl PeerSession {
    pub fn new(addr: impl Into<String>, config: &NetworkConfig) -> Self {
        Self {
            addr: addr.into(),
            state: SessionState::Connected,
            guard: PeerGuard::new(config),
            remote_id: None,
            peer_height: 0,
            pending: Vec::new(),
            requested_from: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.state, SessionState::Authenticated | SessionState::Synced)
    }
}

/// Protocol logic shared by every connection of a node.
pub struct SyncEngine {
    state: Arc<RwLock<ConsensusState>>,
    mempool: Arc<RwLock<Mempool>>,
    keypair: Arc<KeyPair>,
    config: NetworkConfig,
    genesis_hash: Sha256Hash,
}

impl SyncEngine {
    pub async fn new(
        state: Arc<RwLock<ConsensusState>>,
        mempool: Arc<RwLock<Mempool>>,
        keypair: Arc<KeyPair>,
        config: NetworkConfig,
    ) -> Self {
        let genesis_hash = state.read().await.genesis().hash;
        Self {
            state,
            mempool,
            keypair,
            config,
            genesis_hash,
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn new_session(&self, addr: impl Into<String>) -> PeerSession {
        PeerSession::new(addr, &self.config)
    }

    pub fn hello(&self, now_ms: u64) -> Result<WireMessage, ChainError> {
        let payload = serde_json::to_string(&HelloPayload {
            hello: self.genesis_hash,
            ts: now_ms,
        })?;
        let sig = self.keypair.sign(payload.as_bytes())?;
        Ok(WireMessage::Hello {
            genesis: self.genesis_hash,
            node_id: self.keypair.address(),
            public_key: self.keypair.public_key_bytes().to_vec(),
            sig: sig.to_vec(),
            payload,
        })
    }

    pub async fn inventory(&self) -> WireMessage {
        let state = self.state.read().await;
        WireMessage::Inv {
            height: state.height(),
            tip: state.tip_hash(),
        }
    }

    /// Messages that open a connection in either direction: HELLO, then INV.
    pub async fn start(&self, session: &mut PeerSession, now_ms: u64) -> Result<Vec<WireMessage>, ChainError> {
        let hello = self.hello(now_ms)?;
        session.state = SessionState::HelloSent;
        Ok(vec![hello, self.inventory().await])
    }

    /// Handle one raw line received from `session`'s peer.
    pub async fn handle_line(&self, session: &mut PeerSession, line: &[u8], now_ms: u64) -> Vec<SyncAction> {
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            return Vec::new();
        }

        match session.guard.admit(line.len(), now_ms) {
            Admission::Accept => {}
            Admission::Oversize => {
                warn!(
                    "[sync] banning {}: {}-byte message exceeds limit of {}",
                    session.addr,
                    line.len(),
                    self.config.max_msg_bytes
                );
                return vec![SyncAction::Disconnect];
            }
            Admission::Throttled => {
                debug!("[sync] rate limit hit by {}", session.addr);
                return self.disconnect_if_banned(session);
            }
        }

        match serde_json::from_slice::<WireMessage>(line) {
            Ok(msg) => self.handle_message(session, msg, now_ms).await,
            Err(e) => {
                debug!("[sync] malformed message from {}: {}", session.addr, e);
                self.penalize(session, PENALTY_MALFORMED)
            }
        }
    }

    pub async fn handle_message(&self, session: &mut PeerSession, msg: WireMessage, now_ms: u64) -> Vec<SyncAction> {
        if !session.is_authenticated() && !matches!(msg, WireMessage::Hello { .. } | WireMessage::Error { .. }) {
            debug!("[sync] {} sent {} before HELLO", session.addr, msg.kind());
            return self.penalize(session, PENALTY_UNAUTHENTICATED);
        }

        match msg {
            WireMessage::Hello {
                genesis,
                node_id,
                public_key,
                sig,
                payload,
            } => self.on_hello(session, genesis, node_id, &public_key, &sig, &payload).await,
            WireMessage::HelloAck { genesis, height } => {
                if genesis != self.genesis_hash {
                    warn!("[sync] {} acknowledged a foreign genesis", session.addr);
                    return vec![SyncAction::Disconnect];
                }
                debug!("[sync] {} acknowledged handshake at height {}", session.addr, height);
                session.peer_height = session.peer_height.max(height);
                Vec::new()
            }
            WireMessage::Inv { height, tip } => self.on_inv(session, height, tip).await,
            WireMessage::GetChainFrom { from } => self.on_get_chain_from(from).await,
            WireMessage::Chain { blocks } => self.on_chain(session, blocks, now_ms).await,
            WireMessage::NewBlock { block } => self.on_new_block(session, *block, now_ms).await,
            WireMessage::Tx { op } => self.on_tx(session, *op).await,
            WireMessage::Error { reason } => {
                warn!("[peer-error] {}: {}", session.addr, reason);
                Vec::new()
            }
        }
    }

    async fn on_hello(
        &self,
        session: &mut PeerSession,
        genesis: Sha256Hash,
        node_id: Address,
        public_key: &[u8],
        sig: &[u8],
        payload: &str,
    ) -> Vec<SyncAction> {
        if let Err(reason) = self.check_hello(genesis, node_id, public_key, sig, payload) {
            warn!("[sync] rejecting HELLO from {}: {}", session.addr, reason);
            let mut actions = vec![SyncAction::Reply(WireMessage::Error { reason })];
            session.guard.penalize(PENALTY_BAD_HELLO);
            actions.push(SyncAction::Disconnect);
            return actions;
        }

        if node_id == self.keypair.address() {
            debug!("[sync] {} is ourselves; closing", session.addr);
            return vec![SyncAction::Disconnect];
        }

        if !session.is_authenticated() {
            info!(
                "[sync] peer {} authenticated as {}",
                session.addr,
                short_hex(&node_id, 12)
            );
            session.state = SessionState::Authenticated;
        }
        session.remote_id = Some(node_id);

        let height = self.state.read().await.height();
        vec![SyncAction::Reply(WireMessage::HelloAck {
            genesis: self.genesis_hash,
            height,
        })]
    }

    fn check_hello(
        &self,
        genesis: Sha256Hash,
        node_id: Address,
        public_key: &[u8],
        sig: &[u8],
        payload: &str,
    ) -> Result<(), String> {
        if genesis != self.genesis_hash {
            return Err("genesis mismatch".to_string());
        }
        if fingerprint(public_key) != node_id {
            return Err("nodeId does not match public key".to_string());
        }
        verify_signature(public_key, payload.as_bytes(), sig).map_err(|e| e.to_string())?;
        let body: HelloPayload = serde_json::from_str(payload).map_err(|e| e.to_string())?;
        if body.hello != self.genesis_hash {
            return Err("signed genesis mismatch".to_string());
        }
        Ok(())
    }

    async fn on_inv(&self, session: &mut PeerSession, height: usize, tip: Sha256Hash) -> Vec<SyncAction> {
        session.peer_height = height;
        let state = self.state.read().await;
        let local = state.height();
        let window = self.config.sync_window;

        if height > local {
            let from = local.saturating_sub(window);
            session.requested_from = Some(from);
            return vec![SyncAction::Reply(WireMessage::GetChainFrom { from: from as u64 })];
        }
        if height < local || tip != state.tip_hash() {
            let start = local.saturating_sub(window);
            let blocks = fit_blocks(&state.chain()[start..], self.config.max_msg_bytes);
            return vec![SyncAction::Reply(WireMessage::Chain { blocks })];
        }

        session.state = SessionState::Synced;
        Vec::new()
    }

    async fn on_get_chain_from(&self, from: u64) -> Vec<SyncAction> {
        let state = self.state.read().await;
        let last = state.height() - 1;
        let from = usize::try_from(from).unwrap_or(usize::MAX).min(last);
        let blocks = fit_blocks(&state.chain()[from..], self.config.max_msg_bytes);
        vec![SyncAction::Reply(WireMessage::Chain { blocks })]
    }

    async fn on_chain(&self, session: &mut PeerSession, blocks: Vec<Block>, now_ms: u64) -> Vec<SyncAction> {
        let Some(first) = blocks.first() else {
            return Vec::new();
        };

        let mut state = self.state.write().await;
        let mut candidate = if continues(&session.pending, first) {
            let mut pending = std::mem::take(&mut session.pending);
            pending.truncate(first.header.index as usize);
            pending
        } else {
            session.pending.clear();
            let start = usize::try_from(first.header.index)
                .unwrap_or(usize::MAX)
                .min(state.height());
            state.chain()[..start].to_vec()
        };

        for block in blocks {
            if block.header.index == 0 {
                if block != *state.genesis() {
                    debug!("[sync] {} sent a foreign genesis block", session.addr);
                    return self.penalize(session, PENALTY_INVALID_DATA);
                }
                candidate = vec![block];
                continue;
            }
            let linked = candidate.len() as u64 == block.header.index
                && candidate.last().is_some_and(|prev| prev.hash == block.header.prev_hash);
            if !linked {
                debug!(
                    "[sync] chain from {} does not link at index {}; requesting full chain",
                    session.addr, block.header.index
                );
                session.requested_from = Some(0);
                return vec![SyncAction::Reply(WireMessage::GetChainFrom { from: 0 })];
            }
            candidate.push(block);
        }

        // A page that stops short of the peer's tip is followed by a request
        // for the next one, as long as the last page reached what we asked for.
        let received = candidate.len();
        session.peer_height = session.peer_height.max(received);
        let progressed = session.requested_from.map_or(true, |from| received > from);
        let more = progressed && session.peer_height > received;
        let on_local_chain = state
            .chain()
            .get(received - 1)
            .zip(candidate.last())
            .is_some_and(|(ours, theirs)| ours.hash == theirs.hash);
        let branch = (more && !on_local_chain).then(|| candidate.clone());

        let mut actions = match state.adopt_chain(candidate, now_ms) {
            Ok(AdoptOutcome::Adopted {
                height, confirmed, ..
            }) => {
                let tip = state.tip_hash();
                self.mempool.write().await.remove_many(&confirmed);
                info!("[sync] adopted better chain from {}: height={}", session.addr, height);
                vec![SyncAction::Broadcast(WireMessage::Inv { height, tip })]
            }
            Ok(AdoptOutcome::NotBetter) => {
                // Not ahead yet; hold a diverging branch until the rest arrives.
                session.pending = branch.unwrap_or_default();
                Vec::new()
            }
            Err(ChainError::Rejected(reason)) => {
                drop(state);
                debug!("[sync] chain from {} rejected: {}", session.addr, reason.code());
                session.requested_from = None;
                return self.penalize(session, PENALTY_INVALID_DATA);
            }
            Err(e) => {
                warn!("[sync] failed to adopt chain from {}: {}", session.addr, e);
                return Vec::new();
            }
        };

        if more {
            session.requested_from = Some(received);
            actions.push(SyncAction::Reply(WireMessage::GetChainFrom {
                from: received as u64,
            }));
        } else {
            session.pending.clear();
            session.requested_from = None;
            session.state = SessionState::Synced;
        }
        actions
    }

    async fn on_new_block(&self, session: &mut PeerSession, block: Block, now_ms: u64) -> Vec<SyncAction> {
        let mut state = self.state.write().await;
        if state.contains_block(&block) {
            return Vec::new();
        }

        let local = state.height() as u64;
        let announced = usize::try_from(block.header.index.saturating_add(1)).unwrap_or(usize::MAX);
        session.peer_height = session.peer_height.max(announced);
        if block.header.index != local {
            // Ahead of us or on another branch: reconcile through INV.
            let inv = WireMessage::Inv {
                height: state.height(),
                tip: state.tip_hash(),
            };
            return vec![SyncAction::Reply(inv)];
        }

        match state.append(block.clone(), now_ms) {
            Ok(appended) => {
                self.mempool.write().await.remove_many(&appended.confirmed);
                info!(
                    "[sync] accepted block #{} from {} ({} ops)",
                    block.header.index,
                    session.addr,
                    block.ops.len()
                );
                vec![SyncAction::Broadcast(WireMessage::NewBlock {
                    block: Box::new(block),
                })]
            }
            Err(e) => {
                let inv = WireMessage::Inv {
                    height: state.height(),
                    tip: state.tip_hash(),
                };
                drop(state);
                let mut actions = vec![SyncAction::Reply(inv)];
                match e {
                    ChainError::Rejected(RejectReason::PrevMismatch) => {}
                    ChainError::Rejected(reason) => {
                        debug!("[sync] block from {} rejected: {}", session.addr, reason.code());
                        actions.extend(self.penalize(session, PENALTY_INVALID_DATA));
                    }
                    other => warn!("[sync] failed to append block from {}: {}", session.addr, other),
                }
                actions
            }
        }
    }

    async fn on_tx(&self, session: &mut PeerSession, op: Op) -> Vec<SyncAction> {
        if let Err(e) = op.verify() {
            debug!("[sync] invalid op from {}: {}", session.addr, e);
            return self.penalize(session, PENALTY_INVALID_DATA);
        }

        let state = self.state.read().await;
        let mut mempool = self.mempool.write().await;
        if state.is_seen(&op.id) || mempool.contains(&op.id) {
            return Vec::new();
        }
        match mempool.add(op.clone()) {
            Ok(()) => vec![SyncAction::Broadcast(WireMessage::Tx { op: Box::new(op) })],
            Err(reason) => {
                debug!("[sync] op {} from {} not queued: {}", op.id_hex(), session.addr, reason);
                Vec::new()
            }
        }
    }

    fn penalize(&self, session: &mut PeerSession, points: u32) -> Vec<SyncAction> {
        session.guard.penalize(points);
        self.disconnect_if_banned(session)
    }

    fn disconnect_if_banned(&self, session: &PeerSession) -> Vec<SyncAction> {
        if session.guard.is_banned() {
            warn!(
                "[sync] banning {} (score {})",
                session.addr,
                session.guard.score()
            );
            vec![SyncAction::Disconnect]
        } else {
            Vec::new()
        }
    }
}

/// Whether a CHAIN page starting at `first` extends the partial branch
/// `pending`, possibly overlapping its tail.
fn continues(pending: &[Block], first: &Block) -> bool {
    match usize::try_from(first.header.index) {
        Ok(index) if index > 0 && index <= pending.len() => {
            pending[index - 1].hash == first.header.prev_hash
        }
        _ => false,
    }
}

/// Leading run of `blocks` whose CHAIN message stays under `max_bytes`
/// once framed. Always keeps at least the first block; the receiver asks
/// for the rest with a further GET_CHAIN_FROM.
fn fit_blocks(blocks: &[Block], max_bytes: usize) -> Vec<Block> {
    // `{"type":"CHAIN","blocks":[` ... `]}` plus the newline.
    const ENVELOPE: usize = 32;
    let mut used = ENVELOPE;
    let mut out = Vec::new();
    for block in blocks {
        let size = serde_json::to_vec(block).map(|v| v.len() + 1).unwrap_or(usize::MAX);
        if !out.is_empty() && used.saturating_add(size) > max_bytes {
            break;
        }
        used = used.saturating_add(size);
        out.push(block.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::{unix_millis, ConsensusRules};
    use crate::config::MempoolConfig;
    use crate::miner::{assemble_block, mine_block};
    use crate::persistence::InMemoryPersistence;

    const LABEL: &str = "sync-tests";

    async fn engine() -> SyncEngine {
        engine_with(NetworkConfig::default()).await
    }

    async fn engine_with(config: NetworkConfig) -> SyncEngine {
        let state = ConsensusState::open(
            LABEL,
            ConsensusRules::default(),
            1,
            [],
            Box::new(InMemoryPersistence::new()),
        )
        .unwrap();
        SyncEngine::new(
            Arc::new(RwLock::new(state)),
            Arc::new(RwLock::new(Mempool::new(MempoolConfig::default()))),
            Arc::new(KeyPair::generate().unwrap()),
            config,
        )
        .await
    }

    async fn authenticated(local: &SyncEngine, remote: &SyncEngine) -> PeerSession {
        let mut session = local.new_session("remote");
        let hello = remote.hello(unix_millis()).unwrap();
        let actions = local.handle_message(&mut session, hello, unix_millis()).await;
        assert!(matches!(actions.as_slice(), [SyncAction::Reply(WireMessage::HelloAck { .. })]));
        session
    }

    async fn extend(engine: &SyncEngine, n: usize, tag: &str) {
        let keypair = KeyPair::generate().unwrap();
        let mut state = engine.state.write().await;
        for i in 0..n {
            let op = Op::new_post(&keypair, &format!("{} {}", tag, i), 1, unix_millis()).unwrap();
            let block = mine_block(assemble_block(state.tip(), vec![op], 1, unix_millis()), None).unwrap();
            state.append(block, unix_millis()).unwrap();
        }
    }

    #[test]
    fn test_wire_names() {
        let msg = WireMessage::GetChainFrom { from: 3 };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"GET_CHAIN_FROM","from":3}"#);

        let parsed: WireMessage = serde_json::from_str(r#"{"type":"ERROR","reason":"x"}"#).unwrap();
        assert_eq!(parsed, WireMessage::Error { reason: "x".to_string() });
    }

    #[test]
    fn test_guard_bans_oversize_immediately() {
        let config = NetworkConfig {
            max_msg_bytes: 10,
            ..NetworkConfig::default()
        };
        let mut guard = PeerGuard::new(&config);
        assert_eq!(guard.admit(10, 0), Admission::Accept);
        assert_eq!(guard.admit(11, 0), Admission::Oversize);
        assert!(guard.is_banned());
    }

    #[test]
    fn test_guard_rate_window() {
        let config = NetworkConfig {
            rate_window_ms: 1_000,
            rate_max_msgs: 3,
            ..NetworkConfig::default()
        };
        let mut guard = PeerGuard::new(&config);
        for _ in 0..3 {
            assert_eq!(guard.admit(1, 100), Admission::Accept);
        }
        assert_eq!(guard.admit(1, 200), Admission::Throttled);
        assert_eq!(guard.score(), PENALTY_RATE_LIMIT);
        assert!(!guard.is_banned());

        // A fresh window restores the budget.
        assert_eq!(guard.admit(1, 1_200), Admission::Accept);
    }

    #[test]
    fn test_guard_score_accumulates_to_ban() {
        let mut guard = PeerGuard::new(&NetworkConfig::default());
        for _ in 0..49 {
            assert!(!guard.penalize(PENALTY_INVALID_DATA));
        }
        assert!(guard.penalize(PENALTY_INVALID_DATA));
    }

    #[tokio::test]
    async fn test_valid_hello_authenticates() {
        let a = engine().await;
        let b = engine().await;
        let session = authenticated(&a, &b).await;
        assert_eq!(session.state, SessionState::Authenticated);
        assert_eq!(session.remote_id, Some(b.keypair.address()));
    }

    #[tokio::test]
    async fn test_forged_hello_disconnects() {
        let a = engine().await;
        let b = engine().await;
        let impostor = KeyPair::generate().unwrap();

        let WireMessage::Hello {
            genesis,
            public_key,
            sig,
            payload,
            ..
        } = b.hello(unix_millis()).unwrap()
        else {
            panic!("expected HELLO");
        };
        let forged = WireMessage::Hello {
            genesis,
            node_id: impostor.address(),
            public_key,
            sig,
            payload,
        };

        let mut session = a.new_session("forger");
        let actions = a.handle_message(&mut session, forged, unix_millis()).await;
        assert_eq!(actions.last(), Some(&SyncAction::Disconnect));
        assert_eq!(session.guard.score(), PENALTY_BAD_HELLO);
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn test_hello_from_other_network_disconnects() {
        let a = engine().await;
        let keypair = KeyPair::generate().unwrap();
        let other_genesis = crate::blockchain::genesis_block("elsewhere").hash;
        let payload = serde_json::to_string(&HelloPayload {
            hello: other_genesis,
            ts: 0,
        })
        .unwrap();
        let sig = keypair.sign(payload.as_bytes()).unwrap();
        let hello = WireMessage::Hello {
            genesis: a.genesis_hash,
            node_id: keypair.address(),
            public_key: keypair.public_key_bytes().to_vec(),
            sig: sig.to_vec(),
            payload,
        };

        let mut session = a.new_session("stranger");
        let actions = a.handle_message(&mut session, hello, unix_millis()).await;
        assert_eq!(actions.last(), Some(&SyncAction::Disconnect));
    }

    #[tokio::test]
    async fn test_traffic_before_hello_is_penalized() {
        let a = engine().await;
        let mut session = a.new_session("eager");
        let inv = a.inventory().await;
        let actions = a.handle_message(&mut session, inv, unix_millis()).await;
        assert!(actions.is_empty());
        assert_eq!(session.guard.score(), PENALTY_UNAUTHENTICATED);
    }

    #[tokio::test]
    async fn test_malformed_and_oversize_lines() {
        let config = NetworkConfig {
            max_msg_bytes: 64,
            ..NetworkConfig::default()
        };
        let a = engine_with(config).await;
        let mut session = a.new_session("noisy");

        let actions = a.handle_line(&mut session, b"not json", unix_millis()).await;
        assert!(actions.is_empty());
        assert_eq!(session.guard.score(), PENALTY_MALFORMED);

        let big = vec![b'x'; 65];
        let actions = a.handle_line(&mut session, &big, unix_millis()).await;
        assert_eq!(actions, vec![SyncAction::Disconnect]);
    }

    #[tokio::test]
    async fn test_inv_requests_window_from_taller_peer() {
        let a = engine().await;
        let b = engine().await;
        let mut session = authenticated(&a, &b).await;

        let actions = a
            .handle_message(&mut session, WireMessage::Inv { height: 9, tip: [1u8; 32] }, unix_millis())
            .await;
        assert_eq!(actions, vec![SyncAction::Reply(WireMessage::GetChainFrom { from: 0 })]);
    }

    #[tokio::test]
    async fn test_inv_equal_tip_marks_synced() {
        let a = engine().await;
        let b = engine().await;
        let mut session = authenticated(&a, &b).await;
        let inv = a.inventory().await;
        assert!(a.handle_message(&mut session, inv, unix_millis()).await.is_empty());
        assert_eq!(session.state, SessionState::Synced);
    }

    #[tokio::test]
    async fn test_chain_sync_adopts_longer_chain() {
        let a = engine().await;
        let b = engine().await;
        extend(&b, 3, "b").await;

        let mut session = authenticated(&a, &b).await;
        let blocks = b.state.read().await.chain().to_vec();
        let actions = a
            .handle_message(&mut session, WireMessage::Chain { blocks }, unix_millis())
            .await;

        assert_eq!(a.state.read().await.height(), 4);
        assert!(matches!(
            actions.as_slice(),
            [SyncAction::Broadcast(WireMessage::Inv { height: 4, .. })]
        ));
        assert_eq!(session.state, SessionState::Synced);
    }

    #[tokio::test]
    async fn test_unlinked_chain_requests_full_history() {
        let a = engine().await;
        let b = engine().await;
        extend(&a, 4, "a").await;
        extend(&b, 5, "b").await;

        let mut session = authenticated(&a, &b).await;
        let tail = vec![b.state.read().await.chain()[5].clone()];
        let actions = a
            .handle_message(&mut session, WireMessage::Chain { blocks: tail }, unix_millis())
            .await;

        assert_eq!(actions, vec![SyncAction::Reply(WireMessage::GetChainFrom { from: 0 })]);
        assert_eq!(a.state.read().await.height(), 5);
        assert_eq!(session.guard.score(), 0);
    }

    #[tokio::test]
    async fn test_chain_arrives_in_pages() {
        let a = engine().await;
        let b = engine().await;
        extend(&b, 6, "b").await;
        let full = b.state.read().await.chain().to_vec();

        let mut session = authenticated(&a, &b).await;
        let tip = full[6].hash;
        let actions = a
            .handle_message(&mut session, WireMessage::Inv { height: 7, tip }, unix_millis())
            .await;
        assert_eq!(actions, vec![SyncAction::Reply(WireMessage::GetChainFrom { from: 0 })]);

        let actions = a
            .handle_message(&mut session, WireMessage::Chain { blocks: full[..3].to_vec() }, unix_millis())
            .await;
        assert!(matches!(
            actions.as_slice(),
            [
                SyncAction::Broadcast(WireMessage::Inv { height: 3, .. }),
                SyncAction::Reply(WireMessage::GetChainFrom { from: 3 })
            ]
        ));
        assert_eq!(session.state, SessionState::Authenticated);

        let actions = a
            .handle_message(&mut session, WireMessage::Chain { blocks: full[3..].to_vec() }, unix_millis())
            .await;
        assert!(matches!(
            actions.as_slice(),
            [SyncAction::Broadcast(WireMessage::Inv { height: 7, .. })]
        ));
        assert_eq!(a.state.read().await.tip_hash(), tip);
        assert_eq!(session.state, SessionState::Synced);
    }

    #[tokio::test]
    async fn test_competing_branch_is_held_until_it_wins() {
        let a = engine().await;
        let b = engine().await;
        extend(&a, 5, "a").await;
        extend(&b, 6, "b").await;
        let theirs = b.state.read().await.chain().to_vec();
        let ours = a.state.read().await.tip_hash();

        let mut session = authenticated(&a, &b).await;
        a.handle_message(&mut session, WireMessage::Inv { height: 7, tip: theirs[6].hash }, unix_millis())
            .await;

        // The first page alone is shorter than the local chain.
        let actions = a
            .handle_message(&mut session, WireMessage::Chain { blocks: theirs[..4].to_vec() }, unix_millis())
            .await;
        assert_eq!(actions, vec![SyncAction::Reply(WireMessage::GetChainFrom { from: 4 })]);
        assert_eq!(a.state.read().await.tip_hash(), ours);

        let actions = a
            .handle_message(&mut session, WireMessage::Chain { blocks: theirs[4..].to_vec() }, unix_millis())
            .await;
        assert!(matches!(
            actions.as_slice(),
            [SyncAction::Broadcast(WireMessage::Inv { height: 7, .. })]
        ));
        assert_eq!(a.state.read().await.tip_hash(), theirs[6].hash);
    }

    #[tokio::test]
    async fn test_overstated_height_stops_paging() {
        let a = engine().await;
        let b = engine().await;
        extend(&b, 3, "b").await;
        let full = b.state.read().await.chain().to_vec();

        let mut session = authenticated(&a, &b).await;
        a.handle_message(&mut session, WireMessage::Inv { height: 50, tip: [9u8; 32] }, unix_millis())
            .await;
        let actions = a
            .handle_message(&mut session, WireMessage::Chain { blocks: full.clone() }, unix_millis())
            .await;
        assert!(actions.contains(&SyncAction::Reply(WireMessage::GetChainFrom { from: 4 })));

        // The peer can only repeat its tip; nothing new means no further request.
        let actions = a
            .handle_message(&mut session, WireMessage::Chain { blocks: full[3..].to_vec() }, unix_millis())
            .await;
        assert!(actions.is_empty());
        assert_eq!(session.state, SessionState::Synced);
    }

    #[tokio::test]
    async fn test_new_block_appends_prunes_and_relays() {
        let a = engine().await;
        let b = engine().await;
        let mut session = authenticated(&a, &b).await;

        let keypair = KeyPair::generate().unwrap();
        let op = Op::new_post(&keypair, "hello", 1, unix_millis()).unwrap();
        a.mempool.write().await.add(op.clone()).unwrap();

        let genesis = a.state.read().await.tip().clone();
        let block = mine_block(assemble_block(&genesis, vec![op.clone()], 1, unix_millis()), None).unwrap();
        let msg = WireMessage::NewBlock { block: Box::new(block.clone()) };

        let actions = a.handle_message(&mut session, msg.clone(), unix_millis()).await;
        assert_eq!(actions, vec![SyncAction::Broadcast(msg.clone())]);
        assert!(!a.mempool.read().await.contains(&op.id));

        // Already known: ignored.
        assert!(a.handle_message(&mut session, msg, unix_millis()).await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_new_block_is_penalized() {
        let a = engine().await;
        let b = engine().await;
        let mut session = authenticated(&a, &b).await;

        let genesis = a.state.read().await.tip().clone();
        let mut block = mine_block(assemble_block(&genesis, vec![], 1, unix_millis()), None).unwrap();
        block.header.nonce += 1;

        let actions = a
            .handle_message(&mut session, WireMessage::NewBlock { block: Box::new(block) }, unix_millis())
            .await;
        assert!(matches!(actions.as_slice(), [SyncAction::Reply(WireMessage::Inv { .. })]));
        assert_eq!(session.guard.score(), PENALTY_INVALID_DATA);
    }

    #[tokio::test]
    async fn test_tx_relay() {
        let a = engine().await;
        let b = engine().await;
        let mut session = authenticated(&a, &b).await;

        let keypair = KeyPair::generate().unwrap();
        let op = Op::new_post(&keypair, "relay me", 1, unix_millis()).unwrap();
        let msg = WireMessage::Tx { op: Box::new(op.clone()) };

        let actions = a.handle_message(&mut session, msg.clone(), unix_millis()).await;
        assert_eq!(actions, vec![SyncAction::Broadcast(msg.clone())]);
        assert!(a.mempool.read().await.contains(&op.id));

        // Second delivery is a no-op.
        assert!(a.handle_message(&mut session, msg, unix_millis()).await.is_empty());

        let mut forged = op;
        forged.signature[0] ^= 0xff;
        let actions = a
            .handle_message(&mut session, WireMessage::Tx { op: Box::new(forged) }, unix_millis())
            .await;
        assert!(actions.is_empty());
        assert_eq!(session.guard.score(), PENALTY_INVALID_DATA);
    }

    #[test]
    fn test_fit_blocks_respects_byte_cap() {
        let genesis = crate::blockchain::genesis_block(LABEL);
        let one = serde_json::to_vec(&genesis).unwrap().len();
        let blocks = vec![genesis.clone(), genesis.clone(), genesis];
        assert_eq!(fit_blocks(&blocks, 1).len(), 1);
        assert_eq!(fit_blocks(&blocks, 32 + 2 * (one + 1)).len(), 2);
        assert_eq!(fit_blocks(&blocks, usize::MAX).len(), 3);
    }
}
