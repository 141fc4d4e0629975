use crate::blockchain::{daily_chat_counts, day_key, network_id, unix_millis, Block, ConsensusRules, ConsensusState};
use crate::config::Config;
use crate::crypto::{address_from_hex, sha256, Address, KeyPair, Sha256Hash};
use crate::error::{ChainError, MempoolRejection};
use crate::governance::{seal_votes, GovAction, ProcessParameters, ValidatorSet};
use crate::mempool::Mempool;
use crate::miner::{assemble_block, mine_block, Preemption};
use crate::network::{P2pNetwork, PeerInfo};
use crate::op::{GovPayload, Op, OpId};
use crate::persistence::{JsonFileStore, Persistence};
use crate::sync::{SyncEngine, WireMessage};
use crate::timeline::{rebuild_state, TimelineView};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// File under the data directory holding the node's signing key.
pub const KEYPAIR_FILE: &str = "keypair.json";

/// A block this node mined and appended.
#[derive(Debug, Clone)]
pub struct MiningOutcome {
    pub block: Block,
    pub sealed_votes: usize,
    pub governance: Vec<GovAction>,
}

pub struct Node {
    config: Config,
    keypair: Arc<KeyPair>,
    state: Arc<RwLock<ConsensusState>>,
    mempool: Arc<RwLock<Mempool>>,
    network: Arc<P2pNetwork>,
}

impl Node {
    /// Open a node backed by JSON files under the configured data directory.
    pub async fn open(config: Config) -> Result<Self, ChainError> {
        config.validate()?;
        let data_dir = config.storage.data_dir.clone();
        let store = JsonFileStore::open(&data_dir, &network_id(&config.network.genesis_label))?;
        let keypair = KeyPair::load_or_generate(&data_dir.join(KEYPAIR_FILE))?;
        Self::with_store(config, keypair, Box::new(store)).await
    }

    pub async fn with_store(
        config: Config,
        keypair: KeyPair,
        store: Box<dyn Persistence>,
    ) -> Result<Self, ChainError> {
        let mut bootstrap: Vec<Address> = config
            .consensus
            .bootstrap_validators
            .iter()
            .map(|id| address_from_hex(id))
            .collect::<Result<_, _>>()?;
        if config.consensus.self_validator {
            bootstrap.push(keypair.address());
        }

        let rules = ConsensusRules {
            max_block_ops: config.consensus.max_block_ops,
            max_clock_drift_ms: config.consensus.max_clock_drift_ms,
            daily_chat_limit: config.consensus.daily_chat_limit,
        };
        let state = ConsensusState::open(
            &config.network.genesis_label,
            rules,
            config.consensus.difficulty_bits,
            bootstrap,
            store,
        )?;

        let keypair = Arc::new(keypair);
        let state = Arc::new(RwLock::new(state));
        let mempool = Arc::new(RwLock::new(Mempool::new(config.mempool.clone())));
        let engine = SyncEngine::new(
            Arc::clone(&state),
            Arc::clone(&mempool),
            Arc::clone(&keypair),
            config.network.clone(),
        )
        .await;
        let network = P2pNetwork::new(Arc::new(engine));

        Ok(Self {
            config,
            keypair,
            state,
            mempool,
            network,
        })
    }

    /// Start listening (unless client-only) and dial the bootstrap peers.
    /// Returns the bound listen address.
    pub async fn start(&self) -> Result<Option<SocketAddr>, ChainError> {
        let listening = if self.config.network.client_only {
            info!("[p2p] client-only mode; not accepting connections");
            None
        } else {
            Some(self.network.listen(&self.config.listen_addr()).await?)
        };

        for peer in &self.config.network.bootstrap_peers {
            let network = Arc::clone(&self.network);
            let peer = peer.clone();
            tokio::spawn(async move {
                if let Err(e) = network.connect(&peer).await {
                    warn!("[p2p] bootstrap peer {} unreachable: {}", peer, e);
                }
            });
        }
        Ok(listening)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    pub fn address(&self) -> Address {
        self.keypair.address()
    }

    pub fn network(&self) -> &Arc<P2pNetwork> {
        &self.network
    }

    pub fn state(&self) -> &Arc<RwLock<ConsensusState>> {
        &self.state
    }

    pub fn mempool(&self) -> &Arc<RwLock<Mempool>> {
        &self.mempool
    }

    pub async fn connect(&self, addr: &str) -> Result<(), ChainError> {
        self.network.connect(addr).await
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.network.peers().await
    }

    /// Verify, queue and gossip a locally created op.
    pub async fn submit_op(&self, op: Op) -> Result<(), ChainError> {
        op.verify()?;
        {
            let state = self.state.read().await;
            let mut mempool = self.mempool.write().await;
            if state.is_seen(&op.id) {
                return Err(ChainError::MempoolRejected(MempoolRejection::AlreadyConfirmed));
            }
            mempool
                .add(op.clone())
                .map_err(ChainError::MempoolRejected)?;
        }
        self.network
            .broadcast(&WireMessage::Tx { op: Box::new(op) }, None)
            .await;
        Ok(())
    }

    pub async fn post(&self, text: &str, fee: u64) -> Result<Op, ChainError> {
        let op = Op::new_post(&self.keypair, text, fee, unix_millis())?;
        self.submit_op(op.clone()).await?;
        Ok(op)
    }

    pub async fn reply(&self, target: OpId, text: &str, fee: u64) -> Result<Op, ChainError> {
        let op = Op::new_reply(&self.keypair, target, text, fee, unix_millis())?;
        self.submit_op(op.clone()).await?;
        Ok(op)
    }

    /// Submit a proposal under a fresh id derived from its content, the time
    /// and this node's key.
    pub async fn propose(&self, payload: GovPayload, fee: u64) -> Result<Op, ChainError> {
        let now = unix_millis();
        let proposal_id = proposal_id(&payload, now, &self.address())?;
        let op = Op::new_proposal(&self.keypair, &proposal_id, payload, fee, now)?;
        self.submit_op(op.clone()).await?;
        Ok(op)
    }

    pub async fn vote(&self, proposal_id: &str, fee: u64) -> Result<Op, ChainError> {
        let op = Op::new_vote(&self.keypair, proposal_id, fee, unix_millis());
        self.submit_op(op.clone()).await?;
        Ok(op)
    }

    /// Mine one block from the best-paying queued ops (at most `max_ops`),
    /// append it and announce it.
    pub async fn mine_once(&self, max_ops: usize) -> Result<MiningOutcome, ChainError> {
        let (template, preemption) = {
            let state = self.state.read().await;
            let mempool = self.mempool.read().await;
            let limit = max_ops.min(state.rules().max_block_ops);
            let quota = state.rules().daily_chat_limit;
            let now = unix_millis().max(state.tip().header.timestamp);
            let mut chat_counts = daily_chat_counts(state.chain(), day_key(now));
            let own_key = self.keypair.public_key_bytes();

            let ops: Vec<Op> = mempool
                .select(mempool.len())
                .into_iter()
                .filter(|op| !state.is_seen(&op.id))
                // Only votes this node can seal are worth the space.
                .filter(|op| !op.is_vote() || op.author_public_key.as_slice() == own_key.as_slice())
                .filter(|op| {
                    if !op.is_chat() {
                        return true;
                    }
                    let count = chat_counts.entry(op.author_id).or_insert(0);
                    if *count >= quota {
                        return false;
                    }
                    *count += 1;
                    true
                })
                .take(limit)
                .collect();
            if ops.is_empty() {
                return Err(ChainError::NothingToMine);
            }
            let template = assemble_block(state.tip(), ops, state.active_difficulty(), now);
            (template, Preemption::new(state.generation()))
        };

        info!(
            "[miner] mining block #{} with {} ops at difficulty {}",
            template.header.index,
            template.ops.len(),
            template.header.difficulty
        );
        let mined = tokio::task::spawn_blocking(move || mine_block(template, Some(&preemption)))
            .await
            .map_err(|e| ChainError::WorkerFailed(e.to_string()))?;
        let mut block = match mined {
            Ok(block) => block,
            Err(ChainError::MiningPreempted) => {
                info!("[miner] search abandoned: chain tip moved");
                return Err(ChainError::MiningPreempted);
            }
            Err(e) => return Err(e),
        };
        let sealed_votes = seal_votes(&mut block, &self.keypair)?;

        let governance = {
            let mut state = self.state.write().await;
            if state.tip_hash() != block.header.prev_hash {
                return Err(ChainError::StaleTemplate);
            }
            let appended = match state.append(block.clone(), unix_millis()) {
                Ok(appended) => appended,
                Err(ChainError::Rejected(reason)) => {
                    error!(
                        "[miner] mined block #{} failed validation: {}",
                        block.header.index,
                        reason.code()
                    );
                    return Err(ChainError::MinedBlockInvalid(reason));
                }
                Err(e) => return Err(e),
            };
            self.mempool.write().await.remove_many(&appended.confirmed);
            appended.governance
        };

        info!(
            "[miner] mined #{} ops={} hash={} diff={}",
            block.header.index,
            block.ops.len(),
            crate::crypto::short_hex(&block.hash, 16),
            block.header.difficulty
        );
        self.network
            .broadcast(
                &WireMessage::NewBlock {
                    block: Box::new(block.clone()),
                },
                None,
            )
            .await;

        Ok(MiningOutcome {
            block,
            sealed_votes,
            governance,
        })
    }

    pub async fn height(&self) -> usize {
        self.state.read().await.height()
    }

    pub async fn tip(&self) -> Sha256Hash {
        self.state.read().await.tip_hash()
    }

    pub async fn chain(&self) -> Vec<Block> {
        self.state.read().await.chain().to_vec()
    }

    pub async fn params(&self) -> ProcessParameters {
        self.state.read().await.params().clone()
    }

    pub async fn validators(&self) -> ValidatorSet {
        self.state.read().await.validators().clone()
    }

    pub async fn active_difficulty(&self) -> u32 {
        self.state.read().await.active_difficulty()
    }

    pub async fn mempool_len(&self) -> usize {
        self.mempool.read().await.len()
    }

    pub async fn timeline(&self, active_only: bool) -> TimelineView {
        let state = self.state.read().await;
        rebuild_state(
            state.chain(),
            unix_millis(),
            self.config.consensus.post_ttl_ms,
            active_only,
        )
    }

    /// The whole chain as pretty-printed JSON.
    pub async fn export_chain(&self) -> Result<String, ChainError> {
        let state = self.state.read().await;
        Ok(serde_json::to_string_pretty(state.chain())?)
    }
}

/// Hex SHA-256 over a proposal's content, creation time and proposer.
pub fn proposal_id(payload: &GovPayload, timestamp: u64, proposer: &Address) -> Result<String, ChainError> {
    let material = serde_json::to_vec(&(payload, timestamp, hex::encode(proposer)))?;
    Ok(hex::encode(sha256(&material)))
}
