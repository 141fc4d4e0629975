//! TCP transport for the sync protocol.
//!
//! Every connection gets a reader task that frames newline-delimited lines
//! and feeds them to the [`SyncEngine`] in order, and a writer task draining
//! an outbound queue. Either task ending tears the connection down.

use crate::blockchain::unix_millis;
use crate::crypto::{short_hex, Address};
use crate::error::ChainError;
use crate::sync::{SyncAction, SyncEngine, WireMessage};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Outbound lines buffered per peer before new ones are dropped.
pub const OUTBOUND_QUEUE: usize = 256;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type Line = Arc<Vec<u8>>;

#[derive(Debug, Clone)]
struct PeerHandle {
    addr: String,
    inbound: bool,
    remote_id: Option<Address>,
    outbound: mpsc::Sender<Line>,
}

/// Snapshot of one live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub addr: String,
    pub inbound: bool,
    pub remote_id: Option<Address>,
}

impl std::fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let direction = if self.inbound { "in" } else { "out" };
        match &self.remote_id {
            Some(id) => write!(f, "{} ({}, {})", self.addr, direction, short_hex(id, 12)),
            None => write!(f, "{} ({}, unauthenticated)", self.addr, direction),
        }
    }
}

pub struct P2pNetwork {
    engine: Arc<SyncEngine>,
    peers: RwLock<HashMap<u64, PeerHandle>>,
    dialed: RwLock<HashSet<String>>,
    next_peer_id: AtomicU64,
}

impl P2pNetwork {
    pub fn new(engine: Arc<SyncEngine>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            peers: RwLock::new(HashMap::new()),
            dialed: RwLock::new(HashSet::new()),
            next_peer_id: AtomicU64::new(1),
        })
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Bind `addr` and accept peers in the background. Returns the bound
    /// address, which differs from `addr` when port 0 was requested.
    pub async fn listen(self: &Arc<Self>, addr: &str) -> Result<SocketAddr, ChainError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ChainError::NetworkError(format!("Failed to bind {}: {}", addr, e)))?;
        let local = listener.local_addr()?;
        info!("[p2p] listening on {}", local);

        let network = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        network.spawn_peer(stream, remote.to_string(), true).await;
                    }
                    Err(e) => {
                        warn!("[p2p] accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        Ok(local)
    }

    /// Dial `addr` unless a connection to it was already made.
    pub async fn connect(self: &Arc<Self>, addr: &str) -> Result<(), ChainError> {
        if !self.dialed.write().await.insert(addr.to_string()) {
            debug!("[p2p] already connected to {}", addr);
            return Ok(());
        }

        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.dialed.write().await.remove(addr);
                return Err(ChainError::NetworkError(format!("Failed to connect to {}: {}", addr, e)));
            }
            Err(_) => {
                self.dialed.write().await.remove(addr);
                return Err(ChainError::NetworkError(format!("Timed out connecting to {}", addr)));
            }
        };
        info!("[p2p] connected to {}", addr);
        self.spawn_peer(stream, addr.to_string(), false).await;
        Ok(())
    }

    /// Queue `msg` for every peer except `except`. Messages over the size
    /// cap are not sent at all.
    pub async fn broadcast(&self, msg: &WireMessage, except: Option<u64>) {
        let line = match self.encode(msg) {
            Some(line) => line,
            None => return,
        };
        let peers = self.peers.read().await;
        for (id, peer) in peers.iter() {
            if Some(*id) == except {
                continue;
            }
            if peer.outbound.try_send(Arc::clone(&line)).is_err() {
                debug!("[p2p] outbound queue to {} full; dropped {}", peer.addr, msg.kind());
            }
        }
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .peers
            .read()
            .await
            .values()
            .map(|p| PeerInfo {
                addr: p.addr.clone(),
                inbound: p.inbound,
                remote_id: p.remote_id,
            })
            .collect();
        peers.sort_by(|a, b| a.addr.cmp(&b.addr));
        peers
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    fn encode(&self, msg: &WireMessage) -> Option<Line> {
        match msg.to_line() {
            Ok(line) if line.len() <= self.engine.config().max_msg_bytes => Some(Arc::new(line)),
            Ok(line) => {
                warn!("[p2p] not sending {}: {} bytes exceeds limit", msg.kind(), line.len());
                None
            }
            Err(e) => {
                warn!("[p2p] failed to encode {}: {}", msg.kind(), e);
                None
            }
        }
    }

    async fn spawn_peer(self: &Arc<Self>, stream: TcpStream, addr: String, inbound: bool) {
        let peer_id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel::<Line>(OUTBOUND_QUEUE);
        self.peers.write().await.insert(
            peer_id,
            PeerHandle {
                addr: addr.clone(),
                inbound,
                remote_id: None,
                outbound: tx.clone(),
            },
        );

        let network = Arc::clone(self);
        tokio::spawn(async move {
            let (reader, writer) = stream.into_split();
            let result = tokio::select! {
                res = network.reader_task(reader, peer_id, &addr, tx) => res,
                res = writer_task(writer, rx) => res,
            };
            if let Err(e) = result {
                debug!("[p2p] connection to {} ended: {}", addr, e);
            }

            network.peers.write().await.remove(&peer_id);
            if !inbound {
                network.dialed.write().await.remove(&addr);
            }
            info!("[p2p] peer {} disconnected", addr);
        });
    }

    async fn reader_task(
        &self,
        reader: OwnedReadHalf,
        peer_id: u64,
        addr: &str,
        outbound: mpsc::Sender<Line>,
    ) -> Result<(), ChainError> {
        let mut session = self.engine.new_session(addr);
        for msg in self.engine.start(&mut session, unix_millis()).await? {
            self.send_to(&outbound, &msg).await?;
        }

        // One byte over the cap is enough to recognise an oversize line.
        let limit = self.engine.config().max_msg_bytes as u64 + 1;
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut authenticated = false;

        loop {
            buf.clear();
            let n = (&mut reader).take(limit).read_until(b'\n', &mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            if buf.last() == Some(&b'\n') {
                buf.pop();
            }

            let actions = self.engine.handle_line(&mut session, &buf, unix_millis()).await;

            if !authenticated && session.is_authenticated() {
                authenticated = true;
                if let Some(peer) = self.peers.write().await.get_mut(&peer_id) {
                    peer.remote_id = session.remote_id;
                }
            }

            for action in actions {
                match action {
                    SyncAction::Reply(msg) => self.send_to(&outbound, &msg).await?,
                    SyncAction::Broadcast(msg) => self.broadcast(&msg, Some(peer_id)).await,
                    SyncAction::Disconnect => return Ok(()),
                }
            }
        }
    }

    async fn send_to(&self, outbound: &mpsc::Sender<Line>, msg: &WireMessage) -> Result<(), ChainError> {
        if let Some(line) = self.encode(msg) {
            outbound
                .send(line)
                .await
                .map_err(|_| ChainError::NetworkError("Peer writer closed".to_string()))?;
        }
        Ok(())
    }
}

async fn writer_task(mut writer: OwnedWriteHalf, mut outbound: mpsc::Receiver<Line>) -> Result<(), ChainError> {
    while let Some(line) = outbound.recv().await {
        writer.write_all(&line).await?;
    }
    Ok(())
}
