//! In-process network of simulated peers.
//!
//! Each simulated peer is a full [`PeerConnection`] serving from its own
//! [`MemoryStore`]. Dialing one wires a pair of delayed links between it and
//! the local node and hands the local end over as an [`Incoming`]
//! connection. A peer's [`Behaviour`] can tamper with what it sends, which
//! is how misbehaving peers are simulated.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_core::error::DiscoveryError;
use keel_core::memory::MemoryStore;
use keel_core::traits::{BlockStore, Dialer, Discovery, NodeHandle, NodePredicate};
use keel_core::types::NodeId;
use keel_network::{ConnectionContext, Message, NetworkConfig, PeerScoreBoard};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};

use crate::config::SimSettings;
use crate::error::NodeError;
use crate::transport::{self, Incoming, Link};

/// How a simulated peer treats our requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    Honest,
    /// Answers every body request with an empty list.
    Lazy,
    /// Swaps the last two headers of multi-header replies.
    Corrupt,
    /// Never answers body requests.
    Silent,
}

impl Behaviour {
    /// Rewrite one outgoing frame. `None` swallows it.
    fn tamper(self, frame: Vec<u8>) -> Option<Vec<u8>> {
        if self == Self::Honest {
            return Some(frame);
        }
        let Ok(msg) = Message::decode(&frame) else {
            return Some(frame);
        };
        let msg = match (self, msg) {
            (Self::Lazy, Message::Bodies(_)) => Message::Bodies(Vec::new()),
            (Self::Silent, Message::Bodies(_)) => return None,
            (Self::Corrupt, Message::Headers(mut headers)) if headers.len() >= 2 => {
                let n = headers.len();
                headers.swap(n - 2, n - 1);
                Message::Headers(headers)
            }
            _ => return Some(frame),
        };
        msg.encode().ok()
    }
}

#[derive(Debug, Clone)]
struct SimPeer {
    handle: NodeHandle,
    store: Arc<MemoryStore>,
    behaviour: Behaviour,
    latency: Duration,
}

/// Discovery and dialer over simulated peers.
#[derive(Debug)]
pub struct SimNetwork {
    config: Arc<NetworkConfig>,
    peers: Vec<SimPeer>,
    connected: Arc<Mutex<HashSet<NodeId>>>,
    incoming: mpsc::UnboundedSender<Incoming>,
    shutdown: watch::Sender<bool>,
}

impl SimNetwork {
    /// An empty network. Dialed connections arrive on the returned receiver.
    pub fn new(config: Arc<NetworkConfig>) -> (Self, mpsc::UnboundedReceiver<Incoming>) {
        let (incoming, rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let net = Self {
            config,
            peers: Vec::new(),
            connected: Arc::new(Mutex::new(HashSet::new())),
            incoming,
            shutdown,
        };
        (net, rx)
    }

    /// Build the network described by `settings`: honest, lazy and corrupt
    /// peers all serving the same synthetic chain.
    pub fn from_settings(
        settings: &SimSettings,
        config: Arc<NetworkConfig>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Incoming>), NodeError> {
        if settings.chain_length == 0 {
            return Err(NodeError::Sim("chain_length must be at least 1".into()));
        }
        if settings.peers + settings.lazy_peers + settings.corrupt_peers == 0 {
            return Err(NodeError::Sim("no peers configured".into()));
        }
        let store = Arc::new(MemoryStore::synthetic(settings.chain_length)?);
        let (mut net, rx) = Self::new(config);
        let behaviours = std::iter::repeat_n(Behaviour::Honest, settings.peers)
            .chain(std::iter::repeat_n(Behaviour::Lazy, settings.lazy_peers))
            .chain(std::iter::repeat_n(Behaviour::Corrupt, settings.corrupt_peers));
        for (i, behaviour) in behaviours.enumerate() {
            let latency = Duration::from_millis(settings.latency_ms + i as u64);
            net.add_peer(Arc::clone(&store), behaviour, latency)?;
        }
        info!(
            peers = net.peers.len(),
            chain = settings.chain_length,
            "sim: network ready"
        );
        Ok((net, rx))
    }

    /// Add a peer serving `store`. Returns its id.
    pub fn add_peer(
        &mut self,
        store: Arc<MemoryStore>,
        behaviour: Behaviour,
        latency: Duration,
    ) -> Result<NodeId, NodeError> {
        let id = NodeId::random();
        let handle = NodeHandle {
            id,
            address: format!("sim://{}", self.peers.len()),
            total_difficulty: Some(store.best_total_difficulty()?),
        };
        self.peers.push(SimPeer {
            handle,
            store,
            behaviour,
            latency,
        });
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Peers with a live connection to the local node.
    pub fn connected(&self) -> usize {
        self.connected.lock().len()
    }

    /// Close every simulated peer.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

#[async_trait]
impl Discovery for SimNetwork {
    async fn nodes(
        &self,
        predicate: NodePredicate<'_>,
        limit: usize,
    ) -> Result<Vec<NodeHandle>, DiscoveryError> {
        let connected = self.connected.lock().clone();
        let mut nodes: Vec<NodeHandle> = self
            .peers
            .iter()
            .map(|p| &p.handle)
            .filter(|h| !connected.contains(&h.id) && predicate(*h))
            .cloned()
            .collect();
        nodes.sort_by(|a, b| b.total_difficulty.cmp(&a.total_difficulty));
        nodes.truncate(limit);
        Ok(nodes)
    }
}

impl Dialer for SimNetwork {
    fn connect(&self, node: &NodeHandle) -> Result<(), DiscoveryError> {
        let peer = self
            .peers
            .iter()
            .find(|p| p.handle.id == node.id)
            .ok_or_else(|| DiscoveryError::Dial(format!("unknown node {}", node.id)))?;
        if !self.connected.lock().insert(node.id) {
            return Err(DiscoveryError::Dial(format!("already connected to {}", node.id)));
        }

        // local end <-> relay <-> remote end, one relay per direction.
        let (local, local_far) = Link::pair();
        let (remote, remote_far) = Link::pair();
        relay(local_far.rx, remote_far.tx, peer.latency, Behaviour::Honest);
        relay(remote_far.rx, local_far.tx, peer.latency, peer.behaviour);

        let (events, _) = mpsc::unbounded_channel();
        let ctx = ConnectionContext {
            config: Arc::clone(&self.config),
            store: peer.store.clone(),
            scores: PeerScoreBoard::shared(),
            events,
        };
        // The remote side sees us under a fresh id.
        let (conn, pump) = transport::open(NodeId::random(), ctx, remote, self.shutdown.subscribe());
        let connected = Arc::clone(&self.connected);
        let id = node.id;
        tokio::spawn(async move {
            pump.await;
            connected.lock().remove(&id);
            trace!(peer = %id, "sim: peer hung up");
        });
        conn.send_status()
            .map_err(|e| DiscoveryError::Dial(e.to_string()))?;

        self.incoming
            .send(Incoming { peer: id, link: local })
            .map_err(|_| DiscoveryError::Unavailable("node stopped accepting".into()))?;
        debug!(peer = %id, behaviour = ?peer.behaviour, "sim: dialed");
        Ok(())
    }
}

/// Forward frames from `rx` to `tx` after `delay`, filtered by `behaviour`.
fn relay(
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    delay: Duration,
    behaviour: Behaviour,
) {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let Some(frame) = behaviour.tamper(frame) else {
                continue;
            };
            if tx.send(frame).is_err() {
                break;
            }
        }
    });
}
