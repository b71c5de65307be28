//! Shared test helpers: chain builders, stub peers and wired-up connections.

use std::sync::Arc;
use std::time::Duration;

use keel_core::memory::MemoryStore;
use keel_core::types::{Block, BlockHeader, Hash256, NodeId, TotalDifficulty};
use keel_network::{
    ConnectionContext, DisconnectReason, HandshakeState, NetworkConfig, PeerConnection, PeerPool, PeerRecord,
    PeerScoreBoard, SyncPeer,
};
use keel_node_lib::transport::{self, Link};
use keel_node_lib::{NodeConfig, SimNetwork};
use keel_sync::{SyncWindow, WindowConfig};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

/// Headers of `blocks`, in order.
pub fn headers(blocks: &[Block]) -> Vec<BlockHeader> {
    blocks.iter().map(|b| b.header.clone()).collect()
}

/// A window seeded with `blocks` and a fixed gap-direction seed.
pub fn window(blocks: Vec<Block>, window_size: usize) -> SyncWindow {
    let config = WindowConfig {
        window_size,
        rng_seed: Some(7),
        ..WindowConfig::default()
    };
    SyncWindow::new(config, blocks).unwrap()
}

/// Hashes along the window's longest chain.
pub fn longest_hashes(window: &SyncWindow) -> Vec<Hash256> {
    window.longest_chain().iter().map(|c| c.hash()).collect()
}

/// A pool member with a fixed record.
#[derive(Debug)]
pub struct StaticPeer {
    record: Mutex<PeerRecord>,
}

impl StaticPeer {
    /// A ready, idle peer advertising `td`.
    pub fn ready(td: TotalDifficulty, latency_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            record: Mutex::new(PeerRecord {
                id: NodeId::random(),
                ready: true,
                idle: true,
                closed: false,
                total_difficulty: Some(td),
                best_number: Some(0),
                reputation: 0,
                banned: false,
                latency: Some(Duration::from_millis(latency_ms)),
                busy_for: None,
            }),
        })
    }
}

impl SyncPeer for StaticPeer {
    fn id(&self) -> NodeId {
        self.record.lock().id
    }

    fn record(&self) -> PeerRecord {
        self.record.lock().clone()
    }

    fn drop_connection(&self, _reason: DisconnectReason) {
        self.record.lock().closed = true;
    }
}

/// A pool over `P` with no discovery results, backed by a store of
/// `local_len` synthetic blocks.
pub fn pool<P: SyncPeer + 'static>(config: NetworkConfig, local_len: usize) -> Arc<PeerPool<P>> {
    let config = Arc::new(config);
    let (sim, _incoming) = SimNetwork::new(Arc::clone(&config));
    let sim = Arc::new(sim);
    let store = Arc::new(MemoryStore::synthetic(local_len).unwrap());
    Arc::new(PeerPool::new(NodeId::random(), config, store, sim.clone(), sim).with_rng_seed(3))
}

/// Two connections joined by a link, each serving its own synthetic chain.
/// Keep the returned sender alive; dropping it closes both ends.
pub struct Pair {
    pub local: Arc<PeerConnection>,
    pub remote: Arc<PeerConnection>,
    pub stop: watch::Sender<bool>,
}

impl Pair {
    /// Both ends, after both handshakes have succeeded.
    pub async fn ready(local_len: usize, remote_len: usize) -> Pair {
        let (a, b) = Link::pair();
        let (stop, signal) = watch::channel(false);
        let config = Arc::new(NetworkConfig::testnet());
        let (local, local_pump) = transport::open(NodeId::random(), context(&config, local_len), a, signal.clone());
        let (remote, remote_pump) = transport::open(NodeId::random(), context(&config, remote_len), b, signal);
        tokio::spawn(local_pump);
        tokio::spawn(remote_pump);
        local.send_status().unwrap();
        remote.send_status().unwrap();
        let done = wait_until(Duration::from_secs(5), || {
            local.handshake_state() == HandshakeState::Succeeded
                && remote.handshake_state() == HandshakeState::Succeeded
        })
        .await;
        assert!(done, "handshake did not complete");
        Pair { local, remote, stop }
    }
}

fn context(config: &Arc<NetworkConfig>, len: usize) -> ConnectionContext {
    let (events, _) = mpsc::unbounded_channel();
    ConnectionContext {
        config: Arc::clone(config),
        store: Arc::new(MemoryStore::synthetic(len).unwrap()),
        scores: PeerScoreBoard::shared(),
        events,
    }
}

/// Poll `cond` every few milliseconds until it holds or `timeout` passes.
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

/// Node settings tuned for fast in-process runs.
pub fn fast_config(end_block: u64) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.network.maintenance_interval_ms = 50;
    config.network.request_timeout_ms = 500;
    config.sync.tick_ms = 5;
    config.sync.end_block = Some(end_block);
    config.window.rng_seed = Some(11);
    config.sim.latency_ms = 0;
    config
}
