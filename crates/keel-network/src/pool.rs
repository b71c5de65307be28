//! Peer pool.
//!
//! Tracks connected peers and maintains the *active* set that sync work is
//! handed to. Every maintenance pass:
//!
//! 1. drops active peers whose outstanding request exceeded the timeout,
//! 2. raises the lower useful total difficulty to our own best,
//! 3. asks discovery for more nodes when below the connection target,
//! 4. rebuilds the active set from the strongest peers,
//! 5. removes closed peers from the active set.
//!
//! The active set is the top `sync_peer_count` ready peers by total
//! difficulty, cut where a peer falls more than 20% below the strongest,
//! then ordered by latency so selection favours fast peers. Readers get the
//! list as an `Arc` snapshot; a pass replaces it wholesale.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use keel_core::traits::{BlockStore, Dialer, Discovery, NodeHandle};
use keel_core::types::{NodeId, TotalDifficulty};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::protocol::DisconnectReason;
use crate::scheduler::Scheduler;

/// Snapshot of a peer as seen by the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub id: NodeId,
    /// Handshake completed.
    pub ready: bool,
    /// Ready with no header or body retrieval in flight.
    pub idle: bool,
    pub closed: bool,
    pub total_difficulty: Option<TotalDifficulty>,
    pub best_number: Option<u64>,
    pub reputation: i64,
    pub banned: bool,
    pub latency: Option<Duration>,
    /// Age of the oldest outstanding request.
    pub busy_for: Option<Duration>,
}

/// What the pool needs from a connection.
pub trait SyncPeer: Send + Sync {
    fn id(&self) -> NodeId;
    fn record(&self) -> PeerRecord;
    fn drop_connection(&self, reason: DisconnectReason);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// Peer joined the active set.
    PeerActivated(NodeId),
    /// Peer left the active set without disconnecting.
    PeerDeactivated(NodeId),
    /// Peer disconnected and was removed from the pool.
    PeerDisconnected(NodeId),
}

/// `td` is within 20% of `highest`.
pub fn within_difficulty_band(td: TotalDifficulty, highest: TotalDifficulty) -> bool {
    td.saturating_add(td / 5) >= highest
}

/// Active peer selection rule over `(peer, record)` pairs.
pub fn select_active<P>(
    mut candidates: Vec<(Arc<P>, PeerRecord)>,
    sync_peer_count: usize,
    min_reputation: i64,
) -> Vec<Arc<P>> {
    candidates.retain(|(_, r)| {
        r.ready && !r.closed && !r.banned && r.reputation >= min_reputation && r.total_difficulty.is_some()
    });
    candidates.sort_by(|a, b| b.1.total_difficulty.cmp(&a.1.total_difficulty));
    candidates.truncate(sync_peer_count);

    let Some(highest) = candidates.first().and_then(|(_, r)| r.total_difficulty) else {
        return Vec::new();
    };
    let keep = candidates
        .iter()
        .rposition(|(_, r)| within_difficulty_band(r.total_difficulty.unwrap_or_default(), highest))
        .map_or(0, |i| i + 1);
    candidates.truncate(keep);

    candidates.sort_by_key(|(_, r)| r.latency.unwrap_or(Duration::MAX));
    candidates.into_iter().map(|(p, _)| p).collect()
}

pub struct PeerPool<P> {
    local_id: NodeId,
    config: Arc<NetworkConfig>,
    store: Arc<dyn BlockStore>,
    discovery: Arc<dyn Discovery>,
    dialer: Arc<dyn Dialer>,
    connected: Mutex<HashMap<NodeId, Arc<P>>>,
    active: RwLock<Arc<Vec<Arc<P>>>>,
    lower_useful_td: Mutex<TotalDifficulty>,
    events: broadcast::Sender<PoolEvent>,
    rng: Mutex<StdRng>,
}

impl<P> std::fmt::Debug for PeerPool<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerPool")
            .field("local_id", &self.local_id)
            .field("connected", &self.connected.lock().len())
            .field("active", &self.active.read().len())
            .finish()
    }
}

impl<P: SyncPeer + 'static> PeerPool<P> {
    pub fn new(
        local_id: NodeId,
        config: Arc<NetworkConfig>,
        store: Arc<dyn BlockStore>,
        discovery: Arc<dyn Discovery>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            local_id,
            config,
            store,
            discovery,
            dialer,
            connected: Mutex::new(HashMap::new()),
            active: RwLock::new(Arc::new(Vec::new())),
            lower_useful_td: Mutex::new(0),
            events,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Seed the random idle-peer choice.
    pub fn with_rng_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Track a new connection. It becomes eligible at the next pass.
    pub fn register(&self, peer: Arc<P>) {
        let id = peer.id();
        self.connected.lock().insert(id, peer);
        debug!(%id, "pool: peer registered");
    }

    /// Forget a disconnected peer.
    pub fn on_disconnect(&self, id: &NodeId) {
        if self.connected.lock().remove(id).is_none() {
            return;
        }
        let mut active = self.active.write();
        if active.iter().any(|p| p.id() == *id) {
            let kept: Vec<_> = active.iter().filter(|p| p.id() != *id).cloned().collect();
            *active = Arc::new(kept);
        }
        drop(active);
        debug!(%id, "pool: peer removed");
        self.emit(PoolEvent::PeerDisconnected(*id));
    }

    pub fn peer(&self, id: &NodeId) -> Option<Arc<P>> {
        self.connected.lock().get(id).cloned()
    }

    pub fn connected_count(&self) -> usize {
        self.connected.lock().len()
    }

    /// Current active set, fastest first.
    pub fn active_peers(&self) -> Arc<Vec<Arc<P>>> {
        self.active.read().clone()
    }

    pub fn lower_useful_difficulty(&self) -> TotalDifficulty {
        *self.lower_useful_td.lock()
    }

    // ---------------------------------------------------------------------
    // Selection
    // ---------------------------------------------------------------------

    /// Every idle active peer, fastest first.
    pub fn all_idle(&self) -> Vec<Arc<P>> {
        self.active_peers()
            .iter()
            .filter(|p| {
                let r = p.record();
                r.idle && !r.banned
            })
            .cloned()
            .collect()
    }

    /// A random idle active peer.
    pub fn any_idle(&self) -> Option<Arc<P>> {
        let idle = self.all_idle();
        idle.choose(&mut *self.rng.lock()).cloned()
    }

    /// The fastest idle active peer.
    pub fn best_idle(&self) -> Option<Arc<P>> {
        self.all_idle().into_iter().next()
    }

    /// The fastest idle peer, but only if another idle peer remains.
    pub fn not_last_idle(&self) -> Option<Arc<P>> {
        let idle = self.all_idle();
        if idle.len() > 1 { idle.into_iter().next() } else { None }
    }

    // ---------------------------------------------------------------------
    // Maintenance
    // ---------------------------------------------------------------------

    /// Run every maintenance step once.
    pub async fn maintain(&self) {
        self.heartbeat();
        self.update_lower_useful_difficulty();
        self.fill_up().await;
        self.prepare_active();
        self.cleanup_active();
    }

    /// Drop active peers whose outstanding request is older than the timeout.
    pub fn heartbeat(&self) {
        let timeout = self.config.request_timeout;
        for peer in self.active_peers().iter() {
            let r = peer.record();
            if r.closed {
                continue;
            }
            if let Some(busy) = r.busy_for.filter(|b| *b > timeout) {
                info!(peer = %r.id, busy_ms = busy.as_millis() as u64, "pool: request timed out");
                peer.drop_connection(DisconnectReason::Timeout);
            }
        }
    }

    /// Peers below our own total difficulty have nothing to offer.
    pub fn update_lower_useful_difficulty(&self) {
        match self.store.best_total_difficulty() {
            Ok(td) => {
                let mut lower = self.lower_useful_td.lock();
                if td > *lower {
                    *lower = td;
                }
            }
            Err(e) => warn!(error = %e, "pool: cannot read local total difficulty"),
        }
    }

    /// Ask discovery for nodes until the connection target is met. Nodes at
    /// or above the lower useful difficulty are preferred; any unconnected
    /// node is accepted when none qualify.
    pub async fn fill_up(&self) {
        let (lack, in_use) = {
            let connected = self.connected.lock();
            let lack = self.config.max_active_peers.saturating_sub(connected.len());
            let mut in_use: HashSet<NodeId> = connected.keys().copied().collect();
            in_use.insert(self.local_id);
            (lack, in_use)
        };
        if lack == 0 {
            return;
        }
        let lower = self.lower_useful_difficulty();

        let useful = |n: &NodeHandle| !in_use.contains(&n.id) && n.total_difficulty.is_some_and(|td| td >= lower);
        let mut nodes = match self.discovery.nodes(&useful, lack).await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(error = %e, "pool: discovery failed");
                return;
            }
        };
        if nodes.is_empty() {
            let unconnected = |n: &NodeHandle| !in_use.contains(&n.id);
            nodes = match self.discovery.nodes(&unconnected, lack).await {
                Ok(nodes) => nodes,
                Err(e) => {
                    warn!(error = %e, "pool: discovery failed");
                    return;
                }
            };
        }

        debug!(lack, found = nodes.len(), "pool: filling up");
        for node in nodes.iter().take(lack) {
            if let Err(e) = self.dialer.connect(node) {
                debug!(node = %node.id, error = %e, "pool: dial failed");
            }
        }
    }

    /// Rebuild the active set from the connected peers.
    pub fn prepare_active(&self) {
        let candidates: Vec<_> = {
            let connected = self.connected.lock();
            connected.values().cloned().collect()
        };
        let candidates = candidates
            .into_iter()
            .map(|p| {
                let r = p.record();
                (p, r)
            })
            .collect();
        let next = select_active(candidates, self.config.sync_peer_count, self.config.min_reputation);

        let previous = self.active_peers();
        let before: HashSet<NodeId> = previous.iter().map(|p| p.id()).collect();
        let after: HashSet<NodeId> = next.iter().map(|p| p.id()).collect();
        *self.active.write() = Arc::new(next);

        for id in after.difference(&before) {
            debug!(%id, "pool: peer activated");
            self.emit(PoolEvent::PeerActivated(*id));
        }
        for id in before.difference(&after) {
            debug!(%id, "pool: peer deactivated");
            self.emit(PoolEvent::PeerDeactivated(*id));
        }
    }

    /// Remove closed peers from the active set.
    pub fn cleanup_active(&self) {
        let current = self.active_peers();
        if current.iter().all(|p| !p.record().closed) {
            return;
        }
        let kept: Vec<_> = current.iter().filter(|p| !p.record().closed).cloned().collect();
        *self.active.write() = Arc::new(kept);
    }

    pub fn log_active(&self) {
        let active = self.active_peers();
        let idle = active.iter().filter(|p| p.record().idle).count();
        info!(
            active = active.len(),
            idle,
            connected = self.connected_count(),
            lower_td = self.lower_useful_difficulty(),
            "pool: status"
        );
        for peer in active.iter() {
            let r = peer.record();
            debug!(
                peer = %r.id,
                td = r.total_difficulty.unwrap_or_default(),
                best = r.best_number.unwrap_or_default(),
                latency_ms = r.latency.map_or(0, |l| l.as_millis() as u64),
                reputation = r.reputation,
                idle = r.idle,
                "pool: active peer"
            );
        }
    }

    /// Schedule maintenance and status logging on `scheduler`.
    pub fn start(self: &Arc<Self>, scheduler: &Scheduler) {
        let pool = Arc::clone(self);
        scheduler.every("pool-maintenance", self.config.maintenance_interval, move || {
            let pool = Arc::clone(&pool);
            async move {
                // A panicking pass is logged and the next tick runs normally.
                let pass = tokio::spawn(async move { pool.maintain().await });
                if let Err(e) = pass.await {
                    warn!(error = %e, "pool: maintenance pass failed");
                }
            }
        });
        let pool = Arc::clone(self);
        scheduler.every("pool-log", self.config.log_interval, move || {
            let pool = Arc::clone(&pool);
            async move { pool.log_active() }
        });
        info!(
            interval_ms = self.config.maintenance_interval.as_millis() as u64,
            "pool: maintenance started"
        );
    }

    fn emit(&self, event: PoolEvent) {
        let _ = self.events.send(event);
    }
}
