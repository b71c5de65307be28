//! Sync node composition.
//!
//! The [`SyncNode`] wires the local store, the peer pool, the sync window
//! driver and every peer connection together, and owns the background tasks
//! that keep them moving: pool maintenance, latency probes, ban expiry, the
//! connection event loop and the driver itself.

use std::sync::Arc;
use std::time::Duration;

use keel_core::memory::MemoryStore;
use keel_core::traits::{BlockStore, Dialer, Discovery};
use keel_core::types::NodeId;
use keel_network::{
    ConnectionContext, ConnectionEvent, DisconnectReason, NetworkConfig, PeerConnection, PeerPool,
    PeerScoreBoard, Scheduler, SharedScoreBoard, SyncPeer,
};
use keel_sync::SyncWindow;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::driver::SyncDriver;
use crate::error::NodeError;
use crate::transport::{self, Incoming};

pub struct SyncNode {
    id: NodeId,
    config: NodeConfig,
    network: Arc<NetworkConfig>,
    store: Arc<MemoryStore>,
    scores: SharedScoreBoard,
    pool: Arc<PeerPool<PeerConnection>>,
    driver: Arc<SyncDriver>,
    scheduler: Scheduler,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
}

impl std::fmt::Debug for SyncNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncNode")
            .field("id", &self.id)
            .field("height", &self.store.height())
            .field("pool", &self.pool)
            .field("driver", &self.driver)
            .finish()
    }
}

impl SyncNode {
    /// Build a node syncing into `store`. The window is seeded from the top
    /// of the store and bounded by `config.sync.end_block`.
    pub fn new(
        config: NodeConfig,
        store: Arc<MemoryStore>,
        discovery: Arc<dyn Discovery>,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Arc<Self>, NodeError> {
        let id = NodeId::random();
        let network = config.shared_network_config();
        let mut pool = PeerPool::new(
            id,
            Arc::clone(&network),
            store.clone(),
            discovery,
            dialer,
        );
        if let Some(seed) = config.window.rng_seed {
            pool = pool.with_rng_seed(seed);
        }
        let pool = Arc::new(pool);
        let window = SyncWindow::from_store(config.window_config(), store.as_ref(), config.sync.end_block)?;
        let driver = Arc::new(SyncDriver::new(
            window,
            Arc::clone(&pool),
            Arc::clone(&store),
            config.sync.clone(),
        ));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        info!(
            node = %id,
            height = store.height(),
            network = network.network_id,
            version = %network.protocol_version,
            "node: created"
        );
        Ok(Arc::new(Self {
            id,
            config,
            network,
            store,
            scores: PeerScoreBoard::shared(),
            pool,
            driver,
            scheduler: Scheduler::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }))
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn pool(&self) -> &Arc<PeerPool<PeerConnection>> {
        &self.pool
    }

    pub fn driver(&self) -> &Arc<SyncDriver> {
        &self.driver
    }

    pub fn scores(&self) -> &SharedScoreBoard {
        &self.scores
    }

    /// Highest exported block number, updated as blocks are imported.
    pub fn progress(&self) -> watch::Receiver<u64> {
        self.driver.progress()
    }

    fn context(&self) -> ConnectionContext {
        ConnectionContext {
            config: Arc::clone(&self.network),
            store: self.store.clone(),
            scores: Arc::clone(&self.scores),
            events: self.events_tx.clone(),
        }
    }

    /// Bind an incoming connection and start its handshake. Banned nodes and
    /// nodes already connected are turned away.
    pub fn attach(&self, incoming: Incoming) -> Option<Arc<PeerConnection>> {
        let Incoming { peer, link } = incoming;
        if self.scores.lock().is_banned(&peer) {
            info!(%peer, "node: refusing banned peer");
            return None;
        }
        if self.pool.peer(&peer).is_some() {
            debug!(%peer, "node: duplicate connection refused");
            return None;
        }
        let (conn, pump) = transport::open(peer, self.context(), link, self.scheduler.shutdown_signal());
        self.scheduler.spawn("connection", pump);
        self.pool.register(Arc::clone(&conn));
        if let Err(e) = conn.send_status() {
            warn!(%peer, error = %e, "node: cannot build status");
            conn.drop_connection(DisconnectReason::Requested);
            return None;
        }
        Some(conn)
    }

    /// Start every background task. `incoming` delivers connections opened by
    /// the dialer or by remote nodes. Must be called inside a runtime, once.
    pub fn start(self: &Arc<Self>, incoming: mpsc::UnboundedReceiver<Incoming>) {
        self.pool.start(&self.scheduler);

        let pool = Arc::clone(&self.pool);
        self.scheduler.every("ping", self.network.maintenance_interval, move || {
            let pool = Arc::clone(&pool);
            async move {
                for peer in pool.active_peers().iter() {
                    peer.ping();
                }
            }
        });

        let scores = Arc::clone(&self.scores);
        self.scheduler.every("unban", Duration::from_secs(60), move || {
            let scores = Arc::clone(&scores);
            async move {
                let lifted = scores.lock().unban_expired();
                if !lifted.is_empty() {
                    info!(count = lifted.len(), "score: bans lifted");
                }
            }
        });

        let node = Arc::clone(self);
        let shutdown = self.scheduler.shutdown_signal();
        self.scheduler.spawn("accept", node.accept_loop(incoming, shutdown));

        if let Some(events) = self.events_rx.lock().take() {
            let node = Arc::clone(self);
            let shutdown = self.scheduler.shutdown_signal();
            self.scheduler.spawn("events", node.event_loop(events, shutdown));
        } else {
            warn!("node: already started");
        }

        let driver = Arc::clone(&self.driver);
        self.scheduler.spawn("sync", driver.run(self.scheduler.shutdown_signal()));
        info!(node = %self.id, "node: started");
    }

    async fn accept_loop(
        self: Arc<Self>,
        mut incoming: mpsc::UnboundedReceiver<Incoming>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                next = incoming.recv() => match next {
                    Some(conn) => {
                        self.attach(conn);
                    }
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    async fn event_loop(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                next = events.recv() => match next {
                    Some(event) => self.on_event(event),
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    fn on_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Ready {
                peer,
                total_difficulty,
                best_number,
            } => {
                info!(%peer, td = total_difficulty, best = best_number, "node: peer ready");
                // Make the peer usable now rather than at the next pass.
                self.pool.prepare_active();
            }
            ConnectionEvent::Disconnected {
                peer,
                reason,
                unfinished,
            } => {
                debug!(%peer, %reason, "node: peer gone");
                self.pool.on_disconnect(&peer);
                self.driver.requeue(&unfinished);
            }
            ConnectionEvent::NewBlock { peer, block, .. } => {
                debug!(%peer, number = block.number(), "node: block pushed");
                self.driver.on_new_block(block);
            }
            ConnectionEvent::NewBlockHashes { peer, announced } => {
                if let Some(conn) = self.pool.peer(&peer) {
                    self.driver.on_announced(conn, announced);
                }
            }
        }
    }

    /// Wait until block `number` is exported. `false` if the progress
    /// channel closed first.
    pub async fn wait_for(&self, number: u64) -> bool {
        let mut progress = self.progress();
        progress.wait_for(|n| *n >= number).await.is_ok()
    }

    /// Close every connection and stop all tasks.
    pub async fn shutdown(&self) {
        info!(
            node = %self.id,
            height = self.store.height(),
            best = %self.store.best_block().map(|b| b.hash().short()).unwrap_or_default(),
            "node: shutting down"
        );
        self.scheduler.shutdown().await;
    }
}
