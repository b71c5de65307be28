//! Sync driver.
//!
//! Pulls work out of the [`SyncWindow`] and hands it to idle peers of the
//! pool: header ranges go to random idle peers, missing bodies are split
//! across every idle peer, fastest first. Replies flow back into the window
//! and whatever it exports is imported into the local store.
//!
//! The driver remembers what is in flight so the same range or body is not
//! asked of two peers at once. A request that fails or comes back short is
//! simply released; the window offers the work again on a later tick.

use std::collections::HashSet;
use std::sync::Arc;

use keel_core::memory::MemoryStore;
use keel_core::types::{Block, BlockHeader, Hash256};
use keel_network::{PeerConnection, PeerPool, SyncPeer};
use keel_sync::{BlocksRequest, HeadersRequest, SyncWindow};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::config::SyncSettings;

pub struct SyncDriver {
    window: Mutex<SyncWindow>,
    pool: Arc<PeerPool<PeerConnection>>,
    sink: Arc<MemoryStore>,
    settings: SyncSettings,
    headers_in_flight: Mutex<Vec<HeadersRequest>>,
    bodies_in_flight: Mutex<HashSet<Hash256>>,
    /// Highest exported block number.
    progress: watch::Sender<u64>,
}

impl std::fmt::Debug for SyncDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncDriver")
            .field("exported", &*self.progress.borrow())
            .field("headers_in_flight", &self.headers_in_flight.lock().len())
            .field("bodies_in_flight", &self.bodies_in_flight.lock().len())
            .finish()
    }
}

impl SyncDriver {
    pub fn new(
        window: SyncWindow,
        pool: Arc<PeerPool<PeerConnection>>,
        sink: Arc<MemoryStore>,
        settings: SyncSettings,
    ) -> Self {
        let (progress, _) = watch::channel(window.last_exported_num());
        Self {
            window: Mutex::new(window),
            pool,
            sink,
            settings,
            headers_in_flight: Mutex::new(Vec::new()),
            bodies_in_flight: Mutex::new(HashSet::new()),
            progress,
        }
    }

    /// Receiver of the highest exported block number.
    pub fn progress(&self) -> watch::Receiver<u64> {
        self.progress.subscribe()
    }

    pub fn is_complete(&self) -> bool {
        self.window.lock().is_complete()
    }

    /// Read access to the window.
    pub fn with_window<R>(&self, f: impl FnOnce(&SyncWindow) -> R) -> R {
        f(&self.window.lock())
    }

    pub fn header_requests_in_flight(&self) -> usize {
        self.headers_in_flight.lock().len()
    }

    pub fn bodies_in_flight(&self) -> usize {
        self.bodies_in_flight.lock().len()
    }

    /// Hand out one round of work.
    pub fn tick(self: &Arc<Self>) {
        self.dispatch_headers();
        self.dispatch_bodies();
    }

    fn dispatch_headers(self: &Arc<Self>) {
        let s = &self.settings;
        let in_flight = self.headers_in_flight.lock().clone();
        let free = s.max_header_requests.saturating_sub(in_flight.len());
        if free == 0 {
            return;
        }
        let requests = self.window.lock().request_headers(
            s.max_headers_per_request,
            s.max_header_requests,
            s.max_total_headers,
        );
        for request in requests
            .into_iter()
            .filter(|r| !in_flight.contains(r))
            .take(free)
        {
            let Some(peer) = self.pool.any_idle() else {
                trace!("sync: no idle peer for headers");
                break;
            };
            let reply = match peer.request_headers(request.anchor, request.count, request.skip, request.reverse) {
                Ok(reply) => reply,
                Err(e) => {
                    debug!(peer = %peer.id(), error = %e, "sync: header request refused");
                    continue;
                }
            };
            debug!(peer = %peer.id(), %request, "sync: requesting headers");
            self.headers_in_flight.lock().push(request.clone());
            let driver = Arc::clone(self);
            let id = peer.id();
            tokio::spawn(async move {
                let result = reply.await;
                driver.headers_in_flight.lock().retain(|r| *r != request);
                match result {
                    Ok(headers) => {
                        driver.add_headers(headers);
                    }
                    Err(e) => debug!(peer = %id, error = %e, "sync: header request failed"),
                }
            });
        }
    }

    fn dispatch_bodies(self: &Arc<Self>) {
        let idle = self.pool.all_idle();
        if idle.is_empty() {
            return;
        }
        let per_peer = self.settings.max_bodies_per_request;
        let in_flight = self.bodies_in_flight.lock().len();
        let wanted = self.window.lock().request_blocks(per_peer * idle.len() + in_flight);
        let fresh: Vec<BlockHeader> = {
            let in_flight = self.bodies_in_flight.lock();
            wanted
                .headers
                .into_iter()
                .filter(|h| !in_flight.contains(&h.hash()))
                .collect()
        };
        if fresh.is_empty() {
            return;
        }

        for (peer, chunk) in idle.into_iter().zip(BlocksRequest::new(fresh).split(per_peer)) {
            let hashes: Vec<Hash256> = chunk.headers.iter().map(BlockHeader::hash).collect();
            let count = hashes.len();
            let reply = match peer.request_bodies(chunk.headers) {
                Ok(reply) => reply,
                Err(e) => {
                    debug!(peer = %peer.id(), error = %e, "sync: body request refused");
                    continue;
                }
            };
            debug!(peer = %peer.id(), count, "sync: requesting bodies");
            self.bodies_in_flight.lock().extend(hashes.iter().copied());
            let driver = Arc::clone(self);
            let id = peer.id();
            tokio::spawn(async move {
                let result = reply.await;
                driver.release(&hashes);
                match result {
                    Ok(response) => {
                        if !response.missing.is_empty() {
                            trace!(peer = %id, missing = response.missing.len(), "sync: bodies short");
                        }
                        driver.add_blocks(response.blocks);
                    }
                    Err(e) => debug!(peer = %id, error = %e, "sync: body request failed"),
                }
            });
        }
    }

    fn release(&self, hashes: &[Hash256]) {
        let mut in_flight = self.bodies_in_flight.lock();
        for hash in hashes {
            in_flight.remove(hash);
        }
    }

    /// Return headers whose bodies a lost peer never delivered.
    pub fn requeue(&self, headers: &[BlockHeader]) {
        if headers.is_empty() {
            return;
        }
        let hashes: Vec<Hash256> = headers.iter().map(BlockHeader::hash).collect();
        self.release(&hashes);
        debug!(count = headers.len(), "sync: unfinished bodies requeued");
    }

    /// Feed headers into the window. Returns how many were new.
    pub fn add_headers(&self, headers: Vec<BlockHeader>) -> usize {
        if headers.is_empty() {
            return 0;
        }
        self.window.lock().add_headers(headers)
    }

    /// Feed downloaded blocks into the window and import what it exports.
    pub fn add_blocks(&self, blocks: Vec<Block>) {
        if blocks.is_empty() {
            return;
        }
        let (exported, last) = {
            let mut window = self.window.lock();
            let exported = window.add_blocks(blocks);
            (exported, window.last_exported_num())
        };
        self.import(exported, last);
    }

    fn import(&self, blocks: Vec<Block>, last_exported: u64) {
        if blocks.is_empty() {
            return;
        }
        for block in blocks {
            let number = block.number();
            if let Err(e) = self.sink.import(block) {
                warn!(number, error = %e, "sync: import failed");
            }
        }
        self.progress.send_replace(last_exported);
        trace!(last_exported, height = self.sink.height(), "sync: imported");
    }

    /// A peer pushed a complete block.
    pub fn on_new_block(&self, block: Block) {
        self.add_headers(vec![block.header.clone()]);
        self.add_blocks(vec![block]);
    }

    /// A peer announced block hashes. The highest unknown one is fetched
    /// from that peer; its ancestors arrive through regular gap filling.
    pub fn on_announced(self: &Arc<Self>, peer: Arc<PeerConnection>, announced: Vec<(Hash256, u64)>) {
        let unknown = {
            let window = self.window.lock();
            announced
                .into_iter()
                .filter(|(hash, number)| {
                    *number > window.dark_zone_num() && window.candidate(*number, hash).is_none()
                })
                .max_by_key(|(_, number)| *number)
        };
        let Some((hash, number)) = unknown else {
            return;
        };
        match peer.request_announced_header(hash) {
            Ok(reply) => {
                let driver = Arc::clone(self);
                let id = peer.id();
                tokio::spawn(async move {
                    match reply.await {
                        Ok(headers) => {
                            driver.add_headers(headers);
                        }
                        Err(e) => debug!(peer = %id, number, error = %e, "sync: announced header lost"),
                    }
                });
            }
            Err(e) => debug!(peer = %peer.id(), number, error = %e, "sync: cannot fetch announced header"),
        }
    }

    /// Tick until the end block is exported or `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            exported = *self.progress.borrow(),
            end = ?self.window.lock().end_block_number(),
            "sync: started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.is_complete() {
                info!(exported = *self.progress.borrow(), "sync: end block reached");
                break;
            }
            tokio::select! {
                _ = ticker.tick() => self.tick(),
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("sync: driver stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::sim::SimNetwork;
    use keel_core::chain;
    use keel_core::traits::BlockStore;
    use keel_core::types::NodeId;
    use keel_sync::WindowConfig;

    fn driver(local_len: usize, end: Option<u64>) -> Arc<SyncDriver> {
        let cfg = NodeConfig::default();
        let net = cfg.shared_network_config();
        let sink = Arc::new(MemoryStore::synthetic(local_len).unwrap());
        let (sim, _incoming) = SimNetwork::new(Arc::clone(&net));
        let sim = Arc::new(sim);
        let pool = Arc::new(PeerPool::new(
            NodeId::random(),
            net,
            sink.clone(),
            sim.clone(),
            sim,
        ));
        let window = SyncWindow::from_store(
            WindowConfig { rng_seed: Some(1), ..cfg.window_config() },
            sink.as_ref(),
            end,
        )
        .unwrap();
        Arc::new(SyncDriver::new(window, pool, sink, cfg.sync))
    }

    #[tokio::test]
    async fn pushed_block_is_imported() {
        let d = driver(5, None);
        let next = chain::chain(6).pop().unwrap();
        let mut progress = d.progress();
        assert_eq!(*progress.borrow_and_update(), 4);
        d.on_new_block(next.clone());
        assert!(progress.has_changed().unwrap());
        assert_eq!(*progress.borrow(), 5);
        assert_eq!(d.sink.best_block().unwrap(), next);
    }

    #[tokio::test]
    async fn bodies_wait_for_their_parent() {
        let d = driver(5, None);
        let blocks = chain::chain(9);
        d.add_headers(blocks[5..].iter().map(|b| b.header.clone()).collect());
        d.add_blocks(vec![blocks[6].clone(), blocks[8].clone()]);
        assert_eq!(d.sink.height(), 4);
        d.add_blocks(vec![blocks[5].clone()]);
        assert_eq!(d.sink.height(), 6);
        assert_eq!(*d.progress().borrow(), 6);
    }

    #[tokio::test]
    async fn bounded_sync_completes_at_end_block() {
        let d = driver(3, Some(4));
        let blocks = chain::chain(6);
        assert!(!d.is_complete());
        d.add_headers(blocks[3..].iter().map(|b| b.header.clone()).collect());
        d.add_blocks(blocks[3..].to_vec());
        assert!(d.is_complete());
        // Block 5 is past the end and never enters the window.
        assert_eq!(d.sink.height(), 4);
    }

    #[tokio::test]
    async fn tick_without_peers_issues_nothing() {
        let d = driver(3, None);
        d.tick();
        assert_eq!(d.header_requests_in_flight(), 0);
        assert_eq!(d.bodies_in_flight(), 0);
    }

    #[tokio::test]
    async fn requeue_releases_in_flight_bodies() {
        let d = driver(3, None);
        let header = chain::chain(4)[3].header.clone();
        d.bodies_in_flight.lock().insert(header.hash());
        d.requeue(&[header]);
        assert_eq!(d.bodies_in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let d = driver(3, None);
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&d).run(rx));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        tx.send_replace(true);
        task.await.unwrap();
    }
}
