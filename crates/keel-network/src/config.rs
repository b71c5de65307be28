//! Network configuration for connections and the peer pool.

use std::sync::Arc;
use std::time::Duration;

use keel_core::constants::{
    DEFAULT_MAX_ACTIVE_PEERS, DEFAULT_SYNC_PEER_COUNT, MAINNET_NETWORK_ID, PEER_READ_TIMEOUT,
    POOL_LOG_INTERVAL, POOL_MAINTENANCE_INTERVAL, TESTNET_NETWORK_ID,
};
use keel_core::traits::HeaderValidator;

use crate::capability::ProtocolVersion;

/// A block number whose header every peer must pass before it is trusted.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub number: u64,
    pub validator: Arc<dyn HeaderValidator>,
}

impl Checkpoint {
    pub fn new(number: u64, validator: impl HeaderValidator + 'static) -> Self {
        Self {
            number,
            validator: Arc::new(validator),
        }
    }
}

/// Configuration shared by every connection and the pool.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Peers on another network id are disconnected during the handshake.
    pub network_id: u64,
    /// Highest protocol version we offer.
    pub protocol_version: ProtocolVersion,
    /// Upper bound on the active sync set.
    pub sync_peer_count: usize,
    /// Target number of connected peers; discovery fills up to this.
    pub max_active_peers: usize,
    /// Peers scoring below this are left out of the active set.
    pub min_reputation: i64,
    pub maintenance_interval: Duration,
    pub log_interval: Duration,
    /// Requests unanswered for longer than this get the peer dropped.
    pub request_timeout: Duration,
    /// Headers checked once per peer after the status exchange.
    pub checkpoints: Vec<Checkpoint>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            network_id: MAINNET_NETWORK_ID,
            protocol_version: ProtocolVersion::LATEST,
            sync_peer_count: DEFAULT_SYNC_PEER_COUNT,
            max_active_peers: DEFAULT_MAX_ACTIVE_PEERS,
            min_reputation: -100,
            maintenance_interval: POOL_MAINTENANCE_INTERVAL,
            log_interval: POOL_LOG_INTERVAL,
            request_timeout: PEER_READ_TIMEOUT,
            checkpoints: Vec::new(),
        }
    }
}

impl NetworkConfig {
    pub fn mainnet() -> Self {
        Self::default()
    }

    /// Testnet preset: smaller pool, faster maintenance.
    pub fn testnet() -> Self {
        Self {
            network_id: TESTNET_NETWORK_ID,
            sync_peer_count: 4,
            max_active_peers: 10,
            maintenance_interval: Duration::from_secs(1),
            ..Self::default()
        }
    }

    pub fn with_checkpoint(mut self, checkpoint: Checkpoint) -> Self {
        self.checkpoints.push(checkpoint);
        self.checkpoints.sort_by_key(|c| c.number);
        self
    }
}
