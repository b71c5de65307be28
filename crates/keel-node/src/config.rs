//! Node configuration.
//!
//! Settings are layered: the built-in `config.default.toml`, then an optional
//! TOML file, then `KEEL_<SECTION>__<KEY>` environment variables
//! (e.g. `KEEL_SIM__PEERS=8`).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File, FileFormat};
use keel_network::{NetworkConfig, ProtocolVersion};
use keel_sync::WindowConfig;
use serde::{Deserialize, Serialize};

use crate::logging::LogFormat;

const DEFAULT_CONFIG: &str = include_str!("../config.default.toml");

/// Top-level node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub log: LogSettings,
    pub network: NetworkSettings,
    pub window: WindowSettings,
    pub sync: SyncSettings,
    pub sim: SimSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSettings {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    pub network_id: u64,
    /// Highest protocol version offered to peers.
    pub protocol_version: u8,
    pub sync_peer_count: usize,
    pub max_active_peers: usize,
    pub min_reputation: i64,
    pub maintenance_interval_ms: u64,
    pub log_interval_ms: u64,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSettings {
    pub window_size: usize,
    pub far_ahead_factor: u64,
    #[serde(default)]
    pub rng_seed: Option<u64>,
}

/// Limits applied by the sync driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
    pub max_headers_per_request: usize,
    pub max_bodies_per_request: usize,
    /// Header requests in flight at once across all peers.
    pub max_header_requests: usize,
    /// Buffered candidates above which no new header requests are issued.
    pub max_total_headers: usize,
    pub tick_ms: u64,
    /// Stop once this block is exported. `None` follows the network.
    #[serde(default)]
    pub end_block: Option<u64>,
}

/// Loopback simulation parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimSettings {
    /// Honest peers serving the full chain.
    pub peers: usize,
    /// Peers that answer every body request with an empty list.
    pub lazy_peers: usize,
    /// Peers that answer header requests with broken chains.
    pub corrupt_peers: usize,
    /// Blocks on the remote chain, genesis included.
    pub chain_length: usize,
    /// Blocks the local store starts with, genesis included.
    pub local_length: usize,
    /// Base one-way delay of simulated links; peer `i` adds `i` ms.
    pub latency_ms: u64,
    pub seed: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::builtin()
    }
}

impl NodeConfig {
    /// Load configuration. An explicit `path` must exist; without one the
    /// file at [`NodeConfig::default_path`] is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            Config::builder().add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml));
        match path {
            Some(path) => builder = builder.add_source(File::from(path)),
            None => {
                if let Some(default) = Self::default_path() {
                    builder = builder.add_source(File::from(default).required(false));
                }
            }
        }
        builder
            .add_source(
                Environment::with_prefix("KEEL")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Parse a TOML document layered over the embedded defaults.
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    /// `<config dir>/keel/keel.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("keel").join("keel.toml"))
    }

    /// The values of the embedded `config.default.toml`.
    fn builtin() -> Self {
        let net = NetworkConfig::default();
        let window = WindowConfig::default();
        Self {
            log: LogSettings {
                level: "info".into(),
                format: LogFormat::Text,
            },
            network: NetworkSettings {
                network_id: net.network_id,
                protocol_version: net.protocol_version.as_wire(),
                sync_peer_count: net.sync_peer_count,
                max_active_peers: net.max_active_peers,
                min_reputation: net.min_reputation,
                maintenance_interval_ms: net.maintenance_interval.as_millis() as u64,
                log_interval_ms: net.log_interval.as_millis() as u64,
                request_timeout_ms: net.request_timeout.as_millis() as u64,
            },
            window: WindowSettings {
                window_size: window.window_size,
                far_ahead_factor: window.far_ahead_factor,
                rng_seed: None,
            },
            sync: SyncSettings {
                max_headers_per_request: keel_core::constants::MAX_HEADERS_PER_REQUEST,
                max_bodies_per_request: keel_core::constants::MAX_BODIES_PER_REQUEST,
                max_header_requests: 4,
                max_total_headers: window.window_size * 20,
                tick_ms: 20,
                end_block: None,
            },
            sim: SimSettings {
                peers: 4,
                lazy_peers: 1,
                corrupt_peers: 1,
                chain_length: 2000,
                local_length: 1,
                latency_ms: 5,
                seed: 7,
            },
        }
    }

    /// Connection and pool settings. Unknown protocol versions fall back to
    /// the latest we speak.
    pub fn network_config(&self) -> NetworkConfig {
        let n = &self.network;
        NetworkConfig {
            network_id: n.network_id,
            protocol_version: ProtocolVersion::LATEST
                .negotiate(n.protocol_version)
                .unwrap_or(ProtocolVersion::LATEST),
            sync_peer_count: n.sync_peer_count,
            max_active_peers: n.max_active_peers,
            min_reputation: n.min_reputation,
            maintenance_interval: Duration::from_millis(n.maintenance_interval_ms),
            log_interval: Duration::from_millis(n.log_interval_ms),
            request_timeout: Duration::from_millis(n.request_timeout_ms),
            checkpoints: Vec::new(),
        }
    }

    pub fn window_config(&self) -> WindowConfig {
        WindowConfig {
            window_size: self.window.window_size,
            far_ahead_factor: self.window.far_ahead_factor,
            rng_seed: self.window.rng_seed,
        }
    }

    pub fn shared_network_config(&self) -> Arc<NetworkConfig> {
        Arc::new(self.network_config())
    }
}

impl SyncSettings {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}
