//! Keel sync node binary.
//!
//! Syncs a local in-memory chain from a loopback network of simulated peers,
//! some of them misbehaving, and reports progress until the target height is
//! exported or Ctrl+C is pressed.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, bail};
use clap::Parser;
use keel_core::chain;
use keel_core::constants::TESTNET_NETWORK_ID;
use keel_core::memory::MemoryStore;
use keel_node_lib::{LogFormat, NodeConfig, SimNetwork, SyncNode, init_logging};
use tracing::{error, info};

/// Keel block sync node.
#[derive(Parser, Debug)]
#[command(
    name = "keel-node",
    version,
    about = "Keel block sync engine running against simulated peers"
)]
struct Args {
    /// TOML configuration file. Defaults to <config dir>/keel/keel.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format ("text" or "json")
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Honest simulated peers
    #[arg(long)]
    peers: Option<usize>,

    /// Peers answering body requests with nothing
    #[arg(long)]
    lazy_peers: Option<usize>,

    /// Peers serving broken header chains
    #[arg(long)]
    corrupt_peers: Option<usize>,

    /// Length of the remote chain, genesis included
    #[arg(long)]
    chain_length: Option<usize>,

    /// Length of the local chain we start from, genesis included
    #[arg(long)]
    local_length: Option<usize>,

    /// Stop once this block is exported. Defaults to the remote tip.
    #[arg(long)]
    end_block: Option<u64>,

    /// Seed for peer selection and gap-request direction
    #[arg(long)]
    seed: Option<u64>,

    /// Use the test network id.
    #[arg(long)]
    testnet: bool,
}

impl Args {
    /// Apply command-line overrides on top of the loaded configuration.
    fn apply(self, mut config: NodeConfig) -> NodeConfig {
        if let Some(level) = self.log_level {
            config.log.level = level;
        }
        if let Some(format) = self.log_format {
            config.log.format = format;
        }
        let sim = &mut config.sim;
        sim.peers = self.peers.unwrap_or(sim.peers);
        sim.lazy_peers = self.lazy_peers.unwrap_or(sim.lazy_peers);
        sim.corrupt_peers = self.corrupt_peers.unwrap_or(sim.corrupt_peers);
        sim.chain_length = self.chain_length.unwrap_or(sim.chain_length);
        sim.local_length = self.local_length.unwrap_or(sim.local_length);
        sim.seed = self.seed.unwrap_or(sim.seed);
        if self.end_block.is_some() {
            config.sync.end_block = self.end_block;
        }
        if config.sync.end_block.is_none() {
            config.sync.end_block = Some(config.sim.chain_length.saturating_sub(1) as u64);
        }
        if config.window.rng_seed.is_none() {
            config.window.rng_seed = Some(config.sim.seed);
        }
        if self.testnet {
            config.network.network_id = TESTNET_NETWORK_ID;
        }
        config
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = match NodeConfig::load(args.config.as_deref()) {
        Ok(config) => args.apply(config),
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = init_logging(&config.log.level, config.log.format) {
        eprintln!("failed to initialize logging: {e}");
        process::exit(1);
    }

    if let Err(e) = run(config).await {
        error!("{e:#}");
        process::exit(1);
    }
}

async fn run(config: NodeConfig) -> anyhow::Result<()> {
    info!("Keel sync node v{}", env!("CARGO_PKG_VERSION"));
    info!(
        peers = config.sim.peers,
        lazy = config.sim.lazy_peers,
        corrupt = config.sim.corrupt_peers,
        chain = config.sim.chain_length,
        local = config.sim.local_length,
        end = ?config.sync.end_block,
        "simulation"
    );
    if config.sim.local_length == 0 || config.sim.local_length > config.sim.chain_length {
        bail!(
            "local_length must be between 1 and chain_length ({})",
            config.sim.chain_length
        );
    }
    let target = config.sync.end_block.unwrap_or_default();

    let store = MemoryStore::from_chain(chain::chain(config.sim.local_length))
        .context("seeding local store")?;
    let (sim, incoming) = SimNetwork::from_settings(&config.sim, config.shared_network_config())
        .context("building simulated network")?;
    let sim = Arc::new(sim);
    let node = SyncNode::new(config, Arc::new(store), sim.clone(), sim.clone())
        .context("creating node")?;

    let started = Instant::now();
    node.start(incoming);

    tokio::select! {
        reached = node.wait_for(target) => {
            if reached {
                info!(
                    height = node.store().height(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "sync complete"
                );
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!(height = node.store().height(), "received Ctrl+C, shutting down");
        }
    }

    node.shutdown().await;
    sim.shutdown();
    let banned = node.scores().lock().banned_nodes().len();
    info!(height = node.store().height(), banned, "stopped");
    Ok(())
}
