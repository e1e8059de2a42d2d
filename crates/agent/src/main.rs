//! Tether Agent
//!
//! LAN discovery, pairing and sync channel engine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tether_agent::config::Config;
use tether_agent::connection::{ChannelConfig, ConnectTarget, ConnectionManager};
use tether_agent::discovery::{DiscoveryConfig, DiscoveryService};
use tether_agent::dispatcher::MessageDispatcher;
use tether_agent::pairing::{LocalIdentity, PairingStore};
use tether_agent::platform::Collaborators;

/// Tether agent - LAN peer discovery, pairing and sync channel engine.
#[derive(Parser, Debug)]
#[command(name = "tether-agent")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Scan the local network for peers
    Scan {
        /// Scan window in seconds
        #[arg(long, default_value = "3")]
        window: u64,
    },

    /// Pair with a peer and keep the sync channel open
    Connect {
        /// Peer host name or IP
        host: String,

        /// Pairing code shown on the peer
        code: String,

        /// Peer sync channel port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Reconnect to the stored peer and keep running
    Run,

    /// Show pairing and configuration status
    Status,

    /// Forget the paired peer
    Unpair,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };
    config.apply_env_overrides();
    config.validate()?;

    // Initialize tracing; RUST_LOG wins over the configured level
    let level = if cli.verbose {
        "debug"
    } else {
        &config.agent.log_level
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(config_path) = &cli.config {
        tracing::info!("Using config file: {:?}", config_path);
    }

    let store = Arc::new(PairingStore::in_data_dir(&config.agent.data_dir));
    store.load()?;

    match cli.command {
        Commands::Scan { window } => scan(&config, &store, Duration::from_secs(window)).await,
        Commands::Connect { host, code, port } => {
            let target = ConnectTarget {
                host,
                port: port.unwrap_or(config.network.channel_port),
                code,
                peer_public_key: None,
            };
            run_channel(&config, store, target).await
        }
        Commands::Run => {
            let state = store.state()?;
            let host = state
                .last_host
                .clone()
                .context("not paired yet; run `tether-agent connect` first")?;
            let code = state
                .pairing_code
                .clone()
                .context("no stored pairing code; run `tether-agent connect` first")?;
            let target = ConnectTarget {
                host,
                port: state.last_port,
                code,
                peer_public_key: state.peer_public_key.clone(),
            };
            run_channel(&config, store, target).await
        }
        Commands::Status => status(&config, &store),
        Commands::Unpair => {
            store.clear_pairing()?;
            println!("Pairing cleared.");
            Ok(())
        }
    }
}

async fn scan(config: &Config, store: &PairingStore, window: Duration) -> anyhow::Result<()> {
    let identity = LocalIdentity::load(store, &config.agent.device_name)?;
    let discovery = DiscoveryService::new(
        DiscoveryConfig::from_network(&config.network),
        &identity,
        config.network.channel_port,
    );

    println!("Scanning for {}s...", window.as_secs());
    let peers = discovery.scan_once(window).await?;

    if peers.is_empty() {
        println!("No peers found.");
        return Ok(());
    }
    for peer in peers {
        println!("  {}", peer);
    }
    Ok(())
}

/// Connects the sync channel and keeps it alive until Ctrl-C.
///
/// Continuous discovery runs alongside so peers scanning the network keep
/// seeing this device while it is paired.
async fn run_channel(
    config: &Config,
    store: Arc<PairingStore>,
    target: ConnectTarget,
) -> anyhow::Result<()> {
    let identity = LocalIdentity::load(&store, &config.agent.device_name)?;
    let collaborators = Collaborators::noop();
    let power = collaborators.power.clone();
    let dispatcher = MessageDispatcher::new(collaborators);

    let (manager, handle) = ConnectionManager::new(
        ChannelConfig::from_config(config),
        identity.clone(),
        dispatcher,
        power,
        store,
    );
    let manager_task = manager.spawn();

    let cancel = CancellationToken::new();
    let discovery_task = {
        let mut discovery_config = DiscoveryConfig::from_network(&config.network);
        discovery_config.respond_to_probes = true;
        let discovery = DiscoveryService::new(
            discovery_config,
            &identity,
            config.network.channel_port,
        );
        let cancel = cancel.clone();
        let (found_tx, mut found_rx) = mpsc::channel(32);
        tokio::spawn(async move {
            // Drain discoveries so the service never blocks on them
            tokio::spawn(async move {
                while let Some(peer) = found_rx.recv().await {
                    tracing::debug!("Peer on network: {}", peer);
                }
            });
            if let Err(e) = discovery.run(cancel, found_tx).await {
                tracing::warn!("Discovery stopped with error: {}", e);
            }
        })
    };

    // Log state transitions while the channel runs
    let mut state_rx = handle.subscribe();
    tokio::spawn(async move {
        loop {
            let snapshot = state_rx.borrow_and_update().clone();
            tracing::info!(
                "Channel state: {:?} (attempts: {}, encrypted: {})",
                snapshot.state,
                snapshot.attempts,
                snapshot.encrypted
            );
            if state_rx.changed().await.is_err() {
                break;
            }
        }
    });

    tracing::info!("Connecting to {}:{}", target.host, target.port);
    handle.connect(target).await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");

    cancel.cancel();
    handle.disconnect().await?;
    drop(handle);

    let _ = discovery_task.await;
    let _ = manager_task.await;
    Ok(())
}

fn status(config: &Config, store: &PairingStore) -> anyhow::Result<()> {
    let state = store.state()?;

    println!("Device name:  {}", config.agent.device_name);
    println!(
        "Device id:    {}",
        state.device_id.as_deref().unwrap_or("(not generated yet)")
    );
    if state.paired {
        println!(
            "Paired with:  {} at {}:{}",
            state.peer_name.as_deref().unwrap_or("unknown"),
            state.last_host.as_deref().unwrap_or("unknown"),
            state.last_port
        );
        println!(
            "Session key:  {}",
            if state.peer_public_key.is_some() {
                "available"
            } else {
                "not exchanged"
            }
        );
    } else {
        println!("Paired with:  (not paired)");
    }
    println!(
        "Discovery:    {}:{}",
        config.network.discovery_group, config.network.discovery_port
    );
    Ok(())
}
