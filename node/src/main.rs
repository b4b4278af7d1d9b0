//! `cached`, the Cache network daemon.
//!
//! Startup order matters and mirrors the shutdown order in reverse:
//! config → currency → checkpoints → core → p2p → run; on signal the
//! p2p loop drains first, then core state flushes, then the peer lists
//! are persisted.

use anyhow::{Context, Result};
use cache_config::{CheckpointsSource, Config};
use cache_core::checkpoint::Checkpoints;
use cache_core::core::{ChainSink, Core, FeePolicy, ProtocolRelay};
use cache_core::currency::Currency;
use cache_core::serialize::to_bytes;
use cache_core::{AccountAddress, Blockchain};
use cache_node::p2p::{NodeServer, NodeServerConfig, PeerSet, ProtocolHandler, SEED_NODES};
use cache_node::{StopToken, WorkerPool};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

const VERIFY_THREADS: usize = 2;

#[derive(Parser, Debug)]
#[command(name = "cached", version, about = "Cache network daemon")]
struct Args {
    /// Path to a JSON config file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Root directory for persisted state
    #[arg(long)]
    data_dir: Option<String>,

    /// Deploy a test net: checkpoints and hardcoded seeds are ignored
    /// and the network id is changed
    #[arg(long)]
    testnet: bool,

    /// "default" uses the embedded list, a path loads CSV, empty disables
    #[arg(long)]
    load_checkpoints: Option<String>,

    /// Fee address for light wallets that use this daemon
    #[arg(long)]
    fee_address: Option<String>,

    /// Fee amount for light wallets that use this daemon
    #[arg(long)]
    fee_amount: Option<u64>,

    /// Secret view key for remote-node fee confirmation
    #[arg(long)]
    view_key: Option<String>,

    /// Public-node contact string (at most 128 characters)
    #[arg(long)]
    node_id: Option<String>,

    /// P2P bind address, ip:port
    #[arg(long)]
    p2p_bind: Option<String>,

    /// Extra peers to dial alongside the seed nodes
    #[arg(long = "add-peer")]
    add_peers: Vec<String>,

    /// Print the genesis coinbase transaction hex and exit
    #[arg(long)]
    print_genesis_tx: bool,

    /// Log filter (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn merge_args(mut config: Config, args: &Args) -> Result<Config> {
    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    if args.testnet {
        config.testnet = true;
    }
    if let Some(checkpoints) = &args.load_checkpoints {
        config.load_checkpoints = checkpoints.clone();
    }
    if let Some(address) = &args.fee_address {
        config.fee_address = Some(address.clone());
    }
    if let Some(amount) = args.fee_amount {
        config.fee_amount = amount;
    }
    if let Some(key) = &args.view_key {
        config.view_key = Some(key.clone());
    }
    if let Some(id) = &args.node_id {
        config.node_id = Some(id.clone());
    }
    if let Some(bind) = &args.p2p_bind {
        let (ip, port) = bind
            .rsplit_once(':')
            .context("--p2p-bind must be ip:port")?;
        config.p2p_bind_ip = ip.to_string();
        config.p2p_bind_port = port.parse().context("bad --p2p-bind port")?;
    }
    config.add_peers.extend(args.add_peers.iter().cloned());
    Ok(config)
}

fn load_checkpoints(config: &Config) -> Result<Checkpoints> {
    if config.testnet {
        log::info!("testnet mode: checkpoints disabled");
        return Ok(Checkpoints::new());
    }
    match config.checkpoints_source() {
        CheckpointsSource::Disabled => Ok(Checkpoints::new()),
        CheckpointsSource::Embedded => {
            let checkpoints = Checkpoints::embedded();
            log::info!("loaded {} default checkpoints", checkpoints.len());
            Ok(checkpoints)
        }
        CheckpointsSource::File(path) => {
            let mut checkpoints = Checkpoints::embedded();
            let loaded = checkpoints
                .load_csv(&path)
                .with_context(|| format!("loading checkpoints from {}", path.display()))?;
            log::info!(
                "loaded {} checkpoints from {} ({} total)",
                loaded,
                path.display(),
                checkpoints.len()
            );
            Ok(checkpoints)
        }
    }
}

fn build_fee_policy(config: &Config, currency: &Currency) -> Result<FeePolicy> {
    let address = match &config.fee_address {
        Some(raw) if !raw.is_empty() => {
            let parsed = AccountAddress::from_base58(raw, currency.public_address_prefix())
                .map_err(|e| anyhow::anyhow!("bad fee address {raw}: {e}"))?;
            log::info!("remote node fee address set: {raw}");
            Some(parsed)
        }
        _ => None,
    };
    if config.view_key.is_some() {
        log::info!("secret view key set");
    }
    Ok(FeePolicy {
        address,
        amount: config.fee_amount,
        view_key: config.view_key.clone(),
    })
}

// The event loop is single-threaded on purpose: every task on it is
// cooperative, and the only other threads are the verification workers.
#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_default_env()
        .parse_filters(&args.log_level)
        .init();

    log::info!("Cache daemon v{}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let config = merge_args(config, &args)?;
    config.validate_and_prepare()?;

    if config.testnet {
        log::warn!("starting in testnet mode!");
    }
    let currency = Arc::new(if config.testnet {
        Currency::testnet()
    } else {
        Currency::mainnet()
    });

    if args.print_genesis_tx {
        let genesis = currency.genesis_block();
        println!(
            "GENESIS_COINBASE_TX_HEX = \"{}\"",
            hex::encode(to_bytes(&genesis.miner_tx))
        );
        return Ok(());
    }

    let checkpoints = load_checkpoints(&config)?;
    let fee_policy = build_fee_policy(&config, &currency)?;
    if let Some(id) = &config.node_id {
        log::info!("public node id: {id}");
    }

    let data_dir = config.data_dir_resolved();

    log::info!("initializing core...");
    let chain = Blockchain::open(&data_dir.join("blockchain"), currency.clone(), checkpoints)?;
    let core = Arc::new(Core::new(chain, fee_policy, config.node_id.clone()));
    log::info!("core initialized, height {}", core.get_height());

    log::info!("initializing p2p server...");
    let stop = StopToken::new();
    let workers = Arc::new(WorkerPool::new(VERIFY_THREADS));
    let handler = Arc::new(ProtocolHandler::new(
        core.clone() as Arc<dyn ChainSink>,
        workers.clone(),
    ));
    let seed_nodes = if config.testnet {
        Vec::new()
    } else {
        SEED_NODES.iter().map(|s| s.to_string()).collect()
    };
    let server = Arc::new(NodeServer::new(
        NodeServerConfig {
            bind_addr: config.p2p_bind_addr(),
            my_port: config.p2p_bind_port,
            network_id: currency.network_id(),
            data_dir: data_dir.clone(),
            seed_nodes,
            add_peers: config.add_peers.clone(),
            out_degree: cache_node::p2p::TARGET_OUT_DEGREE,
        },
        handler.clone(),
        stop.clone(),
    ));
    handler.set_peer_set(server.clone() as Arc<dyn PeerSet>);
    core.set_protocol_relay(server.clone() as Arc<dyn ProtocolRelay>);
    log::info!("p2p server initialized");

    // signal handler posts the stop token; every task drains at its
    // next suspension point
    let signal_stop = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("shutdown signal received");
            signal_stop.cancel();
        }
    });

    log::info!("starting p2p net loop...");
    server.clone().run().await?;
    log::info!("p2p net loop stopped");

    // ordered teardown: core state first, then p2p bookkeeping
    log::info!("deinitializing core...");
    workers.shutdown();
    log::info!("deinitializing p2p...");
    server.deinit()?;

    log::info!("the node has successfully shutdown");
    Ok(())
}
