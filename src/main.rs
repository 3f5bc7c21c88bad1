//! emberd: the Embercoin daemon.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use embercoin::config::NodeConfig;
use embercoin::miner;
use embercoin::net::NetEngine;
use embercoin::node::Node;
use embercoin::script;

#[derive(Parser, Debug)]
#[command(name = "emberd", version, about = "Embercoin full node")]
struct Args {
    /// Data directory (default: .embercoin)
    #[arg(long)]
    datadir: Option<PathBuf>,

    /// Use the test network
    #[arg(long)]
    testnet: bool,

    /// Listen port override
    #[arg(long)]
    port: Option<u16>,

    /// Connect only to these peers (host:port, repeatable)
    #[arg(long = "connect")]
    connect: Vec<String>,

    /// Additional peers to maintain (host:port, repeatable)
    #[arg(long = "addnode")]
    add_nodes: Vec<String>,

    /// Disable listening for inbound connections
    #[arg(long)]
    no_listen: bool,

    /// Mine blocks
    #[arg(long)]
    generate: bool,

    /// Mining worker threads
    #[arg(long)]
    miner_threads: Option<usize>,

    /// Checkpoint enforcement: strict, advisory or permissive
    #[arg(long)]
    checkpoint_mode: Option<String>,
}

fn build_config(args: &Args) -> Result<NodeConfig, embercoin::NodeError> {
    let data_dir = args.datadir.clone().unwrap_or_else(|| PathBuf::from(".embercoin"));
    std::fs::create_dir_all(&data_dir)?;
    let mut config = NodeConfig::load(&data_dir)?;

    if args.testnet {
        config.testnet = true;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if !args.connect.is_empty() {
        config.connect = args.connect.clone();
    }
    if !args.add_nodes.is_empty() {
        config.add_nodes = args.add_nodes.clone();
    }
    if args.no_listen {
        config.listen = false;
    }
    if args.generate {
        config.generate = true;
    }
    if let Some(threads) = args.miner_threads {
        config.miner_threads = threads;
    }
    if let Some(mode) = &args.checkpoint_mode {
        config.checkpoint_mode = mode.clone();
    }
    config.validate()?;
    Ok(config)
}

fn run(args: Args) -> Result<(), embercoin::NodeError> {
    let config = build_config(&args)?;
    let node = Node::open(config)?;

    let engine = NetEngine::new(Arc::clone(&node));
    let mut handles = engine.start()?;

    if node.config.generate {
        // pay rewards to a bare anyone-can-spend script until a wallet
        // supplies a key
        let coinbase_script = vec![script::OP_1];
        for _ in 0..node.config.miner_threads.max(1) {
            let node = Arc::clone(&node);
            let engine = Arc::clone(&engine);
            let script = coinbase_script.clone();
            handles.push(
                thread::Builder::new()
                    .name("miner".into())
                    .spawn(move || miner::miner_loop(node, Some(engine), script))?,
            );
        }
    }

    info!("node running");
    while !node.is_shutdown() {
        thread::sleep(Duration::from_millis(500));
    }

    info!("shutting down");
    for handle in handles {
        let _ = handle.join();
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        error!(error = %e, "fatal initialization failure");
        std::process::exit(1);
    }
    std::process::exit(0);
}
