//! The chain node daemon.
//!
//! Binds the RPC listener, opens storage, announces the node to the
//! coordinator, and serves until Ctrl-C/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use craq_node::{Node, NodeOpts};
use craq_server::config::NodeServerConfig;
use craq_server::shutdown_signal;
use craq_store::{FileStore, MemoryStore, Storer};
use craq_transport::{serve_node, TcpConnector};

/// Chain node daemon.
#[derive(Parser, Debug)]
#[command(name = "craq-node-server", version, about = "craq chain node")]
struct Args {
    /// Local address to bind the RPC listener to.
    #[arg(short = 'a', long, env = "CRAQ_NODE_BIND")]
    bind: Option<String>,

    /// Address advertised to the coordinator and peers (defaults to bind).
    #[arg(short = 'p', long, env = "CRAQ_NODE_PUBLIC")]
    public: Option<String>,

    /// Coordinator address to announce to.
    #[arg(short = 'c', long, env = "CRAQ_COORDINATOR")]
    coordinator: Option<String>,

    /// Path of the storage log.
    #[arg(short = 's', long, env = "CRAQ_STORE_PATH")]
    store_path: Option<PathBuf>,

    /// Keep storage in memory only.
    #[arg(long)]
    memory: bool,

    /// Configuration file (flags override its fields).
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info", env = "CRAQ_LOG")]
    log_level: String,
}

fn load_config(args: &Args) -> Result<NodeServerConfig> {
    let mut config = match &args.config {
        Some(path) => NodeServerConfig::from_file(path).context("failed to load config file")?,
        None => NodeServerConfig::default(),
    };

    if let Some(bind) = &args.bind {
        config.bind = bind.clone();
    }
    if let Some(public) = &args.public {
        config.public = Some(public.clone());
    }
    if let Some(coordinator) = &args.coordinator {
        config.coordinator = coordinator.clone();
    }
    if let Some(path) = &args.store_path {
        config.store_path = path.clone();
    }
    if args.memory {
        config.memory = true;
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config(&args)?;

    let store: Arc<dyn Storer> = if config.memory {
        info!("using in-memory storage (nothing survives a restart)");
        Arc::new(MemoryStore::new())
    } else {
        info!(path = %config.store_path.display(), "opening storage log");
        Arc::new(
            FileStore::open(&config.store_path)
                .await
                .context("failed to open storage")?,
        )
    };

    let node = Node::new(NodeOpts {
        pub_address: config.effective_public(),
        coordinator: config.coordinator.clone(),
        store,
        connector: Arc::new(TcpConnector::new()),
    });

    // The listener must be up before registering: the coordinator dials
    // back, and neighbors start catch-up exchanges right away.
    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    let service: Arc<dyn craq_transport::NodeService> = node.clone();
    let server = tokio::spawn(serve_node(listener, service));

    node.start().await.context("failed to join the chain")?;
    info!(
        bind = %config.bind,
        public = %node.pub_address(),
        "node is serving"
    );

    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
        result = server => {
            if let Ok(Err(e)) = result {
                error!("rpc server failed: {e}");
            }
        }
    }

    info!("node stopped");
    Ok(())
}
