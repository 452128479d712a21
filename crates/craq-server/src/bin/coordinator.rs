//! The chain coordinator daemon.
//!
//! Binds the RPC listener, starts the liveness probe loop, and serves until
//! Ctrl-C/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use craq_coordinator::Coordinator;
use craq_server::config::CoordinatorServerConfig;
use craq_server::shutdown_signal;
use craq_transport::{serve_coordinator, TcpConnector};

/// Chain coordinator daemon.
#[derive(Parser, Debug)]
#[command(
    name = "craq-coordinator-server",
    version,
    about = "craq chain coordinator"
)]
struct Args {
    /// Local address to bind the RPC listener to.
    #[arg(short = 'a', long, env = "CRAQ_COORDINATOR_BIND")]
    bind: Option<String>,

    /// Seconds between liveness probe rounds.
    #[arg(long, env = "CRAQ_PING_INTERVAL")]
    ping_interval: Option<u64>,

    /// Seconds before an unanswered probe declares a node dead.
    #[arg(long, env = "CRAQ_PING_TIMEOUT")]
    ping_timeout: Option<u64>,

    /// Configuration file (flags override its fields).
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info", env = "CRAQ_LOG")]
    log_level: String,
}

fn load_config(args: &Args) -> Result<CoordinatorServerConfig> {
    let mut config = match &args.config {
        Some(path) => {
            CoordinatorServerConfig::from_file(path).context("failed to load config file")?
        }
        None => CoordinatorServerConfig::default(),
    };

    if let Some(bind) = &args.bind {
        config.bind = bind.clone();
    }
    if let Some(interval) = args.ping_interval {
        config.ping_interval_secs = interval;
    }
    if let Some(timeout) = args.ping_timeout {
        config.ping_timeout_secs = timeout;
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

    let coordinator =
        Coordinator::with_config(Arc::new(TcpConnector::new()), config.probe_config());

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    let service: Arc<dyn craq_transport::CoordinatorService> = coordinator.clone();
    let server = tokio::spawn(serve_coordinator(listener, service));

    let probes = tokio::spawn(coordinator.clone().run());
    info!(bind = %config.bind, "coordinator is serving");

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

    probes.abort();
    info!("coordinator stopped");
    Ok(())
}
