//! Command-line client for the craq chain.
//!
//! ```bash
//! # Write a value through the coordinator
//! craq -c localhost:4000 write greeting hello world
//!
//! # Read from a node (any node in the chain)
//! craq -n localhost:4001 read greeting
//!
//! # Dump every committed pair a node holds
//! craq -n localhost:4001 readall
//! ```

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use craq_client::Client;
use craq_transport::TcpConnector;

/// Command-line client for a craq chain.
#[derive(Parser, Debug)]
#[command(name = "craq", version, about = "Client for a craq chain")]
struct Args {
    /// Coordinator address, used for writes.
    #[arg(short = 'c', long, default_value = "127.0.0.1:4000", env = "CRAQ_COORDINATOR")]
    coordinator: String,

    /// Node address, used for reads.
    #[arg(short = 'n', long, default_value = "127.0.0.1:4001", env = "CRAQ_NODE")]
    node: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a value; the words of VALUE are joined with spaces.
    Write {
        /// Key to write.
        key: String,
        /// Value to store.
        #[arg(required = true)]
        value: Vec<String>,
    },
    /// Read the latest committed value for a key.
    Read {
        /// Key to read.
        key: String,
    },
    /// Read every committed key/value pair from the node.
    Readall,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args = Args::parse();
    let client = Client::new(&args.coordinator, &args.node, Arc::new(TcpConnector::new()));

    match args.command {
        Command::Write { key, value } => {
            let value = Bytes::from(value.join(" "));
            client.write(&key, value).await?;
            println!("ok");
        }
        Command::Read { key } => {
            let kv = client.read(&key).await?;
            println!("{} = {}", kv.key, String::from_utf8_lossy(&kv.value));
        }
        Command::Readall => {
            let items = client.read_all().await?;
            if items.is_empty() {
                println!("(empty)");
            }
            for kv in items {
                println!("{} = {}", kv.key, String::from_utf8_lossy(&kv.value));
            }
        }
    }

    Ok(())
}
