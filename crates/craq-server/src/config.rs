//! Daemon configuration.
//!
//! Both daemons load an optional TOML file and let command-line flags (and
//! their env fallbacks) override individual fields.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Configuration for the node daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeServerConfig {
    /// Local address the RPC listener binds to.
    #[serde(default = "default_node_bind")]
    pub bind: String,

    /// Address advertised to the coordinator and peers. Defaults to `bind`;
    /// set it when the node sits behind NAT or a container network.
    #[serde(default)]
    pub public: Option<String>,

    /// Coordinator address to announce to.
    #[serde(default = "default_coordinator_addr")]
    pub coordinator: String,

    /// Path of the storage log.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// Keep storage in memory only (nothing survives a restart).
    #[serde(default)]
    pub memory: bool,
}

fn default_node_bind() -> String {
    "127.0.0.1:4001".to_owned()
}

fn default_coordinator_addr() -> String {
    "127.0.0.1:4000".to_owned()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("craq.db")
}

impl Default for NodeServerConfig {
    fn default() -> Self {
        Self {
            bind: default_node_bind(),
            public: None,
            coordinator: default_coordinator_addr(),
            store_path: default_store_path(),
            memory: false,
        }
    }
}

impl NodeServerConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// The address this node advertises.
    pub fn effective_public(&self) -> String {
        self.public.clone().unwrap_or_else(|| self.bind.clone())
    }
}

/// Configuration for the coordinator daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorServerConfig {
    /// Local address the RPC listener binds to.
    #[serde(default = "default_coordinator_addr")]
    pub bind: String,

    /// Seconds between liveness probe rounds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Seconds before an unanswered probe declares the node dead.
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,
}

fn default_ping_interval() -> u64 {
    3
}

fn default_ping_timeout() -> u64 {
    5
}

impl Default for CoordinatorServerConfig {
    fn default() -> Self {
        Self {
            bind: default_coordinator_addr(),
            ping_interval_secs: default_ping_interval(),
            ping_timeout_secs: default_ping_timeout(),
        }
    }
}

impl CoordinatorServerConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// The probe settings in the coordinator's terms.
    pub fn probe_config(&self) -> craq_coordinator::CoordinatorConfig {
        craq_coordinator::CoordinatorConfig {
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            ping_timeout: Duration::from_secs(self.ping_timeout_secs),
        }
    }
}
