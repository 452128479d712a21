//! # craq-server
//!
//! The chain daemons: `craq-node-server` runs one replica,
//! `craq-coordinator-server` runs the control plane. This library holds the
//! pieces they share: file-backed configuration and the shutdown handler.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Daemon configuration
pub mod config;

use tokio::signal;

/// Resolves when the process receives Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => tracing::error!("failed to install signal handler: {e}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
