//! Arbor relay node.
//!
//! # Startup flow
//!
//! 1. Initialize tracing from the environment
//! 2. Load configuration (`ARBOR_*` environment variables)
//! 3. Spawn the session coordinator and bind the listener
//! 4. Join the configured tree member, when one is set
//! 5. Serve until Ctrl+C / SIGTERM, then shut down gracefully (shutdown
//!    notice to the parent, close every channel, stop the listener)

use anyhow::Context;
use arbor_node::{server, Config};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "arbor_node=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Arbor node");

    let config = Config::from_env().context("loading configuration")?;
    info!(node_id = %config.node_id, bind = %config.bind_address, "configuration loaded");

    let node = server::start(config).await.context("starting node")?;

    shutdown_signal().await;
    info!("Shutdown signal received");
    node.shutdown().await;
    info!("Arbor node stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the node.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
