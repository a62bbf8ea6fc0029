//! Node runtime: the TCP listener, bootstrap join, and graceful shutdown.
//!
//! `start` is the one entry point; the binary and the integration tests
//! both go through it.

use crate::actors::{connection, SessionCoordinatorHandle};
use crate::config::Config;
use crate::errors::NodeError;
use arbor_protocol::PeerInfo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A started node: the coordinator handle plus the accept loop.
pub struct RunningNode {
    /// Handle to the session coordinator.
    pub handle: SessionCoordinatorHandle,
    /// The address the listener actually bound (useful with port 0).
    pub local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl RunningNode {
    /// Graceful shutdown: notify the parent, close every channel, stop the
    /// listener.
    pub async fn shutdown(self) {
        let _ = self.handle.shutdown().await;
        let _ = tokio::time::timeout(Duration::from_secs(5), self.accept_task).await;
    }
}

/// Bind the listener, join the configured tree member (if any), and start
/// accepting connections.
pub async fn start(config: Config) -> Result<RunningNode, NodeError> {
    let config = Arc::new(config);
    let (handle, _actor_task) = SessionCoordinatorHandle::spawn(Arc::clone(&config));
    let cancel = handle.cancel_token();

    let listener = TcpListener::bind(&config.bind_address).await?;
    let local_addr = listener.local_addr()?;
    info!(
        target: "arbor.server",
        node_id = %config.node_id,
        addr = %local_addr,
        "listening"
    );

    // Join an existing tree before serving anyone.
    if let (Some(hostname), Some(port)) = (config.remote_hostname.clone(), config.remote_port) {
        let target = PeerInfo {
            id: format!("{hostname}:{port}"),
            hostname,
            port,
        };
        let snapshot = handle.snapshot().await?;
        connection::establish_parent(&config, &target, snapshot, &handle, cancel.clone()).await?;
    }

    let accept_handle = handle.clone();
    let accept_cancel = cancel.clone();
    let max_frame_length = config.max_frame_length;
    let accept_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = accept_cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!(target: "arbor.server", peer = %peer_addr, "connection accepted");
                        if let Err(e) = connection::serve_connection(
                            stream,
                            accept_handle.clone(),
                            accept_cancel.clone(),
                            max_frame_length,
                        )
                        .await
                        {
                            warn!(target: "arbor.server", error = %e, "failed to attach connection");
                        }
                    }
                    Err(e) => {
                        warn!(target: "arbor.server", error = %e, "accept failed");
                    }
                }
            }
        }
        debug!(target: "arbor.server", "accept loop stopped");
    });

    Ok(RunningNode {
        handle,
        local_addr,
        accept_task,
    })
}
