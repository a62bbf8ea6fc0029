//! Per-connection I/O tasks.
//!
//! Every open socket gets a reader task and a writer task. The reader
//! parses frames and forwards them into the coordinator's mailbox; the
//! writer drains an unbounded outbound queue, so the coordinator hands off
//! frames without ever waiting on a peer's backpressure while it holds
//! shared state. Writes to one channel are therefore serialized by its
//! writer task no matter which worker produced the frame.

use crate::actors::coordinator::SessionCoordinatorHandle;
use crate::actors::messages::{ConnId, OutboundCmd};
use crate::config::Config;
use crate::errors::NodeError;
use arbor_protocol::{CodecError, DirectorySnapshot, Frame, FrameCodec, PeerInfo};
use futures::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long an outbound handshake may take end to end.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Register an accepted socket with the coordinator and start its I/O
/// tasks. The connection starts in the pending (unauthenticated) state.
pub async fn serve_connection(
    stream: TcpStream,
    handle: SessionCoordinatorHandle,
    cancel: CancellationToken,
    max_frame_length: usize,
) -> Result<(), NodeError> {
    let framed = Framed::new(stream, FrameCodec::new(max_frame_length));
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let conn = handle.attach(out_tx).await?;
    spawn_io(framed, conn, out_rx, handle, cancel);
    Ok(())
}

/// Dial a server, authenticate with the shared network secret, and adopt it
/// as this node's parent.
///
/// Used both at bootstrap (joining an existing tree) and during partition
/// repair. The handshake exchanges directory snapshots in both directions.
pub async fn establish_parent(
    config: &Config,
    target: &PeerInfo,
    snapshot: DirectorySnapshot,
    handle: &SessionCoordinatorHandle,
    cancel: CancellationToken,
) -> Result<(), NodeError> {
    let connect = TcpStream::connect((target.hostname.as_str(), target.port));
    let stream = timeout(HANDSHAKE_TIMEOUT, connect)
        .await
        .map_err(|_| NodeError::Handshake(format!("connect to {} timed out", target.id)))?
        .map_err(|e| NodeError::Handshake(format!("connect to {}: {e}", target.id)))?;

    let mut framed = Framed::new(stream, FrameCodec::new(config.max_frame_length));
    framed
        .send(Frame::Authenticate {
            secret: config.network_secret.expose_secret().to_string(),
            id: config.node_id.clone(),
            hostname: config.advertised_hostname.clone(),
            port: config.advertised_port,
            directory: snapshot,
        })
        .await
        .map_err(|e| NodeError::Handshake(format!("send to {}: {e}", target.id)))?;

    let reply = timeout(HANDSHAKE_TIMEOUT, framed.next())
        .await
        .map_err(|_| NodeError::Handshake(format!("{} did not answer the handshake", target.id)))?;

    match reply {
        Some(Ok(Frame::AuthenticationSuccess {
            id,
            hostname,
            port,
            directory,
            grandparent,
            sibling,
        })) => {
            let peer = PeerInfo { id, hostname, port };
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let conn = handle
                .attach_parent(out_tx, peer, grandparent, sibling, directory)
                .await?;
            spawn_io(framed, conn, out_rx, handle.clone(), cancel);
            Ok(())
        }
        Some(Ok(Frame::AuthenticationFail { info })) => Err(NodeError::Handshake(info)),
        Some(Ok(other)) => Err(NodeError::Handshake(format!(
            "unexpected {} during handshake",
            other.command()
        ))),
        Some(Err(e)) => Err(NodeError::Handshake(e.to_string())),
        None => Err(NodeError::Handshake(
            "connection closed during handshake".to_string(),
        )),
    }
}

/// Start the reader and writer tasks for an attached connection.
fn spawn_io(
    framed: Framed<TcpStream, FrameCodec>,
    conn: ConnId,
    mut out_rx: mpsc::UnboundedReceiver<OutboundCmd>,
    handle: SessionCoordinatorHandle,
    cancel: CancellationToken,
) {
    let (mut sink, mut stream) = framed.split();
    let conn_cancel = cancel.child_token();

    // Writer: single consumer of this connection's outbound queue.
    let writer_cancel = conn_cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = writer_cancel.cancelled() => break,
                cmd = out_rx.recv() => match cmd {
                    Some(OutboundCmd::Frame(frame)) => {
                        if let Err(e) = sink.send(frame).await {
                            debug!(
                                target: "arbor.connection",
                                conn = %conn,
                                error = %e,
                                "write failed, closing connection"
                            );
                            break;
                        }
                    }
                    Some(OutboundCmd::Close) | None => {
                        let _ = sink.close().await;
                        break;
                    }
                }
            }
        }
        // Stop the reader too; the socket is done.
        writer_cancel.cancel();
    });

    // Reader: forwards frames into the coordinator mailbox.
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = conn_cancel.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(frame)) => handle.inbound(conn, frame).await,
                    Some(Err(CodecError::Malformed(e))) => {
                        handle.malformed(conn, e.to_string()).await;
                        break;
                    }
                    Some(Err(CodecError::FrameTooLong { length, max })) => {
                        handle
                            .malformed(conn, format!("frame of {length} bytes exceeds maximum {max}"))
                            .await;
                        break;
                    }
                    Some(Err(CodecError::Io(e))) => {
                        warn!(
                            target: "arbor.connection",
                            conn = %conn,
                            error = %e,
                            "read failed"
                        );
                        break;
                    }
                    None => break,
                }
            }
        }
        handle.closed(conn).await;
    });
}
