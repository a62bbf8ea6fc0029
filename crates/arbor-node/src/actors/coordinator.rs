//! `SessionCoordinator` - the singleton actor owning all shared node state.
//!
//! The coordinator is the one serialized mutation domain of the node: it
//! owns the client directory, the server topology, the holding list of
//! unauthenticated connections, and the map of live sessions. Per-connection
//! reader tasks push frames into its mailbox; handlers mutate state without
//! ever awaiting a peer (outbound writes go through per-connection writer
//! queues), so no handler can wedge the node on a slow channel.
//!
//! The periodic tick lives inside the actor loop: every tick flushes
//! deliverable messages to logged-in clients, evaluates one load-based
//! redirect, and expires stuck registrations; every Nth tick broadcasts the
//! load gossip.
//!
//! # Topology repair
//!
//! A closed parent link (outside shutdown) starts at most one reconnection
//! attempt: grandparent first, then the candidate queue from the gossip
//! table. The root's anchor child self-promotes instead; a node with
//! nothing to try logs the partition as unrepairable and keeps serving its
//! existing connections.

use crate::actors::connection;
use crate::actors::messages::{
    ConnId, ConnKind, ConnectedClient, CoordinatorMessage, NodeStatus, OutboundCmd, ServerPeer,
    ServerRole,
};
use crate::config::Config;
use crate::directory::{
    generate_anonymous_username, is_anonymous_username, ClientDirectory, ANONYMOUS_USERNAME,
};
use crate::dispatch::{self, Gate};
use crate::errors::NodeError;
use crate::topology::{PeerNode, ReconnectPlan, ServerTopology};
use arbor_protocol::{DeliverySnapshot, DirectorySnapshot, Frame, PeerInfo};
use secrecy::ExposeSecret;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Mailbox capacity for the coordinator.
const COORDINATOR_CHANNEL_BUFFER: usize = 1000;

/// Handle to the `SessionCoordinator`.
///
/// Cloneable; connection tasks and the listener all talk to the actor
/// through this.
#[derive(Clone)]
pub struct SessionCoordinatorHandle {
    sender: mpsc::Sender<CoordinatorMessage>,
    cancel: CancellationToken,
}

impl SessionCoordinatorHandle {
    /// Spawn the coordinator actor and return a handle to it.
    #[must_use]
    pub fn spawn(config: Arc<Config>) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(COORDINATOR_CHANNEL_BUFFER);
        let cancel = CancellationToken::new();

        let handle = Self {
            sender: sender.clone(),
            cancel: cancel.clone(),
        };
        let actor = SessionCoordinator::new(config, receiver, handle.clone());
        let task = tokio::spawn(actor.run());

        (handle, task)
    }

    /// Register a freshly accepted connection; returns its id.
    pub async fn attach(
        &self,
        outbound: mpsc::UnboundedSender<OutboundCmd>,
    ) -> Result<ConnId, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CoordinatorMessage::Attach {
                outbound,
                respond_to: tx,
            })
            .await
            .map_err(|e| NodeError::Internal(format!("mailbox send failed: {e}")))?;
        rx.await
            .map_err(|e| NodeError::Internal(format!("response receive failed: {e}")))
    }

    /// Adopt an authenticated outbound link as this node's parent.
    pub async fn attach_parent(
        &self,
        outbound: mpsc::UnboundedSender<OutboundCmd>,
        peer: PeerInfo,
        grandparent: Option<PeerInfo>,
        sibling: Option<PeerInfo>,
        directory: DirectorySnapshot,
    ) -> Result<ConnId, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CoordinatorMessage::AttachParent {
                outbound,
                peer,
                grandparent,
                sibling,
                directory,
                respond_to: tx,
            })
            .await
            .map_err(|e| NodeError::Internal(format!("mailbox send failed: {e}")))?;
        rx.await
            .map_err(|e| NodeError::Internal(format!("response receive failed: {e}")))
    }

    /// Deliver an inbound frame. Dropped silently if the actor is gone.
    pub async fn inbound(&self, conn: ConnId, frame: Frame) {
        let _ = self
            .sender
            .send(CoordinatorMessage::Inbound { conn, frame })
            .await;
    }

    /// Report unparsable input on a connection.
    pub async fn malformed(&self, conn: ConnId, info: String) {
        let _ = self
            .sender
            .send(CoordinatorMessage::Malformed { conn, info })
            .await;
    }

    /// Report a closed channel.
    pub async fn closed(&self, conn: ConnId) {
        let _ = self.sender.send(CoordinatorMessage::Closed { conn }).await;
    }

    /// Report a reconnect target that could not be reached.
    pub async fn peer_unreachable(&self, id: String) {
        let _ = self
            .sender
            .send(CoordinatorMessage::PeerUnreachable { id })
            .await;
    }

    /// Report that every reconnect target failed.
    pub async fn reconnect_failed(&self, failed_parent: String) {
        let _ = self
            .sender
            .send(CoordinatorMessage::ReconnectFailed { failed_parent })
            .await;
    }

    /// Current directory snapshot.
    pub async fn snapshot(&self) -> Result<DirectorySnapshot, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CoordinatorMessage::Snapshot { respond_to: tx })
            .await
            .map_err(|e| NodeError::Internal(format!("mailbox send failed: {e}")))?;
        rx.await
            .map_err(|e| NodeError::Internal(format!("response receive failed: {e}")))
    }

    /// Current node status.
    pub async fn status(&self) -> Result<NodeStatus, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CoordinatorMessage::Status { respond_to: tx })
            .await
            .map_err(|e| NodeError::Internal(format!("mailbox send failed: {e}")))?;
        rx.await
            .map_err(|e| NodeError::Internal(format!("response receive failed: {e}")))
    }

    /// Graceful shutdown: notify the parent, close every channel, stop.
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CoordinatorMessage::Shutdown { respond_to: tx })
            .await
            .map_err(|e| NodeError::Internal(format!("mailbox send failed: {e}")))?;
        rx.await
            .map_err(|e| NodeError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the actor (immediate shutdown).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token connection tasks tie their lifetime to.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// One live connection as the coordinator sees it.
struct ConnEntry {
    outbound: mpsc::UnboundedSender<OutboundCmd>,
    kind: ConnKind,
}

/// The `SessionCoordinator` implementation.
pub struct SessionCoordinator {
    config: Arc<Config>,
    receiver: mpsc::Receiver<CoordinatorMessage>,
    /// Handle to ourselves, for background tasks that call back.
    self_handle: SessionCoordinatorHandle,
    cancel: CancellationToken,
    directory: ClientDirectory,
    topology: ServerTopology,
    conns: HashMap<ConnId, ConnEntry>,
    next_conn: u64,
    tick: u64,
    shutting_down: bool,
}

impl SessionCoordinator {
    fn new(
        config: Arc<Config>,
        receiver: mpsc::Receiver<CoordinatorMessage>,
        self_handle: SessionCoordinatorHandle,
    ) -> Self {
        let topology = ServerTopology::new(config.peer_info());
        let cancel = self_handle.cancel_token();
        Self {
            config,
            receiver,
            self_handle,
            cancel,
            directory: ClientDirectory::new(),
            topology,
            conns: HashMap::new(),
            next_conn: 0,
            tick: 0,
            shutting_down: false,
        }
    }

    /// Run the actor loop.
    #[instrument(skip_all, name = "arbor.coordinator", fields(node_id = %self.config.node_id))]
    async fn run(mut self) {
        info!(
            target: "arbor.coordinator",
            node_id = %self.config.node_id,
            "SessionCoordinator started"
        );

        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    self.close_all();
                    break;
                }

                _ = ticker.tick() => self.on_tick(),

                msg = self.receiver.recv() => match msg {
                    Some(message) => self.handle_message(message),
                    None => break,
                }
            }
        }

        info!(
            target: "arbor.coordinator",
            node_id = %self.config.node_id,
            ticks = self.tick,
            "SessionCoordinator stopped"
        );
    }

    fn handle_message(&mut self, message: CoordinatorMessage) {
        match message {
            CoordinatorMessage::Attach {
                outbound,
                respond_to,
            } => {
                let conn = self.next_conn_id();
                self.conns.insert(
                    conn,
                    ConnEntry {
                        outbound,
                        kind: ConnKind::Pending,
                    },
                );
                debug!(target: "arbor.coordinator", conn = %conn, "connection attached");
                let _ = respond_to.send(conn);
            }

            CoordinatorMessage::AttachParent {
                outbound,
                peer,
                grandparent,
                sibling,
                directory,
                respond_to,
            } => {
                let conn = self.handle_attach_parent(outbound, peer, grandparent, sibling, &directory);
                let _ = respond_to.send(conn);
            }

            CoordinatorMessage::Inbound { conn, frame } => self.handle_inbound(conn, frame),

            CoordinatorMessage::Malformed { conn, info } => {
                let err = NodeError::Malformed(info);
                warn!(target: "arbor.coordinator", conn = %conn, error = %err, "malformed input");
                self.reply_invalid(conn, err.client_info());
            }

            CoordinatorMessage::Closed { conn } => self.on_closed(conn),

            CoordinatorMessage::PeerUnreachable { id } => {
                self.topology.mark_timed_out(&id);
            }

            CoordinatorMessage::ReconnectFailed { failed_parent } => {
                self.on_reconnect_failed(&failed_parent);
            }

            CoordinatorMessage::Snapshot { respond_to } => {
                let _ = respond_to.send(self.directory.snapshot());
            }

            CoordinatorMessage::Status { respond_to } => {
                let _ = respond_to.send(self.status());
            }

            CoordinatorMessage::Shutdown { respond_to } => {
                self.handle_shutdown();
                let _ = respond_to.send(());
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    fn handle_inbound(&mut self, conn: ConnId, frame: Frame) {
        let Some(entry) = self.conns.get(&conn) else {
            return;
        };

        let gate = dispatch::gate_for(&frame);
        if gate == Gate::Terminal {
            debug!(
                target: "arbor.coordinator",
                conn = %conn,
                command = frame.command(),
                "terminal frame received, closing"
            );
            self.close_conn(conn);
            return;
        }
        if !dispatch::permitted(gate, &entry.kind) {
            let err = NodeError::Unauthorized(frame.command());
            warn!(target: "arbor.coordinator", conn = %conn, error = %err, "rejected frame");
            self.reply_invalid(conn, err.client_info());
            return;
        }

        match frame {
            Frame::Authenticate {
                secret,
                id,
                hostname,
                port,
                directory,
            } => self.handle_authenticate(conn, &secret, id, hostname, port, &directory),

            Frame::Register { username, secret } => self.handle_register(conn, username, secret),

            Frame::LockRequest { username, secret } => {
                self.handle_lock_request(conn, username, secret);
            }
            Frame::LockAllowed { username, secret } => {
                self.handle_lock_allowed(conn, username, secret);
            }
            Frame::LockDenied { username, secret } => {
                self.handle_lock_denied(conn, username, secret);
            }

            Frame::Login { username, secret } => self.handle_login(conn, username, secret),
            Frame::Logout => self.handle_logout(conn),

            Frame::LogoutBroadcast {
                username,
                secret,
                token,
            } => {
                self.directory.apply_logout_broadcast(&username, token);
                self.broadcast_servers(
                    Frame::LogoutBroadcast {
                        username,
                        secret,
                        token,
                    },
                    Some(conn),
                );
            }

            Frame::AnonLogoutBroadcast {
                username,
                secret,
                token,
            } => {
                self.directory.apply_anon_logout(&username);
                self.broadcast_servers(
                    Frame::AnonLogoutBroadcast {
                        username,
                        secret,
                        token,
                    },
                    Some(conn),
                );
            }

            Frame::ActivityMessage {
                username,
                secret,
                activity,
            } => self.handle_activity_message(conn, &username, secret.as_deref(), activity),

            Frame::ActivityBroadcast {
                activity,
                username,
                token,
                delivery,
            } => {
                self.directory
                    .apply_remote_activity(&username, token, activity.clone(), &delivery);
                self.broadcast_servers(
                    Frame::ActivityBroadcast {
                        activity,
                        username,
                        token,
                        delivery,
                    },
                    Some(conn),
                );
            }

            Frame::ActivityDelivered {
                username,
                token,
                recipient,
                count,
            } => {
                self.directory
                    .apply_delivered(&username, token, recipient.as_deref(), count);
                self.broadcast_servers(
                    Frame::ActivityDelivered {
                        username,
                        token,
                        recipient,
                        count,
                    },
                    Some(conn),
                );
            }

            Frame::ServerAnnounce {
                id,
                load,
                hostname,
                port,
            } => {
                if id != self.config.node_id {
                    self.topology.upsert_known(
                        &PeerInfo {
                            id: id.clone(),
                            hostname: hostname.clone(),
                            port,
                        },
                        load,
                    );
                    self.broadcast_servers(
                        Frame::ServerAnnounce {
                            id,
                            load,
                            hostname,
                            port,
                        },
                        Some(conn),
                    );
                }
            }

            Frame::GrandparentUpdate { grandparent } => {
                self.topology.set_grandparent(grandparent.as_ref());
            }
            Frame::SiblingUpdate { sibling } => {
                self.topology.set_sibling_root(sibling.as_ref());
            }

            Frame::ServerQuit { id } => {
                self.topology.mark_timed_out(&id);
                self.broadcast_servers(Frame::ServerQuit { id }, Some(conn));
            }

            // Rejected by the gate above.
            Frame::AuthenticationSuccess { .. }
            | Frame::AuthenticationFail { .. }
            | Frame::RegisterSuccess { .. }
            | Frame::RegisterFailed { .. }
            | Frame::LoginSuccess { .. }
            | Frame::LoginFailed { .. }
            | Frame::Redirect { .. }
            | Frame::InvalidMessage { .. } => {}
        }
    }

    // ------------------------------------------------------------------
    // Server authentication and topology
    // ------------------------------------------------------------------

    fn handle_authenticate(
        &mut self,
        conn: ConnId,
        secret: &str,
        id: String,
        hostname: String,
        port: u16,
        directory: &DirectorySnapshot,
    ) {
        if secret != self.config.network_secret.expose_secret() {
            warn!(
                target: "arbor.coordinator",
                conn = %conn,
                peer_id = %id,
                "server presented a wrong network secret"
            );
            self.send(
                conn,
                Frame::AuthenticationFail {
                    info: "the supplied secret is incorrect".to_string(),
                },
            );
            self.close_conn(conn);
            return;
        }

        let peer = PeerInfo {
            id: id.clone(),
            hostname,
            port,
        };
        self.directory.merge_snapshot(directory);
        self.topology.record_child(&peer);

        // The joiner's grandparent is our parent; its sibling anchor is our
        // root child (itself, when it just became the anchor).
        let grandparent = self.topology.parent().map(PeerNode::info);
        let sibling = self.topology.root_child();

        if let Some(entry) = self.conns.get_mut(&conn) {
            entry.kind = ConnKind::Server(ServerPeer {
                id: id.clone(),
                role: ServerRole::Child,
            });
        }

        self.send(
            conn,
            Frame::AuthenticationSuccess {
                id: self.config.node_id.clone(),
                hostname: self.config.advertised_hostname.clone(),
                port: self.config.advertised_port,
                directory: self.directory.snapshot(),
                grandparent,
                sibling: sibling.clone(),
            },
        );

        // Existing children learn the anchor.
        self.broadcast_children_except(Frame::SiblingUpdate { sibling }, Some(conn));

        info!(
            target: "arbor.coordinator",
            conn = %conn,
            peer_id = %id,
            children = self.topology.children().len(),
            "child server authenticated"
        );
    }

    fn handle_attach_parent(
        &mut self,
        outbound: mpsc::UnboundedSender<OutboundCmd>,
        peer: PeerInfo,
        grandparent: Option<PeerInfo>,
        sibling: Option<PeerInfo>,
        directory: &DirectorySnapshot,
    ) -> ConnId {
        let conn = self.next_conn_id();
        self.conns.insert(
            conn,
            ConnEntry {
                outbound,
                kind: ConnKind::Server(ServerPeer {
                    id: peer.id.clone(),
                    role: ServerRole::Parent,
                }),
            },
        );

        if self.topology.parent().is_some() {
            warn!(
                target: "arbor.coordinator",
                peer_id = %peer.id,
                "adopting a new parent while one is already recorded"
            );
        }
        self.topology.set_parent(&peer);
        self.topology.set_grandparent(grandparent.as_ref());
        self.topology.set_sibling_root(sibling.as_ref());
        self.directory.merge_snapshot(directory);

        let was_reconnecting = self.topology.is_reconnecting();
        self.topology.finish_reconnect();
        if was_reconnecting {
            // The children's grandparent is our new parent.
            self.broadcast_children(Frame::GrandparentUpdate {
                grandparent: Some(peer.clone()),
            });
        }

        info!(
            target: "arbor.coordinator",
            conn = %conn,
            parent_id = %peer.id,
            reconnect = was_reconnecting,
            "parent link established"
        );
        conn
    }

    fn on_closed(&mut self, conn: ConnId) {
        let Some(entry) = self.conns.remove(&conn) else {
            return;
        };
        match entry.kind {
            ConnKind::Pending => {}

            ConnKind::Client(client) => {
                debug!(
                    target: "arbor.coordinator",
                    conn = %conn,
                    username = %client.username,
                    "client channel closed"
                );
                if client.logged_in {
                    self.logout_side_effects(&client);
                }
            }

            ConnKind::Server(peer) => match peer.role {
                ServerRole::Child => {
                    self.topology.mark_timed_out(&peer.id);
                    if let Some(new_anchor) = self.topology.remove_child(&peer.id) {
                        self.broadcast_children(Frame::SiblingUpdate {
                            sibling: new_anchor,
                        });
                    }
                    info!(
                        target: "arbor.coordinator",
                        peer_id = %peer.id,
                        "child server disconnected"
                    );
                }
                ServerRole::Parent => self.on_parent_lost(&peer.id),
            },
        }
    }

    fn on_parent_lost(&mut self, parent_id: &str) {
        self.topology.mark_timed_out(parent_id);
        self.topology.clear_parent();
        if self.shutting_down {
            return;
        }
        if !self.topology.begin_reconnect() {
            debug!(
                target: "arbor.coordinator",
                parent_id = %parent_id,
                "parent loss ignored, reconnection already in progress"
            );
            return;
        }

        warn!(
            target: "arbor.coordinator",
            parent_id = %parent_id,
            "parent link lost, starting recovery"
        );

        match self.topology.reconnect_plan(parent_id) {
            ReconnectPlan::PromoteToRoot => {
                self.topology.finish_reconnect();
                self.promote_to_root();
            }
            ReconnectPlan::GiveUp => {
                self.topology.finish_reconnect();
                error!(
                    target: "arbor.coordinator",
                    parent_id = %parent_id,
                    "unrepairable partition: no grandparent, no candidates"
                );
            }
            ReconnectPlan::Try(targets) => {
                let task = run_reconnect(
                    self.self_handle.clone(),
                    Arc::clone(&self.config),
                    targets,
                    self.directory.snapshot(),
                    parent_id.to_string(),
                    self.cancel.clone(),
                );
                tokio::spawn(task);
            }
        }
    }

    fn on_reconnect_failed(&mut self, failed_parent: &str) {
        self.topology.finish_reconnect();
        if self.topology.is_root_sibling() {
            self.promote_to_root();
        } else {
            error!(
                target: "arbor.coordinator",
                parent_id = %failed_parent,
                "unrepairable partition: every reconnect target failed"
            );
        }
    }

    fn promote_to_root(&mut self) {
        self.topology.clear_parent();
        self.topology.set_grandparent(None);
        self.topology.set_sibling_root(None);
        self.broadcast_children(Frame::GrandparentUpdate { grandparent: None });
        info!(
            target: "arbor.coordinator",
            node_id = %self.config.node_id,
            "self-promoted to root after parent loss"
        );
    }

    // ------------------------------------------------------------------
    // Registration lock protocol
    // ------------------------------------------------------------------

    fn handle_register(&mut self, conn: ConnId, username: String, secret: String) {
        if self.directory.contains(&username) {
            let err = NodeError::RegistrationConflict(username);
            self.send(
                conn,
                Frame::RegisterFailed {
                    info: err.client_info(),
                },
            );
            self.close_conn(conn);
            return;
        }
        if let Err(e) = self.directory.insert_registered(&username, &secret) {
            warn!(target: "arbor.coordinator", error = %e, "registration insert failed");
            return;
        }

        let others = self.topology.known_count() as u64;
        let client = ConnectedClient {
            username: username.clone(),
            secret: Some(secret.clone()),
            lock_countdown: others,
            registered: others == 0,
            logged_in: false,
            pending_since_tick: (others > 0).then_some(self.tick),
            redirected: false,
        };
        if let Some(entry) = self.conns.get_mut(&conn) {
            entry.kind = ConnKind::Client(client);
        }

        if others == 0 {
            self.send(
                conn,
                Frame::RegisterSuccess {
                    info: format!("register success for {username}"),
                },
            );
        } else {
            debug!(
                target: "arbor.coordinator",
                conn = %conn,
                username = %username,
                lock_replies = others,
                "registration pending lock replies"
            );
            self.broadcast_servers(Frame::LockRequest { username, secret }, None);
        }
    }

    fn handle_lock_request(&mut self, from: ConnId, username: String, secret: String) {
        if self.directory.contains(&username) {
            // Conflict: the denial floods to every neighbor, the sender
            // included, and the name is not stored.
            self.broadcast_servers(Frame::LockDenied { username, secret }, None);
            return;
        }
        self.directory.store_locked(&username, &secret);
        self.broadcast_servers(
            Frame::LockRequest {
                username: username.clone(),
                secret: secret.clone(),
            },
            Some(from),
        );
        self.broadcast_servers(Frame::LockAllowed { username, secret }, None);
    }

    fn handle_lock_allowed(&mut self, from: ConnId, username: String, secret: String) {
        // The original requester consumes the reply.
        let mut finalize = None;
        let mut consumed = false;
        for (id, entry) in &mut self.conns {
            if let ConnKind::Client(client) = &mut entry.kind {
                if !client.registered
                    && client.lock_countdown > 0
                    && client.username == username
                    && client.secret.as_deref() == Some(secret.as_str())
                {
                    client.lock_countdown -= 1;
                    consumed = true;
                    if client.lock_countdown == 0 {
                        client.registered = true;
                        client.pending_since_tick = None;
                        finalize = Some(*id);
                    }
                    break;
                }
            }
        }
        if consumed {
            if let Some(conn) = finalize {
                self.send(
                    conn,
                    Frame::RegisterSuccess {
                        info: format!("register success for {username}"),
                    },
                );
            }
            return;
        }
        self.broadcast_servers(Frame::LockAllowed { username, secret }, Some(from));
    }

    fn handle_lock_denied(&mut self, from: ConnId, username: String, secret: String) {
        self.directory.remove(&username);

        let mut failed = None;
        for (id, entry) in &self.conns {
            if let ConnKind::Client(client) = &entry.kind {
                if !client.registered
                    && client.username == username
                    && client.secret.as_deref() == Some(secret.as_str())
                {
                    failed = Some(*id);
                    break;
                }
            }
        }
        if let Some(conn) = failed {
            let err = NodeError::RegistrationConflict(username.clone());
            self.send(
                conn,
                Frame::RegisterFailed {
                    info: err.client_info(),
                },
            );
            self.close_conn(conn);
        }
        self.broadcast_servers(Frame::LockDenied { username, secret }, Some(from));
    }

    // ------------------------------------------------------------------
    // Client sessions
    // ------------------------------------------------------------------

    fn handle_login(&mut self, conn: ConnId, username: String, secret: Option<String>) {
        if username == ANONYMOUS_USERNAME {
            let generated = generate_anonymous_username();
            let session_secret = uuid::Uuid::new_v4().to_string();
            self.directory.insert_anonymous(&generated);
            if let Some(entry) = self.conns.get_mut(&conn) {
                entry.kind = ConnKind::Client(ConnectedClient {
                    username: generated.clone(),
                    secret: Some(session_secret.clone()),
                    lock_countdown: 0,
                    registered: false,
                    logged_in: true,
                    pending_since_tick: None,
                    redirected: false,
                });
            }
            // Replicate the ephemeral identity like a registration claim.
            self.broadcast_servers(
                Frame::LockRequest {
                    username: generated.clone(),
                    secret: session_secret,
                },
                None,
            );
            // Acknowledge only after the claim had a chance to propagate;
            // the wait happens off the actor so other sessions keep moving.
            if let Some(entry) = self.conns.get(&conn) {
                let out = entry.outbound.clone();
                let delay = self.config.anon_login_delay();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = out.send(OutboundCmd::Frame(Frame::LoginSuccess {
                        info: format!("logged in as {generated}"),
                    }));
                });
            }
            return;
        }

        let secret = secret.unwrap_or_default();
        match self.directory.verify_login(&username, &secret) {
            Ok(()) => {
                if let Some(record) = self.directory.get_mut(&username) {
                    record.set_logged_in(true);
                }
                if let Some(entry) = self.conns.get_mut(&conn) {
                    entry.kind = ConnKind::Client(ConnectedClient {
                        username: username.clone(),
                        secret: Some(secret),
                        lock_countdown: 0,
                        registered: true,
                        logged_in: true,
                        pending_since_tick: None,
                        redirected: false,
                    });
                }
                self.send(
                    conn,
                    Frame::LoginSuccess {
                        info: format!("logged in as {username}"),
                    },
                );
            }
            Err(err) => {
                self.send(
                    conn,
                    Frame::LoginFailed {
                        info: err.client_info(),
                    },
                );
                self.close_conn(conn);
            }
        }
    }

    fn handle_logout(&mut self, conn: ConnId) {
        let client = match self.conns.get(&conn) {
            Some(ConnEntry {
                kind: ConnKind::Client(client),
                ..
            }) => client.clone(),
            _ => return,
        };
        self.logout_side_effects(&client);
        self.close_conn(conn);
    }

    /// Directory update + broadcast for a departing logged-in client.
    fn logout_side_effects(&mut self, client: &ConnectedClient) {
        let secret = client.secret.clone().unwrap_or_default();
        if is_anonymous_username(&client.username) {
            let seq = self
                .directory
                .get(&client.username)
                .map_or(1, |r| r.login_seq() + 1);
            self.directory.remove(&client.username);
            self.broadcast_servers(
                Frame::AnonLogoutBroadcast {
                    username: client.username.clone(),
                    secret,
                    token: seq,
                },
                None,
            );
        } else if let Some(record) = self.directory.get_mut(&client.username) {
            if let Some(seq) = record.set_logged_in(false) {
                self.broadcast_servers(
                    Frame::LogoutBroadcast {
                        username: client.username.clone(),
                        secret,
                        token: seq,
                    },
                    None,
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Activities
    // ------------------------------------------------------------------

    fn handle_activity_message(
        &mut self,
        conn: ConnId,
        username: &str,
        secret: Option<&str>,
        activity: Value,
    ) {
        let (session_username, session_secret) = {
            let Some(ConnEntry {
                kind: ConnKind::Client(client),
                ..
            }) = self.conns.get(&conn)
            else {
                return;
            };
            (client.username.clone(), client.secret.clone())
        };

        // The presented identity must be the session's own.
        let identity_ok = if is_anonymous_username(&session_username) {
            username == ANONYMOUS_USERNAME || username == session_username
        } else {
            username == session_username && secret == session_secret.as_deref()
        };
        if !identity_ok {
            self.reply_invalid(
                conn,
                "username and secret do not match the logged in session".to_string(),
            );
            return;
        }

        let Value::Object(mut object) = activity else {
            self.reply_invalid(conn, "activity must be a JSON object".to_string());
            return;
        };
        object.insert(
            "authenticated_user".to_string(),
            Value::String(session_username.clone()),
        );
        let activity = Value::Object(object);

        let created = match self.directory.create_activity(&session_username, activity) {
            Ok(created) => created,
            Err(e) => {
                warn!(target: "arbor.coordinator", error = %e, "activity rejected");
                return;
            }
        };

        // Echo to the sender: its own delivery.
        self.send(
            conn,
            Frame::ActivityMessage {
                username: session_username.clone(),
                secret: None,
                activity: created.activity.clone(),
            },
        );
        // Replicate before the receipts so per-channel FIFO keeps order.
        self.broadcast_servers(
            Frame::ActivityBroadcast {
                activity: created.activity.clone(),
                username: session_username.clone(),
                token: created.token,
                delivery: created.delivery.clone(),
            },
            None,
        );

        match &created.delivery {
            DeliverySnapshot::Named { .. } => {
                self.directory.apply_delivered(
                    &session_username,
                    created.token,
                    Some(&session_username),
                    None,
                );
                self.broadcast_servers(
                    Frame::ActivityDelivered {
                        username: session_username.clone(),
                        token: created.token,
                        recipient: Some(session_username),
                        count: None,
                    },
                    None,
                );
            }
            DeliverySnapshot::Counted { .. } => {
                // Fan out to the other local clients now; the echo already
                // covered the sender.
                if let Some(record) = self.directory.get_mut(&session_username) {
                    let _ = record.take_counted_fanout();
                }
                let others: Vec<ConnId> = self
                    .logged_in_clients()
                    .into_iter()
                    .filter(|(c, _)| *c != conn)
                    .map(|(c, _)| c)
                    .collect();
                for peer in &others {
                    self.send(
                        *peer,
                        Frame::ActivityBroadcast {
                            activity: created.activity.clone(),
                            username: session_username.clone(),
                            token: created.token,
                            delivery: created.delivery.clone(),
                        },
                    );
                }
                let delivered = 1 + others.len() as u64;
                self.directory.apply_delivered(
                    &session_username,
                    created.token,
                    None,
                    Some(delivered),
                );
                self.broadcast_servers(
                    Frame::ActivityDelivered {
                        username: session_username,
                        token: created.token,
                        recipient: None,
                        count: Some(delivered),
                    },
                    None,
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Periodic work
    // ------------------------------------------------------------------

    fn on_tick(&mut self) {
        self.tick += 1;
        self.sweep_deliveries();
        self.evaluate_redirect();
        self.expire_pending_registrations();
        if self.tick % self.config.gossip_period_ticks == 0 {
            self.gossip();
        }
    }

    /// Flush every message owed to a locally connected, logged-in client,
    /// flooding a receipt per delivery.
    fn sweep_deliveries(&mut self) {
        let clients = self.logged_in_clients();
        if clients.is_empty() {
            return;
        }

        for (conn, username) in &clients {
            let deliveries = self.directory.drain_named_for(username);
            for delivery in deliveries {
                self.send(
                    *conn,
                    Frame::ActivityBroadcast {
                        activity: delivery.activity,
                        username: delivery.origin.clone(),
                        token: delivery.token,
                        delivery: delivery.delivery,
                    },
                );
                self.broadcast_servers(
                    Frame::ActivityDelivered {
                        username: delivery.origin,
                        token: delivery.token,
                        recipient: Some(username.clone()),
                        count: None,
                    },
                    None,
                );
            }
        }

        // Counted messages fan out to every local client exactly once.
        let fanouts = self.directory.take_counted_fanouts();
        for fanout in fanouts {
            for (conn, _) in &clients {
                self.send(
                    *conn,
                    Frame::ActivityBroadcast {
                        activity: fanout.activity.clone(),
                        username: fanout.origin.clone(),
                        token: fanout.token,
                        delivery: fanout.delivery.clone(),
                    },
                );
            }
            let delivered = clients.len() as u64;
            self.directory
                .apply_delivered(&fanout.origin, fanout.token, None, Some(delivered));
            self.broadcast_servers(
                Frame::ActivityDelivered {
                    username: fanout.origin,
                    token: fanout.token,
                    recipient: None,
                    count: Some(delivered),
                },
                None,
            );
        }
    }

    /// At most one redirect per tick: pick the first logged-in client not
    /// already redirected and point it at a sufficiently less-loaded server.
    fn evaluate_redirect(&mut self) {
        let local_load = self.client_count() as u64;
        let Some(target) = self.topology.redirect_target(local_load) else {
            return;
        };
        let candidate = self.conns.iter_mut().find_map(|(id, entry)| {
            if let ConnKind::Client(client) = &mut entry.kind {
                if client.logged_in && !client.redirected {
                    client.redirected = true;
                    return Some((*id, entry.outbound.clone()));
                }
            }
            None
        });
        let Some((conn, out)) = candidate else {
            return;
        };

        info!(
            target: "arbor.coordinator",
            conn = %conn,
            target_id = %target.id,
            local_load = local_load,
            "redirecting client to a less loaded server"
        );
        // The completion delay runs off the actor.
        let delay = self.config.redirect_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = out.send(OutboundCmd::Frame(Frame::Redirect {
                hostname: target.hostname,
                port: target.port,
            }));
            let _ = out.send(OutboundCmd::Close);
        });
    }

    /// Fail registrations whose lock replies never completed.
    fn expire_pending_registrations(&mut self) {
        let deadline = self.config.registration_timeout_ticks;
        let expired: Vec<(ConnId, String)> = self
            .conns
            .iter()
            .filter_map(|(id, entry)| {
                if let ConnKind::Client(client) = &entry.kind {
                    if let Some(since) = client.pending_since_tick {
                        if !client.registered && self.tick.saturating_sub(since) >= deadline {
                            return Some((*id, client.username.clone()));
                        }
                    }
                }
                None
            })
            .collect();

        for (conn, username) in expired {
            warn!(
                target: "arbor.coordinator",
                conn = %conn,
                username = %username,
                "registration timed out waiting for lock replies"
            );
            self.directory.remove(&username);
            self.send(
                conn,
                Frame::RegisterFailed {
                    info: format!("registration of {username} timed out"),
                },
            );
            self.close_conn(conn);
        }
    }

    fn gossip(&mut self) {
        let announce = Frame::ServerAnnounce {
            id: self.config.node_id.clone(),
            load: self.client_count() as u64,
            hostname: self.config.advertised_hostname.clone(),
            port: self.config.advertised_port,
        };
        self.broadcast_servers(announce, None);
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    fn next_conn_id(&mut self) -> ConnId {
        self.next_conn += 1;
        ConnId(self.next_conn)
    }

    fn send(&self, conn: ConnId, frame: Frame) {
        if let Some(entry) = self.conns.get(&conn) {
            let _ = entry.outbound.send(OutboundCmd::Frame(frame));
        }
    }

    /// One `INVALID_MESSAGE`, then close: the reply every rejected message
    /// gets, regardless of command.
    fn reply_invalid(&mut self, conn: ConnId, info: String) {
        self.send(conn, Frame::InvalidMessage { info });
        self.close_conn(conn);
    }

    fn close_conn(&mut self, conn: ConnId) {
        if let Some(entry) = self.conns.remove(&conn) {
            let _ = entry.outbound.send(OutboundCmd::Close);
        }
    }

    fn close_all(&mut self) {
        for entry in self.conns.values() {
            let _ = entry.outbound.send(OutboundCmd::Close);
        }
        self.conns.clear();
    }

    fn handle_shutdown(&mut self) {
        self.shutting_down = true;
        if let Some(parent) = self.parent_conn() {
            self.send(
                parent,
                Frame::ServerQuit {
                    id: self.config.node_id.clone(),
                },
            );
        }
        self.close_all();
        self.cancel.cancel();
    }

    fn broadcast_servers(&self, frame: Frame, except: Option<ConnId>) {
        for (id, entry) in &self.conns {
            if matches!(entry.kind, ConnKind::Server(_)) && Some(*id) != except {
                let _ = entry.outbound.send(OutboundCmd::Frame(frame.clone()));
            }
        }
    }

    fn broadcast_children(&self, frame: Frame) {
        self.broadcast_children_except(frame, None);
    }

    fn broadcast_children_except(&self, frame: Frame, except: Option<ConnId>) {
        for (id, entry) in &self.conns {
            if matches!(
                entry.kind,
                ConnKind::Server(ServerPeer {
                    role: ServerRole::Child,
                    ..
                })
            ) && Some(*id) != except
            {
                let _ = entry.outbound.send(OutboundCmd::Frame(frame.clone()));
            }
        }
    }

    fn parent_conn(&self) -> Option<ConnId> {
        self.conns.iter().find_map(|(id, entry)| {
            matches!(
                entry.kind,
                ConnKind::Server(ServerPeer {
                    role: ServerRole::Parent,
                    ..
                })
            )
            .then_some(*id)
        })
    }

    fn logged_in_clients(&self) -> Vec<(ConnId, String)> {
        self.conns
            .iter()
            .filter_map(|(id, entry)| {
                if let ConnKind::Client(client) = &entry.kind {
                    client.logged_in.then(|| (*id, client.username.clone()))
                } else {
                    None
                }
            })
            .collect()
    }

    fn client_count(&self) -> usize {
        self.conns
            .values()
            .filter(|e| matches!(e.kind, ConnKind::Client(_)))
            .count()
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.config.node_id.clone(),
            client_count: self.client_count(),
            server_count: self
                .conns
                .values()
                .filter(|e| matches!(e.kind, ConnKind::Server(_)))
                .count(),
            parent: self.topology.parent().map(|p| p.id.clone()),
            grandparent: self.topology.grandparent().map(|g| g.id.clone()),
            sibling: self.topology.sibling_root().map(|s| s.id.clone()),
            known: self
                .topology
                .known()
                .iter()
                .map(|n| (n.id.clone(), n.load))
                .collect(),
            usernames: self.directory.usernames(),
            reconnecting: self.topology.is_reconnecting(),
            is_root: self.topology.parent().is_none(),
        }
    }
}

/// Try each reconnect target in order; the first successful handshake
/// adopts that server as the new parent via the coordinator mailbox.
async fn run_reconnect(
    handle: SessionCoordinatorHandle,
    config: Arc<Config>,
    targets: Vec<PeerInfo>,
    snapshot: DirectorySnapshot,
    failed_parent: String,
    cancel: CancellationToken,
) {
    for target in targets {
        info!(
            target: "arbor.coordinator",
            target_id = %target.id,
            "attempting reconnect"
        );
        match connection::establish_parent(&config, &target, snapshot.clone(), &handle, cancel.clone())
            .await
        {
            Ok(()) => return,
            Err(e) => {
                warn!(
                    target: "arbor.coordinator",
                    target_id = %target.id,
                    error = %e,
                    "reconnect target failed"
                );
                handle.peer_unreachable(target.id).await;
            }
        }
    }
    handle.reconnect_failed(failed_parent).await;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use arbor_protocol::RecordKindSnapshot;
    use serde_json::json;
    use std::collections::HashMap as StdHashMap;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    fn test_config() -> Arc<Config> {
        let vars = StdHashMap::from([
            ("ARBOR_NETWORK_SECRET".to_string(), "net-secret".to_string()),
            ("ARBOR_NODE_ID".to_string(), "node-test".to_string()),
            ("ARBOR_TICK_INTERVAL_MS".to_string(), "100".to_string()),
        ]);
        Arc::new(Config::from_vars(&vars).expect("test config"))
    }

    async fn attach(
        handle: &SessionCoordinatorHandle,
    ) -> (ConnId, UnboundedReceiver<OutboundCmd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = handle.attach(tx).await.expect("attach");
        (conn, rx)
    }

    /// Receive frames until one matches, skipping gossip and other
    /// interleavings. Panics (via expect) after two seconds.
    async fn expect_frame<F>(rx: &mut UnboundedReceiver<OutboundCmd>, mut matches: F) -> Frame
    where
        F: FnMut(&Frame) -> bool,
    {
        let deadline = Duration::from_secs(2);
        loop {
            let cmd = timeout(deadline, rx.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("channel closed while waiting for frame");
            if let OutboundCmd::Frame(frame) = cmd {
                if matches(&frame) {
                    return frame;
                }
            }
        }
    }

    async fn expect_close(rx: &mut UnboundedReceiver<OutboundCmd>) {
        let deadline = Duration::from_secs(2);
        loop {
            let cmd = timeout(deadline, rx.recv())
                .await
                .expect("timed out waiting for close")
                .expect("channel closed while waiting for close");
            if matches!(cmd, OutboundCmd::Close) {
                return;
            }
        }
    }

    /// Authenticate a fake child server and consume the success reply.
    async fn attach_server(
        handle: &SessionCoordinatorHandle,
        id: &str,
    ) -> (ConnId, UnboundedReceiver<OutboundCmd>) {
        let (conn, mut rx) = attach(handle).await;
        handle
            .inbound(
                conn,
                Frame::Authenticate {
                    secret: "net-secret".to_string(),
                    id: id.to_string(),
                    hostname: "localhost".to_string(),
                    port: 4000,
                    directory: DirectorySnapshot::default(),
                },
            )
            .await;
        expect_frame(&mut rx, |f| {
            matches!(f, Frame::AuthenticationSuccess { .. })
        })
        .await;
        (conn, rx)
    }

    #[tokio::test]
    async fn test_register_with_no_known_servers_succeeds_immediately() {
        let (handle, _task) = SessionCoordinatorHandle::spawn(test_config());
        let (conn, mut rx) = attach(&handle).await;

        handle
            .inbound(
                conn,
                Frame::Register {
                    username: "alice".to_string(),
                    secret: "s1".to_string(),
                },
            )
            .await;

        expect_frame(&mut rx, |f| matches!(f, Frame::RegisterSuccess { .. })).await;
        handle.cancel();
    }

    #[tokio::test]
    async fn test_register_conflict_fails_and_closes() {
        let (handle, _task) = SessionCoordinatorHandle::spawn(test_config());

        let (first, mut first_rx) = attach(&handle).await;
        handle
            .inbound(
                first,
                Frame::Register {
                    username: "alice".to_string(),
                    secret: "s1".to_string(),
                },
            )
            .await;
        expect_frame(&mut first_rx, |f| matches!(f, Frame::RegisterSuccess { .. })).await;

        let (second, mut second_rx) = attach(&handle).await;
        handle
            .inbound(
                second,
                Frame::Register {
                    username: "alice".to_string(),
                    secret: "other".to_string(),
                },
            )
            .await;

        expect_frame(&mut second_rx, |f| matches!(f, Frame::RegisterFailed { .. })).await;
        expect_close(&mut second_rx).await;
        handle.cancel();
    }

    #[tokio::test]
    async fn test_authenticate_wrong_secret_rejected() {
        let (handle, _task) = SessionCoordinatorHandle::spawn(test_config());
        let (conn, mut rx) = attach(&handle).await;

        handle
            .inbound(
                conn,
                Frame::Authenticate {
                    secret: "wrong".to_string(),
                    id: "node-b".to_string(),
                    hostname: "localhost".to_string(),
                    port: 4000,
                    directory: DirectorySnapshot::default(),
                },
            )
            .await;

        expect_frame(&mut rx, |f| matches!(f, Frame::AuthenticationFail { .. })).await;
        expect_close(&mut rx).await;
        handle.cancel();
    }

    #[tokio::test]
    async fn test_first_child_gets_itself_as_sibling_anchor() {
        let (handle, _task) = SessionCoordinatorHandle::spawn(test_config());
        let (conn, mut rx) = attach(&handle).await;

        handle
            .inbound(
                conn,
                Frame::Authenticate {
                    secret: "net-secret".to_string(),
                    id: "node-b".to_string(),
                    hostname: "localhost".to_string(),
                    port: 4000,
                    directory: DirectorySnapshot::default(),
                },
            )
            .await;

        let frame = expect_frame(&mut rx, |f| {
            matches!(f, Frame::AuthenticationSuccess { .. })
        })
        .await;
        let Frame::AuthenticationSuccess {
            sibling,
            grandparent,
            ..
        } = frame
        else {
            unreachable!();
        };
        assert_eq!(sibling.map(|s| s.id), Some("node-b".to_string()));
        // This node is the root, so the joiner has no grandparent.
        assert!(grandparent.is_none());
        handle.cancel();
    }

    #[tokio::test]
    async fn test_registration_finalizes_after_lock_allowed() {
        let (handle, _task) = SessionCoordinatorHandle::spawn(test_config());
        let (server, mut server_rx) = attach_server(&handle, "node-b").await;

        let (client, mut client_rx) = attach(&handle).await;
        handle
            .inbound(
                client,
                Frame::Register {
                    username: "alice".to_string(),
                    secret: "s1".to_string(),
                },
            )
            .await;

        // The claim floods to the only neighbor.
        expect_frame(&mut server_rx, |f| {
            matches!(f, Frame::LockRequest { username, .. } if username == "alice")
        })
        .await;

        // The neighbor allows it; the countdown reaches zero.
        handle
            .inbound(
                server,
                Frame::LockAllowed {
                    username: "alice".to_string(),
                    secret: "s1".to_string(),
                },
            )
            .await;

        expect_frame(&mut client_rx, |f| matches!(f, Frame::RegisterSuccess { .. })).await;
        handle.cancel();
    }

    #[tokio::test]
    async fn test_lock_denied_fails_pending_registration() {
        let (handle, _task) = SessionCoordinatorHandle::spawn(test_config());
        let (server, mut server_rx) = attach_server(&handle, "node-b").await;

        let (client, mut client_rx) = attach(&handle).await;
        handle
            .inbound(
                client,
                Frame::Register {
                    username: "bob".to_string(),
                    secret: "s2".to_string(),
                },
            )
            .await;
        expect_frame(&mut server_rx, |f| matches!(f, Frame::LockRequest { .. })).await;

        handle
            .inbound(
                server,
                Frame::LockDenied {
                    username: "bob".to_string(),
                    secret: "s2".to_string(),
                },
            )
            .await;

        expect_frame(&mut client_rx, |f| matches!(f, Frame::RegisterFailed { .. })).await;
        expect_close(&mut client_rx).await;

        // The locked name was released.
        let status = handle.status().await.unwrap();
        assert!(!status.usernames.contains(&"bob".to_string()));
        handle.cancel();
    }

    #[tokio::test]
    async fn test_lock_request_for_known_name_floods_denial() {
        let (handle, _task) = SessionCoordinatorHandle::spawn(test_config());

        // bob registers locally first (no other servers known yet).
        let (client, mut client_rx) = attach(&handle).await;
        handle
            .inbound(
                client,
                Frame::Register {
                    username: "bob".to_string(),
                    secret: "s2".to_string(),
                },
            )
            .await;
        expect_frame(&mut client_rx, |f| matches!(f, Frame::RegisterSuccess { .. })).await;

        let (server, mut server_rx) = attach_server(&handle, "node-b").await;
        handle
            .inbound(
                server,
                Frame::LockRequest {
                    username: "bob".to_string(),
                    secret: "elsewhere".to_string(),
                },
            )
            .await;

        expect_frame(&mut server_rx, |f| {
            matches!(f, Frame::LockDenied { username, .. } if username == "bob")
        })
        .await;
        handle.cancel();
    }

    #[tokio::test]
    async fn test_anonymous_login_ack_and_replication() {
        let (handle, _task) = SessionCoordinatorHandle::spawn(test_config());
        let (_server, mut server_rx) = attach_server(&handle, "node-b").await;

        let (client, mut client_rx) = attach(&handle).await;
        handle
            .inbound(
                client,
                Frame::Login {
                    username: "anonymous".to_string(),
                    secret: None,
                },
            )
            .await;

        // The ephemeral identity floods as a lock claim.
        let frame = expect_frame(&mut server_rx, |f| matches!(f, Frame::LockRequest { .. })).await;
        let Frame::LockRequest { username, .. } = frame else {
            unreachable!();
        };
        assert!(username.starts_with("anonymous"));

        // The ack arrives after the propagation delay.
        expect_frame(&mut client_rx, |f| matches!(f, Frame::LoginSuccess { .. })).await;
        handle.cancel();
    }

    #[tokio::test]
    async fn test_activity_echo_and_broadcast() {
        let (handle, _task) = SessionCoordinatorHandle::spawn(test_config());
        let (_server, mut server_rx) = attach_server(&handle, "node-b").await;

        let (client, mut client_rx) = attach(&handle).await;
        handle
            .inbound(
                client,
                Frame::Login {
                    username: "anonymous".to_string(),
                    secret: None,
                },
            )
            .await;
        expect_frame(&mut client_rx, |f| matches!(f, Frame::LoginSuccess { .. })).await;

        handle
            .inbound(
                client,
                Frame::ActivityMessage {
                    username: "anonymous".to_string(),
                    secret: None,
                    activity: json!({"x": 1}),
                },
            )
            .await;

        // Echo with the authenticated user injected.
        let echo = expect_frame(&mut client_rx, |f| {
            matches!(f, Frame::ActivityMessage { .. })
        })
        .await;
        let Frame::ActivityMessage { activity, .. } = echo else {
            unreachable!();
        };
        assert_eq!(activity.get("x"), Some(&json!(1)));
        let authenticated = activity.get("authenticated_user").unwrap();
        assert!(authenticated.as_str().unwrap().starts_with("anonymous"));

        // Replicated to the neighbor with token metadata.
        let broadcast = expect_frame(&mut server_rx, |f| {
            matches!(f, Frame::ActivityBroadcast { .. })
        })
        .await;
        let Frame::ActivityBroadcast { token, .. } = broadcast else {
            unreachable!();
        };
        assert_eq!(token, 1);
        handle.cancel();
    }

    #[tokio::test]
    async fn test_client_disconnect_broadcasts_logout() {
        let (handle, _task) = SessionCoordinatorHandle::spawn(test_config());
        let (server, mut server_rx) = attach_server(&handle, "node-b").await;

        // A registered user logs in, then the channel drops.
        let (client, mut client_rx) = attach(&handle).await;
        handle
            .inbound(
                client,
                Frame::Register {
                    username: "alice".to_string(),
                    secret: "s1".to_string(),
                },
            )
            .await;
        // One neighbor known: resolve the lock flow first.
        expect_frame(&mut server_rx, |f| matches!(f, Frame::LockRequest { .. })).await;
        handle
            .inbound(
                server,
                Frame::LockAllowed {
                    username: "alice".to_string(),
                    secret: "s1".to_string(),
                },
            )
            .await;
        expect_frame(&mut client_rx, |f| matches!(f, Frame::RegisterSuccess { .. })).await;

        handle
            .inbound(
                client,
                Frame::Login {
                    username: "alice".to_string(),
                    secret: Some("s1".to_string()),
                },
            )
            .await;
        expect_frame(&mut client_rx, |f| matches!(f, Frame::LoginSuccess { .. })).await;

        handle.closed(client).await;

        expect_frame(&mut server_rx, |f| {
            matches!(f, Frame::LogoutBroadcast { username, .. } if username == "alice")
        })
        .await;
        handle.cancel();
    }

    #[tokio::test]
    async fn test_snapshot_reflects_merged_directory() {
        let (handle, _task) = SessionCoordinatorHandle::spawn(test_config());

        let snapshot = DirectorySnapshot {
            records: vec![arbor_protocol::RecordSnapshot {
                username: "carol".to_string(),
                kind: RecordKindSnapshot::Registered {
                    secret: "s3".to_string(),
                },
                next_token: 1,
                received_up_to: 0,
                login_seq: 0,
                logged_in: false,
                messages: vec![],
                undeliverable: vec![],
            }],
        };

        let (conn, mut rx) = attach(&handle).await;
        handle
            .inbound(
                conn,
                Frame::Authenticate {
                    secret: "net-secret".to_string(),
                    id: "node-b".to_string(),
                    hostname: "localhost".to_string(),
                    port: 4000,
                    directory: snapshot,
                },
            )
            .await;
        expect_frame(&mut rx, |f| {
            matches!(f, Frame::AuthenticationSuccess { .. })
        })
        .await;

        let ours = handle.snapshot().await.unwrap();
        assert!(ours.records.iter().any(|r| r.username == "carol"));
        handle.cancel();
    }

    #[tokio::test]
    async fn test_unauthorized_command_gets_invalid_message() {
        let (handle, _task) = SessionCoordinatorHandle::spawn(test_config());
        let (conn, mut rx) = attach(&handle).await;

        // A pending connection may not speak server protocol.
        handle
            .inbound(
                conn,
                Frame::ServerAnnounce {
                    id: "node-x".to_string(),
                    load: 0,
                    hostname: "localhost".to_string(),
                    port: 4000,
                },
            )
            .await;

        expect_frame(&mut rx, |f| matches!(f, Frame::InvalidMessage { .. })).await;
        expect_close(&mut rx).await;
        handle.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_notifies_parent_and_closes() {
        let (handle, _task) = SessionCoordinatorHandle::spawn(test_config());

        // Fake an established parent link.
        let (tx, mut parent_rx) = mpsc::unbounded_channel();
        handle
            .attach_parent(
                tx,
                PeerInfo {
                    id: "node-parent".to_string(),
                    hostname: "localhost".to_string(),
                    port: 3779,
                },
                None,
                None,
                DirectorySnapshot::default(),
            )
            .await
            .unwrap();

        handle.shutdown().await.unwrap();

        expect_frame(&mut parent_rx, |f| {
            matches!(f, Frame::ServerQuit { id } if id == "node-test")
        })
        .await;
        expect_close(&mut parent_rx).await;
        assert!(handle.is_cancelled());
    }
}
