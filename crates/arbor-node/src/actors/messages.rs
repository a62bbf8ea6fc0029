//! Message and session types for the coordinator actor.

use arbor_protocol::{DirectorySnapshot, Frame, PeerInfo};
use std::fmt;
use tokio::sync::{mpsc, oneshot};

/// Identifier for one live connection owned by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Command to a connection's writer task.
#[derive(Debug)]
pub enum OutboundCmd {
    /// Write one frame.
    Frame(Frame),
    /// Flush and close the socket.
    Close,
}

/// Which side of the tree an authenticated server link is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRole {
    Parent,
    Child,
}

/// Session state of an authenticated server link.
#[derive(Debug, Clone)]
pub struct ServerPeer {
    pub id: String,
    pub role: ServerRole,
}

/// Ephemeral session state of a client connection; destroyed on disconnect.
#[derive(Debug, Clone)]
pub struct ConnectedClient {
    /// Directory key this session acts as.
    pub username: String,
    /// Credential presented at registration/login (generated for anonymous
    /// sessions).
    pub secret: Option<String>,
    /// Lock replies still outstanding for a pending registration.
    pub lock_countdown: u64,
    /// Registration finalized network-wide.
    pub registered: bool,
    pub logged_in: bool,
    /// Tick at which the pending registration started, for timeout.
    pub pending_since_tick: Option<u64>,
    /// A redirect has been issued; don't pick this session again.
    pub redirected: bool,
}

/// What a connection currently is, as far as authorization is concerned.
#[derive(Debug)]
pub enum ConnKind {
    /// In the holding list: neither an authenticated server nor a client
    /// session yet.
    Pending,
    /// Authenticated server link.
    Server(ServerPeer),
    /// Client session (possibly mid-registration, possibly logged in).
    Client(ConnectedClient),
}

/// Coordinator mailbox messages.
pub enum CoordinatorMessage {
    /// A freshly accepted connection registers its writer queue.
    Attach {
        outbound: mpsc::UnboundedSender<OutboundCmd>,
        respond_to: oneshot::Sender<ConnId>,
    },
    /// An outbound handshake succeeded: adopt this link as our parent.
    AttachParent {
        outbound: mpsc::UnboundedSender<OutboundCmd>,
        peer: PeerInfo,
        grandparent: Option<PeerInfo>,
        sibling: Option<PeerInfo>,
        directory: DirectorySnapshot,
        respond_to: oneshot::Sender<ConnId>,
    },
    /// A frame arrived on a connection.
    Inbound { conn: ConnId, frame: Frame },
    /// A connection produced unparsable input.
    Malformed { conn: ConnId, info: String },
    /// A connection's channel closed.
    Closed { conn: ConnId },
    /// A reconnect attempt could not reach this server.
    PeerUnreachable { id: String },
    /// Every reconnect target failed.
    ReconnectFailed { failed_parent: String },
    /// Current directory snapshot (for outbound handshakes).
    Snapshot {
        respond_to: oneshot::Sender<DirectorySnapshot>,
    },
    /// Current node status (primarily for tests and logging).
    Status {
        respond_to: oneshot::Sender<NodeStatus>,
    },
    /// Graceful shutdown: notify the parent, close every channel.
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Snapshot of the coordinator's state.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub node_id: String,
    /// Client sessions currently attached.
    pub client_count: usize,
    /// Authenticated server links currently attached.
    pub server_count: usize,
    pub parent: Option<String>,
    pub grandparent: Option<String>,
    pub sibling: Option<String>,
    /// Known-server table as (id, load) pairs, insertion order.
    pub known: Vec<(String, u64)>,
    /// Every username in the directory.
    pub usernames: Vec<String>,
    pub reconnecting: bool,
    pub is_root: bool,
}
