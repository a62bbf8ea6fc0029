//! Authorization gate for inbound frames.
//!
//! Every command maps to the session class allowed to send it; the
//! coordinator checks the gate before any handler runs. The match is
//! exhaustive, so adding a frame without deciding who may send it is a
//! compile error.

use crate::actors::messages::{ConnKind, ConnectedClient};
use arbor_protocol::Frame;

/// Who may send a given command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Only a connection that has not authenticated or logged in yet.
    PendingOnly,
    /// Only an authenticated server link.
    ServerOnly,
    /// A client-side connection that is not logged in (a fresh connection
    /// or one that has registered but not yet logged in).
    ClientNotLoggedIn,
    /// A logged-in client session.
    ClientLoggedIn,
    /// Replies this node sends; never valid inbound.
    Never,
    /// Accepted from anyone; terminal for the connection.
    Terminal,
}

/// The gate for one frame.
#[must_use]
pub fn gate_for(frame: &Frame) -> Gate {
    match frame {
        Frame::Authenticate { .. } => Gate::PendingOnly,

        Frame::LockRequest { .. }
        | Frame::LockAllowed { .. }
        | Frame::LockDenied { .. }
        | Frame::LogoutBroadcast { .. }
        | Frame::AnonLogoutBroadcast { .. }
        | Frame::ActivityBroadcast { .. }
        | Frame::ActivityDelivered { .. }
        | Frame::ServerAnnounce { .. }
        | Frame::GrandparentUpdate { .. }
        | Frame::SiblingUpdate { .. }
        | Frame::ServerQuit { .. } => Gate::ServerOnly,

        Frame::Register { .. } | Frame::Login { .. } => Gate::ClientNotLoggedIn,

        Frame::Logout | Frame::ActivityMessage { .. } => Gate::ClientLoggedIn,

        Frame::AuthenticationSuccess { .. }
        | Frame::RegisterSuccess { .. }
        | Frame::RegisterFailed { .. }
        | Frame::LoginSuccess { .. }
        | Frame::LoginFailed { .. }
        | Frame::Redirect { .. } => Gate::Never,

        Frame::AuthenticationFail { .. } | Frame::InvalidMessage { .. } => Gate::Terminal,
    }
}

/// Whether a connection in state `kind` passes `gate`.
#[must_use]
pub fn permitted(gate: Gate, kind: &ConnKind) -> bool {
    match gate {
        Gate::PendingOnly => matches!(kind, ConnKind::Pending),
        Gate::ServerOnly => matches!(kind, ConnKind::Server(_)),
        Gate::ClientNotLoggedIn => matches!(
            kind,
            ConnKind::Pending | ConnKind::Client(ConnectedClient { logged_in: false, .. })
        ),
        Gate::ClientLoggedIn => {
            matches!(kind, ConnKind::Client(ConnectedClient { logged_in: true, .. }))
        }
        Gate::Never => false,
        Gate::Terminal => true,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::messages::{ServerPeer, ServerRole};

    fn client(logged_in: bool) -> ConnKind {
        ConnKind::Client(ConnectedClient {
            username: "alice".to_string(),
            secret: Some("s1".to_string()),
            lock_countdown: 0,
            registered: true,
            logged_in,
            pending_since_tick: None,
            redirected: false,
        })
    }

    fn server() -> ConnKind {
        ConnKind::Server(ServerPeer {
            id: "node-b".to_string(),
            role: ServerRole::Child,
        })
    }

    #[test]
    fn test_authenticate_only_from_pending() {
        let frame = Frame::Authenticate {
            secret: "s".to_string(),
            id: "node-b".to_string(),
            hostname: "localhost".to_string(),
            port: 3781,
            directory: arbor_protocol::DirectorySnapshot::default(),
        };
        let gate = gate_for(&frame);
        assert!(permitted(gate, &ConnKind::Pending));
        assert!(!permitted(gate, &server()));
        assert!(!permitted(gate, &client(false)));
    }

    #[test]
    fn test_server_commands_require_authenticated_server() {
        let frame = Frame::LockRequest {
            username: "alice".to_string(),
            secret: "s1".to_string(),
        };
        let gate = gate_for(&frame);
        assert!(permitted(gate, &server()));
        assert!(!permitted(gate, &ConnKind::Pending));
        assert!(!permitted(gate, &client(true)));
    }

    #[test]
    fn test_login_requires_not_logged_in() {
        let frame = Frame::Login {
            username: "alice".to_string(),
            secret: Some("s1".to_string()),
        };
        let gate = gate_for(&frame);
        assert!(permitted(gate, &ConnKind::Pending));
        assert!(permitted(gate, &client(false)));
        assert!(!permitted(gate, &client(true)));
        assert!(!permitted(gate, &server()));
    }

    #[test]
    fn test_activity_requires_logged_in_client() {
        let frame = Frame::ActivityMessage {
            username: "alice".to_string(),
            secret: Some("s1".to_string()),
            activity: serde_json::json!({}),
        };
        let gate = gate_for(&frame);
        assert!(permitted(gate, &client(true)));
        assert!(!permitted(gate, &client(false)));
        assert!(!permitted(gate, &server()));
    }

    #[test]
    fn test_replies_never_valid_inbound() {
        let frame = Frame::Redirect {
            hostname: "localhost".to_string(),
            port: 3781,
        };
        let gate = gate_for(&frame);
        assert!(!permitted(gate, &ConnKind::Pending));
        assert!(!permitted(gate, &server()));
        assert!(!permitted(gate, &client(true)));
    }

    #[test]
    fn test_invalid_message_terminal_from_anyone() {
        let frame = Frame::InvalidMessage {
            info: "bad".to_string(),
        };
        let gate = gate_for(&frame);
        assert_eq!(gate, Gate::Terminal);
        assert!(permitted(gate, &ConnKind::Pending));
        assert!(permitted(gate, &server()));
    }
}
