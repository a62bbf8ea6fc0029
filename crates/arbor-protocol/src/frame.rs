//! Message catalogue for the Arbor protocol.
//!
//! One [`Frame`] variant per wire command. The enum is internally tagged on
//! `command` with SCREAMING_SNAKE_CASE names, so `{"command":"LOGIN",...}`
//! deserializes directly into [`Frame::Login`] and an unknown command or a
//! missing required field is a deserialization error the caller answers with
//! `INVALID_MESSAGE`.
//!
//! Directory snapshots ride along on `AUTHENTICATE` /
//! `AUTHENTICATION_SUCCESS` so that a freshly joined server starts from its
//! parent's view of the client directory.

use serde::{Deserialize, Serialize};

/// Identity of a server node as carried on the wire.
///
/// Load and liveness are tracked node-side; topology updates only need the
/// address triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Opaque node identifier. Two nodes with equal `id` are the same server.
    pub id: String,
    /// Advertised hostname other servers connect to.
    pub hostname: String,
    /// Advertised port other servers connect to.
    pub port: u16,
}

/// Snapshot of one server's entire client directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    /// One entry per known username.
    pub records: Vec<RecordSnapshot>,
}

/// Snapshot of a single directory record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSnapshot {
    /// Username keying the record.
    pub username: String,
    /// Registered (with credential) or anonymous.
    #[serde(flatten)]
    pub kind: RecordKindSnapshot,
    /// Next token this record will assign.
    pub next_token: u64,
    /// Highest contiguous token already delivered.
    pub received_up_to: u64,
    /// Login-state sequence number; an update is applied only if strictly
    /// greater than the stored one.
    pub login_seq: u64,
    /// Login state carried by `login_seq`.
    pub logged_in: bool,
    /// Deliverable message log, ascending tokens.
    pub messages: Vec<MessageSnapshot>,
    /// Messages whose token is not yet contiguous, ascending tokens.
    pub undeliverable: Vec<MessageSnapshot>,
}

/// Record variant marker within a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordKindSnapshot {
    /// A registered user with a stored credential.
    Registered {
        /// The credential presented at registration.
        secret: String,
    },
    /// An ephemeral anonymous identity.
    Anonymous,
}

/// Snapshot of one pending message in a record's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSnapshot {
    /// Token assigned by the origin record.
    pub token: u64,
    /// Opaque activity content, `authenticated_user` already injected.
    pub activity: serde_json::Value,
    /// Who still has to see this message.
    pub delivery: DeliverySnapshot,
}

/// Delivery-tracking state of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DeliverySnapshot {
    /// Fixed recipient set; `remaining` shrinks as receipts arrive.
    Named {
        /// All recipients, fixed at creation.
        all: Vec<String>,
        /// Recipients that have not yet acknowledged.
        remaining: Vec<String>,
    },
    /// Anonymous fan-out tracked as a countdown.
    Counted {
        /// Deliveries still outstanding.
        outstanding: u64,
    },
}

/// The Arbor wire catalogue.
///
/// Directions are enforced node-side by the dispatch gate: a client sending a
/// server-only command (or the other way round) is answered with
/// `INVALID_MESSAGE` and disconnected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frame {
    /// Server joins the tree: shared network secret plus the joiner's
    /// identity and directory snapshot.
    Authenticate {
        secret: String,
        id: String,
        hostname: String,
        port: u16,
        directory: DirectorySnapshot,
    },
    /// Parent accepts a joining server and hands back its own snapshot plus
    /// the joiner's place in the tree.
    AuthenticationSuccess {
        id: String,
        hostname: String,
        port: u16,
        directory: DirectorySnapshot,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        grandparent: Option<PeerInfo>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sibling: Option<PeerInfo>,
    },
    /// Shared secret rejected; terminal.
    AuthenticationFail { info: String },

    /// Client asks to register a username.
    Register { username: String, secret: String },
    /// Registration finalized network-wide.
    RegisterSuccess { info: String },
    /// Registration refused (local or flooded conflict); terminal.
    RegisterFailed { info: String },

    /// Distributed-registration lock claim, flooded through the tree.
    LockRequest { username: String, secret: String },
    /// A server has stored the claimed name; flooded back.
    LockAllowed { username: String, secret: String },
    /// A server already knew the claimed name; flooded, kills the claim.
    LockDenied { username: String, secret: String },

    /// Client login. `secret` is absent for anonymous logins.
    Login {
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
    },
    LoginSuccess { info: String },
    /// Credential mismatch or unknown user; terminal.
    LoginFailed { info: String },

    /// Client logs out; the connection closes after directory update.
    Logout,
    /// Registered-user logout, flooded with its login sequence number so
    /// duplicate application is a no-op.
    LogoutBroadcast {
        username: String,
        secret: String,
        token: u64,
    },
    /// Anonymous logout; receivers delete the ephemeral record.
    AnonLogoutBroadcast {
        username: String,
        secret: String,
        token: u64,
    },

    /// Client submits an activity; echoed back to the sender once accepted.
    ActivityMessage {
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
        activity: serde_json::Value,
    },
    /// Replicated activity, flooded server-to-server and delivered to
    /// clients. Carries the origin record and token so every server keeps
    /// its replica of the log in per-user order.
    ActivityBroadcast {
        activity: serde_json::Value,
        username: String,
        token: u64,
        delivery: DeliverySnapshot,
    },
    /// Flooded receipt: `recipient` for named messages, `count` for counted
    /// (anonymous-origin) messages.
    ActivityDelivered {
        username: String,
        token: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        count: Option<u64>,
    },

    /// Periodic load gossip, flooded.
    ServerAnnounce {
        id: String,
        load: u64,
        hostname: String,
        port: u16,
    },
    /// Parent tells its children who their grandparent now is (None at the
    /// root).
    GrandparentUpdate { grandparent: Option<PeerInfo> },
    /// Parent tells its children who their anchor sibling now is.
    SiblingUpdate { sibling: Option<PeerInfo> },

    /// Client must reconnect to a less-loaded server.
    Redirect { hostname: String, port: u16 },
    /// Orderly shutdown notice; receivers mark the node timed out.
    ServerQuit { id: String },

    /// Exactly one of these precedes every close caused by a rejected
    /// message.
    InvalidMessage { info: String },
}

impl Frame {
    /// Wire name of this frame's command, for logging and dispatch.
    #[must_use]
    pub const fn command(&self) -> &'static str {
        match self {
            Frame::Authenticate { .. } => "AUTHENTICATE",
            Frame::AuthenticationSuccess { .. } => "AUTHENTICATION_SUCCESS",
            Frame::AuthenticationFail { .. } => "AUTHENTICATION_FAIL",
            Frame::Register { .. } => "REGISTER",
            Frame::RegisterSuccess { .. } => "REGISTER_SUCCESS",
            Frame::RegisterFailed { .. } => "REGISTER_FAILED",
            Frame::LockRequest { .. } => "LOCK_REQUEST",
            Frame::LockAllowed { .. } => "LOCK_ALLOWED",
            Frame::LockDenied { .. } => "LOCK_DENIED",
            Frame::Login { .. } => "LOGIN",
            Frame::LoginSuccess { .. } => "LOGIN_SUCCESS",
            Frame::LoginFailed { .. } => "LOGIN_FAILED",
            Frame::Logout => "LOGOUT",
            Frame::LogoutBroadcast { .. } => "LOGOUT_BROADCAST",
            Frame::AnonLogoutBroadcast { .. } => "ANON_LOGOUT_BROADCAST",
            Frame::ActivityMessage { .. } => "ACTIVITY_MESSAGE",
            Frame::ActivityBroadcast { .. } => "ACTIVITY_BROADCAST",
            Frame::ActivityDelivered { .. } => "ACTIVITY_DELIVERED",
            Frame::ServerAnnounce { .. } => "SERVER_ANNOUNCE",
            Frame::GrandparentUpdate { .. } => "GRANDPARENT_UPDATE",
            Frame::SiblingUpdate { .. } => "SIBLING_UPDATE",
            Frame::Redirect { .. } => "REDIRECT",
            Frame::ServerQuit { .. } => "SERVER_QUIT",
            Frame::InvalidMessage { .. } => "INVALID_MESSAGE",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_tag_on_wire() {
        let frame = Frame::LockRequest {
            username: "alice".to_string(),
            secret: "s1".to_string(),
        };
        let wire = serde_json::to_string(&frame).unwrap();
        assert!(wire.contains(r#""command":"LOCK_REQUEST""#));
        assert!(wire.contains(r#""username":"alice""#));
    }

    #[test]
    fn test_round_trip_login_without_secret() {
        let frame = Frame::Login {
            username: "anonymous".to_string(),
            secret: None,
        };
        let wire = serde_json::to_string(&frame).unwrap();
        // Absent secret is omitted entirely, not serialized as null.
        assert!(!wire.contains("secret"));

        let back: Frame = serde_json::from_str(&wire).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn test_logout_is_bare_command() {
        let wire = serde_json::to_string(&Frame::Logout).unwrap();
        assert_eq!(wire, r#"{"command":"LOGOUT"}"#);
        let back: Frame = serde_json::from_str(r#"{"command":"LOGOUT"}"#).unwrap();
        assert_eq!(back, Frame::Logout);
    }

    #[test]
    fn test_unknown_command_rejected() {
        let result: Result<Frame, _> =
            serde_json::from_str(r#"{"command":"SELF_DESTRUCT","info":"now"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_required_field_rejected() {
        // REGISTER without a secret must not parse.
        let result: Result<Frame, _> =
            serde_json::from_str(r#"{"command":"REGISTER","username":"bob"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_activity_broadcast_round_trip() {
        let frame = Frame::ActivityBroadcast {
            activity: json!({"x": 1, "authenticated_user": "alice"}),
            username: "alice".to_string(),
            token: 7,
            delivery: DeliverySnapshot::Named {
                all: vec!["alice".to_string(), "bob".to_string()],
                remaining: vec!["bob".to_string()],
            },
        };
        let wire = serde_json::to_string(&frame).unwrap();
        let back: Frame = serde_json::from_str(&wire).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn test_directory_snapshot_round_trip() {
        let snapshot = DirectorySnapshot {
            records: vec![
                RecordSnapshot {
                    username: "alice".to_string(),
                    kind: RecordKindSnapshot::Registered {
                        secret: "s1".to_string(),
                    },
                    next_token: 3,
                    received_up_to: 2,
                    login_seq: 4,
                    logged_in: false,
                    messages: vec![MessageSnapshot {
                        token: 2,
                        activity: json!({"text": "hi"}),
                        delivery: DeliverySnapshot::Named {
                            all: vec!["bob".to_string()],
                            remaining: vec!["bob".to_string()],
                        },
                    }],
                    undeliverable: vec![],
                },
                RecordSnapshot {
                    username: "anonymous-1f2e3d4c".to_string(),
                    kind: RecordKindSnapshot::Anonymous,
                    next_token: 1,
                    received_up_to: 0,
                    login_seq: 1,
                    logged_in: true,
                    messages: vec![],
                    undeliverable: vec![],
                },
            ],
        };
        let frame = Frame::Authenticate {
            secret: "network".to_string(),
            id: "node-a".to_string(),
            hostname: "localhost".to_string(),
            port: 3780,
            directory: snapshot.clone(),
        };
        let wire = serde_json::to_string(&frame).unwrap();
        let back: Frame = serde_json::from_str(&wire).unwrap();
        let Frame::Authenticate { directory, .. } = back else {
            unreachable!("round trip changed the command tag");
        };
        assert_eq!(directory, snapshot);
    }

    #[test]
    fn test_command_name_matches_wire_tag() {
        let frames = [
            Frame::Logout,
            Frame::ServerQuit {
                id: "node-a".to_string(),
            },
            Frame::GrandparentUpdate { grandparent: None },
            Frame::AnonLogoutBroadcast {
                username: "anonymous-aa".to_string(),
                secret: String::new(),
                token: 1,
            },
        ];
        for frame in frames {
            let wire = serde_json::to_string(&frame).unwrap();
            assert!(
                wire.contains(&format!(r#""command":"{}""#, frame.command())),
                "command() disagrees with wire tag for {wire}"
            );
        }
    }
}
