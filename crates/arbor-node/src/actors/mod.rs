//! Actor model implementation.
//!
//! One [`coordinator::SessionCoordinator`] per node owns all shared state;
//! [`connection`] holds the per-socket reader/writer tasks feeding it.

pub mod connection;
pub mod coordinator;
pub mod messages;

pub use connection::{establish_parent, serve_connection};
pub use coordinator::SessionCoordinatorHandle;
pub use messages::{
    ConnId, ConnKind, ConnectedClient, CoordinatorMessage, NodeStatus, OutboundCmd, ServerPeer,
    ServerRole,
};
