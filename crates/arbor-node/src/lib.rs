//! Arbor relay node library.
//!
//! An Arbor node is one server in a tree of relay servers that together
//! replicate a directory of client identities and their pending activity
//! messages:
//!
//! - clients connect to any node, register a username (or log in
//!   anonymously), and exchange activity messages with per-user ordering
//!   guarantees;
//! - servers authenticate to each other with a shared network secret and
//!   keep the directory consistent via snapshot merges, flooded broadcasts,
//!   and per-record token ordering;
//! - username registration is protected by a flood-based distributed lock,
//!   so no two servers can register the same name concurrently;
//! - a lost parent link is repaired by reconnecting through the recorded
//!   grandparent, the gossip candidate queue, or self-promotion to root.
//!
//! # Architecture
//!
//! ```text
//! SessionCoordinator (singleton actor per node)
//! ├── owns ClientDirectory, ServerTopology, connection maps
//! ├── drives the periodic tick (delivery sweep, redirects, gossip)
//! └── fed by per-connection reader tasks
//!     └── writer task per connection drains an outbound queue
//! ```
//!
//! All shared-state mutation happens inside the coordinator; connection
//! tasks only parse, forward, and write.
//!
//! # Modules
//!
//! - [`actors`] - the coordinator actor and per-connection I/O tasks
//! - [`config`] - node configuration from environment
//! - [`directory`] - the replicated client directory
//! - [`dispatch`] - per-command authorization gate
//! - [`errors`] - error taxonomy
//! - [`server`] - listener/bootstrap runtime
//! - [`topology`] - tree links, gossip table, reconnection policy

pub mod actors;
pub mod config;
pub mod directory;
pub mod dispatch;
pub mod errors;
pub mod server;
pub mod topology;

pub use actors::{NodeStatus, SessionCoordinatorHandle};
pub use config::Config;
pub use errors::NodeError;
pub use server::{start, RunningNode};
