//! # Arbor Test Utilities
//!
//! Shared helpers for integration tests: spawn real nodes on ephemeral
//! ports and drive them with a scripted wire-level client.
//!
//! ```rust,ignore
//! use arbor_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let root = spawn_node("node-root", None).await;
//!     let child = spawn_node("node-child", Some(root.local_addr.port())).await;
//!
//!     let mut client = TestClient::connect(child.local_addr).await;
//!     client.login_anonymous().await;
//! }
//! ```

pub mod client;
pub mod node;

pub use client::TestClient;
pub use node::{spawn_node, wait_for_status, TEST_NETWORK_SECRET, TEST_TICK_MS};
