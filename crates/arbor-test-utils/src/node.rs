//! In-process node spawning for integration tests.

use arbor_node::{server, Config, NodeStatus, RunningNode, SessionCoordinatorHandle};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Shared network secret every test node uses.
pub const TEST_NETWORK_SECRET: &str = "test-network-secret";

/// Fast tick for tests; gossip fires every 5 ticks, anonymous login acks
/// after 1.5 ticks.
pub const TEST_TICK_MS: u64 = 100;

/// Reserve an ephemeral port. The listener is dropped before the node
/// binds, which is racy in principle but reliable in practice for tests.
fn free_port() -> u16 {
    #[allow(clippy::expect_used)]
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .expect("reserve ephemeral port")
}

/// Spawn a node on an ephemeral port, optionally joining a parent.
///
/// # Panics
///
/// Panics when the node cannot start; integration tests treat that as a
/// test failure.
pub async fn spawn_node(node_id: &str, parent_port: Option<u16>) -> RunningNode {
    let port = free_port();
    let mut vars = HashMap::from([
        (
            "ARBOR_NETWORK_SECRET".to_string(),
            TEST_NETWORK_SECRET.to_string(),
        ),
        ("ARBOR_NODE_ID".to_string(), node_id.to_string()),
        (
            "ARBOR_BIND_ADDRESS".to_string(),
            format!("127.0.0.1:{port}"),
        ),
        (
            "ARBOR_ADVERTISED_HOSTNAME".to_string(),
            "127.0.0.1".to_string(),
        ),
        ("ARBOR_ADVERTISED_PORT".to_string(), port.to_string()),
        (
            "ARBOR_TICK_INTERVAL_MS".to_string(),
            TEST_TICK_MS.to_string(),
        ),
    ]);
    if let Some(parent_port) = parent_port {
        vars.insert(
            "ARBOR_REMOTE_HOSTNAME".to_string(),
            "127.0.0.1".to_string(),
        );
        vars.insert("ARBOR_REMOTE_PORT".to_string(), parent_port.to_string());
    }

    #[allow(clippy::expect_used)]
    let config = Config::from_vars(&vars).expect("test node config");
    #[allow(clippy::expect_used)]
    server::start(config).await.expect("start test node")
}

/// Poll a node's status until `pred` holds, panicking after five seconds.
///
/// # Panics
///
/// Panics when the condition is not reached in time.
pub async fn wait_for_status<F>(handle: &SessionCoordinatorHandle, mut pred: F) -> NodeStatus
where
    F: FnMut(&NodeStatus) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(status) = handle.status().await {
            if pred(&status) {
                return status;
            }
            assert!(
                Instant::now() < deadline,
                "status condition not reached in time; last status: {status:?}"
            );
        } else {
            assert!(Instant::now() < deadline, "coordinator gone while waiting");
        }
        sleep(Duration::from_millis(25)).await;
    }
}
