//! Distributed registration-lock scenarios on real trees.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use arbor_protocol::Frame;
use arbor_test_utils::{spawn_node, wait_for_status, TestClient};

#[tokio::test]
async fn test_registration_succeeds_across_two_servers() {
    let root = spawn_node("node-b", None).await;
    let leaf = spawn_node("node-a", Some(root.local_addr.port())).await;
    wait_for_status(&leaf.handle, |s| s.parent.as_deref() == Some("node-b")).await;

    let mut alice = TestClient::connect(leaf.local_addr).await;
    assert!(matches!(
        alice.register("alice", "s1").await,
        Frame::RegisterSuccess { .. }
    ));

    // The locked name replicated to the other server.
    wait_for_status(&root.handle, |s| {
        s.usernames.contains(&"alice".to_string())
    })
    .await;

    leaf.shutdown().await;
    root.shutdown().await;
}

#[tokio::test]
async fn test_name_known_elsewhere_is_rejected() {
    let root = spawn_node("node-b", None).await;

    // bob registers on the root while it is still alone.
    let mut bob = TestClient::connect(root.local_addr).await;
    assert!(matches!(
        bob.register("bob", "s1").await,
        Frame::RegisterSuccess { .. }
    ));

    // A joining server inherits the directory, so a second registration of
    // the same name fails wherever it is attempted.
    let leaf = spawn_node("node-a", Some(root.local_addr.port())).await;
    wait_for_status(&leaf.handle, |s| s.usernames.contains(&"bob".to_string())).await;

    let mut imposter = TestClient::connect(leaf.local_addr).await;
    assert!(matches!(
        imposter.register("bob", "other").await,
        Frame::RegisterFailed { .. }
    ));
    imposter.expect_closed().await;

    leaf.shutdown().await;
    root.shutdown().await;
}

#[tokio::test]
async fn test_registration_race_allows_at_most_one_success() {
    // A line of three: a -> b -> c.
    let c = spawn_node("node-c", None).await;
    let b = spawn_node("node-b", Some(c.local_addr.port())).await;
    let a = spawn_node("node-a", Some(b.local_addr.port())).await;

    // Let gossip complete so both ends know the whole line.
    wait_for_status(&a.handle, |s| s.known.len() == 2).await;
    wait_for_status(&c.handle, |s| s.known.len() == 2).await;

    let mut client_a = TestClient::connect(a.local_addr).await;
    let mut client_c = TestClient::connect(c.local_addr).await;

    // Both claim the same name inside one propagation window.
    let (verdict_a, verdict_c) = tokio::join!(
        client_a.register("dave", "secret-a"),
        client_c.register("dave", "secret-c"),
    );

    let successes = [&verdict_a, &verdict_c]
        .iter()
        .filter(|f| matches!(f, Frame::RegisterSuccess { .. }))
        .count();
    assert!(
        successes <= 1,
        "both registrations succeeded: {verdict_a:?} / {verdict_c:?}"
    );

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

#[tokio::test]
async fn test_login_works_on_a_different_server_than_registration() {
    let root = spawn_node("node-b", None).await;
    let leaf = spawn_node("node-a", Some(root.local_addr.port())).await;
    wait_for_status(&leaf.handle, |s| s.parent.is_some()).await;

    let mut registrant = TestClient::connect(leaf.local_addr).await;
    assert!(matches!(
        registrant.register("frank", "s9").await,
        Frame::RegisterSuccess { .. }
    ));

    // The credential replicated with the lock flood; the root accepts the
    // login directly.
    wait_for_status(&root.handle, |s| {
        s.usernames.contains(&"frank".to_string())
    })
    .await;
    let mut roamer = TestClient::connect(root.local_addr).await;
    assert!(matches!(
        roamer.login("frank", "s9").await,
        Frame::LoginSuccess { .. }
    ));

    leaf.shutdown().await;
    root.shutdown().await;
}
