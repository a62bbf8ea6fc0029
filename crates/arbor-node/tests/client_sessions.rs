//! End-to-end client session flows against a single node.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use arbor_protocol::Frame;
use arbor_test_utils::{spawn_node, TestClient};
use serde_json::json;

#[tokio::test]
async fn test_anonymous_login_and_activity_echo() {
    let node = spawn_node("node-solo", None).await;

    let mut alice = TestClient::connect(node.local_addr).await;
    alice.login_anonymous().await;

    let mut bob = TestClient::connect(node.local_addr).await;
    bob.login_anonymous().await;

    alice
        .send(Frame::ActivityMessage {
            username: "anonymous".to_string(),
            secret: None,
            activity: json!({"x": 1}),
        })
        .await;

    // The sender gets its activity echoed with the authenticated user
    // injected.
    let echo = alice
        .expect(|f| matches!(f, Frame::ActivityMessage { .. }))
        .await;
    let Frame::ActivityMessage { activity, .. } = echo else {
        unreachable!();
    };
    assert_eq!(activity.get("x"), Some(&json!(1)));
    let authenticated = activity.get("authenticated_user").unwrap();
    assert!(authenticated.as_str().unwrap().starts_with("anonymous"));

    // The other client receives the broadcast form.
    let broadcast = bob
        .expect(|f| matches!(f, Frame::ActivityBroadcast { .. }))
        .await;
    let Frame::ActivityBroadcast { activity, .. } = broadcast else {
        unreachable!();
    };
    assert_eq!(activity.get("x"), Some(&json!(1)));

    node.shutdown().await;
}

#[tokio::test]
async fn test_registered_users_receive_activities_in_order() {
    let node = spawn_node("node-reg", None).await;

    let mut carol = TestClient::connect(node.local_addr).await;
    assert!(matches!(
        carol.register("carol", "s1").await,
        Frame::RegisterSuccess { .. }
    ));
    assert!(matches!(
        carol.login("carol", "s1").await,
        Frame::LoginSuccess { .. }
    ));

    let mut dave = TestClient::connect(node.local_addr).await;
    assert!(matches!(
        dave.register("dave", "s2").await,
        Frame::RegisterSuccess { .. }
    ));
    assert!(matches!(
        dave.login("dave", "s2").await,
        Frame::LoginSuccess { .. }
    ));

    for n in 1..=3 {
        carol
            .send(Frame::ActivityMessage {
                username: "carol".to_string(),
                secret: Some("s1".to_string()),
                activity: json!({"n": n}),
            })
            .await;
    }

    // Deliveries arrive on the sweep, in token order.
    let mut seen = Vec::new();
    for _ in 0..3 {
        let frame = dave
            .expect(|f| matches!(f, Frame::ActivityBroadcast { .. }))
            .await;
        let Frame::ActivityBroadcast {
            activity, token, ..
        } = frame
        else {
            unreachable!();
        };
        assert_eq!(activity.get("authenticated_user"), Some(&json!("carol")));
        seen.push(token);
    }
    assert_eq!(seen, vec![1, 2, 3]);

    node.shutdown().await;
}

#[tokio::test]
async fn test_login_with_wrong_secret_fails_and_closes() {
    let node = spawn_node("node-auth", None).await;

    let mut eve = TestClient::connect(node.local_addr).await;
    assert!(matches!(
        eve.register("eve", "right").await,
        Frame::RegisterSuccess { .. }
    ));

    let mut intruder = TestClient::connect(node.local_addr).await;
    assert!(matches!(
        intruder.login("eve", "wrong").await,
        Frame::LoginFailed { .. }
    ));
    intruder.expect_closed().await;

    node.shutdown().await;
}

#[tokio::test]
async fn test_malformed_input_gets_invalid_message_then_close() {
    let node = spawn_node("node-strict", None).await;

    let mut client = TestClient::connect(node.local_addr).await;
    client.send_raw("this is not json").await;

    client
        .expect(|f| matches!(f, Frame::InvalidMessage { .. }))
        .await;
    client.expect_closed().await;

    node.shutdown().await;
}

#[tokio::test]
async fn test_server_command_from_client_is_rejected() {
    let node = spawn_node("node-gate", None).await;

    let mut client = TestClient::connect(node.local_addr).await;
    client.login_anonymous().await;

    // A logged-in client may not speak server protocol.
    client
        .send(Frame::LockRequest {
            username: "mallory".to_string(),
            secret: "x".to_string(),
        })
        .await;

    client
        .expect(|f| matches!(f, Frame::InvalidMessage { .. }))
        .await;
    client.expect_closed().await;

    node.shutdown().await;
}
