//! A scripted wire-level client for integration tests.

use arbor_protocol::{Frame, FrameCodec};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

/// How long an expectation may wait before the test fails.
const EXPECT_TIMEOUT: Duration = Duration::from_secs(5);

/// One client connection speaking the Arbor wire protocol.
pub struct TestClient {
    framed: Framed<TcpStream, FrameCodec>,
}

impl TestClient {
    /// Connect to a node.
    ///
    /// # Panics
    ///
    /// Panics when the connection cannot be established.
    pub async fn connect(addr: SocketAddr) -> Self {
        #[allow(clippy::expect_used)]
        let stream = TcpStream::connect(addr).await.expect("connect test client");
        Self {
            framed: Framed::new(stream, FrameCodec::default()),
        }
    }

    /// Send one frame.
    ///
    /// # Panics
    ///
    /// Panics when the write fails.
    pub async fn send(&mut self, frame: Frame) {
        #[allow(clippy::expect_used)]
        self.framed.send(frame).await.expect("send frame");
    }

    /// Write raw bytes (for malformed-input tests). A newline is appended.
    ///
    /// # Panics
    ///
    /// Panics when the write fails.
    pub async fn send_raw(&mut self, line: &str) {
        let stream = self.framed.get_mut();
        #[allow(clippy::expect_used)]
        stream
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("send raw line");
    }

    /// Next frame, if the peer sends one before closing.
    ///
    /// # Panics
    ///
    /// Panics on a codec error or when nothing arrives in time.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        #[allow(clippy::expect_used)]
        match timeout(EXPECT_TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for frame")
        {
            Some(result) => Some(result.expect("codec error")),
            None => None,
        }
    }

    /// Next frame within `wait`, or None when nothing arrived or the
    /// connection closed.
    pub async fn try_next(&mut self, wait: Duration) -> Option<Frame> {
        match timeout(wait, self.framed.next()).await {
            Ok(Some(Ok(frame))) => Some(frame),
            _ => None,
        }
    }

    /// Receive frames until one matches, skipping unrelated traffic
    /// (deliveries, redirect offers on other tests' schedule, and so on).
    ///
    /// # Panics
    ///
    /// Panics when the connection closes or nothing matches in time.
    pub async fn expect<F>(&mut self, mut matches: F) -> Frame
    where
        F: FnMut(&Frame) -> bool,
    {
        let deadline = tokio::time::Instant::now() + EXPECT_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            #[allow(clippy::expect_used)]
            let next = timeout(remaining, self.framed.next())
                .await
                .expect("timed out waiting for matching frame");
            #[allow(clippy::expect_used)]
            let frame = next
                .expect("connection closed while waiting for matching frame")
                .expect("codec error");
            if matches(&frame) {
                return frame;
            }
        }
    }

    /// Wait for the server to close the connection, tolerating frames that
    /// were already in flight.
    ///
    /// # Panics
    ///
    /// Panics when the connection stays open.
    pub async fn expect_closed(&mut self) {
        let deadline = tokio::time::Instant::now() + EXPECT_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            #[allow(clippy::expect_used)]
            let next = timeout(remaining, self.framed.next())
                .await
                .expect("timed out waiting for close");
            match next {
                None => return,
                Some(Ok(_)) => {}
                // A reset counts as closed.
                Some(Err(_)) => return,
            }
        }
    }

    /// Log in anonymously and wait for the acknowledgment. Returns the
    /// assigned identity when the server names one.
    ///
    /// # Panics
    ///
    /// Panics when the login is not acknowledged.
    pub async fn login_anonymous(&mut self) -> Frame {
        self.send(Frame::Login {
            username: "anonymous".to_string(),
            secret: None,
        })
        .await;
        self.expect(|f| matches!(f, Frame::LoginSuccess { .. })).await
    }

    /// Register and wait for the verdict.
    pub async fn register(&mut self, username: &str, secret: &str) -> Frame {
        self.send(Frame::Register {
            username: username.to_string(),
            secret: secret.to_string(),
        })
        .await;
        self.expect(|f| {
            matches!(
                f,
                Frame::RegisterSuccess { .. } | Frame::RegisterFailed { .. }
            )
        })
        .await
    }

    /// Log in as a registered user and wait for the verdict.
    pub async fn login(&mut self, username: &str, secret: &str) -> Frame {
        self.send(Frame::Login {
            username: username.to_string(),
            secret: Some(secret.to_string()),
        })
        .await;
        self.expect(|f| matches!(f, Frame::LoginSuccess { .. } | Frame::LoginFailed { .. }))
            .await
    }
}
