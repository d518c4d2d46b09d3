//! WebSocket transport implementation using `tokio-tungstenite`.
//!
//! This module provides [`WebSocketTransport`], a [`Transport`] over one
//! session connection, and [`WebSocketConnector`], which opens a fresh
//! transport for the first attempt and for every reconnection. Both `ws://` and
//! `wss://` URLs are accepted; secure connections use rustls with the
//! `webpki-roots` certificate bundle.
//!
//! # Feature gate
//!
//! This module is only available when the `transport-websocket` feature is enabled
//! (it is enabled by default).
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), sibyl_client::SibylError> {
//! use sibyl_client::transport::Transport;
//! use sibyl_client::WebSocketTransport;
//!
//! let mut transport =
//!     WebSocketTransport::connect("ws://localhost:5000/ws?room=r1&token=t1").await?;
//! transport.send(r#"{"action":"reveal","room":"r1","token":"t1"}"#.to_string()).await?;
//!
//! if let Some(Ok(msg)) = transport.recv().await {
//!     println!("board: {msg}");
//! }
//!
//! transport.close(1000, "closing ok").await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};

use crate::error::SibylError;
use crate::transport::{Connector, Transport};

/// Type alias for the underlying WebSocket stream.
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A [`Transport`] backed by one WebSocket connection.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) is cancel-safe; dropping its future does not lose
/// a message, so it can sit in the session loop's `tokio::select!`.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WsStream,
    closed: bool,
}

impl WebSocketTransport {
    /// Open a WebSocket connection to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`SibylError::Io`] if the URL is invalid or the connection
    /// cannot be established. The [`ErrorKind`](std::io::ErrorKind) of an
    /// underlying I/O error is preserved.
    pub async fn connect(url: &str) -> Result<Self, SibylError> {
        tracing::debug!("connecting to session server");
        ensure_tls_provider();

        let (stream, _response) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
            let kind = match &e {
                tokio_tungstenite::tungstenite::Error::Io(io) => io.kind(),
                _ => std::io::ErrorKind::Other,
            };
            SibylError::Io(std::io::Error::new(kind, e))
        })?;

        Ok(Self::from_stream(stream))
    }

    /// Like [`connect`](Self::connect), but gives up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`SibylError::Timeout`] if the deadline elapses, or any error
    /// that [`connect`](Self::connect) may return.
    pub async fn connect_with_timeout(url: &str, timeout: Duration) -> Result<Self, SibylError> {
        tokio::time::timeout(timeout, Self::connect(url))
            .await
            .map_err(|_| SibylError::Timeout)?
    }

    /// Wrap an already-established stream, e.g. one with custom TLS settings.
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }
}

/// Installs the process-wide rustls crypto provider unless one is already set.
fn ensure_tls_provider() {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return;
    }
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("rustls crypto provider was installed concurrently");
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, message: String) -> Result<(), SibylError> {
        if self.closed {
            return Err(SibylError::TransportClosed);
        }
        self.stream
            .send(Message::Text(message.into()))
            .await
            .map_err(|e| SibylError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, SibylError>> {
        loop {
            let msg = match self.stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    return Some(Err(SibylError::TransportReceive(e.to_string())));
                }
                None => return None,
            };

            match msg {
                Message::Text(text) => return Some(Ok(text.to_string())),
                Message::Close(frame) => {
                    tracing::debug!(?frame, "received WebSocket close frame");
                    return None;
                }
                // tungstenite queues the pong itself.
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Binary(_) => {
                    tracing::warn!("received unexpected binary WebSocket frame, skipping");
                }
                Message::Frame(_) => {
                    tracing::debug!("received raw WebSocket frame, skipping");
                }
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), SibylError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        tracing::debug!(code, reason, "closing WebSocket connection");
        self.stream
            .close(Some(frame))
            .await
            .map_err(|e| SibylError::TransportSend(e.to_string()))
    }
}

/// Opens [`WebSocketTransport`]s, optionally bounded by a connect timeout.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector {
    connect_timeout: Option<Duration>,
}

impl WebSocketConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail connection attempts that take longer than `timeout`.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    type Transport = WebSocketTransport;

    async fn connect(&mut self, url: &str) -> Result<WebSocketTransport, SibylError> {
        match self.connect_timeout {
            Some(timeout) => WebSocketTransport::connect_with_timeout(url, timeout).await,
            None => WebSocketTransport::connect(url).await,
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn websocket_types_are_send_and_debug() {
        fn assert_send_debug<T: Send + std::fmt::Debug>() {}
        assert_send_debug::<WebSocketTransport>();
        assert_send_debug::<WebSocketConnector>();
    }

    #[tokio::test]
    async fn connect_fails_with_invalid_url() {
        let err = WebSocketTransport::connect("not-a-valid-url")
            .await
            .unwrap_err();
        assert!(matches!(err, SibylError::Io(_)));
    }

    #[tokio::test]
    async fn connector_reports_unreachable_host() {
        let mut connector = WebSocketConnector::new();
        let err = connector.connect("ws://127.0.0.1:1/ws").await.unwrap_err();
        assert!(matches!(err, SibylError::Io(_)));
    }

    #[tokio::test]
    async fn connector_timeout_is_applied() {
        // Non-routable address, so the attempt hangs until the deadline.
        let mut connector =
            WebSocketConnector::new().with_connect_timeout(Duration::from_millis(50));
        let err = connector.connect("ws://192.0.2.1:1/ws").await.unwrap_err();
        assert!(matches!(err, SibylError::Timeout));
    }

    #[tokio::test]
    async fn secure_url_reaches_the_tls_handshake() {
        // Plain TCP peer that hangs up, so the TLS handshake itself fails.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            drop(tcp);
        });

        let mut connector =
            WebSocketConnector::new().with_connect_timeout(Duration::from_secs(5));
        let err = connector
            .connect(&format!("wss://{addr}/ws"))
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, SibylError::Io(_)), "{message}");
        assert!(!message.contains("not compiled in"), "{message}");
    }

    // ── Mock-server helpers ─────────────────────────────────────────

    /// Start a local WebSocket server that runs `handler` on the accepted
    /// connection and returns the address to connect to.
    async fn start_mock_server<F, Fut>(handler: F) -> String
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            handler(ws).await;
        });

        format!("ws://{addr}/ws?room=r1&token=t1")
    }

    #[tokio::test]
    async fn recv_skips_binary_frames_and_ends_on_close() {
        let url = start_mock_server(|mut ws| async move {
            ws.send(Message::Binary(vec![0xDE, 0xAD].into()))
                .await
                .unwrap();
            ws.send(Message::Text(r#"{"reveal":false}"#.into()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        assert_eq!(
            transport.recv().await.unwrap().unwrap(),
            r#"{"reveal":false}"#
        );
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_sends_code_and_reason() {
        let (frame_tx, frame_rx) = tokio::sync::oneshot::channel();
        let url = start_mock_server(|mut ws| async move {
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Close(frame) = msg {
                    let _ = frame_tx.send(frame);
                    break;
                }
            }
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        transport.close(1000, "closing ok").await.unwrap();

        let frame = frame_rx.await.unwrap().unwrap();
        assert_eq!(u16::from(frame.code), 1000);
        assert_eq!(frame.reason.as_str(), "closing ok");
    }

    #[tokio::test]
    async fn send_after_close_returns_transport_closed() {
        let url =
            start_mock_server(|mut ws| async move { while let Some(Ok(_)) = ws.next().await {} })
                .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        transport.close(1000, "closing ok").await.unwrap();
        // Closing twice is a no-op.
        transport.close(1000, "closing ok").await.unwrap();

        let err = transport.send("late".to_string()).await.unwrap_err();
        assert!(matches!(err, SibylError::TransportClosed));
    }

    #[tokio::test]
    async fn send_round_trip() {
        let url = start_mock_server(|mut ws| async move {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                ws.send(Message::Text(text)).await.unwrap();
            }
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        transport.send("echo".to_string()).await.unwrap();
        assert_eq!(transport.recv().await.unwrap().unwrap(), "echo");
    }
}
