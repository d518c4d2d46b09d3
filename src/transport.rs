//! Transport abstraction for the Sibyl session protocol.
//!
//! The [`Transport`] trait defines a bidirectional text message channel between
//! the client and the session server. Every message is one complete JSON
//! document, so implementations handle framing internally.
//!
//! Unlike a one-shot client, the session loop must be able to reopen the
//! connection after an unexpected drop. Connection setup therefore lives behind
//! a second trait, [`Connector`], which the loop calls for the first attempt
//! and for every scheduled reconnection.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use sibyl_client::error::SibylError;
//! use sibyl_client::transport::{Connector, Transport};
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, message: String) -> Result<(), SibylError> {
//!         unimplemented!()
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, SibylError>> {
//!         // Return None when the connection is closed cleanly
//!         unimplemented!()
//!     }
//!
//!     async fn close(&mut self, code: u16, reason: &str) -> Result<(), SibylError> {
//!         unimplemented!()
//!     }
//! }
//!
//! struct MyConnector;
//!
//! #[async_trait]
//! impl Connector for MyConnector {
//!     type Transport = MyTransport;
//!
//!     async fn connect(&mut self, url: &str) -> Result<MyTransport, SibylError> {
//!         unimplemented!()
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::SibylError;

/// A bidirectional text message transport for one session connection.
///
/// # Cancel Safety
///
/// The [`recv`](Transport::recv) method **MUST** be cancel-safe because the
/// session loop polls it inside `tokio::select!` next to timers and commands.
/// Channel-based implementations are naturally cancel-safe.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send a JSON text message to the server.
    ///
    /// # Errors
    ///
    /// Returns [`SibylError::TransportSend`] if the message could not be sent.
    async fn send(&mut self, message: String) -> Result<(), SibylError>;

    /// Receive the next JSON text message from the server.
    ///
    /// Returns:
    /// - `Some(Ok(text))`: a complete message was received
    /// - `Some(Err(e))`: a transport error occurred
    /// - `None`: the connection was closed by the server
    async fn recv(&mut self) -> Option<Result<String, SibylError>>;

    /// Close the connection with the given status code and reason.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake fails. Implementations should
    /// still release resources in that case.
    async fn close(&mut self, code: u16, reason: &str) -> Result<(), SibylError>;
}

/// Opens new [`Transport`]s to a session endpoint.
#[async_trait]
pub trait Connector: Send + 'static {
    /// The transport produced by a successful connection.
    type Transport: Transport;

    /// Open a connection to `url`.
    ///
    /// # Errors
    ///
    /// Any error is treated by the session loop as a failed connection attempt
    /// and goes through the reconnection policy.
    async fn connect(&mut self, url: &str) -> Result<Self::Transport, SibylError>;
}
