//! Error types for the Sibyl client.

use thiserror::Error;

use crate::manager::ConnectionState;

/// Errors that can occur when using the Sibyl client.
#[derive(Debug, Error)]
pub enum SibylError {
    /// The client could not be set up from the supplied configuration.
    ///
    /// Setup failures are fatal: no connection is attempted and nothing retries.
    #[error("setup error: {0}")]
    Setup(String),

    /// Failed to send a message through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a message from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed.
    #[error("transport connection closed")]
    TransportClosed,

    /// Failed to serialize or deserialize a protocol message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Attempted to send an action while the connection is not open.
    #[error("connection is not open (state: {state})")]
    NotOpen {
        /// The lifecycle state at the time of the call.
        state: ConnectionState,
    },

    /// Attempted to connect while a connection is already live.
    #[error("connection already active (state: {state})")]
    AlreadyConnected {
        /// The lifecycle state at the time of the call.
        state: ConnectionState,
    },

    /// The server sent an explicit error notification.
    #[error("server error: {0}")]
    ServerError(String),

    /// A snapshot or action referenced a deck that is not in the catalog.
    #[error("unknown deck: {0}")]
    UnknownDeck(String),

    /// A snapshot referenced a card index outside the active deck.
    #[error("card index {index} is out of range for deck {deck} ({len} cards)")]
    CardOutOfRange {
        /// Deck the index was resolved against.
        deck: String,
        /// The offending index.
        index: usize,
        /// Number of cards in the deck.
        len: usize,
    },

    /// A username or topic edit did not pass validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Card selection is frozen because the round has been revealed.
    #[error("cards are revealed; selection is locked until the next reset")]
    SelectionLocked,

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized [`Result`] type for Sibyl client operations.
pub type Result<T> = std::result::Result<T, SibylError>;
