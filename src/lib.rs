//! # Sibyl Client
//!
//! Real-time client for Sibyl collaborative estimation sessions.
//!
//! Participants in a room each pick a card from a shared deck, keep it hidden
//! until someone reveals the round, then reset for the next one. This crate
//! keeps one connection per session alive, reconciles the server's
//! authoritative board snapshots into a renderable view, and exposes typed
//! actions for everything a participant can do.
//!
//! ## Features
//!
//! - **Transport-agnostic**: implement [`Transport`] and [`Connector`] for any backend
//! - **Self-healing**: one automatic reconnection, then a secure fallback suggestion
//! - **WebSocket built-in**: default `transport-websocket` feature provides [`WebSocketConnector`]
//! - **Event-driven**: receive typed [`SessionEvent`]s via a channel
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # #[cfg(feature = "transport-websocket")]
//! # async fn example() -> Result<(), sibyl_client::SibylError> {
//! use sibyl_client::{
//!     ClientConfig, ConnectionManager, DeckCatalog, Endpoint, MemoryPreferences, SessionEvent,
//!     Session, WebSocketConnector,
//! };
//!
//! let config = ClientConfig::new(
//!     Session::new("r1", "t1")?,
//!     Endpoint::from_page_url("http://localhost:5000/r1")?,
//!     DeckCatalog::standard(),
//! );
//! let (manager, mut events) =
//!     ConnectionManager::start(WebSocketConnector::new(), config, MemoryPreferences::new())?;
//! manager.connect()?;
//!
//! while let Some(event) = events.recv().await {
//!     if let SessionEvent::Board(update) = event {
//!         println!("{} players", update.view.players.len());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod board;
pub mod config;
pub mod deck;
pub mod error;
pub mod manager;
pub mod preferences;
pub mod protocol;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use board::{BoardStateReconciler, BoardUpdate, BoardView, CardFace, HandSelection};
pub use config::{ClientConfig, Endpoint, RoomConfig, Session};
pub use deck::{Deck, DeckCatalog};
pub use error::SibylError;
pub use manager::{CloseKind, ConnectionManager, ConnectionState, SessionEvent};
pub use preferences::{JsonFilePreferences, MemoryPreferences, PreferenceStore};
pub use protocol::{Action, ActionPayload, BoardSnapshot, ServerMessage};
pub use transport::{Connector, Transport};

#[cfg(feature = "transport-websocket")]
pub use transports::{WebSocketConnector, WebSocketTransport};
