//! # Loopback Room Example
//!
//! Shows how to implement [`Transport`] and [`Connector`] with in-process
//! channels and drive a full round against a tiny fake room server:
//! select a card, reveal, reset, then disconnect.
//!
//! ## Running
//!
//! ```sh
//! cargo run --example loopback_room
//! ```

use async_trait::async_trait;
use serde_json::json;
use sibyl_client::protocol::ClientMessage;
use sibyl_client::{
    Action, ClientConfig, ConnectionManager, Connector, DeckCatalog, Endpoint, MemoryPreferences,
    Session, SessionEvent, SibylError, Transport,
};
use tokio::sync::mpsc;

// ── Loopback transport ──────────────────────────────────────────────

/// Client half of an in-process connection.
pub struct LoopbackTransport {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, message: String) -> Result<(), SibylError> {
        self.tx
            .send(message)
            .map_err(|e| SibylError::TransportSend(e.to_string()))
    }

    /// `None` once the server task drops its sender.
    async fn recv(&mut self) -> Option<Result<String, SibylError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), SibylError> {
        tracing::info!(code, reason, "loopback closed");
        self.rx.close();
        Ok(())
    }
}

/// Spawns a fresh fake room server for every connection.
pub struct LoopbackConnector;

#[async_trait]
impl Connector for LoopbackConnector {
    type Transport = LoopbackTransport;

    async fn connect(&mut self, url: &str) -> Result<LoopbackTransport, SibylError> {
        tracing::info!("loopback connect to {url}");
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        tokio::spawn(fake_room(server_rx, server_tx));
        Ok(LoopbackTransport {
            tx: client_tx,
            rx: client_rx,
        })
    }
}

// ── Fake room server ────────────────────────────────────────────────

/// A single-player room that answers every action with a fresh snapshot.
async fn fake_room(mut rx: mpsc::UnboundedReceiver<String>, tx: mpsc::UnboundedSender<String>) {
    let mut username = "guest".to_string();
    let mut topic = String::new();
    let mut deck = "Fibonacci".to_string();
    let mut card: Option<usize> = None;
    let mut reveal = false;
    let mut reset = false;

    loop {
        let cards: Vec<_> = card
            .map(|c| json!({ "playerID": 1, "card": c, "player": username }))
            .into_iter()
            .collect();
        let snapshot = json!({
            "username": username,
            "topic": topic,
            "reveal": reveal,
            "reset": reset,
            "deck": deck,
            "cards": cards,
            "players": { "1": username },
        });
        if tx.send(snapshot.to_string()).is_err() {
            return;
        }
        reset = false;

        let Some(raw) = rx.recv().await else { return };
        let Ok(msg) = serde_json::from_str::<ClientMessage>(&raw) else {
            let _ = tx.send(json!({ "error": "Bad request." }).to_string());
            return;
        };
        match msg.action {
            Action::Select => card = msg.card,
            Action::Reveal => reveal = true,
            Action::Reset => {
                card = None;
                reveal = false;
                reset = true;
            }
            Action::Username => username = msg.value.unwrap_or(username),
            Action::Topic => topic = msg.value.unwrap_or(topic),
            Action::Deck => {
                deck = msg.deck.unwrap_or(deck);
                card = None;
                reveal = false;
            }
        }
    }
}

// ── Driving a round ─────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = ClientConfig::new(
        Session::new("loopback", "local-token")?,
        Endpoint::new(false, "localhost"),
        DeckCatalog::standard(),
    );
    let (mut manager, mut events) =
        ConnectionManager::start(LoopbackConnector, config, MemoryPreferences::new())?;
    manager.connect()?;

    let mut boards = 0;
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Console(line) => tracing::info!("console: {line}"),
            SessionEvent::Board(update) => {
                boards += 1;
                let faces: Vec<_> = update
                    .view
                    .players
                    .iter()
                    .map(|p| format!("{}={:?}", p.name, p.face))
                    .collect();
                tracing::info!("board #{boards}: {}", faces.join(", "));

                match boards {
                    1 => manager.rename("Ada")?,
                    2 => manager.select_card(5)?,
                    3 => {
                        manager.reveal()?;
                    }
                    4 => manager.reset()?,
                    _ => {
                        manager.disconnect()?;
                        break;
                    }
                }
            }
            SessionEvent::StateChanged(state) => tracing::info!("state: {state}"),
            _ => {}
        }
    }

    manager.shutdown().await;
    tracing::info!("Done after {boards} board update(s).");
    Ok(())
}
