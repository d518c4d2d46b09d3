#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for Sibyl client integration tests.
//!
//! Provides a scripted [`MockConnector`] whose accepted connections hand the
//! test a [`ServerConn`], the server half of a channel-based transport, plus
//! helpers for building snapshot JSON and inspecting events.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use sibyl_client::{
    ClientConfig, ConnectionManager, Connector, DeckCatalog, Endpoint, MemoryPreferences,
    SessionEvent, Session, SibylError, Transport,
};
use tokio::sync::mpsc;

type Incoming = Option<Result<String, SibylError>>;
type CloseRecord = Arc<StdMutex<Option<(u16, String)>>>;

// ── MockTransport ───────────────────────────────────────────────────

/// Client half of a mock connection.
pub struct MockTransport {
    incoming: mpsc::UnboundedReceiver<Incoming>,
    sent: mpsc::UnboundedSender<String>,
    closed: CloseRecord,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, message: String) -> Result<(), SibylError> {
        self.sent
            .send(message)
            .map_err(|e| SibylError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, SibylError>> {
        // A dropped server half reads as a clean close.
        self.incoming.recv().await.flatten()
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), SibylError> {
        *self.closed.lock().unwrap() = Some((code, reason.to_string()));
        Ok(())
    }
}

/// Server half of a mock connection, held by the test.
pub struct ServerConn {
    to_client: mpsc::UnboundedSender<Incoming>,
    from_client: mpsc::UnboundedReceiver<String>,
    closed: CloseRecord,
}

impl ServerConn {
    /// Push one wire message to the client.
    pub fn push(&self, text: impl Into<String>) {
        let _ = self.to_client.send(Some(Ok(text.into())));
    }

    /// Close the connection from the server side.
    pub fn hang_up(&self) {
        let _ = self.to_client.send(None);
    }

    /// Fail the connection with a transport error.
    pub fn fail(&self) {
        let _ = self
            .to_client
            .send(Some(Err(SibylError::TransportReceive("reset by peer".into()))));
    }

    /// The next action the client sent, parsed as JSON.
    pub async fn next_sent(&mut self) -> Value {
        let raw = self.from_client.recv().await.expect("client sent nothing");
        serde_json::from_str(&raw).expect("client sent invalid JSON")
    }

    /// Actions sent so far that have not been read yet.
    pub fn sent_now(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(raw) = self.from_client.try_recv() {
            out.push(serde_json::from_str(&raw).expect("client sent invalid JSON"));
        }
        out
    }

    /// The close code and reason the client used, if it closed.
    pub fn close_frame(&self) -> Option<(u16, String)> {
        self.closed.lock().unwrap().clone()
    }
}

// ── MockConnector ───────────────────────────────────────────────────

/// Outcome of one scripted connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Accept,
    Refuse,
}

/// A connector that follows a script of [`Attempt`]s. Once the script runs
/// out every attempt is refused.
pub struct MockConnector {
    script: Arc<StdMutex<VecDeque<Attempt>>>,
    accepted: mpsc::UnboundedSender<ServerConn>,
    attempts: Arc<AtomicUsize>,
    urls: Arc<StdMutex<Vec<String>>>,
}

#[async_trait]
impl Connector for MockConnector {
    type Transport = MockTransport;

    async fn connect(&mut self, url: &str) -> Result<MockTransport, SibylError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_string());

        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Attempt::Refuse);
        if next == Attempt::Refuse {
            return Err(SibylError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }

        let (to_client, incoming) = mpsc::unbounded_channel();
        let (sent, from_client) = mpsc::unbounded_channel();
        let closed = CloseRecord::default();
        let _ = self.accepted.send(ServerConn {
            to_client,
            from_client,
            closed: Arc::clone(&closed),
        });
        Ok(MockTransport {
            incoming,
            sent,
            closed,
        })
    }
}

// ── Harness ─────────────────────────────────────────────────────────

/// A running manager wired to a [`MockConnector`].
pub struct Harness {
    pub manager: ConnectionManager,
    pub events: mpsc::Receiver<SessionEvent>,
    pub accepted: mpsc::UnboundedReceiver<ServerConn>,
    pub prefs: MemoryPreferences,
    script: Arc<StdMutex<VecDeque<Attempt>>>,
    attempts: Arc<AtomicUsize>,
    urls: Arc<StdMutex<Vec<String>>>,
}

impl Harness {
    /// Start with the default test session (`room-1` / `secret`).
    pub fn start(script: &[Attempt]) -> Self {
        Self::start_with(Session::new("room-1", "secret").unwrap(), script)
    }

    pub fn start_with(session: Session, script: &[Attempt]) -> Self {
        let config = ClientConfig::new(
            session,
            Endpoint::new(false, "localhost:5000").with_page_path("/room-1"),
            DeckCatalog::standard(),
        );
        Self::start_config(config, script)
    }

    pub fn start_config(config: ClientConfig, script: &[Attempt]) -> Self {
        let script = Arc::new(StdMutex::new(script.iter().copied().collect()));
        let attempts = Arc::new(AtomicUsize::new(0));
        let urls = Arc::new(StdMutex::new(Vec::new()));
        let (accepted_tx, accepted) = mpsc::unbounded_channel();
        let connector = MockConnector {
            script: Arc::clone(&script),
            accepted: accepted_tx,
            attempts: Arc::clone(&attempts),
            urls: Arc::clone(&urls),
        };
        let prefs = MemoryPreferences::new();
        let (manager, events) =
            ConnectionManager::start(connector, config, prefs.clone()).expect("start manager");
        Self {
            manager,
            events,
            accepted,
            prefs,
            script,
            attempts,
            urls,
        }
    }

    /// Append more scripted attempts.
    pub fn script(&self, more: &[Attempt]) {
        self.script.lock().unwrap().extend(more.iter().copied());
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }

    /// Wait for the next accepted connection.
    pub async fn next_conn(&mut self) -> ServerConn {
        self.accepted.recv().await.expect("no connection accepted")
    }

    /// Connect and wait for the first accepted connection.
    pub async fn open(&mut self) -> ServerConn {
        self.manager.connect().expect("connect");
        let conn = self.next_conn().await;
        self.until(|e| matches!(e, SessionEvent::Console(line) if line == "Connected."))
            .await;
        conn
    }

    /// Collect events up to and including the first one matching `pred`.
    pub async fn until(&mut self, pred: impl Fn(&SessionEvent) -> bool) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        loop {
            let event = self.events.recv().await.expect("event channel closed");
            let done = pred(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    /// Collect events up to and including the console line `line`.
    pub async fn until_console(&mut self, line: &str) -> Vec<SessionEvent> {
        self.until(|e| matches!(e, SessionEvent::Console(l) if l == line))
            .await
    }

    /// Everything already queued on the event channel.
    pub fn drain(&mut self) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

/// Console lines among `events`, in order.
pub fn console_lines(events: &[SessionEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Console(line) => Some(line.clone()),
            _ => None,
        })
        .collect()
}

// ── JSON helpers ────────────────────────────────────────────────────

/// A snapshot on the "Fibonacci" deck with the given players and selections.
pub fn snapshot_json(reveal: bool, players: &[(&str, &str)], cards: &[(&str, usize)]) -> String {
    snapshot_json_with("Fibonacci", reveal, false, players, cards)
}

pub fn snapshot_json_with(
    deck: &str,
    reveal: bool,
    reset: bool,
    players: &[(&str, &str)],
    cards: &[(&str, usize)],
) -> String {
    let players: serde_json::Map<String, Value> = players
        .iter()
        .map(|(id, name)| ((*id).to_string(), json!(name)))
        .collect();
    let cards: Vec<Value> = cards
        .iter()
        .map(|(id, card)| json!({ "playerID": id, "card": card }))
        .collect();
    json!({
        "username": "alice",
        "topic": "Sprint 12",
        "reveal": reveal,
        "reset": reset,
        "deck": deck,
        "cards": cards,
        "players": players,
    })
    .to_string()
}
