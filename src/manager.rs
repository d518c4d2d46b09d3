//! Connection lifecycle management for one estimation session.
//!
//! [`ConnectionManager`] is a thin handle that talks to a background session
//! loop over an unbounded command channel. The loop owns the only live
//! [`Transport`], the [`BoardStateReconciler`] and a single cancellable timer
//! slot, and multiplexes them with `tokio::select!`. Everything the UI needs to
//! know is emitted as a [`SessionEvent`] on a bounded channel returned from
//! [`ConnectionManager::start`].
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──connect()──▶ Connecting ──open──▶ Open ──disconnect()──▶ Closing ──▶ Closed(Explicit)
//!                         ▲                 │
//!                         │            drop/error
//!                         │                 ▼
//!                      Reopen ◀── notice ◀─ Closed(Unexpected) ──2nd failure < 10 s──▶ Degraded
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let config = ClientConfig::new(session, endpoint, DeckCatalog::standard());
//! let (manager, mut events) =
//!     ConnectionManager::start(WebSocketConnector::new(), config, MemoryPreferences::new())?;
//! manager.connect()?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SessionEvent::Board(update) => render(&update.view),
//!         SessionEvent::Console(line) => println!("{line}"),
//!         _ => {}
//!     }
//! }
//! ```

use std::fmt;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::board::{BoardStateReconciler, BoardUpdate, BoardView};
use crate::config::{validate_edit, ClientConfig, Session};
use crate::deck::DeckCatalog;
use crate::error::{Result, SibylError};
use crate::preferences::PreferenceStore;
use crate::protocol::{
    self, Action, ActionPayload, ServerMessage, NORMAL_CLOSURE_CODE, NORMAL_CLOSURE_REASON,
};
use crate::transport::{Connector, Transport};

/// Console lines emitted by the session loop.
pub mod console {
    pub const CONNECTED: &str = "Connected.";
    pub const LOST_CONNECTION: &str = "Error. Lost connection.";
    pub const SERVER_DISCONNECTED: &str = "Server disconnected.";
    pub const SERVER_OFFLINE: &str = "Server may be offline.";
    pub const RECONNECTING: &str = "Attempting to reconnect...";
    pub const DISCONNECTED: &str = "Disconnected.";
    pub const UNREADABLE: &str = "Received an unreadable message from the server.";
}

// ── State & events ──────────────────────────────────────────────────

/// Why a connection ended up closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// The server went away or the transport failed.
    Unexpected,
    /// The user disconnected, or the server sent an error notification.
    Explicit,
}

/// Lifecycle state of the session connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Nothing has been attempted yet.
    #[default]
    Idle,
    /// A connection is being opened. `retry` is set for scheduled reconnections.
    Connecting { retry: bool },
    /// The connection is live; actions may be sent.
    Open,
    /// An explicit close handshake is in progress.
    Closing,
    /// No live connection.
    Closed(CloseKind),
    /// Two failures in quick succession; automatic retries have stopped.
    Degraded {
        /// A more reliable address to suggest to the user.
        fallback: String,
    },
}

impl ConnectionState {
    /// Returns `true` in [`ConnectionState::Open`].
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Whether a new connection may be started from this state.
    pub fn can_connect(&self) -> bool {
        matches!(self, Self::Idle | Self::Closed(_) | Self::Degraded { .. })
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Connecting { retry: false } => f.write_str("connecting"),
            Self::Connecting { retry: true } => f.write_str("reconnecting"),
            Self::Open => f.write_str("open"),
            Self::Closing => f.write_str("closing"),
            Self::Closed(CloseKind::Unexpected) => f.write_str("closed (unexpected)"),
            Self::Closed(CloseKind::Explicit) => f.write_str("closed"),
            Self::Degraded { .. } => f.write_str("degraded"),
        }
    }
}

/// Everything the session loop reports to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The lifecycle state changed.
    StateChanged(ConnectionState),
    /// A line for the append-only diagnostic console.
    Console(String),
    /// Switch to the diagnostic console view.
    ShowConsole,
    /// Switch to the game view. Only sent while the connection is still open.
    ShowGame,
    /// A snapshot was reconciled. Never dropped: when the channel is full the
    /// session loop waits for room, since `hand_rebuilt` and
    /// `clear_selection` are only reported once.
    Board(Box<BoardUpdate>),
    /// Automatic reconnection stopped; suggest `fallback` to the user.
    Degraded { fallback: String },
}

// ── Commands & timers ───────────────────────────────────────────────

#[derive(Debug)]
enum Command {
    Connect,
    Send {
        action: Action,
        payload: ActionPayload,
    },
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScheduledTask {
    /// Post-open confirmation; switches to the game view if still open.
    ShowGame,
    /// First backoff stage; announces the reconnection.
    ReconnectNotice,
    /// Second backoff stage; reopens the connection.
    Reopen,
}

#[derive(Debug, Clone, Copy)]
struct Scheduled {
    at: Instant,
    task: ScheduledTask,
}

#[derive(Debug, Clone, Copy)]
struct Timings {
    confirm: Duration,
    notice: Duration,
    reopen: Duration,
    rapid_failure_window: Duration,
}

// ── Handle ──────────────────────────────────────────────────────────

/// Handle to the session loop of one [`Session`].
///
/// Created via [`ConnectionManager::start`]. Action methods check the last
/// known state, queue a command and return immediately.
pub struct ConnectionManager {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    board_rx: watch::Receiver<Option<BoardView>>,
    decks: DeckCatalog,
    username_max_length: usize,
    topic_max_length: usize,
    task: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl ConnectionManager {
    /// Start the session loop in [`ConnectionState::Idle`].
    ///
    /// Must be called from within a tokio runtime. Call
    /// [`connect`](Self::connect) to open the first connection.
    ///
    /// # Errors
    ///
    /// Returns [`SibylError::Setup`] if the session endpoint cannot be built.
    #[must_use = "the event receiver must be used to receive events"]
    pub fn start<C: Connector>(
        connector: C,
        config: ClientConfig,
        preferences: impl PreferenceStore,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>)> {
        let url = config.endpoint.session_url(&config.session)?;
        let fallback = config.endpoint.fallback_url();

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (board_tx, board_rx) = watch::channel(None);

        let session_loop = SessionLoop {
            connector,
            url: url.to_string(),
            session: config.session.clone(),
            fallback,
            transport: None,
            retry: false,
            last_retry_at: None,
            timer: None,
            reconciler: BoardStateReconciler::new(config.decks.clone(), preferences),
            events: event_tx,
            state_tx,
            board_tx,
            timings: Timings {
                confirm: config.confirm_delay,
                notice: config.notice_delay,
                reopen: config.reopen_delay,
                rapid_failure_window: config.rapid_failure_window,
            },
        };
        let task = tokio::spawn(session_loop.run(cmd_rx, shutdown_rx));

        let manager = Self {
            cmd_tx,
            state_rx,
            board_rx,
            decks: config.decks,
            username_max_length: config.username_max_length,
            topic_max_length: config.topic_max_length,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout: config.shutdown_timeout,
        };
        Ok((manager, event_rx))
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Open the session connection.
    ///
    /// Accepted from `Idle`, `Closed` and `Degraded`; a manual connect from
    /// `Degraded` starts a fresh retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`SibylError::AlreadyConnected`] while a connection is live.
    pub fn connect(&self) -> Result<()> {
        let state = self.state();
        if !state.can_connect() {
            return Err(SibylError::AlreadyConnected { state });
        }
        self.queue(Command::Connect)
    }

    /// Close the connection on purpose and cancel any scheduled reconnection.
    ///
    /// # Errors
    ///
    /// Returns [`SibylError::TransportClosed`] if the session loop has exited.
    pub fn disconnect(&self) -> Result<()> {
        self.queue(Command::Disconnect)
    }

    /// Send a raw action.
    ///
    /// # Errors
    ///
    /// Returns [`SibylError::NotOpen`] unless the connection is open.
    pub fn send(&self, action: Action, payload: ActionPayload) -> Result<()> {
        let state = self.state();
        if !state.is_open() {
            return Err(SibylError::NotOpen { state });
        }
        self.queue(Command::Send { action, payload })
    }

    // ── Actions ─────────────────────────────────────────────────────

    /// Select a card from the caller's hand.
    ///
    /// # Errors
    ///
    /// Returns [`SibylError::SelectionLocked`] while cards are revealed,
    /// [`SibylError::CardOutOfRange`] for an index outside the hand, or
    /// [`SibylError::NotOpen`] before the first board arrives.
    pub fn select_card(&self, index: usize) -> Result<()> {
        let deck_id = {
            let board = self.board_rx.borrow();
            let Some(view) = board.as_ref() else {
                return Err(SibylError::NotOpen {
                    state: self.state(),
                });
            };
            if view.selection_locked() {
                return Err(SibylError::SelectionLocked);
            }
            self.decks.require(&view.deck_id)?.resolve(index)?;
            view.deck_id.clone()
        };
        self.send(
            Action::Select,
            ActionPayload::none().with_card(index).with_deck(deck_id),
        )
    }

    /// Ask the server to reveal every card.
    ///
    /// Returns `Ok(false)` without sending when no card is face-down.
    ///
    /// # Errors
    ///
    /// Returns [`SibylError::NotOpen`] unless the connection is open.
    pub fn reveal(&self) -> Result<bool> {
        let pending = self
            .board_rx
            .borrow()
            .as_ref()
            .map_or(0, BoardView::face_down_count);
        if pending == 0 {
            debug!("reveal skipped: no face-down cards");
            return Ok(false);
        }
        self.send(Action::Reveal, ActionPayload::none())?;
        Ok(true)
    }

    /// Start a new round.
    ///
    /// # Errors
    ///
    /// Returns [`SibylError::NotOpen`] unless the connection is open.
    pub fn reset(&self) -> Result<()> {
        self.send(Action::Reset, ActionPayload::none())
    }

    /// Switch the room to another deck from the catalog.
    ///
    /// # Errors
    ///
    /// Returns [`SibylError::UnknownDeck`] for ids outside the catalog, or
    /// [`SibylError::NotOpen`] unless the connection is open.
    pub fn change_deck(&self, deck_id: &str) -> Result<()> {
        self.decks.require(deck_id)?;
        self.send(
            Action::Deck,
            ActionPayload::none().with_deck(deck_id).with_value(deck_id),
        )
    }

    /// Rename the caller.
    ///
    /// # Errors
    ///
    /// Returns [`SibylError::InvalidInput`] if the name fails validation, or
    /// [`SibylError::NotOpen`] unless the connection is open.
    pub fn rename(&self, name: &str) -> Result<()> {
        validate_edit(name, self.username_max_length)?;
        self.send(Action::Username, ActionPayload::none().with_value(name))
    }

    /// Change the session topic.
    ///
    /// # Errors
    ///
    /// Returns [`SibylError::InvalidInput`] if the topic fails validation, or
    /// [`SibylError::NotOpen`] unless the connection is open.
    pub fn set_topic(&self, topic: &str) -> Result<()> {
        validate_edit(topic, self.topic_max_length)?;
        self.send(Action::Topic, ActionPayload::none().with_value(topic))
    }

    // ── State accessors ─────────────────────────────────────────────

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Returns `true` while the connection is open.
    pub fn is_open(&self) -> bool {
        self.state_rx.borrow().is_open()
    }

    /// A receiver that observes every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// The last reconciled view, if any snapshot has arrived.
    pub fn board(&self) -> Option<BoardView> {
        self.board_rx.borrow().clone()
    }

    /// Shut down the session loop, closing any live connection.
    pub async fn shutdown(&mut self) {
        debug!("ConnectionManager: shutdown requested");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("session loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("session loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("session loop aborted: {join_err}");
                    }
                }
            }
        }
    }

    fn queue(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| SibylError::TransportClosed)
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        // No executor context for a graceful close here; abort instead.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Session loop ────────────────────────────────────────────────────

struct SessionLoop<C: Connector> {
    connector: C,
    url: String,
    session: Session,
    fallback: String,
    transport: Option<C::Transport>,
    /// The current connection attempt is a scheduled reconnection.
    retry: bool,
    /// When the last reconnection was scheduled.
    last_retry_at: Option<Instant>,
    timer: Option<Scheduled>,
    reconciler: BoardStateReconciler,
    events: mpsc::Sender<SessionEvent>,
    state_tx: watch::Sender<ConnectionState>,
    board_tx: watch::Sender<Option<BoardView>>,
    timings: Timings,
}

impl<C: Connector> SessionLoop<C> {
    /// Multiplex commands, transport input and the timer slot until the
    /// handle is dropped or shut down.
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        debug!(room = %self.session.room(), "session loop started");

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.on_command(cmd).await,
                        None => {
                            debug!("command channel closed, shutting down session loop");
                            self.close_quietly().await;
                            break;
                        }
                    }
                }

                _ = &mut shutdown_rx => {
                    debug!("shutdown signal received");
                    self.close_quietly().await;
                    break;
                }

                incoming = recv_from(&mut self.transport) => {
                    self.on_incoming(incoming).await;
                }

                task = fire(&mut self.timer) => {
                    self.on_timer(task).await;
                }
            }
        }

        debug!("session loop exited");
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect => {
                let state = self.state_tx.borrow().clone();
                if !state.can_connect() {
                    debug!(%state, "connect ignored; connection already active");
                    return;
                }
                self.timer = None;
                self.last_retry_at = None;
                self.open(false).await;
            }
            Command::Send { action, payload } => self.send(action, payload).await,
            Command::Disconnect => self.disconnect().await,
        }
    }

    async fn send(&mut self, action: Action, payload: ActionPayload) {
        let Some(transport) = self.transport.as_mut() else {
            warn!(%action, "action rejected; connection not open");
            self.console(format!("Could not send {action}: not connected."));
            return;
        };
        let json = match protocol::encode(&self.session, action, payload) {
            Ok(json) => json,
            Err(e) => {
                error!("failed to encode {action}: {e}");
                return;
            }
        };
        debug!(%action, "sending action");
        let sent = transport.send(json).await;
        if let Err(e) = sent {
            self.on_connection_lost(Some(e)).await;
        }
    }

    async fn open(&mut self, retry: bool) {
        self.retry = retry;
        self.set_state(ConnectionState::Connecting { retry });
        info!(room = %self.session.room(), retry, "opening session connection");

        match self.connector.connect(&self.url).await {
            Ok(transport) => {
                self.transport = Some(transport);
                self.retry = false;
                self.set_state(ConnectionState::Open);
                info!(room = %self.session.room(), "session connection open");
                self.console(console::CONNECTED);
                self.schedule(ScheduledTask::ShowGame, self.timings.confirm);
            }
            Err(e) => self.on_connection_lost(Some(e)).await,
        }
    }

    async fn on_incoming(&mut self, incoming: Option<Result<String>>) {
        let text = match incoming {
            Some(Ok(text)) => text,
            Some(Err(e)) => return self.on_connection_lost(Some(e)).await,
            None => return self.on_connection_lost(None).await,
        };

        match protocol::decode(&text) {
            Ok(ServerMessage::Error(message)) => {
                warn!(%message, "server sent an error notification");
                self.fail(message).await;
            }
            Ok(ServerMessage::Snapshot(snapshot)) => match self.reconciler.apply(*snapshot) {
                Ok(update) => {
                    self.board_tx.send_replace(Some(update.view.clone()));
                    self.emit_board(update).await;
                }
                Err(e) => {
                    warn!("rejected board snapshot: {e}");
                    self.fail(format!("Could not apply board update: {e}")).await;
                }
            },
            Err(e) => {
                warn!("failed to decode server message: {e}; raw: {text}");
                self.fail(console::UNREADABLE.to_string()).await;
            }
        }
    }

    async fn on_timer(&mut self, task: ScheduledTask) {
        match task {
            ScheduledTask::ShowGame => {
                if self.state_tx.borrow().is_open() {
                    self.emit(SessionEvent::ShowGame);
                } else {
                    debug!("connection closed before confirmation; staying on console");
                }
            }
            ScheduledTask::ReconnectNotice => {
                self.console(console::RECONNECTING);
                self.schedule(ScheduledTask::Reopen, self.timings.reopen);
            }
            ScheduledTask::Reopen => self.open(true).await,
        }
    }

    /// Unexpected loss of the connection, or a failed attempt to open one.
    async fn on_connection_lost(&mut self, cause: Option<SibylError>) {
        self.transport = None;
        self.timer = None;

        if let Some(e) = cause {
            error!(retry = self.retry, "session connection failed: {e}");
            self.console(console::LOST_CONNECTION);
            self.emit(SessionEvent::ShowConsole);
        } else {
            info!(retry = self.retry, "session connection closed by server");
        }

        self.set_state(ConnectionState::Closed(CloseKind::Unexpected));
        self.console(if self.retry {
            console::SERVER_OFFLINE
        } else {
            console::SERVER_DISCONNECTED
        });
        self.emit(SessionEvent::ShowConsole);

        let now = Instant::now();
        if let Some(previous) = self.last_retry_at {
            if now.duration_since(previous) < self.timings.rapid_failure_window {
                self.degrade();
                return;
            }
        }
        self.last_retry_at = Some(now);
        self.schedule(ScheduledTask::ReconnectNotice, self.timings.notice);
    }

    fn degrade(&mut self) {
        let fallback = self.fallback.clone();
        warn!(%fallback, "repeated connection failures; automatic reconnection stopped");
        self.set_state(ConnectionState::Degraded {
            fallback: fallback.clone(),
        });
        self.console(format!("Having an issue? Try using https: {fallback}"));
        self.emit(SessionEvent::Degraded { fallback });
    }

    /// A protocol-level failure: drop the connection and show `message`.
    async fn fail(&mut self, message: String) {
        self.disconnect().await;
        self.console(message);
        self.emit(SessionEvent::ShowConsole);
    }

    async fn disconnect(&mut self) {
        if self.timer.take().is_some() {
            debug!("cancelled scheduled task on disconnect");
        }
        self.console(console::DISCONNECTED);
        if let Some(mut transport) = self.transport.take() {
            self.set_state(ConnectionState::Closing);
            if let Err(e) = transport
                .close(NORMAL_CLOSURE_CODE, NORMAL_CLOSURE_REASON)
                .await
            {
                debug!("close handshake failed: {e}");
            }
        }
        self.set_state(ConnectionState::Closed(CloseKind::Explicit));
    }

    async fn close_quietly(&mut self) {
        self.timer = None;
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport
                .close(NORMAL_CLOSURE_CODE, NORMAL_CLOSURE_REASON)
                .await
            {
                debug!("close on shutdown failed: {e}");
            }
        }
        self.state_tx
            .send_replace(ConnectionState::Closed(CloseKind::Explicit));
    }

    fn schedule(&mut self, task: ScheduledTask, delay: Duration) {
        self.timer = Some(Scheduled {
            at: Instant::now() + delay,
            task,
        });
    }

    fn set_state(&mut self, state: ConnectionState) {
        debug!(%state, "connection state");
        self.state_tx.send_replace(state.clone());
        self.emit(SessionEvent::StateChanged(state));
    }

    fn console(&self, line: impl Into<String>) {
        self.emit(SessionEvent::Console(line.into()));
    }

    /// Emit an event. If the channel is full the event is dropped with a
    /// warning rather than blocking the loop.
    fn emit(&self, event: SessionEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!("event channel full, dropping event: {dropped:?}");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("event channel closed, receiver dropped");
            }
        }
    }

    /// Emit a board update, waiting for channel capacity instead of dropping it.
    fn emit_board(&self, update: BoardUpdate) -> impl std::future::Future<Output = ()> + Send {
        let events = self.events.clone();
        async move {
            if events
                .send(SessionEvent::Board(Box::new(update)))
                .await
                .is_err()
            {
                debug!("event channel closed, receiver dropped");
            }
        }
    }
}

/// Receive from the live transport, or wait forever when there is none.
async fn recv_from<T: Transport>(transport: &mut Option<T>) -> Option<Result<String>> {
    match transport {
        Some(transport) => transport.recv().await,
        None => std::future::pending().await,
    }
}

/// Wait for the scheduled task, or forever when the slot is empty.
async fn fire(slot: &mut Option<Scheduled>) -> ScheduledTask {
    let Some(scheduled) = *slot else {
        return std::future::pending().await;
    };
    sleep_until(scheduled.at).await;
    *slot = None;
    scheduled.task
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::config::Endpoint;
    use crate::preferences::MemoryPreferences;
    use async_trait::async_trait;

    /// A connector whose connections never open.
    struct RefusingConnector;

    struct NeverTransport;

    #[async_trait]
    impl Transport for NeverTransport {
        async fn send(&mut self, _message: String) -> Result<()> {
            Ok(())
        }

        async fn recv(&mut self) -> Option<Result<String>> {
            std::future::pending().await
        }

        async fn close(&mut self, _code: u16, _reason: &str) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Connector for RefusingConnector {
        type Transport = NeverTransport;

        async fn connect(&mut self, _url: &str) -> Result<NeverTransport> {
            Err(SibylError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "refused",
            )))
        }
    }

    /// Opens connections whose close handshake always fails.
    struct BrokenCloseConnector;

    struct BrokenCloseTransport;

    #[async_trait]
    impl Transport for BrokenCloseTransport {
        async fn send(&mut self, _message: String) -> Result<()> {
            Ok(())
        }

        async fn recv(&mut self) -> Option<Result<String>> {
            std::future::pending().await
        }

        async fn close(&mut self, _code: u16, _reason: &str) -> Result<()> {
            Err(SibylError::TransportSend("broken pipe".into()))
        }
    }

    #[async_trait]
    impl Connector for BrokenCloseConnector {
        type Transport = BrokenCloseTransport;

        async fn connect(&mut self, _url: &str) -> Result<BrokenCloseTransport> {
            Ok(BrokenCloseTransport)
        }
    }

    fn config() -> ClientConfig {
        ClientConfig::new(
            Session::new("room", "token").unwrap(),
            Endpoint::new(false, "localhost:5000").with_page_path("/r/room"),
            DeckCatalog::standard(),
        )
    }

    #[test]
    fn state_display_and_predicates() {
        assert_eq!(ConnectionState::Idle.to_string(), "idle");
        assert_eq!(
            ConnectionState::Connecting { retry: true }.to_string(),
            "reconnecting"
        );
        assert!(ConnectionState::Open.is_open());
        assert!(!ConnectionState::Open.can_connect());
        assert!(!ConnectionState::Closing.can_connect());
        assert!(ConnectionState::Closed(CloseKind::Unexpected).can_connect());
        assert!(ConnectionState::Degraded {
            fallback: String::new()
        }
        .can_connect());
    }

    #[tokio::test]
    async fn send_before_open_is_rejected() {
        let (mut manager, _events) =
            ConnectionManager::start(RefusingConnector, config(), MemoryPreferences::new())
                .unwrap();

        assert_eq!(manager.state(), ConnectionState::Idle);
        let err = manager.reset().unwrap_err();
        assert!(matches!(
            err,
            SibylError::NotOpen {
                state: ConnectionState::Idle
            }
        ));
        assert!(matches!(
            manager.select_card(0),
            Err(SibylError::NotOpen { .. })
        ));
        assert!(!manager.reveal().unwrap());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn edits_are_validated_before_the_state_check() {
        let (mut manager, _events) =
            ConnectionManager::start(RefusingConnector, config(), MemoryPreferences::new())
                .unwrap();

        assert!(matches!(
            manager.rename("!!!"),
            Err(SibylError::InvalidInput(_))
        ));
        assert!(matches!(
            manager.set_topic(&"x".repeat(101)),
            Err(SibylError::InvalidInput(_))
        ));
        assert!(matches!(
            manager.change_deck("Tarot"),
            Err(SibylError::UnknownDeck(_))
        ));

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn refused_first_attempt_schedules_one_reconnect() {
        let (mut manager, mut events) =
            ConnectionManager::start(RefusingConnector, config(), MemoryPreferences::new())
                .unwrap();
        manager.connect().unwrap();

        let mut lines = Vec::new();
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Console(line) => lines.push(line),
                SessionEvent::Degraded { fallback } => {
                    assert_eq!(fallback, "https://localhost:5000/r/room");
                    break;
                }
                _ => {}
            }
        }

        assert_eq!(
            lines,
            vec![
                console::LOST_CONNECTION,
                console::SERVER_DISCONNECTED,
                console::RECONNECTING,
                console::LOST_CONNECTION,
                console::SERVER_OFFLINE,
                "Having an issue? Try using https: https://localhost:5000/r/room",
            ]
        );
        assert!(matches!(manager.state(), ConnectionState::Degraded { .. }));

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn full_event_channel_does_not_stall_the_loop() {
        let config = config().with_event_channel_capacity(0);
        let (mut manager, mut events) =
            ConnectionManager::start(RefusingConnector, config, MemoryPreferences::new())
                .unwrap();
        manager.connect().unwrap();

        // Nobody reads events; the loop must still run the whole policy.
        let mut state = manager.subscribe_state();
        state
            .wait_for(|s| matches!(s, ConnectionState::Degraded { .. }))
            .await
            .unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(
            first,
            SessionEvent::StateChanged(ConnectionState::Connecting { retry: false })
        );
        assert!(events.try_recv().is_err(), "capacity clamps to one event");

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_completes_when_close_fails() {
        let (mut manager, _events) =
            ConnectionManager::start(BrokenCloseConnector, config(), MemoryPreferences::new())
                .unwrap();
        manager.connect().unwrap();
        let mut state = manager.subscribe_state();
        state.wait_for(|s| s.is_open()).await.unwrap();

        manager.shutdown().await;
        assert_eq!(
            manager.state(),
            ConnectionState::Closed(CloseKind::Explicit)
        );
    }
}
