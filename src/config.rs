//! Session identity, endpoint computation and client configuration.
//!
//! A room page is bootstrapped with a [`RoomConfig`] (token, room, edit limits
//! and the deck catalog). From it the client derives an immutable [`Session`]
//! and, together with an [`Endpoint`] describing the hosting page, a
//! [`ClientConfig`] that drives the connection manager.

use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::deck::DeckCatalog;
use crate::error::{Result, SibylError};

/// Environment variable holding the room bootstrap JSON.
pub const CONFIG_ENV_VAR: &str = "SIBYL_CONFIG";

/// Fixed path of the session endpoint.
pub const SESSION_PATH: &str = "/ws";

/// Default username edit limit, in characters.
pub const DEFAULT_USERNAME_MAX_LENGTH: usize = 25;

/// Default topic edit limit, in characters.
pub const DEFAULT_TOPIC_MAX_LENGTH: usize = 100;

const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_CONFIRM_DELAY: Duration = Duration::from_millis(250);
const DEFAULT_NOTICE_DELAY: Duration = Duration::from_millis(250);
const DEFAULT_REOPEN_DELAY: Duration = Duration::from_millis(2500);
const DEFAULT_RAPID_FAILURE_WINDOW: Duration = Duration::from_secs(10);

// ── Session ─────────────────────────────────────────────────────────

/// The `(room, token)` pair identifying one estimation session.
///
/// Immutable once built; every outgoing message carries both values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    room: String,
    token: String,
}

impl Session {
    /// Create a session.
    ///
    /// # Errors
    ///
    /// Returns [`SibylError::Setup`] if either value is empty.
    pub fn new(room: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let room = room.into();
        let token = token.into();
        if token.is_empty() {
            return Err(SibylError::Setup("Could not create room.".into()));
        }
        if room.is_empty() {
            return Err(SibylError::Setup("no room id supplied".into()));
        }
        Ok(Self { room, token })
    }

    /// Room identifier.
    pub fn room(&self) -> &str {
        &self.room
    }

    /// Opaque credential for the room.
    pub fn token(&self) -> &str {
        &self.token
    }
}

// ── Endpoint ────────────────────────────────────────────────────────

/// Where the hosting page lives; the session endpoint mirrors it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Whether the hosting page was served over TLS.
    pub secure: bool,
    /// Host (and optional port) of the hosting page.
    pub host: String,
    /// Path of the hosting page, used for the fallback suggestion.
    pub page_path: String,
}

impl Endpoint {
    /// Describe a hosting page.
    pub fn new(secure: bool, host: impl Into<String>) -> Self {
        Self {
            secure,
            host: host.into(),
            page_path: "/".into(),
        }
    }

    /// Derive the endpoint from a page URL such as `https://host/r/room`.
    ///
    /// # Errors
    ///
    /// Returns [`SibylError::Setup`] if the URL cannot be parsed or has no host.
    pub fn from_page_url(page: &str) -> Result<Self> {
        let url = Url::parse(page).map_err(|e| SibylError::Setup(format!("bad page url: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| SibylError::Setup(format!("page url has no host: {page}")))?;
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        Ok(Self {
            secure: url.scheme() == "https",
            host,
            page_path: url.path().to_string(),
        })
    }

    /// Set the hosting page path.
    #[must_use]
    pub fn with_page_path(mut self, path: impl Into<String>) -> Self {
        self.page_path = path.into();
        self
    }

    /// The session URL for `session`, with room and token percent-encoded.
    ///
    /// # Errors
    ///
    /// Returns [`SibylError::Setup`] if the host does not form a valid URL.
    pub fn session_url(&self, session: &Session) -> Result<Url> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let mut url = Url::parse(&format!("{scheme}://{}{SESSION_PATH}", self.host))
            .map_err(|e| SibylError::Setup(format!("bad session endpoint: {e}")))?;
        url.query_pairs_mut()
            .append_pair("room", session.room())
            .append_pair("token", session.token());
        Ok(url)
    }

    /// The secure page URL suggested when plain connections keep failing.
    pub fn fallback_url(&self) -> String {
        format!("https://{}{}", self.host, self.page_path)
    }
}

// ── Room bootstrap ──────────────────────────────────────────────────

/// Per-room values a server injects into the room page.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RoomConfig {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub room: String,
    #[serde(default = "default_username_max_length")]
    pub username_max_length: usize,
    #[serde(default = "default_topic_max_length")]
    pub topic_max_length: usize,
    #[serde(default)]
    pub decks: DeckCatalog,
}

fn default_username_max_length() -> usize {
    DEFAULT_USERNAME_MAX_LENGTH
}

fn default_topic_max_length() -> usize {
    DEFAULT_TOPIC_MAX_LENGTH
}

impl RoomConfig {
    /// Parse the bootstrap JSON.
    ///
    /// # Errors
    ///
    /// Returns [`SibylError::Serialization`] for malformed JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read the bootstrap JSON from [`CONFIG_ENV_VAR`].
    ///
    /// # Errors
    ///
    /// Returns [`SibylError::Setup`] if the variable is unset, or
    /// [`SibylError::Serialization`] if it holds malformed JSON.
    pub fn from_env() -> Result<Self> {
        let raw = std::env::var(CONFIG_ENV_VAR)
            .map_err(|_| SibylError::Setup(format!("{CONFIG_ENV_VAR} is not set")))?;
        Self::from_json(&raw)
    }

    /// Build the immutable session for this room.
    ///
    /// # Errors
    ///
    /// Returns [`SibylError::Setup`] if the token or room is missing.
    pub fn session(&self) -> Result<Session> {
        Session::new(self.room.clone(), self.token.clone())
    }

    /// Turn this bootstrap record into a client configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SibylError::Setup`] if the token or room is missing, or the
    /// catalog holds no decks.
    pub fn into_client_config(self, endpoint: Endpoint) -> Result<ClientConfig> {
        let session = self.session()?;
        if self.decks.is_empty() {
            return Err(SibylError::Setup("no decks configured".into()));
        }
        Ok(ClientConfig::new(session, endpoint, self.decks)
            .with_username_max_length(self.username_max_length)
            .with_topic_max_length(self.topic_max_length))
    }
}

// ── Client configuration ────────────────────────────────────────────

/// Configuration for a [`ConnectionManager`](crate::ConnectionManager).
///
/// The required pieces are the session, the endpoint and the deck catalog;
/// timings default to the values a room page uses.
///
/// # Example
///
/// ```
/// use sibyl_client::config::{ClientConfig, Endpoint, Session};
/// use sibyl_client::deck::DeckCatalog;
/// use std::time::Duration;
///
/// let session = Session::new("team", "abc123").unwrap();
/// let config = ClientConfig::new(session, Endpoint::new(false, "localhost:5000"), DeckCatalog::standard())
///     .with_reopen_delay(Duration::from_secs(5));
/// assert_eq!(config.confirm_delay, Duration::from_millis(250));
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Room and token.
    pub session: Session,
    /// Hosting page the endpoint mirrors.
    pub endpoint: Endpoint,
    /// Read-only deck catalog.
    pub decks: DeckCatalog,
    /// Username edit limit in characters. Defaults to **25**.
    pub username_max_length: usize,
    /// Topic edit limit in characters. Defaults to **100**.
    pub topic_max_length: usize,
    /// Delay between opening and switching to the game view. Defaults to **250 ms**.
    pub confirm_delay: Duration,
    /// Delay between an unexpected close and the reconnect notice. Defaults to **250 ms**.
    pub notice_delay: Duration,
    /// Delay between the reconnect notice and reopening. Defaults to **2.5 s**.
    pub reopen_delay: Duration,
    /// Two failures closer together than this are terminal. Defaults to **10 s**.
    pub rapid_failure_window: Duration,
    /// Capacity of the bounded event channel. Defaults to **256**, clamped to at least 1.
    ///
    /// When the consumer falls behind, events are dropped with a warning
    /// rather than blocking the session loop.
    pub event_channel_capacity: usize,
    /// Time the session loop gets to close cleanly on shutdown. Defaults to **1 s**.
    pub shutdown_timeout: Duration,
}

impl ClientConfig {
    /// Create a configuration with default timings.
    pub fn new(session: Session, endpoint: Endpoint, decks: DeckCatalog) -> Self {
        Self {
            session,
            endpoint,
            decks,
            username_max_length: DEFAULT_USERNAME_MAX_LENGTH,
            topic_max_length: DEFAULT_TOPIC_MAX_LENGTH,
            confirm_delay: DEFAULT_CONFIRM_DELAY,
            notice_delay: DEFAULT_NOTICE_DELAY,
            reopen_delay: DEFAULT_REOPEN_DELAY,
            rapid_failure_window: DEFAULT_RAPID_FAILURE_WINDOW,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_username_max_length(mut self, max: usize) -> Self {
        self.username_max_length = max;
        self
    }

    #[must_use]
    pub fn with_topic_max_length(mut self, max: usize) -> Self {
        self.topic_max_length = max;
        self
    }

    #[must_use]
    pub fn with_confirm_delay(mut self, delay: Duration) -> Self {
        self.confirm_delay = delay;
        self
    }

    #[must_use]
    pub fn with_notice_delay(mut self, delay: Duration) -> Self {
        self.notice_delay = delay;
        self
    }

    #[must_use]
    pub fn with_reopen_delay(mut self, delay: Duration) -> Self {
        self.reopen_delay = delay;
        self
    }

    #[must_use]
    pub fn with_rapid_failure_window(mut self, window: Duration) -> Self {
        self.rapid_failure_window = window;
        self
    }

    /// Set the capacity of the bounded event channel. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Check a username or topic edit before it is sent.
///
/// The edit must fit in `max_len` characters and contain at least one word
/// character; the server applies its own stricter rules afterwards.
///
/// # Errors
///
/// Returns [`SibylError::InvalidInput`] describing the first failed rule.
pub fn validate_edit(value: &str, max_len: usize) -> Result<()> {
    let len = value.chars().count();
    if len > max_len {
        return Err(SibylError::InvalidInput(format!(
            "{len} characters exceeds the limit of {max_len}"
        )));
    }
    if !value.chars().any(|c| c.is_alphanumeric() || c == '_') {
        return Err(SibylError::InvalidInput(
            "must contain at least one letter or digit".into(),
        ));
    }
    Ok(())
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

    #[test]
    fn session_requires_token_and_room() {
        assert!(matches!(Session::new("room", ""), Err(SibylError::Setup(_))));
        assert!(matches!(Session::new("", "tok"), Err(SibylError::Setup(_))));
        let session = Session::new("room", "tok").unwrap();
        assert_eq!(session.room(), "room");
        assert_eq!(session.token(), "tok");
    }

    #[test]
    fn session_url_mirrors_page_security() {
        let session = Session::new("Team A", "a+b/c").unwrap();

        let plain = Endpoint::new(false, "example.com:5000").session_url(&session).unwrap();
        assert_eq!(plain.scheme(), "ws");
        assert_eq!(plain.host_str(), Some("example.com"));
        assert_eq!(plain.port(), Some(5000));
        assert_eq!(plain.path(), "/ws");

        let secure = Endpoint::new(true, "example.com").session_url(&session).unwrap();
        assert_eq!(secure.scheme(), "wss");
    }

    #[test]
    fn session_url_percent_encodes_query() {
        let session = Session::new("Team A&B", "a+b/c=").unwrap();
        let url = Endpoint::new(false, "localhost").session_url(&session).unwrap();
        let query = url.query().unwrap();
        assert!(!query.contains("A&B"));
        assert!(query.contains("a%2Bb%2Fc%3D"));

        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("room".to_string(), "Team A&B".to_string()),
                ("token".to_string(), "a+b/c=".to_string()),
            ]
        );
    }

    #[test]
    fn endpoint_from_page_url() {
        let endpoint = Endpoint::from_page_url("http://sibyl.local:8080/r/standup").unwrap();
        assert!(!endpoint.secure);
        assert_eq!(endpoint.host, "sibyl.local:8080");
        assert_eq!(endpoint.page_path, "/r/standup");
        assert_eq!(endpoint.fallback_url(), "https://sibyl.local:8080/r/standup");

        assert!(Endpoint::from_page_url("https://sibyl.local/").unwrap().secure);
        assert!(matches!(
            Endpoint::from_page_url("not a url"),
            Err(SibylError::Setup(_))
        ));
    }

    #[test]
    fn room_config_parses_bootstrap_json() {
        let json = r#"{
            "Token": "abc",
            "Room": "standup",
            "UsernameMaxLength": 25,
            "TopicMaxLength": 100,
            "Decks": {"fib": ["0","1","2","3","5","8"]}
        }"#;
        let room = RoomConfig::from_json(json).unwrap();
        assert_eq!(room.session().unwrap().token(), "abc");
        let config = room
            .into_client_config(Endpoint::new(false, "localhost"))
            .unwrap();
        assert_eq!(config.decks.get("fib").unwrap().len(), 6);
        assert_eq!(config.username_max_length, 25);
    }

    #[test]
    fn room_config_without_token_is_a_setup_failure() {
        let room = RoomConfig::from_json(r#"{"Room": "standup"}"#).unwrap();
        assert!(matches!(room.session(), Err(SibylError::Setup(_))));
    }

    #[test]
    fn room_config_without_decks_is_a_setup_failure() {
        let room = RoomConfig::from_json(r#"{"Room": "standup", "Token": "t"}"#).unwrap();
        let err = room
            .into_client_config(Endpoint::new(false, "localhost"))
            .unwrap_err();
        assert!(matches!(err, SibylError::Setup(_)));
    }

    #[test]
    fn event_channel_capacity_is_clamped() {
        let config = ClientConfig::new(
            Session::new("r", "t").unwrap(),
            Endpoint::new(false, "localhost"),
            DeckCatalog::standard(),
        )
        .with_event_channel_capacity(0);
        assert_eq!(config.event_channel_capacity, 1);
        assert_eq!(config.rapid_failure_window, Duration::from_secs(10));
        assert_eq!(config.reopen_delay, Duration::from_millis(2500));
    }

    #[test]
    fn validate_edit_rules() {
        assert!(validate_edit("Göod Name!", 25).is_ok());
        assert!(validate_edit("!!!", 25).is_err());
        assert!(validate_edit(&"a".repeat(25), 25).is_ok());
        assert!(validate_edit(&"a".repeat(26), 25).is_err());
        assert!(validate_edit("", 25).is_err());
    }
}
