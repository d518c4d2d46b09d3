//! Wire-compatible protocol types for the Sibyl session protocol.
//!
//! Outgoing messages are flat JSON records that always carry the session's
//! `room` and `token`. Inbound messages are either an error notification
//! (`{"error": "..."}`) or a full [`BoardSnapshot`]. The codec is stateless:
//! [`encode`] and [`decode`] are plain functions.

use std::collections::HashMap;
use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::config::Session;
use crate::error::{Result, SibylError};

/// Status code sent when the client closes the connection on purpose.
pub const NORMAL_CLOSURE_CODE: u16 = 1000;

/// Reason string sent alongside [`NORMAL_CLOSURE_CODE`].
pub const NORMAL_CLOSURE_REASON: &str = "closing ok";

// ── Identifiers ─────────────────────────────────────────────────────

/// Server-assigned player identifier.
///
/// Stock servers send integer ids inside `cards` and string keys inside
/// `players`; both forms deserialize to the same value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlayerId(String);

impl PlayerId {
    /// Create a player id from its textual form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The textual form of the id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl Serialize for PlayerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

struct PlayerIdVisitor;

impl Visitor<'_> for PlayerIdVisitor {
    type Value = PlayerId;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a player id as a string or integer")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<PlayerId, E> {
        Ok(PlayerId::new(v))
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<PlayerId, E> {
        Ok(PlayerId(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<PlayerId, E> {
        Ok(PlayerId(v.to_string()))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<PlayerId, E> {
        Ok(PlayerId(v.to_string()))
    }
}

impl<'de> Deserialize<'de> for PlayerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(PlayerIdVisitor)
    }
}

// ── Outgoing ────────────────────────────────────────────────────────

/// User actions the server understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Reveal every player's card.
    Reveal,
    /// Clear all selections and start a new round.
    Reset,
    /// Switch the room to another deck.
    Deck,
    /// Rename the caller.
    Username,
    /// Change the session topic.
    Topic,
    /// Select a card from the caller's hand.
    Select,
}

impl Action {
    /// Wire name of the action.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reveal => "reveal",
            Self::Reset => "reset",
            Self::Deck => "deck",
            Self::Username => "username",
            Self::Topic => "topic",
            Self::Select => "select",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional fields attached to an [`Action`].
///
/// Fields an action does not use stay `None` and are sent as `null`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionPayload {
    /// Card index for [`Action::Select`].
    pub card: Option<usize>,
    /// Deck id for [`Action::Select`] and [`Action::Deck`].
    pub deck: Option<String>,
    /// Text for [`Action::Username`], [`Action::Topic`] and [`Action::Deck`].
    pub value: Option<String>,
}

impl ActionPayload {
    /// An empty payload.
    pub fn none() -> Self {
        Self::default()
    }

    /// Set the card index.
    #[must_use]
    pub fn with_card(mut self, card: usize) -> Self {
        self.card = Some(card);
        self
    }

    /// Set the deck id.
    #[must_use]
    pub fn with_deck(mut self, deck: impl Into<String>) -> Self {
        self.deck = Some(deck.into());
        self
    }

    /// Set the text value.
    #[must_use]
    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }
}

/// The record sent to the server for every action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub action: Action,
    pub card: Option<usize>,
    pub deck: Option<String>,
    pub room: String,
    pub token: String,
    pub value: Option<String>,
}

impl ClientMessage {
    /// Build a message for `action`, stamping the session's room and token.
    pub fn new(session: &Session, action: Action, payload: ActionPayload) -> Self {
        Self {
            action,
            card: payload.card,
            deck: payload.deck,
            room: session.room().to_string(),
            token: session.token().to_string(),
            value: payload.value,
        }
    }
}

// ── Inbound ─────────────────────────────────────────────────────────

/// One player's selection inside a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardEntry {
    #[serde(rename = "playerID")]
    pub player_id: PlayerId,
    pub card: usize,
}

/// Authoritative session state pushed by the server.
///
/// Every snapshot replaces the previous one entirely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardSnapshot {
    /// The caller's own display name.
    pub username: String,
    /// Free-text session topic.
    pub topic: String,
    /// Whether every selected card is visible.
    pub reveal: bool,
    /// One-shot instruction to clear local selection highlighting.
    #[serde(rename = "reset", default)]
    pub reset_signal: bool,
    /// Id of the active deck.
    #[serde(rename = "deck")]
    pub deck_id: String,
    /// Selections, one per player that has chosen a card.
    #[serde(default)]
    pub cards: Vec<CardEntry>,
    /// Every player in the room, keyed by id.
    #[serde(default)]
    pub players: HashMap<PlayerId, String>,
}

impl BoardSnapshot {
    /// Selections keyed by player. A repeated player keeps its last entry.
    pub fn cards_by_player(&self) -> HashMap<&PlayerId, usize> {
        self.cards.iter().map(|c| (&c.player_id, c.card)).collect()
    }
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// The server rejected something; the connection should be dropped.
    Error(String),
    /// A full board snapshot.
    Snapshot(Box<BoardSnapshot>),
}

// ── Codec ───────────────────────────────────────────────────────────

/// Encode an outgoing action as wire text.
///
/// # Errors
///
/// Returns [`SibylError::Serialization`] if JSON encoding fails.
pub fn encode(session: &Session, action: Action, payload: ActionPayload) -> Result<String> {
    Ok(serde_json::to_string(&ClientMessage::new(
        session, action, payload,
    ))?)
}

/// Decode one inbound wire message.
///
/// A message with a non-empty `error` field is an error notification;
/// anything else must be a complete snapshot.
///
/// # Errors
///
/// Returns [`SibylError::Serialization`] if the text is not JSON or is not a
/// well-formed snapshot.
pub fn decode(text: &str) -> Result<ServerMessage> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    if let Some(error) = value.get("error").and_then(serde_json::Value::as_str) {
        if !error.is_empty() {
            return Ok(ServerMessage::Error(error.to_string()));
        }
    }
    let snapshot: BoardSnapshot = serde_json::from_value(value)?;
    Ok(ServerMessage::Snapshot(Box::new(snapshot)))
}

impl ServerMessage {
    /// Unwrap a snapshot, turning an error notification into [`SibylError::ServerError`].
    ///
    /// # Errors
    ///
    /// Returns [`SibylError::ServerError`] carrying the server's message.
    pub fn into_snapshot(self) -> Result<BoardSnapshot> {
        match self {
            Self::Error(message) => Err(SibylError::ServerError(message)),
            Self::Snapshot(snapshot) => Ok(*snapshot),
        }
    }
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

    fn session() -> Session {
        Session::new("Team Room", "t0k&n").unwrap()
    }

    #[test]
    fn encode_always_carries_room_and_token() {
        let json = encode(&session(), Action::Reset, ActionPayload::none()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["action"], "reset");
        assert_eq!(value["room"], "Team Room");
        assert_eq!(value["token"], "t0k&n");
        assert!(value["card"].is_null());
        assert!(value["deck"].is_null());
        assert!(value["value"].is_null());
    }

    #[test]
    fn encode_keeps_card_zero() {
        let payload = ActionPayload::none().with_card(0).with_deck("fib");
        let json = encode(&session(), Action::Select, payload).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["card"], 0);
        assert_eq!(value["deck"], "fib");
    }

    #[test]
    fn decode_error_notification() {
        let msg = decode(r#"{"error":"Your game is out of sync."}"#).unwrap();
        assert_eq!(msg, ServerMessage::Error("Your game is out of sync.".into()));
    }

    #[test]
    fn decode_snapshot_with_integer_player_ids() {
        let text = r#"{
            "topic": "Sprint 12",
            "players": {"1": "alice", "2": "bob"},
            "cards": [{"card": 3, "playerID": 2, "player": "bob"}],
            "deck": "Fibonacci",
            "reveal": false,
            "reset": false,
            "username": "alice"
        }"#;
        let ServerMessage::Snapshot(snapshot) = decode(text).unwrap() else {
            panic!("expected snapshot");
        };
        assert_eq!(snapshot.username, "alice");
        assert_eq!(snapshot.deck_id, "Fibonacci");
        assert_eq!(snapshot.players.len(), 2);
        let cards = snapshot.cards_by_player();
        assert_eq!(cards.get(&PlayerId::new("2")), Some(&3));
        assert_eq!(snapshot.players.get(&PlayerId::new("2")).unwrap(), "bob");
    }

    #[test]
    fn decode_snapshot_without_reset_field() {
        let text = r#"{"username":"a","topic":"","reveal":true,"deck":"fib","cards":[],"players":{}}"#;
        let ServerMessage::Snapshot(snapshot) = decode(text).unwrap() else {
            panic!("expected snapshot");
        };
        assert!(!snapshot.reset_signal);
        assert!(snapshot.reveal);
    }

    #[test]
    fn decode_rejects_malformed_payloads() {
        assert!(matches!(decode("not json"), Err(SibylError::Serialization(_))));
        assert!(matches!(
            decode(r#"{"username":"a"}"#),
            Err(SibylError::Serialization(_))
        ));
        assert!(matches!(
            decode(r#"{"username":"a","topic":"","reveal":false,"deck":"fib","cards":[{"playerID":"p1","card":-1}],"players":{}}"#),
            Err(SibylError::Serialization(_))
        ));
    }

    #[test]
    fn error_notification_is_not_a_snapshot() {
        let res = ServerMessage::Error("boom".into()).into_snapshot();
        assert!(matches!(res, Err(SibylError::ServerError(m)) if m == "boom"));
    }
}
