//! Integration-style session tests for the Sibyl client.
//!
//! Uses the scripted `MockConnector` from `tests/common` to drive a
//! `ConnectionManager` through its lifecycle. Every test runs on a paused
//! clock, so backoff and confirmation delays elapse instantly but in order.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

mod common;

use std::time::Duration;

use serde_json::json;
use sibyl_client::manager::console;
use sibyl_client::{
    CardFace, ClientConfig, CloseKind, ConnectionState, Deck, DeckCatalog, Endpoint,
    PreferenceStore, SessionEvent, Session, SibylError,
};
use tokio::time::{sleep, Instant};
use tokio_test::{assert_err, assert_ok};

use common::{console_lines, snapshot_json, snapshot_json_with, Attempt, Harness};

const FALLBACK_LINE: &str = "Having an issue? Try using https: https://localhost:5000/room-1";

fn is_degraded(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::Degraded { .. })
}

// ════════════════════════════════════════════════════════════════════
// Opening
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn open_then_show_game_after_confirmation_delay() {
    let mut h = Harness::start(&[Attempt::Accept]);
    let started = Instant::now();

    h.manager.connect().unwrap();
    let events = h.until(|e| matches!(e, SessionEvent::ShowGame)).await;

    assert!(started.elapsed() >= Duration::from_millis(250));
    assert_eq!(
        events[..3],
        [
            SessionEvent::StateChanged(ConnectionState::Connecting { retry: false }),
            SessionEvent::StateChanged(ConnectionState::Open),
            SessionEvent::Console(console::CONNECTED.into()),
        ]
    );
    assert!(h.manager.is_open());

    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn session_url_carries_encoded_room_and_token() {
    let session = Session::new("team a/b", "t&k=1").unwrap();
    let mut h = Harness::start_with(session, &[Attempt::Accept]);
    let _conn = h.open().await;

    assert_eq!(
        h.urls(),
        vec!["ws://localhost:5000/ws?room=team+a%2Fb&token=t%26k%3D1".to_string()]
    );

    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn connect_while_open_is_rejected() {
    let mut h = Harness::start(&[Attempt::Accept]);
    let _conn = h.open().await;

    let err = h.manager.connect().unwrap_err();
    assert!(matches!(
        err,
        SibylError::AlreadyConnected {
            state: ConnectionState::Open
        }
    ));
    assert_eq!(h.attempts(), 1);

    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn show_game_skipped_when_connection_drops_first() {
    let mut h = Harness::start(&[Attempt::Accept]);
    let conn = h.open().await;
    conn.hang_up();

    let events = h.until(is_degraded).await;
    assert!(
        !events.iter().any(|e| matches!(e, SessionEvent::ShowGame)),
        "game view shown after close: {events:?}"
    );
}

// ════════════════════════════════════════════════════════════════════
// Reconnection policy
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn single_drop_reconnects_after_backoff() {
    let mut h = Harness::start(&[Attempt::Accept, Attempt::Accept]);
    let conn = h.open().await;

    let dropped_at = Instant::now();
    conn.hang_up();

    let events = h.until_console(console::CONNECTED).await;
    assert!(dropped_at.elapsed() >= Duration::from_millis(2750));
    assert_eq!(
        console_lines(&events),
        vec![
            console::SERVER_DISCONNECTED,
            console::RECONNECTING,
            console::CONNECTED
        ]
    );
    assert!(events.contains(&SessionEvent::StateChanged(ConnectionState::Closed(
        CloseKind::Unexpected
    ))));
    assert!(events.contains(&SessionEvent::StateChanged(ConnectionState::Connecting {
        retry: true
    })));
    assert_eq!(h.attempts(), 2);

    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn two_failures_within_window_degrade() {
    let mut h = Harness::start(&[Attempt::Accept, Attempt::Accept]);
    let first = h.open().await;
    first.hang_up();

    let second = h.next_conn().await;
    h.until_console(console::CONNECTED).await;
    second.hang_up();

    let events = h.until(is_degraded).await;
    assert_eq!(
        console_lines(&events),
        vec![console::SERVER_DISCONNECTED, FALLBACK_LINE]
    );
    assert_eq!(
        events.last(),
        Some(&SessionEvent::Degraded {
            fallback: "https://localhost:5000/room-1".into()
        })
    );

    sleep(Duration::from_secs(60)).await;
    assert_eq!(h.attempts(), 2, "no attempts after degrading");
    assert!(matches!(
        h.manager.state(),
        ConnectionState::Degraded { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn failures_far_apart_each_get_a_backoff() {
    let mut h = Harness::start(&[Attempt::Accept, Attempt::Accept, Attempt::Accept]);
    let first = h.open().await;
    first.hang_up();

    let second = h.next_conn().await;
    h.until_console(console::CONNECTED).await;

    sleep(Duration::from_secs(11)).await;
    second.hang_up();

    let _third = h.next_conn().await;
    let events = h.until_console(console::CONNECTED).await;
    assert_eq!(
        console_lines(&events),
        vec![
            console::SERVER_DISCONNECTED,
            console::RECONNECTING,
            console::CONNECTED
        ]
    );
    assert!(!events.iter().any(is_degraded));
    assert_eq!(h.attempts(), 3);

    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn refused_retry_reports_server_offline() {
    let mut h = Harness::start(&[Attempt::Accept, Attempt::Refuse]);
    let conn = h.open().await;
    conn.hang_up();

    let events = h.until(is_degraded).await;
    assert_eq!(
        console_lines(&events),
        vec![
            console::SERVER_DISCONNECTED,
            console::RECONNECTING,
            console::LOST_CONNECTION,
            console::SERVER_OFFLINE,
            FALLBACK_LINE,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn transport_error_is_reported_before_close() {
    let mut h = Harness::start(&[Attempt::Accept, Attempt::Accept]);
    let conn = h.open().await;
    conn.fail();

    let events = h.until_console(console::RECONNECTING).await;
    assert_eq!(
        console_lines(&events),
        vec![
            console::LOST_CONNECTION,
            console::SERVER_DISCONNECTED,
            console::RECONNECTING
        ]
    );
    assert!(events.contains(&SessionEvent::ShowConsole));

    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn manual_connect_after_degrading_starts_fresh() {
    let mut h = Harness::start(&[Attempt::Accept]);
    let conn = h.open().await;
    conn.hang_up();
    h.until(is_degraded).await;

    h.script(&[Attempt::Accept]);
    assert_ok!(h.manager.connect());
    let _conn = h.next_conn().await;
    h.until_console(console::CONNECTED).await;
    assert!(h.manager.is_open());

    h.manager.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Explicit disconnect
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn disconnect_uses_normal_closure_and_never_reconnects() {
    let mut h = Harness::start(&[Attempt::Accept, Attempt::Accept]);
    let conn = h.open().await;

    h.manager.disconnect().unwrap();
    let events = h
        .until(|e| {
            matches!(
                e,
                SessionEvent::StateChanged(ConnectionState::Closed(CloseKind::Explicit))
            )
        })
        .await;

    assert_eq!(conn.close_frame(), Some((1000, "closing ok".to_string())));
    assert_eq!(console_lines(&events), vec![console::DISCONNECTED]);
    assert!(events.contains(&SessionEvent::StateChanged(ConnectionState::Closing)));

    sleep(Duration::from_secs(30)).await;
    let later = h.drain();
    assert!(
        !console_lines(&later).contains(&console::SERVER_DISCONNECTED.to_string()),
        "explicit close reported as a server drop: {later:?}"
    );
    assert_eq!(h.attempts(), 1);
    assert_eq!(
        h.manager.state(),
        ConnectionState::Closed(CloseKind::Explicit)
    );
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_scheduled_reconnect() {
    let mut h = Harness::start(&[Attempt::Accept, Attempt::Accept]);
    let conn = h.open().await;
    conn.hang_up();
    h.until_console(console::SERVER_DISCONNECTED).await;

    h.manager.disconnect().unwrap();
    sleep(Duration::from_secs(30)).await;

    let later = console_lines(&h.drain());
    assert_eq!(later, vec![console::DISCONNECTED]);
    assert_eq!(h.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_live_connection() {
    let mut h = Harness::start(&[Attempt::Accept]);
    let conn = h.open().await;

    h.manager.shutdown().await;
    assert_eq!(conn.close_frame(), Some((1000, "closing ok".to_string())));
    assert_eq!(
        h.manager.state(),
        ConnectionState::Closed(CloseKind::Explicit)
    );
}

// ════════════════════════════════════════════════════════════════════
// Inbound failures
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn server_error_disconnects_without_retry() {
    let mut h = Harness::start(&[Attempt::Accept, Attempt::Accept]);
    let conn = h.open().await;
    conn.push(json!({ "error": "Room not found." }).to_string());

    let events = h.until_console("Room not found.").await;
    assert_eq!(
        console_lines(&events),
        vec![console::DISCONNECTED, "Room not found."]
    );
    assert_eq!(conn.close_frame(), Some((1000, "closing ok".to_string())));

    sleep(Duration::from_secs(30)).await;
    assert_eq!(h.attempts(), 1);
    assert_eq!(
        h.manager.state(),
        ConnectionState::Closed(CloseKind::Explicit)
    );
}

#[tokio::test(start_paused = true)]
async fn unreadable_message_is_surfaced_and_closes() {
    let mut h = Harness::start(&[Attempt::Accept]);
    let conn = h.open().await;
    conn.push("{not json");

    let events = h.until_console(console::UNREADABLE).await;
    assert!(console_lines(&events).contains(&console::DISCONNECTED.to_string()));
    assert!(h.manager.board().is_none());

    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn snapshot_with_unknown_deck_is_rejected() {
    let mut h = Harness::start(&[Attempt::Accept]);
    let conn = h.open().await;
    conn.push(snapshot_json_with("Tarot", false, false, &[("p1", "alice")], &[]));

    let events = h.until(|e| matches!(e, SessionEvent::ShowConsole)).await;
    let lines = console_lines(&events);
    assert!(lines.iter().any(|l| l.contains("unknown deck: Tarot")), "{lines:?}");
    assert!(h.manager.board().is_none());
    assert_eq!(h.prefs.writes(), 0);

    h.manager.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Board over the wire
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn hidden_then_revealed_round() {
    let decks = DeckCatalog::new([Deck::new("fib", ["0", "1", "2", "3", "5", "8"])]);
    let config = ClientConfig::new(
        Session::new("room-1", "secret").unwrap(),
        Endpoint::new(false, "localhost:5000"),
        decks,
    );
    let mut h = Harness::start_config(config, &[Attempt::Accept]);
    let conn = h.open().await;
    let board = |e: &SessionEvent| matches!(e, SessionEvent::Board(_));

    conn.push(snapshot_json_with("fib", false, false, &[("p1", "alice")], &[]));
    h.until(board).await;
    let view = h.manager.board().unwrap();
    let labels: Vec<_> = view.hand.iter().map(|c| c.label.as_str()).collect();
    assert_eq!(labels, ["0", "1", "2", "3", "5", "8"]);
    assert_eq!(view.players[0].face, CardFace::Placeholder);
    assert_eq!(h.prefs.last_deck().as_deref(), Some("fib"));

    conn.push(snapshot_json_with("fib", false, false, &[("p1", "alice")], &[("p1", 2)]));
    let events = h.until(board).await;
    let Some(SessionEvent::Board(update)) = events.last() else {
        panic!("expected board update");
    };
    assert!(!update.hand_rebuilt);
    assert_eq!(update.view.players[0].face, CardFace::FaceDown);

    conn.push(snapshot_json_with("fib", true, false, &[("p1", "alice")], &[("p1", 2)]));
    h.until(board).await;
    let view = h.manager.board().unwrap();
    assert_eq!(view.players[0].face, CardFace::FaceUp("2".into()));
    assert_eq!(h.prefs.writes(), 1);

    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn board_updates_wait_for_room_in_a_full_event_channel() {
    let config = ClientConfig::new(
        Session::new("room-1", "secret").unwrap(),
        Endpoint::new(false, "localhost:5000"),
        DeckCatalog::standard(),
    )
    .with_event_channel_capacity(1);
    let mut h = Harness::start_config(config, &[Attempt::Accept]);
    h.manager.connect().unwrap();
    let conn = h.next_conn().await;
    let mut state = h.manager.subscribe_state();
    state.wait_for(|s| s.is_open()).await.unwrap();

    // Nothing reads events while both snapshots arrive.
    let players = [("1", "alice")];
    conn.push(snapshot_json_with("Fibonacci", false, false, &players, &[]));
    conn.push(snapshot_json_with("Hours", false, true, &players, &[]));
    sleep(Duration::from_secs(1)).await;

    let mut boards = Vec::new();
    while boards.len() < 2 {
        if let SessionEvent::Board(update) = h.events.recv().await.unwrap() {
            boards.push(update);
        }
    }
    assert_eq!(boards[0].view.deck_id, "Fibonacci");
    assert!(boards[0].hand_rebuilt);
    assert_eq!(boards[1].view.deck_id, "Hours");
    assert!(boards[1].hand_rebuilt);
    assert!(boards[1].clear_selection);
    assert_eq!(h.prefs.writes(), 2);

    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn actions_carry_room_and_token() {
    let mut h = Harness::start(&[Attempt::Accept]);
    let mut conn = h.open().await;
    conn.push(snapshot_json(
        false,
        &[("1", "alice"), ("2", "bob")],
        &[("2", 4)],
    ));
    h.until(|e| matches!(e, SessionEvent::Board(_))).await;

    h.manager.select_card(0).unwrap();
    let select = conn.next_sent().await;
    assert_eq!(select["action"], "select");
    assert_eq!(select["card"], 0);
    assert_eq!(select["deck"], "Fibonacci");
    assert_eq!(select["room"], "room-1");
    assert_eq!(select["token"], "secret");

    assert!(h.manager.reveal().unwrap());
    assert_eq!(conn.next_sent().await["action"], "reveal");

    h.manager.rename("Alice B").unwrap();
    let rename = conn.next_sent().await;
    assert_eq!(rename["action"], "username");
    assert_eq!(rename["value"], "Alice B");

    h.manager.set_topic("Login page").unwrap();
    assert_eq!(conn.next_sent().await["value"], "Login page");

    h.manager.change_deck("Hours").unwrap();
    let deck = conn.next_sent().await;
    assert_eq!(deck["action"], "deck");
    assert_eq!(deck["deck"], "Hours");

    h.manager.reset().unwrap();
    assert_eq!(conn.next_sent().await["action"], "reset");

    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn revealed_round_locks_selection() {
    let mut h = Harness::start(&[Attempt::Accept]);
    let mut conn = h.open().await;
    conn.push(snapshot_json(true, &[("1", "alice")], &[("1", 3)]));
    h.until(|e| matches!(e, SessionEvent::Board(_))).await;

    assert!(matches!(
        h.manager.select_card(1),
        Err(SibylError::SelectionLocked)
    ));
    // Nothing is face-down, so there is nothing to reveal.
    assert!(!h.manager.reveal().unwrap());
    assert!(conn.sent_now().is_empty());

    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn out_of_range_selection_is_refused_locally() {
    let mut h = Harness::start(&[Attempt::Accept]);
    let mut conn = h.open().await;
    conn.push(snapshot_json(false, &[("1", "alice")], &[]));
    h.until(|e| matches!(e, SessionEvent::Board(_))).await;

    let err = h.manager.select_card(99).unwrap_err();
    assert!(matches!(err, SibylError::CardOutOfRange { index: 99, .. }));
    assert!(conn.sent_now().is_empty());

    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn deck_change_writes_preference_once() {
    let mut h = Harness::start(&[Attempt::Accept]);
    let conn = h.open().await;
    let board = |e: &SessionEvent| matches!(e, SessionEvent::Board(_));

    for deck in ["Fibonacci", "Fibonacci", "Hours", "Hours", "Hours"] {
        conn.push(snapshot_json_with(deck, false, false, &[("1", "alice")], &[]));
        h.until(board).await;
    }

    assert_eq!(h.prefs.writes(), 2);
    assert_eq!(h.prefs.last_deck().as_deref(), Some("Hours"));

    h.manager.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Sending while not open
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn actions_fail_loudly_when_not_open() {
    let mut h = Harness::start(&[Attempt::Accept]);

    let err = assert_err!(h.manager.reset());
    assert!(matches!(
        err,
        SibylError::NotOpen {
            state: ConnectionState::Idle
        }
    ));

    let conn = h.open().await;
    conn.hang_up();
    h.until_console(console::SERVER_DISCONNECTED).await;

    assert!(matches!(
        h.manager.rename("bob"),
        Err(SibylError::NotOpen {
            state: ConnectionState::Closed(CloseKind::Unexpected)
        })
    ));

    h.manager.shutdown().await;
}
