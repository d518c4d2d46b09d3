//! # Terminal Room Example
//!
//! Joins a Sibyl room from the terminal:
//!
//! 1. Load the room bootstrap from `SIBYL_CONFIG`
//! 2. Connect over WebSocket and follow the session
//! 3. Print the board after every snapshot
//! 4. Read actions from stdin until `quit` or Ctrl+C
//!
//! ## Running
//!
//! ```sh
//! SIBYL_CONFIG='{"Room":"r1","Token":"t1","Decks":{"Fibonacci":{"cards":["0","1","2","3","5","8"]}}}' \
//! SIBYL_PAGE=http://localhost:5000/r1 \
//!     cargo run --example terminal_room
//! ```
//!
//! Commands: `select <n>`, `reveal`, `reset`, `name <text>`, `topic <text>`,
//! `deck <id>`, `disconnect`, `connect`, `quit`.

use sibyl_client::{
    BoardView, CardFace, ConnectionManager, Endpoint, HandSelection, JsonFilePreferences,
    PreferenceStore, RoomConfig, SessionEvent, WebSocketConnector,
};
use tokio::io::{AsyncBufReadExt, BufReader};

/// Default page URL when `SIBYL_PAGE` is not set.
const DEFAULT_PAGE: &str = "http://localhost:5000/";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let page = std::env::var("SIBYL_PAGE").unwrap_or_else(|_| DEFAULT_PAGE.to_string());
    let config = RoomConfig::from_env()?.into_client_config(Endpoint::from_page_url(&page)?)?;

    let preferences = JsonFilePreferences::new(std::env::temp_dir().join("sibyl-preferences.json"));
    if let Some(deck) = preferences.last_deck() {
        println!("(last deck used: {deck})");
    }

    let connector = WebSocketConnector::new().with_connect_timeout(std::time::Duration::from_secs(5));
    let (mut manager, mut events) = ConnectionManager::start(connector, config, preferences)?;
    manager.connect()?;

    let mut selection = HandSelection::new();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    // ── Event loop ──────────────────────────────────────────────────
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::Console(line) => println!("> {line}"),
                    SessionEvent::Board(update) => {
                        selection.follow(&update);
                        render(&update.view, &selection);
                    }
                    SessionEvent::Degraded { fallback } => {
                        println!("Automatic reconnection stopped. Open {fallback} instead.");
                    }
                    other => tracing::debug!("event: {other:?}"),
                }
            }

            line = stdin.next_line() => {
                let Some(line) = line? else { break };
                if !run_command(&manager, &mut selection, line.trim()) {
                    break;
                }
            }

            _ = tokio::signal::ctrl_c() => break,
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────────
    manager.disconnect().ok();
    manager.shutdown().await;
    Ok(())
}

/// Run one stdin command. Returns `false` to quit.
fn run_command(manager: &ConnectionManager, selection: &mut HandSelection, line: &str) -> bool {
    let (cmd, arg) = line.split_once(' ').unwrap_or((line, ""));
    let result = match cmd {
        "select" => match arg.parse::<usize>() {
            Ok(index) => manager.select_card(index).map(|()| {
                selection.choose(index);
            }),
            Err(_) => {
                println!("usage: select <card number>");
                return true;
            }
        },
        "reveal" => manager.reveal().map(|sent| {
            if !sent {
                println!("nothing to reveal");
            }
        }),
        "reset" => manager.reset(),
        "name" => manager.rename(arg),
        "topic" => manager.set_topic(arg),
        "deck" => manager.change_deck(arg),
        "connect" => manager.connect(),
        "disconnect" => manager.disconnect(),
        "quit" => return false,
        "" => return true,
        other => {
            println!("unknown command: {other}");
            return true;
        }
    };
    if let Err(e) = result {
        println!("! {e}");
    }
    true
}

fn render(view: &BoardView, selection: &HandSelection) {
    println!();
    println!("{} | topic: {} | deck: {}", view.username, view.topic, view.deck_id);
    for card in &view.hand {
        let marker = if selection.chosen() == Some(card.index) { "*" } else { " " };
        print!("[{marker}{}:{}] ", card.index, card.label);
    }
    println!();
    for player in &view.players {
        let face = match &player.face {
            CardFace::FaceDown => "##".to_string(),
            CardFace::FaceUp(label) => label.clone(),
            CardFace::Placeholder => "--".to_string(),
        };
        println!("  {:<25} {face}", player.name);
    }
}
