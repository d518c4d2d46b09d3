//! Board-state reconciliation.
//!
//! [`BoardStateReconciler`] turns each server snapshot into a render-ready
//! [`BoardView`]. It caches the active deck so the caller's hand is rebuilt
//! only when the deck actually changes, and recomputes the per-player grid on
//! every snapshot.
//!
//! The caller's own selection is not part of the server state. UI adapters
//! hold it in a [`HandSelection`] and feed it every [`BoardUpdate`].

use std::cmp::Ordering;

use icu_collator::options::CollatorOptions;
use icu_collator::{Collator, CollatorBorrowed, CollatorPreferences};
use tracing::{debug, warn};

use crate::deck::DeckCatalog;
use crate::error::Result;
use crate::preferences::{PreferenceStore, LAST_DECK_KEY};
use crate::protocol::{BoardSnapshot, PlayerId};

// ── View model ──────────────────────────────────────────────────────

/// A card in the caller's own hand. Always rendered face-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandCard {
    pub index: usize,
    pub label: String,
}

/// How one player's slot on the board renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardFace {
    /// The player picked a card that is not revealed yet.
    FaceDown,
    /// The player's card, revealed.
    FaceUp(String),
    /// The player has not picked a card this round.
    Placeholder,
}

impl CardFace {
    /// Returns `true` for [`CardFace::FaceDown`].
    pub fn is_face_down(&self) -> bool {
        matches!(self, Self::FaceDown)
    }
}

/// One player's slot on the board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerCard {
    pub player_id: PlayerId,
    pub name: String,
    pub face: CardFace,
}

/// Everything a renderer needs after a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardView {
    pub username: String,
    pub topic: String,
    pub reveal: bool,
    pub deck_id: String,
    /// The caller's hand for the active deck, in deck order.
    pub hand: Vec<HandCard>,
    /// Player slots, ordered by display name.
    pub players: Vec<PlayerCard>,
}

impl BoardView {
    /// Number of players whose card is still hidden.
    pub fn face_down_count(&self) -> usize {
        self.players.iter().filter(|p| p.face.is_face_down()).count()
    }

    /// Whether the caller may change their selection.
    pub fn selection_locked(&self) -> bool {
        self.reveal
    }
}

/// Result of applying one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardUpdate {
    pub view: BoardView,
    /// The deck changed and the hand was rebuilt. When `false` the renderer
    /// must leave its current hand untouched.
    pub hand_rebuilt: bool,
    /// The server asked for local selection highlighting to be cleared.
    pub clear_selection: bool,
}

// ── Reconciler ──────────────────────────────────────────────────────

/// Maintains the last-known view model across snapshots.
pub struct BoardStateReconciler {
    decks: DeckCatalog,
    preferences: Box<dyn PreferenceStore>,
    names: NameOrder,
    view: Option<BoardView>,
}

impl BoardStateReconciler {
    pub fn new(decks: DeckCatalog, preferences: impl PreferenceStore) -> Self {
        Self {
            decks,
            preferences: Box::new(preferences),
            names: NameOrder::new(),
            view: None,
        }
    }

    /// The deck catalog snapshots are resolved against.
    pub fn decks(&self) -> &DeckCatalog {
        &self.decks
    }

    /// The view produced by the most recent snapshot.
    pub fn view(&self) -> Option<&BoardView> {
        self.view.as_ref()
    }

    /// Apply a snapshot.
    ///
    /// The snapshot is validated before anything is cached, so a rejected
    /// snapshot leaves the previous view intact.
    ///
    /// # Errors
    ///
    /// Returns [`SibylError::UnknownDeck`](crate::SibylError::UnknownDeck) if
    /// the deck is not in the catalog, or
    /// [`SibylError::CardOutOfRange`](crate::SibylError::CardOutOfRange) if a
    /// selection does not index into it.
    pub fn apply(&mut self, snapshot: BoardSnapshot) -> Result<BoardUpdate> {
        let deck = self.decks.require(&snapshot.deck_id)?;
        let selections = snapshot.cards_by_player();
        for (player, &index) in &selections {
            deck.resolve(index)?;
            if !snapshot.players.contains_key(*player) {
                warn!(player = %player, "selection for unknown player ignored");
            }
        }

        let mut order: Vec<(&PlayerId, &String)> = snapshot.players.iter().collect();
        order.sort_by(|a, b| self.names.compare(a.1, b.1).then_with(|| a.0.cmp(b.0)));

        let mut players = Vec::with_capacity(order.len());
        for (player_id, name) in order {
            let face = match selections.get(player_id) {
                Some(&index) if snapshot.reveal => {
                    CardFace::FaceUp(deck.resolve(index)?.to_string())
                }
                Some(_) => CardFace::FaceDown,
                None => CardFace::Placeholder,
            };
            players.push(PlayerCard {
                player_id: player_id.clone(),
                name: name.clone(),
                face,
            });
        }

        let previous = self.view.take();
        let deck_changed = previous
            .as_ref()
            .is_none_or(|view| view.deck_id != snapshot.deck_id);
        let hand = match previous {
            Some(view) if !deck_changed => view.hand,
            _ => deck
                .cards
                .iter()
                .enumerate()
                .map(|(index, label)| HandCard {
                    index,
                    label: label.clone(),
                })
                .collect(),
        };

        if deck_changed {
            debug!(deck = %snapshot.deck_id, "deck changed, hand rebuilt");
            if let Err(e) = self.preferences.store(LAST_DECK_KEY, &snapshot.deck_id) {
                debug!("could not remember last deck: {e}");
            }
        }

        let view = BoardView {
            username: snapshot.username,
            topic: snapshot.topic,
            reveal: snapshot.reveal,
            deck_id: snapshot.deck_id,
            hand,
            players,
        };
        self.view = Some(view.clone());

        Ok(BoardUpdate {
            view,
            hand_rebuilt: deck_changed,
            clear_selection: snapshot.reset_signal,
        })
    }
}

impl std::fmt::Debug for BoardStateReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoardStateReconciler")
            .field("decks", &self.decks.len())
            .field("deck_id", &self.view.as_ref().map(|v| v.deck_id.as_str()))
            .finish()
    }
}

/// Display-name ordering under the root-locale collation, then exact, so the
/// result is total and independent of the server's key order.
struct NameOrder {
    collator: Option<CollatorBorrowed<'static>>,
}

impl NameOrder {
    fn new() -> Self {
        let prefs = CollatorPreferences::default();
        let collator = match Collator::try_new(prefs, CollatorOptions::default()) {
            Ok(collator) => Some(collator),
            Err(e) => {
                warn!("name collation unavailable, ordering by code point: {e}");
                None
            }
        };
        Self { collator }
    }

    fn compare(&self, a: &str, b: &str) -> Ordering {
        let collated = match &self.collator {
            Some(collator) => collator.compare(a, b),
            None => Ordering::Equal,
        };
        collated.then_with(|| a.cmp(b))
    }
}

// ── Local selection ─────────────────────────────────────────────────

/// The caller's chosen card for the current round, held by the renderer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandSelection {
    chosen: Option<usize>,
    locked: bool,
}

impl HandSelection {
    pub fn new() -> Self {
        Self::default()
    }

    /// The highlighted card, if any.
    pub fn chosen(&self) -> Option<usize> {
        self.chosen
    }

    /// Whether selection changes are currently refused.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Highlight `index`. Returns `false` (and changes nothing) while locked.
    pub fn choose(&mut self, index: usize) -> bool {
        if self.locked {
            return false;
        }
        self.chosen = Some(index);
        true
    }

    /// Drop the highlight.
    pub fn clear(&mut self) {
        self.chosen = None;
    }

    /// Follow a board update: clear on reset, lock while revealed.
    pub fn follow(&mut self, update: &BoardUpdate) {
        if update.clear_selection || update.hand_rebuilt {
            self.chosen = None;
        }
        self.locked = update.view.reveal;
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
    use crate::deck::Deck;
    use crate::error::SibylError;
    use crate::preferences::MemoryPreferences;
    use crate::protocol::CardEntry;
    use std::collections::HashMap;

    fn catalog() -> DeckCatalog {
        DeckCatalog::new([
            Deck::new("fib", ["0", "1", "2", "3", "5", "8"]),
            Deck::new("shirt", ["S", "M", "L"]),
        ])
    }

    fn snapshot(
        deck: &str,
        reveal: bool,
        cards: &[(&str, usize)],
        players: &[(&str, &str)],
    ) -> BoardSnapshot {
        BoardSnapshot {
            username: "alice".into(),
            topic: String::new(),
            reveal,
            reset_signal: false,
            deck_id: deck.into(),
            cards: cards
                .iter()
                .map(|(id, card)| CardEntry {
                    player_id: PlayerId::new(*id),
                    card: *card,
                })
                .collect(),
            players: players
                .iter()
                .map(|(id, name)| (PlayerId::new(*id), (*name).to_string()))
                .collect::<HashMap<_, _>>(),
        }
    }

    fn reconciler() -> (BoardStateReconciler, MemoryPreferences) {
        let prefs = MemoryPreferences::new();
        (BoardStateReconciler::new(catalog(), prefs.clone()), prefs)
    }

    #[test]
    fn first_snapshot_builds_hand_and_placeholder() {
        let (mut board, prefs) = reconciler();
        let update = board
            .apply(snapshot("fib", false, &[], &[("p1", "alice")]))
            .unwrap();

        assert!(update.hand_rebuilt);
        let labels: Vec<_> = update.view.hand.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["0", "1", "2", "3", "5", "8"]);
        assert_eq!(update.view.players.len(), 1);
        assert_eq!(update.view.players[0].player_id, PlayerId::new("p1"));
        assert_eq!(update.view.players[0].face, CardFace::Placeholder);
        assert_eq!(prefs.last_deck().as_deref(), Some("fib"));
    }

    #[test]
    fn hidden_then_revealed_selection() {
        let (mut board, _prefs) = reconciler();
        board
            .apply(snapshot("fib", false, &[], &[("p1", "alice")]))
            .unwrap();

        let hidden = board
            .apply(snapshot("fib", false, &[("p1", 2)], &[("p1", "alice")]))
            .unwrap();
        assert!(!hidden.hand_rebuilt);
        assert_eq!(hidden.view.players[0].face, CardFace::FaceDown);
        assert_eq!(hidden.view.face_down_count(), 1);

        let shown = board
            .apply(snapshot("fib", true, &[("p1", 2)], &[("p1", "alice")]))
            .unwrap();
        assert!(!shown.hand_rebuilt);
        assert_eq!(shown.view.players[0].face, CardFace::FaceUp("2".into()));
        assert!(shown.view.selection_locked());
    }

    #[test]
    fn deck_change_rebuilds_once_and_writes_once() {
        let (mut board, prefs) = reconciler();
        let players = [("p1", "alice")];
        assert!(board.apply(snapshot("fib", false, &[], &players)).unwrap().hand_rebuilt);
        assert!(!board.apply(snapshot("fib", false, &[], &players)).unwrap().hand_rebuilt);
        assert_eq!(prefs.writes(), 1);

        let switched = board.apply(snapshot("shirt", false, &[], &players)).unwrap();
        assert!(switched.hand_rebuilt);
        assert_eq!(switched.view.hand.len(), 3);
        assert!(!board.apply(snapshot("shirt", false, &[], &players)).unwrap().hand_rebuilt);
        assert_eq!(prefs.writes(), 2);
        assert_eq!(prefs.last_deck().as_deref(), Some("shirt"));
    }

    #[test]
    fn order_follows_names_not_keys() {
        let (mut board, _prefs) = reconciler();
        let players = [("z", "Alice"), ("a", "carol"), ("m", "bob")];
        let update = board.apply(snapshot("fib", false, &[], &players)).unwrap();
        let names: Vec<_> = update.view.players.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Alice", "bob", "carol"]);
    }

    #[test]
    fn unselected_players_are_placeholders_even_when_revealed() {
        let (mut board, _prefs) = reconciler();
        let update = board
            .apply(snapshot(
                "fib",
                true,
                &[("p1", 5)],
                &[("p1", "alice"), ("p2", "bob")],
            ))
            .unwrap();
        assert_eq!(update.view.players[0].face, CardFace::FaceUp("8".into()));
        assert_eq!(update.view.players[1].face, CardFace::Placeholder);
    }

    #[test]
    fn reset_signal_is_one_shot() {
        let (mut board, _prefs) = reconciler();
        let players = [("p1", "alice")];
        board.apply(snapshot("fib", true, &[("p1", 1)], &players)).unwrap();

        let mut reset = snapshot("fib", true, &[], &players);
        reset.reset_signal = true;
        let update = board.apply(reset).unwrap();
        assert!(update.clear_selection);
        assert!(update.view.reveal);
        assert_eq!(update.view.deck_id, "fib");
        assert_eq!(update.view.players.len(), 1);

        let after = board.apply(snapshot("fib", false, &[], &players)).unwrap();
        assert!(!after.clear_selection);
    }

    #[test]
    fn invalid_snapshot_leaves_previous_view() {
        let (mut board, prefs) = reconciler();
        board.apply(snapshot("fib", false, &[], &[("p1", "alice")])).unwrap();

        let err = board
            .apply(snapshot("nope", false, &[], &[("p1", "alice")]))
            .unwrap_err();
        assert!(matches!(err, SibylError::UnknownDeck(_)));

        let err = board
            .apply(snapshot("shirt", false, &[("p1", 9)], &[("p1", "alice")]))
            .unwrap_err();
        assert!(matches!(err, SibylError::CardOutOfRange { index: 9, .. }));

        assert_eq!(board.view().unwrap().deck_id, "fib");
        assert_eq!(prefs.writes(), 1);
    }

    #[test]
    fn hand_selection_follows_updates() {
        let (mut board, _prefs) = reconciler();
        let players = [("p1", "alice")];
        let mut selection = HandSelection::new();

        selection.follow(&board.apply(snapshot("fib", false, &[], &players)).unwrap());
        assert!(selection.choose(3));
        assert_eq!(selection.chosen(), Some(3));

        selection.follow(&board.apply(snapshot("fib", true, &[("p1", 3)], &players)).unwrap());
        assert!(!selection.choose(1));
        assert_eq!(selection.chosen(), Some(3));

        let mut reset = snapshot("fib", false, &[], &players);
        reset.reset_signal = true;
        selection.follow(&board.apply(reset).unwrap());
        assert_eq!(selection.chosen(), None);
        assert!(!selection.is_locked());
    }

    #[test]
    fn name_comparison_is_collated_then_exact() {
        let names = NameOrder::new();
        assert_eq!(names.compare("alice", "Bob"), Ordering::Less);
        assert_eq!(names.compare("Émile", "Oscar"), Ordering::Less);
        assert_ne!(names.compare("Alice", "alice"), Ordering::Equal);
        assert_eq!(names.compare("Émile", "Émile"), Ordering::Equal);
    }

    #[test]
    fn accented_names_sort_with_their_base_letter() {
        let (mut board, _prefs) = reconciler();
        let players = [("a", "Zoe"), ("b", "Émile"), ("c", "Oscar")];
        let update = board.apply(snapshot("fib", false, &[], &players)).unwrap();
        let names: Vec<_> = update.view.players.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Émile", "Oscar", "Zoe"]);
    }
}
