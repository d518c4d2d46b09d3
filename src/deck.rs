//! Deck catalog.
//!
//! A [`Deck`] is a named, ordered list of card labels. Labels are opaque
//! renderable content and are trusted as-is. The client never mutates a deck;
//! the catalog is supplied once through configuration and shared read-only.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Result, SibylError};

/// A named, ordered catalog of selectable card labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Deck {
    /// Deck identifier, as used on the wire.
    pub id: String,
    /// Card labels in source order. A card index addresses this list.
    pub cards: Vec<String>,
}

impl Deck {
    /// Create a deck from an id and its labels.
    pub fn new<I, S>(id: impl Into<String>, cards: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            cards: cards.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the label at `index`, if any.
    pub fn card(&self, index: usize) -> Option<&str> {
        self.cards.get(index).map(String::as_str)
    }

    /// Resolve `index` against this deck.
    ///
    /// # Errors
    ///
    /// Returns [`SibylError::CardOutOfRange`] if the index does not address a card.
    pub fn resolve(&self, index: usize) -> Result<&str> {
        self.card(index).ok_or_else(|| SibylError::CardOutOfRange {
            deck: self.id.clone(),
            index,
            len: self.cards.len(),
        })
    }

    /// Number of cards in the deck.
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    /// Returns `true` if the deck holds no cards.
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}

/// Read-only catalog of decks keyed by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DeckCatalog {
    decks: BTreeMap<String, Deck>,
}

impl DeckCatalog {
    /// Build a catalog from a list of decks. Later duplicates replace earlier ones.
    pub fn new(decks: impl IntoIterator<Item = Deck>) -> Self {
        Self {
            decks: decks.into_iter().map(|d| (d.id.clone(), d)).collect(),
        }
    }

    /// The four decks served by a stock Sibyl server.
    pub fn standard() -> Self {
        Self::new([
            Deck::new(
                "Modified Fibonacci",
                ["0", "1", "2", "3", "5", "8", "13", "20", "40", "100", "?", "☕"],
            ),
            Deck::new(
                "Fibonacci",
                ["0", "1", "2", "3", "5", "8", "13", "21", "34", "55", "89", "?", "☕"],
            ),
            Deck::new("T-Shirt Sizes", ["XS", "S", "M", "L", "XL", "?", "☕"]),
            Deck::new(
                "Hours",
                ["0", ".5", "1", "2", "4", "8", "12", "16", "20", "24", "?", "☕"],
            ),
        ])
    }

    /// Look up a deck by id.
    pub fn get(&self, id: &str) -> Option<&Deck> {
        self.decks.get(id)
    }

    /// Look up a deck by id, failing if it is not in the catalog.
    ///
    /// # Errors
    ///
    /// Returns [`SibylError::UnknownDeck`] for ids the catalog does not know.
    pub fn require(&self, id: &str) -> Result<&Deck> {
        self.get(id)
            .ok_or_else(|| SibylError::UnknownDeck(id.to_string()))
    }

    /// Returns `true` if the catalog holds a deck with this id.
    pub fn contains(&self, id: &str) -> bool {
        self.decks.contains_key(id)
    }

    /// Deck ids in sorted order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.decks.keys().map(String::as_str)
    }

    /// Number of decks.
    pub fn len(&self) -> usize {
        self.decks.len()
    }

    /// Returns `true` if the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.decks.is_empty()
    }
}

/// Either `["0", "1", ...]` or `{"name": "...", "cards": [...]}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum DeckEntry {
    Labels(Vec<String>),
    Named { cards: Vec<String> },
}

impl<'de> Deserialize<'de> for DeckCatalog {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<String, DeckEntry>::deserialize(deserializer)?;
        let decks = raw.into_iter().map(|(key, entry)| match entry {
            DeckEntry::Labels(cards) => Deck { id: key, cards },
            // The map key is the wire id; an embedded name is informational.
            DeckEntry::Named { cards } => Deck { id: key, cards },
        });
        Ok(Self::new(decks))
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

    #[test]
    fn standard_catalog_matches_server_decks() {
        let catalog = DeckCatalog::standard();
        assert_eq!(catalog.len(), 4);
        let fib = catalog.get("Modified Fibonacci").unwrap();
        assert_eq!(fib.len(), 12);
        assert_eq!(fib.card(0), Some("0"));
        assert_eq!(fib.card(11), Some("☕"));
        assert_eq!(fib.card(12), None);
        assert!(catalog.contains("T-Shirt Sizes"));
    }

    #[test]
    fn resolve_reports_out_of_range() {
        let deck = Deck::new("fib", ["0", "1"]);
        assert_eq!(deck.resolve(1).unwrap(), "1");
        let err = deck.resolve(2).unwrap_err();
        assert!(matches!(
            err,
            SibylError::CardOutOfRange { index: 2, len: 2, .. }
        ));
    }

    #[test]
    fn require_rejects_unknown_ids() {
        let catalog = DeckCatalog::new([Deck::new("fib", ["0"])]);
        assert!(catalog.require("fib").is_ok());
        assert!(matches!(
            catalog.require("nope"),
            Err(SibylError::UnknownDeck(id)) if id == "nope"
        ));
    }

    #[test]
    fn deserializes_compact_shape() {
        let catalog: DeckCatalog =
            serde_json::from_str(r#"{"fib": ["0","1","2","3","5","8"]}"#).unwrap();
        let fib = catalog.get("fib").unwrap();
        assert_eq!(fib.id, "fib");
        assert_eq!(fib.cards, vec!["0", "1", "2", "3", "5", "8"]);
    }

    #[test]
    fn deserializes_server_shape() {
        let json = r#"{"Hours": {"name": "Hours", "cards": ["0", ".5", "1"]}}"#;
        let catalog: DeckCatalog = serde_json::from_str(json).unwrap();
        let hours = catalog.get("Hours").unwrap();
        assert_eq!(hours.cards, vec!["0", ".5", "1"]);
    }

    #[test]
    fn ids_are_sorted() {
        let ids: Vec<_> = DeckCatalog::standard().ids().map(str::to_owned).collect();
        assert_eq!(
            ids,
            vec!["Fibonacci", "Hours", "Modified Fibonacci", "T-Shirt Sizes"]
        );
    }
}
