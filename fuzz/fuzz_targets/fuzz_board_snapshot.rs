#![no_main]

use libfuzzer_sys::fuzz_target;
use sibyl_client::protocol::{decode, ServerMessage};
use sibyl_client::{BoardStateReconciler, CardFace, DeckCatalog, MemoryPreferences};

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(ServerMessage::Snapshot(snapshot)) = decode(s) else {
        return;
    };
    let decks = DeckCatalog::standard();
    let mut reconciler = BoardStateReconciler::new(decks.clone(), MemoryPreferences::new());
    if let Ok(update) = reconciler.apply(*snapshot) {
        let view = update.view;
        assert_eq!(view.hand.len(), decks.get(&view.deck_id).map_or(0, |d| d.len()));
        if !view.reveal {
            assert!(!view.players.iter().any(|p| matches!(p.face, CardFace::FaceUp(_))));
        }
    }
});
