//! Best-effort durable preferences.
//!
//! The client remembers exactly one thing across sessions: the id of the last
//! deck it saw. Writes go through [`PreferenceStore`]; callers log and swallow
//! failures, a failed write never fails the operation that triggered it.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{Result, SibylError};

/// Key under which the last deck id is stored.
pub const LAST_DECK_KEY: &str = "deck";

/// A string-valued key/value store.
pub trait PreferenceStore: Send + 'static {
    /// Persist `value` under `key`.
    ///
    /// # Errors
    ///
    /// Implementations may fail; callers treat every write as best-effort.
    fn store(&mut self, key: &str, value: &str) -> Result<()>;

    /// Read the value stored under `key`, if any.
    fn load(&self, key: &str) -> Option<String>;

    /// The last deck id written, if any.
    fn last_deck(&self) -> Option<String> {
        self.load(LAST_DECK_KEY)
    }
}

impl PreferenceStore for Box<dyn PreferenceStore> {
    fn store(&mut self, key: &str, value: &str) -> Result<()> {
        (**self).store(key, value)
    }

    fn load(&self, key: &str) -> Option<String> {
        (**self).load(key)
    }
}

/// In-memory store. Clones share the same map, so a clone kept outside the
/// client observes every write.
#[derive(Debug, Clone, Default)]
pub struct MemoryPreferences {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    values: HashMap<String, String>,
    writes: usize,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful writes so far.
    pub fn writes(&self) -> usize {
        self.inner.lock().map(|inner| inner.writes).unwrap_or(0)
    }
}

impl PreferenceStore for MemoryPreferences {
    fn store(&mut self, key: &str, value: &str) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| SibylError::Io(std::io::Error::other("preference lock poisoned")))?;
        inner.values.insert(key.to_string(), value.to_string());
        inner.writes += 1;
        Ok(())
    }

    fn load(&self, key: &str) -> Option<String> {
        self.inner.lock().ok()?.values.get(key).cloned()
    }
}

/// Store backed by a single JSON object file.
///
/// Every write rewrites the whole file. A missing or unreadable file reads as
/// empty.
#[derive(Debug, Clone)]
pub struct JsonFilePreferences {
    path: PathBuf,
}

impl JsonFilePreferences {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> BTreeMap<String, String> {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }
}

impl PreferenceStore for JsonFilePreferences {
    fn store(&mut self, key: &str, value: &str) -> Result<()> {
        let mut values = self.read_all();
        values.insert(key.to_string(), value.to_string());
        let json = serde_json::to_string_pretty(&values)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    fn load(&self, key: &str) -> Option<String> {
        self.read_all().remove(key)
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

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("sibyl-prefs-{}-{name}.json", std::process::id()))
    }

    #[test]
    fn memory_clones_share_writes() {
        let prefs = MemoryPreferences::new();
        let mut writer = prefs.clone();
        writer.store(LAST_DECK_KEY, "Hours").unwrap();
        assert_eq!(prefs.last_deck().as_deref(), Some("Hours"));
        assert_eq!(prefs.writes(), 1);
    }

    #[test]
    fn json_file_round_trips_and_keeps_other_keys() {
        let path = temp_path("roundtrip");
        let _ = std::fs::remove_file(&path);

        let mut prefs = JsonFilePreferences::new(&path);
        assert_eq!(prefs.last_deck(), None);
        prefs.store("theme", "dark").unwrap();
        prefs.store(LAST_DECK_KEY, "Fibonacci").unwrap();

        let reopened = JsonFilePreferences::new(&path);
        assert_eq!(reopened.last_deck().as_deref(), Some("Fibonacci"));
        assert_eq!(reopened.load("theme").as_deref(), Some("dark"));

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn json_file_write_failure_is_reported() {
        let dir = std::env::temp_dir().join("sibyl-prefs-missing-dir").join("nested");
        let mut prefs = JsonFilePreferences::new(dir.join("prefs.json"));
        assert!(matches!(
            prefs.store(LAST_DECK_KEY, "Hours"),
            Err(SibylError::Io(_))
        ));
    }

    #[test]
    fn boxed_store_delegates() {
        let prefs = MemoryPreferences::new();
        let mut boxed: Box<dyn PreferenceStore> = Box::new(prefs.clone());
        boxed.store(LAST_DECK_KEY, "T-Shirt Sizes").unwrap();
        assert_eq!(boxed.last_deck().as_deref(), Some("T-Shirt Sizes"));
        assert_eq!(prefs.writes(), 1);
    }
}
