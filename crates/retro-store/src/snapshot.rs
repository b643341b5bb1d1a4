//! Typed snapshot access on top of a key-value store

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use retro_core::{Language, SessionCode};

use crate::KeyValueStore;

/// Storage keys
pub mod keys {
    /// Last session code hosted or joined
    pub const ACTIVE_SESSION: &str = "active_session";
    /// Moderator board snapshot
    pub const BOARD: &str = "board_state";
    /// Preferred display language
    pub const LANGUAGE: &str = "language";
    /// Contributor display name
    pub const AUTHOR: &str = "author";
}

/// JSON values in a key-value store, best-effort in both directions
#[derive(Clone)]
pub struct SnapshotStore {
    inner: Arc<dyn KeyValueStore>,
}

impl fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotStore").finish_non_exhaustive()
    }
}

impl SnapshotStore {
    pub fn new(store: impl KeyValueStore + 'static) -> Self {
        SnapshotStore {
            inner: Arc::new(store),
        }
    }

    pub fn from_arc(store: Arc<dyn KeyValueStore>) -> Self {
        SnapshotStore { inner: store }
    }

    /// Read and parse a value. Missing, unreadable and unparseable values
    /// all come back as `None`.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.inner.get(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key, error = %e, "failed to read stored value");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key, error = %e, "discarding unparseable stored value");
                None
            }
        }
    }

    /// Like `load`, falling back to the type's default
    pub fn load_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        self.load(key).unwrap_or_default()
    }

    /// Serialize and write a value. Returns whether the write succeeded.
    pub fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> bool {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(key, error = %e, "failed to serialize value");
                return false;
            }
        };
        match self.inner.set(key, &raw) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key, error = %e, "failed to persist value");
                false
            }
        }
    }

    pub fn remove(&self, key: &str) {
        if let Err(e) = self.inner.remove(key) {
            tracing::warn!(key, error = %e, "failed to remove stored value");
        }
    }

    pub fn session_code(&self) -> Option<SessionCode> {
        self.load(keys::ACTIVE_SESSION)
    }

    pub fn set_session_code(&self, code: &SessionCode) -> bool {
        self.save(keys::ACTIVE_SESSION, code)
    }

    pub fn author(&self) -> Option<String> {
        self.load(keys::AUTHOR)
    }

    pub fn set_author(&self, author: &str) -> bool {
        self.save(keys::AUTHOR, author)
    }

    pub fn language(&self) -> Language {
        self.load_or_default(keys::LANGUAGE)
    }

    pub fn set_language(&self, language: Language) -> bool {
        self.save(keys::LANGUAGE, &language)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    #[test]
    fn test_typed_helpers() {
        let store = SnapshotStore::new(MemoryStore::new());
        assert_eq!(store.session_code(), None);
        assert_eq!(store.language(), Language::De);

        let code = SessionCode::parse("d1").unwrap();
        assert!(store.set_session_code(&code));
        assert!(store.set_author("Lena"));
        assert!(store.set_language(Language::Pt));

        assert_eq!(store.session_code(), Some(code));
        assert_eq!(store.author().as_deref(), Some("Lena"));
        assert_eq!(store.language(), Language::Pt);
    }

    #[test]
    fn test_corrupt_values_read_as_empty() {
        let backend = MemoryStore::new();
        backend.set(keys::LANGUAGE, "{not json").unwrap();
        backend.set(keys::ACTIVE_SESSION, "\"not a code!\"").unwrap();

        let store = SnapshotStore::new(backend);
        assert_eq!(store.language(), Language::De);
        assert_eq!(store.session_code(), None);
    }

    #[test]
    fn test_remove() {
        let store = SnapshotStore::new(MemoryStore::new());
        store.set_author("Hans");
        store.remove(keys::AUTHOR);
        assert_eq!(store.author(), None);
    }
}
