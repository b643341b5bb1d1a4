//! Key-value backends

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use retro_core::{RetroError, RetroResult};

/// String key-value storage
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> RetroResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> RetroResult<()>;

    fn remove(&self, key: &str) -> RetroResult<()>;
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for Arc<S> {
    fn get(&self, key: &str) -> RetroResult<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> RetroResult<()> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> RetroResult<()> {
        (**self).remove(key)
    }
}

/// In-memory store. Clones share the same map.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> RetroResult<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> RetroResult<()> {
        self.entries
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> RetroResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Directory-backed store, one `<key>.json` file per key.
///
/// Writes go to a temp file in the same directory and are renamed into
/// place, so readers never observe a partial value.
#[derive(Clone, Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open a store rooted at `dir`, creating the directory if needed
    pub fn open(dir: impl AsRef<Path>) -> RetroResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| {
            RetroError::Storage(format!(
                "Failed to create store directory '{}': {}",
                dir.display(),
                e
            ))
        })?;
        Ok(FileStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> RetroResult<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(RetroError::Storage(format!("Invalid store key {key:?}")));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> RetroResult<Option<String>> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RetroError::Storage(format!(
                "Failed to read '{}': {}",
                path.display(),
                e
            ))),
        }
    }

    fn set(&self, key: &str, value: &str) -> RetroResult<()> {
        let path = self.path_for(key)?;
        let tmp_path = self.dir.join(format!(".{key}.json.tmp"));

        let mut tmp_file = File::create(&tmp_path).map_err(|e| {
            RetroError::Storage(format!(
                "Failed to create temp file '{}': {}",
                tmp_path.display(),
                e
            ))
        })?;
        tmp_file.write_all(value.as_bytes()).map_err(|e| {
            RetroError::Storage(format!(
                "Failed to write temp file '{}': {}",
                tmp_path.display(),
                e
            ))
        })?;
        tmp_file.sync_all().map_err(|e| {
            RetroError::Storage(format!(
                "Failed to sync temp file '{}': {}",
                tmp_path.display(),
                e
            ))
        })?;
        drop(tmp_file);

        fs::rename(&tmp_path, &path).map_err(|e| {
            RetroError::Storage(format!(
                "Failed to rename '{}' to '{}': {}",
                tmp_path.display(),
                path.display(),
                e
            ))
        })
    }

    fn remove(&self, key: &str) -> RetroResult<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RetroError::Storage(format!(
                "Failed to remove '{}': {}",
                path.display(),
                e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_shared_between_clones() {
        let store = MemoryStore::new();
        let other = store.clone();
        store.set("author", "Hans").unwrap();
        assert_eq!(other.get("author").unwrap().as_deref(), Some("Hans"));
        other.remove("author").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_file_store_roundtrip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(temp_dir.path().join("retro")).unwrap();

        assert_eq!(store.get("board").unwrap(), None);
        store.set("board", r#"{"notes":[]}"#).unwrap();
        store.set("board", r#"{"notes":[1]}"#).unwrap();
        assert_eq!(store.get("board").unwrap().as_deref(), Some(r#"{"notes":[1]}"#));
        assert!(!temp_dir.path().join("retro").join(".board.json.tmp").exists());

        store.remove("board").unwrap();
        store.remove("board").unwrap();
        assert_eq!(store.get("board").unwrap(), None);
    }

    #[test]
    fn test_file_store_rejects_path_keys() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(temp_dir.path()).unwrap();
        assert!(store.set("../escape", "x").is_err());
        assert!(store.get("").is_err());
    }
}
