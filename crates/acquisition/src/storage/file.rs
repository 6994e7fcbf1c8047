use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::{KeyValueStore, StoreError};

const CURRENT_VERSION: u32 = 1;

/// JSON-file-backed store.
///
/// The whole document is read and rewritten under an in-process lock on every
/// mutation. Writes from separate processes are not coordinated; use the
/// SQLite store when several processes share the same state.
#[derive(Debug)]
pub struct FileKeyValueStore {
    path: PathBuf,
    lock: Mutex<()>,
}

#[derive(Serialize, Deserialize, Default)]
struct StoreDocument {
    version: u32,
    entries: BTreeMap<String, String>,
}

impl FileKeyValueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn with_entries<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut BTreeMap<String, String>) -> T,
    {
        let _guard = self.lock.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut entries = self.load_locked()?;
        let out = op(&mut entries);
        self.persist_locked(entries)?;
        Ok(out)
    }

    fn read_entries(&self) -> Result<BTreeMap<String, String>, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::LockPoisoned)?;
        self.load_locked()
    }

    fn load_locked(&self) -> Result<BTreeMap<String, String>, StoreError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }

        let raw = fs::read(&self.path)?;
        if raw.is_empty() {
            return Ok(BTreeMap::new());
        }

        let doc: StoreDocument = serde_json::from_slice(&raw)?;
        Ok(doc.entries)
    }

    fn persist_locked(&self, entries: BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let doc = StoreDocument {
            version: CURRENT_VERSION,
            entries,
        };
        let json = serde_json::to_string_pretty(&doc)?;

        // Write-then-rename so a crash never leaves a truncated document
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read_entries()?.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.with_entries(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.with_entries(|entries| {
            entries.remove(key);
        })
    }

    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<String>) -> String,
    ) -> Result<String, StoreError> {
        self.with_entries(|entries| {
            let next = apply(entries.get(key).cloned());
            entries.insert(key.to_string(), next.clone());
            next
        })
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .read_entries()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
