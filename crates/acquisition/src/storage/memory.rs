use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use log::warn;

use super::{KeyValueStore, StoreError};

/// In-process store. State is lost when the value is dropped; share it via
/// `Arc` to simulate a restart against the same backing data.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            warn!("Memory store mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock_entries().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock_entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.lock_entries().remove(key);
        Ok(())
    }

    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<String>) -> String,
    ) -> Result<String, StoreError> {
        let mut entries = self.lock_entries();
        let next = apply(entries.get(key).cloned());
        entries.insert(key.to_string(), next.clone());
        Ok(next)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self
            .lock_entries()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let store = MemoryKeyValueStore::new();
        assert_eq!(store.get("a").unwrap(), None);

        store.put("a", "1").unwrap();
        assert_eq!(store.get("a").unwrap(), Some("1".to_string()));

        store.delete("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
    }

    #[test]
    fn test_update_sees_previous_value() {
        let store = MemoryKeyValueStore::new();
        let bump = |prev: Option<String>| {
            let n: u32 = prev.and_then(|v| v.parse().ok()).unwrap_or(0);
            (n + 1).to_string()
        };
        assert_eq!(store.update("n", &mut { bump }).unwrap(), "1");
        assert_eq!(store.update("n", &mut { bump }).unwrap(), "2");
    }

    #[test]
    fn test_keys_with_prefix() {
        let store = MemoryKeyValueStore::new();
        store.put("ratelimit:B", "{}").unwrap();
        store.put("ratelimit:A", "{}").unwrap();
        store.put("cache:x", "{}").unwrap();

        assert_eq!(
            store.keys_with_prefix("ratelimit:").unwrap(),
            vec!["ratelimit:A".to_string(), "ratelimit:B".to_string()]
        );
    }
}
