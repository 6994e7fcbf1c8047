use std::path::Path;
use std::sync::Arc;

use diesel::prelude::*;
use log::debug;
use optionsdesk_acquisition::storage::{KeyValueStore, StoreError};

use super::model::KvEntryDB;
use crate::db::{self, get_connection, DbPool};
use crate::errors::StorageError;
use crate::schema::kv_entries::dsl::*;

/// [`KeyValueStore`] over a SQLite table.
///
/// Several processes may open the same database file. `update` runs inside a
/// `BEGIN IMMEDIATE` transaction, so concurrent read-modify-write cycles on a
/// counter serialize on the database write lock instead of losing updates.
#[derive(Clone)]
pub struct SqliteKeyValueStore {
    pool: Arc<DbPool>,
}

impl SqliteKeyValueStore {
    /// Open (or create) the database at `db_path` and apply pending migrations.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = db_path.as_ref().to_string_lossy().to_string();
        db::init(&path)?;
        let pool = db::create_pool(&path)?;
        db::run_migrations(&pool)?;
        debug!("Opened SQLite key-value store at {}", path);
        Ok(Self { pool })
    }

    /// Wrap an existing pool. Migrations must already be applied.
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut conn = get_connection(&self.pool)?;
        let value = kv_entries
            .filter(entry_key.eq(key))
            .select(entry_value)
            .first::<String>(&mut conn)
            .optional()?;
        Ok(value)
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut conn = get_connection(&self.pool)?;
        diesel::replace_into(kv_entries)
            .values(&KvEntryDB::new(key, value))
            .execute(&mut conn)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut conn = get_connection(&self.pool)?;
        diesel::delete(kv_entries.filter(entry_key.eq(key))).execute(&mut conn)?;
        Ok(())
    }

    fn read_modify_write(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<String>) -> String,
    ) -> Result<String, StorageError> {
        let mut conn = get_connection(&self.pool)?;
        conn.immediate_transaction::<_, StorageError, _>(|c| {
            let current = kv_entries
                .filter(entry_key.eq(key))
                .select(entry_value)
                .first::<String>(c)
                .optional()?;
            let next = apply(current);
            diesel::replace_into(kv_entries)
                .values(&KvEntryDB::new(key, &next))
                .execute(c)?;
            Ok(next)
        })
    }

    fn prefixed_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut conn = get_connection(&self.pool)?;
        let keys = kv_entries
            .filter(entry_key.ge(prefix))
            .order(entry_key.asc())
            .select(entry_key)
            .load::<String>(&mut conn)?;
        Ok(keys
            .into_iter()
            .take_while(|k| k.starts_with(prefix))
            .collect())
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read(key)?)
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        Ok(self.write(key, value)?)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        Ok(self.remove(key)?)
    }

    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<String>) -> String,
    ) -> Result<String, StoreError> {
        Ok(self.read_modify_write(key, apply)?)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.prefixed_keys(prefix)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn open_store(dir: &tempfile::TempDir) -> SqliteKeyValueStore {
        SqliteKeyValueStore::open(dir.path().join("acquisition.db")).unwrap()
    }

    #[test]
    fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        assert_eq!(store.get("ratelimit:TRADIER").unwrap(), None);
        store.put("ratelimit:TRADIER", "{\"day\":\"2024-05-06\"}").unwrap();
        store.put("ratelimit:TRADIER", "{\"day\":\"2024-05-07\"}").unwrap();
        assert_eq!(
            store.get("ratelimit:TRADIER").unwrap().as_deref(),
            Some("{\"day\":\"2024-05-07\"}")
        );

        store.delete("ratelimit:TRADIER").unwrap();
        assert_eq!(store.get("ratelimit:TRADIER").unwrap(), None);
        store.delete("ratelimit:TRADIER").unwrap();
    }

    #[test]
    fn test_keys_with_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        for key in ["cache:quote:AAPL", "cache:quote:MSFT", "cache_meta", "failures:FMP"] {
            store.put(key, "1").unwrap();
        }

        assert_eq!(
            store.keys_with_prefix("cache:").unwrap(),
            vec!["cache:quote:AAPL", "cache:quote:MSFT"]
        );
        assert!(store.keys_with_prefix("missing:").unwrap().is_empty());
    }

    #[test]
    fn test_reopen_keeps_entries() {
        let dir = tempfile::tempdir().unwrap();
        open_store(&dir).put("failures:IBKR", "[]").unwrap();

        let reopened = open_store(&dir);
        assert_eq!(reopened.get("failures:IBKR").unwrap().as_deref(), Some("[]"));
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acquisition.db");
        SqliteKeyValueStore::open(&path).unwrap();

        // Separate stores emulate separate processes sharing the file.
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                thread::spawn(move || {
                    let store = SqliteKeyValueStore::open(&path).unwrap();
                    for _ in 0..25 {
                        store
                            .update("counter", &mut |current| {
                                let n: u32 = current.and_then(|v| v.parse().ok()).unwrap_or(0);
                                (n + 1).to_string()
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let store = SqliteKeyValueStore::open(&path).unwrap();
        assert_eq!(store.get("counter").unwrap().as_deref(), Some("100"));
    }

    #[test]
    fn test_store_as_trait_object() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn KeyValueStore> = Arc::new(open_store(&dir));
        let value = serde_json::json!({"calls": 3}).to_string();
        store.put("ratelimit:FMP", &value).unwrap();
        let next = store
            .update("ratelimit:FMP", &mut |current| {
                assert_eq!(current.as_deref(), Some(value.as_str()));
                serde_json::json!({"calls": 4}).to_string()
            })
            .unwrap();
        assert_eq!(next, "{\"calls\":4}");
    }
}
