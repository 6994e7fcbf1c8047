//! Key-value persistence for long-lived acquisition state.
//!
//! The rate-limit ledger and the cache persist through the [`KeyValueStore`]
//! trait so the backing store can be swapped (memory for tests, a JSON file
//! for single-process use, SQLite for multi-process use) without touching
//! either component.

mod file;
mod memory;

pub use file::FileKeyValueStore;
pub use memory::MemoryKeyValueStore;

use thiserror::Error;

/// Errors raised by a key-value store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Minimal string key-value store.
///
/// Values are opaque strings (callers store JSON). Implementations must be
/// safe to share across threads.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Read-modify-write a single key and return the stored value.
    ///
    /// The default implementation is a plain get followed by a put. Backends
    /// shared between processes override it so the two steps are atomic.
    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<String>) -> String,
    ) -> Result<String, StoreError> {
        let next = apply(self.get(key)?);
        self.put(key, &next)?;
        Ok(next)
    }

    /// All keys starting with `prefix`.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}
