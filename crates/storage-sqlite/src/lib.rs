//! SQLite storage for the Options Desk acquisition layer.
//!
//! Implements [`KeyValueStore`](optionsdesk_acquisition::KeyValueStore) with Diesel
//! over a single `kv_entries` table:
//! - Connection pooling and WAL setup
//! - Embedded Diesel migrations
//! - Atomic read-modify-write for counters shared between processes
//!
//! ```text
//! acquisition (ledger, failures, cache)
//!                  │
//!                  ▼
//!          storage-sqlite (this crate)
//!                  │
//!                  ▼
//!              SQLite DB
//! ```

pub mod db;
pub mod errors;
pub mod kv;
pub mod schema;

pub use db::{create_pool, get_connection, init, run_migrations, DbConnection, DbPool};
pub use errors::StorageError;
pub use kv::SqliteKeyValueStore;
