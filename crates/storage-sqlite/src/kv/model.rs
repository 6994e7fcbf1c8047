//! Database model for key-value entries.

use diesel::prelude::*;

#[derive(Queryable, Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::kv_entries)]
pub struct KvEntryDB {
    pub entry_key: String,
    pub entry_value: String,
    pub updated_at: String,
}

impl KvEntryDB {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            entry_key: key.to_string(),
            entry_value: value.to_string(),
            updated_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}
