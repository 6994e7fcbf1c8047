//! TTL cache for acquired payloads.
//!
//! Entries are keyed by [`DataRequest::cache_key`] and expire after a TTL
//! chosen per [`DataRequestKind`]:
//!
//! | Kind | Default TTL |
//! |------|-------------|
//! | Quote, OptionGreeks | 60s |
//! | OptionChain, ImpliedVolatility | 5m |
//! | RiskFreeRate, EarningsCalendar, DividendCalendar | 12h |
//! | Historical, HistoricalVolatility | 24h |
//!
//! Expired entries are never returned and are evicted on the lookup that
//! finds them. With a [`KeyValueStore`] attached, entries are also written
//! under `cache:<key>` so they survive a restart.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::models::{ChosenSource, DataPayload, DataRequest, DataRequestKind};
use crate::storage::KeyValueStore;

const KEY_PREFIX: &str = "cache:";

/// Built-in TTL for a request kind.
pub fn default_ttl(kind: DataRequestKind) -> Duration {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    let secs = match kind {
        DataRequestKind::Quote | DataRequestKind::OptionGreeks => MINUTE,
        DataRequestKind::OptionChain | DataRequestKind::ImpliedVolatility => 5 * MINUTE,
        DataRequestKind::RiskFreeRate
        | DataRequestKind::EarningsCalendar
        | DataRequestKind::DividendCalendar => 12 * HOUR,
        DataRequestKind::Historical | DataRequestKind::HistoricalVolatility => 24 * HOUR,
    };
    Duration::from_secs(secs)
}

/// A cached payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub payload: DataPayload,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
    /// Source that produced the payload, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ChosenSource>,
}

impl CacheEntry {
    pub fn expires_at(&self) -> DateTime<Utc> {
        i64::try_from(self.ttl_secs)
            .ok()
            .and_then(ChronoDuration::try_seconds)
            .and_then(|ttl| self.created_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }
}

/// Payload cache with per-kind expiry.
pub struct DataCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttls: HashMap<DataRequestKind, Duration>,
    store: Option<Arc<dyn KeyValueStore>>,
    clock: Arc<dyn Clock>,
}

impl DataCache {
    /// In-memory cache. `ttls` overrides the built-in TTL for the kinds it names.
    pub fn new(ttls: HashMap<DataRequestKind, Duration>, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttls,
            store: None,
            clock,
        }
    }

    /// Also persist entries to `store`.
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            warn!("Cache mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn ttl_for(&self, kind: DataRequestKind) -> Duration {
        self.ttls
            .get(&kind)
            .copied()
            .unwrap_or_else(|| default_ttl(kind))
    }

    /// Live payload for `request`, if any.
    pub fn get(&self, request: &DataRequest) -> Option<DataPayload> {
        self.get_entry(&request.cache_key()).map(|e| e.payload)
    }

    /// Live entry for a raw cache key, if any.
    pub fn get_entry(&self, key: &str) -> Option<CacheEntry> {
        let now = self.clock.now();

        let cached = self.lock_entries().get(key).cloned();
        let entry = match cached {
            Some(entry) => Some(entry),
            None => self.load_persisted(key),
        }?;

        if entry.is_expired(now) {
            debug!("Cache entry '{}' expired at {}", key, entry.expires_at());
            self.evict(key);
            return None;
        }

        self.lock_entries()
            .entry(key.to_string())
            .or_insert_with(|| entry.clone());
        Some(entry)
    }

    /// Store `payload` for `request` with the TTL of its kind.
    pub fn put(&self, request: &DataRequest, payload: DataPayload) {
        let ttl = self.ttl_for(request.kind);
        self.put_with_ttl(request.cache_key(), payload, ttl);
    }

    /// Like [`put`](Self::put), remembering which source produced the payload.
    pub fn put_from(&self, request: &DataRequest, payload: DataPayload, source: ChosenSource) {
        let ttl = self.ttl_for(request.kind);
        self.insert(request.cache_key(), payload, Some(source), ttl);
    }

    /// Store under an explicit key and TTL. Last writer wins.
    pub fn put_with_ttl(&self, key: String, payload: DataPayload, ttl: Duration) {
        self.insert(key, payload, None, ttl);
    }

    fn insert(&self, key: String, payload: DataPayload, source: Option<ChosenSource>, ttl: Duration) {
        let entry = CacheEntry {
            key: key.clone(),
            payload,
            created_at: self.clock.now(),
            ttl_secs: ttl.as_secs(),
            source,
        };

        if let Some(store) = &self.store {
            match serde_json::to_string(&entry) {
                Ok(json) => {
                    if let Err(e) = store.put(&Self::storage_key(&key), &json) {
                        warn!("Failed to persist cache entry '{}': {}", key, e);
                    }
                }
                Err(e) => warn!("Failed to serialize cache entry '{}': {}", key, e),
            }
        }

        self.lock_entries().insert(key, entry);
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<String> = {
            let mut entries = self.lock_entries();
            let expired: Vec<String> = entries
                .values()
                .filter(|e| e.is_expired(now))
                .map(|e| e.key.clone())
                .collect();
            for key in &expired {
                entries.remove(key);
            }
            expired
        };

        let mut removed = expired.len();
        if let Some(store) = &self.store {
            for key in &expired {
                self.delete_persisted(key);
            }
            // Entries persisted by an earlier process that were never loaded
            if let Ok(keys) = store.keys_with_prefix(KEY_PREFIX) {
                for storage_key in keys {
                    let key = &storage_key[KEY_PREFIX.len()..];
                    if expired.iter().any(|k| k == key) {
                        continue;
                    }
                    if let Some(entry) = self.load_persisted(key) {
                        if entry.is_expired(now) {
                            self.delete_persisted(key);
                            removed += 1;
                        }
                    }
                }
            }
        }
        removed
    }

    /// Remove every entry, persisted ones included.
    pub fn clear(&self) {
        self.lock_entries().clear();
        if let Some(store) = &self.store {
            match store.keys_with_prefix(KEY_PREFIX) {
                Ok(keys) => {
                    for key in keys {
                        if let Err(e) = store.delete(&key) {
                            warn!("Failed to delete cache entry '{}': {}", key, e);
                        }
                    }
                }
                Err(e) => warn!("Failed to list persisted cache entries: {}", e),
            }
        }
    }

    /// Number of entries held in memory, expired ones included until evicted.
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn storage_key(key: &str) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }

    fn load_persisted(&self, key: &str) -> Option<CacheEntry> {
        let store = self.store.as_ref()?;
        match store.get(&Self::storage_key(key)) {
            Ok(Some(json)) => match serde_json::from_str::<CacheEntry>(&json) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Discarding unreadable cache entry '{}': {}", key, e);
                    self.delete_persisted(key);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to read cache entry '{}': {}", key, e);
                None
            }
        }
    }

    fn evict(&self, key: &str) {
        self.lock_entries().remove(key);
        self.delete_persisted(key);
    }

    fn delete_persisted(&self, key: &str) {
        if let Some(store) = &self.store {
            if let Err(e) = store.delete(&Self::storage_key(key)) {
                warn!("Failed to delete cache entry '{}': {}", key, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{Quote, RiskFreeRate};
    use crate::storage::MemoryKeyValueStore;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 6, 14, 30, 0).unwrap(),
        ))
    }

    fn quote_payload(clock: &ManualClock) -> DataPayload {
        DataPayload::Quote(Quote::new("SPY", clock.now(), dec!(512.34), "USD", "TRADIER"))
    }

    #[test]
    fn test_hit_before_ttl_miss_after() {
        let clock = clock();
        let cache = DataCache::new(HashMap::new(), clock.clone());
        let request = DataRequest::quote("SPY");
        let payload = quote_payload(&clock);

        cache.put(&request, payload.clone());
        clock.advance(ChronoDuration::seconds(59));
        assert_eq!(cache.get(&request), Some(payload));

        clock.advance(ChronoDuration::seconds(2));
        assert_eq!(cache.get(&request), None);
        // Evicted lazily by the miss
        assert!(cache.is_empty());
    }

    #[test]
    fn test_ttl_per_kind_and_override() {
        let clock = clock();
        let mut ttls = HashMap::new();
        ttls.insert(DataRequestKind::Quote, Duration::from_secs(5));
        let cache = DataCache::new(ttls, clock);

        assert_eq!(cache.ttl_for(DataRequestKind::Quote), Duration::from_secs(5));
        assert_eq!(
            cache.ttl_for(DataRequestKind::Historical),
            Duration::from_secs(24 * 3600)
        );
        assert!(
            cache.ttl_for(DataRequestKind::Quote) < cache.ttl_for(DataRequestKind::OptionChain)
        );
    }

    #[test]
    fn test_last_writer_wins() {
        let clock = clock();
        let cache = DataCache::new(HashMap::new(), clock.clone());
        let request = DataRequest::risk_free_rate();
        let first = DataPayload::RiskFreeRate(RiskFreeRate {
            rate: 0.05,
            series: "DGS3MO".to_string(),
            as_of: None,
        });
        let second = DataPayload::RiskFreeRate(RiskFreeRate {
            rate: 0.051,
            series: "DGS3MO".to_string(),
            as_of: None,
        });

        cache.put(&request, first);
        cache.put(&request, second.clone());
        assert_eq!(cache.get(&request), Some(second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_persisted_entries_survive_restart() {
        let clock = clock();
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
        let request = DataRequest::quote("SPY");
        let payload = quote_payload(&clock);

        let first = DataCache::new(HashMap::new(), clock.clone()).with_store(store.clone());
        first.put(&request, payload.clone());
        assert!(store.get("cache:quote|SPY").unwrap().is_some());

        let second = DataCache::new(HashMap::new(), clock.clone()).with_store(store.clone());
        assert_eq!(second.get(&request), Some(payload));

        clock.advance(ChronoDuration::minutes(2));
        let third = DataCache::new(HashMap::new(), clock).with_store(store.clone());
        assert_eq!(third.get(&request), None);
        assert!(store.get("cache:quote|SPY").unwrap().is_none());
    }

    #[test]
    fn test_purge_and_clear() {
        let clock = clock();
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
        let cache = DataCache::new(HashMap::new(), clock.clone()).with_store(store.clone());

        cache.put(&DataRequest::quote("SPY"), quote_payload(&clock));
        cache.put(
            &DataRequest::risk_free_rate(),
            DataPayload::RiskFreeRate(RiskFreeRate {
                rate: 0.05,
                series: "DGS3MO".to_string(),
                as_of: None,
            }),
        );

        clock.advance(ChronoDuration::minutes(10));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
        assert!(store.keys_with_prefix("cache:").unwrap().is_empty());
    }
}
