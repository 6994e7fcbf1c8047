//! Persisted per-provider rate-limit ledger.
//!
//! Each provider has three independent limits (see [`RateLimit`]):
//! - a minimum spacing between calls, waited out before the next call
//! - an optional per-minute cap over a fixed window, also waited out
//! - an optional daily cap, which is hard: once reached the provider is
//!   skipped until the UTC date rolls over
//!
//! Counters are stored through a [`KeyValueStore`] under `ratelimit:<provider>`
//! so they survive restarts. Every read rolls a stale counter forward first,
//! so the first call of a new day is counted as 1 rather than added to the
//! previous day's total.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::options::{interruptible_sleep, AcquireOptions, WaitInterrupted};
use crate::clock::Clock;
use crate::models::ProviderId;
use crate::provider::RateLimit;
use crate::storage::KeyValueStore;

const KEY_PREFIX: &str = "ratelimit:";

/// Persisted counter for one provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitCounter {
    pub provider_id: String,
    /// UTC date the daily count belongs to.
    pub window_start: NaiveDate,
    pub call_count: u32,
    #[serde(default)]
    pub minute_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub minute_count: u32,
    #[serde(default)]
    pub last_call_at: Option<DateTime<Utc>>,
}

impl RateLimitCounter {
    fn fresh(provider_id: &str, today: NaiveDate) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            window_start: today,
            call_count: 0,
            minute_start: None,
            minute_count: 0,
            last_call_at: None,
        }
    }

    /// Bring the counter up to `now`: reset the daily count when the stored
    /// date differs from today, and the minute count when its window passed.
    fn rolled(mut self, now: DateTime<Utc>) -> Self {
        let today = now.date_naive();
        if self.window_start != today {
            self.window_start = today;
            self.call_count = 0;
        }
        if let Some(start) = self.minute_start {
            if now - start >= ChronoDuration::minutes(1) {
                self.minute_start = None;
                self.minute_count = 0;
            }
        }
        self
    }

    fn record(&mut self, now: DateTime<Utc>) {
        self.call_count = self.call_count.saturating_add(1);
        if self.minute_start.is_none() {
            self.minute_start = Some(now);
        }
        self.minute_count = self.minute_count.saturating_add(1);
        self.last_call_at = Some(now);
    }
}

/// Per-provider call ledger shared by all acquisitions.
pub struct RateLimitLedger {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    limits: Mutex<HashMap<String, RateLimit>>,
    /// Last counter seen per provider; used when the store is unreachable.
    mirror: Mutex<HashMap<String, RateLimitCounter>>,
}

impl RateLimitLedger {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            limits: Mutex::new(HashMap::new()),
            mirror: Mutex::new(HashMap::new()),
        }
    }

    /// Lock the limits mutex, recovering from poison if necessary.
    ///
    /// Worst case after recovery is a slightly stale limit, which is
    /// better than panicking inside the fallback chain.
    fn lock_limits(&self) -> MutexGuard<'_, HashMap<String, RateLimit>> {
        self.limits.lock().unwrap_or_else(|poisoned| {
            warn!("Rate limit ledger limits mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn lock_mirror(&self) -> MutexGuard<'_, HashMap<String, RateLimitCounter>> {
        self.mirror.lock().unwrap_or_else(|poisoned| {
            warn!("Rate limit ledger mirror mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn storage_key(provider: &str) -> String {
        format!("{KEY_PREFIX}{provider}")
    }

    /// Configure limits for a specific provider.
    pub fn configure(&self, provider: &ProviderId, limit: RateLimit) {
        self.lock_limits().insert(provider.to_string(), limit);
    }

    /// Limits in force for a provider; unconfigured providers are unlimited.
    pub fn limit_for(&self, provider: &ProviderId) -> RateLimit {
        self.lock_limits()
            .get(provider.as_ref())
            .cloned()
            .unwrap_or_else(RateLimit::unlimited)
    }

    /// Current counter for a provider, rolled forward to now.
    pub fn counter(&self, provider: &ProviderId) -> RateLimitCounter {
        let now = self.clock.now();
        let key = Self::storage_key(provider);

        let stored = match self.store.get(&key) {
            Ok(Some(raw)) => self.parse_or_mirror(provider, &raw),
            Ok(None) => None,
            Err(e) => {
                warn!(
                    "Rate-limit store read failed for '{}', using in-memory counter: {}",
                    provider, e
                );
                self.lock_mirror().get(provider.as_ref()).cloned()
            }
        };

        stored
            .unwrap_or_else(|| RateLimitCounter::fresh(provider, now.date_naive()))
            .rolled(now)
    }

    /// Decode a stored counter. An unreadable value keeps the in-memory count
    /// instead of resetting the quota.
    fn parse_or_mirror(&self, provider: &ProviderId, raw: &str) -> Option<RateLimitCounter> {
        match serde_json::from_str::<RateLimitCounter>(raw) {
            Ok(counter) => Some(counter),
            Err(e) => {
                warn!(
                    "Unreadable rate-limit counter for '{}', using in-memory counter: {}",
                    provider, e
                );
                self.lock_mirror().get(provider.as_ref()).cloned()
            }
        }
    }

    /// Calls counted against today's quota.
    pub fn calls_today(&self, provider: &ProviderId) -> u32 {
        self.counter(provider).call_count
    }

    /// Whether the provider's daily cap leaves room for another call.
    pub fn can_call(&self, provider: &ProviderId) -> bool {
        match self.limit_for(provider).daily_cap {
            Some(cap) => self.counter(provider).call_count < cap,
            None => true,
        }
    }

    /// Count one call against the provider. Every attempt counts, whatever
    /// its outcome.
    pub fn record_call(&self, provider: &ProviderId) -> RateLimitCounter {
        let now = self.clock.now();
        let key = Self::storage_key(provider);
        let mut recorded: Option<RateLimitCounter> = None;

        let result = self.store.update(&key, &mut |previous| {
            let mut counter = previous
                .as_deref()
                .and_then(|raw| self.parse_or_mirror(provider, raw))
                .unwrap_or_else(|| RateLimitCounter::fresh(provider, now.date_naive()))
                .rolled(now);
            counter.record(now);
            let serialized = serde_json::to_string(&counter).unwrap_or_else(|_| {
                previous.clone().unwrap_or_default()
            });
            recorded = Some(counter);
            serialized
        });

        let counter = match (result, recorded) {
            (Ok(_), Some(counter)) => counter,
            (Err(e), _) => {
                warn!(
                    "Rate-limit store write failed for '{}', counting in memory only: {}",
                    provider, e
                );
                let mut counter = self
                    .lock_mirror()
                    .get(provider.as_ref())
                    .cloned()
                    .unwrap_or_else(|| RateLimitCounter::fresh(provider, now.date_naive()))
                    .rolled(now);
                counter.record(now);
                counter
            }
            (Ok(_), None) => {
                let mut counter = RateLimitCounter::fresh(provider, now.date_naive());
                counter.record(now);
                counter
            }
        };

        debug!(
            "Rate-limit ledger: '{}' call {} today",
            provider, counter.call_count
        );
        self.lock_mirror()
            .insert(provider.to_string(), counter.clone());
        counter
    }

    /// Time until the next call is allowed by the interval and minute limits.
    ///
    /// When the daily cap is exhausted this is the time until the next UTC
    /// midnight.
    pub fn time_until_next_slot(&self, provider: &ProviderId) -> Duration {
        let limit = self.limit_for(provider);
        let counter = self.counter(provider);
        let now = self.clock.now();

        if let Some(cap) = limit.daily_cap {
            if counter.call_count >= cap {
                let midnight = (now.date_naive() + ChronoDuration::days(1))
                    .and_hms_opt(0, 0, 0)
                    .map(|dt| dt.and_utc())
                    .unwrap_or(now);
                return to_std(midnight - now);
            }
        }

        let mut wait = Duration::ZERO;

        if let Some(last) = counter.last_call_at {
            let interval = ChronoDuration::from_std(limit.min_interval)
                .unwrap_or_else(|_| ChronoDuration::zero());
            wait = wait.max(to_std(last + interval - now));
        }

        if let (Some(rpm), Some(start)) = (limit.requests_per_minute, counter.minute_start) {
            if counter.minute_count >= rpm {
                wait = wait.max(to_std(start + ChronoDuration::minutes(1) - now));
            }
        }

        wait
    }

    pub fn seconds_until_next_slot(&self, provider: &ProviderId) -> f64 {
        self.time_until_next_slot(provider).as_secs_f64()
    }

    /// Wait out the interval and minute limits for a provider.
    ///
    /// Does not wait for a daily cap; callers check [`can_call`](Self::can_call)
    /// first and move to the next provider instead.
    pub async fn wait_for_slot(
        &self,
        provider: &ProviderId,
        options: &AcquireOptions,
    ) -> Result<(), WaitInterrupted> {
        if !self.can_call(provider) {
            return Ok(());
        }

        let wait = self.time_until_next_slot(provider);
        if !wait.is_zero() {
            debug!(
                "Rate-limit ledger: waiting {:?} for provider '{}'",
                wait, provider
            );
        }
        interruptible_sleep(wait, options).await
    }

    /// Counters for every provider that has a persisted record.
    pub fn snapshot(&self) -> Vec<RateLimitCounter> {
        let keys = match self.store.keys_with_prefix(KEY_PREFIX) {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Rate-limit store listing failed: {}", e);
                return self.lock_mirror().values().cloned().collect();
            }
        };

        keys.iter()
            .filter_map(|key| key.strip_prefix(KEY_PREFIX))
            .map(|provider| self.counter(&ProviderId::Owned(provider.to_string())))
            .collect()
    }
}

fn to_std(delta: ChronoDuration) -> Duration {
    delta.to_std().unwrap_or(Duration::ZERO)
}
