//! Failure and fallback bookkeeping.
//!
//! Every failed provider attempt becomes an immutable, sanitized
//! [`FailureRecord`]; every completed acquisition becomes a
//! [`FallbackRecord`]. Retention is bounded per provider by count and, on
//! [`prune`](FailureRegistry::prune), by age. Lifetime fallback counters are
//! kept separately so pruning never changes the reported health ratios.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::error::Error as StdError;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Duration as ChronoDuration;
use log::warn;
use serde::Serialize;

use crate::clock::Clock;
use crate::errors::AcquisitionError;
use crate::models::{ChosenSource, FailureRecord, FallbackRecord, ProviderId};
use crate::redact::{find_url, redact_params, redact_text, redact_url};

/// Retention settings.
#[derive(Clone, Debug)]
pub struct FailureRegistryConfig {
    /// Most recent records kept per provider.
    pub max_records_per_provider: usize,
    /// Records older than this are dropped by `prune()`.
    pub max_age: ChronoDuration,
    /// Most recent fallback records kept overall.
    pub max_fallback_records: usize,
}

impl Default for FailureRegistryConfig {
    fn default() -> Self {
        Self {
            max_records_per_provider: 200,
            max_age: ChronoDuration::days(7),
            max_fallback_records: 1000,
        }
    }
}

/// Request details attached to a failure. Sanitized before storage.
#[derive(Clone, Debug, Default)]
pub struct FailureContext {
    pub url: Option<String>,
    pub params: BTreeMap<String, String>,
}

impl FailureContext {
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// Failure counts for one provider.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderFailureSummary {
    pub total: u64,
    pub by_operation: BTreeMap<String, u64>,
    /// Keyed by status code, or `"none"` when no status was received.
    pub by_http_status: BTreeMap<String, u64>,
    pub by_error_kind: BTreeMap<String, u64>,
}

/// Per-provider failure counts over the retained records.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureSummary {
    pub total_failures: u64,
    pub providers: BTreeMap<String, ProviderFailureSummary>,
}

/// Lifetime counters over completed acquisitions.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackStats {
    pub total_acquisitions: u64,
    /// Acquisitions not served by the first provider of their chain.
    pub fallback_invocations: u64,
    pub self_calculated: u64,
    pub defaults: u64,
    pub by_source: BTreeMap<String, u64>,
}

impl FallbackStats {
    /// Share of acquisitions served by the computation bridge, 0-100.
    pub fn self_calculated_percentage(&self) -> f64 {
        if self.total_acquisitions == 0 {
            0.0
        } else {
            self.self_calculated as f64 * 100.0 / self.total_acquisitions as f64
        }
    }
}

/// Shared registry of failures and fallback decisions.
pub struct FailureRegistry {
    config: FailureRegistryConfig,
    clock: Arc<dyn Clock>,
    failures: Mutex<HashMap<String, VecDeque<FailureRecord>>>,
    fallbacks: Mutex<VecDeque<FallbackRecord>>,
    stats: Mutex<FallbackStats>,
}

impl FailureRegistry {
    pub fn new(config: FailureRegistryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            failures: Mutex::new(HashMap::new()),
            fallbacks: Mutex::new(VecDeque::new()),
            stats: Mutex::new(FallbackStats::default()),
        }
    }

    fn lock_failures(&self) -> MutexGuard<'_, HashMap<String, VecDeque<FailureRecord>>> {
        self.failures.lock().unwrap_or_else(|poisoned| {
            warn!("Failure registry mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn lock_fallbacks(&self) -> MutexGuard<'_, VecDeque<FallbackRecord>> {
        self.fallbacks.lock().unwrap_or_else(|poisoned| {
            warn!("Fallback record mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn lock_stats(&self) -> MutexGuard<'_, FallbackStats> {
        self.stats.lock().unwrap_or_else(|poisoned| {
            warn!("Fallback stats mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Record one failed attempt. Returns the sanitized record as stored.
    pub fn record(
        &self,
        provider: &ProviderId,
        operation: &str,
        error: &AcquisitionError,
        context: &FailureContext,
    ) -> FailureRecord {
        let raw_message = error.to_string();
        let url = context
            .url
            .as_deref()
            .or_else(|| find_url(&raw_message))
            .map(redact_url);

        let record = FailureRecord {
            timestamp: self.clock.now(),
            provider_id: provider.to_string(),
            operation: operation.to_string(),
            sanitized_url: url,
            sanitized_params: redact_params(&context.params),
            http_status: error.http_status(),
            error_kind: error.error_kind(),
            stack_summary: redact_text(&error_chain(error)),
        };

        let mut failures = self.lock_failures();
        let queue = failures.entry(provider.to_string()).or_default();
        queue.push_back(record.clone());
        while queue.len() > self.config.max_records_per_provider {
            queue.pop_front();
        }

        record
    }

    /// Record which source served an acquisition.
    ///
    /// `fallback_used` is true when the value did not come from the first
    /// provider of the chain.
    pub fn record_fallback(&self, record: FallbackRecord, fallback_used: bool) {
        {
            let mut stats = self.lock_stats();
            stats.total_acquisitions += 1;
            if fallback_used {
                stats.fallback_invocations += 1;
            }
            match &record.chosen_source {
                ChosenSource::SelfCalculated => stats.self_calculated += 1,
                ChosenSource::Default => stats.defaults += 1,
                ChosenSource::Provider(_) => {}
            }
            *stats
                .by_source
                .entry(record.chosen_source.as_str().to_string())
                .or_insert(0) += 1;
        }

        let mut fallbacks = self.lock_fallbacks();
        fallbacks.push_back(record);
        while fallbacks.len() > self.config.max_fallback_records {
            fallbacks.pop_front();
        }
    }

    /// Per-provider counts by operation and by HTTP status.
    pub fn summarize(&self) -> FailureSummary {
        let failures = self.lock_failures();
        let mut summary = FailureSummary::default();

        for (provider, records) in failures.iter() {
            let entry = summary.providers.entry(provider.clone()).or_default();
            for record in records {
                entry.total += 1;
                *entry
                    .by_operation
                    .entry(record.operation.clone())
                    .or_insert(0) += 1;
                let status = record
                    .http_status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "none".to_string());
                *entry.by_http_status.entry(status).or_insert(0) += 1;
                *entry
                    .by_error_kind
                    .entry(record.error_kind.as_str().to_string())
                    .or_insert(0) += 1;
            }
            summary.total_failures += entry.total;
        }

        summary
    }

    /// Drop records older than the configured maximum age.
    ///
    /// Returns the number of failure and fallback records removed.
    pub fn prune(&self) -> usize {
        let cutoff = self.clock.now() - self.config.max_age;
        let mut removed = 0;

        {
            let mut failures = self.lock_failures();
            for queue in failures.values_mut() {
                let before = queue.len();
                queue.retain(|r| r.timestamp >= cutoff);
                removed += before - queue.len();
            }
            failures.retain(|_, queue| !queue.is_empty());
        }

        let mut fallbacks = self.lock_fallbacks();
        let before = fallbacks.len();
        fallbacks.retain(|r| r.timestamp >= cutoff);
        removed += before - fallbacks.len();

        removed
    }

    /// Most recent records for a provider, newest last.
    pub fn recent(&self, provider: &str, limit: usize) -> Vec<FailureRecord> {
        self.lock_failures()
            .get(provider)
            .map(|queue| {
                let skip = queue.len().saturating_sub(limit);
                queue.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn fallback_records(&self) -> Vec<FallbackRecord> {
        self.lock_fallbacks().iter().cloned().collect()
    }

    pub fn fallback_stats(&self) -> FallbackStats {
        self.lock_stats().clone()
    }
}

/// Error message followed by each source, outermost first.
fn error_chain(error: &AcquisitionError) -> String {
    let mut parts = vec![error.to_string()];
    let mut source = error.source();
    while let Some(inner) = source {
        parts.push(inner.to_string());
        source = inner.source();
    }
    parts.join(" <- ")
}
