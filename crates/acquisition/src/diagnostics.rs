//! Queryable health report for the acquisition layer.
//!
//! Built by [`DataSourceOrchestrator::diagnostics`](crate::registry::DataSourceOrchestrator::diagnostics)
//! from the failure registry's fallback counters and the rate-limit ledger.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::registry::{FallbackStats, ProviderFailureSummary};

/// State of one registered provider.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealth {
    pub id: String,
    /// Credentials present and not turned off in configuration.
    pub enabled: bool,
    /// Backend reachable; probed for session-based adapters.
    pub connected: bool,
    pub calls_today: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_cap: Option<u32>,
    pub failures: ProviderFailureSummary,
}

impl ProviderHealth {
    /// Daily quota left, if the provider has a cap.
    pub fn remaining_today(&self) -> Option<u32> {
        self.daily_cap.map(|cap| cap.saturating_sub(self.calls_today))
    }
}

/// Fallback and provider health summary.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsReport {
    pub generated_at: DateTime<Utc>,
    /// Acquisitions that reached the provider walk; cache hits are excluded.
    pub total_acquisitions: u64,
    pub cache_hits: u64,
    /// Acquisitions not served by the first provider of their chain.
    pub fallback_invocations: u64,
    pub self_calculated_count: u64,
    /// 0-100
    pub self_calculated_percentage: f64,
    pub default_count: u64,
    pub by_source: BTreeMap<String, u64>,
    pub providers: Vec<ProviderHealth>,
}

impl DiagnosticsReport {
    pub fn new(
        generated_at: DateTime<Utc>,
        stats: &FallbackStats,
        cache_hits: u64,
        providers: Vec<ProviderHealth>,
    ) -> Self {
        Self {
            generated_at,
            total_acquisitions: stats.total_acquisitions,
            cache_hits,
            fallback_invocations: stats.fallback_invocations,
            self_calculated_count: stats.self_calculated,
            self_calculated_percentage: stats.self_calculated_percentage(),
            default_count: stats.defaults,
            by_source: stats.by_source.clone(),
            providers,
        }
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderHealth> {
        self.providers.iter().find(|p| p.id == id)
    }

    /// Providers that are enabled but not reachable.
    pub fn disconnected(&self) -> Vec<&str> {
        self.providers
            .iter()
            .filter(|p| p.enabled && !p.connected)
            .map(|p| p.id.as_str())
            .collect()
    }
}
