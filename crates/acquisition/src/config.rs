//! Acquisition configuration.
//!
//! One explicit struct, built once and injected into the orchestrator.
//! Everything is defaulted so an empty `{}` file is a valid configuration.
//! Provider credentials never appear here; they come from the environment
//! through [`ProviderCredentials`].
//!
//! ```json
//! {
//!   "priorities": { "quote": ["TRADIER", "YAHOO_SCRAPE"] },
//!   "cacheTtlSecs": { "quote": 30 },
//!   "providers": {
//!     "FMP": { "dailyCap": 200 },
//!     "IBKR": { "enabled": false }
//!   },
//!   "retry": { "rateLimitBaseSecs": 15 },
//!   "defaults": { "riskFreeRate": 0.045 },
//!   "chainDeadlineSecs": 120
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::errors::AcquisitionError;
use crate::models::DataRequestKind;
use crate::provider::finnhub::FinnhubProvider;
use crate::provider::fmp::FmpProvider;
use crate::provider::fred::FredProvider;
use crate::provider::ibkr::IbkrProvider;
use crate::provider::tradier::TradierProvider;
use crate::provider::yahoo_scrape::YahooScrapeProvider;
use crate::provider::{ProviderAdapter, RateLimit};
use crate::registry::{
    DataSourceOrchestrator, FailureRegistryConfig, OrchestratorBuilder, RetryPolicy, RetrySettings,
};
use crate::storage::KeyValueStore;

/// Values returned when every source for a kind is exhausted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DefaultValues {
    /// Annualized, decimal
    pub risk_free_rate: f64,
    /// Annualized, decimal; used for implied and historical volatility
    pub volatility: f64,
}

impl Default for DefaultValues {
    fn default() -> Self {
        Self {
            risk_free_rate: 0.05,
            volatility: 0.30,
        }
    }
}

/// Per-provider overrides. Unset fields keep the adapter's own values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderSettings {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_cap: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySettings>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            min_interval_ms: None,
            requests_per_minute: None,
            daily_cap: None,
            timeout_ms: None,
            retry: None,
        }
    }
}

impl ProviderSettings {
    /// The adapter's declared limit with configured fields applied on top.
    pub fn apply_to(&self, mut limit: RateLimit) -> RateLimit {
        if let Some(ms) = self.min_interval_ms {
            limit.min_interval = Duration::from_millis(ms);
        }
        if self.requests_per_minute.is_some() {
            limit.requests_per_minute = self.requests_per_minute;
        }
        if self.daily_cap.is_some() {
            limit.daily_cap = self.daily_cap;
        }
        limit
    }
}

/// Failure registry retention.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FailureSettings {
    pub max_records_per_provider: usize,
    pub max_age_hours: i64,
    pub max_fallback_records: usize,
}

impl Default for FailureSettings {
    fn default() -> Self {
        let registry = FailureRegistryConfig::default();
        Self {
            max_records_per_provider: registry.max_records_per_provider,
            max_age_hours: registry.max_age.num_hours(),
            max_fallback_records: registry.max_fallback_records,
        }
    }
}

impl From<&FailureSettings> for FailureRegistryConfig {
    fn from(settings: &FailureSettings) -> Self {
        Self {
            max_records_per_provider: settings.max_records_per_provider.max(1),
            max_age: ChronoDuration::hours(settings.max_age_hours.max(1)),
            max_fallback_records: settings.max_fallback_records.max(1),
        }
    }
}

/// Built-in priority chains.
pub fn default_priorities() -> HashMap<DataRequestKind, Vec<String>> {
    let chain = |ids: &[&str]| ids.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    HashMap::from([
        (
            DataRequestKind::Quote,
            chain(&["IBKR", "TRADIER", "FINNHUB", "FMP", "YAHOO_SCRAPE"]),
        ),
        (
            DataRequestKind::Historical,
            chain(&["IBKR", "TRADIER", "FINNHUB"]),
        ),
        (DataRequestKind::OptionChain, chain(&["IBKR", "TRADIER"])),
        (DataRequestKind::OptionGreeks, chain(&["IBKR", "TRADIER"])),
        (DataRequestKind::ImpliedVolatility, chain(&["IBKR", "TRADIER"])),
        (DataRequestKind::HistoricalVolatility, Vec::new()),
        (DataRequestKind::EarningsCalendar, chain(&["FINNHUB", "FMP"])),
        (DataRequestKind::DividendCalendar, chain(&["FMP"])),
        (DataRequestKind::RiskFreeRate, chain(&["FRED"])),
    ])
}

/// Top-level acquisition configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AcquisitionConfig {
    /// Chains named here replace the built-in chain for that kind.
    pub priorities: HashMap<DataRequestKind, Vec<String>>,
    pub cache_ttl_secs: HashMap<DataRequestKind, u64>,
    /// Also keep cache entries in the key-value store.
    pub persist_cache: bool,
    pub providers: HashMap<String, ProviderSettings>,
    pub retry: RetrySettings,
    pub failures: FailureSettings,
    pub defaults: DefaultValues,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_deadline_secs: Option<u64>,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            priorities: default_priorities(),
            cache_ttl_secs: HashMap::new(),
            persist_cache: true,
            providers: HashMap::new(),
            retry: RetrySettings::default(),
            failures: FailureSettings::default(),
            defaults: DefaultValues::default(),
            chain_deadline_secs: None,
        }
    }
}

impl AcquisitionConfig {
    /// Load from a JSON file. Kinds missing from `priorities` keep their
    /// built-in chain.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, AcquisitionError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AcquisitionError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_json_str(&raw)
            .map_err(|e| AcquisitionError::Config(format!("{}: {}", path.display(), e)))?;
        debug!("Loaded acquisition config from {}", path.display());
        Ok(config)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, AcquisitionError> {
        let mut config: Self = serde_json::from_str(raw)
            .map_err(|e| AcquisitionError::Config(format!("Invalid config: {}", e)))?;
        for (kind, chain) in default_priorities() {
            config.priorities.entry(kind).or_insert(chain);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AcquisitionError> {
        let finite_non_negative = |name: &str, v: f64| {
            if v.is_finite() && v >= 0.0 {
                Ok(())
            } else {
                Err(AcquisitionError::Config(format!(
                    "{} must be a non-negative number, got {}",
                    name, v
                )))
            }
        };

        finite_non_negative("retry.rateLimitBaseSecs", self.retry.rate_limit_base_secs)?;
        finite_non_negative("retry.serverErrorDelaySecs", self.retry.server_error_delay_secs)?;
        for (id, settings) in &self.providers {
            if let Some(retry) = &settings.retry {
                finite_non_negative(
                    &format!("providers.{id}.retry.rateLimitBaseSecs"),
                    retry.rate_limit_base_secs,
                )?;
                finite_non_negative(
                    &format!("providers.{id}.retry.serverErrorDelaySecs"),
                    retry.server_error_delay_secs,
                )?;
            }
            if settings.timeout_ms == Some(0) {
                return Err(AcquisitionError::Config(format!(
                    "providers.{}.timeoutMs must be positive",
                    id
                )));
            }
        }
        if !self.defaults.risk_free_rate.is_finite() {
            return Err(AcquisitionError::Config(
                "defaults.riskFreeRate must be finite".to_string(),
            ));
        }
        if !(self.defaults.volatility.is_finite() && self.defaults.volatility > 0.0) {
            return Err(AcquisitionError::Config(
                "defaults.volatility must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cache_ttls(&self) -> HashMap<DataRequestKind, Duration> {
        self.cache_ttl_secs
            .iter()
            .map(|(kind, secs)| (*kind, Duration::from_secs(*secs)))
            .collect()
    }

    pub fn chain_deadline(&self) -> Option<Duration> {
        self.chain_deadline_secs.map(Duration::from_secs)
    }

    /// Builder with every configured policy applied to `adapters`.
    pub fn builder(
        &self,
        adapters: Vec<Arc<dyn ProviderAdapter>>,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> OrchestratorBuilder {
        let mut builder = DataSourceOrchestrator::builder()
            .store(store)
            .clock(clock)
            .priorities(self.priorities.clone())
            .retry_policy(RetryPolicy::from(&self.retry))
            .failure_config(FailureRegistryConfig::from(&self.failures))
            .defaults(self.defaults.clone())
            .chain_deadline(self.chain_deadline())
            .persist_cache(self.persist_cache);

        for (kind, ttl) in self.cache_ttls() {
            builder = builder.cache_ttl(kind, ttl);
        }

        for adapter in &adapters {
            let id = adapter.id();
            let Some(settings) = self.providers.get(id) else {
                continue;
            };
            if !settings.enabled {
                builder = builder.disable(id);
            }
            builder = builder.rate_limit(id, settings.apply_to(adapter.rate_limit()));
            if let Some(ms) = settings.timeout_ms {
                builder = builder.timeout(id, Duration::from_millis(ms));
            }
            if let Some(retry) = &settings.retry {
                builder = builder.provider_retry(id, RetryPolicy::from(retry));
            }
        }

        for id in self.providers.keys() {
            if !adapters.iter().any(|a| a.id() == id) {
                warn!("Settings for unknown provider '{}' ignored", id);
            }
        }

        adapters
            .into_iter()
            .fold(builder, |builder, adapter| builder.adapter(adapter))
    }

    /// Orchestrator over the built-in adapters.
    pub fn build_orchestrator(
        &self,
        credentials: &ProviderCredentials,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> DataSourceOrchestrator {
        self.builder(
            credentials.adapters_with_timeouts(&self.provider_timeouts()),
            store,
            clock,
        )
        .build()
    }

    /// Per-provider `timeoutMs` overrides.
    pub fn provider_timeouts(&self) -> HashMap<String, Duration> {
        self.providers
            .iter()
            .filter_map(|(id, settings)| {
                settings
                    .timeout_ms
                    .map(|ms| (id.clone(), Duration::from_millis(ms)))
            })
            .collect()
    }
}

/// Provider credentials, read from the environment.
#[derive(Clone, Default)]
pub struct ProviderCredentials {
    pub tradier_token: Option<String>,
    pub finnhub_api_key: Option<String>,
    pub fred_api_key: Option<String>,
    pub fmp_api_key: Option<String>,
    pub ibkr_gateway_url: Option<String>,
}

impl std::fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let present = |v: &Option<String>| if v.is_some() { "set" } else { "unset" };
        f.debug_struct("ProviderCredentials")
            .field("tradier_token", &present(&self.tradier_token))
            .field("finnhub_api_key", &present(&self.finnhub_api_key))
            .field("fred_api_key", &present(&self.fred_api_key))
            .field("fmp_api_key", &present(&self.fmp_api_key))
            .field("ibkr_gateway_url", &self.ibkr_gateway_url)
            .finish()
    }
}

impl ProviderCredentials {
    /// Reads `TRADIER_TOKEN`, `FINNHUB_API_KEY`, `FRED_API_KEY`,
    /// `FMP_API_KEY` and `IBKR_GATEWAY_URL`. Empty values count as unset.
    pub fn from_env() -> Self {
        let var = |name: &str| {
            std::env::var(name)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            tradier_token: var("TRADIER_TOKEN"),
            finnhub_api_key: var("FINNHUB_API_KEY"),
            fred_api_key: var("FRED_API_KEY"),
            fmp_api_key: var("FMP_API_KEY"),
            ibkr_gateway_url: var("IBKR_GATEWAY_URL"),
        }
    }

    /// One adapter per built-in provider; those without a credential are
    /// built disabled.
    pub fn adapters(&self) -> Vec<Arc<dyn ProviderAdapter>> {
        self.adapters_with_timeouts(&HashMap::new())
    }

    /// Like [`adapters`](Self::adapters), passing timeout overrides to
    /// adapters whose HTTP client carries its own timeout.
    pub fn adapters_with_timeouts(
        &self,
        timeouts: &HashMap<String, Duration>,
    ) -> Vec<Arc<dyn ProviderAdapter>> {
        let mut ibkr = IbkrProvider::new(self.ibkr_gateway_url.clone());
        if let Some(timeout) = timeouts.get(ibkr.id()) {
            ibkr = ibkr.with_timeout(*timeout);
        }
        vec![
            Arc::new(ibkr),
            Arc::new(TradierProvider::new(self.tradier_token.clone())),
            Arc::new(FinnhubProvider::new(self.finnhub_api_key.clone())),
            Arc::new(FredProvider::new(self.fred_api_key.clone())),
            Arc::new(FmpProvider::new(self.fmp_api_key.clone())),
            Arc::new(YahooScrapeProvider::new()),
        ]
    }
}
