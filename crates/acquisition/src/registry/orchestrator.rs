//! Fallback orchestration for data acquisition.
//!
//! The orchestrator decides, for every request, which source serves it:
//! 1. A live cache entry returns immediately
//! 2. Providers are tried in the exact order of the kind's priority chain,
//!    each gated by the rate-limit ledger and retried per the retry policy
//! 3. If every provider fails, the computation bridge is tried with
//!    caller-supplied inputs or inputs observed on earlier acquisitions
//! 4. Otherwise the configured default is returned, labelled as such
//!
//! [`acquire`](DataSourceOrchestrator::acquire) never fails. Every outcome
//! carries its provenance in `chosen_source` and is appended to the
//! failure registry's fallback records.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::time::Instant;

use super::failure_registry::{FailureContext, FailureRegistry, FailureRegistryConfig};
use super::options::{interruptible_sleep, AcquireOptions, WaitInterrupted};
use super::rate_limit_ledger::RateLimitLedger;
use super::retry_policy::RetryPolicy;
use super::skip_reason::{FetchDiagnostics, SkipReason};
use super::validator::PayloadValidator;
use crate::bridge::{BlackScholesBridge, ComputationBridge, ComputationError, PricingInputs};
use crate::cache::DataCache;
use crate::clock::{Clock, SystemClock};
use crate::config::DefaultValues;
use crate::diagnostics::{DiagnosticsReport, ProviderHealth};
use crate::errors::AcquisitionError;
use crate::models::{
    ChosenSource, DataPayload, DataRequest, DataRequestKind, FallbackRecord, ProviderId,
    ProviderResult, RiskFreeRate, Volatility, VolatilityMethod,
};
use crate::provider::{fetch_payload, ProviderAdapter, RateLimit};
use crate::redact::redact_text;
use crate::storage::{KeyValueStore, MemoryKeyValueStore};

/// Outcome of one acquisition.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Acquisition {
    pub result: ProviderResult,
    /// Absent for cache hits, which append no fallback record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackRecord>,
    pub from_cache: bool,
    pub diagnostics: FetchDiagnostics,
}

impl Acquisition {
    pub fn payload(&self) -> Option<&DataPayload> {
        self.result.payload()
    }

    pub fn chosen_source(&self) -> Option<&ChosenSource> {
        self.result.source()
    }
}

/// How the provider walk ended.
enum Walk {
    Served(ProviderId, DataPayload),
    Exhausted,
    Interrupted(WaitInterrupted),
}

/// Acquisitions between automatic sweeps of expired cache entries and
/// observed inputs.
const PRUNE_INTERVAL: u64 = 256;

const RATE_KEY: &str = "risk_free_rate";

/// Keyed values stamped with the time they were seen. A value is usable for
/// as long as the payload it came from would stay cached.
#[derive(Debug)]
struct Observations<T> {
    ttl: Duration,
    values: HashMap<String, (T, DateTime<Utc>)>,
}

impl<T: Clone> Observations<T> {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            values: HashMap::new(),
        }
    }

    fn is_fresh(&self, seen: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        younger_than(self.ttl, seen, now)
    }

    fn insert(&mut self, key: String, value: T, now: DateTime<Utc>) {
        self.values.insert(key, (value, now));
    }

    fn insert_if_absent(&mut self, key: String, value: T, now: DateTime<Utc>) {
        match self.values.get(&key) {
            Some((_, seen)) if self.is_fresh(*seen, now) => {}
            _ => self.insert(key, value, now),
        }
    }

    fn get(&self, key: &str, now: DateTime<Utc>) -> Option<T> {
        self.values
            .get(key)
            .filter(|(_, seen)| self.is_fresh(*seen, now))
            .map(|(value, _)| value.clone())
    }

    fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.values.len();
        let ttl = self.ttl;
        self.values
            .retain(|_, (_, seen)| younger_than(ttl, *seen, now));
        before - self.values.len()
    }

    fn len(&self) -> usize {
        self.values.len()
    }
}

// A clock that moved backwards keeps the value
fn younger_than(ttl: Duration, seen: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    (now - seen).to_std().map_or(true, |age| age < ttl)
}

/// Values seen on earlier successful acquisitions, used as bridge inputs.
#[derive(Debug)]
struct ObservedInputs {
    /// Last close per underlying
    spots: Observations<f64>,
    risk_free_rate: Observations<f64>,
    /// Implied volatility per OCC symbol
    implied_vols: Observations<f64>,
    /// Option mid price per OCC symbol
    option_mids: Observations<f64>,
    /// Closes per historical cache key, oldest first
    closes: Observations<Vec<f64>>,
}

impl ObservedInputs {
    fn new(cache: &DataCache) -> Self {
        let chain_ttl = cache.ttl_for(DataRequestKind::OptionChain);
        Self {
            spots: Observations::new(cache.ttl_for(DataRequestKind::Quote)),
            risk_free_rate: Observations::new(cache.ttl_for(DataRequestKind::RiskFreeRate)),
            implied_vols: Observations::new(chain_ttl),
            option_mids: Observations::new(chain_ttl),
            closes: Observations::new(cache.ttl_for(DataRequestKind::Historical)),
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) -> usize {
        self.spots.prune(now)
            + self.risk_free_rate.prune(now)
            + self.implied_vols.prune(now)
            + self.option_mids.prune(now)
            + self.closes.prune(now)
    }

    fn len(&self) -> usize {
        self.spots.len()
            + self.risk_free_rate.len()
            + self.implied_vols.len()
            + self.option_mids.len()
            + self.closes.len()
    }
}

/// Fallback orchestrator over a set of provider adapters.
pub struct DataSourceOrchestrator {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    priorities: HashMap<DataRequestKind, Vec<String>>,
    disabled: HashSet<String>,
    timeouts: HashMap<String, Duration>,
    retry: RetryPolicy,
    provider_retry: HashMap<String, RetryPolicy>,
    ledger: Arc<RateLimitLedger>,
    failures: Arc<FailureRegistry>,
    cache: Arc<DataCache>,
    bridge: Option<Arc<dyn ComputationBridge>>,
    validator: PayloadValidator,
    defaults: DefaultValues,
    chain_deadline: Option<Duration>,
    clock: Arc<dyn Clock>,
    observed: Mutex<ObservedInputs>,
    cache_hits: AtomicU64,
    acquisitions: AtomicU64,
}

impl DataSourceOrchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    /// Acquire with the configured chain deadline and no cancellation.
    pub async fn acquire(&self, request: &DataRequest) -> Acquisition {
        self.acquire_with(request, AcquireOptions::default()).await
    }

    /// Acquire, bounding waits by `options`.
    ///
    /// A wait that cannot finish before the deadline skips that provider
    /// only. An expired deadline or a cancellation ends the provider walk;
    /// the bridge and default stages still run since neither suspends.
    pub async fn acquire_with(&self, request: &DataRequest, options: AcquireOptions) -> Acquisition {
        let options = self.effective_options(options);
        let mut diagnostics = FetchDiagnostics::new();

        if (self.acquisitions.fetch_add(1, Ordering::Relaxed) + 1) % PRUNE_INTERVAL == 0 {
            self.prune_expired();
        }

        if let Some(entry) = self.cache.get_entry(&request.cache_key()) {
            debug!("Cache hit for '{}'", entry.key);
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            self.observe(request, &entry.payload);
            let source = entry
                .source
                .clone()
                .unwrap_or_else(|| ChosenSource::provider("cache"));
            return Acquisition {
                result: ProviderResult::success(entry.payload, source, entry.created_at),
                fallback: None,
                from_cache: true,
                diagnostics,
            };
        }

        let chain = self.priorities.get(&request.kind).cloned().unwrap_or_default();
        let mut last_error: Option<AcquisitionError> = None;

        match self
            .walk_providers(request, &chain, &options, &mut diagnostics, &mut last_error)
            .await
        {
            Walk::Served(provider_id, payload) => {
                self.observe(request, &payload);
                let source = ChosenSource::Provider(provider_id);
                self.cache.put_from(request, payload.clone(), source.clone());
                return self.finish(request, &chain, payload, source, diagnostics);
            }
            Walk::Exhausted => {
                debug!(
                    "All providers exhausted for {}: {}",
                    request.kind,
                    diagnostics.summary()
                );
            }
            Walk::Interrupted(reason) => {
                info!(
                    "Provider walk for {} ended early ({}): {}",
                    request.kind,
                    reason,
                    diagnostics.summary()
                );
            }
        }

        if let Some(bridge) = &self.bridge {
            match self.compute(bridge.as_ref(), request) {
                Some(Ok(payload)) => {
                    let source = ChosenSource::SelfCalculated;
                    // Values built from observed spot or rate would outlive those inputs
                    if request.inputs.determines(request.kind) {
                        self.cache.put_from(request, payload.clone(), source.clone());
                    }
                    return self.finish(request, &chain, payload, source, diagnostics);
                }
                Some(Err(e)) => {
                    let error = AcquisitionError::from(e);
                    warn!("Self-calculation for {} failed: {}", request.kind, error);
                    diagnostics.record_error(
                        Cow::Borrowed(crate::models::SELF_CALCULATED),
                        error.status_class(),
                        error.to_string(),
                    );
                    last_error = Some(error);
                }
                None => {}
            }
        }

        // Defaults are never cached
        let payload = self.default_payload(request.kind, last_error.as_ref());
        self.finish(request, &chain, payload, ChosenSource::Default, diagnostics)
    }

    async fn walk_providers(
        &self,
        request: &DataRequest,
        chain: &[String],
        options: &AcquireOptions,
        diagnostics: &mut FetchDiagnostics,
        last_error: &mut Option<AcquisitionError>,
    ) -> Walk {
        for id in chain {
            if let Some(reason) = options.interrupted() {
                diagnostics.record_skip(
                    Cow::Owned(id.clone()),
                    SkipReason::Interrupted {
                        detail: reason.to_string(),
                    },
                );
                return Walk::Interrupted(reason);
            }

            let Some(adapter) = self.adapters.get(id) else {
                debug!("No adapter registered for '{}', skipping", id);
                diagnostics.record_skip(Cow::Owned(id.clone()), SkipReason::UnknownProvider);
                continue;
            };
            let provider_id: ProviderId = Cow::Borrowed(adapter.id());

            if self.disabled.contains(id) || !adapter.is_enabled() {
                diagnostics.record_skip(provider_id, SkipReason::Disabled);
                continue;
            }
            if !adapter.capabilities().supports(request.kind) {
                diagnostics.record_skip(provider_id, SkipReason::KindNotSupported);
                continue;
            }

            let policy = self.provider_retry.get(id).unwrap_or(&self.retry);
            let mut attempt_index = 0u32;

            loop {
                if !self.ledger.can_call(&provider_id) {
                    debug!("Daily cap reached for '{}', skipping", provider_id);
                    diagnostics.record_skip(provider_id.clone(), SkipReason::DailyCapReached);
                    break;
                }
                if let Err(reason) = self.ledger.wait_for_slot(&provider_id, options).await {
                    match wait_blocked(&provider_id, reason, options, diagnostics) {
                        Some(walk) => return walk,
                        None => break,
                    }
                }
                self.ledger.record_call(&provider_id);

                debug!(
                    "Acquiring {} '{}' from '{}' (attempt {})",
                    request.kind,
                    request.symbol_str(),
                    provider_id,
                    attempt_index + 1
                );

                match self.call_adapter(adapter.as_ref(), request, options).await {
                    Ok(payload) => {
                        diagnostics.record_success(provider_id.clone());
                        return Walk::Served(provider_id, payload);
                    }
                    Err(error) => {
                        let class = error.status_class();
                        let record = self.failures.record(
                            &provider_id,
                            request.kind.as_str(),
                            &error,
                            &failure_context(request),
                        );
                        warn!(
                            "Provider '{}' failed {} ({}): {}",
                            provider_id, request.kind, class, record.stack_summary
                        );
                        diagnostics.record_error(
                            provider_id.clone(),
                            class,
                            record.stack_summary.clone(),
                        );

                        let decision = policy.decide_for(&error, attempt_index);
                        *last_error = Some(error);
                        if !decision.retry {
                            break;
                        }

                        diagnostics.record_backoff(
                            provider_id.clone(),
                            class,
                            attempt_index,
                            decision.wait,
                        );
                        debug!(
                            "Retrying '{}' in {:?} after {}",
                            provider_id, decision.wait, class
                        );
                        if let Err(reason) = interruptible_sleep(decision.wait, options).await {
                            match wait_blocked(&provider_id, reason, options, diagnostics) {
                                Some(walk) => return walk,
                                None => break,
                            }
                        }
                        attempt_index += 1;
                    }
                }
            }
        }

        Walk::Exhausted
    }

    /// One attempt: adapter call under its timeout, then validation. The
    /// timeout never runs past the request deadline.
    async fn call_adapter(
        &self,
        adapter: &dyn ProviderAdapter,
        request: &DataRequest,
        options: &AcquireOptions,
    ) -> Result<DataPayload, AcquisitionError> {
        let configured = self
            .timeouts
            .get(adapter.id())
            .copied()
            .unwrap_or_else(|| adapter.timeout());
        let timeout = options
            .remaining()
            .map_or(configured, |remaining| configured.min(remaining));

        let payload = tokio::time::timeout(timeout, fetch_payload(adapter, request))
            .await
            .map_err(|_| AcquisitionError::Timeout {
                provider: adapter.id().to_string(),
            })??;

        self.validator.validate(adapter.id(), payload)
    }

    /// Bridge stage. `None` when the bridge cannot serve the kind.
    fn compute(
        &self,
        bridge: &dyn ComputationBridge,
        request: &DataRequest,
    ) -> Option<Result<DataPayload, ComputationError>> {
        match request.kind {
            DataRequestKind::OptionGreeks => Some(
                self.pricing_inputs(request, true)
                    .and_then(|inputs| bridge.compute_greeks(&inputs))
                    .map(DataPayload::Greeks),
            ),
            DataRequestKind::ImpliedVolatility => Some(self.pricing_inputs(request, false).and_then(
                |inputs| {
                    let market_price = self.market_price(request).ok_or_else(|| {
                        ComputationError::InvalidInput("no market price for contract".to_string())
                    })?;
                    let value = bridge.compute_implied_volatility(market_price, &inputs)?;
                    Ok(DataPayload::Volatility(Volatility {
                        value,
                        method: VolatilityMethod::Implied,
                        window: None,
                    }))
                },
            )),
            DataRequestKind::HistoricalVolatility => {
                let closes = self.closes(request);
                Some(
                    bridge
                        .compute_historical_volatility(&closes)
                        .map(|value| {
                            DataPayload::Volatility(Volatility {
                                value,
                                method: VolatilityMethod::Historical,
                                window: Some(closes.len().saturating_sub(1)),
                            })
                        }),
                )
            }
            _ => None,
        }
    }

    /// Pricing inputs from the request, falling back to observed values.
    ///
    /// The risk-free rate falls back further to the configured default;
    /// spot and (when required) volatility must be known.
    fn pricing_inputs(
        &self,
        request: &DataRequest,
        needs_volatility: bool,
    ) -> Result<PricingInputs, ComputationError> {
        let contract = request
            .contract
            .as_ref()
            .ok_or_else(|| ComputationError::InvalidInput("request has no contract".to_string()))?;
        let occ = contract.occ_symbol();
        let inputs = &request.inputs;
        let now = self.clock.now();
        let observed = self.lock_observed();

        let spot = inputs
            .spot
            .or_else(|| observed.spots.get(&contract.underlying.to_uppercase(), now))
            .ok_or_else(|| {
                ComputationError::InvalidInput(format!("no spot for {}", contract.underlying))
            })?;
        let volatility = match inputs.volatility.or_else(|| observed.implied_vols.get(&occ, now)) {
            Some(v) => v,
            None if needs_volatility => {
                return Err(ComputationError::InvalidInput(format!(
                    "no volatility for {}",
                    occ
                )))
            }
            None => self.defaults.volatility,
        };
        let risk_free_rate = inputs
            .risk_free_rate
            .or_else(|| observed.risk_free_rate.get(RATE_KEY, now))
            .unwrap_or(self.defaults.risk_free_rate);
        let time_to_expiry = inputs
            .time_to_expiry
            .unwrap_or_else(|| contract.time_to_expiry(now));

        Ok(PricingInputs {
            spot,
            strike: contract.strike,
            time_to_expiry,
            volatility,
            risk_free_rate,
            option_type: contract.option_type,
        })
    }

    fn market_price(&self, request: &DataRequest) -> Option<f64> {
        request.inputs.market_price.or_else(|| {
            let occ = request.contract.as_ref()?.occ_symbol();
            self.lock_observed().option_mids.get(&occ, self.clock.now())
        })
    }

    fn closes(&self, request: &DataRequest) -> Vec<f64> {
        if let Some(closes) = &request.inputs.closes {
            return closes.clone();
        }
        match (&request.symbol, request.range) {
            (Some(symbol), Some(range)) => {
                let key = DataRequest::historical(symbol.clone(), range).cache_key();
                self.lock_observed()
                    .closes
                    .get(&key, self.clock.now())
                    .unwrap_or_default()
            }
            _ => Vec::new(),
        }
    }

    fn default_payload(
        &self,
        kind: DataRequestKind,
        last_error: Option<&AcquisitionError>,
    ) -> DataPayload {
        match kind {
            DataRequestKind::RiskFreeRate => DataPayload::RiskFreeRate(RiskFreeRate {
                rate: self.defaults.risk_free_rate,
                series: crate::models::DEFAULT_SOURCE.to_string(),
                as_of: None,
            }),
            DataRequestKind::ImpliedVolatility => DataPayload::Volatility(Volatility {
                value: self.defaults.volatility,
                method: VolatilityMethod::Implied,
                window: None,
            }),
            DataRequestKind::HistoricalVolatility => DataPayload::Volatility(Volatility {
                value: self.defaults.volatility,
                method: VolatilityMethod::Historical,
                window: None,
            }),
            _ => {
                let exhausted = AcquisitionError::AllSourcesExhausted {
                    kind: kind.as_str().to_string(),
                };
                let reason = match last_error {
                    Some(e) => format!("{}; last error: {}", exhausted, redact_text(&e.to_string())),
                    None => exhausted.to_string(),
                };
                DataPayload::Unavailable { reason }
            }
        }
    }

    fn finish(
        &self,
        request: &DataRequest,
        chain: &[String],
        payload: DataPayload,
        source: ChosenSource,
        diagnostics: FetchDiagnostics,
    ) -> Acquisition {
        let now = self.clock.now();
        let first_choice = matches!(
            (&source, chain.first()),
            (ChosenSource::Provider(id), Some(first)) if id == first
        );
        if !first_choice {
            info!(
                "{} '{}' served by {} after fallback",
                request.kind,
                request.symbol_str(),
                source
            );
        }

        let fallback = FallbackRecord::new(request.kind, source.clone(), now);
        self.failures.record_fallback(fallback.clone(), !first_choice);

        Acquisition {
            result: ProviderResult::success(payload, source, now),
            fallback: Some(fallback),
            from_cache: false,
            diagnostics,
        }
    }

    fn lock_observed(&self) -> MutexGuard<'_, ObservedInputs> {
        self.observed.lock().unwrap_or_else(|poisoned| {
            warn!("Observed inputs mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Remember values the bridge may need later.
    fn observe(&self, request: &DataRequest, payload: &DataPayload) {
        let now = self.clock.now();
        let mut observed = self.lock_observed();
        match payload {
            DataPayload::Quote(quote) => {
                if let Ok(close) = f64::try_from(quote.close) {
                    observed.spots.insert(quote.symbol.to_uppercase(), close, now);
                }
            }
            DataPayload::RiskFreeRate(rate) => {
                observed
                    .risk_free_rate
                    .insert(RATE_KEY.to_string(), rate.rate, now);
            }
            DataPayload::OptionChain(chain) => {
                for quote in &chain.contracts {
                    let occ = quote.contract.occ_symbol();
                    if let Some(mid) = quote.mid() {
                        observed.option_mids.insert(occ.clone(), mid, now);
                    }
                    if let Some(iv) = quote.greeks.as_ref().and_then(|g| g.implied_volatility) {
                        observed.implied_vols.insert(occ, iv, now);
                    }
                }
            }
            DataPayload::Greeks(greeks) => {
                if let (Some(contract), Some(iv)) = (&request.contract, greeks.implied_volatility) {
                    observed.implied_vols.insert(contract.occ_symbol(), iv, now);
                }
            }
            DataPayload::Volatility(vol) if vol.method == VolatilityMethod::Implied => {
                if let Some(contract) = &request.contract {
                    observed
                        .implied_vols
                        .insert(contract.occ_symbol(), vol.value, now);
                }
            }
            DataPayload::Historical(bars) => {
                let closes = bars
                    .iter()
                    .filter_map(|bar| f64::try_from(bar.close).ok())
                    .collect();
                observed.closes.insert(request.cache_key(), closes, now);
                if let Some(last) = bars.last() {
                    if let Ok(close) = f64::try_from(last.close) {
                        observed
                            .spots
                            .insert_if_absent(last.symbol.to_uppercase(), close, now);
                    }
                }
            }
            _ => {}
        }
    }

    /// Drop expired cache entries and stale observed inputs. Returns the
    /// number removed. Also runs every few hundred acquisitions.
    pub fn prune_expired(&self) -> usize {
        let cache_entries = self.cache.purge_expired();
        let (observed, kept) = {
            let mut inputs = self.lock_observed();
            (inputs.prune(self.clock.now()), inputs.len())
        };
        debug!(
            "Pruned {} cache entries and {} observed inputs, {} inputs kept",
            cache_entries, observed, kept
        );
        cache_entries + observed
    }

    fn effective_options(&self, mut options: AcquireOptions) -> AcquireOptions {
        if options.deadline.is_none() {
            if let Some(limit) = self.chain_deadline {
                options.deadline = Some(Instant::now() + limit);
            }
        }
        options
    }

    /// Health and fallback report across all registered providers.
    pub async fn diagnostics(&self) -> DiagnosticsReport {
        let stats = self.failures.fallback_stats();
        let mut summary = self.failures.summarize();

        let mut ids: Vec<&String> = self.adapters.keys().collect();
        ids.sort();

        let mut providers = Vec::with_capacity(ids.len());
        for id in ids {
            let adapter = &self.adapters[id];
            let provider_id: ProviderId = Cow::Borrowed(adapter.id());
            let enabled = !self.disabled.contains(id) && adapter.is_enabled();
            let connected = enabled && adapter.is_connected().await;
            providers.push(ProviderHealth {
                id: id.clone(),
                enabled,
                connected,
                calls_today: self.ledger.calls_today(&provider_id),
                daily_cap: self.ledger.limit_for(&provider_id).daily_cap,
                failures: summary.providers.remove(id.as_str()).unwrap_or_default(),
            });
        }

        DiagnosticsReport::new(
            self.clock.now(),
            &stats,
            self.cache_hits.load(Ordering::Relaxed),
            providers,
        )
    }

    pub fn failures(&self) -> &Arc<FailureRegistry> {
        &self.failures
    }

    pub fn ledger(&self) -> &Arc<RateLimitLedger> {
        &self.ledger
    }

    pub fn cache(&self) -> &Arc<DataCache> {
        &self.cache
    }

    /// Priority chain for a kind, as configured.
    pub fn priorities(&self, kind: DataRequestKind) -> &[String] {
        self.priorities.get(&kind).map(Vec::as_slice).unwrap_or_default()
    }
}

/// A wait that could not complete. Ends the walk only when the acquisition
/// itself is cancelled or out of time; a wait that merely would not fit the
/// deadline skips to the next provider.
fn wait_blocked(
    provider_id: &ProviderId,
    reason: WaitInterrupted,
    options: &AcquireOptions,
    diagnostics: &mut FetchDiagnostics,
) -> Option<Walk> {
    if let Some(reason) = options.interrupted().or(match reason {
        WaitInterrupted::Cancelled => Some(reason),
        WaitInterrupted::DeadlineExceeded => None,
    }) {
        diagnostics.record_skip(
            provider_id.clone(),
            SkipReason::Interrupted {
                detail: reason.to_string(),
            },
        );
        return Some(Walk::Interrupted(reason));
    }
    debug!(
        "Wait for '{}' would overrun the deadline, trying next provider",
        provider_id
    );
    diagnostics.record_skip(provider_id.clone(), SkipReason::WaitExceedsDeadline);
    None
}

fn failure_context(request: &DataRequest) -> FailureContext {
    let mut context = FailureContext::default().with_param("kind", request.kind.as_str());
    if let Some(symbol) = &request.symbol {
        context = context.with_param("symbol", symbol.to_uppercase());
    }
    if let Some(contract) = &request.contract {
        context = context.with_param("contract", contract.occ_symbol());
    }
    if let Some(range) = &request.range {
        context = context.with_param("range", format!("{}..{}", range.start, range.end));
    }
    if let Some(expiry) = &request.expiry {
        context = context.with_param("expiry", expiry.to_string());
    }
    context
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`DataSourceOrchestrator`].
///
/// Adapters are registered once; a priority chain refers to them by id.
/// Adapter rate limits seed the ledger unless overridden.
pub struct OrchestratorBuilder {
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    priorities: HashMap<DataRequestKind, Vec<String>>,
    disabled: HashSet<String>,
    rate_limits: HashMap<String, RateLimit>,
    timeouts: HashMap<String, Duration>,
    retry: RetryPolicy,
    provider_retry: HashMap<String, RetryPolicy>,
    cache_ttls: HashMap<DataRequestKind, Duration>,
    persist_cache: bool,
    failure_config: FailureRegistryConfig,
    bridge: Option<Arc<dyn ComputationBridge>>,
    validator: PayloadValidator,
    defaults: DefaultValues,
    chain_deadline: Option<Duration>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self {
            adapters: Vec::new(),
            priorities: HashMap::new(),
            disabled: HashSet::new(),
            rate_limits: HashMap::new(),
            timeouts: HashMap::new(),
            retry: RetryPolicy::default(),
            provider_retry: HashMap::new(),
            cache_ttls: HashMap::new(),
            persist_cache: false,
            failure_config: FailureRegistryConfig::default(),
            bridge: Some(Arc::new(BlackScholesBridge::new())),
            validator: PayloadValidator::new(),
            defaults: DefaultValues::default(),
            chain_deadline: None,
            store: Arc::new(MemoryKeyValueStore::new()),
            clock: Arc::new(SystemClock),
        }
    }
}

impl OrchestratorBuilder {
    pub fn adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    /// Priority chain for one kind, first entry tried first.
    pub fn priority<S: AsRef<str>>(mut self, kind: DataRequestKind, chain: &[S]) -> Self {
        self.priorities
            .insert(kind, chain.iter().map(|s| s.as_ref().to_string()).collect());
        self
    }

    pub fn priorities(mut self, priorities: HashMap<DataRequestKind, Vec<String>>) -> Self {
        self.priorities.extend(priorities);
        self
    }

    /// Turn a provider off regardless of its credentials.
    pub fn disable(mut self, id: impl Into<String>) -> Self {
        self.disabled.insert(id.into());
        self
    }

    pub fn rate_limit(mut self, id: impl Into<String>, limit: RateLimit) -> Self {
        self.rate_limits.insert(id.into(), limit);
        self
    }

    pub fn timeout(mut self, id: impl Into<String>, timeout: Duration) -> Self {
        self.timeouts.insert(id.into(), timeout);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn provider_retry(mut self, id: impl Into<String>, policy: RetryPolicy) -> Self {
        self.provider_retry.insert(id.into(), policy);
        self
    }

    pub fn cache_ttl(mut self, kind: DataRequestKind, ttl: Duration) -> Self {
        self.cache_ttls.insert(kind, ttl);
        self
    }

    /// Also persist cache entries in the key-value store.
    pub fn persist_cache(mut self, persist: bool) -> Self {
        self.persist_cache = persist;
        self
    }

    pub fn failure_config(mut self, config: FailureRegistryConfig) -> Self {
        self.failure_config = config;
        self
    }

    pub fn bridge(mut self, bridge: Arc<dyn ComputationBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn without_bridge(mut self) -> Self {
        self.bridge = None;
        self
    }

    pub fn validator(mut self, validator: PayloadValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn defaults(mut self, defaults: DefaultValues) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn chain_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.chain_deadline = deadline;
        self
    }

    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = store;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> DataSourceOrchestrator {
        let ledger = Arc::new(RateLimitLedger::new(self.store.clone(), self.clock.clone()));
        let mut adapters: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();

        for adapter in self.adapters {
            let id = adapter.id().to_string();
            let limit = self
                .rate_limits
                .get(&id)
                .cloned()
                .unwrap_or_else(|| adapter.rate_limit());
            ledger.configure(&Cow::Owned(id.clone()), limit);
            if adapters.insert(id.clone(), adapter).is_some() {
                warn!("Adapter '{}' registered twice, keeping the last one", id);
            }
        }

        for (kind, chain) in &self.priorities {
            for id in chain.iter().filter(|id| !adapters.contains_key(id.as_str())) {
                warn!("Priority chain for {} names unknown provider '{}'", kind, id);
            }
        }

        let mut cache = DataCache::new(self.cache_ttls, self.clock.clone());
        if self.persist_cache {
            cache = cache.with_store(self.store.clone());
        }
        let observed = ObservedInputs::new(&cache);

        DataSourceOrchestrator {
            adapters,
            priorities: self.priorities,
            disabled: self.disabled,
            timeouts: self.timeouts,
            retry: self.retry,
            provider_retry: self.provider_retry,
            ledger,
            failures: Arc::new(FailureRegistry::new(self.failure_config, self.clock.clone())),
            cache: Arc::new(cache),
            bridge: self.bridge,
            validator: self.validator,
            defaults: self.defaults,
            chain_deadline: self.chain_deadline,
            clock: self.clock,
            observed: Mutex::new(observed),
            cache_hits: AtomicU64::new(0),
            acquisitions: AtomicU64::new(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::errors::{ErrorKind, StatusClass};
    use crate::models::{Greeks, OptionContract, OptionType, Quote};
    use crate::provider::ProviderCapabilities;
    use async_trait::async_trait;
    use chrono::{NaiveDate, TimeZone, Utc};
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio_util::sync::CancellationToken;

    const ALL_KINDS: &[DataRequestKind] = &DataRequestKind::ALL;

    /// Adapter that replays scripted outcomes, then fails with a server error.
    struct ScriptedAdapter {
        id: &'static str,
        kinds: &'static [DataRequestKind],
        limit: RateLimit,
        delay: Duration,
        responses: Mutex<VecDeque<Result<DataPayload, AcquisitionError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedAdapter {
        fn new(id: &'static str) -> Self {
            Self {
                id,
                kinds: ALL_KINDS,
                limit: RateLimit::unlimited(),
                delay: Duration::ZERO,
                responses: Mutex::new(VecDeque::new()),
                calls: AtomicUsize::new(0),
            }
        }

        fn kinds(mut self, kinds: &'static [DataRequestKind]) -> Self {
            self.kinds = kinds;
            self
        }

        fn limit(mut self, limit: RateLimit) -> Self {
            self.limit = limit;
            self
        }

        fn delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn respond(self, outcome: Result<DataPayload, AcquisitionError>) -> Self {
            self.responses.lock().unwrap().push_back(outcome);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        async fn next(&self) -> Result<DataPayload, AcquisitionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(client_error(self.id)))
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        fn id(&self) -> &'static str {
            self.id
        }

        fn capabilities(&self) -> ProviderCapabilities {
            ProviderCapabilities { kinds: self.kinds }
        }

        fn rate_limit(&self) -> RateLimit {
            self.limit.clone()
        }

        async fn fetch_quote(&self, _symbol: &str) -> Result<Quote, AcquisitionError> {
            match self.next().await? {
                DataPayload::Quote(quote) => Ok(quote),
                other => panic!("scripted non-quote payload: {other:?}"),
            }
        }

        async fn fetch_greeks(&self, _contract: &OptionContract) -> Result<Greeks, AcquisitionError> {
            match self.next().await? {
                DataPayload::Greeks(greeks) => Ok(greeks),
                other => panic!("scripted non-greeks payload: {other:?}"),
            }
        }

        async fn fetch_risk_free_rate(&self) -> Result<RiskFreeRate, AcquisitionError> {
            match self.next().await? {
                DataPayload::RiskFreeRate(rate) => Ok(rate),
                other => panic!("scripted non-rate payload: {other:?}"),
            }
        }
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 2, 15, 0, 0).unwrap(),
        ))
    }

    fn quote(source: &str) -> DataPayload {
        DataPayload::Quote(Quote::new(
            "SPY",
            Utc.with_ymd_and_hms(2024, 1, 2, 15, 0, 0).unwrap(),
            dec!(472.65),
            "USD",
            source,
        ))
    }

    fn rate_limited(provider: &str) -> AcquisitionError {
        AcquisitionError::RateLimited {
            provider: provider.to_string(),
            retry_after: None,
        }
    }

    fn client_error(provider: &str) -> AcquisitionError {
        AcquisitionError::ClientError {
            provider: provider.to_string(),
            status: 401,
            message: "GET https://api.example.com/v1/quote?token=sk_live_123 - unauthorized"
                .to_string(),
        }
    }

    fn server_error(provider: &str) -> AcquisitionError {
        AcquisitionError::ServerError {
            provider: provider.to_string(),
            status: 503,
            message: "unavailable".to_string(),
        }
    }

    fn contract() -> OptionContract {
        OptionContract::new(
            "SPY",
            100.0,
            NaiveDate::from_ymd_opt(2024, 6, 21).unwrap(),
            OptionType::Call,
        )
    }

    fn builder(clock: Arc<ManualClock>) -> OrchestratorBuilder {
        DataSourceOrchestrator::builder().clock(clock)
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_twice_then_success() {
        let a = Arc::new(
            ScriptedAdapter::new("A")
                .respond(Err(rate_limited("A")))
                .respond(Err(rate_limited("A")))
                .respond(Ok(quote("A"))),
        );
        let orchestrator = builder(clock())
            .adapter(a.clone())
            .priority(DataRequestKind::Quote, &["A"])
            .build();

        let started = Instant::now();
        let acquisition = orchestrator.acquire(&DataRequest::quote("SPY")).await;

        assert_eq!(acquisition.chosen_source(), Some(&ChosenSource::provider("A")));
        assert_eq!(a.calls(), 3);

        let waits: Vec<Duration> = acquisition
            .diagnostics
            .backoffs
            .iter()
            .map(|b| b.wait)
            .collect();
        assert_eq!(waits, vec![Duration::from_secs(30), Duration::from_secs(60)]);
        assert!(started.elapsed() >= Duration::from_secs(90));

        let records = orchestrator.failures().recent("A", 10);
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.error_kind == ErrorKind::RateLimited));
        assert!(records.iter().all(|r| r.http_status == Some(429)));
        assert_eq!(orchestrator.ledger().calls_today(&Cow::Borrowed("A")), 3);
    }

    #[tokio::test]
    async fn test_all_providers_fail_self_calculates() {
        let a = Arc::new(ScriptedAdapter::new("A").respond(Err(client_error("A"))));
        let b = Arc::new(ScriptedAdapter::new("B").respond(Err(AcquisitionError::DataUnavailable {
            provider: "B".to_string(),
            message: "empty".to_string(),
        })));
        let orchestrator = builder(clock())
            .adapter(a.clone())
            .adapter(b.clone())
            .priority(DataRequestKind::ImpliedVolatility, &["A", "B"])
            .build();

        let request = DataRequest::implied_volatility(contract()).with_inputs(
            crate::models::ComputationInputs {
                spot: Some(100.0),
                risk_free_rate: Some(0.05),
                time_to_expiry: Some(0.5),
                market_price: Some(8.0),
                ..Default::default()
            },
        );
        let acquisition = orchestrator.acquire(&request).await;

        assert_eq!(acquisition.chosen_source(), Some(&ChosenSource::SelfCalculated));
        match acquisition.payload() {
            Some(DataPayload::Volatility(vol)) => {
                assert_eq!(vol.method, VolatilityMethod::Implied);
                assert!(vol.value > 0.1 && vol.value < 0.4, "iv = {}", vol.value);
            }
            other => panic!("expected volatility, got {other:?}"),
        }
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);

        // Self-calculated values are cached
        let again = orchestrator.acquire(&request).await;
        assert!(again.from_cache);
        assert_eq!(again.chosen_source(), Some(&ChosenSource::SelfCalculated));
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test]
    async fn test_all_sources_fail_returns_default() {
        let a = Arc::new(ScriptedAdapter::new("A").respond(Err(client_error("A"))));
        let orchestrator = builder(clock())
            .adapter(a)
            .priority(DataRequestKind::OptionGreeks, &["A"])
            .build();

        // No spot and no volatility: the bridge cannot run
        let acquisition = orchestrator
            .acquire(&DataRequest::option_greeks(contract()))
            .await;

        assert!(acquisition.result.is_success());
        assert_eq!(acquisition.chosen_source(), Some(&ChosenSource::Default));
        match acquisition.payload() {
            Some(DataPayload::Unavailable { reason }) => {
                assert!(reason.contains("option_greeks"));
                assert!(!reason.contains("sk_live_123"));
            }
            other => panic!("expected unavailable, got {other:?}"),
        }
        // Defaults are never cached
        assert!(orchestrator.cache().is_empty());
        assert!(acquisition
            .diagnostics
            .errors()
            .iter()
            .any(|(id, _)| **id == crate::models::SELF_CALCULATED));
    }

    #[tokio::test]
    async fn test_bridge_failure_falls_to_numeric_default() {
        let orchestrator = builder(clock())
            .priority(DataRequestKind::ImpliedVolatility, &["MISSING"])
            .defaults(DefaultValues {
                risk_free_rate: 0.04,
                volatility: 0.25,
            })
            .build();

        // Below intrinsic value: no volatility reprices it
        let request = DataRequest::implied_volatility(contract()).with_inputs(
            crate::models::ComputationInputs {
                spot: Some(120.0),
                time_to_expiry: Some(0.5),
                market_price: Some(1.0),
                ..Default::default()
            },
        );
        let acquisition = orchestrator.acquire(&request).await;

        assert_eq!(acquisition.chosen_source(), Some(&ChosenSource::Default));
        assert_eq!(
            acquisition.payload(),
            Some(&DataPayload::Volatility(Volatility {
                value: 0.25,
                method: VolatilityMethod::Implied,
                window: None,
            }))
        );
        assert_eq!(
            acquisition.diagnostics.skip_reasons()[0].1,
            &SkipReason::UnknownProvider
        );
    }

    #[tokio::test]
    async fn test_risk_free_rate_default_without_providers() {
        let orchestrator = builder(clock()).build();
        let acquisition = orchestrator.acquire(&DataRequest::risk_free_rate()).await;

        assert_eq!(acquisition.chosen_source(), Some(&ChosenSource::Default));
        match acquisition.payload() {
            Some(DataPayload::RiskFreeRate(rate)) => {
                assert_eq!(rate.rate, DefaultValues::default().risk_free_rate)
            }
            other => panic!("expected rate, got {other:?}"),
        }
        let stats = orchestrator.failures().fallback_stats();
        assert_eq!(stats.defaults, 1);
        assert_eq!(stats.fallback_invocations, 1);
    }

    #[tokio::test]
    async fn test_providers_tried_in_priority_order() {
        let a = Arc::new(ScriptedAdapter::new("A").respond(Err(client_error("A"))));
        let b = Arc::new(ScriptedAdapter::new("B").respond(Ok(quote("B"))));
        let c = Arc::new(ScriptedAdapter::new("C").respond(Ok(quote("C"))));
        let orchestrator = builder(clock())
            .adapter(c.clone())
            .adapter(b.clone())
            .adapter(a.clone())
            .priority(DataRequestKind::Quote, &["A", "B", "C"])
            .build();

        let acquisition = orchestrator.acquire(&DataRequest::quote("SPY")).await;

        assert_eq!(acquisition.chosen_source(), Some(&ChosenSource::provider("B")));
        let order: Vec<&str> = acquisition
            .diagnostics
            .attempts
            .iter()
            .map(|a| a.provider_id.as_ref())
            .collect();
        assert_eq!(order, vec!["A", "B"]);
        assert_eq!(c.calls(), 0);

        let stats = orchestrator.failures().fallback_stats();
        assert_eq!(stats.total_acquisitions, 1);
        assert_eq!(stats.fallback_invocations, 1);

        // The stored failure never carries the token from the message
        let record = &orchestrator.failures().recent("A", 1)[0];
        assert_eq!(record.http_status, Some(401));
        assert!(!record.stack_summary.contains("sk_live_123"));
        assert!(!record.sanitized_url.as_deref().unwrap_or_default().contains("sk_live_123"));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_providers() {
        let a = Arc::new(ScriptedAdapter::new("A").respond(Ok(quote("A"))));
        let orchestrator = builder(clock())
            .adapter(a.clone())
            .priority(DataRequestKind::Quote, &["A"])
            .build();
        let request = DataRequest::quote("SPY");

        let first = orchestrator.acquire(&request).await;
        assert!(!first.from_cache);
        assert!(first.fallback.is_some());

        let second = orchestrator.acquire(&request).await;
        assert!(second.from_cache);
        assert!(second.fallback.is_none());
        assert_eq!(second.chosen_source(), Some(&ChosenSource::provider("A")));
        assert_eq!(second.payload(), first.payload());
        assert_eq!(a.calls(), 1);

        let report = orchestrator.diagnostics().await;
        assert_eq!(report.cache_hits, 1);
        assert_eq!(report.total_acquisitions, 1);
        assert_eq!(report.fallback_invocations, 0);
    }

    #[tokio::test]
    async fn test_daily_cap_skips_provider() {
        let capped = RateLimit {
            min_interval: Duration::ZERO,
            requests_per_minute: None,
            daily_cap: Some(1),
        };
        let a = Arc::new(
            ScriptedAdapter::new("A")
                .limit(capped)
                .respond(Ok(quote("A")))
                .respond(Ok(quote("A"))),
        );
        let b = Arc::new(ScriptedAdapter::new("B").respond(Ok(quote("B"))));
        let orchestrator = builder(clock())
            .adapter(a.clone())
            .adapter(b.clone())
            .priority(DataRequestKind::Quote, &["A", "B"])
            .build();

        let first = orchestrator.acquire(&DataRequest::quote("SPY")).await;
        assert_eq!(first.chosen_source(), Some(&ChosenSource::provider("A")));

        let second = orchestrator.acquire(&DataRequest::quote("QQQ")).await;
        assert_eq!(second.chosen_source(), Some(&ChosenSource::provider("B")));
        assert_eq!(a.calls(), 1);
        assert_eq!(
            second.diagnostics.skip_reasons(),
            vec![(&Cow::Borrowed("A"), &SkipReason::DailyCapReached)]
        );
    }

    #[tokio::test]
    async fn test_disabled_and_unsupported_are_skipped() {
        let a = Arc::new(ScriptedAdapter::new("A").respond(Ok(quote("A"))));
        let b = Arc::new(
            ScriptedAdapter::new("B")
                .kinds(&[DataRequestKind::RiskFreeRate])
                .respond(Ok(quote("B"))),
        );
        let c = Arc::new(ScriptedAdapter::new("C").respond(Ok(quote("C"))));
        let orchestrator = builder(clock())
            .adapter(a.clone())
            .adapter(b.clone())
            .adapter(c)
            .disable("A")
            .priority(DataRequestKind::Quote, &["A", "B", "C"])
            .build();

        let acquisition = orchestrator.acquire(&DataRequest::quote("SPY")).await;
        assert_eq!(acquisition.chosen_source(), Some(&ChosenSource::provider("C")));
        assert_eq!(a.calls() + b.calls(), 0);

        let reasons: Vec<&SkipReason> = acquisition
            .diagnostics
            .skip_reasons()
            .into_iter()
            .map(|(_, r)| r)
            .collect();
        assert_eq!(reasons, vec![&SkipReason::Disabled, &SkipReason::KindNotSupported]);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_uses_later_stages() {
        let a = Arc::new(ScriptedAdapter::new("A").respond(Ok(quote("A"))));
        let orchestrator = builder(clock())
            .adapter(a.clone())
            .priority(DataRequestKind::Quote, &["A"])
            .build();

        let token = CancellationToken::new();
        token.cancel();
        let acquisition = orchestrator
            .acquire_with(
                &DataRequest::quote("SPY"),
                AcquireOptions::default().with_cancel(token),
            )
            .await;

        assert_eq!(a.calls(), 0);
        assert_eq!(acquisition.chosen_source(), Some(&ChosenSource::Default));
        assert!(matches!(
            acquisition.diagnostics.skip_reasons()[0].1,
            SkipReason::Interrupted { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_shorter_than_backoff_moves_on() {
        let a = Arc::new(ScriptedAdapter::new("A").respond(Err(server_error("A"))));
        let b = Arc::new(ScriptedAdapter::new("B").respond(Ok(quote("B"))));
        let orchestrator = builder(clock())
            .adapter(a.clone())
            .adapter(b.clone())
            .priority(DataRequestKind::Quote, &["A", "B"])
            .chain_deadline(Some(Duration::from_secs(5)))
            .build();

        let started = Instant::now();
        let acquisition = orchestrator.acquire(&DataRequest::quote("SPY")).await;

        // The 10s server-error wait cannot fit in the 5s deadline, B can
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
        assert_eq!(acquisition.chosen_source(), Some(&ChosenSource::provider("B")));
        assert_eq!(
            acquisition.diagnostics.skip_reasons(),
            vec![(&Cow::Borrowed("A"), &SkipReason::WaitExceedsDeadline)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_retry_after_skips_to_next_provider() {
        let a = Arc::new(ScriptedAdapter::new("A").respond(Err(AcquisitionError::RateLimited {
            provider: "A".to_string(),
            retry_after: Some(Duration::from_secs(3600)),
        })));
        let b = Arc::new(ScriptedAdapter::new("B").respond(Ok(quote("B"))));
        let orchestrator = builder(clock())
            .adapter(a.clone())
            .adapter(b.clone())
            .priority(DataRequestKind::Quote, &["A", "B"])
            .build();

        let started = Instant::now();
        let acquisition = orchestrator
            .acquire_with(
                &DataRequest::quote("SPY"),
                AcquireOptions::with_timeout(Duration::from_secs(150)),
            )
            .await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
        assert_eq!(acquisition.chosen_source(), Some(&ChosenSource::provider("B")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_ends_walk() {
        let a = Arc::new(ScriptedAdapter::new("A").respond(Err(server_error("A"))));
        let b = Arc::new(ScriptedAdapter::new("B").respond(Ok(quote("B"))));
        let orchestrator = builder(clock())
            .adapter(a.clone())
            .adapter(b.clone())
            .priority(DataRequestKind::Quote, &["A", "B"])
            .build();

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let acquisition = orchestrator
            .acquire_with(
                &DataRequest::quote("SPY"),
                AcquireOptions::default().with_cancel(token),
            )
            .await;

        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 0);
        assert_eq!(acquisition.chosen_source(), Some(&ChosenSource::Default));
        assert!(matches!(
            acquisition.diagnostics.skip_reasons()[0].1,
            SkipReason::Interrupted { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_call_bounded_by_deadline() {
        let a = Arc::new(
            ScriptedAdapter::new("A")
                .delay(Duration::from_secs(60))
                .respond(Ok(quote("A"))),
        );
        let orchestrator = builder(clock())
            .adapter(a.clone())
            .timeout("A", Duration::from_secs(30))
            .priority(DataRequestKind::Quote, &["A"])
            .build();

        let started = Instant::now();
        let acquisition = orchestrator
            .acquire_with(
                &DataRequest::quote("SPY"),
                AcquireOptions::with_timeout(Duration::from_secs(5)),
            )
            .await;

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(6));
        assert_eq!(a.calls(), 1);
        assert_eq!(
            acquisition.diagnostics.attempts[0].status_class,
            Some(StatusClass::Timeout)
        );
        assert_eq!(acquisition.chosen_source(), Some(&ChosenSource::Default));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_adapter_times_out() {
        let a = Arc::new(
            ScriptedAdapter::new("A")
                .delay(Duration::from_secs(30))
                .respond(Ok(quote("A"))),
        );
        let b = Arc::new(ScriptedAdapter::new("B").respond(Ok(quote("B"))));
        let orchestrator = builder(clock())
            .adapter(a.clone())
            .adapter(b)
            .timeout("A", Duration::from_secs(2))
            .provider_retry(
                "A",
                RetryPolicy {
                    network: crate::registry::NetworkRetry::Never,
                    ..RetryPolicy::default()
                },
            )
            .priority(DataRequestKind::Quote, &["A", "B"])
            .build();

        let acquisition = orchestrator.acquire(&DataRequest::quote("SPY")).await;

        assert_eq!(acquisition.chosen_source(), Some(&ChosenSource::provider("B")));
        assert_eq!(a.calls(), 1);
        assert_eq!(
            acquisition.diagnostics.attempts[0].status_class,
            Some(StatusClass::Timeout)
        );
    }

    #[tokio::test]
    async fn test_invalid_payload_moves_to_next_provider() {
        let bad = DataPayload::Quote(Quote::new(
            "SPY",
            Utc.with_ymd_and_hms(2024, 1, 2, 15, 0, 0).unwrap(),
            dec!(0),
            "USD",
            "A",
        ));
        let a = Arc::new(ScriptedAdapter::new("A").respond(Ok(bad)));
        let b = Arc::new(ScriptedAdapter::new("B").respond(Ok(quote("B"))));
        let orchestrator = builder(clock())
            .adapter(a.clone())
            .adapter(b)
            .priority(DataRequestKind::Quote, &["A", "B"])
            .build();

        let acquisition = orchestrator.acquire(&DataRequest::quote("SPY")).await;
        assert_eq!(acquisition.chosen_source(), Some(&ChosenSource::provider("B")));
        assert_eq!(a.calls(), 1);
        assert_eq!(
            orchestrator.failures().recent("A", 1)[0].error_kind,
            ErrorKind::DataUnavailable
        );
    }

    #[tokio::test]
    async fn test_greeks_use_observed_spot_and_rate() {
        let quotes = Arc::new(ScriptedAdapter::new("Q").respond(Ok(quote("Q"))));
        let rates = Arc::new(ScriptedAdapter::new("R").respond(Ok(DataPayload::RiskFreeRate(
            RiskFreeRate {
                rate: 0.0525,
                series: "DGS3MO".to_string(),
                as_of: None,
            },
        ))));
        let orchestrator = builder(clock())
            .adapter(quotes)
            .adapter(rates)
            .priority(DataRequestKind::Quote, &["Q"])
            .priority(DataRequestKind::RiskFreeRate, &["R"])
            .build();

        orchestrator.acquire(&DataRequest::quote("SPY")).await;
        orchestrator.acquire(&DataRequest::risk_free_rate()).await;

        let contract = OptionContract::new(
            "SPY",
            475.0,
            NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            OptionType::Put,
        );
        let request = DataRequest::option_greeks(contract).with_inputs(
            crate::models::ComputationInputs {
                volatility: Some(0.15),
                ..Default::default()
            },
        );
        let acquisition = orchestrator.acquire(&request).await;

        assert_eq!(acquisition.chosen_source(), Some(&ChosenSource::SelfCalculated));
        match acquisition.payload() {
            Some(DataPayload::Greeks(greeks)) => {
                assert!(greeks.delta < 0.0 && greeks.delta > -1.0);
                assert_eq!(greeks.implied_volatility, Some(0.15));
            }
            other => panic!("expected greeks, got {other:?}"),
        }
    }

    fn greeks_request(volatility: f64) -> DataRequest {
        DataRequest::option_greeks(contract()).with_inputs(crate::models::ComputationInputs {
            spot: Some(100.0),
            volatility: Some(volatility),
            risk_free_rate: Some(0.05),
            ..Default::default()
        })
    }

    fn greeks_iv(acquisition: &Acquisition) -> Option<f64> {
        match acquisition.payload() {
            Some(DataPayload::Greeks(greeks)) => greeks.implied_volatility,
            other => panic!("expected greeks, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_self_calculated_greeks_keyed_by_inputs() {
        let orchestrator = builder(clock()).build();

        let low = orchestrator.acquire(&greeks_request(0.15)).await;
        assert_eq!(low.chosen_source(), Some(&ChosenSource::SelfCalculated));
        assert_eq!(greeks_iv(&low), Some(0.15));

        let high = orchestrator.acquire(&greeks_request(0.60)).await;
        assert!(!high.from_cache);
        assert_eq!(greeks_iv(&high), Some(0.60));

        let repeat = orchestrator.acquire(&greeks_request(0.60)).await;
        assert!(repeat.from_cache);
        assert_eq!(greeks_iv(&repeat), Some(0.60));
    }

    #[tokio::test]
    async fn test_greeks_from_observed_spot_not_cached() {
        let quotes = Arc::new(
            ScriptedAdapter::new("Q")
                .kinds(&[DataRequestKind::Quote])
                .respond(Ok(quote("Q"))),
        );
        let orchestrator = builder(clock())
            .adapter(quotes)
            .priority(DataRequestKind::Quote, &["Q"])
            .build();
        orchestrator.acquire(&DataRequest::quote("SPY")).await;

        let request = DataRequest::option_greeks(contract()).with_inputs(
            crate::models::ComputationInputs {
                volatility: Some(0.2),
                risk_free_rate: Some(0.05),
                ..Default::default()
            },
        );
        let first = orchestrator.acquire(&request).await;
        assert_eq!(first.chosen_source(), Some(&ChosenSource::SelfCalculated));

        let second = orchestrator.acquire(&request).await;
        assert!(!second.from_cache);
        assert_eq!(second.chosen_source(), Some(&ChosenSource::SelfCalculated));
    }

    #[tokio::test]
    async fn test_observed_spot_expires_with_quote_ttl() {
        let clock = clock();
        let quotes = Arc::new(
            ScriptedAdapter::new("Q")
                .kinds(&[DataRequestKind::Quote])
                .respond(Ok(quote("Q"))),
        );
        let orchestrator = builder(clock.clone())
            .adapter(quotes)
            .priority(DataRequestKind::Quote, &["Q"])
            .build();
        orchestrator.acquire(&DataRequest::quote("SPY")).await;

        let request = DataRequest::option_greeks(contract()).with_inputs(
            crate::models::ComputationInputs {
                volatility: Some(0.2),
                ..Default::default()
            },
        );
        let fresh = orchestrator.acquire(&request).await;
        assert_eq!(fresh.chosen_source(), Some(&ChosenSource::SelfCalculated));

        clock.advance(chrono::Duration::seconds(120));
        let stale = orchestrator.acquire(&request).await;
        assert_eq!(stale.chosen_source(), Some(&ChosenSource::Default));
    }

    #[tokio::test]
    async fn test_prune_expired_sweeps_cache_and_observed() {
        let clock = clock();
        let quotes = Arc::new(ScriptedAdapter::new("Q").respond(Ok(quote("Q"))));
        let orchestrator = builder(clock.clone())
            .adapter(quotes)
            .priority(DataRequestKind::Quote, &["Q"])
            .build();
        orchestrator.acquire(&DataRequest::quote("SPY")).await;
        assert_eq!(orchestrator.cache().len(), 1);
        assert_eq!(orchestrator.lock_observed().len(), 1);

        assert_eq!(orchestrator.prune_expired(), 0);

        clock.advance(chrono::Duration::seconds(120));
        assert_eq!(orchestrator.prune_expired(), 2);
        assert!(orchestrator.cache().is_empty());
        assert_eq!(orchestrator.lock_observed().len(), 0);
    }

    #[tokio::test]
    async fn test_acquire_prunes_periodically() {
        let clock = clock();
        let quotes = Arc::new(ScriptedAdapter::new("Q").respond(Ok(quote("Q"))));
        let orchestrator = builder(clock.clone())
            .adapter(quotes)
            .priority(DataRequestKind::Quote, &["Q"])
            .build();
        orchestrator.acquire(&DataRequest::quote("SPY")).await;
        clock.advance(chrono::Duration::seconds(120));

        // Defaults are never cached, so only the sweep can empty the cache
        for _ in 1..PRUNE_INTERVAL - 1 {
            orchestrator.acquire(&DataRequest::risk_free_rate()).await;
        }
        assert_eq!(orchestrator.cache().len(), 1);

        orchestrator.acquire(&DataRequest::risk_free_rate()).await;
        assert!(orchestrator.cache().is_empty());
        assert_eq!(orchestrator.lock_observed().len(), 0);
    }

    #[tokio::test]
    async fn test_diagnostics_report_per_provider() {
        let a = Arc::new(ScriptedAdapter::new("A").respond(Err(client_error("A"))));
        let b = Arc::new(ScriptedAdapter::new("B").respond(Ok(quote("B"))));
        let orchestrator = builder(clock())
            .adapter(a)
            .adapter(b)
            .disable("B")
            .priority(DataRequestKind::Quote, &["A", "B"])
            .build();

        orchestrator.acquire(&DataRequest::quote("SPY")).await;
        let report = orchestrator.diagnostics().await;

        assert_eq!(report.total_acquisitions, 1);
        assert_eq!(report.default_count, 1);
        assert_eq!(report.providers.len(), 2);

        let a = &report.providers[0];
        assert_eq!(a.id, "A");
        assert!(a.enabled && a.connected);
        assert_eq!(a.calls_today, 1);
        assert_eq!(a.failures.total, 1);
        assert_eq!(a.failures.by_operation.get("quote"), Some(&1));
        assert_eq!(a.failures.by_http_status.get("401"), Some(&1));

        let b = &report.providers[1];
        assert!(!b.enabled && !b.connected);
        assert_eq!(b.calls_today, 0);
    }
}
