//! Options Desk Acquisition Crate
//!
//! Resilient market and options data acquisition with ordered provider
//! fallback, local computation and documented defaults.
//!
//! # Overview
//!
//! Every request names a [`DataRequestKind`]. The orchestrator:
//! - Serves a fresh cached value when one exists
//! - Walks the configured provider chain for the kind, honoring per-provider
//!   rate limits, daily caps, timeouts and the retry policy
//! - Falls back to local Black-Scholes computation for greeks, implied and
//!   historical volatility
//! - Returns a documented default when nothing else produced a value
//!
//! # Architecture
//!
//! ```text
//! +------------------+     +------------------+
//! |   DataRequest    | --> |    DataCache     |  (per-kind TTL)
//! +------------------+     +------------------+
//!                                  | miss
//!                                  v
//!                          +------------------+
//!                          | Orchestrator     |  (priority chain, ledger, retry)
//!                          +------------------+
//!                                  |
//!                                  v
//!                          +------------------+
//!                          | ProviderAdapter  |  (IBKR, Tradier, Finnhub, ...)
//!                          +------------------+
//!                                  | exhausted
//!                                  v
//!                          +------------------+
//!                          | Bridge / Default |  (self-calculated, default)
//!                          +------------------+
//! ```
//!
//! # Core Types
//!
//! - [`DataSourceOrchestrator`] - Fallback walk and diagnostics
//! - [`ProviderAdapter`] - One external data source
//! - [`ProviderResult`] - Success or typed failure, with the [`ChosenSource`]
//! - [`FailureRegistry`] - Bounded failure and fallback history
//! - [`RateLimitLedger`] - Persisted call counters
//! - [`KeyValueStore`] - Persistence seam for counters, history and cache
//! - [`AcquisitionConfig`] - Priorities, TTLs, retry and per-provider overrides

pub mod bridge;
pub mod cache;
pub mod clock;
pub mod config;
pub mod diagnostics;
pub mod errors;
pub mod models;
pub mod provider;
pub mod redact;
pub mod registry;
pub mod storage;

pub use bridge::{BlackScholesBridge, ComputationBridge, ComputationError, PricingInputs};
pub use cache::{CacheEntry, DataCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AcquisitionConfig, DefaultValues, ProviderCredentials, ProviderSettings};
pub use diagnostics::{DiagnosticsReport, ProviderHealth};
pub use errors::{AcquisitionError, ErrorKind, StatusClass};
pub use models::{
    ChosenSource, DataPayload, DataRequest, DataRequestKind, FailureRecord, FallbackRecord,
    ProviderId, ProviderResult,
};
pub use provider::{ProviderAdapter, ProviderCapabilities, RateLimit};
pub use registry::{
    AcquireOptions, Acquisition, DataSourceOrchestrator, FailureRegistry, OrchestratorBuilder,
    RateLimitLedger, RetryPolicy,
};
pub use storage::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore, StoreError};
