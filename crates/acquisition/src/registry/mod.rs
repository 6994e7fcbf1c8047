//! Fallback orchestration.
//!
//! - [`DataSourceOrchestrator`] walks the priority chain for a request kind
//! - [`RateLimitLedger`] spaces calls and enforces per-minute and daily quotas
//! - [`RetryPolicy`] maps an error category to wait, advance or stop
//! - [`FailureRegistry`] keeps bounded failure history and fallback counters
//! - [`PayloadValidator`] rejects structurally broken provider payloads
//!
//! Nothing here performs I/O itself; adapters, the key-value store and the
//! computation bridge are injected.

mod failure_registry;
mod options;
mod orchestrator;
mod rate_limit_ledger;
mod retry_policy;
mod skip_reason;
mod validator;

pub use failure_registry::{
    FailureContext, FailureRegistry, FailureRegistryConfig, FailureSummary, FallbackStats,
    ProviderFailureSummary,
};
pub use options::{AcquireOptions, WaitInterrupted};
pub use orchestrator::{Acquisition, DataSourceOrchestrator, OrchestratorBuilder};
pub use rate_limit_ledger::{RateLimitCounter, RateLimitLedger};
pub use retry_policy::{NetworkRetry, RetryDecision, RetryPolicy, RetrySettings};
pub use skip_reason::{BackoffWait, FetchDiagnostics, ProviderAttempt, SkipReason};
pub use validator::{PayloadValidator, ValidationIssue, ValidationSeverity, ValidatorConfig};
