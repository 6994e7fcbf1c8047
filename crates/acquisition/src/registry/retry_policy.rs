//! Retry decisions per failure class.
//!
//! | Class | Retry | Wait before retry `i` |
//! |-------|-------|------------------------|
//! | `RateLimited` | while `i < max` | `rate_limit_base * 2^i` |
//! | `ServerError` | while `i < max` | `server_error_delay` |
//! | `NetworkError` / `Timeout` | like `ServerError`, or never | `server_error_delay` |
//! | `ClientError` / `DataUnavailable` | never | zero |
//!
//! `max` counts retries after the first failure, so `max = 2` allows three
//! calls to the same provider.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{AcquisitionError, StatusClass};

/// Cap on the exponent so a misconfigured retry count cannot overflow.
const MAX_BACKOFF_SHIFT: u32 = 16;

/// Outcome of a single retry decision.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryDecision {
    pub retry: bool,
    pub wait: Duration,
}

impl RetryDecision {
    pub const GIVE_UP: RetryDecision = RetryDecision {
        retry: false,
        wait: Duration::ZERO,
    };

    fn after(wait: Duration) -> Self {
        Self { retry: true, wait }
    }
}

/// How transport failures are retried.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkRetry {
    /// Same constant wait as a server error.
    #[default]
    LikeServerError,
    /// Move straight to the next provider.
    Never,
}

/// Retry knobs as they appear in configuration files.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetrySettings {
    pub rate_limit_base_secs: f64,
    pub server_error_delay_secs: f64,
    pub max_rate_limit_retries: u32,
    pub max_server_error_retries: u32,
    pub max_network_retries: u32,
    pub network_as_server_error: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            rate_limit_base_secs: 30.0,
            server_error_delay_secs: 10.0,
            max_rate_limit_retries: 2,
            max_server_error_retries: 2,
            max_network_retries: 1,
            network_as_server_error: true,
        }
    }
}

/// Retry policy for one provider.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub rate_limit_base: Duration,
    pub server_error_delay: Duration,
    pub network: NetworkRetry,
    pub max_rate_limit_retries: u32,
    pub max_server_error_retries: u32,
    pub max_network_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        let secs = |v: f64| Duration::from_secs_f64(v.max(0.0));
        Self {
            rate_limit_base: secs(settings.rate_limit_base_secs),
            server_error_delay: secs(settings.server_error_delay_secs),
            network: if settings.network_as_server_error {
                NetworkRetry::LikeServerError
            } else {
                NetworkRetry::Never
            },
            max_rate_limit_retries: settings.max_rate_limit_retries,
            max_server_error_retries: settings.max_server_error_retries,
            max_network_retries: settings.max_network_retries,
        }
    }
}

impl RetryPolicy {
    /// Decide whether to retry after a failure of `class`.
    ///
    /// `attempt_index` is the number of retries already made for this
    /// provider in the current acquisition.
    pub fn decide(&self, class: StatusClass, attempt_index: u32, max_attempts: u32) -> RetryDecision {
        if attempt_index >= max_attempts {
            return RetryDecision::GIVE_UP;
        }
        match class {
            StatusClass::RateLimited => {
                let factor = 1u32 << attempt_index.min(MAX_BACKOFF_SHIFT);
                RetryDecision::after(self.rate_limit_base.saturating_mul(factor))
            }
            StatusClass::ServerError => RetryDecision::after(self.server_error_delay),
            StatusClass::NetworkError | StatusClass::Timeout => match self.network {
                NetworkRetry::LikeServerError => RetryDecision::after(self.server_error_delay),
                NetworkRetry::Never => RetryDecision::GIVE_UP,
            },
            StatusClass::ClientError | StatusClass::DataUnavailable => RetryDecision::GIVE_UP,
        }
    }

    /// Configured retry budget for a class.
    pub fn max_attempts_for(&self, class: StatusClass) -> u32 {
        match class {
            StatusClass::RateLimited => self.max_rate_limit_retries,
            StatusClass::ServerError => self.max_server_error_retries,
            StatusClass::NetworkError | StatusClass::Timeout => self.max_network_retries,
            StatusClass::ClientError | StatusClass::DataUnavailable => 0,
        }
    }

    /// Decision for an adapter error using the configured budget.
    ///
    /// A `Retry-After` sent by the provider lengthens the wait but never
    /// shortens it.
    pub fn decide_for(&self, error: &AcquisitionError, attempt_index: u32) -> RetryDecision {
        let class = error.status_class();
        let mut decision = self.decide(class, attempt_index, self.max_attempts_for(class));
        if decision.retry {
            if let Some(requested) = error.retry_after() {
                decision.wait = decision.wait.max(requested);
            }
        }
        decision
    }
}
