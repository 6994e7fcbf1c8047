use std::fmt;

use serde::{Deserialize, Serialize};

/// Failure classification consumed by the retry policy.
///
/// Every adapter error maps onto exactly one class, which decides whether the
/// same provider is tried again and how long to wait first.
///
/// # Behavior Summary
///
/// | Class | Retried on same provider? | Wait curve |
/// |-------|---------------------------|------------|
/// | `RateLimited` | Yes, up to the provider's limit | Exponential (`base * 2^attempt`) |
/// | `ServerError` | Yes, up to the provider's limit | Constant |
/// | `NetworkError` / `Timeout` | Configurable (default: like `ServerError`) | Constant |
/// | `ClientError` | No | None |
/// | `DataUnavailable` | No | None |
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusClass {
    /// HTTP 429 or a provider-specific quota signal.
    RateLimited,

    /// HTTP 5xx.
    ServerError,

    /// HTTP 4xx other than the rate-limit status. Never retried.
    ClientError,

    /// Connection refused, reset, DNS failure and similar transport errors.
    NetworkError,

    /// The per-provider network timeout elapsed.
    Timeout,

    /// The provider answered, but the payload was empty or invalid.
    /// Escalates to the next provider without retry.
    DataUnavailable,
}

impl StatusClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::ServerError => "server_error",
            Self::ClientError => "client_error",
            Self::NetworkError => "network_error",
            Self::Timeout => "timeout",
            Self::DataUnavailable => "data_unavailable",
        }
    }

    /// Transient classes are retried locally before moving to the next provider.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::ServerError | Self::NetworkError | Self::Timeout
        )
    }
}

impl fmt::Display for StatusClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error kind stored in failure records and provider results.
///
/// A superset of [`StatusClass`]: it also names the two terminal states that
/// never reach the retry policy.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimited,
    ServerError,
    ClientError,
    NetworkError,
    Timeout,
    DataUnavailable,
    ComputationFailure,
    AllSourcesExhausted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::ServerError => "server_error",
            Self::ClientError => "client_error",
            Self::NetworkError => "network_error",
            Self::Timeout => "timeout",
            Self::DataUnavailable => "data_unavailable",
            Self::ComputationFailure => "computation_failure",
            Self::AllSourcesExhausted => "all_sources_exhausted",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<StatusClass> for ErrorKind {
    fn from(class: StatusClass) -> Self {
        match class {
            StatusClass::RateLimited => Self::RateLimited,
            StatusClass::ServerError => Self::ServerError,
            StatusClass::ClientError => Self::ClientError,
            StatusClass::NetworkError => Self::NetworkError,
            StatusClass::Timeout => Self::Timeout,
            StatusClass::DataUnavailable => Self::DataUnavailable,
        }
    }
}
