//! Error types and failure classification for the acquisition layer.
//!
//! This module provides:
//! - [`AcquisitionError`]: The error enum returned by adapters, stores and the bridge
//! - [`StatusClass`]: The classification fed to the retry policy
//! - [`ErrorKind`]: The classification stored in failure records

mod status;

pub use status::{ErrorKind, StatusClass};

use std::time::Duration;

use thiserror::Error;

use crate::bridge::ComputationError;
use crate::storage::StoreError;

/// Errors that can occur while acquiring data.
///
/// Adapters translate their transport-specific failures into these variants.
/// The orchestrator never hands one of these to its caller; it classifies each
/// one via [`status_class`](Self::status_class) and degrades instead.
#[derive(Error, Debug)]
pub enum AcquisitionError {
    /// HTTP 429 or an equivalent quota signal from the provider.
    #[error("Rate limited: {provider}")]
    RateLimited {
        provider: String,
        /// Delay the provider asked for, when it sent one.
        retry_after: Option<Duration>,
    },

    /// The provider answered with a 5xx status.
    #[error("Server error: {provider} - HTTP {status} {message}")]
    ServerError {
        provider: String,
        status: u16,
        message: String,
    },

    /// The provider rejected the request (4xx other than 429).
    /// Retrying the same request will not help.
    #[error("Client error: {provider} - HTTP {status} {message}")]
    ClientError {
        provider: String,
        status: u16,
        message: String,
    },

    /// Transport failure before a status was received.
    #[error("Network error: {provider} - {message}")]
    Network { provider: String, message: String },

    /// The per-provider network timeout elapsed.
    #[error("Timeout: {provider}")]
    Timeout { provider: String },

    /// The provider answered but the payload was empty or failed validation.
    #[error("Data unavailable: {provider} - {message}")]
    DataUnavailable { provider: String, message: String },

    /// The adapter does not implement this capability.
    #[error("Operation '{operation}' not supported by provider '{provider}'")]
    NotSupported { operation: String, provider: String },

    /// The computation bridge could not produce a value.
    #[error("Computation failed: {0}")]
    Computation(#[from] ComputationError),

    /// Every provider and the bridge were tried. Resolved into a default
    /// value by the orchestrator, never surfaced to callers.
    #[error("All sources exhausted for {kind}")]
    AllSourcesExhausted { kind: String },

    /// Persistent storage failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AcquisitionError {
    /// Returns the retry classification for this error.
    ///
    /// # Examples
    ///
    /// ```
    /// use optionsdesk_acquisition::errors::{AcquisitionError, StatusClass};
    ///
    /// let error = AcquisitionError::RateLimited { provider: "TRADIER".to_string(), retry_after: None };
    /// assert_eq!(error.status_class(), StatusClass::RateLimited);
    ///
    /// let error = AcquisitionError::ClientError {
    ///     provider: "FINNHUB".to_string(),
    ///     status: 404,
    ///     message: "not found".to_string(),
    /// };
    /// assert_eq!(error.status_class(), StatusClass::ClientError);
    /// ```
    pub fn status_class(&self) -> StatusClass {
        match self {
            Self::RateLimited { .. } => StatusClass::RateLimited,
            Self::ServerError { .. } => StatusClass::ServerError,
            Self::Network { .. } => StatusClass::NetworkError,
            Self::Timeout { .. } => StatusClass::Timeout,
            Self::DataUnavailable { .. } | Self::AllSourcesExhausted { .. } => {
                StatusClass::DataUnavailable
            }

            // Retrying cannot change the outcome of any of these
            Self::ClientError { .. }
            | Self::NotSupported { .. }
            | Self::Computation(_)
            | Self::Storage(_)
            | Self::Config(_) => StatusClass::ClientError,
        }
    }

    /// Kind recorded in failure records and failed provider results.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            Self::Computation(_) => ErrorKind::ComputationFailure,
            Self::AllSourcesExhausted { .. } => ErrorKind::AllSourcesExhausted,
            other => other.status_class().into(),
        }
    }

    /// HTTP status carried by the error, if the provider sent one.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::RateLimited { .. } => Some(429),
            Self::ServerError { status, .. } | Self::ClientError { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.status_class().is_transient()
    }

    /// Delay requested by the provider, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Provider that produced the error, if it came from an adapter.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::RateLimited { provider, .. }
            | Self::ServerError { provider, .. }
            | Self::ClientError { provider, .. }
            | Self::Network { provider, .. }
            | Self::Timeout { provider }
            | Self::DataUnavailable { provider, .. }
            | Self::NotSupported { provider, .. } => Some(provider),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_classification() {
        let error = AcquisitionError::RateLimited {
            provider: "TRADIER".to_string(),
            retry_after: Some(Duration::from_secs(5)),
        };
        assert_eq!(error.status_class(), StatusClass::RateLimited);
        assert_eq!(error.http_status(), Some(429));
        assert_eq!(error.retry_after(), Some(Duration::from_secs(5)));
        assert!(error.is_retryable());
    }

    #[test]
    fn test_server_error_is_retryable() {
        let error = AcquisitionError::ServerError {
            provider: "FINNHUB".to_string(),
            status: 503,
            message: "Service Unavailable".to_string(),
        };
        assert_eq!(error.status_class(), StatusClass::ServerError);
        assert_eq!(error.http_status(), Some(503));
        assert!(error.is_retryable());
    }

    #[test]
    fn test_client_error_never_retries() {
        let error = AcquisitionError::ClientError {
            provider: "FMP".to_string(),
            status: 401,
            message: "Invalid API key".to_string(),
        };
        assert_eq!(error.status_class(), StatusClass::ClientError);
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_network_and_timeout_are_transient() {
        let network = AcquisitionError::Network {
            provider: "IBKR".to_string(),
            message: "connection refused".to_string(),
        };
        let timeout = AcquisitionError::Timeout {
            provider: "IBKR".to_string(),
        };
        assert_eq!(network.status_class(), StatusClass::NetworkError);
        assert_eq!(timeout.status_class(), StatusClass::Timeout);
        assert!(network.is_retryable());
        assert!(timeout.is_retryable());
        assert_eq!(network.http_status(), None);
    }

    #[test]
    fn test_data_unavailable_escalates_without_retry() {
        let error = AcquisitionError::DataUnavailable {
            provider: "YAHOO_SCRAPE".to_string(),
            message: "empty page".to_string(),
        };
        assert_eq!(error.status_class(), StatusClass::DataUnavailable);
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_not_supported_is_client_error() {
        let error = AcquisitionError::NotSupported {
            operation: "fetch_option_chain".to_string(),
            provider: "FRED".to_string(),
        };
        assert_eq!(error.status_class(), StatusClass::ClientError);
        assert_eq!(error.provider(), Some("FRED"));
    }

    #[test]
    fn test_error_kind_for_terminal_states() {
        let error = AcquisitionError::Computation(ComputationError::NonConvergent { iterations: 100 });
        assert_eq!(error.error_kind(), ErrorKind::ComputationFailure);

        let error = AcquisitionError::AllSourcesExhausted {
            kind: "quote".to_string(),
        };
        assert_eq!(error.error_kind(), ErrorKind::AllSourcesExhausted);
    }

    #[test]
    fn test_error_display() {
        let error = AcquisitionError::RateLimited {
            provider: "TRADIER".to_string(),
            retry_after: None,
        };
        assert_eq!(format!("{}", error), "Rate limited: TRADIER");

        let error = AcquisitionError::ServerError {
            provider: "FINNHUB".to_string(),
            status: 502,
            message: "Bad Gateway".to_string(),
        };
        assert_eq!(
            format!("{}", error),
            "Server error: FINNHUB - HTTP 502 Bad Gateway"
        );
    }
}
