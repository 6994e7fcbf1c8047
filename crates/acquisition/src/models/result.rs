use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::calendar::{DividendEvent, EarningsEvent, RiskFreeRate, Volatility};
use super::options::{Greeks, OptionChain};
use super::quote::Quote;
use super::request::DataRequestKind;
use super::types::ProviderId;
use crate::errors::{AcquisitionError, ErrorKind};

/// Label recorded when the bridge produced the value.
pub const SELF_CALCULATED: &str = "self-calculated";

/// Label recorded when a documented default was returned.
pub const DEFAULT_SOURCE: &str = "default";

/// The datum handed back to callers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DataPayload {
    Quote(Quote),
    Historical(Vec<Quote>),
    OptionChain(OptionChain),
    Greeks(Greeks),
    EarningsCalendar(Vec<EarningsEvent>),
    DividendCalendar(Vec<DividendEvent>),
    RiskFreeRate(RiskFreeRate),
    Volatility(Volatility),
    /// Explicit "no value" default for kinds without a numeric fallback.
    Unavailable { reason: String },
}

impl DataPayload {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Whether the payload carries at least one usable item.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Historical(bars) => bars.is_empty(),
            Self::OptionChain(chain) => chain.contracts.is_empty(),
            Self::EarningsCalendar(events) => events.is_empty(),
            Self::DividendCalendar(events) => events.is_empty(),
            Self::Unavailable { .. } => true,
            _ => false,
        }
    }
}

/// Where a returned value came from.
///
/// Serialized as a plain string: the provider id, `"self-calculated"` or
/// `"default"`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ChosenSource {
    Provider(ProviderId),
    SelfCalculated,
    Default,
}

impl ChosenSource {
    pub fn provider(id: impl Into<ProviderId>) -> Self {
        Self::Provider(id.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Provider(id) => id.as_ref(),
            Self::SelfCalculated => SELF_CALCULATED,
            Self::Default => DEFAULT_SOURCE,
        }
    }

    pub fn is_provider(&self) -> bool {
        matches!(self, Self::Provider(_))
    }
}

impl fmt::Display for ChosenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ChosenSource> for String {
    fn from(source: ChosenSource) -> Self {
        source.as_str().to_string()
    }
}

impl From<String> for ChosenSource {
    fn from(value: String) -> Self {
        match value.as_str() {
            SELF_CALCULATED => Self::SelfCalculated,
            DEFAULT_SOURCE => Self::Default,
            _ => Self::Provider(Cow::Owned(value)),
        }
    }
}

/// Outcome of one provider attempt or of a whole acquisition.
///
/// An acquisition always ends in `Success`: when every provider and the
/// bridge fail, the payload is the configured default and `source` is
/// [`ChosenSource::Default`]. `Failure` describes a single failed attempt,
/// for callers that drive one adapter directly; the orchestrator records
/// those in its diagnostics and failure registry instead.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProviderResult {
    #[serde(rename_all = "camelCase")]
    Success {
        payload: DataPayload,
        source: ChosenSource,
        fetched_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Failure {
        kind: ErrorKind,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        http_status: Option<u16>,
        retryable: bool,
    },
}

impl ProviderResult {
    pub fn success(payload: DataPayload, source: ChosenSource, fetched_at: DateTime<Utc>) -> Self {
        Self::Success {
            payload,
            source,
            fetched_at,
        }
    }

    /// Failure built from an error. The message is expected to be redacted
    /// already when it may contain request details.
    pub fn failure(error: &AcquisitionError, message: String) -> Self {
        Self::Failure {
            kind: error.error_kind(),
            message,
            http_status: error.http_status(),
            retryable: error.is_retryable(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn payload(&self) -> Option<&DataPayload> {
        match self {
            Self::Success { payload, .. } => Some(payload),
            Self::Failure { .. } => None,
        }
    }

    pub fn source(&self) -> Option<&ChosenSource> {
        match self {
            Self::Success { source, .. } => Some(source),
            Self::Failure { .. } => None,
        }
    }
}

/// Which source ultimately served one acquisition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackRecord {
    pub kind: DataRequestKind,
    pub chosen_source: ChosenSource,
    pub timestamp: DateTime<Utc>,
}

impl FallbackRecord {
    pub fn new(kind: DataRequestKind, chosen_source: ChosenSource, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            chosen_source,
            timestamp,
        }
    }
}

/// A sanitized record of one failed provider attempt.
///
/// Built only through the failure registry, which redacts credentials from
/// the URL, parameters and message before the record exists.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub provider_id: String,
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sanitized_url: Option<String>,
    pub sanitized_params: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    pub error_kind: ErrorKind,
    /// Redacted error chain, outermost first
    pub stack_summary: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VolatilityMethod;

    #[test]
    fn test_chosen_source_serializes_as_label() {
        let json = serde_json::to_string(&ChosenSource::SelfCalculated).unwrap();
        assert_eq!(json, "\"self-calculated\"");

        let json = serde_json::to_string(&ChosenSource::provider("TRADIER")).unwrap();
        assert_eq!(json, "\"TRADIER\"");

        let parsed: ChosenSource = serde_json::from_str("\"default\"").unwrap();
        assert_eq!(parsed, ChosenSource::Default);

        let parsed: ChosenSource = serde_json::from_str("\"FRED\"").unwrap();
        assert_eq!(parsed, ChosenSource::provider("FRED"));
    }

    #[test]
    fn test_payload_tagging() {
        let payload = DataPayload::Volatility(Volatility {
            value: 0.2,
            method: VolatilityMethod::Historical,
            window: Some(20),
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "volatility");
        assert_eq!(json["data"]["method"], "historical");

        let unavailable = DataPayload::Unavailable {
            reason: "no source".to_string(),
        };
        assert!(unavailable.is_unavailable());
        assert!(unavailable.is_empty());
    }

    #[test]
    fn test_failure_result_from_error() {
        let error = AcquisitionError::ServerError {
            provider: "TRADIER".to_string(),
            status: 502,
            message: "bad gateway".to_string(),
        };
        let result = ProviderResult::failure(&error, error.to_string());
        match result {
            ProviderResult::Failure {
                kind,
                http_status,
                retryable,
                ..
            } => {
                assert_eq!(kind, ErrorKind::ServerError);
                assert_eq!(http_status, Some(502));
                assert!(retryable);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
