//! Skip reason tracking for the provider walk.

use std::time::Duration;

use serde::Serialize;

use crate::errors::StatusClass;
use crate::models::ProviderId;

/// Why a provider was skipped during an acquisition.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// Listed in the priority chain but no adapter is registered under the id.
    UnknownProvider,

    /// Adapter is disabled (missing credential or turned off in config).
    Disabled,

    /// Adapter capabilities do not include the requested kind.
    KindNotSupported,

    /// Daily cap reached; not retried again in this acquisition.
    DailyCapReached,

    /// Deadline or cancellation fired before the attempt could start.
    Interrupted { detail: String },

    /// The next slot or backoff would end after the deadline; later
    /// providers are still tried.
    WaitExceedsDeadline,
}

/// Record of a single provider attempt during an acquisition.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderAttempt {
    pub provider_id: ProviderId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_class: Option<StatusClass>,
    pub success: bool,
}

/// One backoff sleep taken before retrying the same provider.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffWait {
    pub provider_id: ProviderId,
    pub status_class: StatusClass,
    /// 0-based retry index the wait preceded
    pub attempt: u32,
    #[serde(with = "duration_secs")]
    pub wait: Duration,
}

/// Detailed trace of one acquisition.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchDiagnostics {
    pub attempts: Vec<ProviderAttempt>,
    pub backoffs: Vec<BackoffWait>,
}

impl FetchDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_skip(&mut self, provider_id: ProviderId, reason: SkipReason) {
        self.attempts.push(ProviderAttempt {
            provider_id,
            skipped: Some(reason),
            error: None,
            status_class: None,
            success: false,
        });
    }

    pub fn record_error(&mut self, provider_id: ProviderId, class: StatusClass, error: String) {
        self.attempts.push(ProviderAttempt {
            provider_id,
            skipped: None,
            error: Some(error),
            status_class: Some(class),
            success: false,
        });
    }

    pub fn record_success(&mut self, provider_id: ProviderId) {
        self.attempts.push(ProviderAttempt {
            provider_id,
            skipped: None,
            error: None,
            status_class: None,
            success: true,
        });
    }

    pub fn record_backoff(
        &mut self,
        provider_id: ProviderId,
        status_class: StatusClass,
        attempt: u32,
        wait: Duration,
    ) {
        self.backoffs.push(BackoffWait {
            provider_id,
            status_class,
            attempt,
            wait,
        });
    }

    /// Summary for logging/debugging.
    pub fn summary(&self) -> String {
        self.attempts
            .iter()
            .map(|a| {
                if a.success {
                    format!("{}: SUCCESS", a.provider_id)
                } else if let Some(skip) = &a.skipped {
                    format!("{}: SKIPPED ({:?})", a.provider_id, skip)
                } else if let Some(err) = &a.error {
                    format!("{}: ERROR ({})", a.provider_id, err)
                } else {
                    format!("{}: UNKNOWN", a.provider_id)
                }
            })
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    /// Check if any provider succeeded.
    pub fn has_success(&self) -> bool {
        self.attempts.iter().any(|a| a.success)
    }

    /// Number of calls actually made to a provider.
    pub fn calls_to(&self, provider_id: &str) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.provider_id == provider_id && a.skipped.is_none())
            .count()
    }

    /// Get all skip reasons.
    pub fn skip_reasons(&self) -> Vec<(&ProviderId, &SkipReason)> {
        self.attempts
            .iter()
            .filter_map(|a| a.skipped.as_ref().map(|s| (&a.provider_id, s)))
            .collect()
    }

    /// Get all errors.
    pub fn errors(&self) -> Vec<(&ProviderId, &str)> {
        self.attempts
            .iter()
            .filter_map(|a| a.error.as_ref().map(|e| (&a.provider_id, e.as_str())))
            .collect()
    }

    /// Total time spent in backoff sleeps.
    pub fn total_backoff(&self) -> Duration {
        self.backoffs.iter().map(|b| b.wait).sum()
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }
}
