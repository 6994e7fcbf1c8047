//! Provider capabilities and rate limiting configuration.
//!
//! This module defines structures for describing what a provider adapter
//! can do and how often it may be called.

use std::time::Duration;

use crate::models::DataRequestKind;

/// Describes the capabilities of a provider adapter.
///
/// The orchestrator skips a provider listed in a priority chain when its
/// capabilities do not include the requested kind.
#[derive(Clone, Debug)]
pub struct ProviderCapabilities {
    /// Request kinds this adapter can serve.
    pub kinds: &'static [DataRequestKind],
}

impl ProviderCapabilities {
    pub fn supports(&self, kind: DataRequestKind) -> bool {
        self.kinds.contains(&kind)
    }
}

/// Rate limiting configuration for a provider.
///
/// Mirrors the provider's published quota so we stop before the provider
/// starts rejecting us. All three limits are enforced independently.
#[derive(Clone, Debug, PartialEq)]
pub struct RateLimit {
    /// Minimum spacing between two consecutive calls.
    pub min_interval: Duration,

    /// Sub-daily cap over a fixed one-minute window.
    pub requests_per_minute: Option<u32>,

    /// Hard cap per UTC calendar day.
    pub daily_cap: Option<u32>,
}

impl RateLimit {
    pub fn unlimited() -> Self {
        Self {
            min_interval: Duration::ZERO,
            requests_per_minute: None,
            daily_cap: None,
        }
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(250),
            requests_per_minute: Some(60),
            daily_cap: None,
        }
    }
}
