//! FRED (Federal Reserve Economic Data) risk-free rate provider.
//!
//! Reads the latest observation of a Treasury constant-maturity series
//! (DGS3MO by default) from /fred/series/observations. FRED publishes
//! percentages and marks missing days with ".", so the newest numeric value
//! is taken and divided by 100.
//!
//! The API key travels as the `api_key` query parameter; request URLs are
//! only ever logged or recorded through the redactor.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::errors::AcquisitionError;
use crate::models::{DataRequestKind, RiskFreeRate};
use crate::provider::http::{build_client, parse_json, send};
use crate::provider::{ProviderAdapter, ProviderCapabilities, RateLimit};

const BASE_URL: &str = "https://api.stlouisfed.org/fred";
const PROVIDER_ID: &str = "FRED";

/// 3-month Treasury bill, constant maturity.
pub const DEFAULT_SERIES: &str = "DGS3MO";

/// Observations requested per call; covers holidays and late publication.
const LOOKBACK_OBSERVATIONS: &str = "10";

#[derive(Debug, Deserialize)]
struct ObservationsResponse {
    #[serde(default)]
    observations: Vec<Observation>,
}

#[derive(Debug, Deserialize)]
struct Observation {
    date: String,
    value: String,
}

/// Newest numeric observation as a decimal fraction.
pub(crate) fn parse_latest_rate(series: &str, body: &str) -> Result<RiskFreeRate, AcquisitionError> {
    let response: ObservationsResponse = parse_json(PROVIDER_ID, body)?;

    let latest = response
        .observations
        .iter()
        .filter(|o| o.value != ".")
        .filter_map(|o| {
            let value = o.value.trim().parse::<f64>().ok()?;
            let date = NaiveDate::parse_from_str(&o.date, "%Y-%m-%d").ok()?;
            Some((date, value))
        })
        .max_by_key(|(date, _)| *date);

    let (as_of, percent) = latest.ok_or_else(|| AcquisitionError::DataUnavailable {
        provider: PROVIDER_ID.to_string(),
        message: format!("No numeric observations for {}", series),
    })?;

    Ok(RiskFreeRate {
        rate: percent / 100.0,
        series: series.to_string(),
        as_of: Some(as_of),
    })
}

/// FRED provider.
pub struct FredProvider {
    client: Client,
    api_key: Option<String>,
    series: String,
}

impl FredProvider {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: build_client(Duration::from_secs(10)),
            api_key: api_key
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty()),
            series: DEFAULT_SERIES.to_string(),
        }
    }

    /// Use a different series, e.g. DGS1 or DTB3.
    pub fn with_series(mut self, series: impl Into<String>) -> Self {
        self.series = series.into();
        self
    }
}

#[async_trait]
impl ProviderAdapter for FredProvider {
    fn id(&self) -> &'static str {
        PROVIDER_ID
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            kinds: &[DataRequestKind::RiskFreeRate],
        }
    }

    fn rate_limit(&self) -> RateLimit {
        RateLimit {
            min_interval: Duration::from_millis(500),
            requests_per_minute: Some(120),
            daily_cap: None,
        }
    }

    fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    async fn fetch_risk_free_rate(&self) -> Result<RiskFreeRate, AcquisitionError> {
        let request = self
            .client
            .get(format!("{}/series/observations", BASE_URL))
            .query(&[
                ("series_id", self.series.as_str()),
                ("api_key", self.api_key.as_deref().unwrap_or_default()),
                ("file_type", "json"),
                ("sort_order", "desc"),
                ("limit", LOOKBACK_OBSERVATIONS),
            ]);
        let text = send(&self.client, PROVIDER_ID, request).await?;
        let rate = parse_latest_rate(&self.series, &text)?;
        debug!("FRED: {} = {} as of {:?}", rate.series, rate.rate, rate.as_of);
        Ok(rate)
    }
}
