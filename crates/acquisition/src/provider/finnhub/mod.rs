//! Finnhub provider implementation.
//!
//! This module provides data from the Finnhub API:
//! - Latest equity quotes via /quote
//! - Daily candles via /stock/candle
//! - Earnings calendar via /calendar/earnings
//!
//! Finnhub free tier is limited to 60 API calls per minute.
//! API documentation: https://finnhub.io/docs/api

use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::errors::AcquisitionError;
use crate::models::{DataRequestKind, DateRange, EarningsEvent, Quote};
use crate::provider::http::{build_client, parse_json, send};
use crate::provider::{ProviderAdapter, ProviderCapabilities, RateLimit};

const BASE_URL: &str = "https://finnhub.io/api/v1";
const PROVIDER_ID: &str = "FINNHUB";

// ============================================================================
// API Response Structures
// ============================================================================

/// Response from /quote endpoint
#[derive(Debug, Deserialize)]
struct QuoteResponse {
    /// Current price
    c: Option<f64>,
    /// High price of the day
    h: Option<f64>,
    /// Low price of the day
    l: Option<f64>,
    /// Open price of the day
    o: Option<f64>,
    /// Timestamp (Unix)
    t: Option<i64>,
}

/// Response from /stock/candle endpoint
#[derive(Debug, Deserialize)]
struct CandleResponse {
    /// Status: "ok" or "no_data"
    s: String,
    #[serde(default)]
    c: Vec<f64>,
    #[serde(default)]
    h: Vec<f64>,
    #[serde(default)]
    l: Vec<f64>,
    #[serde(default)]
    o: Vec<f64>,
    #[serde(default)]
    v: Vec<f64>,
    #[serde(default)]
    t: Vec<i64>,
}

/// Response from /calendar/earnings endpoint
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EarningsResponse {
    #[serde(default)]
    earnings_calendar: Vec<EarningsItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EarningsItem {
    symbol: String,
    date: String,
    eps_estimate: Option<f64>,
    eps_actual: Option<f64>,
    revenue_estimate: Option<f64>,
    hour: Option<String>,
}

// ============================================================================
// Parsing
// ============================================================================

fn unavailable(message: String) -> AcquisitionError {
    AcquisitionError::DataUnavailable {
        provider: PROVIDER_ID.to_string(),
        message,
    }
}

pub(crate) fn parse_quote(symbol: &str, body: &str) -> Result<Quote, AcquisitionError> {
    let response: QuoteResponse = parse_json(PROVIDER_ID, body)?;

    let close = response
        .c
        .ok_or_else(|| unavailable(format!("No quote data for symbol: {}", symbol)))?;

    // Finnhub returns 0 for unknown symbols instead of an error
    if close == 0.0 && response.o.unwrap_or(0.0) == 0.0 {
        return Err(unavailable(format!(
            "Symbol not found or no trading data: {}",
            symbol
        )));
    }

    let timestamp = response
        .t
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
        .unwrap_or_else(Utc::now);

    let close = Decimal::try_from(close)
        .map_err(|_| unavailable(format!("Invalid close price: {}", close)))?;

    let mut quote = Quote::new(symbol, timestamp, close, "USD", PROVIDER_ID);
    quote.open = response.o.and_then(|v| Decimal::try_from(v).ok());
    quote.high = response.h.and_then(|v| Decimal::try_from(v).ok());
    quote.low = response.l.and_then(|v| Decimal::try_from(v).ok());
    Ok(quote)
}

pub(crate) fn parse_candles(symbol: &str, body: &str) -> Result<Vec<Quote>, AcquisitionError> {
    let response: CandleResponse = parse_json(PROVIDER_ID, body)?;

    if response.s == "no_data" {
        return Err(unavailable(format!("No candles for {}", symbol)));
    }
    if response.s != "ok" {
        return Err(unavailable(format!(
            "Unexpected candle status: {}",
            response.s
        )));
    }

    let len = response.t.len();
    if response.c.len() != len
        || response.o.len() != len
        || response.h.len() != len
        || response.l.len() != len
    {
        return Err(unavailable(
            "Mismatched array lengths in candle response".to_string(),
        ));
    }

    let mut quotes = Vec::with_capacity(len);
    for i in 0..len {
        let timestamp = match Utc.timestamp_opt(response.t[i], 0).single() {
            Some(ts) => ts,
            None => {
                warn!("Invalid timestamp at index {}: {}", i, response.t[i]);
                continue;
            }
        };
        let close = match Decimal::try_from(response.c[i]) {
            Ok(d) => d,
            Err(_) => {
                warn!("Invalid close price at index {}: {}", i, response.c[i]);
                continue;
            }
        };

        let mut quote = Quote::new(symbol, timestamp, close, "USD", PROVIDER_ID);
        quote.open = Decimal::try_from(response.o[i]).ok();
        quote.high = Decimal::try_from(response.h[i]).ok();
        quote.low = Decimal::try_from(response.l[i]).ok();
        quote.volume = response.v.get(i).and_then(|&v| Decimal::try_from(v).ok());
        quotes.push(quote);
    }

    quotes.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    Ok(quotes)
}

pub(crate) fn parse_earnings(body: &str) -> Result<Vec<EarningsEvent>, AcquisitionError> {
    let response: EarningsResponse = parse_json(PROVIDER_ID, body)?;

    let mut events: Vec<EarningsEvent> = response
        .earnings_calendar
        .into_iter()
        .filter_map(|item| {
            let date = NaiveDate::parse_from_str(&item.date, "%Y-%m-%d")
                .map_err(|_| warn!("Skipping earnings row with bad date '{}'", item.date))
                .ok()?;
            Some(EarningsEvent {
                symbol: item.symbol,
                date,
                eps_estimate: item.eps_estimate,
                eps_actual: item.eps_actual,
                revenue_estimate: item.revenue_estimate,
                hour: item.hour.filter(|h| !h.is_empty()),
            })
        })
        .collect();

    events.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.symbol.cmp(&b.symbol)));
    Ok(events)
}

// ============================================================================
// FinnhubProvider
// ============================================================================

/// Finnhub provider.
///
/// Free tier is limited to 60 API calls per minute.
pub struct FinnhubProvider {
    client: Client,
    api_key: Option<String>,
}

impl FinnhubProvider {
    /// Create a new Finnhub provider. Without a key the provider is disabled.
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: build_client(Duration::from_secs(10)),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }

    /// Make a GET request to the Finnhub API.
    async fn fetch(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<String, AcquisitionError> {
        let url = format!("{}{}", BASE_URL, endpoint);

        // API key as header rather than query param
        let request = self
            .client
            .get(&url)
            .header("X-Finnhub-Token", self.api_key.as_deref().unwrap_or_default())
            .query(params);

        send(&self.client, PROVIDER_ID, request)
            .await
            .map_err(|e| match e {
                // Finnhub answers 403 when the key's quota is exhausted
                AcquisitionError::ClientError {
                    status, message, ..
                } if status == StatusCode::FORBIDDEN.as_u16()
                    && message.to_lowercase().contains("limit") =>
                {
                    AcquisitionError::RateLimited {
                        provider: PROVIDER_ID.to_string(),
                        retry_after: None,
                    }
                }
                other => other,
            })
    }
}

#[async_trait]
impl ProviderAdapter for FinnhubProvider {
    fn id(&self) -> &'static str {
        PROVIDER_ID
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            kinds: &[
                DataRequestKind::Quote,
                DataRequestKind::Historical,
                DataRequestKind::EarningsCalendar,
            ],
        }
    }

    fn rate_limit(&self) -> RateLimit {
        RateLimit {
            min_interval: Duration::from_secs(1),
            requests_per_minute: Some(60), // Free tier limit
            daily_cap: None,
        }
    }

    fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, AcquisitionError> {
        let text = self.fetch("/quote", &[("symbol", symbol)]).await?;
        parse_quote(symbol, &text)
    }

    async fn fetch_historical(
        &self,
        symbol: &str,
        range: DateRange,
    ) -> Result<Vec<Quote>, AcquisitionError> {
        let from_ts = range
            .start
            .and_hms_opt(0, 0, 0)
            .map(|d| d.and_utc().timestamp())
            .unwrap_or_default()
            .to_string();
        let to_ts = range
            .end
            .and_hms_opt(23, 59, 59)
            .map(|d| d.and_utc().timestamp())
            .unwrap_or_default()
            .to_string();

        let params = [
            ("symbol", symbol),
            ("resolution", "D"), // Daily candles
            ("from", from_ts.as_str()),
            ("to", to_ts.as_str()),
        ];
        let text = self.fetch("/stock/candle", &params).await?;
        let quotes = parse_candles(symbol, &text)?;

        debug!(
            "Finnhub: fetched {} candles for {} ({} to {})",
            quotes.len(),
            symbol,
            range.start,
            range.end
        );
        Ok(quotes)
    }

    async fn fetch_earnings_calendar(
        &self,
        symbol: Option<&str>,
        range: DateRange,
    ) -> Result<Vec<EarningsEvent>, AcquisitionError> {
        let from = range.start.format("%Y-%m-%d").to_string();
        let to = range.end.format("%Y-%m-%d").to_string();
        let mut params = vec![("from", from.as_str()), ("to", to.as_str())];
        if let Some(symbol) = symbol {
            params.push(("symbol", symbol));
        }
        let text = self.fetch("/calendar/earnings", &params).await?;
        parse_earnings(&text)
    }
}
