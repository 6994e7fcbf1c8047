//! Financial Modeling Prep provider implementation.
//!
//! Endpoints used:
//! - /quote/{symbol} for latest quotes
//! - /earning_calendar for earnings dates
//! - /stock_dividend_calendar, or /historical-price-full/stock_dividend/{symbol}
//!   when a single symbol is requested
//!
//! The free tier allows 250 calls per day. FMP signals an exhausted quota
//! with HTTP 200 and an "Error Message" body, which is mapped to
//! `RateLimited` here.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::errors::AcquisitionError;
use crate::models::{DataRequestKind, DateRange, DividendEvent, EarningsEvent, Quote};
use crate::provider::http::{build_client, parse_json, send};
use crate::provider::{ProviderAdapter, ProviderCapabilities, RateLimit};

const BASE_URL: &str = "https://financialmodelingprep.com/api/v3";
const PROVIDER_ID: &str = "FMP";

// ============================================================================
// API Response Structures
// ============================================================================

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "Error Message")]
    error_message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteItem {
    symbol: String,
    price: Option<f64>,
    open: Option<f64>,
    day_high: Option<f64>,
    day_low: Option<f64>,
    volume: Option<f64>,
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EarningsItem {
    date: String,
    symbol: String,
    eps: Option<f64>,
    eps_estimated: Option<f64>,
    time: Option<String>,
    revenue_estimated: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DividendItem {
    date: String,
    symbol: Option<String>,
    dividend: Option<f64>,
    adj_dividend: Option<f64>,
    record_date: Option<String>,
    payment_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DividendHistory {
    symbol: Option<String>,
    #[serde(default)]
    historical: Vec<DividendItem>,
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

fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()
}

/// Detect the quota and key errors FMP reports inside a 200 body.
pub(crate) fn check_error_body(body: &str) -> Result<(), AcquisitionError> {
    let Ok(error) = serde_json::from_str::<ErrorBody>(body) else {
        return Ok(());
    };
    let message = error.error_message;
    if message.to_lowercase().contains("limit") {
        Err(AcquisitionError::RateLimited {
            provider: PROVIDER_ID.to_string(),
            retry_after: None,
        })
    } else {
        Err(AcquisitionError::ClientError {
            provider: PROVIDER_ID.to_string(),
            status: 401,
            message,
        })
    }
}

pub(crate) fn parse_quote(symbol: &str, body: &str) -> Result<Quote, AcquisitionError> {
    let items: Vec<QuoteItem> = parse_json(PROVIDER_ID, body)?;
    let item = items
        .into_iter()
        .find(|i| i.symbol.eq_ignore_ascii_case(symbol))
        .ok_or_else(|| unavailable(format!("No quote for {}", symbol)))?;

    let price = item
        .price
        .ok_or_else(|| unavailable(format!("No price for {}", symbol)))?;
    let close = Decimal::try_from(price)
        .map_err(|_| unavailable(format!("Invalid price: {}", price)))?;
    let timestamp = item
        .timestamp
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
        .unwrap_or_else(Utc::now);

    let mut quote = Quote::new(symbol, timestamp, close, "USD", PROVIDER_ID);
    quote.open = item.open.and_then(|v| Decimal::try_from(v).ok());
    quote.high = item.day_high.and_then(|v| Decimal::try_from(v).ok());
    quote.low = item.day_low.and_then(|v| Decimal::try_from(v).ok());
    quote.volume = item.volume.and_then(|v| Decimal::try_from(v).ok());
    Ok(quote)
}

pub(crate) fn parse_earnings(
    symbol: Option<&str>,
    body: &str,
) -> Result<Vec<EarningsEvent>, AcquisitionError> {
    let items: Vec<EarningsItem> = parse_json(PROVIDER_ID, body)?;

    let mut events: Vec<EarningsEvent> = items
        .into_iter()
        .filter(|i| symbol.map_or(true, |s| i.symbol.eq_ignore_ascii_case(s)))
        .filter_map(|i| {
            Some(EarningsEvent {
                date: parse_date(&i.date)?,
                symbol: i.symbol,
                eps_estimate: i.eps_estimated,
                eps_actual: i.eps,
                revenue_estimate: i.revenue_estimated,
                hour: i.time.filter(|t| !t.is_empty() && t != "--"),
            })
        })
        .collect();

    events.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.symbol.cmp(&b.symbol)));
    Ok(events)
}

fn to_dividend(item: DividendItem, fallback_symbol: Option<&str>) -> Option<DividendEvent> {
    let ex_date = parse_date(&item.date)?;
    let amount = item.dividend.or(item.adj_dividend)?;
    let amount = match Decimal::try_from(amount) {
        Ok(amount) => amount,
        Err(_) => {
            warn!("Skipping dividend with invalid amount {}", amount);
            return None;
        }
    };
    Some(DividendEvent {
        symbol: item.symbol.or_else(|| fallback_symbol.map(str::to_string))?,
        ex_date,
        amount,
        record_date: item.record_date.as_deref().and_then(parse_date),
        payment_date: item.payment_date.as_deref().and_then(parse_date),
    })
}

/// Calendar endpoint: a flat array across all symbols.
pub(crate) fn parse_dividend_calendar(body: &str) -> Result<Vec<DividendEvent>, AcquisitionError> {
    let items: Vec<DividendItem> = parse_json(PROVIDER_ID, body)?;
    let mut events: Vec<DividendEvent> = items
        .into_iter()
        .filter_map(|i| to_dividend(i, None))
        .collect();
    events.sort_by(|a, b| a.ex_date.cmp(&b.ex_date));
    Ok(events)
}

/// Per-symbol history, restricted to `range`.
pub(crate) fn parse_dividend_history(
    symbol: &str,
    range: DateRange,
    body: &str,
) -> Result<Vec<DividendEvent>, AcquisitionError> {
    // Symbols without dividends come back as `{}`
    let history: DividendHistory = parse_json(PROVIDER_ID, body)?;
    let owner = history.symbol.unwrap_or_else(|| symbol.to_uppercase());
    let mut events: Vec<DividendEvent> = history
        .historical
        .into_iter()
        .filter_map(|i| to_dividend(i, Some(&owner)))
        .filter(|e| e.ex_date >= range.start && e.ex_date <= range.end)
        .collect();
    events.sort_by(|a, b| a.ex_date.cmp(&b.ex_date));
    Ok(events)
}

// ============================================================================
// FmpProvider
// ============================================================================

/// Financial Modeling Prep provider.
pub struct FmpProvider {
    client: Client,
    api_key: Option<String>,
}

impl FmpProvider {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: build_client(Duration::from_secs(10)),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }

    async fn fetch(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<String, AcquisitionError> {
        let request = self
            .client
            .get(format!("{}{}", BASE_URL, endpoint))
            .query(params)
            .query(&[("apikey", self.api_key.as_deref().unwrap_or_default())]);
        let text = send(&self.client, PROVIDER_ID, request).await?;
        check_error_body(&text)?;
        Ok(text)
    }
}

#[async_trait]
impl ProviderAdapter for FmpProvider {
    fn id(&self) -> &'static str {
        PROVIDER_ID
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            kinds: &[
                DataRequestKind::Quote,
                DataRequestKind::EarningsCalendar,
                DataRequestKind::DividendCalendar,
            ],
        }
    }

    fn rate_limit(&self) -> RateLimit {
        RateLimit {
            min_interval: Duration::from_millis(250),
            requests_per_minute: None,
            daily_cap: Some(250), // Free tier limit
        }
    }

    fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, AcquisitionError> {
        let endpoint = format!("/quote/{}", urlencoding::encode(symbol));
        let text = self.fetch(&endpoint, &[]).await?;
        parse_quote(symbol, &text)
    }

    async fn fetch_earnings_calendar(
        &self,
        symbol: Option<&str>,
        range: DateRange,
    ) -> Result<Vec<EarningsEvent>, AcquisitionError> {
        let from = range.start.format("%Y-%m-%d").to_string();
        let to = range.end.format("%Y-%m-%d").to_string();
        let text = self
            .fetch(
                "/earning_calendar",
                &[("from", from.as_str()), ("to", to.as_str())],
            )
            .await?;
        parse_earnings(symbol, &text)
    }

    async fn fetch_dividend_calendar(
        &self,
        symbol: Option<&str>,
        range: DateRange,
    ) -> Result<Vec<DividendEvent>, AcquisitionError> {
        let events = match symbol {
            Some(symbol) => {
                let endpoint = format!(
                    "/historical-price-full/stock_dividend/{}",
                    urlencoding::encode(symbol)
                );
                let text = self.fetch(&endpoint, &[]).await?;
                parse_dividend_history(symbol, range, &text)?
            }
            None => {
                let from = range.start.format("%Y-%m-%d").to_string();
                let to = range.end.format("%Y-%m-%d").to_string();
                let text = self
                    .fetch(
                        "/stock_dividend_calendar",
                        &[("from", from.as_str()), ("to", to.as_str())],
                    )
                    .await?;
                parse_dividend_calendar(&text)?
            }
        };
        debug!("FMP: {} dividend events", events.len());
        Ok(events)
    }
}
