//! Tradier brokerage market data provider.
//!
//! Endpoints used:
//! - /markets/quotes for latest quotes
//! - /markets/history for daily bars
//! - /markets/options/expirations and /markets/options/chains (with greeks)
//!
//! Tradier collapses single-element arrays into a bare object and reports
//! "nothing" as `null`, so every list goes through [`OneOrMany`].
//! API documentation: https://documentation.tradier.com/brokerage-api

use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

use crate::errors::AcquisitionError;
use crate::models::{
    DataRequestKind, DateRange, Greeks, OptionChain, OptionContract, OptionQuote, OptionType,
    Quote,
};
use crate::provider::http::{build_client, parse_json, send};
use crate::provider::{ProviderAdapter, ProviderCapabilities, RateLimit};

const BASE_URL: &str = "https://api.tradier.com/v1";
const PROVIDER_ID: &str = "TRADIER";

// ============================================================================
// API Response Structures
// ============================================================================

/// A field that may be a single object, an array or absent.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Self::Many(items) => items,
            Self::One(item) => vec![item],
        }
    }
}

fn flatten<T>(value: Option<OneOrMany<T>>) -> Vec<T> {
    value.map(OneOrMany::into_vec).unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct QuotesEnvelope {
    quotes: Option<QuotesBody>,
}

#[derive(Debug, Deserialize)]
struct QuotesBody {
    quote: Option<OneOrMany<QuoteItem>>,
}

#[derive(Debug, Deserialize)]
struct QuoteItem {
    symbol: String,
    last: Option<f64>,
    bid: Option<f64>,
    ask: Option<f64>,
    open: Option<f64>,
    high: Option<f64>,
    low: Option<f64>,
    prevclose: Option<f64>,
    volume: Option<f64>,
    /// Milliseconds since epoch
    trade_date: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct HistoryEnvelope {
    history: Option<HistoryBody>,
}

#[derive(Debug, Deserialize)]
struct HistoryBody {
    day: Option<OneOrMany<HistoryDay>>,
}

#[derive(Debug, Deserialize)]
struct HistoryDay {
    date: String,
    open: Option<f64>,
    high: Option<f64>,
    low: Option<f64>,
    close: f64,
    volume: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ExpirationsEnvelope {
    expirations: Option<ExpirationsBody>,
}

#[derive(Debug, Deserialize)]
struct ExpirationsBody {
    date: Option<OneOrMany<String>>,
}

#[derive(Debug, Deserialize)]
struct ChainEnvelope {
    options: Option<ChainBody>,
}

#[derive(Debug, Deserialize)]
struct ChainBody {
    option: Option<OneOrMany<ChainItem>>,
}

#[derive(Debug, Deserialize)]
struct ChainItem {
    strike: f64,
    option_type: String,
    expiration_date: String,
    bid: Option<f64>,
    ask: Option<f64>,
    last: Option<f64>,
    volume: Option<u64>,
    open_interest: Option<u64>,
    greeks: Option<GreeksItem>,
}

#[derive(Debug, Deserialize)]
struct GreeksItem {
    delta: Option<f64>,
    gamma: Option<f64>,
    theta: Option<f64>,
    vega: Option<f64>,
    rho: Option<f64>,
    mid_iv: Option<f64>,
    smv_vol: Option<f64>,
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

fn decimal(value: Option<f64>) -> Option<Decimal> {
    value.and_then(|v| Decimal::try_from(v).ok())
}

pub(crate) fn parse_quote(symbol: &str, body: &str) -> Result<Quote, AcquisitionError> {
    let envelope: QuotesEnvelope = parse_json(PROVIDER_ID, body)?;
    let item = envelope
        .quotes
        .map(|q| flatten(q.quote))
        .unwrap_or_default()
        .into_iter()
        .find(|q| q.symbol.eq_ignore_ascii_case(symbol))
        .ok_or_else(|| unavailable(format!("Unmatched symbol: {}", symbol)))?;

    // Before the first trade of the day `last` is null; fall back to the
    // previous close
    let close = item
        .last
        .or(item.prevclose)
        .ok_or_else(|| unavailable(format!("No price for {}", symbol)))?;
    let close = Decimal::try_from(close)
        .map_err(|_| unavailable(format!("Invalid price: {}", close)))?;

    let timestamp = item
        .trade_date
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);

    let mut quote = Quote::new(symbol, timestamp, close, "USD", PROVIDER_ID);
    quote.bid = decimal(item.bid);
    quote.ask = decimal(item.ask);
    quote.open = decimal(item.open);
    quote.high = decimal(item.high);
    quote.low = decimal(item.low);
    quote.volume = decimal(item.volume);
    Ok(quote)
}

pub(crate) fn parse_history(symbol: &str, body: &str) -> Result<Vec<Quote>, AcquisitionError> {
    let envelope: HistoryEnvelope = parse_json(PROVIDER_ID, body)?;
    let days = envelope.history.map(|h| flatten(h.day)).unwrap_or_default();

    let mut quotes = Vec::with_capacity(days.len());
    for day in days {
        let Some(timestamp) = NaiveDate::parse_from_str(&day.date, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|d| d.and_utc())
        else {
            continue;
        };
        let Ok(close) = Decimal::try_from(day.close) else {
            continue;
        };
        let mut quote = Quote::new(symbol, timestamp, close, "USD", PROVIDER_ID);
        quote.open = decimal(day.open);
        quote.high = decimal(day.high);
        quote.low = decimal(day.low);
        quote.volume = decimal(day.volume);
        quotes.push(quote);
    }

    if quotes.is_empty() {
        return Err(unavailable(format!("No history for {}", symbol)));
    }
    quotes.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    Ok(quotes)
}

pub(crate) fn parse_expirations(body: &str) -> Result<Vec<NaiveDate>, AcquisitionError> {
    let envelope: ExpirationsEnvelope = parse_json(PROVIDER_ID, body)?;
    let mut dates: Vec<NaiveDate> = envelope
        .expirations
        .map(|e| flatten(e.date))
        .unwrap_or_default()
        .iter()
        .filter_map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        .collect();
    dates.sort();
    Ok(dates)
}

fn parse_greeks(item: &GreeksItem) -> Option<Greeks> {
    Some(Greeks {
        delta: item.delta?,
        gamma: item.gamma.unwrap_or_default(),
        theta: item.theta.unwrap_or_default(),
        vega: item.vega.unwrap_or_default(),
        rho: item.rho.unwrap_or_default(),
        implied_volatility: item.mid_iv.or(item.smv_vol).filter(|iv| *iv > 0.0),
    })
}

pub(crate) fn parse_chain(
    symbol: &str,
    expiry: Option<NaiveDate>,
    body: &str,
) -> Result<OptionChain, AcquisitionError> {
    let envelope: ChainEnvelope = parse_json(PROVIDER_ID, body)?;
    let items = envelope.options.map(|o| flatten(o.option)).unwrap_or_default();

    let contracts = items
        .into_iter()
        .filter_map(|item| {
            let option_type = match item.option_type.as_str() {
                "call" => OptionType::Call,
                "put" => OptionType::Put,
                _ => return None,
            };
            let expiration = NaiveDate::parse_from_str(&item.expiration_date, "%Y-%m-%d").ok()?;
            let mut quote = OptionQuote::new(OptionContract::new(
                symbol.to_uppercase(),
                item.strike,
                expiration,
                option_type,
            ));
            quote.bid = item.bid;
            quote.ask = item.ask;
            quote.last = item.last;
            quote.volume = item.volume;
            quote.open_interest = item.open_interest;
            quote.greeks = item.greeks.as_ref().and_then(parse_greeks);
            Some(quote)
        })
        .collect();

    Ok(OptionChain {
        underlying: symbol.to_uppercase(),
        expiry,
        contracts,
    })
}

// ============================================================================
// TradierProvider
// ============================================================================

/// Tradier provider. Requires a bearer token.
pub struct TradierProvider {
    client: Client,
    token: Option<String>,
    base_url: String,
}

impl TradierProvider {
    pub fn new(token: Option<String>) -> Self {
        Self {
            client: build_client(Duration::from_secs(10)),
            token: token.filter(|t| !t.trim().is_empty()),
            base_url: BASE_URL.to_string(),
        }
    }

    /// Point at the sandbox or a proxy.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn fetch(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<String, AcquisitionError> {
        let request = self
            .client
            .get(format!("{}{}", self.base_url, endpoint))
            .bearer_auth(self.token.as_deref().unwrap_or_default())
            .header(reqwest::header::ACCEPT, "application/json")
            .query(params);
        send(&self.client, PROVIDER_ID, request).await
    }

    /// Nearest listed expiry on or after today.
    async fn nearest_expiry(&self, symbol: &str) -> Result<NaiveDate, AcquisitionError> {
        let text = self
            .fetch("/markets/options/expirations", &[("symbol", symbol)])
            .await?;
        let today = Utc::now().date_naive();
        parse_expirations(&text)?
            .into_iter()
            .find(|d| *d >= today)
            .ok_or_else(|| unavailable(format!("No listed expirations for {}", symbol)))
    }
}

#[async_trait]
impl ProviderAdapter for TradierProvider {
    fn id(&self) -> &'static str {
        PROVIDER_ID
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            kinds: &[
                DataRequestKind::Quote,
                DataRequestKind::Historical,
                DataRequestKind::OptionChain,
                DataRequestKind::OptionGreeks,
                DataRequestKind::ImpliedVolatility,
            ],
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
        self.token.is_some()
    }

    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, AcquisitionError> {
        let text = self
            .fetch("/markets/quotes", &[("symbols", symbol), ("greeks", "false")])
            .await?;
        parse_quote(symbol, &text)
    }

    async fn fetch_historical(
        &self,
        symbol: &str,
        range: DateRange,
    ) -> Result<Vec<Quote>, AcquisitionError> {
        let start = range.start.format("%Y-%m-%d").to_string();
        let end = range.end.format("%Y-%m-%d").to_string();
        let text = self
            .fetch(
                "/markets/history",
                &[
                    ("symbol", symbol),
                    ("interval", "daily"),
                    ("start", start.as_str()),
                    ("end", end.as_str()),
                ],
            )
            .await?;
        parse_history(symbol, &text)
    }

    async fn fetch_option_chain(
        &self,
        symbol: &str,
        expiry: Option<NaiveDate>,
    ) -> Result<OptionChain, AcquisitionError> {
        let expiry = match expiry {
            Some(expiry) => expiry,
            None => self.nearest_expiry(symbol).await?,
        };
        let expiration = expiry.format("%Y-%m-%d").to_string();
        let text = self
            .fetch(
                "/markets/options/chains",
                &[
                    ("symbol", symbol),
                    ("expiration", expiration.as_str()),
                    ("greeks", "true"),
                ],
            )
            .await?;
        let chain = parse_chain(symbol, Some(expiry), &text)?;
        debug!(
            "Tradier: {} contracts for {} expiring {}",
            chain.contracts.len(),
            symbol,
            expiry
        );
        Ok(chain)
    }

    async fn fetch_greeks(&self, contract: &OptionContract) -> Result<Greeks, AcquisitionError> {
        let chain = self
            .fetch_option_chain(&contract.underlying, Some(contract.expiry))
            .await?;
        chain
            .find(contract)
            .and_then(|q| q.greeks.clone())
            .ok_or_else(|| unavailable(format!("No greeks for {}", contract.occ_symbol())))
    }
}
