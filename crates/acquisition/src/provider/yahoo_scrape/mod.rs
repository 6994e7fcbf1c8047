//! Yahoo Finance quote page scraper.
//!
//! Last-resort quote source that needs no credentials. Prices are read from
//! the `<fin-streamer>` elements the quote page renders for live updates:
//!
//! ```html
//! <fin-streamer data-symbol="SPY" data-field="regularMarketPrice" data-value="512.34">512.34</fin-streamer>
//! ```
//!
//! The page layout is not an API; anything unexpected is `DataUnavailable`
//! so the orchestrator moves on without retrying.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use lazy_static::lazy_static;
use reqwest::Client;
use rust_decimal::Decimal;
use scraper::{Html, Selector};
use tracing::debug;

use crate::errors::AcquisitionError;
use crate::models::{DataRequestKind, Quote};
use crate::provider::http::send;
use crate::provider::{ProviderAdapter, ProviderCapabilities, RateLimit};

const BASE_URL: &str = "https://finance.yahoo.com/quote";
const PROVIDER_ID: &str = "YAHOO_SCRAPE";
const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

lazy_static! {
    static ref STREAMER_SELECTOR: Selector =
        Selector::parse("fin-streamer[data-field]").expect("Invalid selector");
}

/// Fields read from the page.
#[derive(Debug, Default, PartialEq)]
struct StreamerFields {
    price: Option<Decimal>,
    open: Option<Decimal>,
    high: Option<Decimal>,
    low: Option<Decimal>,
    volume: Option<Decimal>,
    time: Option<i64>,
}

fn parse_number(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() || cleaned == "--" {
        return None;
    }
    Decimal::from_str_exact(&cleaned)
        .ok()
        .or_else(|| cleaned.parse::<f64>().ok().and_then(|v| Decimal::try_from(v).ok()))
}

fn collect_fields(symbol: &str, document: &Html) -> StreamerFields {
    let mut fields = StreamerFields::default();
    for element in document.select(&STREAMER_SELECTOR) {
        let attrs = element.value();
        // The page also streams index and peer tickers
        if let Some(owner) = attrs.attr("data-symbol") {
            if !owner.eq_ignore_ascii_case(symbol) {
                continue;
            }
        }
        let raw = attrs
            .attr("data-value")
            .map(str::to_string)
            .unwrap_or_else(|| element.text().collect::<String>());
        match attrs.attr("data-field") {
            Some("regularMarketPrice") => fields.price = fields.price.or(parse_number(&raw)),
            Some("regularMarketOpen") => fields.open = fields.open.or(parse_number(&raw)),
            Some("regularMarketDayHigh") => fields.high = fields.high.or(parse_number(&raw)),
            Some("regularMarketDayLow") => fields.low = fields.low.or(parse_number(&raw)),
            Some("regularMarketVolume") => fields.volume = fields.volume.or(parse_number(&raw)),
            Some("regularMarketTime") => {
                fields.time = fields.time.or(raw.trim().parse::<i64>().ok())
            }
            _ => {}
        }
    }
    fields
}

pub(crate) fn parse_quote_page(symbol: &str, html: &str) -> Result<Quote, AcquisitionError> {
    let document = Html::parse_document(html);
    let fields = collect_fields(symbol, &document);

    let close = fields.price.ok_or_else(|| AcquisitionError::DataUnavailable {
        provider: PROVIDER_ID.to_string(),
        message: format!("No regularMarketPrice on quote page for {}", symbol),
    })?;
    let timestamp = fields
        .time
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
        .unwrap_or_else(Utc::now);

    let mut quote = Quote::new(symbol, timestamp, close, "USD", PROVIDER_ID);
    quote.open = fields.open;
    quote.high = fields.high;
    quote.low = fields.low;
    quote.volume = fields.volume;
    Ok(quote)
}

/// Yahoo quote page scraper.
pub struct YahooScrapeProvider {
    client: Client,
}

impl YahooScrapeProvider {
    pub fn new() -> Self {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }
}

impl Default for YahooScrapeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderAdapter for YahooScrapeProvider {
    fn id(&self) -> &'static str {
        PROVIDER_ID
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            kinds: &[DataRequestKind::Quote],
        }
    }

    fn rate_limit(&self) -> RateLimit {
        RateLimit {
            min_interval: Duration::from_secs(2),
            requests_per_minute: Some(20),
            daily_cap: Some(500),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(15)
    }

    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, AcquisitionError> {
        let url = format!("{}/{}/", BASE_URL, urlencoding::encode(symbol));
        let html = send(&self.client, PROVIDER_ID, self.client.get(&url)).await?;
        debug!("Yahoo scrape: {} bytes for {}", html.len(), symbol);
        parse_quote_page(symbol, &html)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const PAGE: &str = r#"
        <html><body>
          <fin-streamer data-symbol="^GSPC" data-field="regularMarketPrice" data-value="5127.79">5,127.79</fin-streamer>
          <section>
            <fin-streamer data-symbol="SPY" data-field="regularMarketPrice" data-value="512.34" active="">512.34</fin-streamer>
            <fin-streamer data-symbol="SPY" data-field="regularMarketChange" data-value="1.10">+1.10</fin-streamer>
            <fin-streamer data-symbol="SPY" data-field="regularMarketTime" data-value="1714766400">At close</fin-streamer>
            <fin-streamer data-symbol="SPY" data-field="regularMarketOpen">510.00</fin-streamer>
            <fin-streamer data-symbol="SPY" data-field="regularMarketVolume">61,234,567</fin-streamer>
          </section>
        </body></html>
    "#;

    #[test]
    fn test_parse_quote_page() {
        let quote = parse_quote_page("SPY", PAGE).unwrap();
        assert_eq!(quote.close, dec!(512.34));
        assert_eq!(quote.open, Some(dec!(510.00)));
        assert_eq!(quote.volume, Some(dec!(61234567)));
        assert_eq!(quote.timestamp.timestamp(), 1714766400);
        assert_eq!(quote.source, "YAHOO_SCRAPE");
    }

    #[test]
    fn test_other_symbols_ignored() {
        let err = parse_quote_page("QQQ", PAGE).unwrap_err();
        assert!(matches!(err, AcquisitionError::DataUnavailable { .. }));
    }

    #[test]
    fn test_consent_page_is_unavailable() {
        let html = "<html><body><form action=\"https://consent.yahoo.com\">Before you continue</form></body></html>";
        assert!(parse_quote_page("SPY", html).is_err());
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("1,234.50"), Some(dec!(1234.50)));
        assert_eq!(parse_number(" -- "), None);
        assert_eq!(parse_number("abc"), None);
    }
}
