use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Market data quote.
///
/// Used both for the latest quote and for each bar of a historical series.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    /// Symbol as requested by the caller
    pub symbol: String,

    /// Timestamp of the quote (bar open for historical series)
    pub timestamp: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid: Option<Decimal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask: Option<Decimal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub open: Option<Decimal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub high: Option<Decimal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub low: Option<Decimal>,

    /// Last traded or closing price (required)
    pub close: Decimal,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<Decimal>,

    /// Quote currency
    pub currency: String,

    /// Provider that produced the quote (TRADIER, FINNHUB, etc.)
    pub source: String,
}

impl Quote {
    /// Create a new quote with minimal required fields
    pub fn new(
        symbol: impl Into<String>,
        timestamp: DateTime<Utc>,
        close: Decimal,
        currency: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp,
            bid: None,
            ask: None,
            open: None,
            high: None,
            low: None,
            close,
            volume: None,
            currency: currency.into(),
            source: source.into(),
        }
    }

    /// Attach OHLCV fields to a quote.
    pub fn with_ohlcv(
        mut self,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        volume: Option<Decimal>,
    ) -> Self {
        self.open = Some(open);
        self.high = Some(high);
        self.low = Some(low);
        self.volume = volume;
        self
    }

    /// Midpoint of bid and ask when both sides are quoted, else the close.
    pub fn mid(&self) -> Decimal {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) if bid > Decimal::ZERO && ask >= bid => {
                (bid + ask) / Decimal::TWO
            }
            _ => self.close,
        }
    }
}
