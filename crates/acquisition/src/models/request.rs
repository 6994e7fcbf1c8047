use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::options::OptionContract;

/// Logical data type requested from the acquisition layer.
///
/// Selects the provider priority list and the cache TTL.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataRequestKind {
    Quote,
    Historical,
    OptionChain,
    OptionGreeks,
    EarningsCalendar,
    DividendCalendar,
    RiskFreeRate,
    ImpliedVolatility,
    HistoricalVolatility,
}

impl DataRequestKind {
    pub const ALL: [DataRequestKind; 9] = [
        Self::Quote,
        Self::Historical,
        Self::OptionChain,
        Self::OptionGreeks,
        Self::EarningsCalendar,
        Self::DividendCalendar,
        Self::RiskFreeRate,
        Self::ImpliedVolatility,
        Self::HistoricalVolatility,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quote => "quote",
            Self::Historical => "historical",
            Self::OptionChain => "option_chain",
            Self::OptionGreeks => "option_greeks",
            Self::EarningsCalendar => "earnings_calendar",
            Self::DividendCalendar => "dividend_calendar",
            Self::RiskFreeRate => "risk_free_rate",
            Self::ImpliedVolatility => "implied_volatility",
            Self::HistoricalVolatility => "historical_volatility",
        }
    }

    /// Kinds whose value is derived from caller-supplied numbers rather than
    /// looked up, so the numbers are part of the cache key.
    pub fn is_computed(&self) -> bool {
        matches!(self, Self::ImpliedVolatility | Self::HistoricalVolatility)
    }

    /// Kinds the computation bridge can produce from [`ComputationInputs`].
    pub fn accepts_inputs(&self) -> bool {
        self.is_computed() || matches!(self, Self::OptionGreeks)
    }
}

impl fmt::Display for DataRequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive date range.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }
}

/// Explicit numeric inputs for the computation bridge.
///
/// Every field is optional; the orchestrator fills gaps from data it already
/// acquired (spot from a quote, rate from the risk-free series) before
/// deciding whether self-calculation is possible.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputationInputs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spot: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volatility: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_free_rate: Option<f64>,
    /// Years; derived from the contract expiry when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_expiry: Option<f64>,
    /// Observed option price, for implied volatility
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_price: Option<f64>,
    /// Closing prices oldest first, for historical volatility
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closes: Option<Vec<f64>>,
}

impl ComputationInputs {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Whether these inputs alone fix the computed value for `kind`, with no
    /// gap filled from previously observed data.
    pub fn determines(&self, kind: DataRequestKind) -> bool {
        match kind {
            DataRequestKind::OptionGreeks => {
                self.spot.is_some() && self.volatility.is_some() && self.risk_free_rate.is_some()
            }
            DataRequestKind::ImpliedVolatility => {
                self.spot.is_some() && self.market_price.is_some() && self.risk_free_rate.is_some()
            }
            DataRequestKind::HistoricalVolatility => {
                self.closes.as_ref().is_some_and(|c| !c.is_empty())
            }
            _ => false,
        }
    }

    fn key_fragment(&self) -> String {
        let num = |v: Option<f64>| v.map(|x| format!("{x}")).unwrap_or_default();
        let closes = self
            .closes
            .as_ref()
            .map(|c| {
                c.iter()
                    .map(|x| format!("{x}"))
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .unwrap_or_default();
        format!(
            "s={};v={};r={};t={};p={};c={}",
            num(self.spot),
            num(self.volatility),
            num(self.risk_free_rate),
            num(self.time_to_expiry),
            num(self.market_price),
            closes
        )
    }
}

/// A single request for one logical datum.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataRequest {
    pub kind: DataRequestKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<OptionContract>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<DateRange>,
    /// Expiry filter for option chains
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<NaiveDate>,
    #[serde(default)]
    pub inputs: ComputationInputs,
}

impl DataRequest {
    fn empty(kind: DataRequestKind) -> Self {
        Self {
            kind,
            symbol: None,
            contract: None,
            range: None,
            expiry: None,
            inputs: ComputationInputs::default(),
        }
    }

    pub fn quote(symbol: impl Into<String>) -> Self {
        Self {
            symbol: Some(symbol.into()),
            ..Self::empty(DataRequestKind::Quote)
        }
    }

    pub fn historical(symbol: impl Into<String>, range: DateRange) -> Self {
        Self {
            symbol: Some(symbol.into()),
            range: Some(range),
            ..Self::empty(DataRequestKind::Historical)
        }
    }

    pub fn option_chain(symbol: impl Into<String>, expiry: Option<NaiveDate>) -> Self {
        Self {
            symbol: Some(symbol.into()),
            expiry,
            ..Self::empty(DataRequestKind::OptionChain)
        }
    }

    pub fn option_greeks(contract: OptionContract) -> Self {
        Self {
            symbol: Some(contract.underlying.clone()),
            contract: Some(contract),
            ..Self::empty(DataRequestKind::OptionGreeks)
        }
    }

    pub fn earnings_calendar(symbol: Option<String>, range: DateRange) -> Self {
        Self {
            symbol,
            range: Some(range),
            ..Self::empty(DataRequestKind::EarningsCalendar)
        }
    }

    pub fn dividend_calendar(symbol: Option<String>, range: DateRange) -> Self {
        Self {
            symbol,
            range: Some(range),
            ..Self::empty(DataRequestKind::DividendCalendar)
        }
    }

    pub fn risk_free_rate() -> Self {
        Self::empty(DataRequestKind::RiskFreeRate)
    }

    pub fn implied_volatility(contract: OptionContract) -> Self {
        Self {
            symbol: Some(contract.underlying.clone()),
            contract: Some(contract),
            ..Self::empty(DataRequestKind::ImpliedVolatility)
        }
    }

    pub fn historical_volatility(symbol: impl Into<String>, range: DateRange) -> Self {
        Self {
            symbol: Some(symbol.into()),
            range: Some(range),
            ..Self::empty(DataRequestKind::HistoricalVolatility)
        }
    }

    pub fn with_inputs(mut self, inputs: ComputationInputs) -> Self {
        self.inputs = inputs;
        self
    }

    /// Symbol or an empty string, for adapters that require one.
    pub fn symbol_str(&self) -> &str {
        self.symbol.as_deref().unwrap_or_default()
    }

    /// Stable cache key for `(kind, params)`.
    pub fn cache_key(&self) -> String {
        let mut parts: Vec<String> = vec![self.kind.as_str().to_string()];

        if let Some(symbol) = &self.symbol {
            parts.push(symbol.to_uppercase());
        }
        if let Some(contract) = &self.contract {
            parts.push(contract.occ_symbol());
        }
        if let Some(range) = &self.range {
            parts.push(format!("{}..{}", range.start, range.end));
        }
        if let Some(expiry) = &self.expiry {
            parts.push(format!("exp={expiry}"));
        }
        if self.kind.is_computed() || (self.kind.accepts_inputs() && !self.inputs.is_empty()) {
            parts.push(self.inputs.key_fragment());
        }

        parts.join("|")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OptionType;

    fn contract() -> OptionContract {
        OptionContract::new(
            "SPY",
            450.0,
            NaiveDate::from_ymd_opt(2024, 1, 19).unwrap(),
            OptionType::Call,
        )
    }

    #[test]
    fn test_cache_key_is_stable_and_case_insensitive() {
        assert_eq!(DataRequest::quote("spy").cache_key(), "quote|SPY");
        assert_eq!(
            DataRequest::quote("spy").cache_key(),
            DataRequest::quote("SPY").cache_key()
        );
        assert_eq!(
            DataRequest::option_greeks(contract()).cache_key(),
            "option_greeks|SPY|SPY240119C00450000"
        );
    }

    #[test]
    fn test_cache_key_distinguishes_kinds_and_params() {
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
        );
        let hist = DataRequest::historical("SPY", range);
        let hv = DataRequest::historical_volatility("SPY", range);
        assert_ne!(hist.cache_key(), hv.cache_key());
        assert_eq!(hist.cache_key(), "historical|SPY|2024-01-01..2024-02-01");
    }

    #[test]
    fn test_inputs_key_only_kinds_that_use_them() {
        let inputs = ComputationInputs {
            market_price: Some(5.0),
            ..Default::default()
        };
        let quote_a = DataRequest::quote("SPY");
        let quote_b = DataRequest::quote("SPY").with_inputs(inputs.clone());
        assert_eq!(quote_a.cache_key(), quote_b.cache_key());

        let iv_a = DataRequest::implied_volatility(contract());
        let iv_b = DataRequest::implied_volatility(contract()).with_inputs(inputs);
        assert_ne!(iv_a.cache_key(), iv_b.cache_key());
    }

    #[test]
    fn test_greeks_key_varies_with_inputs() {
        let with_vol = |v: f64| {
            DataRequest::option_greeks(contract()).with_inputs(ComputationInputs {
                spot: Some(470.0),
                volatility: Some(v),
                risk_free_rate: Some(0.05),
                ..Default::default()
            })
        };
        let plain = DataRequest::option_greeks(contract());

        assert_ne!(with_vol(0.15).cache_key(), with_vol(0.60).cache_key());
        assert_eq!(with_vol(0.15).cache_key(), with_vol(0.15).cache_key());
        assert_ne!(plain.cache_key(), with_vol(0.15).cache_key());
        assert!(!plain.cache_key().contains("s="));
    }

    #[test]
    fn test_inputs_determine_kind() {
        let full = ComputationInputs {
            spot: Some(470.0),
            volatility: Some(0.2),
            risk_free_rate: Some(0.05),
            ..Default::default()
        };
        assert!(full.determines(DataRequestKind::OptionGreeks));
        assert!(!full.determines(DataRequestKind::ImpliedVolatility));

        let no_rate = ComputationInputs {
            risk_free_rate: None,
            ..full.clone()
        };
        assert!(!no_rate.determines(DataRequestKind::OptionGreeks));
        assert!(ComputationInputs::default().is_empty());
        assert!(!full.is_empty());
    }

    #[test]
    fn test_kind_serde_snake_case() {
        let json = serde_json::to_string(&DataRequestKind::RiskFreeRate).unwrap();
        assert_eq!(json, "\"risk_free_rate\"");

        let request: DataRequest =
            serde_json::from_str(r#"{"kind":"quote","symbol":"AAPL"}"#).unwrap();
        assert_eq!(request, DataRequest::quote("AAPL"));
    }
}
